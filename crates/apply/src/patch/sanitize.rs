//! Patch clean-up before sending.

use serde_json::{Map, Value as Json};

use super::merge::as_object;
use super::strategic::{DELETE_FROM_PRIMITIVE_LIST, DIRECTIVE_PATCH, DIRECTIVE_RETAIN_KEYS, SET_ELEMENT_ORDER};
use crate::error::PatchError;
use crate::ownership::PREFIX;

/// Drop server-owned fields from a patch. With `strip_bookkeeping`, also drop every
/// annotation under the engine's reserved prefix.
pub fn sanitize_patch(patch: &Json, strip_bookkeeping: bool) -> Result<Json, PatchError> {
    let mut data = as_object(patch, "patch")?.clone();
    data.remove("kind");
    data.remove("apiVersion");
    data.remove("status");
    let mut drop_meta = false;
    if let Some(Json::Object(meta)) = data.get_mut("metadata") {
        meta.remove("creationTimestamp");
        if strip_bookkeeping {
            let mut drop_anns = false;
            if let Some(Json::Object(anns)) = meta.get_mut("annotations") {
                anns.retain(|k, _| !k.starts_with(PREFIX));
                drop_anns = anns.is_empty();
            }
            if drop_anns {
                meta.remove("annotations");
            }
        }
        drop_meta = meta.is_empty();
    }
    if drop_meta {
        data.remove("metadata");
    }
    Ok(Json::Object(data))
}

/// Retain list of dotted field paths; a path is kept when it or an ancestor is listed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplacingFields(Vec<String>);

impl ReplacingFields {
    pub fn new(paths: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(paths.into_iter().map(Into::into).collect())
    }

    pub fn covers(&self, path: &str) -> bool {
        self.0.iter().any(|r| {
            path == r || (path.len() > r.len() && path.starts_with(r.as_str()) && path.as_bytes()[r.len()] == b'.')
        })
    }

    pub fn paths(&self) -> &[String] { &self.0 }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() { key.to_string() } else { format!("{}.{}", path, key) }
}

/// Drop deletion intents not covered by `retain`, then prune what that leaves hollow.
pub fn retain_deletions(patch: &mut Json, retain: &ReplacingFields) {
    if let Json::Object(map) = patch {
        prune_map(map, "", retain);
    }
}

fn prune_map(map: &mut Map<String, Json>, path: &str, retain: &ReplacingFields) {
    let keys: Vec<String> = map.keys().cloned().collect();
    let mut hollowed_lists: Vec<String> = Vec::new();
    for key in keys {
        if key == DIRECTIVE_RETAIN_KEYS {
            if !retain.covers(path) {
                map.remove(&key);
            }
            continue;
        }
        if let Some(field) = key.strip_prefix(DELETE_FROM_PRIMITIVE_LIST) {
            if !retain.covers(&join(path, field)) {
                map.remove(&key);
            }
            continue;
        }
        if key.starts_with('$') {
            continue;
        }
        let child_path = join(path, &key);
        let remove = match map.get_mut(&key) {
            Some(Json::Null) => !retain.covers(&child_path),
            Some(Json::Object(child)) => {
                let before = child.len();
                prune_map(child, &child_path, retain);
                before > 0 && child.is_empty()
            }
            Some(Json::Array(items)) => {
                let before = items.len();
                prune_list(items, &child_path, retain);
                let hollow = before > 0 && items.is_empty();
                if hollow {
                    hollowed_lists.push(key.clone());
                }
                hollow
            }
            _ => false,
        };
        if remove {
            map.remove(&key);
        }
    }
    for field in hollowed_lists {
        map.remove(&format!("{}{}", SET_ELEMENT_ORDER, field));
    }
}

fn prune_list(items: &mut Vec<Json>, path: &str, retain: &ReplacingFields) {
    items.retain_mut(|item| {
        let Json::Object(elem) = item else { return true };
        if elem.get(DIRECTIVE_PATCH).and_then(|v| v.as_str()) == Some("delete") {
            return retain.covers(path);
        }
        let before = elem.len();
        prune_map(elem, path, retain);
        // an element cut down to its merge key alone carries nothing
        !(elem.len() < before && elem.len() <= 1)
    });
}
