//! RFC 7386 JSON merge patch generation.

use serde_json::{Map, Value as Json};

use crate::error::PatchError;

pub(crate) fn as_object<'a>(v: &'a Json, what: &'static str) -> Result<&'a Map<String, Json>, PatchError> {
    v.as_object().ok_or_else(|| PatchError::malformed(what, "expected a JSON object"))
}

/// Two-way patch turning `original` into `modified`: changed keys set, missing keys nulled, arrays replaced.
pub fn create_merge_patch(original: &Json, modified: &Json) -> Result<Json, PatchError> {
    let o = as_object(original, "original")?;
    let m = as_object(modified, "modified")?;
    Ok(Json::Object(diff(o, m)))
}

fn diff(a: &Map<String, Json>, b: &Map<String, Json>) -> Map<String, Json> {
    let mut into = Map::new();
    for (key, bv) in b {
        match (a.get(key), bv) {
            (None, _) => {
                into.insert(key.clone(), bv.clone());
            }
            (Some(Json::Object(ao)), Json::Object(bo)) => {
                let sub = diff(ao, bo);
                if !sub.is_empty() {
                    into.insert(key.clone(), Json::Object(sub));
                }
            }
            (Some(av), _) => {
                if av != bv {
                    into.insert(key.clone(), bv.clone());
                }
            }
        }
    }
    for key in a.keys() {
        if !b.contains_key(key) {
            into.insert(key.clone(), Json::Null);
        }
    }
    into
}

/// Three-way patch: additions and changes from `current`→`modified`, deletions only for
/// what `original` had and `modified` dropped. Out-of-band fields on `current` survive.
pub fn create_three_way_merge_patch(original: &Json, modified: &Json, current: &Json) -> Result<Json, PatchError> {
    let o = as_object(original, "original")?;
    let m = as_object(modified, "modified")?;
    let c = as_object(current, "current")?;
    let mut changes = diff(c, m);
    drop_nulls(&mut changes);
    let deletions = owned_deletions(o, m);
    Ok(Json::Object(merge_into(deletions, changes)))
}

/// Remove deletion intents, keeping explicitly empty objects as values.
fn drop_nulls(patch: &mut Map<String, Json>) {
    patch.retain(|_, v| match v {
        Json::Null => false,
        Json::Object(sub) => {
            let was_empty = sub.is_empty();
            drop_nulls(sub);
            was_empty || !sub.is_empty()
        }
        _ => true,
    });
}

/// Nulls for every leaf `original` held that `modified` no longer has.
pub(crate) fn owned_deletions(original: &Map<String, Json>, modified: &Map<String, Json>) -> Map<String, Json> {
    let mut out = Map::new();
    for (key, ov) in original {
        match (ov, modified.get(key)) {
            (_, None) => {
                out.insert(key.clone(), null_leaves(ov));
            }
            (Json::Object(oo), Some(Json::Object(mo))) => {
                let sub = owned_deletions(oo, mo);
                if !sub.is_empty() {
                    out.insert(key.clone(), Json::Object(sub));
                }
            }
            _ => {}
        }
    }
    out
}

pub(crate) fn null_leaves(v: &Json) -> Json {
    match v {
        Json::Object(m) if !m.is_empty() => Json::Object(m.iter().map(|(k, v)| (k.clone(), null_leaves(v))).collect()),
        _ => Json::Null,
    }
}

/// Apply a null-free patch on top of `base`, recursing into objects.
fn merge_into(mut base: Map<String, Json>, patch: Map<String, Json>) -> Map<String, Json> {
    for (key, pv) in patch {
        let merged = match (base.remove(&key), pv) {
            (Some(Json::Object(b)), Json::Object(p)) => Json::Object(merge_into(b, p)),
            (_, pv) => pv,
        };
        base.insert(key, merged);
    }
    base
}

/// Layer a static patch onto a computed one: objects merge, nulls are kept, other values replace.
pub fn layer(base: &mut Json, overlay: &Json) {
    match (base, overlay) {
        (Json::Object(b), Json::Object(o)) => {
            for (key, ov) in o {
                let nested = ov.is_object() && b.get(key).map(Json::is_object).unwrap_or(false);
                match b.get_mut(key) {
                    Some(bv) if nested => layer(bv, ov),
                    _ => {
                        b.insert(key.clone(), ov.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}
