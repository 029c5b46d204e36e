//! Strategic merge patch generation driven by a [`MergeSchema`].
//!
//! Lists whose field merges by key are diffed element-wise; the resulting patch
//! carries the server-side directives (`$patch: delete`, `$setElementOrder/…`,
//! `$retainKeys`, `$deleteFromPrimitiveList/…`). Fields without merge metadata
//! behave as in a JSON merge patch.

use serde_json::{json, Map, Value as Json};

use super::merge::{as_object, null_leaves};
use super::schema::{FieldMeta, MergeSchema};
use crate::error::PatchError;

pub const DIRECTIVE_PATCH: &str = "$patch";
pub const DIRECTIVE_RETAIN_KEYS: &str = "$retainKeys";
pub const SET_ELEMENT_ORDER: &str = "$setElementOrder/";
pub const DELETE_FROM_PRIMITIVE_LIST: &str = "$deleteFromPrimitiveList/";

#[derive(Debug, Clone, Copy, Default)]
pub struct DiffOptions {
    pub ignore_deletions: bool,
    pub ignore_changes_and_additions: bool,
    pub set_element_order: bool,
    /// Removed maps become nulls on each leaf instead of one null on the map.
    pub leaf_deletions: bool,
}

/// Patch turning `original` into `modified`.
pub fn two_way(original: &Json, modified: &Json, schema: Option<&MergeSchema>) -> Result<Json, PatchError> {
    let o = as_object(original, "original")?;
    let m = as_object(modified, "modified")?;
    let opts = DiffOptions { set_element_order: true, ..Default::default() };
    Ok(Json::Object(diff_maps(o, m, schema, opts, false)?))
}

/// Changes from `current`→`modified` plus the deletions `original`→`modified` implies.
pub fn three_way(original: &Json, modified: &Json, current: &Json, schema: Option<&MergeSchema>) -> Result<Json, PatchError> {
    let o = as_object(original, "original")?;
    let m = as_object(modified, "modified")?;
    let c = as_object(current, "current")?;
    let delta = diff_maps(c, m, schema, DiffOptions { ignore_deletions: true, set_element_order: true, ..Default::default() }, false)?;
    let deletions = diff_maps(
        o,
        m,
        schema,
        DiffOptions { ignore_changes_and_additions: true, set_element_order: true, leaf_deletions: true, ..Default::default() },
        false,
    )?;
    Ok(Json::Object(merge_patches(deletions, delta, schema)))
}

pub fn diff_maps(
    original: &Map<String, Json>,
    modified: &Map<String, Json>,
    schema: Option<&MergeSchema>,
    opts: DiffOptions,
    retain_keys: bool,
) -> Result<Map<String, Json>, PatchError> {
    let mut patch = Map::new();
    let mut retained: Vec<String> = Vec::new();
    for (key, mv) in modified {
        if retain_keys && !mv.is_null() && !key.starts_with('$') {
            retained.push(key.clone());
        }
        let meta = schema.and_then(|s| s.lookup(key));
        let Some(ov) = original.get(key) else {
            if !opts.ignore_changes_and_additions {
                patch.insert(key.clone(), mv.clone());
            }
            continue;
        };
        match (ov, mv) {
            (Json::Object(oo), Json::Object(mo)) => {
                let child = meta.and_then(|m| m.schema.as_deref());
                let sub = diff_maps(oo, mo, child, opts, meta.map(|m| m.retain_keys).unwrap_or(false))?;
                if !sub.is_empty() {
                    patch.insert(key.clone(), Json::Object(sub));
                }
            }
            (Json::Array(oa), Json::Array(ma)) if meta.map(|m| m.is_keyed_merge()).unwrap_or(false) => {
                if let Some(meta) = meta {
                    diff_keyed_list(key, oa, ma, meta, opts, &mut patch)?;
                }
            }
            (Json::Array(oa), Json::Array(ma)) if meta.map(|m| m.is_primitive_merge()).unwrap_or(false) => {
                diff_primitive_list(key, oa, ma, opts, &mut patch);
            }
            _ => {
                if ov != mv && !opts.ignore_changes_and_additions {
                    patch.insert(key.clone(), mv.clone());
                }
            }
        }
    }
    if !opts.ignore_deletions {
        for (key, ov) in original {
            if !modified.contains_key(key) {
                let v = if opts.leaf_deletions { null_leaves(ov) } else { Json::Null };
                patch.insert(key.clone(), v);
            }
        }
    }
    if retain_keys && (!patch.is_empty() || has_additional_new_field(original, modified)) {
        retained.sort();
        patch.insert(DIRECTIVE_RETAIN_KEYS.to_string(), Json::Array(retained.into_iter().map(Json::String).collect()));
    }
    Ok(patch)
}

/// Whether `original` holds a non-null key `modified` lacks.
fn has_additional_new_field(original: &Map<String, Json>, modified: &Map<String, Json>) -> bool {
    original.iter().any(|(k, v)| !v.is_null() && !modified.contains_key(k))
}

/// Sort key for a merge key value.
fn merge_value_key(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn index_by_key<'a>(field: &str, list: &'a [Json], merge_key: &str) -> Result<Vec<(String, &'a Map<String, Json>)>, PatchError> {
    list.iter()
        .map(|item| {
            let obj = item
                .as_object()
                .ok_or_else(|| PatchError::malformed("merge list", format!("{}: element is not an object", field)))?;
            let k = obj
                .get(merge_key)
                .ok_or_else(|| PatchError::malformed("merge list", format!("{}: element without merge key {}", field, merge_key)))?;
            Ok((merge_value_key(k), obj))
        })
        .collect()
}

fn diff_keyed_list(
    field: &str,
    original: &[Json],
    modified: &[Json],
    meta: &FieldMeta,
    opts: DiffOptions,
    patch: &mut Map<String, Json>,
) -> Result<(), PatchError> {
    let merge_key = meta.merge_key.as_deref().unwrap_or_default();
    let elem_schema = meta.schema.as_deref();
    let olist = index_by_key(field, original, merge_key)?;
    let mlist = index_by_key(field, modified, merge_key)?;

    let mut out: Vec<(String, Json)> = Vec::new();
    for (k, me) in &mlist {
        match olist.iter().find(|(ok, _)| ok == k) {
            Some((_, oe)) => {
                let mut sub = diff_maps(oe, me, elem_schema, opts, meta.retain_keys)?;
                if !sub.is_empty() {
                    if let Some(kv) = me.get(merge_key) {
                        sub.insert(merge_key.to_string(), kv.clone());
                    }
                    out.push((k.clone(), Json::Object(sub)));
                }
            }
            None if !opts.ignore_changes_and_additions => out.push((k.clone(), Json::Object((*me).clone()))),
            None => {}
        }
    }
    if !opts.ignore_deletions {
        for (k, oe) in &olist {
            if !mlist.iter().any(|(mk, _)| mk == k) {
                let kv = oe.get(merge_key).cloned().unwrap_or(Json::Null);
                out.push((k.clone(), json!({ merge_key: kv, DIRECTIVE_PATCH: "delete" })));
            }
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));

    let reordered = !opts.ignore_changes_and_additions && {
        let common_o: Vec<&String> = olist.iter().map(|(k, _)| k).filter(|k| mlist.iter().any(|(mk, _)| mk == *k)).collect();
        let common_m: Vec<&String> = mlist.iter().map(|(k, _)| k).filter(|k| olist.iter().any(|(ok, _)| ok == *k)).collect();
        common_o != common_m
    };
    if opts.set_element_order && (!out.is_empty() || reordered) {
        let order = mlist
            .iter()
            .map(|(_, me)| json!({ merge_key: me.get(merge_key).cloned().unwrap_or(Json::Null) }))
            .collect();
        patch.insert(format!("{}{}", SET_ELEMENT_ORDER, field), Json::Array(order));
    }
    if !out.is_empty() {
        patch.insert(field.to_string(), Json::Array(out.into_iter().map(|(_, v)| v).collect()));
    }
    Ok(())
}

fn diff_primitive_list(field: &str, original: &[Json], modified: &[Json], opts: DiffOptions, patch: &mut Map<String, Json>) {
    let added: Vec<Json> = modified.iter().filter(|v| !original.contains(v)).cloned().collect();
    let removed: Vec<Json> = original.iter().filter(|v| !modified.contains(v)).cloned().collect();
    let reordered = {
        let common_o: Vec<&Json> = original.iter().filter(|v| modified.contains(v)).collect();
        let common_m: Vec<&Json> = modified.iter().filter(|v| original.contains(v)).collect();
        common_o != common_m
    };
    let add = !opts.ignore_changes_and_additions && !added.is_empty();
    let delete = !opts.ignore_deletions && !removed.is_empty();
    if opts.set_element_order && (add || delete || (reordered && !opts.ignore_changes_and_additions)) {
        patch.insert(format!("{}{}", SET_ELEMENT_ORDER, field), Json::Array(modified.to_vec()));
    }
    if add {
        patch.insert(field.to_string(), Json::Array(added));
    }
    if delete {
        patch.insert(format!("{}{}", DELETE_FROM_PRIMITIVE_LIST, field), Json::Array(removed));
    }
}

/// Union of two strategic patches; `overlay` wins on conflicting scalars.
pub fn merge_patches(mut base: Map<String, Json>, overlay: Map<String, Json>, schema: Option<&MergeSchema>) -> Map<String, Json> {
    for (key, ov) in overlay {
        let meta = if key.starts_with('$') { None } else { schema.and_then(|s| s.lookup(&key)) };
        let merged = match (base.remove(&key), ov) {
            (Some(Json::Object(b)), Json::Object(o)) if !key.starts_with('$') => {
                Json::Object(merge_patches(b, o, meta.and_then(|m| m.schema.as_deref())))
            }
            (Some(Json::Array(b)), Json::Array(o)) if meta.map(|m| m.is_keyed_merge()).unwrap_or(false) => {
                match meta {
                    Some(meta) => Json::Array(merge_keyed_lists(b, o, meta)),
                    None => Json::Array(o),
                }
            }
            (_, ov) => ov,
        };
        base.insert(key, merged);
    }
    base
}

fn merge_keyed_lists(mut base: Vec<Json>, overlay: Vec<Json>, meta: &FieldMeta) -> Vec<Json> {
    let merge_key = meta.merge_key.as_deref().unwrap_or_default();
    for item in overlay {
        let k = item.get(merge_key).map(merge_value_key);
        let pos = base.iter().position(|b| b.get(merge_key).map(merge_value_key) == k);
        match (pos, item) {
            (Some(i), Json::Object(o)) => {
                let merged = match base.remove(i) {
                    Json::Object(b) => Json::Object(merge_patches(b, o, meta.schema.as_deref())),
                    _ => Json::Object(o),
                };
                base.insert(i, merged);
            }
            (_, item) => base.push(item),
        }
    }
    base.sort_by_key(|v| v.get(merge_key).map(merge_value_key).unwrap_or_default());
    base
}
