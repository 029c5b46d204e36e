//! Multi-document YAML/JSON manifests → [`ObjectSet`].

use std::path::{Path, PathBuf};

use orka_core::ObjectSet;
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest too large (>{limit} bytes)")]
    TooLarge { limit: usize },
    #[error("document #{doc} too complex (>{limit} nodes)")]
    TooComplex { doc: usize, limit: usize },
    #[error("document #{doc}: {reason}")]
    Parse { doc: usize, reason: String },
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub fn max_yaml_bytes() -> usize {
    std::env::var("ORKA_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1 << 20)
}

pub fn max_yaml_nodes() -> usize {
    std::env::var("ORKA_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur > max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => map.values().for_each(|vv| walk(vv, cur, max)),
            Json::Array(arr) => arr.iter().for_each(|vv| walk(vv, cur, max)),
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count > max
}

/// `kind: List` (and any `*List` with `items`) expands to its items.
fn flatten_lists(v: Json, out: &mut Vec<Json>) {
    let is_list = v.get("kind").and_then(|k| k.as_str()).map(|k| k.ends_with("List")).unwrap_or(false)
        && v.get("items").map(Json::is_array).unwrap_or(false);
    if !is_list {
        out.push(v);
        return;
    }
    if let Json::Object(mut map) = v {
        if let Some(Json::Array(items)) = map.remove("items") {
            for item in items {
                flatten_lists(item, out);
            }
        }
    }
}

/// Parse every document of `text`; empty documents are skipped.
pub fn parse_documents(text: &str) -> Result<Vec<Json>, ManifestError> {
    let limit = max_yaml_bytes();
    if text.len() > limit {
        return Err(ManifestError::TooLarge { limit });
    }
    let nodes = max_yaml_nodes();
    let mut out = Vec::new();
    for (doc, de) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = serde_yaml::Value::deserialize(de).map_err(|e| ManifestError::Parse { doc, reason: e.to_string() })?;
        if value.is_null() {
            continue;
        }
        let json = serde_json::to_value(value).map_err(|e| ManifestError::Parse { doc, reason: e.to_string() })?;
        if json_node_budget_exceeded(&json, nodes) {
            return Err(ManifestError::TooComplex { doc, limit: nodes });
        }
        flatten_lists(json, &mut out);
    }
    Ok(out)
}

/// Malformed records land in the set's errors rather than failing the load.
pub fn load_str(text: &str) -> Result<ObjectSet, ManifestError> {
    Ok(ObjectSet::from_values(parse_documents(text)?))
}

/// Load a file, or every `*.yaml`/`*.yml`/`*.json` file of a directory in name order.
pub fn load_path(path: &Path) -> Result<ObjectSet, ManifestError> {
    let io = |source| ManifestError::Io { path: path.to_path_buf(), source };
    let files: Vec<PathBuf> = if path.is_dir() {
        let mut files: Vec<PathBuf> = std::fs::read_dir(path)
            .map_err(io)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("yaml" | "yml" | "json")))
            .collect();
        files.sort();
        files
    } else {
        vec![path.to_path_buf()]
    };
    let mut docs = Vec::new();
    for file in &files {
        let text = std::fs::read_to_string(file).map_err(|source| ManifestError::Io { path: file.clone(), source })?;
        docs.extend(parse_documents(&text)?);
    }
    debug!(path = %path.display(), files = files.len(), records = docs.len(), "loaded manifests");
    Ok(ObjectSet::from_values(docs))
}
