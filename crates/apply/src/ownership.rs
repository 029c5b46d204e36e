//! Ownership marker, applied-state annotation and reserved finalizers.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use orka_core::{annotations_of, Gvk, LabelSelector, ObjectKey, ObjectSetError};
use serde_json::{Map, Value as Json};
use sha2::{Digest, Sha256};

use crate::error::{ApplyError, PatchError};

pub const PREFIX: &str = "objectset.orka.dev/";
pub const ANN_ID: &str = "objectset.orka.dev/id";
pub const ANN_OWNER_GVK: &str = "objectset.orka.dev/owner-gvk";
pub const ANN_OWNER_NAME: &str = "objectset.orka.dev/owner-name";
pub const ANN_OWNER_NAMESPACE: &str = "objectset.orka.dev/owner-namespace";
pub const LABEL_HASH: &str = "objectset.orka.dev/hash";
pub const ANN_APPLIED: &str = "objectset.orka.dev/applied";
pub const ANN_PRUNE: &str = "objectset.orka.dev/prune";
pub const FINALIZER_PREFIX: &str = "finalizer.orka.dev/";

/// Applied values at or above this size are stored gzip+base64.
pub const COMPRESS_THRESHOLD: usize = 1024;
const GZIP_B64_MAGIC: &str = "H4sI";

const MARKER_KEYS: [&str; 4] = [ANN_ID, ANN_OWNER_GVK, ANN_OWNER_NAME, ANN_OWNER_NAMESPACE];

/// The record on whose behalf a set is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub gvk: Gvk,
    pub key: ObjectKey,
    pub uid: Option<String>,
}

impl Owner {
    pub fn new(gvk: Gvk, key: ObjectKey) -> Self { Self { gvk, key, uid: None } }

    pub fn of(obj: &Json) -> Result<Self, ObjectSetError> {
        let gvk = Gvk::of(obj)?;
        let key = ObjectKey::of(obj)?;
        let uid = obj.pointer("/metadata/uid").and_then(|v| v.as_str()).map(str::to_string);
        Ok(Self { gvk, key, uid })
    }

    /// The owner recorded in a managed record's marker annotations.
    pub fn recorded_on(obj: &Json) -> Option<Self> {
        let anns = annotations_of(obj);
        let (api_version, kind) = anns.get(ANN_OWNER_GVK)?.split_once(", Kind=")?;
        let name = anns.get(ANN_OWNER_NAME).filter(|n| !n.is_empty())?;
        let ns = anns.get(ANN_OWNER_NAMESPACE).map(String::as_str);
        Some(Self::new(Gvk::from_api_version(api_version, kind), ObjectKey::new(ns, name.clone())))
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    /// Owner references are only valid from cluster-scoped owners or within the owner's namespace.
    pub fn can_reference(&self, namespace: Option<&str>) -> bool {
        match self.key.namespace() {
            None => true,
            Some(ns) => namespace == Some(ns),
        }
    }

    pub fn reference(&self, controller: bool, block_owner_deletion: bool) -> Option<Json> {
        let uid = self.uid.as_deref()?;
        Some(serde_json::json!({
            "apiVersion": self.gvk.api_version(),
            "kind": self.gvk.kind,
            "name": self.key.name,
            "uid": uid,
            "controller": controller,
            "blockOwnerDeletion": block_owner_deletion,
        }))
    }
}

/// Annotations and hash label identifying the records of one set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipMarker {
    annotations: BTreeMap<String, String>,
    hash: String,
}

impl OwnershipMarker {
    pub fn new(set_id: &str, owner: Option<&Owner>) -> Result<Self, ApplyError> {
        if set_id.is_empty() && owner.is_none() {
            return Err(ApplyError::Ownership("a set id or an owner is required".into()));
        }
        let mut annotations = BTreeMap::new();
        annotations.insert(ANN_ID.to_string(), set_id.to_string());
        if let Some(owner) = owner {
            annotations.insert(ANN_OWNER_GVK.to_string(), owner.gvk.to_string());
            annotations.insert(ANN_OWNER_NAME.to_string(), owner.key.name.clone());
            annotations.insert(ANN_OWNER_NAMESPACE.to_string(), owner.key.namespace().unwrap_or_default().to_string());
        }
        let mut hasher = Sha256::new();
        for key in MARKER_KEYS {
            if let Some(v) = annotations.get(key) {
                hasher.update(v.as_bytes());
            }
            hasher.update([0u8]);
        }
        // label values are capped at 63 characters
        let hash = hex::encode(&hasher.finalize()[..20]);
        Ok(Self { annotations, hash })
    }

    pub fn hash(&self) -> &str { &self.hash }
    pub fn annotations(&self) -> &BTreeMap<String, String> { &self.annotations }

    pub fn selector(&self) -> LabelSelector {
        LabelSelector::from_labels([(LABEL_HASH, self.hash.as_str())])
    }

    /// Hash collisions are ruled out by comparing the marker annotations exactly.
    pub fn matches(&self, obj: &Json) -> bool {
        let actual = annotations_of(obj);
        MARKER_KEYS.iter().all(|k| actual.get(*k) == self.annotations.get(*k))
    }

    pub fn stamp(&self, obj: &mut Json) {
        if let Some(labels) = metadata_map(obj, "labels") {
            labels.insert(LABEL_HASH.to_string(), Json::String(self.hash.clone()));
        }
        if let Some(anns) = metadata_map(obj, "annotations") {
            for (k, v) in &self.annotations {
                anns.insert(k.clone(), Json::String(v.clone()));
            }
        }
    }
}

/// `metadata.<field>` as a mutable map, created when missing.
pub(crate) fn metadata_map<'a>(obj: &'a mut Json, field: &str) -> Option<&'a mut Map<String, Json>> {
    let meta = obj.as_object_mut()?.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
    let slot = meta.as_object_mut()?.entry(field).or_insert_with(|| Json::Object(Map::new()));
    if !slot.is_object() {
        *slot = Json::Object(Map::new());
    }
    slot.as_object_mut()
}

/// Attach an owner reference, replacing any previous reference with the same uid.
pub fn set_owner_reference(obj: &mut Json, reference: Json) {
    let Some(meta) = obj.as_object_mut().and_then(|o| o.entry("metadata").or_insert_with(|| Json::Object(Map::new())).as_object_mut()) else {
        return;
    };
    let refs = meta.entry("ownerReferences").or_insert_with(|| Json::Array(Vec::new()));
    if !refs.is_array() {
        *refs = Json::Array(Vec::new());
    }
    if let Some(list) = refs.as_array_mut() {
        list.retain(|r| r.get("uid") != reference.get("uid"));
        list.push(reference);
    }
}

/// The desired record as remembered for the next three-way diff.
pub fn applied_snapshot(obj: &Json) -> Json {
    let mut out = Map::new();
    let Some(src) = obj.as_object() else { return Json::Object(out) };
    for (k, v) in src {
        match k.as_str() {
            "status" => {}
            "metadata" => {
                let mut meta = Map::new();
                if let Some(m) = v.as_object() {
                    for field in ["name", "namespace", "labels", "annotations", "ownerReferences"] {
                        if let Some(fv) = m.get(field) {
                            meta.insert(field.to_string(), fv.clone());
                        }
                    }
                }
                if let Some(Json::Object(anns)) = meta.get_mut("annotations") {
                    anns.remove(ANN_APPLIED);
                    if anns.is_empty() {
                        meta.remove("annotations");
                    }
                }
                out.insert(k.clone(), Json::Object(meta));
            }
            _ => {
                out.insert(k.clone(), v.clone());
            }
        }
    }
    Json::Object(out)
}

pub fn encode_applied(snapshot: &Json) -> Result<String, PatchError> {
    let raw = serde_json::to_string(snapshot).map_err(|e| PatchError::malformed("applied state", e.to_string()))?;
    if raw.len() < COMPRESS_THRESHOLD {
        return Ok(raw);
    }
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(raw.as_bytes())
        .and_then(|_| enc.finish())
        .map(|gz| B64.encode(gz))
        .map_err(|e| PatchError::malformed("applied state", e.to_string()))
}

pub fn decode_applied(value: &str) -> Result<Json, PatchError> {
    let text = if value.starts_with(GZIP_B64_MAGIC) {
        let gz = B64.decode(value).map_err(|e| PatchError::malformed("applied annotation", e.to_string()))?;
        let mut out = String::new();
        GzDecoder::new(gz.as_slice())
            .read_to_string(&mut out)
            .map_err(|e| PatchError::malformed("applied annotation", e.to_string()))?;
        out
    } else {
        value.to_string()
    };
    serde_json::from_str(&text).map_err(|e| PatchError::malformed("applied annotation", e.to_string()))
}

/// Record the snapshot of `obj` in its own applied annotation.
pub fn set_applied(obj: &mut Json) -> Result<(), PatchError> {
    let encoded = encode_applied(&applied_snapshot(obj))?;
    if let Some(anns) = metadata_map(obj, "annotations") {
        anns.insert(ANN_APPLIED.to_string(), Json::String(encoded));
    }
    Ok(())
}

/// The previously applied state stored on a live record, if any.
pub fn original_of(live: &Json) -> Result<Option<Json>, PatchError> {
    match live.pointer("/metadata/annotations").and_then(|a| a.get(ANN_APPLIED)).and_then(|v| v.as_str()) {
        Some(s) if !s.is_empty() => decode_applied(s).map(Some),
        _ => Ok(None),
    }
}

/// Records annotated `prune: "false"` are never deleted by pruning.
pub fn prune_disabled(obj: &Json) -> bool {
    annotations_of(obj).get(ANN_PRUNE).map(|v| v == "false").unwrap_or(false)
}

pub fn remove_handler_finalizer(name: &str) -> String {
    format!("{}{}", FINALIZER_PREFIX, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn marker_requires_id_or_owner() {
        assert!(matches!(OwnershipMarker::new("", None), Err(ApplyError::Ownership(_))));
        let owner = Owner::new(Gvk::new("apps", "v1", "Deployment"), ObjectKey::new(Some("ns"), "web"));
        let m = OwnershipMarker::new("", Some(&owner)).unwrap();
        assert_eq!(m.annotations()[ANN_OWNER_GVK], "apps/v1, Kind=Deployment");
        assert_eq!(m.hash().len(), 40);
        let mut obj = json!({"metadata": {"name": "x"}});
        m.stamp(&mut obj);
        assert_eq!(Owner::recorded_on(&obj), Some(owner));
    }

    #[test]
    fn hash_is_stable_and_owner_sensitive() {
        let a = OwnershipMarker::new("set", None).unwrap();
        let b = OwnershipMarker::new("set", None).unwrap();
        assert_eq!(a.hash(), b.hash());
        let owner = Owner::new(Gvk::new("", "v1", "Namespace"), ObjectKey::new(None, "team"));
        let c = OwnershipMarker::new("set", Some(&owner)).unwrap();
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn stamp_then_match() {
        let m = OwnershipMarker::new("set", None).unwrap();
        let mut obj = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "x"}});
        assert!(!m.selector().matches_object(&obj));
        m.stamp(&mut obj);
        assert!(m.selector().matches_object(&obj));
        assert!(m.matches(&obj));
        assert_eq!(Owner::recorded_on(&obj), None);
        obj["metadata"]["annotations"][ANN_ID] = json!("other");
        assert!(!m.matches(&obj));
    }

    #[test]
    fn snapshot_drops_status_and_server_metadata() {
        let obj = json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "x", "resourceVersion": "9", "uid": "u",
                         "annotations": {ANN_APPLIED: "old"}},
            "data": {"k": "v"}, "status": {"x": 1}
        });
        assert_eq!(applied_snapshot(&obj), json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "x"}, "data": {"k": "v"}}));
    }

    #[test]
    fn large_applied_state_is_compressed() {
        let big = "v".repeat(2 * COMPRESS_THRESHOLD);
        let mut obj = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "x"}, "data": {"k": big}});
        set_applied(&mut obj).unwrap();
        let stored = obj["metadata"]["annotations"][ANN_APPLIED].as_str().unwrap().to_string();
        assert!(stored.starts_with("H4sI"));
        assert!(stored.len() < COMPRESS_THRESHOLD);
        let original = original_of(&obj).unwrap().unwrap();
        assert_eq!(original["data"]["k"].as_str().map(str::len), Some(2 * COMPRESS_THRESHOLD));

        let mut small = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "x"}});
        set_applied(&mut small).unwrap();
        assert!(small["metadata"]["annotations"][ANN_APPLIED].as_str().unwrap().starts_with('{'));
    }

    #[test]
    fn garbage_annotation_is_malformed() {
        let live = json!({"metadata": {"annotations": {ANN_APPLIED: "H4sI!!"}}});
        assert!(original_of(&live).is_err());
        assert_eq!(original_of(&json!({"metadata": {}})).unwrap(), None);
    }

    #[test]
    fn owner_reference_scope_and_opt_out() {
        let owner = Owner::new(Gvk::new("", "v1", "ConfigMap"), ObjectKey::new(Some("a"), "o")).with_uid("u1");
        assert!(owner.can_reference(Some("a")));
        assert!(!owner.can_reference(Some("b")));
        let mut obj = json!({"metadata": {"name": "x", "ownerReferences": [{"uid": "u1", "name": "stale"}]}});
        set_owner_reference(&mut obj, owner.reference(true, false).unwrap());
        assert_eq!(obj["metadata"]["ownerReferences"].as_array().map(Vec::len), Some(1));
        assert_eq!(obj["metadata"]["ownerReferences"][0]["name"], "o");
        assert!(prune_disabled(&json!({"metadata": {"annotations": {ANN_PRUNE: "false"}}})));
        assert_eq!(remove_handler_finalizer("cleanup"), "finalizer.orka.dev/cleanup");
    }
}
