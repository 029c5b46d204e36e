//! In-memory cluster for exercising the apply engine end to end.
//!
//! Strategic patches are applied as plain merge patches with directives
//! stripped, which is exact for the map-only records these tests use.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use orka_core::{ClientError, GroupKind, Gvk, LabelSelector, ObjectKey, PatchDoc, PatchType, ResourceClient};
use serde_json::{json, Value as Json};

const CLUSTER_SCOPED: &[&str] = &["Namespace", "CustomResourceDefinition", "ClusterRole", "ClusterRoleBinding"];

#[derive(Default)]
struct State {
    objects: BTreeMap<(GroupKind, ObjectKey), Json>,
    writes: Vec<String>,
    patches: Vec<PatchDoc>,
    rv: u64,
    fail_list: BTreeSet<String>,
    stale: BTreeSet<String>,
    vanish: BTreeSet<String>,
    establish_crds: bool,
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

pub fn cm(ns: &str, name: &str, data: Json) -> Json {
    json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "namespace": ns}, "data": data})
}

pub fn secret(ns: &str, name: &str) -> Json {
    json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": name, "namespace": ns}, "data": {"k": "dg=="}})
}

pub fn cm_gvk() -> Gvk { Gvk::new("", "v1", "ConfigMap") }

fn strip_directives(v: &Json) -> Json {
    match v {
        Json::Object(map) => Json::Object(
            map.iter().filter(|(k, _)| !k.starts_with('$')).map(|(k, v)| (k.clone(), strip_directives(v))).collect(),
        ),
        Json::Array(items) => Json::Array(items.iter().map(strip_directives).collect()),
        other => other.clone(),
    }
}

impl FakeCluster {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    /// Mark CRDs established as soon as they are written.
    pub fn establishing_crds() -> Arc<Self> {
        let c = Self::default();
        c.state.lock().unwrap().establish_crds = true;
        Arc::new(c)
    }

    fn stamp(st: &mut State, obj: &mut Json, uid: Option<Json>) {
        st.rv += 1;
        let meta = obj["metadata"].as_object_mut().unwrap();
        meta.insert("resourceVersion".into(), json!(st.rv.to_string()));
        meta.insert("uid".into(), uid.unwrap_or_else(|| json!(format!("uid-{}", st.rv))));
        if st.establish_crds && obj["kind"] == "CustomResourceDefinition" {
            obj["status"] = json!({
                "acceptedNames": obj["spec"]["names"].clone(),
                "storedVersions": ["v1"],
                "conditions": [{"type": "Established", "status": "True", "lastTransitionTime": "2024-01-01T00:00:00Z"}]
            });
        }
    }

    /// Insert a record directly, bypassing the write log.
    pub fn seed(&self, mut obj: Json) {
        let gk = Gvk::of(&obj).unwrap().group_kind();
        let key = ObjectKey::of(&obj).unwrap();
        let mut st = self.state.lock().unwrap();
        Self::stamp(&mut st, &mut obj, None);
        st.objects.insert((gk, key), obj);
    }

    pub fn record(&self, kind: &str, ns: Option<&str>, name: &str) -> Option<Json> {
        let key = ObjectKey::new(ns, name);
        let st = self.state.lock().unwrap();
        st.objects.iter().find(|((gk, k), _)| gk.kind == kind && *k == key).map(|(_, v)| v.clone())
    }

    /// Change a live record out of band.
    pub fn edit(&self, kind: &str, ns: Option<&str>, name: &str, f: impl FnOnce(&mut Json)) {
        let key = ObjectKey::new(ns, name);
        let mut st = self.state.lock().unwrap();
        if let Some((_, v)) = st.objects.iter_mut().find(|((gk, k), _)| gk.kind == kind && *k == key) {
            f(v);
        }
    }

    pub fn remove(&self, kind: &str, ns: Option<&str>, name: &str) {
        let key = ObjectKey::new(ns, name);
        self.state.lock().unwrap().objects.retain(|(gk, k), _| !(gk.kind == kind && *k == key));
    }

    pub fn count(&self, kind: &str) -> usize {
        self.state.lock().unwrap().objects.keys().filter(|(gk, _)| gk.kind == kind).count()
    }

    pub fn writes(&self) -> Vec<String> { self.state.lock().unwrap().writes.clone() }

    pub fn take_writes(&self) -> Vec<String> { std::mem::take(&mut self.state.lock().unwrap().writes) }

    /// Patch documents received, exactly as sent.
    pub fn take_patches(&self) -> Vec<PatchDoc> { std::mem::take(&mut self.state.lock().unwrap().patches) }

    /// Listing in `ns` fails with a transport error.
    pub fn fail_list_in(&self, ns: &str) { self.state.lock().unwrap().fail_list.insert(ns.to_string()); }

    /// The next get of `name` misses even when it exists.
    pub fn stale_get(&self, name: &str) { self.state.lock().unwrap().stale.insert(name.to_string()); }

    /// Deleting `name` reports NotFound, as if someone else got there first.
    pub fn vanish_on_delete(&self, name: &str) { self.state.lock().unwrap().vanish.insert(name.to_string()); }
}

#[async_trait]
impl ResourceClient for FakeCluster {
    async fn is_namespaced(&self, gvk: &Gvk) -> Result<bool, ClientError> {
        if gvk.kind == "Unknown" {
            return Err(ClientError::UnknownType(gvk.key()));
        }
        Ok(!CLUSTER_SCOPED.contains(&gvk.kind.as_str()))
    }

    async fn get(&self, gvk: &Gvk, key: &ObjectKey) -> Result<Option<Json>, ClientError> {
        let mut st = self.state.lock().unwrap();
        if st.stale.remove(&key.name) {
            return Ok(None);
        }
        Ok(st.objects.get(&(gvk.group_kind(), key.clone())).cloned())
    }

    async fn list(&self, gvk: &Gvk, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<Json>, ClientError> {
        let st = self.state.lock().unwrap();
        if let Some(ns) = namespace.filter(|ns| st.fail_list.contains(*ns)) {
            return Err(ClientError::Transport(format!("listing {} failed", ns)));
        }
        let gk = gvk.group_kind();
        Ok(st
            .objects
            .iter()
            .filter(|((g, k), _)| *g == gk && namespace.map(|ns| k.namespace() == Some(ns)).unwrap_or(true))
            .filter(|(_, v)| selector.matches_object(v))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn create(&self, gvk: &Gvk, obj: &Json) -> Result<Json, ClientError> {
        let key = ObjectKey::of(obj).map_err(|e| ClientError::Transport(e.to_string()))?;
        let mut st = self.state.lock().unwrap();
        let id = (gvk.group_kind(), key.clone());
        if st.objects.contains_key(&id) {
            return Err(ClientError::AlreadyExists(key.to_string()));
        }
        let mut obj = obj.clone();
        Self::stamp(&mut st, &mut obj, None);
        st.writes.push(format!("create {} {}", gvk.kind, key));
        st.objects.insert(id, obj.clone());
        Ok(obj)
    }

    async fn update(&self, gvk: &Gvk, obj: &Json) -> Result<Json, ClientError> {
        let key = ObjectKey::of(obj).map_err(|e| ClientError::Transport(e.to_string()))?;
        let mut st = self.state.lock().unwrap();
        let id = (gvk.group_kind(), key.clone());
        let Some(live) = st.objects.get(&id) else { return Err(ClientError::NotFound(key.to_string())) };
        let live_rv = live.pointer("/metadata/resourceVersion").cloned();
        let uid = live.pointer("/metadata/uid").cloned();
        if let Some(rv) = obj.pointer("/metadata/resourceVersion") {
            if Some(rv) != live_rv.as_ref() {
                return Err(ClientError::Conflict(key.to_string()));
            }
        }
        let mut obj = obj.clone();
        Self::stamp(&mut st, &mut obj, uid);
        st.writes.push(format!("update {} {}", gvk.kind, key));
        st.objects.insert(id, obj.clone());
        Ok(obj)
    }

    async fn patch(&self, gvk: &Gvk, key: &ObjectKey, patch: &PatchDoc) -> Result<Json, ClientError> {
        let mut st = self.state.lock().unwrap();
        st.patches.push(patch.clone());
        let id = (gvk.group_kind(), key.clone());
        let Some(mut obj) = st.objects.get(&id).cloned() else { return Err(ClientError::NotFound(key.to_string())) };
        let body = match patch.patch_type {
            PatchType::JsonMerge => patch.body.clone(),
            PatchType::StrategicMerge => strip_directives(&patch.body),
        };
        json_patch::merge(&mut obj, &body);
        let uid = obj.pointer("/metadata/uid").cloned();
        Self::stamp(&mut st, &mut obj, uid);
        st.writes.push(format!("patch {} {}", gvk.kind, key));
        st.objects.insert(id, obj.clone());
        Ok(obj)
    }

    async fn delete(&self, gvk: &Gvk, key: &ObjectKey) -> Result<(), ClientError> {
        let mut st = self.state.lock().unwrap();
        let removed = st.objects.remove(&(gvk.group_kind(), key.clone()));
        if st.vanish.contains(&key.name) {
            return Err(ClientError::NotFound(key.to_string()));
        }
        match removed {
            Some(_) => {
                st.writes.push(format!("delete {} {}", gvk.kind, key));
                Ok(())
            }
            None => Err(ClientError::NotFound(key.to_string())),
        }
    }
}
