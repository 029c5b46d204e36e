//! Ordered, deduplicated collection of desired records.

use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value as Json;

use crate::{Gvk, GroupKind, ObjectKey, PatchKey};

/// Why a record could not be placed in an [`ObjectSet`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectSetError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record missing {0}")]
    MissingField(&'static str),
    #[error("invalid gvk key: {0} (expect v1/Kind or group/v1/Kind)")]
    InvalidGvkKey(String),
    #[error("serializing record: {0}")]
    Serialize(String),
    #[error("record #{index}: {reason}")]
    Record { index: usize, reason: Box<ObjectSetError> },
    #[error("{} malformed record(s): {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<ObjectSetError>),
}

fn join_errors(errs: &[ObjectSetError]) -> String {
    errs.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

/// Records grouped by type then key, both in first-insertion order.
///
/// Adding a record whose type and key are already present replaces the stored
/// content and keeps the original position.
#[derive(Debug, Clone, Default)]
pub struct ObjectSet {
    objects: FxHashMap<Gvk, FxHashMap<ObjectKey, Json>>,
    order: Vec<Gvk>,
    key_order: FxHashMap<Gvk, Vec<ObjectKey>>,
    errs: Vec<ObjectSetError>,
    offered: usize,
}

impl ObjectSet {
    pub fn new() -> Self { Self::default() }

    pub fn from_values(values: impl IntoIterator<Item = Json>) -> Self {
        let mut set = Self::new();
        set.add(values);
        set
    }

    pub fn add(&mut self, values: impl IntoIterator<Item = Json>) -> &mut Self {
        for v in values {
            self.add_value(v);
        }
        self
    }

    /// Insert one record; malformed records are remembered and reported by [`ObjectSet::err`].
    pub fn add_value(&mut self, obj: Json) -> Option<PatchKey> {
        let index = self.offered;
        self.offered += 1;
        if !obj.is_object() {
            self.errs.push(ObjectSetError::Record { index, reason: Box::new(ObjectSetError::NotAnObject) });
            return None;
        }
        match PatchKey::of(&obj) {
            Ok(pk) => {
                self.insert(pk.gvk.clone(), pk.key.clone(), obj);
                Some(pk)
            }
            Err(e) => {
                self.errs.push(ObjectSetError::Record { index, reason: Box::new(e) });
                None
            }
        }
    }

    /// Insert any serializable resource (e.g. `k8s_openapi` types).
    pub fn add_serialized<T: Serialize>(&mut self, obj: &T) -> Option<PatchKey> {
        match serde_json::to_value(obj) {
            Ok(v) => self.add_value(v),
            Err(e) => {
                let index = self.offered;
                self.offered += 1;
                self.errs.push(ObjectSetError::Record { index, reason: Box::new(ObjectSetError::Serialize(e.to_string())) });
                None
            }
        }
    }

    fn insert(&mut self, gvk: Gvk, key: ObjectKey, obj: Json) {
        if !self.objects.contains_key(&gvk) {
            self.order.push(gvk.clone());
        }
        let by_key = self.objects.entry(gvk.clone()).or_default();
        if by_key.insert(key.clone(), obj).is_none() {
            self.key_order.entry(gvk).or_default().push(key);
        }
    }

    pub fn remove(&mut self, gvk: &Gvk, key: &ObjectKey) -> Option<Json> {
        let removed = self.objects.get_mut(gvk)?.remove(key)?;
        if let Some(keys) = self.key_order.get_mut(gvk) {
            keys.retain(|k| k != key);
        }
        if self.objects.get(gvk).map(|m| m.is_empty()).unwrap_or(false) {
            self.objects.remove(gvk);
            self.key_order.remove(gvk);
            self.order.retain(|g| g != gvk);
        }
        Some(removed)
    }

    /// Aggregate of every malformed record seen so far.
    pub fn err(&self) -> Result<(), ObjectSetError> {
        if self.errs.is_empty() { Ok(()) } else { Err(ObjectSetError::Aggregate(self.errs.clone())) }
    }

    pub fn len(&self) -> usize { self.objects.values().map(|m| m.len()).sum() }
    pub fn is_empty(&self) -> bool { self.objects.is_empty() }

    /// Types in first-insertion order.
    pub fn types(&self) -> impl Iterator<Item = &Gvk> { self.order.iter() }

    /// Records of one type in first-insertion order.
    pub fn objects(&self, gvk: &Gvk) -> impl Iterator<Item = (&ObjectKey, &Json)> {
        let by_key = self.objects.get(gvk);
        self.key_order
            .get(gvk)
            .into_iter()
            .flatten()
            .filter_map(move |k| by_key.and_then(|m| m.get(k)).map(|v| (k, v)))
    }

    /// Every record, grouped by type.
    pub fn iter(&self) -> impl Iterator<Item = (&Gvk, &ObjectKey, &Json)> {
        self.order.iter().flat_map(move |g| self.objects(g).map(move |(k, v)| (g, k, v)))
    }

    pub fn get(&self, gvk: &Gvk, key: &ObjectKey) -> Option<&Json> {
        self.objects.get(gvk).and_then(|m| m.get(key))
    }

    pub fn contains(&self, pk: &PatchKey) -> bool { self.get(&pk.gvk, &pk.key).is_some() }

    /// Look a record up by version-agnostic identity.
    pub fn find_group_kind(&self, gk: &GroupKind, key: &ObjectKey) -> Option<(&Gvk, &Json)> {
        self.order
            .iter()
            .filter(|g| g.group == gk.group && g.kind == gk.kind)
            .find_map(|g| self.get(g, key).map(|v| (g, v)))
    }

    /// Records grouped by group+kind, groups in first-seen order.
    pub fn by_group_kind(&self) -> Vec<(GroupKind, Vec<(&Gvk, &ObjectKey, &Json)>)> {
        let mut out: Vec<(GroupKind, Vec<(&Gvk, &ObjectKey, &Json)>)> = Vec::new();
        for (gvk, key, obj) in self.iter() {
            let gk = gvk.group_kind();
            match out.iter_mut().find(|(g, _)| *g == gk) {
                Some((_, items)) => items.push((gvk, key, obj)),
                None => out.push((gk, vec![(gvk, key, obj)])),
            }
        }
        out
    }

    /// Distinct namespaces referenced by keys, sorted.
    pub fn namespaces(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .objects
            .values()
            .flat_map(|m| m.keys())
            .filter_map(|k| k.namespace.clone())
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Consume the set, yielding records in order.
    pub fn into_values(mut self) -> Vec<Json> {
        let mut out = Vec::with_capacity(self.len());
        for gvk in std::mem::take(&mut self.order) {
            let mut by_key = self.objects.remove(&gvk).unwrap_or_default();
            for key in self.key_order.remove(&gvk).unwrap_or_default() {
                if let Some(v) = by_key.remove(&key) {
                    out.push(v);
                }
            }
        }
        out
    }
}
