use orka_core::{PatchDoc, PatchKey};
use serde::Serialize;
use serde_json::Value as Json;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum PlanAction {
    Create { record: Json },
    Update { patch: PatchDoc },
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanEntry {
    #[serde(flatten)]
    pub key: PatchKey,
    #[serde(flatten)]
    pub action: PlanAction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
}

/// What an apply would do, in the order it would do it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Plan {
    entries: Vec<PlanEntry>,
}

impl Plan {
    pub(crate) fn push(&mut self, key: PatchKey, action: PlanAction) {
        self.entries.push(PlanEntry { key, action });
    }

    pub fn entries(&self) -> &[PlanEntry] { &self.entries }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn len(&self) -> usize { self.entries.len() }

    pub fn get(&self, key: &PatchKey) -> Option<&PlanAction> {
        self.entries.iter().find(|e| &e.key == key).map(|e| &e.action)
    }

    pub fn creates(&self) -> impl Iterator<Item = (&PatchKey, &Json)> {
        self.entries.iter().filter_map(|e| match &e.action {
            PlanAction::Create { record } => Some((&e.key, record)),
            _ => None,
        })
    }

    pub fn updates(&self) -> impl Iterator<Item = (&PatchKey, &PatchDoc)> {
        self.entries.iter().filter_map(|e| match &e.action {
            PlanAction::Update { patch } => Some((&e.key, patch)),
            _ => None,
        })
    }

    pub fn deletes(&self) -> impl Iterator<Item = &PatchKey> {
        self.entries.iter().filter(|e| matches!(e.action, PlanAction::Delete)).map(|e| &e.key)
    }

    pub fn summary(&self) -> PlanSummary {
        self.entries.iter().fold(PlanSummary::default(), |mut s, e| {
            match e.action {
                PlanAction::Create { .. } => s.creates += 1,
                PlanAction::Update { .. } => s.updates += 1,
                PlanAction::Delete => s.deletes += 1,
            }
            s
        })
    }
}
