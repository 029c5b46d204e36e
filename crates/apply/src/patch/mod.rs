//! Patch engine: format selection, two/three-way diffs and sanitization.

pub mod merge;
pub mod sanitize;
pub mod schema;
pub mod strategic;

use std::sync::Arc;

use orka_core::{Gvk, PatchDoc, PatchType};
use serde_json::Value as Json;
use tracing::debug;

pub use merge::{create_merge_patch, create_three_way_merge_patch};
pub use sanitize::{retain_deletions, sanitize_patch, ReplacingFields};
pub use schema::{FieldMeta, ListStrategy, MergeSchema, MergeSchemaRegistry};
pub use strategic::DiffOptions;

use crate::error::PatchError;

/// Which states feed the diff.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PatchMode {
    /// original (last applied) + modified + current.
    #[default]
    ThreeWay,
    /// Three-way with no original: nothing is deleted.
    IgnoreOriginal,
    /// current→modified; deletion intents survive only under the retained paths.
    TwoWay(ReplacingFields),
}

/// States of one record being compared.
#[derive(Debug, Clone, Copy)]
pub struct PatchInputs<'a> {
    pub original: Option<&'a Json>,
    pub modified: &'a Json,
    pub current: &'a Json,
}

#[derive(Debug, Clone)]
pub struct PatchEngine {
    schemas: Arc<MergeSchemaRegistry>,
}

impl Default for PatchEngine {
    fn default() -> Self { Self::new(Arc::new(MergeSchemaRegistry::builtin())) }
}

impl PatchEngine {
    pub fn new(schemas: Arc<MergeSchemaRegistry>) -> Self { Self { schemas } }

    pub fn schemas(&self) -> &MergeSchemaRegistry { &self.schemas }

    pub fn patch_type(&self, gvk: &Gvk) -> PatchType {
        if self.schemas.get(gvk).is_some() { PatchType::StrategicMerge } else { PatchType::JsonMerge }
    }

    /// The raw diff for `mode`, before layering and sanitization.
    pub fn compute(&self, gvk: &Gvk, inputs: PatchInputs<'_>, mode: &PatchMode) -> Result<PatchDoc, PatchError> {
        let empty = Json::Object(Default::default());
        let original = match mode {
            PatchMode::ThreeWay => inputs.original.unwrap_or(&empty),
            _ => &empty,
        };
        let body = match (self.schemas.get(gvk), mode) {
            (Some(schema), PatchMode::TwoWay(_)) => strategic::two_way(inputs.current, inputs.modified, Some(&schema))?,
            (Some(schema), _) => strategic::three_way(original, inputs.modified, inputs.current, Some(&schema))?,
            (None, PatchMode::TwoWay(_)) => create_merge_patch(inputs.current, inputs.modified)?,
            (None, _) => create_three_way_merge_patch(original, inputs.modified, inputs.current)?,
        };
        Ok(PatchDoc::new(self.patch_type(gvk), body))
    }

    /// The patch to send, or `None` when the live record already matches.
    ///
    /// Static `diff_patches` are layered onto the computed diff before sanitization.
    /// Bookkeeping annotations ride along on a real change but never make one.
    pub fn prepare(
        &self,
        gvk: &Gvk,
        inputs: PatchInputs<'_>,
        mode: &PatchMode,
        diff_patches: &[Json],
    ) -> Result<Option<PatchDoc>, PatchError> {
        let PatchDoc { patch_type, mut body } = self.compute(gvk, inputs, mode)?;
        for dp in diff_patches {
            merge::layer(&mut body, dp);
        }
        let mut body = sanitize_patch(&body, false)?;
        if let PatchMode::TwoWay(retain) = mode {
            retain_deletions(&mut body, retain);
        }
        let probe = sanitize_patch(&body, true)?;
        if PatchDoc::new(patch_type, probe).is_empty() {
            debug!(gvk = %gvk.key(), "no changes");
            return Ok(None);
        }
        Ok(Some(PatchDoc::new(patch_type, body)))
    }

    /// [`PatchEngine::compute`] over undecoded documents.
    pub fn compute_bytes(&self, gvk: &Gvk, original: Option<&[u8]>, modified: &[u8], current: &[u8], mode: &PatchMode) -> Result<PatchDoc, PatchError> {
        let decode = |what: &'static str, b: &[u8]| -> Result<Json, PatchError> {
            serde_json::from_slice(b).map_err(|e| PatchError::malformed(what, e.to_string()))
        };
        let original = original.map(|b| decode("original", b)).transpose()?;
        let modified = decode("modified", modified)?;
        let current = decode("current", current)?;
        self.compute(gvk, PatchInputs { original: original.as_ref(), modified: &modified, current: &current }, mode)
    }
}
