//! Orka core types: record identity, object sets, selectors and cluster seams.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

mod client;
mod gvk;
mod objectset;
mod selector;

pub use client::{ClientError, PatchDoc, PatchType, ResourceCache, ResourceClient};
pub use gvk::{GroupKind, Gvk, ObjectKey, PatchKey};
pub use objectset::{ObjectSet, ObjectSetError};
pub use selector::{annotations_of, labels_of, LabelSelector, Requirement, SelectorError};

pub type Uid = [u8; 16];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// One watch event for a cached type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub uid: Uid,
    pub kind: DeltaKind,
    /// Raw object with `metadata.managedFields` stripped
    pub raw: serde_json::Value,
}

/// Parse `metadata.uid` into its 16 raw bytes.
pub fn parse_uid(uid_str: &str) -> anyhow::Result<Uid> {
    let u = uuid::Uuid::parse_str(uid_str).map_err(|e| anyhow::anyhow!("parsing metadata.uid as uuid: {}", e))?;
    Ok(*u.as_bytes())
}

pub mod prelude {
    pub use super::{
        ClientError, Delta, DeltaKind, GroupKind, Gvk, LabelSelector, ObjectKey, ObjectSet, PatchDoc, PatchKey,
        PatchType, ResourceCache, ResourceClient, Uid,
    };
}
