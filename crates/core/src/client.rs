//! Seams to the cluster: a REST-style client and a watch-fed cache.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::{Gvk, LabelSelector, ObjectKey};

/// Transport-level failures reported by a [`ResourceClient`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("unknown type: {0}")]
    UnknownType(String),
    #[error("transport: {0}")]
    Transport(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool { matches!(self, ClientError::NotFound(_)) }
    pub fn is_already_exists(&self) -> bool { matches!(self, ClientError::AlreadyExists(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, ClientError::Conflict(_)) }
}

/// Wire format of a patch body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatchType {
    /// RFC 7386 JSON merge patch.
    JsonMerge,
    /// Directive-aware strategic merge patch.
    StrategicMerge,
}

impl PatchType {
    pub fn content_type(&self) -> &'static str {
        match self {
            PatchType::JsonMerge => "application/merge-patch+json",
            PatchType::StrategicMerge => "application/strategic-merge-patch+json",
        }
    }
}

/// A computed patch body together with its format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchDoc {
    pub patch_type: PatchType,
    pub body: Json,
}

impl PatchDoc {
    pub fn new(patch_type: PatchType, body: Json) -> Self { Self { patch_type, body } }

    /// `{}` (or `null`) means there is nothing to send.
    pub fn is_empty(&self) -> bool {
        match &self.body {
            Json::Null => true,
            Json::Object(m) => m.is_empty(),
            _ => false,
        }
    }

    /// Wire form of the body.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.body)
    }
}

impl fmt::Display for PatchDoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.body)
    }
}

/// Generic client over arbitrary resource types. Records are untyped JSON.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Whether records of this type live in a namespace.
    async fn is_namespaced(&self, gvk: &Gvk) -> Result<bool, ClientError>;

    async fn get(&self, gvk: &Gvk, key: &ObjectKey) -> Result<Option<Json>, ClientError>;

    /// List records; `namespace = None` lists across all namespaces (or cluster scope).
    async fn list(&self, gvk: &Gvk, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<Json>, ClientError>;

    async fn create(&self, gvk: &Gvk, obj: &Json) -> Result<Json, ClientError>;

    /// Full replace; `obj` must carry `metadata.resourceVersion`.
    async fn update(&self, gvk: &Gvk, obj: &Json) -> Result<Json, ClientError>;

    async fn patch(&self, gvk: &Gvk, key: &ObjectKey, patch: &PatchDoc) -> Result<Json, ClientError>;

    async fn delete(&self, gvk: &Gvk, key: &ObjectKey) -> Result<(), ClientError>;
}

/// Read-only, eventually consistent view of one type maintained by a watch loop.
pub trait ResourceCache: Send + Sync {
    fn get(&self, key: &ObjectKey) -> Option<Json>;

    /// `namespace = None` lists every cached record.
    fn list(&self, namespace: Option<&str>, selector: &LabelSelector) -> Vec<Json>;
}
