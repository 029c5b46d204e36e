//! Type and instance identity for resource records.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::ObjectSetError;

/// Group/Version/Kind of a resource type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Build from an `apiVersion` string (`group/version` or core `version`) and a kind.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        Self { group, version, kind: kind.to_string() }
    }

    /// Read `apiVersion`/`kind` from a record.
    pub fn of(obj: &Json) -> Result<Self, ObjectSetError> {
        let api_version = obj
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or(ObjectSetError::MissingField("apiVersion"))?;
        let kind = obj
            .get("kind")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or(ObjectSetError::MissingField("kind"))?;
        Ok(Self::from_api_version(api_version, kind))
    }

    /// Parse a `v1/Kind` or `group/v1/Kind` key.
    pub fn parse_key(key: &str) -> Result<Self, ObjectSetError> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", *version, *kind)),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new(*group, *version, *kind)),
            _ => Err(ObjectSetError::InvalidGvkKey(key.to_string())),
        }
    }

    pub fn key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn group_kind(&self) -> GroupKind {
        GroupKind { group: self.group.clone(), kind: self.kind.clone() }
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

/// Version-agnostic type identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), kind: kind.into() }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() { f.write_str(&self.kind) } else { write!(f, "{}.{}", self.kind, self.group) }
    }
}

/// Namespace + name of a record within its type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.filter(|n| !n.is_empty()).map(str::to_string), name: name.into() }
    }

    /// Read `metadata.namespace`/`metadata.name`; an empty namespace counts as unset.
    pub fn of(obj: &Json) -> Result<Self, ObjectSetError> {
        let meta = obj.get("metadata").ok_or(ObjectSetError::MissingField("metadata"))?;
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or(ObjectSetError::MissingField("metadata.name"))?;
        let namespace = meta.get("namespace").and_then(|v| v.as_str());
        Ok(Self::new(namespace, name))
    }

    /// Parse `ns/name` or `name`.
    pub fn parse(s: &str) -> Self {
        match s.split_once('/') {
            Some((ns, name)) => Self::new(Some(ns), name),
            None => Self::new(None, s),
        }
    }

    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Identity of one record across types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatchKey {
    pub gvk: Gvk,
    pub key: ObjectKey,
}

impl PatchKey {
    pub fn new(gvk: Gvk, key: ObjectKey) -> Self { Self { gvk, key } }

    pub fn of(obj: &Json) -> Result<Self, ObjectSetError> {
        Ok(Self { gvk: Gvk::of(obj)?, key: ObjectKey::of(obj)? })
    }
}

impl fmt::Display for PatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.gvk.key(), self.key)
    }
}
