//! Label selectors used for discovery, both against the cache and the API server.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value as Json;
use smallvec::SmallVec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    NotExists(String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::NotExists(k) => !labels.contains_key(k),
            Requirement::In(k, vs) => labels.get(k).map(|v| vs.contains(v)).unwrap_or(false),
            Requirement::NotIn(k, vs) => labels.get(k).map(|v| !vs.contains(v)).unwrap_or(true),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Equals(k, v) => write!(f, "{}={}", k, v),
            Requirement::NotEquals(k, v) => write!(f, "{}!={}", k, v),
            Requirement::Exists(k) => f.write_str(k),
            Requirement::NotExists(k) => write!(f, "!{}", k),
            Requirement::In(k, vs) => write!(f, "{} in ({})", k, vs.join(",")),
            Requirement::NotIn(k, vs) => write!(f, "{} notin ({})", k, vs.join(",")),
        }
    }
}

/// A conjunction of label requirements. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    reqs: SmallVec<[Requirement; 4]>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid label selector {selector:?}: {reason}")]
pub struct SelectorError {
    pub selector: String,
    pub reason: String,
}

fn set_expr() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*([A-Za-z0-9./_-]+)\s+(in|notin)\s+\(([^)]*)\)\s*$").expect("static regex"))
}

fn label_key() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Za-z0-9.-]+/)?[A-Za-z0-9]([A-Za-z0-9._-]*[A-Za-z0-9])?$").expect("static regex"))
}

impl LabelSelector {
    pub fn everything() -> Self { Self::default() }

    pub fn from_labels<'a>(labels: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut reqs: SmallVec<[Requirement; 4]> =
            labels.into_iter().map(|(k, v)| Requirement::Equals(k.to_string(), v.to_string())).collect();
        reqs.sort_by_key(|r| r.to_string());
        Self { reqs }
    }

    pub fn and(mut self, req: Requirement) -> Self {
        self.reqs.push(req);
        self
    }

    pub fn is_empty(&self) -> bool { self.reqs.is_empty() }

    pub fn requirements(&self) -> &[Requirement] { &self.reqs }

    pub fn parse(s: &str) -> Result<Self, SelectorError> {
        let err = |reason: &str| SelectorError { selector: s.to_string(), reason: reason.to_string() };
        let mut reqs = SmallVec::new();
        for term in split_terms(s) {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            let req = if let Some(caps) = set_expr().captures(term) {
                let values: Vec<String> =
                    caps[3].split(',').map(|v| v.trim().to_string()).filter(|v| !v.is_empty()).collect();
                if &caps[2] == "in" {
                    Requirement::In(caps[1].to_string(), values)
                } else {
                    Requirement::NotIn(caps[1].to_string(), values)
                }
            } else if let Some((k, v)) = term.split_once("!=") {
                Requirement::NotEquals(k.trim().to_string(), v.trim().to_string())
            } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
                Requirement::Equals(k.trim().to_string(), v.trim().to_string())
            } else if let Some(k) = term.strip_prefix('!') {
                Requirement::NotExists(k.trim().to_string())
            } else {
                Requirement::Exists(term.to_string())
            };
            let key = match &req {
                Requirement::Equals(k, _)
                | Requirement::NotEquals(k, _)
                | Requirement::Exists(k)
                | Requirement::NotExists(k)
                | Requirement::In(k, _)
                | Requirement::NotIn(k, _) => k,
            };
            if !label_key().is_match(key) {
                return Err(err(&format!("invalid label key {:?}", key)));
            }
            reqs.push(req);
        }
        Ok(Self { reqs })
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.reqs.iter().all(|r| r.matches(labels))
    }

    /// Match against `metadata.labels` of a record.
    pub fn matches_object(&self, obj: &Json) -> bool {
        self.matches(&labels_of(obj))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.reqs.iter().map(|r| r.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

/// Split on commas that are not inside a `( … )` value set.
fn split_terms(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, ch) in s.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

/// Collect `metadata.labels` as an ordered map; non-string values are skipped.
pub fn labels_of(obj: &Json) -> BTreeMap<String, String> {
    string_map(obj, "labels")
}

/// Collect `metadata.annotations` as an ordered map; non-string values are skipped.
pub fn annotations_of(obj: &Json) -> BTreeMap<String, String> {
    string_map(obj, "annotations")
}

fn string_map(obj: &Json, field: &str) -> BTreeMap<String, String> {
    obj.get("metadata")
        .and_then(|m| m.get(field))
        .and_then(|l| l.as_object())
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default()
}
