use std::fmt;

use orka_core::{ClientError, ObjectSetError};

/// Patch computation failures; only malformed input can fail a diff.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },
}

impl PatchError {
    pub(crate) fn malformed(what: &'static str, reason: impl Into<String>) -> Self {
        PatchError::Malformed { what, reason: reason.into() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("malformed input: {0}")]
    Malformed(#[from] ObjectSetError),
    #[error("{op} {target}: {source}")]
    Client {
        op: &'static str,
        target: String,
        #[source]
        source: ClientError,
    },
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error("scope: {0}")]
    Scope(String),
    #[error("ownership: {0}")]
    Ownership(String),
    #[error("{hook} for {target}: {reason}")]
    Hook { hook: &'static str, target: String, reason: String },
    #[error("operation cancelled")]
    Cancelled,
    #[error("timed out: {0}")]
    Timeout(String),
    #[error(transparent)]
    Aggregate(ErrorList),
}

impl ApplyError {
    pub(crate) fn client(op: &'static str, target: impl fmt::Display, source: ClientError) -> Self {
        ApplyError::Client { op, target: target.to_string(), source }
    }

    /// Flatten nested aggregates.
    pub fn leaves(&self) -> Vec<&ApplyError> {
        match self {
            ApplyError::Aggregate(list) => list.0.iter().flat_map(|e| e.leaves()).collect(),
            other => vec![other],
        }
    }

    /// The client error behind this failure, if any.
    pub fn client_error(&self) -> Option<&ClientError> {
        match self {
            ApplyError::Client { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Every failure of one call, in the order encountered.
#[derive(Debug, Default)]
pub struct ErrorList(Vec<ApplyError>);

impl ErrorList {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, err: ApplyError) {
        match err {
            ApplyError::Aggregate(inner) => self.0.extend(inner.0),
            other => self.0.push(other),
        }
    }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn iter(&self) -> impl Iterator<Item = &ApplyError> { self.0.iter() }

    /// `Ok` when empty, the sole error when there is one, an aggregate otherwise.
    pub fn into_result(mut self) -> Result<(), ApplyError> {
        match self.0.len() {
            0 => Ok(()),
            1 => Err(self.0.remove(0)),
            _ => Err(ApplyError::Aggregate(self)),
        }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s): ", self.0.len())?;
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorList {}

impl From<Vec<ApplyError>> for ErrorList {
    fn from(errs: Vec<ApplyError>) -> Self {
        let mut list = ErrorList::new();
        for e in errs {
            list.push(e);
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_flattens_and_collapses_single() {
        let mut list = ErrorList::new();
        assert!(ErrorList::new().into_result().is_ok());
        list.push(ApplyError::Scope("a".into()));
        let single = ErrorList::from(vec![ApplyError::Cancelled]).into_result().unwrap_err();
        assert!(matches!(single, ApplyError::Cancelled));
        list.push(ApplyError::Aggregate(ErrorList::from(vec![ApplyError::Cancelled, ApplyError::Scope("b".into())])));
        assert_eq!(list.len(), 3);
        let err = list.into_result().unwrap_err();
        assert_eq!(err.leaves().len(), 3);
        assert_eq!(err.to_string(), "3 error(s): scope: a; operation cancelled; scope: b");
    }
}
