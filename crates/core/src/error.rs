//! Errors raised while building core values.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// A core value could not be constructed from its raw form.
///
/// Ids arrive from storage, configuration and callers as plain strings; this
/// is what rejecting one of them looks like.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("{kind} must not be blank")]
    BlankId { kind: &'static str },

    #[error("malformed {kind} '{raw}': {reason}")]
    MalformedId {
        kind: &'static str,
        raw: String,
        reason: String,
    },
}

impl DomainError {
    pub fn kind(&self) -> &'static str {
        match self {
            DomainError::BlankId { kind } | DomainError::MalformedId { kind, .. } => kind,
        }
    }
}
