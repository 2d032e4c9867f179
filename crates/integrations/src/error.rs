//! Error type returned by integration calls.

use thiserror::Error;

/// Broad category of an integration failure.
///
/// The engine uses the kind (together with the HTTP status code, when one is
/// present) to decide whether an attempt is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationErrorKind {
    /// Connection-level problem (DNS, reset, refused). Retryable.
    Transport,
    /// The call did not complete within its allotted time. Retryable.
    Timeout,
    /// The request itself was malformed or rejected by validation. Not retryable.
    Validation,
    /// The remote answered with a protocol-level error the client could not
    /// map to a response. Not retryable.
    Protocol,
}

/// A failed integration call.
#[derive(Debug, Clone, Error)]
#[error("integration error ({kind:?}): {detail}")]
pub struct IntegrationError {
    pub kind: IntegrationErrorKind,
    pub detail: String,
}

impl IntegrationError {
    pub fn new(kind: IntegrationErrorKind, detail: impl Into<String>) -> Self {
        Self { kind, detail: detail.into() }
    }

    pub fn transport(detail: impl Into<String>) -> Self {
        Self::new(IntegrationErrorKind::Transport, detail)
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(IntegrationErrorKind::Timeout, detail)
    }

    pub fn validation(detail: impl Into<String>) -> Self {
        Self::new(IntegrationErrorKind::Validation, detail)
    }

    /// Whether a call failing with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            IntegrationErrorKind::Transport | IntegrationErrorKind::Timeout
        )
    }
}
