use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification of a failed step, as reported in task outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// A locator probe exhausted its retries.
    NotFound,
    /// A wait-for-condition exceeded its budget.
    Timeout,
    /// The surface raised an error while acting.
    Action,
    /// The run was cancelled while the step was in flight.
    Cancelled,
    /// The automation handle is gone; the driver has to reconnect.
    SessionLost,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::NotFound => "not-found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Action => "action",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::SessionLost => "session-lost",
        };
        f.write_str(label)
    }
}

/// Errors raised by an automation surface (browser or desktop window).
#[derive(Error, Debug)]
pub enum SurfaceError {
    #[error("Element not found: {0}")]
    NotFound(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Session lost: {0}")]
    SessionLost(String),

    #[error("Automation backend error: {0}")]
    Backend(String),

    #[error("Cancelled while waiting for {0}")]
    Cancelled(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SurfaceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SurfaceError::NotFound(_) => ErrorKind::NotFound,
            SurfaceError::Timeout(_) => ErrorKind::Timeout,
            SurfaceError::SessionLost(_) => ErrorKind::SessionLost,
            SurfaceError::Cancelled(_) => ErrorKind::Cancelled,
            _ => ErrorKind::Action,
        }
    }
}

/// Task-local failure of a step or of a whole workflow pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {detail}")]
pub struct StepError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl StepError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, detail)
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, detail)
    }

    pub fn action(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Action, detail)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "run cancelled")
    }

    pub fn is_session_lost(&self) -> bool {
        self.kind == ErrorKind::SessionLost
    }
}

impl From<SurfaceError> for StepError {
    fn from(err: SurfaceError) -> Self {
        StepError::new(err.kind(), err.to_string())
    }
}

/// Run-fatal failures. Nothing else aborts a batch.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to establish session with {target}: {reason}")]
    Establish { target: String, reason: String },

    #[error("Session preparation failed: {0}")]
    Prepare(String),

    #[error("Failed to re-establish lost session with {target}: {reason}")]
    Reconnect { target: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surface_error_kind_mapping() {
        assert_eq!(
            SurfaceError::NotFound("x".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(SurfaceError::Timeout("x".into()).kind(), ErrorKind::Timeout);
        assert_eq!(
            SurfaceError::SessionLost("gone".into()).kind(),
            ErrorKind::SessionLost
        );
        assert_eq!(SurfaceError::Backend("boom".into()).kind(), ErrorKind::Action);
        assert_eq!(
            SurfaceError::Cancelled("page load".into()).kind(),
            ErrorKind::Cancelled
        );
    }

    #[test]
    fn test_step_error_display() {
        let err = StepError::not_found("css:#cnpj");
        assert_eq!(err.to_string(), "not-found: css:#cnpj");
        assert!(!err.is_session_lost());
    }
}
