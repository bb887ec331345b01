//! Closed error taxonomy (spec §7) surfaced to MCP callers.

use serde::Serialize;
use thiserror::Error;

/// The error kinds a caller of the `audit` RPC may observe, exactly per
/// spec §7's taxonomy.
#[derive(Debug, Error, Clone, Serialize)]
#[serde(tag = "kind", content = "details")]
pub enum GanError {
    #[error("malformed submission or config override: {0}")]
    ValidationFailed(String),

    #[error("submission queue is full")]
    QueueFull,

    #[error("deadline exceeded: {0}")]
    Timeout(String),

    #[error("analyzer is missing or not responding: {0}")]
    JudgeUnavailable(String),

    #[error("analyzer failed: {0}")]
    JudgeFailed(String),

    #[error("no session found for id {0}")]
    SessionNotFound(String),

    #[error("session is already complete")]
    AlreadyComplete,

    #[error("resource capacity exceeded: {0}")]
    Capacity(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GanError {
    /// The machine-readable tag transmitted in the error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            GanError::ValidationFailed(_) => "ValidationFailed",
            GanError::QueueFull => "QueueFull",
            GanError::Timeout(_) => "Timeout",
            GanError::JudgeUnavailable(_) => "JudgeUnavailable",
            GanError::JudgeFailed(_) => "JudgeFailed",
            GanError::SessionNotFound(_) => "SessionNotFound",
            GanError::AlreadyComplete => "AlreadyComplete",
            GanError::Capacity(_) => "Capacity",
            GanError::Internal(_) => "Internal",
        }
    }

    /// Whether a caller may reasonably retry the same submission.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GanError::QueueFull | GanError::Timeout(_) | GanError::Capacity(_))
    }

    /// Build the structured `{isError, error: {kind, message, details?}}`
    /// envelope mandated by spec §6, with `details` omitted (the variants
    /// above only ever carry an already-redacted human message).
    pub fn to_envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "isError": true,
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
            }
        })
    }
}

/// Errors local to the Session Store (C2), `From`-converted into
/// `GanError` at the orchestrator boundary.
#[derive(Debug, Error, Clone)]
pub enum SessionStoreError {
    #[error("no session found for id {0}")]
    NotFound(String),
    #[error("session {0} is already complete")]
    AlreadyComplete(String),
    #[error("active session capacity ({0}) exceeded")]
    Capacity(usize),
    #[error("snapshot I/O failed: {0}")]
    SnapshotFailed(String),
}

impl From<SessionStoreError> for GanError {
    fn from(e: SessionStoreError) -> Self {
        match e {
            SessionStoreError::NotFound(id) => GanError::SessionNotFound(id),
            SessionStoreError::AlreadyComplete(_) => GanError::AlreadyComplete,
            SessionStoreError::Capacity(limit) => {
                GanError::Capacity(format!("max_active_sessions ({limit}) exceeded"))
            }
            SessionStoreError::SnapshotFailed(msg) => GanError::Internal(msg),
        }
    }
}

/// Errors local to the External Judge Driver (C3), `From`-converted into
/// `GanError` at the orchestrator boundary.
#[derive(Debug, Error, Clone)]
pub enum JudgeError {
    #[error("analyzer executable not found: {0}")]
    NotFound(String),
    #[error("analyzer timed out after {duration_ms}ms running `{command}`")]
    Timeout { command: String, duration_ms: u64 },
    #[error("analyzer produced unparseable output: {0}")]
    BadOutput(String),
    #[error("analyzer exited with status {code}: {stderr_tail}")]
    NonZeroExit { code: i32, stderr_tail: String },
    #[error("I/O error running analyzer: {0}")]
    Io(String),
}

impl From<JudgeError> for GanError {
    fn from(e: JudgeError) -> Self {
        match &e {
            JudgeError::NotFound(_) => GanError::JudgeUnavailable(e.to_string()),
            JudgeError::Timeout { .. } => GanError::Timeout(e.to_string()),
            JudgeError::BadOutput(_) | JudgeError::NonZeroExit { .. } => {
                GanError::JudgeFailed(e.to_string())
            }
            JudgeError::Io(_) => GanError::JudgeFailed(e.to_string()),
        }
    }
}

impl JudgeError {
    /// Whether the orchestrator is permitted to retry `C3.Audit` after
    /// this failure (spec §4.4: "only for Timeout and IOError").
    pub fn is_retryable(&self) -> bool {
        matches!(self, JudgeError::Timeout { .. } | JudgeError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shape_matches_spec() {
        let err = GanError::QueueFull;
        let envelope = err.to_envelope();
        assert_eq!(envelope["isError"], true);
        assert_eq!(envelope["error"]["kind"], "QueueFull");
    }

    #[test]
    fn bad_output_is_never_retryable() {
        let err = JudgeError::BadOutput("empty stdout".into());
        assert!(!err.is_retryable());
    }

    #[test]
    fn timeout_and_io_are_retryable() {
        assert!(JudgeError::Timeout { command: "x".into(), duration_ms: 10 }.is_retryable());
        assert!(JudgeError::Io("broken pipe".into()).is_retryable());
    }
}
