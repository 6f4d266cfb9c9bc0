//! Error types for ralphd
//!
//! Centralized error handling using thiserror. The taxonomy mirrors how the
//! orchestrator recovers: validation and conflict errors reject the caller's
//! request with no state change, execution errors preserve raw stderr, and
//! backend/timeout errors are counted toward the consecutive-error threshold
//! instead of failing the loop outright.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable conflict codes attached to [`RalphdError::Conflict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictCode {
    /// Another loop in the same directory/workspace is already active
    ActiveLoopExists,
    /// Operation requires a draft loop
    NotDraft,
    /// Loop is already active
    AlreadyRunning,
    /// Operation requires a running or waiting loop
    NotRunning,
    /// Operation requires a loop in plan mode that is still planning
    NotPlanning,
    /// Plan has not been generated yet
    PlanNotReady,
    /// Base branch cannot change once the worktree exists
    BaseBranchImmutable,
    /// Loop status does not permit this operation
    InvalidStatus,
}

impl ConflictCode {
    /// Wire representation of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictCode::ActiveLoopExists => "active_loop_exists",
            ConflictCode::NotDraft => "not_draft",
            ConflictCode::AlreadyRunning => "already_running",
            ConflictCode::NotRunning => "not_running",
            ConflictCode::NotPlanning => "not_planning",
            ConflictCode::PlanNotReady => "plan_not_ready",
            ConflictCode::BaseBranchImmutable => "base_branch_immutable",
            ConflictCode::InvalidStatus => "invalid_status",
        }
    }
}

impl std::fmt::Display for ConflictCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All error types that can occur in ralphd
#[derive(Debug, Error)]
pub enum RalphdError {
    /// Loop not found in the store
    #[error("Loop not found: {0}")]
    LoopNotFound(String),

    /// Bad input; no state was changed
    #[error("Validation error: {0}")]
    Validation(String),

    /// Request rejected because of the loop's current state; no partial mutation
    #[error("Conflict ({code}): {message}")]
    Conflict {
        code: ConflictCode,
        message: String,
        /// Id of the loop the caller collided with, when one exists
        conflicting_loop: Option<String>,
    },

    /// A git or shell command failed; raw stderr preserved
    #[error("Command failed: {message}")]
    Execution { message: String, stderr: String },

    /// Git-level failure that is not a raw command error
    #[error("Git error: {0}")]
    Git(String),

    /// Backend adapter failure; counted toward the consecutive-error threshold
    #[error("Backend error: {0}")]
    Backend(String),

    /// Activity timeout expired; counted like a backend error
    #[error("Timed out after {0}s of inactivity")]
    Timeout(u64),

    /// Storage/persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RalphdError {
    /// Build a conflict error without an attached loop.
    pub fn conflict(code: ConflictCode, message: impl Into<String>) -> Self {
        RalphdError::Conflict {
            code,
            message: message.into(),
            conflicting_loop: None,
        }
    }

    /// Conflict raised by the per-directory concurrency guard, naming the
    /// loop the caller collided with.
    pub fn active_loop_exists(conflicting_id: &str, conflicting_name: &str) -> Self {
        RalphdError::Conflict {
            code: ConflictCode::ActiveLoopExists,
            message: format!(
                "an active loop already exists in this directory: {} ({})",
                conflicting_name, conflicting_id
            ),
            conflicting_loop: Some(conflicting_id.to_string()),
        }
    }

    /// Build an execution error from a failed command result.
    pub fn execution(message: impl Into<String>, stderr: impl Into<String>) -> Self {
        RalphdError::Execution {
            message: message.into(),
            stderr: stderr.into(),
        }
    }

    /// True for errors that count toward `max_consecutive_errors` instead of
    /// failing the loop immediately.
    pub fn is_iteration_recoverable(&self) -> bool {
        matches!(self, RalphdError::Backend(_) | RalphdError::Timeout(_))
    }
}

/// Result type alias for ralphd operations
pub type Result<T> = std::result::Result<T, RalphdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_not_found_display() {
        let err = RalphdError::LoopNotFound("1738300800123-a1b2".to_string());
        assert_eq!(err.to_string(), "Loop not found: 1738300800123-a1b2");
    }

    #[test]
    fn test_conflict_display_includes_code() {
        let err = RalphdError::conflict(ConflictCode::NotDraft, "loop is already started");
        assert_eq!(err.to_string(), "Conflict (not_draft): loop is already started");
    }

    #[test]
    fn test_active_loop_exists_carries_conflicting_id() {
        let err = RalphdError::active_loop_exists("001-abcd", "fix-auth");
        match err {
            RalphdError::Conflict {
                code,
                conflicting_loop,
                ..
            } => {
                assert_eq!(code, ConflictCode::ActiveLoopExists);
                assert_eq!(conflicting_loop.as_deref(), Some("001-abcd"));
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_execution_preserves_stderr() {
        let err = RalphdError::execution("git merge failed", "CONFLICT (content): foo.rs");
        match &err {
            RalphdError::Execution { stderr, .. } => {
                assert!(stderr.contains("CONFLICT"));
            }
            other => panic!("expected execution error, got {:?}", other),
        }
        assert_eq!(err.to_string(), "Command failed: git merge failed");
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(RalphdError::Backend("rate limited".into()).is_iteration_recoverable());
        assert!(RalphdError::Timeout(900).is_iteration_recoverable());
        assert!(!RalphdError::Git("nothing to commit".into()).is_iteration_recoverable());
        assert!(!RalphdError::Validation("bad input".into()).is_iteration_recoverable());
    }

    #[test]
    fn test_conflict_code_serialization() {
        let json = serde_json::to_string(&ConflictCode::ActiveLoopExists).unwrap();
        assert_eq!(json, "\"active_loop_exists\"");
        let json = serde_json::to_string(&ConflictCode::BaseBranchImmutable).unwrap();
        assert_eq!(json, "\"base_branch_immutable\"");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: RalphdError = io_err.into();
        assert!(matches!(err, RalphdError::Io(_)));
    }
}
