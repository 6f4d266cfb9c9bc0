//! Orchestrator-level tunables.

use std::path::PathBuf;

/// How an activity timeout relates to the consecutive-error threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// A timeout counts like any backend error (default)
    CountsTowardErrorThreshold,
    /// A single timeout fails the loop outright
    FailImmediately,
}

/// Configuration for the orchestrator itself (not per-loop).
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Root directory for worktrees; defaults to
    /// `{loop directory}/.ralphd/worktrees` when unset
    pub worktree_root: Option<PathBuf>,

    /// Timeout-vs-error policy for the iteration driver
    pub timeout_policy: TimeoutPolicy,

    /// Attempt cap for the conflict-resolution sub-engine
    pub conflict_max_attempts: u32,

    /// Remote used for push operations
    pub remote: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            worktree_root: None,
            timeout_policy: TimeoutPolicy::CountsTowardErrorThreshold,
            conflict_max_attempts: 3,
            remote: "origin".to_string(),
        }
    }
}
