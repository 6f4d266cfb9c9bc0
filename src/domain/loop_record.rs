//! Loop record and related types
//!
//! A Loop is one managed run of an autonomous coding agent against an
//! isolated git worktree. The record splits into an immutable-ish config and
//! an orchestrator-owned mutable state; nothing outside the orchestrator
//! writes the state.

use crate::id::now_ms;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Minimum allowed activity timeout.
pub const MIN_ACTIVITY_TIMEOUT_SECS: u64 = 60;

/// Default activity timeout.
pub const DEFAULT_ACTIVITY_TIMEOUT_SECS: u64 = 900;

/// Default consecutive-error threshold before a loop fails.
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// Default branch prefix for working branches.
pub const DEFAULT_BRANCH_PREFIX: &str = "ralph";

/// Ring cap for the recent-iterations history.
pub const RECENT_ITERATIONS_CAP: usize = 50;

/// Ring cap for in-state logs.
pub const LOGS_CAP: usize = 200;

/// The core Loop record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Loop {
    /// Unique identifier (timestamp + random suffix: "1738300800123-a1b2")
    pub id: String,

    /// Immutable configuration (changed only via explicit update)
    pub config: LoopConfig,

    /// Mutable runtime state, owned by the orchestrator
    pub state: LoopState,
}

impl Loop {
    /// Create a new loop record in draft status.
    pub fn new(id: impl Into<String>, config: LoopConfig) -> Self {
        Self {
            id: id.into(),
            config,
            state: LoopState::new(),
        }
    }

    /// Human-facing name for conflict messages and events: the branch slug
    /// when git state exists, otherwise the leading words of the prompt.
    pub fn display_name(&self) -> String {
        if let Some(git) = &self.state.git {
            git.working_branch.clone()
        } else {
            crate::id::slugify(&self.config.prompt, 40)
        }
    }
}

/// Loop execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    /// Autonomous iteration until completion
    Loop,
    /// One agent turn per user message, no autonomous continuation
    Chat,
}

/// Model selector passed through to the backend adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl ModelRef {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            variant: None,
        }
    }
}

/// Immutable loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Absolute path to the repository the loop works on
    pub directory: PathBuf,

    /// Workspace this loop belongs to
    pub workspace: String,

    /// The task prompt driving iterations
    pub prompt: String,

    /// Model selector for the backend
    pub model: ModelRef,

    /// Optional cap on iterations
    #[serde(default)]
    pub max_iterations: Option<u32>,

    /// Consecutive-error threshold before the loop fails
    pub max_consecutive_errors: u32,

    /// Maximum backend silence per iteration, in seconds (min 60)
    pub activity_timeout_secs: u64,

    /// Regex tested against agent output; a match completes the loop
    #[serde(default)]
    pub stop_pattern: Option<String>,

    /// Branch the working branch is cut from; auto-detected when absent
    #[serde(default)]
    pub base_branch: Option<String>,

    /// Prefix for working branch names
    pub branch_prefix: String,

    /// Scope segment for conventional commit messages
    #[serde(default)]
    pub commit_scope: Option<String>,

    /// Clear the worktree's .planning/ folder on the first iteration
    #[serde(default)]
    pub clear_planning_folder: bool,

    /// Generate a plan for approval before any code changes
    #[serde(default)]
    pub plan_mode: bool,

    /// Loop or chat mode
    pub mode: LoopMode,

    /// Creation timestamp (epoch millis)
    pub created_at: i64,
}

impl LoopConfig {
    /// Activity timeout with the 60s floor applied.
    pub fn activity_timeout(&self) -> Duration {
        Duration::from_secs(self.activity_timeout_secs.max(MIN_ACTIVITY_TIMEOUT_SECS))
    }
}

/// Git sub-state, absent until a worktree is created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitState {
    /// Isolated worktree for this loop; unique across all loops
    pub worktree_path: PathBuf,
    /// Branch the agent commits to
    pub working_branch: String,
    /// Branch the loop was cut from and merges back into
    pub original_branch: String,
}

/// Outcome of a single driver iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationOutcome {
    Continue,
    Complete,
    Error,
}

/// One entry in the bounded recent-iterations ring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub outcome: IterationOutcome,
    pub timestamp: i64,
}

/// Review-cycle bookkeeping
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewState {
    /// Whether this loop can be restarted to address review comments
    pub addressable: bool,
    /// Number of review cycles started so far
    pub review_cycle: u32,
    /// Review branches allocated across cycles
    pub branches: Vec<String>,
}

/// Severity of a state log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Bounded in-state log line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: i64,
}

/// Status of a loop in the lifecycle state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    /// Created but not started; fully mutable
    Draft,
    /// Started but between work phases
    Idle,
    /// Generating a plan for approval
    Planning,
    /// Worktree and backend being set up
    Starting,
    /// Driver actively iterating
    Running,
    /// Waiting for user input (chat turns)
    Waiting,
    /// Agent signalled completion
    Completed,
    /// Consecutive-error threshold crossed
    Failed,
    /// Iteration cap reached
    MaxIterations,
    /// Stopped by the user
    Stopped,
    /// Working branch pushed to the remote
    Pushed,
    /// Merged into the original branch
    Merged,
    /// Discarded; branch and worktree removed
    Deleted,
}

impl LoopStatus {
    /// Active statuses block new non-draft loops in the same directory.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            LoopStatus::Idle
                | LoopStatus::Planning
                | LoopStatus::Starting
                | LoopStatus::Running
                | LoopStatus::Waiting
        )
    }

    /// Terminal statuses end the driver.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoopStatus::Completed
                | LoopStatus::Failed
                | LoopStatus::MaxIterations
                | LoopStatus::Stopped
                | LoopStatus::Pushed
                | LoopStatus::Merged
                | LoopStatus::Deleted
        )
    }

    /// Only these statuses allow the record itself to be removed.
    pub fn is_purge_eligible(&self) -> bool {
        matches!(self, LoopStatus::Merged | LoopStatus::Pushed | LoopStatus::Deleted)
    }

    /// Wire representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopStatus::Draft => "draft",
            LoopStatus::Idle => "idle",
            LoopStatus::Planning => "planning",
            LoopStatus::Starting => "starting",
            LoopStatus::Running => "running",
            LoopStatus::Waiting => "waiting",
            LoopStatus::Completed => "completed",
            LoopStatus::Failed => "failed",
            LoopStatus::MaxIterations => "max_iterations",
            LoopStatus::Stopped => "stopped",
            LoopStatus::Pushed => "pushed",
            LoopStatus::Merged => "merged",
            LoopStatus::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable runtime state, owned by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopState {
    /// Current lifecycle status
    pub status: LoopStatus,

    /// Monotonically non-decreasing; bumped only by the iteration driver
    pub iteration_count: u32,

    /// Bounded ring of recent iteration outcomes
    pub recent_iterations: Vec<IterationRecord>,

    /// Git sub-state; absent until the worktree is created
    #[serde(default)]
    pub git: Option<GitState>,

    /// Single-use prompt override for the next iteration
    #[serde(default)]
    pub pending_prompt: Option<String>,

    /// Single-use message folded into the next iteration
    #[serde(default)]
    pub pending_message: Option<String>,

    /// Single-use model override for the next iteration
    #[serde(default)]
    pub pending_model: Option<ModelRef>,

    /// Review-cycle bookkeeping
    #[serde(default)]
    pub review: ReviewState,

    /// Bounded log/message history
    #[serde(default)]
    pub logs: Vec<LogEntry>,

    /// Plan text produced in plan mode
    #[serde(default)]
    pub plan: Option<String>,

    /// Plan feedback rounds so far
    #[serde(default)]
    pub feedback_rounds: u32,

    /// Consecutive iteration errors; reset by a successful iteration
    #[serde(default)]
    pub consecutive_errors: u32,

    /// Last iteration-level error message
    #[serde(default)]
    pub last_error: Option<String>,

    /// Last time the backend produced output (epoch millis)
    pub last_activity_at: i64,
}

impl LoopState {
    /// Fresh state for a newly created loop.
    pub fn new() -> Self {
        Self {
            status: LoopStatus::Draft,
            iteration_count: 0,
            recent_iterations: Vec::new(),
            git: None,
            pending_prompt: None,
            pending_message: None,
            pending_model: None,
            review: ReviewState::default(),
            logs: Vec::new(),
            plan: None,
            feedback_rounds: 0,
            consecutive_errors: 0,
            last_error: None,
            last_activity_at: now_ms(),
        }
    }

    /// Record a finished iteration: bump the count, push into the bounded
    /// ring, and maintain the consecutive-error counter.
    pub fn record_iteration(&mut self, outcome: IterationOutcome) {
        self.iteration_count += 1;
        self.recent_iterations.push(IterationRecord {
            outcome,
            timestamp: now_ms(),
        });
        if self.recent_iterations.len() > RECENT_ITERATIONS_CAP {
            let overflow = self.recent_iterations.len() - RECENT_ITERATIONS_CAP;
            self.recent_iterations.drain(..overflow);
        }
        match outcome {
            IterationOutcome::Error => self.consecutive_errors += 1,
            _ => self.consecutive_errors = 0,
        }
        self.last_activity_at = now_ms();
    }

    /// Append a bounded log entry.
    pub fn push_log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.logs.push(LogEntry {
            level,
            message: message.into(),
            timestamp: now_ms(),
        });
        if self.logs.len() > LOGS_CAP {
            let overflow = self.logs.len() - LOGS_CAP;
            self.logs.drain(..overflow);
        }
    }

    /// Take every pending value, clearing the fields. The caller persists the
    /// cleared state as part of the iteration that consumes them.
    pub fn take_pending(&mut self) -> PendingInput {
        PendingInput {
            prompt: self.pending_prompt.take(),
            message: self.pending_message.take(),
            model: self.pending_model.take(),
        }
    }

    /// True when any pending value is queued.
    pub fn has_pending(&self) -> bool {
        self.pending_prompt.is_some() || self.pending_message.is_some() || self.pending_model.is_some()
    }

    pub fn touch_activity(&mut self) {
        self.last_activity_at = now_ms();
    }
}

impl Default for LoopState {
    fn default() -> Self {
        Self::new()
    }
}

/// Pending values consumed by one iteration
#[derive(Debug, Clone, Default)]
pub struct PendingInput {
    pub prompt: Option<String>,
    pub message: Option<String>,
    pub model: Option<ModelRef>,
}
