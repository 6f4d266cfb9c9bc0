//! Typed lifecycle and progress events broadcast on the event bus.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{generate_event_id, now_ms};

use super::loop_record::{IterationOutcome, LoopStatus};

/// Event type constants
pub mod event_types {
    pub const LOOP_CREATED: &str = "loop.created";
    pub const LOOP_STATUS_CHANGE: &str = "loop.status_change";
    pub const LOOP_REMOVED: &str = "loop.removed";
    pub const ITERATION_STARTED: &str = "iteration.started";
    pub const ITERATION_COMPLETED: &str = "iteration.completed";
    pub const ITERATION_TEXT: &str = "iteration.text";
    pub const ITERATION_TOOL_CALL: &str = "iteration.tool_call";
    pub const COMMIT_CREATED: &str = "commit.created";
    pub const BRANCH_PUSHED: &str = "branch.pushed";
    pub const BRANCH_SYNC: &str = "branch.sync";
    pub const CONFLICT_RESOLUTION: &str = "conflict.resolution";
    pub const PLAN_UPDATED: &str = "plan.updated";
}

/// A broadcast event. `loop_id` is optional: events without one reach every
/// subscriber regardless of filter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoopEvent {
    /// Unique event identifier
    pub id: String,
    /// Event type (e.g., "loop.status_change")
    pub event_type: String,
    /// Associated loop ID (if any)
    pub loop_id: Option<String>,
    /// Event-specific payload data
    pub payload: Value,
    /// Unix timestamp in milliseconds
    pub created_at: i64,
}

impl LoopEvent {
    /// Create a new event with the given type and payload
    pub fn new(event_type: &str, loop_id: Option<String>, payload: Value) -> Self {
        Self {
            id: generate_event_id(),
            event_type: event_type.to_string(),
            loop_id,
            payload,
            created_at: now_ms(),
        }
    }

    /// The delivery rule for filtered subscribers: an event is withheld only
    /// when it carries a loop id, the subscriber has a filter, and the two
    /// differ. Events without a loop id pass every filter.
    pub fn matches_filter(&self, filter: Option<&str>) -> bool {
        match (&self.loop_id, filter) {
            (Some(event_loop), Some(wanted)) => event_loop == wanted,
            _ => true,
        }
    }

    pub fn loop_created(loop_id: &str, name: &str) -> Self {
        Self::new(
            event_types::LOOP_CREATED,
            Some(loop_id.to_string()),
            serde_json::json!({ "name": name }),
        )
    }

    pub fn status_changed(loop_id: &str, old: LoopStatus, new: LoopStatus) -> Self {
        Self::new(
            event_types::LOOP_STATUS_CHANGE,
            Some(loop_id.to_string()),
            serde_json::json!({
                "old_status": old.as_str(),
                "new_status": new.as_str()
            }),
        )
    }

    pub fn loop_removed(loop_id: &str) -> Self {
        Self::new(event_types::LOOP_REMOVED, Some(loop_id.to_string()), Value::Null)
    }

    pub fn iteration_started(loop_id: &str, iteration: u32) -> Self {
        Self::new(
            event_types::ITERATION_STARTED,
            Some(loop_id.to_string()),
            serde_json::json!({ "iteration": iteration }),
        )
    }

    pub fn iteration_completed(loop_id: &str, iteration: u32, outcome: IterationOutcome) -> Self {
        Self::new(
            event_types::ITERATION_COMPLETED,
            Some(loop_id.to_string()),
            serde_json::json!({
                "iteration": iteration,
                "outcome": outcome,
            }),
        )
    }

    pub fn iteration_text(loop_id: &str, text: &str) -> Self {
        Self::new(
            event_types::ITERATION_TEXT,
            Some(loop_id.to_string()),
            serde_json::json!({ "text": text }),
        )
    }

    pub fn iteration_tool_call(loop_id: &str, tool: &str) -> Self {
        Self::new(
            event_types::ITERATION_TOOL_CALL,
            Some(loop_id.to_string()),
            serde_json::json!({ "tool": tool }),
        )
    }

    pub fn commit_created(loop_id: &str, sha: &str, files_changed: u32) -> Self {
        Self::new(
            event_types::COMMIT_CREATED,
            Some(loop_id.to_string()),
            serde_json::json!({ "sha": sha, "files_changed": files_changed }),
        )
    }

    pub fn branch_pushed(loop_id: &str, remote_ref: &str, sync_status: &str) -> Self {
        Self::new(
            event_types::BRANCH_PUSHED,
            Some(loop_id.to_string()),
            serde_json::json!({ "remote_ref": remote_ref, "sync_status": sync_status }),
        )
    }

    pub fn branch_sync(loop_id: &str, sync_status: &str) -> Self {
        Self::new(
            event_types::BRANCH_SYNC,
            Some(loop_id.to_string()),
            serde_json::json!({ "sync_status": sync_status }),
        )
    }

    pub fn conflict_resolution(loop_id: &str, attempt: u32, remaining_files: usize) -> Self {
        Self::new(
            event_types::CONFLICT_RESOLUTION,
            Some(loop_id.to_string()),
            serde_json::json!({ "attempt": attempt, "remaining_files": remaining_files }),
        )
    }

    pub fn plan_updated(loop_id: &str, feedback_rounds: u32) -> Self {
        Self::new(
            event_types::PLAN_UPDATED,
            Some(loop_id.to_string()),
            serde_json::json!({ "feedback_rounds": feedback_rounds }),
        )
    }
}
