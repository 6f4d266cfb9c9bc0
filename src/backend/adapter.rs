//! Backend adapter trait and streamed iteration events.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::{LoopConfig, ModelRef};
use crate::error::Result;

/// Events streamed back during one agent iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendEvent {
    /// Incremental agent output text
    TextDelta { text: String },
    /// A complete message from the agent
    Message { role: String, text: String },
    /// The agent invoked a tool
    ToolCall {
        name: String,
        input: serde_json::Value,
    },
    /// The iteration finished; `completed` marks the whole task as done
    Done {
        #[serde(default)]
        completed: bool,
    },
    /// The backend failed mid-iteration
    Error { message: String },
}

/// Everything needed for one iteration call.
#[derive(Debug, Clone)]
pub struct IterationRequest {
    pub prompt: String,
    pub model: ModelRef,
}

/// A model the backend can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub provider: String,
    pub id: String,
    pub name: String,
}

/// Call contract for the AI backend. Implementations own their protocol;
/// the orchestrator only consumes this surface.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Establish whatever session the backend needs for a loop.
    async fn connect(&self, config: &LoopConfig) -> Result<()>;

    /// Tear down the loop's backend session.
    async fn disconnect(&self, loop_id: &str) -> Result<()>;

    /// Models available for a directory.
    async fn get_models(&self, directory: &Path) -> Result<Vec<ModelInfo>>;

    /// Run one agent iteration. The returned stream yields events until
    /// `Done` or `Error`; cancelling the token aborts the in-flight call
    /// cooperatively.
    async fn run_iteration(
        &self,
        loop_id: &str,
        request: IterationRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<BackendEvent>>;
}
