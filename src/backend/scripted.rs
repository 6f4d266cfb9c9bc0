//! Scripted backend for tests: plays back queued iterations and records
//! every call it receives.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::adapter::{BackendAdapter, BackendEvent, IterationRequest, ModelInfo};
use crate::domain::LoopConfig;
use crate::error::Result;

/// One scripted iteration's behavior.
#[derive(Debug, Clone)]
pub struct ScriptedIteration {
    /// Events to stream, in order
    pub events: Vec<BackendEvent>,
    /// Delay before each event
    pub event_delay: Option<Duration>,
    /// Never send anything; wait for cancellation
    pub hang: bool,
}

impl ScriptedIteration {
    /// An iteration that produces output and continues.
    pub fn continues() -> Self {
        Self {
            events: vec![
                BackendEvent::TextDelta {
                    text: "working on it".to_string(),
                },
                BackendEvent::Done { completed: false },
            ],
            event_delay: None,
            hang: false,
        }
    }

    /// An iteration that marks the task complete.
    pub fn completes() -> Self {
        Self {
            events: vec![
                BackendEvent::TextDelta {
                    text: "all done".to_string(),
                },
                BackendEvent::Done { completed: true },
            ],
            event_delay: None,
            hang: false,
        }
    }

    /// An iteration that emits the given text then continues.
    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            events: vec![
                BackendEvent::TextDelta { text: text.into() },
                BackendEvent::Done { completed: false },
            ],
            event_delay: None,
            hang: false,
        }
    }

    /// An iteration that fails.
    pub fn errors(message: impl Into<String>) -> Self {
        Self {
            events: vec![BackendEvent::Error {
                message: message.into(),
            }],
            event_delay: None,
            hang: false,
        }
    }

    /// An iteration that produces nothing until cancelled.
    pub fn hangs() -> Self {
        Self {
            events: vec![],
            event_delay: None,
            hang: true,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.event_delay = Some(delay);
        self
    }
}

/// Test backend: pops scripted iterations off a queue, falling back to a
/// default iteration when the queue is empty.
pub struct ScriptedBackend {
    script: Mutex<VecDeque<ScriptedIteration>>,
    default_iteration: ScriptedIteration,
    prompts: Mutex<Vec<String>>,
    connects: AtomicU32,
    disconnects: Mutex<Vec<String>>,
    cancellations: Arc<AtomicU32>,
    models: Vec<ModelInfo>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_iteration: ScriptedIteration::continues(),
            prompts: Mutex::new(Vec::new()),
            connects: AtomicU32::new(0),
            disconnects: Mutex::new(Vec::new()),
            cancellations: Arc::new(AtomicU32::new(0)),
            models: vec![ModelInfo {
                provider: "scripted".to_string(),
                id: "scripted-1".to_string(),
                name: "Scripted Model".to_string(),
            }],
        }
    }

    /// Replace the fallback used when the queue runs dry.
    pub fn with_default(mut self, iteration: ScriptedIteration) -> Self {
        self.default_iteration = iteration;
        self
    }

    /// Queue scripted iterations, consumed in order.
    pub fn push(&self, iteration: ScriptedIteration) {
        self.script.lock().unwrap().push_back(iteration);
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnected_loops(&self) -> Vec<String> {
        self.disconnects.lock().unwrap().clone()
    }

    pub fn cancellation_count(&self) -> u32 {
        self.cancellations.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendAdapter for ScriptedBackend {
    async fn connect(&self, _config: &LoopConfig) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self, loop_id: &str) -> Result<()> {
        self.disconnects.lock().unwrap().push(loop_id.to_string());
        Ok(())
    }

    async fn get_models(&self, _directory: &Path) -> Result<Vec<ModelInfo>> {
        Ok(self.models.clone())
    }

    async fn run_iteration(
        &self,
        _loop_id: &str,
        request: IterationRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<BackendEvent>> {
        self.prompts.lock().unwrap().push(request.prompt.clone());

        let iteration = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_iteration.clone());

        let (tx, rx) = mpsc::channel(64);
        let cancellations = self.cancellations.clone();
        tokio::spawn(async move {
            if iteration.hang {
                cancel.cancelled().await;
                cancellations.fetch_add(1, Ordering::SeqCst);
                return;
            }
            for event in iteration.events {
                if let Some(delay) = iteration.event_delay {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            cancellations.fetch_add(1, Ordering::SeqCst);
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                if cancel.is_cancelled() {
                    cancellations.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}
