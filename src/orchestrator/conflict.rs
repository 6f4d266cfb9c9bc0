//! Conflict-resolution sub-engine.
//!
//! Invoked when a branch-sync merge leaves conflicts: a bounded loop that
//! feeds the conflicted files to the backend, re-checks after each attempt,
//! and concludes the merge and pushes once nothing remains. Exhausting the
//! attempt cap aborts the merge so the worktree never stays half-merged.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{BackendAdapter, BackendEvent, IterationRequest};
use crate::domain::{LoopEvent, ModelRef};
use crate::error::Result;
use crate::events::EventBus;
use crate::git::GitService;

/// Cap on conflict-marked content quoted per file in the prompt.
const MAX_FILE_CONTENT_CHARS: usize = 20_000;

/// Result of a resolution run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictOutcome {
    pub resolved: bool,
    pub merge_sha: Option<String>,
    pub remote_ref: Option<String>,
    pub attempts: u32,
}

pub struct ConflictResolver {
    git: GitService,
    backend: Arc<dyn BackendAdapter>,
    bus: EventBus,
    max_attempts: u32,
    activity_timeout: Duration,
}

impl ConflictResolver {
    pub fn new(
        git: GitService,
        backend: Arc<dyn BackendAdapter>,
        bus: EventBus,
        max_attempts: u32,
        activity_timeout: Duration,
    ) -> Self {
        Self {
            git,
            backend,
            bus,
            max_attempts,
            activity_timeout,
        }
    }

    /// Drive the bounded resolution loop inside the loop's worktree.
    #[allow(clippy::too_many_arguments)]
    pub async fn resolve(
        &self,
        loop_id: &str,
        worktree: &Path,
        working_branch: &str,
        base_branch: &str,
        model: &ModelRef,
        remote: &str,
        cancel: CancellationToken,
    ) -> Result<ConflictOutcome> {
        let mut attempts = 0;
        loop {
            if cancel.is_cancelled() {
                if self.git.merge_in_progress(worktree).await? {
                    self.git.merge_abort(worktree).await?;
                }
                return Ok(ConflictOutcome {
                    resolved: false,
                    merge_sha: None,
                    remote_ref: None,
                    attempts,
                });
            }

            let conflicts = self.git.conflicted_files(worktree).await?;
            if conflicts.is_empty() {
                let merge_sha = if self.git.merge_in_progress(worktree).await? {
                    self.git.commit_merge(worktree).await?
                } else {
                    self.git.head_sha(worktree).await?
                };
                let push = self.git.push_branch(worktree, working_branch, remote).await?;
                info!(loop_id, attempts, sha = %merge_sha, "sync conflicts resolved");
                return Ok(ConflictOutcome {
                    resolved: true,
                    merge_sha: Some(merge_sha),
                    remote_ref: Some(push.remote_ref),
                    attempts,
                });
            }

            if attempts >= self.max_attempts {
                warn!(loop_id, attempts, remaining = conflicts.len(), "giving up; aborting merge");
                self.git.merge_abort(worktree).await?;
                return Ok(ConflictOutcome {
                    resolved: false,
                    merge_sha: None,
                    remote_ref: None,
                    attempts,
                });
            }

            attempts += 1;
            self.bus
                .emit(LoopEvent::conflict_resolution(loop_id, attempts, conflicts.len()));

            let prompt = self
                .build_prompt(worktree, &conflicts, base_branch, working_branch)
                .await;
            self.run_resolution_iteration(loop_id, prompt, model, &cancel).await;
        }
    }

    async fn build_prompt(
        &self,
        worktree: &Path,
        conflicts: &[String],
        base_branch: &str,
        working_branch: &str,
    ) -> String {
        let mut prompt = format!(
            "Merging '{base_branch}' into '{working_branch}' left conflicts in the files \
             below. Edit each file to remove the conflict markers, preserving the intent \
             of both sides. Do not commit; the merge is concluded for you.\n"
        );
        for file in conflicts {
            prompt.push_str(&format!("\n### {file}\n"));
            match self.git.executor().read_file(&worktree.join(file)).await {
                Ok(mut content) => {
                    if content.len() > MAX_FILE_CONTENT_CHARS {
                        let mut cut = MAX_FILE_CONTENT_CHARS;
                        while !content.is_char_boundary(cut) {
                            cut -= 1;
                        }
                        content.truncate(cut);
                        content.push_str("\n[truncated]");
                    }
                    prompt.push_str("```\n");
                    prompt.push_str(&content);
                    prompt.push_str("\n```\n");
                }
                Err(e) => {
                    prompt.push_str(&format!("(unreadable: {e})\n"));
                }
            }
        }
        prompt
    }

    /// One backend iteration against the conflicted worktree. Errors and
    /// timeouts are tolerated; the attempt is spent either way and the
    /// re-check decides what happens next.
    async fn run_resolution_iteration(
        &self,
        loop_id: &str,
        prompt: String,
        model: &ModelRef,
        cancel: &CancellationToken,
    ) {
        let token = cancel.child_token();
        let request = IterationRequest {
            prompt,
            model: model.clone(),
        };
        let mut rx = match self.backend.run_iteration(loop_id, request, token.clone()).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(loop_id, error = %e, "resolution iteration failed to start");
                return;
            }
        };
        loop {
            match tokio::time::timeout(self.activity_timeout, rx.recv()).await {
                Err(_) => {
                    token.cancel();
                    warn!(loop_id, "resolution iteration timed out");
                    return;
                }
                Ok(None) => return,
                Ok(Some(BackendEvent::Done { .. })) => return,
                Ok(Some(BackendEvent::Error { message })) => {
                    warn!(loop_id, error = %message, "resolution iteration errored");
                    return;
                }
                Ok(Some(_)) => {}
            }
        }
    }
}
