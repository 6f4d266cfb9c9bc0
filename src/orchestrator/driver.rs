//! The iteration driver: one task per running loop.
//!
//! One backend call is one iteration. The driver consumes pending values,
//! streams the backend's events with an activity timeout, commits worktree
//! changes, and applies the outcome policy (continue / complete / error,
//! consecutive-error threshold, iteration cap). Cancellation is cooperative
//! through the loop's [`DriverSignals`].

use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};

use super::engine::{DriverSignals, EngineShared};
use super::settings::TimeoutPolicy;
use crate::backend::{BackendEvent, IterationRequest};
use crate::domain::loop_record::PendingInput;
use crate::domain::{
    IterationOutcome, LogLevel, Loop, LoopEvent, LoopMode, LoopStatus, ModelRef,
};
use crate::error::Result;
use crate::exec::ExecOptions;
use crate::git::CommitInfo;

/// How a single iteration's stream ended.
enum RunKind {
    /// The backend finished; `completed` marks the whole task done
    Finished { completed: bool },
    /// The backend reported an error
    Errored(String),
    /// No backend activity within the activity timeout
    TimedOut,
    /// Aborted for injected input; restart immediately
    Aborted,
    /// The loop was stopped
    Stopped,
}

struct IterationRun {
    kind: RunKind,
    text: String,
    messages: Vec<(String, String)>,
}

pub(crate) struct Driver {
    shared: Arc<EngineShared>,
    loop_id: String,
    signals: Arc<DriverSignals>,
}

impl Driver {
    pub(crate) fn new(shared: Arc<EngineShared>, loop_id: String, signals: Arc<DriverSignals>) -> Self {
        Self {
            shared,
            loop_id,
            signals,
        }
    }

    pub(crate) async fn run(self) {
        if let Err(e) = self.drive().await {
            warn!(loop_id = %self.loop_id, error = %e, "driver aborted");
            // Surface the failure on the record rather than vanishing.
            if let Ok(mut record) = self.shared.load(&self.loop_id)
                && record.state.status.is_active()
            {
                record.state.last_error = Some(e.to_string());
                let _ = self.shared.set_status(&mut record, LoopStatus::Failed);
            }
        }
        self.shared.forget_task_if(&self.loop_id, &self.signals);
    }

    async fn drive(&self) -> Result<()> {
        let record = self.shared.load(&self.loop_id)?;
        match (record.config.mode, record.state.status) {
            (LoopMode::Chat, LoopStatus::Running) => self.run_chat().await,
            (LoopMode::Loop, LoopStatus::Planning) => self.run_planning().await,
            (LoopMode::Loop, LoopStatus::Running) => self.run_loop().await,
            (mode, status) => {
                debug!(loop_id = %self.loop_id, ?mode, %status, "nothing to drive");
                Ok(())
            }
        }
    }

    //=== Loop mode ===

    async fn run_loop(&self) -> Result<()> {
        loop {
            if self.signals.stop.is_cancelled() {
                return Ok(());
            }
            let mut record = self.shared.load(&self.loop_id)?;
            if record.state.status != LoopStatus::Running {
                return Ok(());
            }

            // The cap is checked before starting an iteration, never after
            // overshooting.
            if let Some(max) = record.config.max_iterations
                && record.state.iteration_count >= max
            {
                self.shared.set_status(&mut record, LoopStatus::MaxIterations)?;
                return Ok(());
            }

            let stop_regex = compile_stop_pattern(record.config.stop_pattern.as_deref());
            let pending = record.state.take_pending();
            let prompt = build_iteration_prompt(&record, &pending);
            let model = pending.model.clone().unwrap_or_else(|| record.config.model.clone());
            record.state.touch_activity();
            // Persisting here clears the pendings in the same iteration that
            // consumes them.
            self.shared.store.update(&record)?;
            let iteration_number = record.state.iteration_count + 1;
            self.shared
                .bus
                .emit(LoopEvent::iteration_started(&self.loop_id, iteration_number));

            if record.state.iteration_count == 0 && record.config.clear_planning_folder {
                self.clear_planning_folder(&record).await;
            }

            let IterationRun { kind, text, messages } =
                self.run_single_iteration(&record, prompt, model).await;
            match kind {
                RunKind::Stopped => return Ok(()),
                RunKind::Aborted => continue,
                RunKind::Finished { completed } => {
                    if self.signals.stop.is_cancelled() {
                        return Ok(());
                    }
                    let commit = match self.commit_changes(&record).await {
                        Ok(commit) => commit,
                        Err(e) => {
                            // Git failures are never auto-retried.
                            record.state.last_error = Some(e.to_string());
                            record.state.push_log(LogLevel::Error, format!("commit failed: {e}"));
                            self.shared.set_status(&mut record, LoopStatus::Failed)?;
                            return Ok(());
                        }
                    };
                    let matched_stop = stop_regex.as_ref().is_some_and(|re| re.is_match(&text));
                    let outcome = if completed || matched_stop {
                        IterationOutcome::Complete
                    } else {
                        IterationOutcome::Continue
                    };
                    record.state.record_iteration(outcome);
                    record.state.last_error = None;
                    for (role, body) in &messages {
                        record.state.push_log(LogLevel::Info, format!("{role}: {body}"));
                    }
                    if outcome == IterationOutcome::Complete {
                        self.shared.set_status(&mut record, LoopStatus::Completed)?;
                        self.emit_iteration_events(iteration_number, outcome, commit);
                        return Ok(());
                    }
                    self.shared.store.update(&record)?;
                    self.emit_iteration_events(iteration_number, outcome, commit);
                }
                RunKind::Errored(message) => {
                    if self.signals.stop.is_cancelled() {
                        return Ok(());
                    }
                    if self.handle_iteration_error(&mut record, message, false, iteration_number)? {
                        return Ok(());
                    }
                }
                RunKind::TimedOut => {
                    if self.signals.stop.is_cancelled() {
                        return Ok(());
                    }
                    let message = format!(
                        "no backend activity within {}s",
                        record.config.activity_timeout().as_secs()
                    );
                    if self.handle_iteration_error(&mut record, message, true, iteration_number)? {
                        return Ok(());
                    }
                }
            }
        }
    }

    //=== Plan mode ===

    /// One plan-generation round: produce a plan, persist it, and exit. The
    /// next round starts on feedback; `accept_plan` moves the loop on.
    async fn run_planning(&self) -> Result<()> {
        loop {
            if self.signals.stop.is_cancelled() {
                return Ok(());
            }
            let mut record = self.shared.load(&self.loop_id)?;
            if record.state.status != LoopStatus::Planning {
                return Ok(());
            }

            let pending = record.state.take_pending();
            let prompt = build_plan_prompt(&record, &pending);
            let model = pending.model.clone().unwrap_or_else(|| record.config.model.clone());
            record.state.touch_activity();
            self.shared.store.update(&record)?;
            let iteration_number = record.state.iteration_count + 1;
            self.shared
                .bus
                .emit(LoopEvent::iteration_started(&self.loop_id, iteration_number));

            let IterationRun { kind, text, .. } =
                self.run_single_iteration(&record, prompt, model).await;
            match kind {
                RunKind::Stopped => return Ok(()),
                RunKind::Aborted => continue,
                RunKind::Finished { .. } => {
                    if self.signals.stop.is_cancelled() {
                        return Ok(());
                    }
                    record.state.plan = Some(text);
                    record.state.record_iteration(IterationOutcome::Continue);
                    record.state.last_error = None;
                    self.shared.store.update(&record)?;
                    self.shared
                        .bus
                        .emit(LoopEvent::plan_updated(&self.loop_id, record.state.feedback_rounds));
                    self.shared.bus.emit(LoopEvent::iteration_completed(
                        &self.loop_id,
                        iteration_number,
                        IterationOutcome::Continue,
                    ));
                    // Feedback that raced in during this round starts the
                    // next one instead of waiting on a wake that already
                    // targeted this task.
                    if self.shared.load(&self.loop_id)?.state.has_pending() {
                        continue;
                    }
                    return Ok(());
                }
                RunKind::Errored(message) => {
                    self.handle_iteration_error(&mut record, message, false, iteration_number)?;
                    // Status stays planning unless the threshold failed it;
                    // the next feedback round retries.
                    return Ok(());
                }
                RunKind::TimedOut => {
                    let message = format!(
                        "no backend activity within {}s",
                        record.config.activity_timeout().as_secs()
                    );
                    self.handle_iteration_error(&mut record, message, true, iteration_number)?;
                    return Ok(());
                }
            }
        }
    }

    //=== Chat mode ===

    /// Exactly one turn per invocation: run the turn, go back to waiting.
    async fn run_chat(&self) -> Result<()> {
        loop {
            if self.signals.stop.is_cancelled() {
                return Ok(());
            }
            let mut record = self.shared.load(&self.loop_id)?;
            if record.state.status != LoopStatus::Running {
                return Ok(());
            }

            let pending = record.state.take_pending();
            let prompt = pending
                .message
                .clone()
                .or_else(|| pending.prompt.clone())
                .unwrap_or_else(|| record.config.prompt.clone());
            let model = pending.model.clone().unwrap_or_else(|| record.config.model.clone());
            record.state.touch_activity();
            self.shared.store.update(&record)?;
            let iteration_number = record.state.iteration_count + 1;
            self.shared
                .bus
                .emit(LoopEvent::iteration_started(&self.loop_id, iteration_number));

            let IterationRun { kind, messages, .. } =
                self.run_single_iteration(&record, prompt, model).await;
            match kind {
                RunKind::Stopped => return Ok(()),
                RunKind::Aborted => continue,
                RunKind::Finished { .. } => {
                    if self.signals.stop.is_cancelled() {
                        return Ok(());
                    }
                    let commit = match self.commit_changes(&record).await {
                        Ok(commit) => commit,
                        Err(e) => {
                            record.state.last_error = Some(e.to_string());
                            record.state.push_log(LogLevel::Error, format!("commit failed: {e}"));
                            self.shared.set_status(&mut record, LoopStatus::Failed)?;
                            return Ok(());
                        }
                    };
                    record.state.record_iteration(IterationOutcome::Continue);
                    record.state.last_error = None;
                    for (role, body) in &messages {
                        record.state.push_log(LogLevel::Info, format!("{role}: {body}"));
                    }
                    self.shared.set_status(&mut record, LoopStatus::Waiting)?;
                    self.emit_iteration_events(iteration_number, IterationOutcome::Continue, commit);
                    // A message that raced in while this turn was finishing
                    // runs now instead of waiting on a lost wake.
                    let latest = self.shared.load(&self.loop_id)?;
                    if latest.state.status == LoopStatus::Running && latest.state.has_pending() {
                        continue;
                    }
                    return Ok(());
                }
                RunKind::Errored(message) => {
                    self.finish_chat_error(&mut record, message, false, iteration_number)?;
                    return Ok(());
                }
                RunKind::TimedOut => {
                    let message = format!(
                        "no backend activity within {}s",
                        record.config.activity_timeout().as_secs()
                    );
                    self.finish_chat_error(&mut record, message, true, iteration_number)?;
                    return Ok(());
                }
            }
        }
    }

    fn finish_chat_error(
        &self,
        record: &mut Loop,
        message: String,
        timed_out: bool,
        iteration: u32,
    ) -> Result<()> {
        record.state.record_iteration(IterationOutcome::Error);
        record.state.last_error = Some(message.clone());
        record.state.push_log(LogLevel::Error, message);
        let fail_now = record.state.consecutive_errors >= record.config.max_consecutive_errors
            || (timed_out && self.shared.settings.timeout_policy == TimeoutPolicy::FailImmediately);
        let next = if fail_now { LoopStatus::Failed } else { LoopStatus::Waiting };
        self.shared.set_status(record, next)?;
        self.shared.bus.emit(LoopEvent::iteration_completed(
            &self.loop_id,
            iteration,
            IterationOutcome::Error,
        ));
        Ok(())
    }

    //=== Shared pieces ===

    /// Stream one backend iteration, bounded by the activity timeout, with
    /// stop and inject signals taking priority over stream events.
    async fn run_single_iteration(&self, record: &Loop, prompt: String, model: ModelRef) -> IterationRun {
        let iter_cancel = self.signals.stop.child_token();
        let request = IterationRequest { prompt, model };
        let mut rx = match self
            .shared
            .backend
            .run_iteration(&self.loop_id, request, iter_cancel.clone())
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                return IterationRun {
                    kind: RunKind::Errored(e.to_string()),
                    text: String::new(),
                    messages: Vec::new(),
                };
            }
        };

        let activity_timeout = record.config.activity_timeout();
        let mut text = String::new();
        let mut messages = Vec::new();

        let kind = loop {
            tokio::select! {
                biased;
                _ = self.signals.stop.cancelled() => {
                    break RunKind::Stopped;
                }
                _ = self.signals.abort_iteration.notified() => {
                    iter_cancel.cancel();
                    break RunKind::Aborted;
                }
                event = tokio::time::timeout(activity_timeout, rx.recv()) => match event {
                    Err(_) => {
                        iter_cancel.cancel();
                        break RunKind::TimedOut;
                    }
                    Ok(None) => break RunKind::Finished { completed: false },
                    Ok(Some(event)) => match event {
                        BackendEvent::TextDelta { text: delta } => {
                            text.push_str(&delta);
                            self.shared.bus.emit(LoopEvent::iteration_text(&self.loop_id, &delta));
                        }
                        BackendEvent::Message { role, text: body } => {
                            messages.push((role, body));
                        }
                        BackendEvent::ToolCall { name, .. } => {
                            self.shared.bus.emit(LoopEvent::iteration_tool_call(&self.loop_id, &name));
                        }
                        BackendEvent::Error { message } => break RunKind::Errored(message),
                        BackendEvent::Done { completed } => break RunKind::Finished { completed },
                    }
                }
            }
        };

        IterationRun { kind, text, messages }
    }

    /// Commit any worktree changes. No changes is a normal iteration, not an
    /// error.
    async fn commit_changes(&self, record: &Loop) -> Result<Option<CommitInfo>> {
        let Some(git_state) = &record.state.git else {
            return Ok(None);
        };
        let git = self.shared.git_for(record);
        if !git.has_uncommitted_changes(&git_state.worktree_path).await? {
            return Ok(None);
        }
        let message = conventional_commit(
            record.config.commit_scope.as_deref(),
            &record.config.prompt,
            record.state.iteration_count + 1,
        );
        let info = git.commit(&git_state.worktree_path, &message).await?;
        Ok(Some(info))
    }

    fn emit_iteration_events(&self, iteration: u32, outcome: IterationOutcome, commit: Option<CommitInfo>) {
        if let Some(commit) = commit {
            self.shared
                .bus
                .emit(LoopEvent::commit_created(&self.loop_id, &commit.sha, commit.files_changed));
        }
        self.shared
            .bus
            .emit(LoopEvent::iteration_completed(&self.loop_id, iteration, outcome));
    }

    /// Returns true when the loop failed and the driver should end.
    fn handle_iteration_error(
        &self,
        record: &mut Loop,
        message: String,
        timed_out: bool,
        iteration: u32,
    ) -> Result<bool> {
        warn!(loop_id = %self.loop_id, error = %message, timed_out, "iteration error");
        record.state.record_iteration(IterationOutcome::Error);
        record.state.last_error = Some(message.clone());
        record.state.push_log(LogLevel::Error, message);

        let fail_now = record.state.consecutive_errors >= record.config.max_consecutive_errors
            || (timed_out && self.shared.settings.timeout_policy == TimeoutPolicy::FailImmediately);
        if fail_now {
            self.shared.set_status(record, LoopStatus::Failed)?;
        } else {
            self.shared.store.update(record)?;
        }
        self.shared.bus.emit(LoopEvent::iteration_completed(
            &self.loop_id,
            iteration,
            IterationOutcome::Error,
        ));
        Ok(fail_now)
    }

    async fn clear_planning_folder(&self, record: &Loop) {
        let Some(git_state) = &record.state.git else {
            return;
        };
        let planning = git_state.worktree_path.join(".planning");
        let executor = self.shared.executor_for(record);
        if executor.directory_exists(&planning).await {
            let result = executor
                .exec("rm", &["-rf", &planning.to_string_lossy()], ExecOptions::default())
                .await;
            if !result.success {
                warn!(loop_id = %self.loop_id, stderr = %result.stderr, "failed to clear planning folder");
            }
        }
    }
}

fn compile_stop_pattern(pattern: Option<&str>) -> Option<Regex> {
    pattern.and_then(|p| match Regex::new(p) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(pattern = p, error = %e, "invalid stop pattern ignored");
            None
        }
    })
}

fn build_iteration_prompt(record: &Loop, pending: &PendingInput) -> String {
    let mut prompt = pending
        .prompt
        .clone()
        .unwrap_or_else(|| record.config.prompt.clone());
    if let Some(plan) = &record.state.plan {
        prompt.push_str("\n\n## Approved plan\n");
        prompt.push_str(plan);
    }
    if let Some(message) = &pending.message {
        prompt.push_str("\n\n## Additional instructions\n");
        prompt.push_str(message);
    }
    prompt
}

fn build_plan_prompt(record: &Loop, pending: &PendingInput) -> String {
    let mut prompt = format!(
        "Produce an implementation plan for the following task. Do not change any files yet.\n\n{}",
        pending.prompt.as_deref().unwrap_or(&record.config.prompt)
    );
    if let Some(previous) = &record.state.plan {
        prompt.push_str("\n\n## Previous plan\n");
        prompt.push_str(previous);
    }
    if let Some(feedback) = &pending.message {
        prompt.push_str("\n\n## Feedback\n");
        prompt.push_str(feedback);
    }
    prompt
}

/// Normalized conventional-commit message for driver commits.
pub(crate) fn conventional_commit(scope: Option<&str>, prompt: &str, iteration: u32) -> String {
    let first_line = prompt.lines().next().unwrap_or("update").trim();
    let mut summary = first_line.trim_end_matches('.').to_string();
    if let Some(first) = summary.chars().next()
        && first.is_ascii_uppercase()
    {
        summary.replace_range(..first.len_utf8(), &first.to_ascii_lowercase().to_string());
    }
    if summary.len() > 50 {
        let mut cut = 50;
        while !summary.is_char_boundary(cut) {
            cut -= 1;
        }
        summary.truncate(cut);
        summary = summary.trim_end().to_string();
    }
    if summary.is_empty() {
        summary = "update".to_string();
    }
    match scope {
        Some(scope) => format!("feat({scope}): {summary} (iteration {iteration})"),
        None => format!("feat: {summary} (iteration {iteration})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::loop_record::{
        DEFAULT_ACTIVITY_TIMEOUT_SECS, DEFAULT_BRANCH_PREFIX, DEFAULT_MAX_CONSECUTIVE_ERRORS,
    };
    use crate::domain::{LoopConfig, ModelRef};
    use crate::id::now_ms;
    use std::path::PathBuf;

    fn record_with_prompt(prompt: &str) -> Loop {
        Loop::new(
            "001-abcd",
            LoopConfig {
                directory: PathBuf::from("/repo"),
                workspace: "default".to_string(),
                prompt: prompt.to_string(),
                model: ModelRef::new("anthropic", "claude-sonnet"),
                max_iterations: None,
                max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
                activity_timeout_secs: DEFAULT_ACTIVITY_TIMEOUT_SECS,
                stop_pattern: None,
                base_branch: None,
                branch_prefix: DEFAULT_BRANCH_PREFIX.to_string(),
                commit_scope: None,
                clear_planning_folder: false,
                plan_mode: false,
                mode: LoopMode::Loop,
                created_at: now_ms(),
            },
        )
    }

    #[test]
    fn test_conventional_commit_without_scope() {
        assert_eq!(
            conventional_commit(None, "Add OAuth support.", 3),
            "feat: add OAuth support (iteration 3)"
        );
    }

    #[test]
    fn test_conventional_commit_with_scope() {
        assert_eq!(
            conventional_commit(Some("auth"), "add login flow", 1),
            "feat(auth): add login flow (iteration 1)"
        );
    }

    #[test]
    fn test_conventional_commit_truncates_long_summaries() {
        let long = "implement a very long description of the work that keeps going well past the limit";
        let message = conventional_commit(None, long, 2);
        let summary = message
            .strip_prefix("feat: ")
            .and_then(|rest| rest.strip_suffix(" (iteration 2)"))
            .unwrap();
        assert!(summary.len() <= 50);
    }

    #[test]
    fn test_conventional_commit_uses_first_line_only() {
        let message = conventional_commit(None, "fix the bug\nwith lots of detail", 1);
        assert_eq!(message, "feat: fix the bug (iteration 1)");
    }

    #[test]
    fn test_build_iteration_prompt_defaults_to_config() {
        let record = record_with_prompt("base task");
        let prompt = build_iteration_prompt(&record, &PendingInput::default());
        assert_eq!(prompt, "base task");
    }

    #[test]
    fn test_build_iteration_prompt_pending_prompt_replaces() {
        let record = record_with_prompt("base task");
        let pending = PendingInput {
            prompt: Some("override task".to_string()),
            message: Some("also do this".to_string()),
            model: None,
        };
        let prompt = build_iteration_prompt(&record, &pending);
        assert!(prompt.starts_with("override task"));
        assert!(prompt.contains("## Additional instructions\nalso do this"));
        assert!(!prompt.contains("base task"));
    }

    #[test]
    fn test_build_iteration_prompt_includes_plan() {
        let mut record = record_with_prompt("base task");
        record.state.plan = Some("1. do things".to_string());
        let prompt = build_iteration_prompt(&record, &PendingInput::default());
        assert!(prompt.contains("## Approved plan\n1. do things"));
    }

    #[test]
    fn test_build_plan_prompt_includes_feedback_and_previous() {
        let mut record = record_with_prompt("base task");
        record.state.plan = Some("old plan".to_string());
        let pending = PendingInput {
            prompt: None,
            message: Some("tighter scope please".to_string()),
            model: None,
        };
        let prompt = build_plan_prompt(&record, &pending);
        assert!(prompt.contains("base task"));
        assert!(prompt.contains("## Previous plan\nold plan"));
        assert!(prompt.contains("## Feedback\ntighter scope please"));
    }

    #[test]
    fn test_compile_stop_pattern() {
        assert!(compile_stop_pattern(Some("DONE")).is_some());
        assert!(compile_stop_pattern(Some("(unclosed")).is_none());
        assert!(compile_stop_pattern(None).is_none());
    }
}
