//! Orchestrator: the lifecycle state machine and operation surface.
//!
//! Every mutation of a loop record goes through here (or through the driver,
//! which shares the same internals). Events are emitted only after a
//! successful persist, so subscribers never observe a state that could later
//! roll back.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::conflict::ConflictResolver;
use super::driver::Driver;
use super::settings::OrchestratorSettings;
use crate::backend::{BackendAdapter, ModelInfo};
use crate::domain::loop_record::{
    DEFAULT_BRANCH_PREFIX, DEFAULT_MAX_CONSECUTIVE_ERRORS, DEFAULT_ACTIVITY_TIMEOUT_SECS,
    MIN_ACTIVITY_TIMEOUT_SECS,
};
use crate::domain::{
    GitState, LogLevel, Loop, LoopConfig, LoopEvent, LoopMode, LoopStatus, ModelRef,
};
use crate::error::{ConflictCode, RalphdError, Result};
use crate::events::{EventBus, Subscription};
use crate::exec::CommandExecutor;
use crate::git::GitService;
use crate::id::{generate_loop_id, slugify};
use crate::store::LoopStore;

/// Creates the per-loop command executor. Each loop's worktree (or SSH
/// connection) owns its own executor, so command queues are never shared
/// across loops.
pub trait ExecutorFactory: Send + Sync {
    fn create(&self, config: &LoopConfig) -> Arc<CommandExecutor>;
}

/// Default factory: local subprocesses.
pub struct LocalExecutorFactory;

impl ExecutorFactory for LocalExecutorFactory {
    fn create(&self, _config: &LoopConfig) -> Arc<CommandExecutor> {
        Arc::new(CommandExecutor::local())
    }
}

/// Input for `create_loop`.
#[derive(Debug, Clone)]
pub struct NewLoop {
    pub directory: PathBuf,
    pub workspace: String,
    pub prompt: String,
    pub model: ModelRef,
    pub max_iterations: Option<u32>,
    pub max_consecutive_errors: Option<u32>,
    pub activity_timeout_secs: Option<u64>,
    pub stop_pattern: Option<String>,
    pub base_branch: Option<String>,
    pub branch_prefix: Option<String>,
    pub commit_scope: Option<String>,
    pub clear_planning_folder: bool,
    pub plan_mode: bool,
    /// Create as a fully mutable draft instead of starting immediately
    pub draft: bool,
}

impl NewLoop {
    pub fn new(
        directory: impl Into<PathBuf>,
        workspace: impl Into<String>,
        prompt: impl Into<String>,
        model: ModelRef,
    ) -> Self {
        Self {
            directory: directory.into(),
            workspace: workspace.into(),
            prompt: prompt.into(),
            model,
            max_iterations: None,
            max_consecutive_errors: None,
            activity_timeout_secs: None,
            stop_pattern: None,
            base_branch: None,
            branch_prefix: None,
            commit_scope: None,
            clear_planning_folder: false,
            plan_mode: false,
            draft: false,
        }
    }
}

/// Input for `create_chat`.
#[derive(Debug, Clone)]
pub struct NewChat {
    pub directory: PathBuf,
    pub workspace: String,
    pub message: String,
    pub model: ModelRef,
    pub base_branch: Option<String>,
    pub branch_prefix: Option<String>,
}

impl NewChat {
    pub fn new(
        directory: impl Into<PathBuf>,
        workspace: impl Into<String>,
        message: impl Into<String>,
        model: ModelRef,
    ) -> Self {
        Self {
            directory: directory.into(),
            workspace: workspace.into(),
            message: message.into(),
            model,
            base_branch: None,
            branch_prefix: None,
        }
    }
}

/// Partial config update. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ConfigPatch {
    pub prompt: Option<String>,
    pub model: Option<ModelRef>,
    pub max_iterations: Option<Option<u32>>,
    pub max_consecutive_errors: Option<u32>,
    pub activity_timeout_secs: Option<u64>,
    pub stop_pattern: Option<Option<String>>,
    pub base_branch: Option<Option<String>>,
}

/// Pending values for `set_pending` / `inject_pending`.
#[derive(Debug, Clone, Default)]
pub struct PendingUpdate {
    pub message: Option<String>,
    pub model: Option<ModelRef>,
}

/// Branch synchronization state reported by push/update operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    AlreadyUpToDate,
    Clean,
    ConflictsBeingResolved,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::AlreadyUpToDate => "already_up_to_date",
            SyncStatus::Clean => "clean",
            SyncStatus::ConflictsBeingResolved => "conflicts_being_resolved",
        }
    }
}

/// Result of `push_loop` / `update_branch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReport {
    pub remote_ref: String,
    pub sync_status: SyncStatus,
}

/// Per-loop driver control handles.
pub(crate) struct DriverSignals {
    /// Ends the driver and aborts any in-flight backend call
    pub stop: CancellationToken,
    /// Aborts the in-flight backend call only; the driver starts the next
    /// iteration immediately
    pub abort_iteration: Notify,
}

impl DriverSignals {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            stop: CancellationToken::new(),
            abort_iteration: Notify::new(),
        })
    }
}

struct LoopTask {
    signals: Arc<DriverSignals>,
    handle: JoinHandle<()>,
}

/// State shared between the orchestrator surface, drivers, and the conflict
/// resolver.
pub(crate) struct EngineShared {
    pub(crate) store: Arc<dyn LoopStore>,
    pub(crate) backend: Arc<dyn BackendAdapter>,
    pub(crate) bus: EventBus,
    pub(crate) settings: OrchestratorSettings,
    executor_factory: Box<dyn ExecutorFactory>,
    /// One executor per loop, shared by the driver and lifecycle operations
    executors: Mutex<HashMap<String, Arc<CommandExecutor>>>,
    /// Running driver/resolver tasks, keyed by loop id; owned here, never a
    /// module-level singleton
    tasks: Mutex<HashMap<String, LoopTask>>,
}

impl EngineShared {
    pub(crate) fn load(&self, id: &str) -> Result<Loop> {
        self.store
            .get(id)?
            .ok_or_else(|| RalphdError::LoopNotFound(id.to_string()))
    }

    pub(crate) fn executor_for(&self, record: &Loop) -> Arc<CommandExecutor> {
        let mut executors = self.executors.lock().expect("executor table poisoned");
        executors
            .entry(record.id.clone())
            .or_insert_with(|| self.executor_factory.create(&record.config))
            .clone()
    }

    pub(crate) fn git_for(&self, record: &Loop) -> GitService {
        GitService::new(self.executor_for(record))
    }

    /// Transition a loop's status, persist, then emit. The single mutation
    /// path for status changes.
    pub(crate) fn set_status(&self, record: &mut Loop, new: LoopStatus) -> Result<()> {
        let old = record.state.status;
        if old == new {
            self.store.update(record)?;
            return Ok(());
        }
        record.state.status = new;
        self.store.update(record)?;
        info!(loop_id = %record.id, old = %old, new = %new, "status change");
        self.bus.emit(LoopEvent::status_changed(&record.id, old, new));
        Ok(())
    }

    /// Remove the worktree and delete the working branch, exactly once: the
    /// git sub-state is taken so a second call finds nothing to clean.
    pub(crate) async fn cleanup_git(&self, record: &mut Loop) -> Result<()> {
        let Some(git_state) = record.state.git.take() else {
            return Ok(());
        };
        let git = self.git_for(record);
        git.remove_worktree(&record.config.directory, &git_state.worktree_path)
            .await?;
        git.delete_branch(&record.config.directory, &git_state.working_branch)
            .await?;
        Ok(())
    }

    pub(crate) fn signals_for(&self, id: &str) -> Option<Arc<DriverSignals>> {
        let tasks = self.tasks.lock().expect("task table poisoned");
        tasks.get(id).map(|t| t.signals.clone())
    }

    fn driver_alive(&self, id: &str) -> bool {
        let tasks = self.tasks.lock().expect("task table poisoned");
        tasks.get(id).is_some_and(|t| !t.handle.is_finished())
    }

    /// Cancel and forget the loop's task entry, if any.
    fn cancel_task(&self, id: &str) {
        let removed = {
            let mut tasks = self.tasks.lock().expect("task table poisoned");
            tasks.remove(id)
        };
        if let Some(task) = removed {
            task.signals.stop.cancel();
        }
    }

    /// Drop the driver's own entry at exit, unless a newer task replaced it.
    pub(crate) fn forget_task_if(&self, id: &str, signals: &Arc<DriverSignals>) {
        let mut tasks = self.tasks.lock().expect("task table poisoned");
        if let Some(task) = tasks.get(id)
            && Arc::ptr_eq(&task.signals, signals)
        {
            tasks.remove(id);
        }
    }

    fn release_loop(&self, id: &str) {
        self.cancel_task(id);
        self.executors.lock().expect("executor table poisoned").remove(id);
    }

    pub(crate) fn worktree_path(&self, config: &LoopConfig, key: &str) -> PathBuf {
        match &self.settings.worktree_root {
            Some(root) => root.join(key),
            None => config.directory.join(".ralphd").join("worktrees").join(key),
        }
    }
}

/// The loop orchestration engine.
pub struct Orchestrator {
    shared: Arc<EngineShared>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn LoopStore>,
        backend: Arc<dyn BackendAdapter>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self::with_executor_factory(store, backend, settings, Box::new(LocalExecutorFactory))
    }

    pub fn with_executor_factory(
        store: Arc<dyn LoopStore>,
        backend: Arc<dyn BackendAdapter>,
        settings: OrchestratorSettings,
        executor_factory: Box<dyn ExecutorFactory>,
    ) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                store,
                backend,
                bus: EventBus::new(),
                settings,
                executor_factory,
                executors: Mutex::new(HashMap::new()),
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to the event stream, optionally filtered to one loop.
    pub fn subscribe(&self, filter: Option<String>) -> Subscription {
        self.shared.bus.subscribe(filter)
    }

    pub fn bus(&self) -> &EventBus {
        &self.shared.bus
    }

    pub async fn get_loop(&self, id: &str) -> Result<Loop> {
        self.shared.load(id)
    }

    pub async fn list_loops(&self) -> Result<Vec<Loop>> {
        self.shared.store.list()
    }

    /// Models available for a directory, straight from the backend.
    pub async fn get_models(&self, directory: &Path) -> Result<Vec<ModelInfo>> {
        self.shared.backend.get_models(directory).await
    }

    //=== Creation and starting ===

    /// Create a loop. Non-draft loops start immediately: the concurrency
    /// guard runs, a worktree and branch are materialized, and the driver
    /// spawns. A start failure deletes the just-created record rather than
    /// leaving an un-startable loop behind.
    pub async fn create_loop(&self, new: NewLoop) -> Result<Loop> {
        let config = build_config(&new)?;
        let record = Loop::new(generate_loop_id(), config);
        let draft = new.draft;
        let plan_mode = new.plan_mode;

        self.shared.store.create(&record)?;
        self.shared
            .bus
            .emit(LoopEvent::loop_created(&record.id, &record.display_name()));

        if draft {
            return Ok(record);
        }

        match self.start_internal(record.clone(), plan_mode).await {
            Ok(started) => Ok(started),
            Err(e) => {
                warn!(loop_id = %record.id, error = %e, "start failed; deleting orphaned record");
                self.compensate_failed_start(&record.id).await;
                Err(e)
            }
        }
    }

    /// Create a chat-mode loop and run its first turn.
    pub async fn create_chat(&self, new: NewChat) -> Result<Loop> {
        let config = build_config(&NewLoop {
            directory: new.directory,
            workspace: new.workspace,
            prompt: new.message,
            model: new.model,
            max_iterations: None,
            max_consecutive_errors: None,
            activity_timeout_secs: None,
            stop_pattern: None,
            base_branch: new.base_branch,
            branch_prefix: new.branch_prefix,
            commit_scope: None,
            clear_planning_folder: false,
            plan_mode: false,
            draft: false,
        })?;
        let mut config = config;
        config.mode = LoopMode::Chat;

        let record = Loop::new(generate_loop_id(), config);
        self.shared.store.create(&record)?;
        self.shared
            .bus
            .emit(LoopEvent::loop_created(&record.id, &record.display_name()));

        match self.start_internal(record.clone(), false).await {
            Ok(started) => Ok(started),
            Err(e) => {
                self.compensate_failed_start(&record.id).await;
                Err(e)
            }
        }
    }

    /// Start an existing draft, with the same guard and transitions as a
    /// non-draft create.
    pub async fn start_draft(&self, id: &str, plan_mode: bool) -> Result<Loop> {
        let record = self.shared.load(id)?;
        if record.state.status != LoopStatus::Draft {
            return Err(RalphdError::conflict(
                ConflictCode::NotDraft,
                format!("loop {} is {}, not a draft", id, record.state.status),
            ));
        }
        match self.start_internal(record, plan_mode).await {
            Ok(started) => Ok(started),
            Err(e) => {
                // Leave the draft usable instead of deleting it.
                if let Ok(mut current) = self.shared.load(id) {
                    let _ = self.shared.cleanup_git(&mut current).await;
                    current.state.status = LoopStatus::Draft;
                    let _ = self.shared.store.update(&current);
                }
                Err(e)
            }
        }
    }

    async fn start_internal(&self, mut record: Loop, plan_mode: bool) -> Result<Loop> {
        self.guard_no_active_loop(&record.config.directory, &record.config.workspace, &record.id)?;

        record.config.plan_mode = plan_mode;
        self.shared.set_status(&mut record, LoopStatus::Starting)?;

        let git = self.shared.git_for(&record);
        let directory = record.config.directory.clone();

        let base_branch = match &record.config.base_branch {
            Some(branch) => branch.clone(),
            None => git.default_branch(&directory).await?,
        };

        let slug = slugify(&record.config.prompt, 40);
        let mut working_branch = format!("{}/{}", record.config.branch_prefix, slug);
        if git.branch_exists(&directory, &working_branch).await? {
            let suffix = record.id.split('-').next_back().unwrap_or("0");
            working_branch = format!("{working_branch}-{suffix}");
        }

        let worktree_path = self.shared.worktree_path(&record.config, &record.id);
        git.add_worktree(&directory, &worktree_path, &working_branch, &base_branch)
            .await?;

        record.state.git = Some(GitState {
            worktree_path,
            working_branch,
            original_branch: base_branch,
        });

        self.shared.backend.connect(&record.config).await?;

        let next = if plan_mode { LoopStatus::Planning } else { LoopStatus::Running };
        self.shared.set_status(&mut record, next)?;
        self.spawn_driver(&record.id);
        Ok(record)
    }

    async fn compensate_failed_start(&self, id: &str) {
        if let Ok(mut current) = self.shared.load(id) {
            if let Err(e) = self.shared.cleanup_git(&mut current).await {
                warn!(loop_id = %id, error = %e, "cleanup after failed start");
            }
        }
        self.shared.release_loop(id);
        if let Err(e) = self.shared.store.delete(id) {
            warn!(loop_id = %id, error = %e, "compensating delete failed");
        } else {
            self.shared.bus.emit(LoopEvent::loop_removed(id));
        }
    }

    /// The invariant this whole design protects: at most one active loop per
    /// (directory, workspace). Draft creation and mutation are exempt.
    fn guard_no_active_loop(&self, directory: &Path, workspace: &str, exclude: &str) -> Result<()> {
        for record in self.shared.store.list()? {
            if record.id != exclude
                && record.config.directory == directory
                && record.config.workspace == workspace
                && record.state.status.is_active()
            {
                return Err(RalphdError::active_loop_exists(&record.id, &record.display_name()));
            }
        }
        Ok(())
    }

    fn spawn_driver(&self, id: &str) {
        let signals = DriverSignals::new();
        let driver = Driver::new(self.shared.clone(), id.to_string(), signals.clone());
        let handle = tokio::spawn(driver.run());
        let mut tasks = self.shared.tasks.lock().expect("task table poisoned");
        if let Some(previous) = tasks.insert(
            id.to_string(),
            LoopTask {
                signals,
                handle,
            },
        ) {
            // A replaced task must not keep an in-flight backend call alive.
            if !previous.handle.is_finished() {
                previous.signals.stop.cancel();
            }
        }
    }

    //=== Stopping and lifecycle exits ===

    /// Stop a running or waiting loop, cancelling the in-flight backend call.
    pub async fn stop_loop(&self, id: &str) -> Result<Loop> {
        let mut record = self.shared.load(id)?;
        if !matches!(record.state.status, LoopStatus::Running | LoopStatus::Waiting) {
            return Err(RalphdError::conflict(
                ConflictCode::NotRunning,
                format!("loop {} is {}, not running or waiting", id, record.state.status),
            ));
        }
        self.shared.set_status(&mut record, LoopStatus::Stopped)?;
        self.shared.cancel_task(id);
        Ok(record)
    }

    /// Merge the working branch back into the original branch, delete the
    /// branch and worktree, and return the merge sha.
    pub async fn accept_loop(&self, id: &str) -> Result<String> {
        let mut record = self.shared.load(id)?;
        if !matches!(
            record.state.status,
            LoopStatus::Completed | LoopStatus::MaxIterations
        ) {
            return Err(RalphdError::conflict(
                ConflictCode::InvalidStatus,
                format!(
                    "loop {} is {}; only completed or max_iterations loops can be accepted",
                    id, record.state.status
                ),
            ));
        }
        let git_state = record
            .state
            .git
            .clone()
            .ok_or_else(|| RalphdError::Git(format!("loop {id} has no git state")))?;

        let git = self.shared.git_for(&record);
        let directory = record.config.directory.clone();

        // The worktree holds the working branch checked out; it has to go
        // before the merge can check the branch out in the main tree.
        git.remove_worktree(&directory, &git_state.worktree_path).await?;
        let merge_sha = git
            .merge_branch(&directory, &git_state.working_branch, &git_state.original_branch)
            .await?;
        git.delete_branch(&directory, &git_state.working_branch).await?;

        record.state.git = None;
        record.state.review.addressable = true;
        record
            .state
            .push_log(LogLevel::Info, format!("merged into {} at {}", git_state.original_branch, merge_sha));
        self.shared.set_status(&mut record, LoopStatus::Merged)?;

        if let Err(e) = self.shared.backend.disconnect(id).await {
            warn!(loop_id = %id, error = %e, "backend disconnect failed");
        }
        Ok(merge_sha)
    }

    /// Push the working branch to the remote with upstream tracking.
    pub async fn push_loop(&self, id: &str) -> Result<PushReport> {
        let mut record = self.shared.load(id)?;
        if !matches!(
            record.state.status,
            LoopStatus::Completed | LoopStatus::MaxIterations | LoopStatus::Pushed
        ) {
            return Err(RalphdError::conflict(
                ConflictCode::InvalidStatus,
                format!("loop {} is {}; nothing to push", id, record.state.status),
            ));
        }
        let git_state = record
            .state
            .git
            .clone()
            .ok_or_else(|| RalphdError::Git(format!("loop {id} has no git state")))?;

        let git = self.shared.git_for(&record);
        let outcome = git
            .push_branch(
                &git_state.worktree_path,
                &git_state.working_branch,
                &self.shared.settings.remote,
            )
            .await?;

        let sync_status = if outcome.already_up_to_date {
            SyncStatus::AlreadyUpToDate
        } else {
            SyncStatus::Clean
        };
        record.state.review.addressable = true;
        self.shared.set_status(&mut record, LoopStatus::Pushed)?;
        self.shared.bus.emit(LoopEvent::branch_pushed(
            id,
            &outcome.remote_ref,
            sync_status.as_str(),
        ));
        Ok(PushReport {
            remote_ref: outcome.remote_ref,
            sync_status,
        })
    }

    /// Merge the base branch into the working branch of a pushed loop. A
    /// clean merge re-pushes synchronously; conflicts hand off to the
    /// conflict-resolution sub-engine, which auto-pushes on success. The
    /// status stays `pushed` throughout.
    pub async fn update_branch(&self, id: &str) -> Result<PushReport> {
        let mut record = self.shared.load(id)?;
        if record.state.status != LoopStatus::Pushed {
            return Err(RalphdError::conflict(
                ConflictCode::InvalidStatus,
                format!("loop {} is {}; update_branch requires pushed", id, record.state.status),
            ));
        }
        let git_state = record
            .state
            .git
            .clone()
            .ok_or_else(|| RalphdError::Git(format!("loop {id} has no git state")))?;

        let git = self.shared.git_for(&record);
        let remote = self.shared.settings.remote.clone();
        let remote_ref = format!("{}/{}", remote, git_state.working_branch);

        // A missing remote is fine for local-only repositories.
        if let Err(e) = git.fetch(&git_state.worktree_path, &remote).await {
            warn!(loop_id = %id, error = %e, "fetch before sync failed");
        }

        use crate::git::MergeResult;
        match git
            .merge_current(&git_state.worktree_path, &git_state.original_branch)
            .await?
        {
            MergeResult::AlreadyUpToDate => {
                let report = PushReport {
                    remote_ref,
                    sync_status: SyncStatus::AlreadyUpToDate,
                };
                self.shared
                    .bus
                    .emit(LoopEvent::branch_sync(id, report.sync_status.as_str()));
                Ok(report)
            }
            MergeResult::Merged(sha) => {
                git.push_branch(&git_state.worktree_path, &git_state.working_branch, &remote)
                    .await?;
                record
                    .state
                    .push_log(LogLevel::Info, format!("synced {} at {}", git_state.original_branch, sha));
                self.shared.store.update(&record)?;
                self.shared.bus.emit(LoopEvent::branch_sync(id, SyncStatus::Clean.as_str()));
                Ok(PushReport {
                    remote_ref,
                    sync_status: SyncStatus::Clean,
                })
            }
            MergeResult::Conflicted => {
                record
                    .state
                    .push_log(LogLevel::Warn, "sync merge conflicted; resolving".to_string());
                self.shared.store.update(&record)?;
                self.shared
                    .bus
                    .emit(LoopEvent::branch_sync(id, SyncStatus::ConflictsBeingResolved.as_str()));
                self.spawn_conflict_resolution(&record, git_state.clone());
                Ok(PushReport {
                    remote_ref,
                    sync_status: SyncStatus::ConflictsBeingResolved,
                })
            }
        }
    }

    fn spawn_conflict_resolution(&self, record: &Loop, git_state: GitState) {
        let signals = DriverSignals::new();
        let shared = self.shared.clone();
        let loop_id = record.id.clone();
        let model = record.config.model.clone();
        let activity_timeout = record.config.activity_timeout();
        let cancel = signals.stop.clone();

        let handle = tokio::spawn(async move {
            let Ok(record) = shared.load(&loop_id) else {
                return;
            };
            let resolver = ConflictResolver::new(
                GitService::new(shared.executor_for(&record)),
                shared.backend.clone(),
                shared.bus.clone(),
                shared.settings.conflict_max_attempts,
                activity_timeout,
            );
            let outcome = resolver
                .resolve(
                    &loop_id,
                    &git_state.worktree_path,
                    &git_state.working_branch,
                    &git_state.original_branch,
                    &model,
                    &shared.settings.remote,
                    cancel,
                )
                .await;

            // Record the outcome; the status stays pushed either way.
            if let Ok(mut record) = shared.load(&loop_id) {
                match &outcome {
                    Ok(result) if result.resolved => {
                        record.state.push_log(
                            LogLevel::Info,
                            format!("sync conflicts resolved after {} attempt(s)", result.attempts),
                        );
                    }
                    Ok(result) => {
                        record.state.push_log(
                            LogLevel::Warn,
                            format!("sync conflicts unresolved after {} attempt(s); merge aborted", result.attempts),
                        );
                    }
                    Err(e) => {
                        record
                            .state
                            .push_log(LogLevel::Error, format!("conflict resolution failed: {e}"));
                    }
                }
                if shared.store.update(&record).is_ok()
                    && matches!(&outcome, Ok(result) if result.resolved)
                {
                    shared
                        .bus
                        .emit(LoopEvent::branch_sync(&loop_id, SyncStatus::Clean.as_str()));
                }
            }
        });

        let mut tasks = self.shared.tasks.lock().expect("task table poisoned");
        if let Some(previous) = tasks.insert(record.id.clone(), LoopTask { signals, handle }) {
            if !previous.handle.is_finished() {
                previous.signals.stop.cancel();
            }
        }
    }

    /// Discard a loop: stop the driver, delete branch and worktree, mark
    /// deleted. Idempotent when already deleted.
    pub async fn discard_loop(&self, id: &str) -> Result<Loop> {
        let mut record = self.shared.load(id)?;
        if record.state.status == LoopStatus::Deleted {
            return Ok(record);
        }
        self.shared.cancel_task(id);
        self.shared.cleanup_git(&mut record).await?;
        if let Err(e) = self.shared.backend.disconnect(id).await {
            warn!(loop_id = %id, error = %e, "backend disconnect failed");
        }
        self.shared.set_status(&mut record, LoopStatus::Deleted)?;
        Ok(record)
    }

    /// Remove the record itself. Only merged, pushed or deleted loops are
    /// purge-eligible; a pushed loop's branch and worktree are cleaned here
    /// so nothing is left dangling.
    pub async fn purge_loop(&self, id: &str) -> Result<()> {
        let mut record = self.shared.load(id)?;
        if !record.state.status.is_purge_eligible() {
            return Err(RalphdError::conflict(
                ConflictCode::InvalidStatus,
                format!(
                    "loop {} is {}; only merged, pushed or deleted loops can be purged",
                    id, record.state.status
                ),
            ));
        }
        self.shared.cancel_task(id);
        self.shared.cleanup_git(&mut record).await?;
        if let Err(e) = self.shared.backend.disconnect(id).await {
            warn!(loop_id = %id, error = %e, "backend disconnect failed");
        }
        self.shared.release_loop(id);
        self.shared.store.delete(id)?;
        self.shared.bus.emit(LoopEvent::loop_removed(id));
        Ok(())
    }

    /// Bookkeeping for a branch merged outside the orchestrator: clean up
    /// and disconnect. Each loop owns its own worktree, so no checkout or
    /// pull of a shared tree is involved.
    pub async fn mark_merged(&self, id: &str) -> Result<Loop> {
        let mut record = self.shared.load(id)?;
        if !matches!(
            record.state.status,
            LoopStatus::Pushed
                | LoopStatus::Merged
                | LoopStatus::Completed
                | LoopStatus::MaxIterations
                | LoopStatus::Deleted
        ) {
            return Err(RalphdError::conflict(
                ConflictCode::InvalidStatus,
                format!("loop {} is {}; cannot mark merged", id, record.state.status),
            ));
        }
        if record.state.status == LoopStatus::Deleted {
            return Ok(record);
        }
        self.shared.cancel_task(id);
        self.shared.cleanup_git(&mut record).await?;
        if let Err(e) = self.shared.backend.disconnect(id).await {
            warn!(loop_id = %id, error = %e, "backend disconnect failed");
        }
        self.shared.set_status(&mut record, LoopStatus::Deleted)?;
        Ok(record)
    }

    //=== Pending values ===

    /// Queue a prompt override for the next natural iteration.
    pub async fn set_pending_prompt(&self, id: &str, prompt: impl Into<String>) -> Result<()> {
        let mut record = self.active_loop(id)?;
        record.state.pending_prompt = Some(prompt.into());
        self.shared.store.update(&record)?;
        Ok(())
    }

    pub async fn clear_pending_prompt(&self, id: &str) -> Result<()> {
        let mut record = self.active_loop(id)?;
        record.state.pending_prompt = None;
        self.shared.store.update(&record)?;
        Ok(())
    }

    /// Queue message/model values for the next natural iteration; the
    /// in-flight iteration is untouched.
    pub async fn set_pending(&self, id: &str, update: PendingUpdate) -> Result<()> {
        let mut record = self.active_loop(id)?;
        apply_pending(&mut record, update);
        self.shared.store.update(&record)?;
        Ok(())
    }

    /// Apply pending values immediately: abort the in-flight backend call
    /// and start a new iteration with the injected values.
    pub async fn inject_pending(&self, id: &str, update: PendingUpdate) -> Result<()> {
        let mut record = self.active_loop(id)?;
        apply_pending(&mut record, update);
        self.shared.store.update(&record)?;
        self.wake_or_spawn(id);
        Ok(())
    }

    /// Remove queued values without side effects.
    pub async fn clear_pending(&self, id: &str) -> Result<()> {
        let mut record = self.active_loop(id)?;
        record.state.pending_message = None;
        record.state.pending_model = None;
        self.shared.store.update(&record)?;
        Ok(())
    }

    fn active_loop(&self, id: &str) -> Result<Loop> {
        let record = self.shared.load(id)?;
        if !record.state.status.is_active() {
            return Err(RalphdError::conflict(
                ConflictCode::InvalidStatus,
                format!(
                    "loop {} is {}; pending values require an active loop",
                    id, record.state.status
                ),
            ));
        }
        Ok(record)
    }

    /// Abort the in-flight iteration of a live driver, or spawn a fresh one
    /// for a loop whose driver has exited (e.g. a waiting chat).
    fn wake_or_spawn(&self, id: &str) {
        if self.shared.driver_alive(id) {
            if let Some(signals) = self.shared.signals_for(id) {
                signals.abort_iteration.notify_one();
            }
        } else {
            self.spawn_driver(id);
        }
    }

    //=== Config updates ===

    /// Explicit config update. Drafts are fully mutable; once the worktree
    /// exists the base branch is immutable.
    pub async fn update_loop_config(&self, id: &str, patch: ConfigPatch) -> Result<Loop> {
        let mut record = self.shared.load(id)?;

        if let Some(base_branch) = &patch.base_branch {
            let started = record.state.git.is_some();
            let changes = *base_branch != record.config.base_branch;
            if started && changes {
                return Err(RalphdError::conflict(
                    ConflictCode::BaseBranchImmutable,
                    "base branch cannot change after the worktree exists",
                ));
            }
            record.config.base_branch = base_branch.clone();
        }
        if let Some(prompt) = patch.prompt {
            if prompt.trim().is_empty() {
                return Err(RalphdError::Validation("prompt cannot be empty".into()));
            }
            record.config.prompt = prompt;
        }
        if let Some(model) = patch.model {
            record.config.model = model;
        }
        if let Some(max_iterations) = patch.max_iterations {
            record.config.max_iterations = max_iterations;
        }
        if let Some(max_consecutive_errors) = patch.max_consecutive_errors {
            record.config.max_consecutive_errors = max_consecutive_errors;
        }
        if let Some(activity_timeout_secs) = patch.activity_timeout_secs {
            record.config.activity_timeout_secs = activity_timeout_secs.max(MIN_ACTIVITY_TIMEOUT_SECS);
        }
        if let Some(stop_pattern) = patch.stop_pattern {
            record.config.stop_pattern = stop_pattern;
        }
        self.shared.store.update(&record)?;
        Ok(record)
    }

    //=== Plan mode ===

    /// Fold feedback into the plan: aborts an in-flight generation round or
    /// starts a fresh one if the driver is idle.
    pub async fn send_plan_feedback(&self, id: &str, feedback: impl Into<String>) -> Result<()> {
        let mut record = self.shared.load(id)?;
        if record.state.status != LoopStatus::Planning {
            return Err(RalphdError::conflict(
                ConflictCode::NotPlanning,
                format!("loop {} is {}, not planning", id, record.state.status),
            ));
        }
        record.state.feedback_rounds += 1;
        record.state.pending_message = Some(feedback.into());
        self.shared.store.update(&record)?;
        self.wake_or_spawn(id);
        Ok(())
    }

    /// Approve the plan: planning moves to running and iterations begin.
    pub async fn accept_plan(&self, id: &str) -> Result<Loop> {
        let mut record = self.shared.load(id)?;
        if record.state.status != LoopStatus::Planning {
            return Err(RalphdError::conflict(
                ConflictCode::NotPlanning,
                format!("loop {} is {}, not planning", id, record.state.status),
            ));
        }
        if record.state.plan.as_deref().map(str::trim).unwrap_or("").is_empty() {
            return Err(RalphdError::conflict(
                ConflictCode::PlanNotReady,
                "no plan has been generated yet",
            ));
        }
        self.shared.set_status(&mut record, LoopStatus::Running)?;
        self.spawn_driver(id);
        Ok(record)
    }

    /// Throw the plan and the loop away.
    pub async fn discard_plan(&self, id: &str) -> Result<Loop> {
        let record = self.shared.load(id)?;
        if record.state.status != LoopStatus::Planning {
            return Err(RalphdError::conflict(
                ConflictCode::NotPlanning,
                format!("loop {} is {}, not planning", id, record.state.status),
            ));
        }
        self.discard_loop(id).await
    }

    //=== Review cycles ===

    /// Restart a pushed/merged loop to address review comments on a fresh
    /// review branch, with the comments folded into the next iteration.
    pub async fn address_review_comments(&self, id: &str, comments: Vec<String>) -> Result<Loop> {
        let mut record = self.shared.load(id)?;
        if !matches!(record.state.status, LoopStatus::Pushed | LoopStatus::Merged) {
            return Err(RalphdError::conflict(
                ConflictCode::InvalidStatus,
                format!(
                    "loop {} is {}; review comments apply to pushed or merged loops",
                    id, record.state.status
                ),
            ));
        }
        if !record.state.review.addressable {
            return Err(RalphdError::conflict(
                ConflictCode::InvalidStatus,
                format!("loop {id} is not addressable for review"),
            ));
        }
        self.guard_no_active_loop(&record.config.directory, &record.config.workspace, id)?;

        let git = self.shared.git_for(&record);
        let directory = record.config.directory.clone();
        let cycle = record.state.review.review_cycle + 1;

        let review_branch = match record.state.git.clone() {
            Some(git_state) => {
                // Pushed: the worktree is still alive; branch off in place.
                let review_branch = format!("{}-rev{}", git_state.working_branch, cycle);
                git.checkout_new_branch(&git_state.worktree_path, &review_branch)
                    .await?;
                if let Some(state) = record.state.git.as_mut() {
                    state.working_branch = review_branch.clone();
                }
                review_branch
            }
            None => {
                // Merged: the worktree was cleaned up; allocate a fresh one.
                let base_branch = match &record.config.base_branch {
                    Some(branch) => branch.clone(),
                    None => git.default_branch(&directory).await?,
                };
                let slug = slugify(&record.config.prompt, 40);
                let review_branch =
                    format!("{}/{}-rev{}", record.config.branch_prefix, slug, cycle);
                let worktree_path = self
                    .shared
                    .worktree_path(&record.config, &format!("{}-rev{}", record.id, cycle));
                git.add_worktree(&directory, &worktree_path, &review_branch, &base_branch)
                    .await?;
                record.state.git = Some(GitState {
                    worktree_path,
                    working_branch: review_branch.clone(),
                    original_branch: base_branch,
                });
                review_branch
            }
        };

        record.state.review.review_cycle = cycle;
        record.state.review.branches.push(review_branch);
        record.state.pending_message = Some(format!(
            "Address the following review comments:\n{}",
            comments.join("\n")
        ));

        self.shared.backend.connect(&record.config).await?;
        self.shared.set_status(&mut record, LoopStatus::Running)?;
        self.spawn_driver(id);
        Ok(record)
    }

    //=== Chat ===

    /// Send a message to a chat loop. Aborts an in-flight turn and starts a
    /// new one; the driver enforces exactly one turn per invocation.
    pub async fn send_chat_message(&self, id: &str, text: impl Into<String>) -> Result<()> {
        let mut record = self.shared.load(id)?;
        if record.config.mode != LoopMode::Chat {
            return Err(RalphdError::Validation(format!("loop {id} is not a chat loop")));
        }
        if !record.state.status.is_active() {
            return Err(RalphdError::conflict(
                ConflictCode::InvalidStatus,
                format!("loop {} is {}; the chat has ended", id, record.state.status),
            ));
        }
        record.state.pending_message = Some(text.into());
        if record.state.status != LoopStatus::Running {
            self.shared.set_status(&mut record, LoopStatus::Running)?;
        } else {
            self.shared.store.update(&record)?;
        }
        self.wake_or_spawn(id);
        Ok(())
    }
}

fn apply_pending(record: &mut Loop, update: PendingUpdate) {
    if let Some(message) = update.message {
        record.state.pending_message = Some(message);
    }
    if let Some(model) = update.model {
        record.state.pending_model = Some(model);
    }
}

fn build_config(new: &NewLoop) -> Result<LoopConfig> {
    if !new.directory.is_absolute() {
        return Err(RalphdError::Validation(format!(
            "directory must be absolute: {}",
            new.directory.display()
        )));
    }
    if new.prompt.trim().is_empty() {
        return Err(RalphdError::Validation("prompt cannot be empty".into()));
    }
    if let Some(pattern) = &new.stop_pattern {
        regex::Regex::new(pattern)
            .map_err(|e| RalphdError::Validation(format!("invalid stop pattern: {e}")))?;
    }
    Ok(LoopConfig {
        directory: new.directory.clone(),
        workspace: new.workspace.clone(),
        prompt: new.prompt.clone(),
        model: new.model.clone(),
        max_iterations: new.max_iterations,
        max_consecutive_errors: new
            .max_consecutive_errors
            .unwrap_or(DEFAULT_MAX_CONSECUTIVE_ERRORS),
        activity_timeout_secs: new
            .activity_timeout_secs
            .unwrap_or(DEFAULT_ACTIVITY_TIMEOUT_SECS)
            .max(MIN_ACTIVITY_TIMEOUT_SECS),
        stop_pattern: new.stop_pattern.clone(),
        base_branch: new.base_branch.clone(),
        branch_prefix: new
            .branch_prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_BRANCH_PREFIX.to_string()),
        commit_scope: new.commit_scope.clone(),
        clear_planning_folder: new.clear_planning_folder,
        plan_mode: new.plan_mode,
        mode: LoopMode::Loop,
        created_at: crate::id::now_ms(),
    })
}
