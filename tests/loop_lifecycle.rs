//! End-to-end lifecycle tests: orchestrator + driver against real git
//! repositories and a scripted backend.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ralphd::backend::{
    BackendAdapter, BackendEvent, IterationRequest, ModelInfo, ScriptedBackend, ScriptedIteration,
};
use ralphd::domain::{LoopConfig, LoopStatus, ModelRef, event_types};
use ralphd::error::{ConflictCode, RalphdError};
use ralphd::orchestrator::{NewChat, NewLoop, Orchestrator, OrchestratorSettings, PendingUpdate, SyncStatus};
use ralphd::store::{LoopStore, MemoryLoopStore};

async fn run_git(dir: &Path, args: &[&str]) {
    let out = tokio::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .unwrap();
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
}

/// A repo on branch main with one commit and a bare origin remote.
async fn setup_repo() -> (TempDir, PathBuf) {
    let temp = TempDir::new().unwrap();
    let origin = temp.path().join("origin.git");
    let repo = temp.path().join("repo");
    std::fs::create_dir(&origin).unwrap();
    std::fs::create_dir(&repo).unwrap();

    run_git(&origin, &["init", "--bare"]).await;
    run_git(&repo, &["init"]).await;
    run_git(&repo, &["config", "user.email", "test@test.com"]).await;
    run_git(&repo, &["config", "user.name", "Test"]).await;
    std::fs::write(repo.join("README.md"), "# Test\n").unwrap();
    run_git(&repo, &["add", "."]).await;
    run_git(&repo, &["commit", "-m", "Initial commit"]).await;
    run_git(&repo, &["branch", "-M", "main"]).await;
    run_git(&repo, &["remote", "add", "origin", origin.to_str().unwrap()]).await;
    run_git(&repo, &["push", "-u", "origin", "main"]).await;

    (temp, repo)
}

/// Backend that writes a file into the loop's worktree on every iteration
/// before delegating the event stream to a scripted backend, so driver
/// commits have something to commit.
struct WorktreeWritingBackend {
    repo: PathBuf,
    scripted: ScriptedBackend,
}

impl WorktreeWritingBackend {
    fn new(repo: PathBuf, scripted: ScriptedBackend) -> Self {
        Self { repo, scripted }
    }
}

#[async_trait]
impl BackendAdapter for WorktreeWritingBackend {
    async fn connect(&self, config: &LoopConfig) -> Result<(), RalphdError> {
        self.scripted.connect(config).await
    }

    async fn disconnect(&self, loop_id: &str) -> Result<(), RalphdError> {
        self.scripted.disconnect(loop_id).await
    }

    async fn get_models(&self, directory: &Path) -> Result<Vec<ModelInfo>, RalphdError> {
        self.scripted.get_models(directory).await
    }

    async fn run_iteration(
        &self,
        loop_id: &str,
        request: IterationRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<BackendEvent>, RalphdError> {
        let worktree = self.repo.join(".ralphd").join("worktrees").join(loop_id);
        if worktree.is_dir() {
            let n = self.scripted.prompts().len() + 1;
            std::fs::write(worktree.join(format!("iteration-{n}.txt")), "work\n")
                .map_err(|e| RalphdError::Backend(e.to_string()))?;
        }
        self.scripted.run_iteration(loop_id, request, cancel).await
    }
}

fn model() -> ModelRef {
    ModelRef::new("scripted", "scripted-1")
}

fn new_loop(repo: &Path, prompt: &str) -> NewLoop {
    NewLoop::new(repo, "default", prompt, model())
}

fn orchestrator(backend: Arc<dyn BackendAdapter>) -> (Orchestrator, Arc<MemoryLoopStore>) {
    let store = Arc::new(MemoryLoopStore::new());
    let orch = Orchestrator::new(store.clone(), backend, OrchestratorSettings::default());
    (orch, store)
}

async fn wait_for_status(orch: &Orchestrator, id: &str, status: LoopStatus) {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let record = orch.get_loop(id).await.unwrap();
        if record.state.status == status {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {status}; loop is {}",
            record.state.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_plan(orch: &Orchestrator, id: &str, check: impl Fn(Option<&str>) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let record = orch.get_loop(id).await.unwrap();
        if check(record.state.plan.as_deref()) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for plan");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Default scripted backend with a small per-event delay so continue-forever
/// loops do not spin hot.
fn paced_backend() -> ScriptedBackend {
    ScriptedBackend::new()
        .with_default(ScriptedIteration::continues().delayed(Duration::from_millis(10)))
}

#[tokio::test]
async fn test_active_loop_guard_blocks_second_loop_in_directory() {
    let (_temp, repo) = setup_repo().await;
    let backend = Arc::new(paced_backend());
    let (orch, _store) = orchestrator(backend);

    let a = orch.create_loop(new_loop(&repo, "loop a work")).await.unwrap();
    wait_for_status(&orch, &a.id, LoopStatus::Running).await;

    // Creating a second non-draft loop for the same directory conflicts,
    // naming the loop it collided with.
    let err = orch.create_loop(new_loop(&repo, "loop b work")).await.unwrap_err();
    match err {
        RalphdError::Conflict {
            code,
            conflicting_loop,
            ..
        } => {
            assert_eq!(code, ConflictCode::ActiveLoopExists);
            assert_eq!(conflicting_loop.as_deref(), Some(a.id.as_str()));
        }
        other => panic!("expected conflict, got {:?}", other),
    }

    // Draft creation is exempt from the guard.
    let mut draft = new_loop(&repo, "draft while a runs");
    draft.draft = true;
    let d = orch.create_loop(draft).await.unwrap();
    assert_eq!(d.state.status, LoopStatus::Draft);

    // After A stops, B can start.
    orch.stop_loop(&a.id).await.unwrap();
    let b = orch.create_loop(new_loop(&repo, "loop b work")).await.unwrap();
    wait_for_status(&orch, &b.id, LoopStatus::Running).await;
    orch.stop_loop(&b.id).await.unwrap();
}

#[tokio::test]
async fn test_max_iterations_transitions_exactly_after_cap() {
    let (_temp, repo) = setup_repo().await;
    let backend = Arc::new(paced_backend());
    let (orch, _store) = orchestrator(backend);

    let mut new = new_loop(&repo, "never finishes");
    new.max_iterations = Some(3);
    // A stop pattern that never matches.
    new.stop_pattern = Some("NEVER_EMITTED_MARKER".to_string());

    let record = orch.create_loop(new).await.unwrap();
    wait_for_status(&orch, &record.id, LoopStatus::MaxIterations).await;

    let record = orch.get_loop(&record.id).await.unwrap();
    assert_eq!(record.state.iteration_count, 3);
    assert_eq!(record.state.recent_iterations.len(), 3);
}

#[tokio::test]
async fn test_accept_loop_merges_and_cleans_up() {
    let (_temp, repo) = setup_repo().await;
    let scripted = ScriptedBackend::new();
    scripted.push(ScriptedIteration::continues());
    scripted.push(ScriptedIteration::continues());
    scripted.push(ScriptedIteration::completes());
    let backend = Arc::new(WorktreeWritingBackend::new(repo.clone(), scripted));
    let (orch, _store) = orchestrator(backend);

    let record = orch.create_loop(new_loop(&repo, "feature x")).await.unwrap();
    let git_state = record.state.git.clone().unwrap();
    assert!(git_state.working_branch.starts_with("ralph/"));
    assert_eq!(git_state.original_branch, "main");

    wait_for_status(&orch, &record.id, LoopStatus::Completed).await;

    let merge_sha = orch.accept_loop(&record.id).await.unwrap();
    assert_eq!(merge_sha.len(), 40);

    let record = orch.get_loop(&record.id).await.unwrap();
    assert_eq!(record.state.status, LoopStatus::Merged);
    assert!(record.state.git.is_none());

    // Work landed on main, branch and worktree are gone.
    assert!(repo.join("iteration-1.txt").exists());
    assert!(!git_state.worktree_path.exists());
    let out = tokio::process::Command::new("git")
        .args(["branch", "--list", &git_state.working_branch])
        .current_dir(&repo)
        .output()
        .await
        .unwrap();
    assert!(out.stdout.is_empty());

    // Accepting again fails: the loop is already merged.
    assert!(orch.accept_loop(&record.id).await.is_err());
}

#[tokio::test]
async fn test_stop_pattern_completes_loop() {
    let (_temp, repo) = setup_repo().await;
    let backend = ScriptedBackend::new()
        .with_default(ScriptedIteration::with_text("...RALPH_DONE..."));
    let (orch, _store) = orchestrator(Arc::new(backend));

    let mut new = new_loop(&repo, "finish when told");
    new.stop_pattern = Some("RALPH_DONE".to_string());
    let record = orch.create_loop(new).await.unwrap();

    wait_for_status(&orch, &record.id, LoopStatus::Completed).await;
    let record = orch.get_loop(&record.id).await.unwrap();
    assert_eq!(record.state.iteration_count, 1);
}

#[tokio::test]
async fn test_consecutive_errors_fail_the_loop() {
    let (_temp, repo) = setup_repo().await;
    let backend = ScriptedBackend::new().with_default(ScriptedIteration::errors("backend exploded"));
    let (orch, _store) = orchestrator(Arc::new(backend));

    let mut new = new_loop(&repo, "doomed");
    new.max_consecutive_errors = Some(2);
    let record = orch.create_loop(new).await.unwrap();

    wait_for_status(&orch, &record.id, LoopStatus::Failed).await;
    let record = orch.get_loop(&record.id).await.unwrap();
    assert_eq!(record.state.consecutive_errors, 2);
    assert!(record.state.last_error.as_deref().unwrap().contains("backend exploded"));
}

#[tokio::test]
async fn test_successful_iteration_resets_error_counter() {
    let (_temp, repo) = setup_repo().await;
    let scripted = ScriptedBackend::new();
    scripted.push(ScriptedIteration::errors("hiccup"));
    scripted.push(ScriptedIteration::continues());
    scripted.push(ScriptedIteration::errors("hiccup"));
    scripted.push(ScriptedIteration::completes());
    let (orch, _store) = orchestrator(Arc::new(scripted));

    let mut new = new_loop(&repo, "bumpy road");
    new.max_consecutive_errors = Some(2);
    let record = orch.create_loop(new).await.unwrap();

    // Two errors split by a success never cross the threshold of 2.
    wait_for_status(&orch, &record.id, LoopStatus::Completed).await;
    let record = orch.get_loop(&record.id).await.unwrap();
    assert_eq!(record.state.iteration_count, 4);
    assert_eq!(record.state.consecutive_errors, 0);
}

#[tokio::test]
async fn test_discard_loop_is_idempotent_and_cleans_up() {
    let (_temp, repo) = setup_repo().await;
    let backend = Arc::new(paced_backend());
    let (orch, _store) = orchestrator(backend);

    let record = orch.create_loop(new_loop(&repo, "to discard")).await.unwrap();
    wait_for_status(&orch, &record.id, LoopStatus::Running).await;
    let worktree = record.state.git.clone().unwrap().worktree_path;

    let discarded = orch.discard_loop(&record.id).await.unwrap();
    assert_eq!(discarded.state.status, LoopStatus::Deleted);
    assert!(!worktree.exists());

    // Discarding again is a no-op, never an error.
    let again = orch.discard_loop(&record.id).await.unwrap();
    assert_eq!(again.state.status, LoopStatus::Deleted);
}

#[tokio::test]
async fn test_set_pending_waits_inject_pending_aborts() {
    let (_temp, repo) = setup_repo().await;
    let scripted = ScriptedBackend::new();
    scripted.push(ScriptedIteration::hangs());
    scripted.push(ScriptedIteration::hangs());
    let backend = Arc::new(scripted);
    let (orch, _store) = orchestrator(backend.clone());

    let record = orch.create_loop(new_loop(&repo, "interactive")).await.unwrap();
    let backend_ref = backend.clone();
    wait_until("first iteration in flight", || backend_ref.prompts().len() == 1).await;

    // set_pending leaves the in-flight iteration untouched.
    orch.set_pending(
        &record.id,
        PendingUpdate {
            message: Some("queued note".to_string()),
            model: None,
        },
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.prompts().len(), 1, "set_pending must not abort the iteration");

    // inject_pending aborts it and starts a fresh iteration with the
    // injected values within one scheduling step.
    orch.inject_pending(
        &record.id,
        PendingUpdate {
            message: None,
            model: Some(ModelRef::new("scripted", "scripted-2")),
        },
    )
    .await
    .unwrap();
    let backend_ref = backend.clone();
    wait_until("second iteration starts", || backend_ref.prompts().len() == 2).await;

    // The restarted iteration consumed the queued message alongside the
    // injected model.
    let prompts = backend.prompts();
    assert!(prompts[1].contains("queued note"));

    // Pendings are cleared by the iteration that consumed them.
    let record = orch.get_loop(&record.id).await.unwrap();
    assert!(record.state.pending_message.is_none());
    assert!(record.state.pending_model.is_none());

    orch.stop_loop(&record.id).await.unwrap();
}

#[tokio::test]
async fn test_stop_loop_cancels_in_flight_call() {
    let (_temp, repo) = setup_repo().await;
    let scripted = ScriptedBackend::new();
    scripted.push(ScriptedIteration::hangs());
    let backend = Arc::new(scripted);
    let (orch, _store) = orchestrator(backend.clone());

    let record = orch.create_loop(new_loop(&repo, "hang then stop")).await.unwrap();
    let backend_ref = backend.clone();
    wait_until("iteration in flight", || backend_ref.prompts().len() == 1).await;

    let stopped = orch.stop_loop(&record.id).await.unwrap();
    assert_eq!(stopped.state.status, LoopStatus::Stopped);

    let backend_ref = backend.clone();
    wait_until("backend call cancelled", || backend_ref.cancellation_count() >= 1).await;

    // Stopping a stopped loop is a conflict.
    let err = orch.stop_loop(&record.id).await.unwrap_err();
    assert!(matches!(
        err,
        RalphdError::Conflict {
            code: ConflictCode::NotRunning,
            ..
        }
    ));
}

#[tokio::test]
async fn test_draft_start_and_not_draft_conflict() {
    let (_temp, repo) = setup_repo().await;
    let backend = Arc::new(paced_backend());
    let (orch, _store) = orchestrator(backend);

    let mut new = new_loop(&repo, "draft first");
    new.draft = true;
    let record = orch.create_loop(new).await.unwrap();
    assert_eq!(record.state.status, LoopStatus::Draft);
    assert!(record.state.git.is_none());

    let started = orch.start_draft(&record.id, false).await.unwrap();
    assert_eq!(started.state.status, LoopStatus::Running);
    assert!(started.state.git.is_some());

    let err = orch.start_draft(&record.id, false).await.unwrap_err();
    assert!(matches!(
        err,
        RalphdError::Conflict {
            code: ConflictCode::NotDraft,
            ..
        }
    ));
    orch.stop_loop(&record.id).await.unwrap();
}

#[tokio::test]
async fn test_plan_mode_feedback_accept_flow() {
    let (_temp, repo) = setup_repo().await;
    let scripted = ScriptedBackend::new();
    scripted.push(ScriptedIteration::with_text("the plan: do X then Y"));
    scripted.push(ScriptedIteration::with_text("revised plan: only Y"));
    scripted.push(ScriptedIteration::completes());
    let backend = Arc::new(scripted);
    let (orch, _store) = orchestrator(backend.clone());

    let mut new = new_loop(&repo, "plan this work");
    new.plan_mode = true;
    let record = orch.create_loop(new).await.unwrap();
    assert_eq!(
        orch.get_loop(&record.id).await.unwrap().state.status,
        LoopStatus::Planning
    );

    wait_for_plan(&orch, &record.id, |plan| plan.is_some()).await;

    orch.send_plan_feedback(&record.id, "too broad, cut scope").await.unwrap();
    let backend_ref = backend.clone();
    wait_until("feedback round ran", || backend_ref.prompts().len() == 2).await;
    wait_for_plan(&orch, &record.id, |plan| plan == Some("revised plan: only Y")).await;
    assert!(backend.prompts()[1].contains("too broad, cut scope"));

    let accepted = orch.accept_plan(&record.id).await.unwrap();
    assert_eq!(accepted.state.status, LoopStatus::Running);
    wait_for_status(&orch, &record.id, LoopStatus::Completed).await;

    // The execution prompt carries the approved plan.
    assert!(backend.prompts()[2].contains("revised plan: only Y"));
}

#[tokio::test]
async fn test_accept_plan_before_plan_exists_conflicts() {
    let (_temp, repo) = setup_repo().await;
    let scripted = ScriptedBackend::new();
    scripted.push(ScriptedIteration::hangs());
    let backend = Arc::new(scripted);
    let (orch, _store) = orchestrator(backend.clone());

    let mut new = new_loop(&repo, "slow plan");
    new.plan_mode = true;
    let record = orch.create_loop(new).await.unwrap();
    let backend_ref = backend.clone();
    wait_until("plan round in flight", || backend_ref.prompts().len() == 1).await;

    let err = orch.accept_plan(&record.id).await.unwrap_err();
    assert!(matches!(
        err,
        RalphdError::Conflict {
            code: ConflictCode::PlanNotReady,
            ..
        }
    ));

    let discarded = orch.discard_plan(&record.id).await.unwrap();
    assert_eq!(discarded.state.status, LoopStatus::Deleted);
}

#[tokio::test]
async fn test_push_and_update_branch_sync_statuses() {
    let (_temp, repo) = setup_repo().await;
    let scripted = ScriptedBackend::new();
    scripted.push(ScriptedIteration::completes());
    let backend = Arc::new(WorktreeWritingBackend::new(repo.clone(), scripted));
    let (orch, _store) = orchestrator(backend);

    let record = orch.create_loop(new_loop(&repo, "push me")).await.unwrap();
    wait_for_status(&orch, &record.id, LoopStatus::Completed).await;

    let report = orch.push_loop(&record.id).await.unwrap();
    assert_eq!(report.sync_status, SyncStatus::Clean);
    let branch = orch
        .get_loop(&record.id)
        .await
        .unwrap()
        .state
        .git
        .unwrap()
        .working_branch;
    assert_eq!(report.remote_ref, format!("origin/{branch}"));
    assert_eq!(
        orch.get_loop(&record.id).await.unwrap().state.status,
        LoopStatus::Pushed
    );

    // Pushing again with nothing new reports already up to date.
    let report = orch.push_loop(&record.id).await.unwrap();
    assert_eq!(report.sync_status, SyncStatus::AlreadyUpToDate);

    // Base has not moved: sync reports already up to date.
    let report = orch.update_branch(&record.id).await.unwrap();
    assert_eq!(report.sync_status, SyncStatus::AlreadyUpToDate);

    // Advance main without touching the loop's files, then sync cleanly.
    run_git(&repo, &["checkout", "main"]).await;
    std::fs::write(repo.join("other.txt"), "independent\n").unwrap();
    run_git(&repo, &["add", "."]).await;
    run_git(&repo, &["commit", "-m", "feat: unrelated mainline work"]).await;

    let report = orch.update_branch(&record.id).await.unwrap();
    assert_eq!(report.sync_status, SyncStatus::Clean);
    assert_eq!(
        orch.get_loop(&record.id).await.unwrap().state.status,
        LoopStatus::Pushed
    );
}

#[tokio::test]
async fn test_update_branch_requires_pushed() {
    let (_temp, repo) = setup_repo().await;
    let scripted = ScriptedBackend::new();
    scripted.push(ScriptedIteration::completes());
    let backend = Arc::new(scripted);
    let (orch, _store) = orchestrator(backend);

    let record = orch.create_loop(new_loop(&repo, "not pushed")).await.unwrap();
    wait_for_status(&orch, &record.id, LoopStatus::Completed).await;

    let err = orch.update_branch(&record.id).await.unwrap_err();
    assert!(matches!(
        err,
        RalphdError::Conflict {
            code: ConflictCode::InvalidStatus,
            ..
        }
    ));
}

#[tokio::test]
async fn test_purge_requires_eligible_status() {
    let (_temp, repo) = setup_repo().await;
    let scripted = ScriptedBackend::new();
    scripted.push(ScriptedIteration::completes());
    let backend = Arc::new(scripted);
    let (orch, store) = orchestrator(backend);

    let record = orch.create_loop(new_loop(&repo, "purge path")).await.unwrap();
    wait_for_status(&orch, &record.id, LoopStatus::Completed).await;

    // Completed is not purge-eligible.
    let err = orch.purge_loop(&record.id).await.unwrap_err();
    assert!(matches!(
        err,
        RalphdError::Conflict {
            code: ConflictCode::InvalidStatus,
            ..
        }
    ));

    orch.discard_loop(&record.id).await.unwrap();
    orch.purge_loop(&record.id).await.unwrap();
    assert!(store.get(&record.id).unwrap().is_none());

    // Purging an unknown loop is not found.
    assert!(matches!(
        orch.purge_loop(&record.id).await.unwrap_err(),
        RalphdError::LoopNotFound(_)
    ));
}

#[tokio::test]
async fn test_mark_merged_cleans_up_and_disconnects() {
    let (_temp, repo) = setup_repo().await;
    let scripted = ScriptedBackend::new();
    scripted.push(ScriptedIteration::completes());
    let backend = Arc::new(WorktreeWritingBackend::new(repo.clone(), scripted));
    let (orch, _store) = orchestrator(backend);

    let record = orch.create_loop(new_loop(&repo, "merged externally")).await.unwrap();
    wait_for_status(&orch, &record.id, LoopStatus::Completed).await;
    let worktree = record.state.git.clone().unwrap().worktree_path;

    let marked = orch.mark_merged(&record.id).await.unwrap();
    assert_eq!(marked.state.status, LoopStatus::Deleted);
    assert!(marked.state.git.is_none());
    assert!(!worktree.exists());
}

#[tokio::test]
async fn test_chat_runs_exactly_one_turn_per_message() {
    let (_temp, repo) = setup_repo().await;
    let backend = Arc::new(paced_backend());
    let (orch, _store) = orchestrator(backend.clone());

    let chat = orch
        .create_chat(NewChat::new(&repo, "default", "hello there", model()))
        .await
        .unwrap();

    // The first turn runs, then the chat waits; no autonomous continuation.
    wait_for_status(&orch, &chat.id, LoopStatus::Waiting).await;
    assert_eq!(backend.prompts().len(), 1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.prompts().len(), 1);

    orch.send_chat_message(&chat.id, "follow-up question").await.unwrap();
    let backend_ref = backend.clone();
    wait_until("second turn runs", || backend_ref.prompts().len() == 2).await;
    wait_for_status(&orch, &chat.id, LoopStatus::Waiting).await;
    let prompts = backend.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("follow-up question"));

    let record = orch.get_loop(&chat.id).await.unwrap();
    assert_eq!(record.state.iteration_count, 2);
}

#[tokio::test]
async fn test_review_cycle_restarts_merged_loop() {
    let (_temp, repo) = setup_repo().await;
    let scripted = ScriptedBackend::new();
    scripted.push(ScriptedIteration::completes());
    scripted.push(ScriptedIteration::completes());
    let backend = Arc::new(WorktreeWritingBackend::new(repo.clone(), scripted));
    let (orch, _store) = orchestrator(backend.clone());

    let record = orch.create_loop(new_loop(&repo, "feature y")).await.unwrap();
    wait_for_status(&orch, &record.id, LoopStatus::Completed).await;
    orch.accept_loop(&record.id).await.unwrap();

    let restarted = orch
        .address_review_comments(&record.id, vec!["rename the helper".to_string()])
        .await
        .unwrap();
    assert_eq!(restarted.state.status, LoopStatus::Running);
    assert_eq!(restarted.state.review.review_cycle, 1);
    let review_branch = restarted.state.git.clone().unwrap().working_branch;
    assert!(review_branch.ends_with("-rev1"));

    wait_for_status(&orch, &record.id, LoopStatus::Completed).await;
    let prompts = backend.scripted.prompts();
    assert!(prompts.last().unwrap().contains("rename the helper"));
}

#[tokio::test]
async fn test_events_follow_lifecycle() {
    let (_temp, repo) = setup_repo().await;
    let scripted = ScriptedBackend::new();
    scripted.push(ScriptedIteration::completes());
    let backend = Arc::new(scripted);
    let (orch, _store) = orchestrator(backend);

    let mut all = orch.subscribe(None);
    let record = orch.create_loop(new_loop(&repo, "observable")).await.unwrap();
    wait_for_status(&orch, &record.id, LoopStatus::Completed).await;

    let mut seen = Vec::new();
    while let Some(event) = all.try_recv() {
        seen.push(event.event_type);
    }
    assert!(seen.contains(&event_types::LOOP_CREATED.to_string()));
    assert!(seen.contains(&event_types::LOOP_STATUS_CHANGE.to_string()));
    assert!(seen.contains(&event_types::ITERATION_STARTED.to_string()));
    assert!(seen.contains(&event_types::ITERATION_COMPLETED.to_string()));
}

#[tokio::test]
async fn test_start_failure_compensates_by_deleting_record() {
    let temp = TempDir::new().unwrap();
    // Not a git repository: worktree creation fails after the record is
    // created, and the orphaned record is deleted.
    let not_a_repo = temp.path().join("empty");
    std::fs::create_dir(&not_a_repo).unwrap();

    let backend = Arc::new(ScriptedBackend::new());
    let (orch, store) = orchestrator(backend);

    let err = orch.create_loop(new_loop(&not_a_repo, "doomed start")).await;
    assert!(err.is_err());
    assert!(store.list().unwrap().is_empty());
}

#[tokio::test]
async fn test_get_models_passthrough() {
    let (_temp, repo) = setup_repo().await;
    let backend = Arc::new(ScriptedBackend::new());
    let (orch, _store) = orchestrator(backend);

    let models = orch.get_models(&repo).await.unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].provider, "scripted");
}
