//! Git operations parameterized by directory, over an injected executor.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::diff::{self, Diff, FileChange, split_content_diff};
use crate::error::{RalphdError, Result};
use crate::exec::{CommandExecutor, ExecOptions, ExecResult};

/// A branch as reported by `list_branches`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    pub name: String,
    pub is_current: bool,
}

/// Result of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub sha: String,
    pub files_changed: u32,
}

/// Result of merging into the currently checked-out branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    Merged(String),
    AlreadyUpToDate,
    Conflicted,
}

/// Result of pushing a branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    /// `{remote}/{branch}`
    pub remote_ref: String,
    pub already_up_to_date: bool,
}

/// Git operations against explicit directories. A conflicting merge surfaces
/// as a failed command result, never a silent resolution; `reset_hard` is
/// destructive and only ever called explicitly.
pub struct GitService {
    executor: Arc<CommandExecutor>,
}

impl GitService {
    pub fn new(executor: Arc<CommandExecutor>) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &Arc<CommandExecutor> {
        &self.executor
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> ExecResult {
        self.executor.exec("git", args, ExecOptions::in_dir(dir)).await
    }

    /// Run git, turning a failed result into an `Execution` error with
    /// stderr preserved. Returns trimmed stdout.
    async fn git_ok(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let result = self.git(dir, args).await;
        if result.success {
            Ok(result.stdout.trim().to_string())
        } else {
            Err(RalphdError::execution(
                format!("git {} failed in {}", args.join(" "), dir.display()),
                result.stderr,
            ))
        }
    }

    //=== Branches ===

    /// Create a branch at the current HEAD.
    pub async fn create_branch(&self, dir: &Path, name: &str) -> Result<()> {
        self.git_ok(dir, &["branch", name]).await.map(|_| ())
    }

    pub async fn checkout_branch(&self, dir: &Path, name: &str) -> Result<()> {
        self.git_ok(dir, &["checkout", name]).await.map(|_| ())
    }

    /// Create and check out a branch at the current HEAD.
    pub async fn checkout_new_branch(&self, dir: &Path, name: &str) -> Result<()> {
        self.git_ok(dir, &["checkout", "-b", name]).await.map(|_| ())
    }

    /// Force-delete a branch. Deleting a branch that is already gone is not
    /// an error.
    pub async fn delete_branch(&self, dir: &Path, name: &str) -> Result<()> {
        let result = self.git(dir, &["branch", "-D", name]).await;
        if !result.success && !result.stderr.contains("not found") {
            warn!(branch = name, stderr = %result.stderr, "branch deletion failed");
        }
        Ok(())
    }

    pub async fn branch_exists(&self, dir: &Path, name: &str) -> Result<bool> {
        let refname = format!("refs/heads/{name}");
        let result = self.git(dir, &["rev-parse", "--verify", "--quiet", &refname]).await;
        Ok(result.success)
    }

    /// All local branches, sorted, with the current branch flagged.
    pub async fn list_branches(&self, dir: &Path) -> Result<Vec<BranchInfo>> {
        let stdout = self.git_ok(dir, &["branch", "--list", "--no-color"]).await?;
        let mut branches: Vec<BranchInfo> = stdout
            .lines()
            .filter_map(|line| {
                let line = line.trim_end();
                if line.is_empty() {
                    return None;
                }
                let is_current = line.starts_with('*');
                let name = line.trim_start_matches('*').trim();
                // Skip detached-HEAD markers like "(HEAD detached at ...)"
                if name.starts_with('(') {
                    return None;
                }
                Some(BranchInfo {
                    name: name.to_string(),
                    is_current,
                })
            })
            .collect();
        branches.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(branches)
    }

    pub async fn current_branch(&self, dir: &Path) -> Result<String> {
        self.git_ok(dir, &["rev-parse", "--abbrev-ref", "HEAD"]).await
    }

    pub async fn head_sha(&self, dir: &Path) -> Result<String> {
        self.git_ok(dir, &["rev-parse", "HEAD"]).await
    }

    /// Detect the repository's default branch: the remote HEAD when one is
    /// configured, otherwise main/master, otherwise whatever is checked out.
    pub async fn default_branch(&self, dir: &Path) -> Result<String> {
        let result = self
            .git(dir, &["symbolic-ref", "--short", "refs/remotes/origin/HEAD"])
            .await;
        if result.success {
            let name = result.stdout.trim();
            if let Some(stripped) = name.strip_prefix("origin/") {
                return Ok(stripped.to_string());
            }
        }
        for candidate in ["main", "master"] {
            if self.branch_exists(dir, candidate).await? {
                return Ok(candidate.to_string());
            }
        }
        self.current_branch(dir).await
    }

    //=== Change detection ===

    pub async fn has_uncommitted_changes(&self, dir: &Path) -> Result<bool> {
        let stdout = self.git_ok(dir, &["status", "--porcelain"]).await?;
        Ok(!stdout.is_empty())
    }

    pub async fn changed_files(&self, dir: &Path) -> Result<Vec<FileChange>> {
        let stdout = self.git_ok(dir, &["status", "--porcelain"]).await?;
        Ok(diff::parse_porcelain_status(&stdout))
    }

    //=== Commits ===

    /// Stage everything and commit. A no-op commit is an explicit error, not
    /// a silent success.
    pub async fn commit(&self, dir: &Path, message: &str) -> Result<CommitInfo> {
        self.git_ok(dir, &["add", "-A"]).await?;

        // Exit 0 means the index matches HEAD: nothing staged.
        let staged = self.git(dir, &["diff", "--cached", "--quiet"]).await;
        if staged.success {
            return Err(RalphdError::Git(format!(
                "nothing to commit in {}",
                dir.display()
            )));
        }

        self.git_ok(dir, &["commit", "-m", message]).await?;
        let sha = self.head_sha(dir).await?;
        let files = self
            .git_ok(dir, &["diff-tree", "--no-commit-id", "--name-only", "-r", "HEAD"])
            .await?;
        let files_changed = files.lines().filter(|l| !l.is_empty()).count() as u32;
        debug!(sha = %sha, files_changed, "created commit");
        Ok(CommitInfo { sha, files_changed })
    }

    //=== Merging ===

    /// Merge `source` into `target`: checks out the target, merges with
    /// no-fast-forward and a synthesized message, returns the merge sha.
    /// A conflicting merge surfaces as a failed command result.
    pub async fn merge_branch(&self, dir: &Path, source: &str, target: &str) -> Result<String> {
        self.checkout_branch(dir, target).await?;
        let message = format!("Merge branch '{source}' into {target}");
        self.git_ok(dir, &["merge", "--no-ff", "-m", &message, source])
            .await?;
        self.head_sha(dir).await
    }

    /// Merge `source` into the currently checked-out branch, classifying the
    /// outcome. Conflicts are reported, never resolved here.
    pub async fn merge_current(&self, dir: &Path, source: &str) -> Result<MergeResult> {
        let message = format!("Merge branch '{source}'");
        let result = self.git(dir, &["merge", "--no-ff", "-m", &message, source]).await;
        if result.success {
            if result.stdout.contains("Already up to date") {
                return Ok(MergeResult::AlreadyUpToDate);
            }
            return Ok(MergeResult::Merged(self.head_sha(dir).await?));
        }
        if !self.conflicted_files(dir).await?.is_empty() {
            return Ok(MergeResult::Conflicted);
        }
        Err(RalphdError::execution(
            format!("git merge {source} failed in {}", dir.display()),
            result.stderr,
        ))
    }

    /// Files currently in a conflicted (unmerged) state.
    pub async fn conflicted_files(&self, dir: &Path) -> Result<Vec<String>> {
        let stdout = self
            .git_ok(dir, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(stdout.lines().filter(|l| !l.is_empty()).map(String::from).collect())
    }

    pub async fn merge_abort(&self, dir: &Path) -> Result<()> {
        self.git_ok(dir, &["merge", "--abort"]).await.map(|_| ())
    }

    /// True while a merge is waiting to be concluded.
    pub async fn merge_in_progress(&self, dir: &Path) -> Result<bool> {
        let result = self
            .git(dir, &["rev-parse", "--quiet", "--verify", "MERGE_HEAD"])
            .await;
        Ok(result.success)
    }

    /// Conclude an in-progress merge after conflicts were resolved: stage
    /// everything and commit with the merge's prepared message.
    pub async fn commit_merge(&self, dir: &Path) -> Result<String> {
        self.git_ok(dir, &["add", "-A"]).await?;
        self.git_ok(dir, &["commit", "--no-edit"]).await?;
        self.head_sha(dir).await
    }

    //=== Remote ===

    /// Check out and push a branch with upstream tracking.
    pub async fn push_branch(&self, dir: &Path, branch: &str, remote: &str) -> Result<PushOutcome> {
        self.checkout_branch(dir, branch).await?;
        let result = self.git(dir, &["push", "-u", remote, branch]).await;
        if !result.success {
            return Err(RalphdError::execution(
                format!("git push {remote} {branch} failed"),
                result.stderr,
            ));
        }
        // Git reports an up-to-date push on stderr.
        let already_up_to_date = result.stderr.contains("Everything up-to-date")
            || result.stdout.contains("Everything up-to-date");
        Ok(PushOutcome {
            remote_ref: format!("{remote}/{branch}"),
            already_up_to_date,
        })
    }

    pub async fn fetch(&self, dir: &Path, remote: &str) -> Result<()> {
        self.git_ok(dir, &["fetch", remote]).await.map(|_| ())
    }

    //=== Diffs ===

    /// Diff summary for a range (e.g. `main...HEAD`), or the working tree
    /// against HEAD when no range is given.
    pub async fn get_diff(&self, dir: &Path, range: Option<&str>) -> Result<Diff> {
        let mut numstat_args = vec!["diff", "--numstat"];
        let mut name_status_args = vec!["diff", "--name-status"];
        if let Some(range) = range {
            numstat_args.push(range);
            name_status_args.push(range);
        }
        let numstat = self.git_ok(dir, &numstat_args).await?;
        let name_status = self.git_ok(dir, &name_status_args).await?;
        Ok(diff::parse_numstat(&numstat, &name_status))
    }

    /// Like `get_diff`, with each file's unified diff content attached.
    pub async fn get_diff_with_content(&self, dir: &Path, range: Option<&str>) -> Result<Diff> {
        let mut parsed = self.get_diff(dir, range).await?;
        let mut diff_args = vec!["diff"];
        if let Some(range) = range {
            diff_args.push(range);
        }
        let unified = self.git_ok(dir, &diff_args).await?;
        let mut sections = split_content_diff(&unified);
        for file in &mut parsed.files {
            file.content = sections.remove(&file.path);
        }
        Ok(parsed)
    }

    //=== Destructive ===

    /// Hard reset plus untracked-file clean. Never called as a side effect
    /// of another operation.
    pub async fn reset_hard(&self, dir: &Path) -> Result<()> {
        self.git_ok(dir, &["reset", "--hard"]).await?;
        self.git_ok(dir, &["clean", "-fd"]).await?;
        Ok(())
    }

    //=== Worktrees ===

    /// Create a worktree at `path` on a new branch cut from `base`.
    pub async fn add_worktree(&self, repo_dir: &Path, path: &Path, branch: &str, base: &str) -> Result<()> {
        let path_str = path.to_string_lossy();
        self.git_ok(repo_dir, &["worktree", "add", &path_str, "-b", branch, base])
            .await
            .map(|_| ())
    }

    /// Remove a worktree, tolerating one that is already gone.
    pub async fn remove_worktree(&self, repo_dir: &Path, path: &Path) -> Result<()> {
        if !self.executor.directory_exists(path).await {
            // Still prune bookkeeping for an externally deleted checkout.
            let _ = self.git(repo_dir, &["worktree", "prune"]).await;
            return Ok(());
        }
        let path_str = path.to_string_lossy();
        self.git_ok(repo_dir, &["worktree", "remove", &path_str, "--force"])
            .await
            .map(|_| ())
    }

    pub async fn list_worktrees(&self, repo_dir: &Path) -> Result<Vec<String>> {
        let stdout = self.git_ok(repo_dir, &["worktree", "list", "--porcelain"]).await?;
        Ok(stdout
            .lines()
            .filter_map(|line| line.strip_prefix("worktree "))
            .map(String::from)
            .collect())
    }
}
