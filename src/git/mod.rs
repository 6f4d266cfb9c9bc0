//! Git operation layer
//!
//! All operations take an explicit directory and run through an injected
//! [`CommandExecutor`](crate::exec::CommandExecutor), so the same logic works
//! over local and SSH transports.

pub mod diff;
pub mod service;

pub use diff::{ChangeKind, Diff, DiffFile, FileChange};
pub use service::{BranchInfo, CommitInfo, GitService, MergeResult, PushOutcome};
