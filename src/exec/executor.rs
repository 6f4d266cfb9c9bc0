//! Command executor contract and the per-instance FIFO queue.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{RalphdError, Result};

/// Exit code reported when a command is killed on timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Result of executing a command. `exec` never fails at the call level:
/// spawn failures, non-zero exits and timeouts are all encoded here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    /// A synthetic failure result for errors that happen before a process
    /// ever runs (spawn failure, executor shut down).
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: message.into(),
            exit_code: -1,
        }
    }
}

/// Options for a single command execution.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Working directory for the command
    pub cwd: Option<PathBuf>,
    /// Kill the command after this long
    pub timeout: Option<Duration>,
}

impl ExecOptions {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(dir.into()),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Transport behind a [`CommandExecutor`]: local subprocess or SSH.
#[async_trait]
pub trait ExecTransport: Send + Sync {
    async fn exec(&self, command: &str, args: &[String], options: &ExecOptions) -> ExecResult;
    async fn file_exists(&self, path: &Path) -> bool;
    async fn directory_exists(&self, path: &Path) -> bool;
    async fn read_file(&self, path: &Path) -> Result<String>;
    async fn list_directory(&self, path: &Path) -> Result<Vec<String>>;
    async fn write_file(&self, path: &Path, contents: &str) -> Result<()>;
}

/// Run a prepared command, encoding spawn failure and timeout into the
/// result. Shared by both transports.
pub(crate) async fn run_command(mut cmd: tokio::process::Command, timeout: Option<Duration>) -> ExecResult {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output_fut = cmd.output();
    let output = match timeout {
        Some(limit) => match tokio::time::timeout(limit, output_fut).await {
            Ok(result) => result,
            Err(_) => {
                // The child is killed when the dropped future releases it.
                return ExecResult {
                    success: false,
                    stdout: String::new(),
                    stderr: format!("command timed out after {}ms", limit.as_millis()),
                    exit_code: TIMEOUT_EXIT_CODE,
                };
            }
        },
        None => output_fut.await,
    };

    match output {
        Ok(out) => ExecResult {
            success: out.status.success(),
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
            exit_code: out.status.code().unwrap_or(-1),
        },
        Err(e) => ExecResult::failure(format!("failed to spawn command: {e}")),
    }
}

enum Job {
    Exec {
        command: String,
        args: Vec<String>,
        options: ExecOptions,
        reply: oneshot::Sender<ExecResult>,
    },
    FileExists {
        path: PathBuf,
        reply: oneshot::Sender<bool>,
    },
    DirectoryExists {
        path: PathBuf,
        reply: oneshot::Sender<bool>,
    },
    ReadFile {
        path: PathBuf,
        reply: oneshot::Sender<Result<String>>,
    },
    ListDirectory {
        path: PathBuf,
        reply: oneshot::Sender<Result<Vec<String>>>,
    },
    WriteFile {
        path: PathBuf,
        contents: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Serialized command executor: a single-consumer queue in front of a
/// transport. Jobs are processed strictly in submission order, one at a time.
pub struct CommandExecutor {
    tx: mpsc::UnboundedSender<Job>,
}

impl CommandExecutor {
    /// Create an executor over the given transport and start its worker.
    pub fn new(transport: Arc<dyn ExecTransport>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker(rx, transport));
        Self { tx }
    }

    /// Executor over the local host.
    pub fn local() -> Self {
        Self::new(Arc::new(super::local::LocalTransport))
    }

    /// Executor over SSH.
    pub fn ssh(config: super::ssh::SshConfig) -> Self {
        Self::new(Arc::new(super::ssh::SshTransport::new(config)))
    }

    /// Execute a command. Never fails: all failures are in the result.
    pub async fn exec(&self, command: &str, args: &[&str], options: ExecOptions) -> ExecResult {
        let (reply, rx) = oneshot::channel();
        let job = Job::Exec {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            options,
            reply,
        };
        if self.tx.send(job).is_err() {
            return ExecResult::failure("executor is shut down");
        }
        rx.await.unwrap_or_else(|_| ExecResult::failure("executor worker dropped the job"))
    }

    pub async fn file_exists(&self, path: &Path) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(Job::FileExists {
                path: path.to_path_buf(),
                reply,
            })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn directory_exists(&self, path: &Path) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(Job::DirectoryExists {
                path: path.to_path_buf(),
                reply,
            })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn read_file(&self, path: &Path) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Job::ReadFile {
                path: path.to_path_buf(),
                reply,
            })
            .map_err(|_| RalphdError::execution("executor is shut down", ""))?;
        rx.await
            .map_err(|_| RalphdError::execution("executor worker dropped the job", ""))?
    }

    pub async fn list_directory(&self, path: &Path) -> Result<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Job::ListDirectory {
                path: path.to_path_buf(),
                reply,
            })
            .map_err(|_| RalphdError::execution("executor is shut down", ""))?;
        rx.await
            .map_err(|_| RalphdError::execution("executor worker dropped the job", ""))?
    }

    pub async fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Job::WriteFile {
                path: path.to_path_buf(),
                contents: contents.to_string(),
                reply,
            })
            .map_err(|_| RalphdError::execution("executor is shut down", ""))?;
        rx.await
            .map_err(|_| RalphdError::execution("executor worker dropped the job", ""))?
    }
}

async fn worker(mut rx: mpsc::UnboundedReceiver<Job>, transport: Arc<dyn ExecTransport>) {
    while let Some(job) = rx.recv().await {
        match job {
            Job::Exec {
                command,
                args,
                options,
                reply,
            } => {
                debug!(command = %command, args = ?args, "executing command");
                let result = transport.exec(&command, &args, &options).await;
                let _ = reply.send(result);
            }
            Job::FileExists { path, reply } => {
                let _ = reply.send(transport.file_exists(&path).await);
            }
            Job::DirectoryExists { path, reply } => {
                let _ = reply.send(transport.directory_exists(&path).await);
            }
            Job::ReadFile { path, reply } => {
                let _ = reply.send(transport.read_file(&path).await);
            }
            Job::ListDirectory { path, reply } => {
                let _ = reply.send(transport.list_directory(&path).await);
            }
            Job::WriteFile { path, contents, reply } => {
                let _ = reply.send(transport.write_file(&path, &contents).await);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Transport that records concurrency and call order.
    struct ProbeTransport {
        in_flight: AtomicBool,
        overlapped: AtomicBool,
        calls: std::sync::Mutex<Vec<String>>,
        completed: AtomicU32,
    }

    impl ProbeTransport {
        fn new() -> Self {
            Self {
                in_flight: AtomicBool::new(false),
                overlapped: AtomicBool::new(false),
                calls: std::sync::Mutex::new(Vec::new()),
                completed: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ExecTransport for ProbeTransport {
        async fn exec(&self, command: &str, _args: &[String], _options: &ExecOptions) -> ExecResult {
            if self.in_flight.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            self.calls.lock().unwrap().push(command.to_string());
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.store(false, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);
            ExecResult {
                success: true,
                stdout: command.to_string(),
                stderr: String::new(),
                exit_code: 0,
            }
        }

        async fn file_exists(&self, _path: &Path) -> bool {
            false
        }

        async fn directory_exists(&self, _path: &Path) -> bool {
            false
        }

        async fn read_file(&self, _path: &Path) -> Result<String> {
            Ok(String::new())
        }

        async fn list_directory(&self, _path: &Path) -> Result<Vec<String>> {
            Ok(vec![])
        }

        async fn write_file(&self, _path: &Path, _contents: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_commands_are_strictly_serialized() {
        let transport = Arc::new(ProbeTransport::new());
        let executor = Arc::new(CommandExecutor::new(transport.clone()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let executor = executor.clone();
            handles.push(tokio::spawn(async move {
                executor.exec(&format!("cmd-{i}"), &[], ExecOptions::default()).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().success);
        }

        assert!(!transport.overlapped.load(Ordering::SeqCst), "two commands ran concurrently");
        assert_eq!(transport.completed.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_fifo_order_within_one_submitter() {
        let transport = Arc::new(ProbeTransport::new());
        let executor = CommandExecutor::new(transport.clone());

        // Fire-and-forget submissions from one task must execute in order.
        let mut replies = Vec::new();
        for i in 0..5 {
            let (reply, rx) = oneshot::channel();
            executor
                .tx
                .send(Job::Exec {
                    command: format!("step-{i}"),
                    args: vec![],
                    options: ExecOptions::default(),
                    reply,
                })
                .unwrap();
            replies.push(rx);
        }
        for rx in replies {
            rx.await.unwrap();
        }

        let calls = transport.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["step-0", "step-1", "step-2", "step-3", "step-4"]);
    }

    #[tokio::test]
    async fn test_exec_result_failure_shape() {
        let result = ExecResult::failure("boom");
        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
        assert_eq!(result.stderr, "boom");
    }
}
