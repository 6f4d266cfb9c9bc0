//! SSH transport.
//!
//! Commands are wrapped in a remote login shell (`bash -lc`) so the user's
//! profile is sourced, with the target directory entered inside the remote
//! shell. The `ssh` process itself always runs from a fixed root working
//! directory. Password auth goes through `sshpass -e` with the secret in the
//! `SSHPASS` environment variable, never on the command line. File helpers
//! are shell commands, so callers stay transport-agnostic.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use super::executor::{ExecOptions, ExecResult, ExecTransport, run_command};
use crate::error::{RalphdError, Result};

/// Connection settings for an SSH transport.
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    /// Password for `sshpass -e`; key auth is used when absent
    pub password: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    /// Fixed working directory for the ssh process itself
    pub root_dir: PathBuf,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: None,
            port: None,
            password: None,
            identity_file: None,
            connect_timeout_secs: 10,
            root_dir: PathBuf::from("/"),
        }
    }
}

/// Quote a string for a POSIX shell using single quotes.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Runs commands on a remote host over SSH.
pub struct SshTransport {
    config: SshConfig,
}

impl SshTransport {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn destination(&self) -> String {
        match &self.config.user {
            Some(user) => format!("{}@{}", user, self.config.host),
            None => self.config.host.clone(),
        }
    }

    /// Assemble the remote command string: quoted argv, with a `cd` into the
    /// target directory inside the remote shell when one is given.
    fn remote_command(&self, command: &str, args: &[String], cwd: Option<&Path>) -> String {
        let mut parts = vec![shell_quote(command)];
        parts.extend(args.iter().map(|a| shell_quote(a)));
        let joined = parts.join(" ");
        match cwd {
            Some(dir) => format!("cd {} && {}", shell_quote(&dir.to_string_lossy()), joined),
            None => joined,
        }
    }

    /// Build the local invocation: program, argv and extra environment.
    fn ssh_invocation(&self, remote: &str) -> (String, Vec<String>, Vec<(String, String)>) {
        let wrapped = format!("bash -lc {}", shell_quote(remote));

        let mut args = Vec::new();
        let mut envs = Vec::new();
        let program = if let Some(password) = &self.config.password {
            envs.push(("SSHPASS".to_string(), password.clone()));
            args.push("-e".to_string());
            args.push("ssh".to_string());
            "sshpass".to_string()
        } else {
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
            "ssh".to_string()
        };

        args.push("-o".to_string());
        args.push("StrictHostKeyChecking=accept-new".to_string());
        args.push("-o".to_string());
        args.push(format!("ConnectTimeout={}", self.config.connect_timeout_secs));
        if let Some(port) = self.config.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &self.config.identity_file {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().to_string());
        }
        args.push(self.destination());
        args.push(wrapped);

        (program, args, envs)
    }

    async fn run_remote(&self, remote: &str, options: &ExecOptions) -> ExecResult {
        let (program, args, envs) = self.ssh_invocation(remote);
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        for (key, value) in envs {
            cmd.env(key, value);
        }
        cmd.current_dir(&self.config.root_dir);
        run_command(cmd, options.timeout).await
    }

    async fn run_shell(&self, script: String) -> ExecResult {
        self.run_remote(&script, &ExecOptions::default()).await
    }
}

#[async_trait]
impl ExecTransport for SshTransport {
    async fn exec(&self, command: &str, args: &[String], options: &ExecOptions) -> ExecResult {
        let remote = self.remote_command(command, args, options.cwd.as_deref());
        self.run_remote(&remote, options).await
    }

    async fn file_exists(&self, path: &Path) -> bool {
        self.run_shell(format!("test -f {}", shell_quote(&path.to_string_lossy())))
            .await
            .success
    }

    async fn directory_exists(&self, path: &Path) -> bool {
        self.run_shell(format!("test -d {}", shell_quote(&path.to_string_lossy())))
            .await
            .success
    }

    async fn read_file(&self, path: &Path) -> Result<String> {
        let result = self
            .run_shell(format!("cat {}", shell_quote(&path.to_string_lossy())))
            .await;
        if result.success {
            Ok(result.stdout)
        } else {
            Err(RalphdError::execution(
                format!("failed to read {}", path.display()),
                result.stderr,
            ))
        }
    }

    async fn list_directory(&self, path: &Path) -> Result<Vec<String>> {
        let result = self
            .run_shell(format!("ls -1 {}", shell_quote(&path.to_string_lossy())))
            .await;
        if result.success {
            Ok(result.stdout.lines().map(|l| l.to_string()).collect())
        } else {
            Err(RalphdError::execution(
                format!("failed to list {}", path.display()),
                result.stderr,
            ))
        }
    }

    async fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        // Content travels base64-encoded so quoting can never mangle it.
        let encoded = BASE64.encode(contents.as_bytes());
        let quoted_path = shell_quote(&path.to_string_lossy());
        let script = format!("mkdir -p $(dirname {quoted_path}) && echo {encoded} | base64 -d > {quoted_path}");
        let result = self.run_shell(script).await;
        if result.success {
            Ok(())
        } else {
            Err(RalphdError::execution(
                format!("failed to write {}", path.display()),
                result.stderr,
            ))
        }
    }
}
