//! Local subprocess transport.

use std::path::Path;

use async_trait::async_trait;

use super::executor::{ExecOptions, ExecResult, ExecTransport, run_command};
use crate::error::{RalphdError, Result};

/// Runs commands directly on the host; file helpers use native I/O.
pub struct LocalTransport;

#[async_trait]
impl ExecTransport for LocalTransport {
    async fn exec(&self, command: &str, args: &[String], options: &ExecOptions) -> ExecResult {
        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args);
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        run_command(cmd, options.timeout).await
    }

    async fn file_exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false)
    }

    async fn directory_exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false)
    }

    async fn read_file(&self, path: &Path) -> Result<String> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RalphdError::execution(format!("failed to read {}", path.display()), e.to_string()))
    }

    async fn list_directory(&self, path: &Path) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(path)
            .await
            .map_err(|e| RalphdError::execution(format!("failed to list {}", path.display()), e.to_string()))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RalphdError::execution(format!("failed to list {}", path.display()), e.to_string()))?
        {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    async fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents)
            .await
            .map_err(|e| RalphdError::execution(format!("failed to write {}", path.display()), e.to_string()))
    }
}
