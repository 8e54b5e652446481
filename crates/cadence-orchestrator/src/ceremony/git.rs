use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::process::Command;

/// Thin wrapper over the project's git working tree used by the ceremony
/// transaction: capture the pre-transaction head, auto-commit recorded
/// ceremonies, and hard-reset on rollback.
#[derive(Debug, Clone)]
pub struct GitStateManager {
    project_root: PathBuf,
    auto_commit: bool,
}

impl GitStateManager {
    pub fn new(project_root: &Path, auto_commit: bool) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            auto_commit,
        }
    }

    pub fn auto_commit_enabled(&self) -> bool {
        self.auto_commit
    }

    /// Current HEAD hash, or `None` when the root is not a repository or
    /// has no commits yet.
    pub async fn head(&self) -> Option<String> {
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&self.project_root)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let head = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!head.is_empty()).then_some(head)
    }

    pub async fn commit_all(&self, message: &str) -> anyhow::Result<()> {
        let add = Command::new("git")
            .args(["add", "-A"])
            .current_dir(&self.project_root)
            .output()
            .await
            .context("git add failed to spawn")?;
        if !add.status.success() {
            anyhow::bail!(
                "git add failed: {}",
                String::from_utf8_lossy(&add.stderr).trim()
            );
        }

        let commit = Command::new("git")
            .args(["commit", "-m", message])
            .current_dir(&self.project_root)
            .output()
            .await
            .context("git commit failed to spawn")?;
        if !commit.status.success() {
            anyhow::bail!(
                "git commit failed: {}",
                String::from_utf8_lossy(&commit.stderr).trim()
            );
        }
        Ok(())
    }

    pub async fn reset_hard(&self, head: &str) -> anyhow::Result<()> {
        let output = Command::new("git")
            .args(["reset", "--hard", head])
            .current_dir(&self.project_root)
            .output()
            .await
            .context("git reset failed to spawn")?;
        if !output.status.success() {
            anyhow::bail!(
                "git reset failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}
