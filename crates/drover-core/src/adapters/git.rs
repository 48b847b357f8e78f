//! Git adapter

use super::subprocess::{failure_text, run_with_timeout, GIT_TIMEOUT};
use super::Vcs;
use crate::error::{DroverError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct Git {
    /// Bound for calls that talk to the remote (fetch, push).
    network_timeout: Duration,
}

impl Git {
    pub fn new(network_timeout: Duration) -> Self {
        Self { network_timeout }
    }

    async fn run(&self, dir: &Path, args: &[&str], timeout: Duration) -> Result<String> {
        let description = format!("git {}", args.first().copied().unwrap_or(""));
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(dir).args(args);
        let output = run_with_timeout(cmd, timeout, &description).await?;
        if !output.status.success() {
            return Err(DroverError::Vcs(format!(
                "{description} in {}: {}",
                dir.display(),
                failure_text(&output)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Resolve a ref, `None` when it does not exist.
    async fn rev_parse(&self, dir: &Path, rev: &str) -> Result<Option<String>> {
        let mut cmd = Command::new("git");
        cmd.arg("-C")
            .arg(dir)
            .args(["rev-parse", "--verify", "--quiet", rev]);
        let output = run_with_timeout(cmd, GIT_TIMEOUT, "git rev-parse").await?;
        if !output.status.success() {
            return Ok(None);
        }
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!sha.is_empty()).then_some(sha))
    }
}

impl Default for Git {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

#[async_trait]
impl Vcs for Git {
    async fn fetch(&self, repo: &Path, remote: &str) -> Result<()> {
        self.run(repo, &["fetch", remote], self.network_timeout)
            .await
            .map(|_| ())
    }

    async fn ensure_worktree(
        &self,
        repo: &Path,
        worktree: &Path,
        branch: &str,
        base: &str,
    ) -> Result<()> {
        if worktree.exists() {
            return Ok(());
        }
        if let Some(parent) = worktree.parent() {
            crate::io::ensure_dir(parent)?;
        }
        let wt = worktree.to_string_lossy();
        let local = format!("refs/heads/{branch}");
        if self.rev_parse(repo, &local).await?.is_some() {
            self.run(repo, &["worktree", "add", &wt, branch], GIT_TIMEOUT)
                .await?;
        } else {
            self.run(repo, &["worktree", "add", "-b", branch, &wt, base], GIT_TIMEOUT)
                .await?;
        }
        tracing::debug!(worktree = %worktree.display(), branch, "worktree created");
        Ok(())
    }

    async fn remove_worktree(&self, repo: &Path, worktree: &Path) -> Result<()> {
        let wt = worktree.to_string_lossy();
        self.run(repo, &["worktree", "remove", "--force", &wt], GIT_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn prune_worktrees(&self, repo: &Path) -> Result<()> {
        self.run(repo, &["worktree", "prune"], GIT_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn commits_since(&self, workspace: &Path, base: &str) -> Result<Vec<String>> {
        let range = format!("{base}..HEAD");
        let out = self
            .run(workspace, &["log", "--oneline", &range], GIT_TIMEOUT)
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn status_short(&self, workspace: &Path) -> Result<String> {
        self.run(workspace, &["status", "--short"], GIT_TIMEOUT).await
    }

    async fn diff_stat(&self, workspace: &Path) -> Result<String> {
        self.run(workspace, &["diff", "--stat"], GIT_TIMEOUT).await
    }

    async fn is_published(&self, workspace: &Path, remote: &str, branch: &str) -> Result<bool> {
        let Some(head) = self.rev_parse(workspace, "HEAD").await? else {
            return Ok(false);
        };
        let tracking = format!("refs/remotes/{remote}/{branch}");
        Ok(self.rev_parse(workspace, &tracking).await?.as_deref() == Some(head.as_str()))
    }

    async fn push(&self, workspace: &Path, remote: &str, branch: &str) -> Result<()> {
        self.run(workspace, &["push", remote, branch], self.network_timeout)
            .await
            .map(|_| ())
    }
}
