//! In-memory adapters for tests

use super::{SessionAdapter, Vcs};
use crate::error::{DroverError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// FakeSession
// ---------------------------------------------------------------------------

/// Recorded session call
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCall {
    EnsureSession,
    EnsureWindow { window: String },
    SendCommand { window: String, command: String },
    Interrupt { window: String },
    KillSession,
}

#[derive(Default)]
struct FakeSessionState {
    exists: bool,
    windows: HashSet<String>,
    running: HashMap<String, bool>,
    calls: Vec<SessionCall>,
    fail_send: bool,
}

#[derive(Clone, Default)]
pub struct FakeSession {
    inner: Arc<Mutex<FakeSessionState>>,
}

impl FakeSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<SessionCall> {
        lock(&self.inner).calls.clone()
    }

    /// Commands typed into a window, in order.
    pub fn commands(&self, window: &str) -> Vec<String> {
        lock(&self.inner)
            .calls
            .iter()
            .filter_map(|c| match c {
                SessionCall::SendCommand { window: w, command } if w == window => {
                    Some(command.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Session already up, with no worker windows yet.
    pub fn started() -> Self {
        let fake = Self::default();
        lock(&fake.inner).exists = true;
        fake
    }

    /// Script the agent state in a window. A running agent implies the
    /// window exists.
    pub fn set_running(&self, window: &str, running: bool) {
        let mut inner = lock(&self.inner);
        if running {
            inner.windows.insert(window.to_string());
        }
        inner.running.insert(window.to_string(), running);
    }

    /// Operator closed one window.
    pub fn close_window(&self, window: &str) {
        let mut inner = lock(&self.inner);
        inner.windows.remove(window);
        inner.running.remove(window);
    }

    /// Make every `send_command` fail until reset.
    pub fn set_fail_send(&self, fail: bool) {
        lock(&self.inner).fail_send = fail;
    }

    pub fn has_window(&self, window: &str) -> bool {
        lock(&self.inner).windows.contains(window)
    }
}

#[async_trait]
impl SessionAdapter for FakeSession {
    async fn session_exists(&self) -> Result<bool> {
        Ok(lock(&self.inner).exists)
    }

    async fn ensure_session(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.calls.push(SessionCall::EnsureSession);
        inner.exists = true;
        Ok(())
    }

    async fn ensure_window(&self, window: &str) -> Result<()> {
        let mut inner = lock(&self.inner);
        if !inner.exists {
            return Err(DroverError::Session(format!(
                "tmux new-window: can't find session for {window}"
            )));
        }
        inner.calls.push(SessionCall::EnsureWindow {
            window: window.to_string(),
        });
        inner.windows.insert(window.to_string());
        Ok(())
    }

    async fn send_command(&self, window: &str, command: &str) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.fail_send {
            return Err(DroverError::Session(format!("send to {window} refused")));
        }
        if !inner.windows.contains(window) {
            return Err(DroverError::Session(format!(
                "tmux send-keys: can't find window: {window}"
            )));
        }
        inner.calls.push(SessionCall::SendCommand {
            window: window.to_string(),
            command: command.to_string(),
        });
        inner.running.insert(window.to_string(), true);
        Ok(())
    }

    async fn interrupt(&self, window: &str) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.calls.push(SessionCall::Interrupt {
            window: window.to_string(),
        });
        if inner.windows.contains(window) {
            inner.running.insert(window.to_string(), false);
        }
        Ok(())
    }

    async fn is_process_running(&self, window: &str, _pattern: &str) -> Result<bool> {
        let inner = lock(&self.inner);
        if !inner.exists || !inner.windows.contains(window) {
            return Ok(false);
        }
        Ok(inner.running.get(window).copied().unwrap_or(false))
    }

    async fn kill_session(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.calls.push(SessionCall::KillSession);
        inner.exists = false;
        inner.windows.clear();
        inner.running.clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeVcs
// ---------------------------------------------------------------------------

/// Recorded vcs call
#[derive(Debug, Clone, PartialEq)]
pub enum VcsCall {
    Fetch { remote: String },
    EnsureWorktree { worktree: PathBuf, branch: String },
    RemoveWorktree { worktree: PathBuf },
    Prune,
    Push { workspace: PathBuf, branch: String },
}

#[derive(Default)]
struct FakeVcsState {
    commits: HashMap<PathBuf, Vec<String>>,
    status: HashMap<PathBuf, String>,
    published: HashSet<PathBuf>,
    worktrees: HashSet<PathBuf>,
    calls: Vec<VcsCall>,
    fail_push: bool,
}

#[derive(Clone, Default)]
pub struct FakeVcs {
    inner: Arc<Mutex<FakeVcsState>>,
}

impl FakeVcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<VcsCall> {
        lock(&self.inner).calls.clone()
    }

    pub fn pushes(&self) -> usize {
        lock(&self.inner)
            .calls
            .iter()
            .filter(|c| matches!(c, VcsCall::Push { .. }))
            .count()
    }

    /// Script the commits `commits_since` reports for a workspace.
    pub fn set_commits(&self, workspace: &Path, commits: &[&str]) {
        let mut inner = lock(&self.inner);
        inner.commits.insert(
            workspace.to_path_buf(),
            commits.iter().map(|c| c.to_string()).collect(),
        );
        // new commits make the branch unpublished again
        inner.published.remove(workspace);
    }

    pub fn set_status(&self, workspace: &Path, status: &str) {
        lock(&self.inner)
            .status
            .insert(workspace.to_path_buf(), status.to_string());
    }

    pub fn set_fail_push(&self, fail: bool) {
        lock(&self.inner).fail_push = fail;
    }

    pub fn worktrees(&self) -> Vec<PathBuf> {
        let mut wts: Vec<_> = lock(&self.inner).worktrees.iter().cloned().collect();
        wts.sort();
        wts
    }
}

#[async_trait]
impl Vcs for FakeVcs {
    async fn fetch(&self, _repo: &Path, remote: &str) -> Result<()> {
        lock(&self.inner).calls.push(VcsCall::Fetch {
            remote: remote.to_string(),
        });
        Ok(())
    }

    async fn ensure_worktree(
        &self,
        _repo: &Path,
        worktree: &Path,
        branch: &str,
        _base: &str,
    ) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.calls.push(VcsCall::EnsureWorktree {
            worktree: worktree.to_path_buf(),
            branch: branch.to_string(),
        });
        inner.worktrees.insert(worktree.to_path_buf());
        Ok(())
    }

    async fn remove_worktree(&self, _repo: &Path, worktree: &Path) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.calls.push(VcsCall::RemoveWorktree {
            worktree: worktree.to_path_buf(),
        });
        inner.worktrees.remove(worktree);
        Ok(())
    }

    async fn prune_worktrees(&self, _repo: &Path) -> Result<()> {
        lock(&self.inner).calls.push(VcsCall::Prune);
        Ok(())
    }

    async fn commits_since(&self, workspace: &Path, _base: &str) -> Result<Vec<String>> {
        Ok(lock(&self.inner)
            .commits
            .get(workspace)
            .cloned()
            .unwrap_or_default())
    }

    async fn status_short(&self, workspace: &Path) -> Result<String> {
        Ok(lock(&self.inner)
            .status
            .get(workspace)
            .cloned()
            .unwrap_or_default())
    }

    async fn diff_stat(&self, workspace: &Path) -> Result<String> {
        let inner = lock(&self.inner);
        Ok(match inner.status.get(workspace) {
            Some(s) if !s.is_empty() => format!(" {} files changed", s.lines().count()),
            _ => String::new(),
        })
    }

    async fn is_published(&self, workspace: &Path, _remote: &str, _branch: &str) -> Result<bool> {
        Ok(lock(&self.inner).published.contains(workspace))
    }

    async fn push(&self, workspace: &Path, _remote: &str, branch: &str) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.calls.push(VcsCall::Push {
            workspace: workspace.to_path_buf(),
            branch: branch.to_string(),
        });
        if inner.fail_push {
            return Err(DroverError::Vcs(format!("push {branch} rejected")));
        }
        inner.published.insert(workspace.to_path_buf());
        Ok(())
    }
}
