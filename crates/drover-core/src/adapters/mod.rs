//! External collaborators: the terminal session hosting worker processes and
//! the version control system holding their work.

mod git;
pub mod subprocess;
mod tmux;

pub use git::Git;
pub use tmux::TmuxSession;

#[cfg(any(test, feature = "test-support"))]
mod fake;
#[cfg(any(test, feature = "test-support"))]
pub use fake::{FakeSession, FakeVcs, SessionCall, VcsCall};

use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;

/// One multiplexer session with a window per worker.
#[async_trait]
pub trait SessionAdapter: Send + Sync {
    async fn session_exists(&self) -> Result<bool>;

    /// Create the session if it does not exist.
    async fn ensure_session(&self) -> Result<()>;

    /// Create a window if the session has none by that name.
    async fn ensure_window(&self, window: &str) -> Result<()>;

    /// Type a command line into the window and press Enter.
    async fn send_command(&self, window: &str, command: &str) -> Result<()>;

    /// Send Ctrl-C to the window's foreground process. A missing window has
    /// nothing to interrupt and is not an error.
    async fn interrupt(&self, window: &str) -> Result<()>;

    /// Whether a process matching `pattern` runs in the window. False when
    /// the window or the whole session is gone.
    async fn is_process_running(&self, window: &str, pattern: &str) -> Result<bool>;

    /// Tear down the whole session. Missing sessions are not an error.
    async fn kill_session(&self) -> Result<()>;
}

/// Version control operations on the repository and its worktrees.
#[async_trait]
pub trait Vcs: Send + Sync {
    async fn fetch(&self, repo: &Path, remote: &str) -> Result<()>;

    /// Create `worktree` on `branch`, branching from `base` when the branch
    /// does not exist yet. An existing worktree is left alone.
    async fn ensure_worktree(
        &self,
        repo: &Path,
        worktree: &Path,
        branch: &str,
        base: &str,
    ) -> Result<()>;

    async fn remove_worktree(&self, repo: &Path, worktree: &Path) -> Result<()>;

    async fn prune_worktrees(&self, repo: &Path) -> Result<()>;

    /// One-line summaries of commits on HEAD not reachable from `base`,
    /// most recent first.
    async fn commits_since(&self, workspace: &Path, base: &str) -> Result<Vec<String>>;

    async fn status_short(&self, workspace: &Path) -> Result<String>;

    async fn diff_stat(&self, workspace: &Path) -> Result<String>;

    /// Whether the remote-tracking ref for `branch` already points at HEAD.
    async fn is_published(&self, workspace: &Path, remote: &str, branch: &str) -> Result<bool>;

    async fn push(&self, workspace: &Path, remote: &str, branch: &str) -> Result<()>;
}
