//! Tmux session adapter

use super::subprocess::{failure_text, run_with_timeout, TMUX_TIMEOUT};
use super::SessionAdapter;
use crate::error::{DroverError, Result};
use async_trait::async_trait;
use std::process::Output;
use tokio::process::Command;

/// Window created alongside a new session so it never starts empty.
const CONTROL_WINDOW: &str = "drover";

#[derive(Debug, Clone)]
pub struct TmuxSession {
    session: String,
}

impl TmuxSession {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
        }
    }

    fn target(&self, window: &str) -> String {
        format!("{}:{window}", self.session)
    }

    async fn window_names(&self) -> Result<Vec<String>> {
        let output = tmux_output(
            &["list-windows", "-t", &self.session, "-F", "#{window_name}"],
            "tmux list-windows",
        )
        .await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }

    /// False when the session or the window is gone (killed by an operator).
    async fn has_window(&self, window: &str) -> Result<bool> {
        if !self.session_exists().await? {
            return Ok(false);
        }
        Ok(self.window_names().await?.iter().any(|w| w == window))
    }
}

#[async_trait]
impl SessionAdapter for TmuxSession {
    async fn session_exists(&self) -> Result<bool> {
        let mut cmd = Command::new("tmux");
        cmd.args(["has-session", "-t", &self.session]);
        let output = run_with_timeout(cmd, TMUX_TIMEOUT, "tmux has-session").await?;
        Ok(output.status.success())
    }

    async fn ensure_session(&self) -> Result<()> {
        if self.session_exists().await? {
            return Ok(());
        }
        tracing::info!(session = %self.session, "creating tmux session");
        tmux_output(
            &["new-session", "-d", "-s", &self.session, "-n", CONTROL_WINDOW],
            "tmux new-session",
        )
        .await
        .map(|_| ())
    }

    async fn ensure_window(&self, window: &str) -> Result<()> {
        if self.window_names().await?.iter().any(|w| w == window) {
            return Ok(());
        }
        tmux_output(
            &["new-window", "-d", "-t", &self.session, "-n", window],
            "tmux new-window",
        )
        .await
        .map(|_| ())
    }

    async fn send_command(&self, window: &str, command: &str) -> Result<()> {
        let target = self.target(window);
        // -l sends the text literally; -- guards text starting with '-'
        tmux_output(
            &["send-keys", "-t", &target, "-l", "--", command],
            "tmux send-keys",
        )
        .await?;
        tmux_output(&["send-keys", "-t", &target, "Enter"], "tmux send-keys enter")
            .await
            .map(|_| ())
    }

    async fn interrupt(&self, window: &str) -> Result<()> {
        if !self.has_window(window).await? {
            tracing::debug!(window, "no window to interrupt");
            return Ok(());
        }
        let target = self.target(window);
        tmux_output(&["send-keys", "-t", &target, "C-c"], "tmux send-keys C-c")
            .await
            .map(|_| ())
    }

    async fn is_process_running(&self, window: &str, pattern: &str) -> Result<bool> {
        if !self.has_window(window).await? {
            return Ok(false);
        }
        let target = self.target(window);
        let output = tmux_output(
            &["list-panes", "-t", &target, "-F", "#{pane_pid}"],
            "tmux list-panes",
        )
        .await?;

        let pane_pid = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or("")
            .trim()
            .to_string();
        if pane_pid.is_empty() {
            return Ok(false);
        }

        let mut cmd = Command::new("pgrep");
        cmd.args(["-P", &pane_pid, "-f", pattern]);
        let pgrep = run_with_timeout(cmd, TMUX_TIMEOUT, "pgrep child check").await?;
        Ok(pgrep.status.success())
    }

    async fn kill_session(&self) -> Result<()> {
        let mut cmd = Command::new("tmux");
        cmd.args(["kill-session", "-t", &self.session]);
        // already gone is fine
        let _ = run_with_timeout(cmd, TMUX_TIMEOUT, "tmux kill-session").await;
        Ok(())
    }
}

async fn tmux_output(args: &[&str], description: &str) -> Result<Output> {
    let mut cmd = Command::new("tmux");
    cmd.args(args);
    let output = run_with_timeout(cmd, TMUX_TIMEOUT, description).await?;
    if !output.status.success() {
        return Err(DroverError::Session(format!(
            "{description}: {}",
            failure_text(&output)
        )));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmux_available() -> bool {
        std::process::Command::new("tmux")
            .arg("-V")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn target_joins_session_and_window() {
        let tmux = TmuxSession::new("proof");
        assert_eq!(tmux.target("worker-3"), "proof:worker-3");
    }

    #[tokio::test]
    async fn missing_window_reads_as_not_running() {
        if !tmux_available() {
            return;
        }
        let tmux = TmuxSession::new(format!("drover-test-{}", std::process::id()));
        tmux.ensure_session().await.unwrap();
        tmux.ensure_window("worker-1").await.unwrap();

        assert!(!tmux.is_process_running("worker-2", "sleep").await.unwrap());
        tmux.interrupt("worker-2").await.unwrap();

        tmux.kill_session().await.unwrap();
        assert!(!tmux.is_process_running("worker-1", "sleep").await.unwrap());
        tmux.interrupt("worker-1").await.unwrap();
    }
}
