//! Subprocess execution helpers

use crate::error::{DroverError, Result};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

/// Default timeout for tmux commands.
pub const TMUX_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for git calls that stay local to the repository.
pub const GIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Run a subprocess with a timeout.
///
/// A non-zero exit is not an error here; callers inspect `status`. The child
/// is killed when the timeout elapses.
pub async fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    description: &str,
) -> Result<Output> {
    cmd.kill_on_drop(true);
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(io_err)) => Err(DroverError::Transient {
            action: description.to_string(),
            reason: io_err.to_string(),
        }),
        Err(_elapsed) => Err(DroverError::Timeout {
            what: description.to_string(),
            secs: timeout.as_secs(),
        }),
    }
}

/// Trimmed stderr, falling back to stdout when stderr is empty.
pub fn failure_text(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let text = if stderr.trim().is_empty() {
        String::from_utf8_lossy(&output.stdout)
    } else {
        stderr
    };
    text.trim().to_string()
}
