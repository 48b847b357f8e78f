use crate::types::WorkerId;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const CONFIG_FILE: &str = "drover.yaml";
pub const DEFAULT_STATE_DIR: &str = ".drover";

pub const ISSUES_OVERLAY_FILE: &str = "issues.yaml";
pub const EVENT_LOG_FILE: &str = "events.jsonl";
pub const WAKE_FILE: &str = "wake";
pub const POOL_FILE: &str = "pool.yaml";
pub const WORKERS_DIR: &str = "workers";
pub const PROMPTS_DIR: &str = "prompts";

// ---------------------------------------------------------------------------
// Path helpers (all relative to the state directory)
// ---------------------------------------------------------------------------

pub fn issues_overlay_path(state_dir: &Path) -> PathBuf {
    state_dir.join(ISSUES_OVERLAY_FILE)
}

pub fn event_log_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENT_LOG_FILE)
}

pub fn wake_path(state_dir: &Path) -> PathBuf {
    state_dir.join(WAKE_FILE)
}

pub fn pool_path(state_dir: &Path) -> PathBuf {
    state_dir.join(POOL_FILE)
}

pub fn workers_dir(state_dir: &Path) -> PathBuf {
    state_dir.join(WORKERS_DIR)
}

pub fn worker_record_path(state_dir: &Path, id: WorkerId) -> PathBuf {
    workers_dir(state_dir).join(format!("worker-{id}.yaml"))
}

pub fn worker_log_path(state_dir: &Path, id: WorkerId) -> PathBuf {
    workers_dir(state_dir).join(format!("worker-{id}.log"))
}

pub fn worker_signal_path(state_dir: &Path, id: WorkerId) -> PathBuf {
    workers_dir(state_dir).join(format!("worker-{id}.signal"))
}

pub fn worker_prompt_path(state_dir: &Path, id: WorkerId) -> PathBuf {
    state_dir.join(PROMPTS_DIR).join(format!("worker-{id}.md"))
}

/// Name of the terminal window that hosts a worker.
pub fn worker_window(id: WorkerId) -> String {
    format!("worker-{id}")
}
