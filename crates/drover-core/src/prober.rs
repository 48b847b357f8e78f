use crate::adapters::{SessionAdapter, Vcs};
use crate::error::Result;
use crate::paths;
use crate::types::{IssueId, WorkerId, WorkerStatus};
use crate::worker::Worker;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Lines of transcript kept in a snapshot.
pub const LOG_TAIL_LINES: usize = 20;

/// Bytes read from the end of the log when extracting the tail.
const TAIL_WINDOW: u64 = 64 * 1024;

/// Attempts at a consistent signal/log read before settling for the last one.
const CONSISTENT_READ_ATTEMPTS: usize = 3;

/// One cycle's observation of a worker. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSnapshot {
    pub worker_id: WorkerId,
    pub issue_id: Option<IssueId>,
    pub status: WorkerStatus,
    pub process_alive: bool,
    pub signal_present: bool,
    pub signal_value: Option<i32>,
    pub log_size: u64,
    pub log_mtime: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub log_tail: String,
    /// Log shrank since the last observation (our own restart truncated it).
    pub log_reset: bool,
    pub workspace_changes: bool,
    pub new_commits: Vec<String>,
}

impl WorkerSnapshot {
    /// Snapshot built from the record alone, used when nothing can be probed.
    pub fn unobserved(worker: &Worker) -> Self {
        Self {
            worker_id: worker.worker_id,
            issue_id: worker.issue_id,
            status: worker.status,
            process_alive: false,
            signal_present: false,
            signal_value: None,
            log_size: 0,
            log_mtime: None,
            log_tail: String::new(),
            log_reset: false,
            workspace_changes: false,
            new_commits: Vec::new(),
        }
    }
}

/// Signal file contents: `None` when absent, `Some(None)` when unparseable.
pub fn read_signal(path: &Path) -> Result<Option<Option<i32>>> {
    Ok(crate::io::read_if_exists(path)?.map(|s| s.trim().parse::<i32>().ok()))
}

#[derive(Debug, Clone, PartialEq)]
struct LogStat {
    size: u64,
    mtime: Option<DateTime<Utc>>,
    tail: String,
}

fn stat_log(path: &Path) -> Result<LogStat> {
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(LogStat {
                size: 0,
                mtime: None,
                tail: String::new(),
            })
        }
        Err(e) => return Err(e.into()),
    };
    let meta = file.metadata()?;
    let size = meta.len();
    let mtime = meta.modified().ok().map(DateTime::<Utc>::from);

    let start = size.saturating_sub(TAIL_WINDOW);
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let text = String::from_utf8_lossy(&buf);

    Ok(LogStat {
        size,
        mtime,
        tail: last_lines(&text, LOG_TAIL_LINES),
    })
}

/// Last `n` lines of `text`.
pub fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(n);
    lines[skip..].join("\n")
}

/// Builds snapshots from the filesystem, the session and the repository.
pub struct Prober<'a> {
    pub session: &'a dyn SessionAdapter,
    pub vcs: &'a dyn Vcs,
    pub state_dir: PathBuf,
    pub process_pattern: String,
    /// Ref new commits are counted against, e.g. `origin/main`.
    pub base_ref: String,
}

impl Prober<'_> {
    pub async fn probe_all(&self, workers: &[Worker]) -> Result<Vec<WorkerSnapshot>> {
        let session_up = self.session.session_exists().await?;
        let mut snapshots = Vec::with_capacity(workers.len());
        for worker in workers {
            snapshots.push(self.probe(worker, session_up).await?);
        }
        snapshots.sort_by_key(|s| s.worker_id);
        Ok(snapshots)
    }

    pub async fn probe(&self, worker: &Worker, session_up: bool) -> Result<WorkerSnapshot> {
        let id = worker.worker_id;
        let signal_path = paths::worker_signal_path(&self.state_dir, id);
        let log_path = paths::worker_log_path(&self.state_dir, id);

        let process_alive = if session_up {
            self.session
                .is_process_running(&paths::worker_window(id), &self.process_pattern)
                .await?
        } else {
            false
        };

        // signal, log, signal again: a worker exiting between the reads
        // would otherwise pair a stale log with a fresh exit code
        let mut signal = read_signal(&signal_path)?;
        let mut log = stat_log(&log_path)?;
        for _ in 1..CONSISTENT_READ_ATTEMPTS {
            let again = read_signal(&signal_path)?;
            if again == signal {
                break;
            }
            signal = again;
            log = stat_log(&log_path)?;
        }

        let log_reset = log.size < worker.last_log_size;
        if log_reset {
            tracing::debug!(
                worker_id = id,
                was = worker.last_log_size,
                now = log.size,
                "log reset"
            );
        }

        let (workspace_changes, new_commits) = match &worker.workspace {
            Some(ws) if worker.issue_id.is_some() => self.inspect_workspace(id, ws).await,
            _ => (false, Vec::new()),
        };

        let snapshot = WorkerSnapshot {
            worker_id: id,
            issue_id: worker.issue_id,
            status: worker.status,
            process_alive,
            signal_present: signal.is_some(),
            signal_value: signal.flatten(),
            log_size: log.size,
            log_mtime: log.mtime,
            log_tail: log.tail,
            log_reset,
            workspace_changes,
            new_commits,
        };
        tracing::debug!(
            worker_id = id,
            issue_id = ?snapshot.issue_id,
            alive = snapshot.process_alive,
            signal = ?snapshot.signal_value,
            log_size = snapshot.log_size,
            commits = snapshot.new_commits.len(),
            "probed worker"
        );
        Ok(snapshot)
    }

    /// Repository state is advisory: a missing or broken worktree reads as
    /// no changes and no commits.
    async fn inspect_workspace(&self, id: WorkerId, ws: &Path) -> (bool, Vec<String>) {
        let changes = match self.vcs.status_short(ws).await {
            Ok(s) => !s.trim().is_empty(),
            Err(e) => {
                tracing::warn!(worker_id = id, error = %e, "workspace status unavailable");
                false
            }
        };
        let commits = match self.vcs.commits_since(ws, &self.base_ref).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(worker_id = id, error = %e, "commit list unavailable");
                Vec::new()
            }
        };
        (changes, commits)
    }
}
