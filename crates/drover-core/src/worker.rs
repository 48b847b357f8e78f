use crate::error::{DroverError, Result};
use crate::paths;
use crate::types::{IssueId, WorkerId, WorkerStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Durable per-worker record, one YAML file per worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub worker_id: WorkerId,
    #[serde(rename = "issue_number", default)]
    pub issue_id: Option<IssueId>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(rename = "worktree", default)]
    pub workspace: Option<PathBuf>,
    #[serde(default)]
    pub status: WorkerStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_log_size: u64,
    #[serde(default)]
    pub commits: Vec<String>,
}

impl Worker {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            issue_id: None,
            branch: None,
            workspace: None,
            status: WorkerStatus::Pending,
            started_at: None,
            retry_count: 0,
            last_log_size: 0,
            commits: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn load(state_dir: &Path, id: WorkerId) -> Result<Self> {
        let path = paths::worker_record_path(state_dir, id);
        let data = crate::io::read_if_exists(&path)?.ok_or(DroverError::WorkerNotFound(id))?;
        let worker: Worker = serde_yaml::from_str(&data)?;
        Ok(worker)
    }

    pub fn save(&self, state_dir: &Path) -> Result<()> {
        let path = paths::worker_record_path(state_dir, self.worker_id);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    /// Records for workers `1..=count`, plus any record above `count` that
    /// still holds an issue. Missing records come back as fresh pending
    /// workers without being written.
    pub fn load_pool(state_dir: &Path, count: u32) -> Result<Vec<Self>> {
        let mut pool = (1..=count)
            .map(|id| match Self::load(state_dir, id) {
                Err(DroverError::WorkerNotFound(_)) => Ok(Self::new(id)),
                other => other,
            })
            .collect::<Result<Vec<_>>>()?;
        for id in record_ids(state_dir)? {
            if id <= count {
                continue;
            }
            let worker = Self::load(state_dir, id)?;
            if worker.issue_id.is_some() {
                pool.push(worker);
            }
        }
        Ok(pool)
    }

    /// Pool size recorded by the last launch, else `configured`.
    pub fn pool_size(state_dir: &Path, configured: u32) -> Result<u32> {
        match crate::io::read_if_exists(&paths::pool_path(state_dir))? {
            Some(data) => Ok(serde_yaml::from_str::<PoolRecord>(&data)?.workers),
            None => Ok(configured),
        }
    }

    pub fn record_pool_size(state_dir: &Path, workers: u32) -> Result<()> {
        let data = serde_yaml::to_string(&PoolRecord { workers })?;
        crate::io::atomic_write(&paths::pool_path(state_dir), data.as_bytes())
    }

    /// Create records for workers `1..=count` that do not exist yet.
    /// Existing records are kept as they are.
    pub fn init_pool(state_dir: &Path, count: u32) -> Result<Vec<Self>> {
        crate::io::ensure_dir(&paths::workers_dir(state_dir))?;
        let mut pool = Vec::with_capacity(count as usize);
        for id in 1..=count {
            let worker = match Self::load(state_dir, id) {
                Ok(w) => w,
                Err(DroverError::WorkerNotFound(_)) => {
                    let w = Self::new(id);
                    w.save(state_dir)?;
                    w
                }
                Err(e) => return Err(e),
            };
            pool.push(worker);
        }
        Ok(pool)
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Point the worker at an issue. The retry counter resets only when the
    /// issue changes.
    pub fn assign(
        &mut self,
        issue: IssueId,
        branch: String,
        workspace: PathBuf,
        now: DateTime<Utc>,
    ) {
        if self.issue_id != Some(issue) {
            self.retry_count = 0;
            self.commits.clear();
        }
        self.issue_id = Some(issue);
        self.branch = Some(branch);
        self.workspace = Some(workspace);
        self.status = WorkerStatus::Running;
        self.started_at = Some(now);
        self.last_log_size = 0;
    }

    /// Record a restart against the same issue.
    pub fn restart(&mut self, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.status = WorkerStatus::Running;
        self.started_at = Some(now);
        self.last_log_size = 0;
    }

    /// Drop the current assignment. The retry counter and commit list stay
    /// until the next issue is assigned.
    pub fn release(&mut self) {
        self.issue_id = None;
        self.branch = None;
        self.workspace = None;
        self.started_at = None;
    }

    pub fn holds(&self, issue: IssueId) -> bool {
        self.issue_id == Some(issue)
    }
}

#[derive(Serialize, Deserialize)]
struct PoolRecord {
    workers: u32,
}

/// Ids of every `worker-<N>.yaml` record on disk, ascending.
fn record_ids(state_dir: &Path) -> Result<Vec<WorkerId>> {
    let dir = paths::workers_dir(state_dir);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let name = entry?.file_name();
        let id = name
            .to_str()
            .and_then(|n| n.strip_prefix("worker-"))
            .and_then(|n| n.strip_suffix(".yaml"))
            .and_then(|n| n.parse::<WorkerId>().ok());
        ids.extend(id);
    }
    ids.sort_unstable();
    Ok(ids)
}
