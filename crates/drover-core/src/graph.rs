use crate::config::{Config, IssueDef};
use crate::error::{DroverError, Result};
use crate::paths;
use crate::types::{IssueId, IssueStatus, WorkerId};
use crate::worker::Worker;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;

// ---------------------------------------------------------------------------
// Issue
// ---------------------------------------------------------------------------

/// Configuration merged with the runtime overlay.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    pub id: IssueId,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub priority: u32,
    pub wave: u32,
    pub depends_on: BTreeSet<IssueId>,
    pub status: IssueStatus,
    pub assigned_worker: Option<WorkerId>,
    /// Index into the configured pipeline.
    pub stage: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Issue {
    fn from_def(def: &IssueDef) -> Self {
        Self {
            id: def.id,
            title: def.title.clone(),
            kind: def.kind.clone(),
            priority: def.priority,
            wave: def.wave,
            depends_on: def.depends_on.clone(),
            status: def.status,
            assigned_worker: None,
            stage: 0,
            description: def.description.clone(),
        }
    }

    fn ready_key(&self) -> (u32, u32, IssueId) {
        (self.wave, self.priority, self.id)
    }
}

/// Runtime fields persisted in the overlay file, keyed by issue id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssueState {
    pub status: IssueStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_worker: Option<WorkerId>,
    #[serde(default)]
    pub stage: usize,
}

// ---------------------------------------------------------------------------
// Dependency ordering
// ---------------------------------------------------------------------------

/// Topological order of the issue definitions (Kahn's algorithm).
///
/// Fails with `UnknownDependency` for an edge to an undefined id and with
/// `DependencyCycle` (listing every issue left unresolved) for a cycle.
pub fn topo_order(defs: &[IssueDef]) -> Result<Vec<IssueId>> {
    let ids: BTreeSet<IssueId> = defs.iter().map(|d| d.id).collect();
    let mut indegree: BTreeMap<IssueId, usize> = ids.iter().map(|id| (*id, 0)).collect();
    let mut dependents: HashMap<IssueId, Vec<IssueId>> = HashMap::new();

    for def in defs {
        for dep in &def.depends_on {
            if !ids.contains(dep) {
                return Err(DroverError::UnknownDependency {
                    issue: def.id,
                    dependency: *dep,
                });
            }
            *indegree.entry(def.id).or_default() += 1;
            dependents.entry(*dep).or_default().push(def.id);
        }
    }

    let mut queue: VecDeque<IssueId> = indegree
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(ids.len());

    while let Some(id) = queue.pop_front() {
        order.push(id);
        for next in dependents.get(&id).into_iter().flatten() {
            if let Some(n) = indegree.get_mut(next) {
                *n -= 1;
                if *n == 0 {
                    queue.push_back(*next);
                }
            }
        }
    }

    if order.len() < ids.len() {
        let stuck = indegree
            .into_iter()
            .filter(|(_, n)| *n > 0)
            .map(|(id, _)| id)
            .collect();
        return Err(DroverError::DependencyCycle(stuck));
    }
    Ok(order)
}

// ---------------------------------------------------------------------------
// IssueGraph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IssueGraph {
    issues: BTreeMap<IssueId, Issue>,
}

impl IssueGraph {
    /// Build the graph from validated definitions and an overlay.
    pub fn from_parts(defs: &[IssueDef], overlay: &BTreeMap<IssueId, IssueState>) -> Result<Self> {
        topo_order(defs)?;
        let mut issues = BTreeMap::new();
        for def in defs {
            let mut issue = Issue::from_def(def);
            if let Some(state) = overlay.get(&def.id) {
                issue.status = state.status;
                issue.assigned_worker = state.assigned_worker;
                issue.stage = state.stage;
            }
            if issue.status != IssueStatus::InProgress {
                issue.assigned_worker = None;
            }
            issues.insert(def.id, issue);
        }
        Ok(Self { issues })
    }

    /// Load configuration plus the overlay from the state directory.
    pub fn load(config: &Config) -> Result<Self> {
        let overlay = load_overlay(&config.state_dir())?;
        Self::from_parts(&config.issues, &overlay)
    }

    pub fn save(&self, state_dir: &Path) -> Result<()> {
        let overlay: BTreeMap<IssueId, IssueState> = self
            .issues
            .values()
            .map(|i| {
                (
                    i.id,
                    IssueState {
                        status: i.status,
                        assigned_worker: i.assigned_worker,
                        stage: i.stage,
                    },
                )
            })
            .collect();
        let data = serde_yaml::to_string(&overlay)?;
        crate::io::atomic_write(&paths::issues_overlay_path(state_dir), data.as_bytes())
    }

    pub fn get(&self, id: IssueId) -> Option<&Issue> {
        self.issues.get(&id)
    }

    pub fn issues(&self) -> impl Iterator<Item = &Issue> {
        self.issues.values()
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn count(&self, status: IssueStatus) -> usize {
        self.issues.values().filter(|i| i.status == status).count()
    }

    pub fn deps_completed(&self, id: IssueId) -> bool {
        match self.issues.get(&id) {
            Some(issue) => issue.depends_on.iter().all(|dep| {
                self.issues
                    .get(dep)
                    .is_some_and(|d| d.status == IssueStatus::Completed)
            }),
            None => false,
        }
    }

    /// Pending issues whose dependencies are all completed, ordered by
    /// (wave, priority, id).
    pub fn ready_issues(&self) -> Vec<&Issue> {
        let mut ready: Vec<&Issue> = self
            .issues
            .values()
            .filter(|i| i.status == IssueStatus::Pending && self.deps_completed(i.id))
            .collect();
        ready.sort_by_key(|i| i.ready_key());
        ready
    }

    /// Pending issues held back by at least one incomplete dependency.
    pub fn blocked_issues(&self) -> Vec<&Issue> {
        self.issues
            .values()
            .filter(|i| i.status == IssueStatus::Pending && !self.deps_completed(i.id))
            .collect()
    }

    /// Transition an issue. Returns `Ok(false)` when the issue is already in
    /// the requested state, so replays are harmless.
    ///
    /// `worker` is required for `InProgress` and must match the holder when
    /// the issue is already in progress.
    pub fn mark(&mut self, id: IssueId, to: IssueStatus, worker: Option<WorkerId>) -> Result<bool> {
        let deps_done = self.deps_completed(id);
        let issue = self
            .issues
            .get_mut(&id)
            .ok_or(DroverError::IssueNotFound(id))?;
        let from = issue.status;
        let invalid = |reason: &str| DroverError::InvalidTransition {
            issue: id,
            from,
            to,
            reason: reason.to_string(),
        };

        match (from, to) {
            (IssueStatus::InProgress, IssueStatus::InProgress) => {
                if worker.is_some() && issue.assigned_worker == worker {
                    Ok(false)
                } else {
                    Err(invalid("already held by another worker"))
                }
            }
            (IssueStatus::Pending, IssueStatus::InProgress) => {
                let Some(w) = worker else {
                    return Err(invalid("no worker given"));
                };
                if !deps_done {
                    return Err(invalid("dependencies not completed"));
                }
                issue.status = IssueStatus::InProgress;
                issue.assigned_worker = Some(w);
                Ok(true)
            }
            (IssueStatus::InProgress, IssueStatus::Completed)
            | (IssueStatus::InProgress, IssueStatus::Failed)
            | (IssueStatus::Pending, IssueStatus::Failed)
            | (IssueStatus::InProgress, IssueStatus::Pending) => {
                issue.status = to;
                issue.assigned_worker = None;
                Ok(true)
            }
            (a, b) if a == b => Ok(false),
            (IssueStatus::Pending, IssueStatus::Completed) => {
                Err(invalid("issue was never started"))
            }
            (from, _) if from.is_terminal() => Err(invalid("terminal issues cannot be reopened")),
            _ => Err(invalid("unsupported transition")),
        }
    }

    /// Move an in-progress issue to a later pipeline stage.
    pub fn set_stage(&mut self, id: IssueId, stage: usize) -> Result<()> {
        let issue = self
            .issues
            .get_mut(&id)
            .ok_or(DroverError::IssueNotFound(id))?;
        issue.stage = stage;
        Ok(())
    }
}

/// Read the runtime overlay, empty when the file does not exist yet.
pub fn load_overlay(state_dir: &Path) -> Result<BTreeMap<IssueId, IssueState>> {
    match crate::io::read_if_exists(&paths::issues_overlay_path(state_dir))? {
        Some(data) if !data.trim().is_empty() => Ok(serde_yaml::from_str(&data)?),
        _ => Ok(BTreeMap::new()),
    }
}

// ---------------------------------------------------------------------------
// Crash recovery
// ---------------------------------------------------------------------------

/// Repair state left inconsistent by a cycle interrupted between writes.
///
/// An issue in progress whose assigned worker does not hold it goes back to
/// pending; a worker holding an issue that is in progress for another worker
/// is released. Returns one line per repair.
pub fn reconcile(graph: &mut IssueGraph, workers: &mut [Worker]) -> Vec<String> {
    let mut repairs = Vec::new();

    for worker in workers.iter_mut() {
        let Some(issue_id) = worker.issue_id else {
            continue;
        };
        let held_elsewhere = graph.get(issue_id).is_some_and(|i| {
            i.status == IssueStatus::InProgress && i.assigned_worker != Some(worker.worker_id)
        });
        if held_elsewhere {
            tracing::warn!(
                worker_id = worker.worker_id,
                issue_id,
                "worker record holds an issue assigned elsewhere; releasing"
            );
            repairs.push(format!(
                "worker-{} released #{issue_id} (held by another worker)",
                worker.worker_id
            ));
            worker.release();
        }
    }

    let orphaned: Vec<IssueId> = graph
        .issues()
        .filter(|i| i.status == IssueStatus::InProgress)
        .filter(|i| {
            !workers
                .iter()
                .any(|w| Some(w.worker_id) == i.assigned_worker && w.issue_id == Some(i.id))
        })
        .map(|i| i.id)
        .collect();

    for id in orphaned {
        if graph.mark(id, IssueStatus::Pending, None).unwrap_or(false) {
            tracing::warn!(issue_id = id, "in-progress issue has no holder; returned to pending");
            repairs.push(format!("#{id} returned to pending (no worker holds it)"));
        }
    }

    repairs
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
