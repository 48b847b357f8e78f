//! Applies decided actions against the session, the repository and the
//! state directory.
//!
//! Every action is safe to replay: when the state it would produce is already
//! in place it returns [`Outcome::AlreadyApplied`] and writes no event.

use crate::adapters::{SessionAdapter, Vcs};
use crate::config::Config;
use crate::decision::Action;
use crate::error::{DroverError, Result};
use crate::event_log::{self, Event};
use crate::graph::IssueGraph;
use crate::paths;
use crate::prober::{last_lines, LOG_TAIL_LINES};
use crate::prompt::{self, Continuation};
use crate::types::{ActionKind, IssueId, IssueStatus, WorkerId, WorkerStatus};
use crate::worker::Worker;
use chrono::Utc;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    AlreadyApplied,
}

#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub applied: Vec<Action>,
    pub already_applied: Vec<Action>,
    pub failed: Vec<(Action, String)>,
    /// Actions not attempted because an earlier action for the same worker
    /// failed in this cycle.
    pub deferred: Vec<Action>,
}

pub struct Executor<'a> {
    pub config: &'a Config,
    pub session: &'a dyn SessionAdapter,
    pub vcs: &'a dyn Vcs,
    pub state_dir: PathBuf,
}

impl<'a> Executor<'a> {
    pub fn new(config: &'a Config, session: &'a dyn SessionAdapter, vcs: &'a dyn Vcs) -> Self {
        Self {
            config,
            session,
            vcs,
            state_dir: config.state_dir(),
        }
    }

    fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.config.action_timeout)
    }

    /// Apply `actions` in order. A failure stops the remaining actions of the
    /// same worker for this cycle; other workers proceed.
    pub async fn execute_all(
        &self,
        actions: &[Action],
        graph: &mut IssueGraph,
        workers: &mut [Worker],
    ) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        let mut halted: HashSet<WorkerId> = HashSet::new();

        for action in actions {
            if halted.contains(&action.worker_id) {
                report.deferred.push(action.clone());
                continue;
            }
            let Some(worker) = workers.iter_mut().find(|w| w.worker_id == action.worker_id)
            else {
                let err = DroverError::WorkerNotFound(action.worker_id);
                report.failed.push((action.clone(), err.to_string()));
                continue;
            };

            match self.execute(action, graph, worker).await {
                Ok(Outcome::Applied) => report.applied.push(action.clone()),
                Ok(Outcome::AlreadyApplied) => report.already_applied.push(action.clone()),
                Err(e) => {
                    tracing::warn!(
                        worker_id = action.worker_id,
                        issue_id = ?action.issue_id,
                        action = %action.kind,
                        transient = e.is_transient(),
                        error = %e,
                        "action failed; worker's remaining actions deferred"
                    );
                    halted.insert(action.worker_id);
                    report.failed.push((action.clone(), e.to_string()));
                }
            }
        }
        report
    }

    /// Apply one action, bounded by the configured action timeout. State on
    /// disk is only written once every external call has succeeded.
    pub async fn execute(
        &self,
        action: &Action,
        graph: &mut IssueGraph,
        worker: &mut Worker,
    ) -> Result<Outcome> {
        let timeout = self.action_timeout();
        let fut = self.apply(action, graph, worker);
        let outcome = match tokio::time::timeout(timeout, fut).await {
            Ok(res) => res?,
            Err(_) => {
                return Err(DroverError::Timeout {
                    what: format!("{} for worker-{}", action.kind, action.worker_id),
                    secs: timeout.as_secs(),
                })
            }
        };

        if outcome == Outcome::Applied && action.kind != ActionKind::Noop {
            event_log::append(&self.state_dir, &Event::record(action, Utc::now()))?;
            tracing::info!(
                worker_id = action.worker_id,
                issue_id = ?action.issue_id,
                new_issue_id = ?action.new_issue_id,
                action = %action.kind,
                reason = %action.reason,
                "applied"
            );
        }
        Ok(outcome)
    }

    async fn apply(
        &self,
        action: &Action,
        graph: &mut IssueGraph,
        worker: &mut Worker,
    ) -> Result<Outcome> {
        match action.kind {
            ActionKind::Noop => self.noop(worker),
            ActionKind::Publish => self.publish(action, worker).await,
            ActionKind::MarkComplete => self.mark_complete(action, graph, worker),
            ActionKind::AdvanceStage => self.advance_stage(action, graph, worker).await,
            ActionKind::Reassign => self.reassign(action, graph, worker).await,
            ActionKind::Restart => self.restart(action, graph, worker).await,
            ActionKind::Skip => self.skip(action, graph, worker).await,
            ActionKind::Idle => self.idle(worker),
            ActionKind::Shutdown => Ok(Outcome::AlreadyApplied),
        }
    }

    // -----------------------------------------------------------------------
    // Per-action handlers
    // -----------------------------------------------------------------------

    fn noop(&self, worker: &mut Worker) -> Result<Outcome> {
        let log = paths::worker_log_path(&self.state_dir, worker.worker_id);
        let size = std::fs::metadata(&log).map(|m| m.len()).unwrap_or(0);
        if size != worker.last_log_size {
            worker.last_log_size = size;
            worker.save(&self.state_dir)?;
        }
        Ok(Outcome::AlreadyApplied)
    }

    async fn publish(&self, action: &Action, worker: &mut Worker) -> Result<Outcome> {
        let issue = required_issue(action)?;
        let (workspace, branch) = assignment(worker, issue)?;
        let remote = &self.config.repo.remote;

        if self.vcs.is_published(&workspace, remote, &branch).await? {
            return Ok(Outcome::AlreadyApplied);
        }
        self.vcs.push(&workspace, remote, &branch).await?;

        let commits = self
            .vcs
            .commits_since(&workspace, &self.config.base_ref())
            .await?;
        worker.commits = commits;
        worker.save(&self.state_dir)?;
        Ok(Outcome::Applied)
    }

    fn mark_complete(
        &self,
        action: &Action,
        graph: &mut IssueGraph,
        worker: &mut Worker,
    ) -> Result<Outcome> {
        let issue = required_issue(action)?;
        let changed = graph.mark(issue, IssueStatus::Completed, None)?;
        if changed {
            graph.save(&self.state_dir)?;
        }
        if worker.holds(issue) {
            worker.release();
            worker.save(&self.state_dir)?;
        }
        Ok(if changed {
            Outcome::Applied
        } else {
            Outcome::AlreadyApplied
        })
    }

    async fn advance_stage(
        &self,
        action: &Action,
        graph: &mut IssueGraph,
        worker: &mut Worker,
    ) -> Result<Outcome> {
        let issue_id = required_issue(action)?;
        let decided_at = action.stage.ok_or_else(|| DroverError::Transient {
            action: "advance_stage".into(),
            reason: "action carries no stage".into(),
        })?;
        let current = graph
            .get(issue_id)
            .ok_or(DroverError::IssueNotFound(issue_id))?
            .stage;
        if current != decided_at || !worker.holds(issue_id) {
            return Ok(Outcome::AlreadyApplied);
        }
        let next = decided_at + 1;
        let stage = self
            .config
            .pipeline
            .get(next)
            .ok_or_else(|| DroverError::Transient {
                action: "advance_stage".into(),
                reason: format!("no pipeline stage at index {next}"),
            })?
            .clone();

        let mut staged = graph.clone();
        staged.set_stage(issue_id, next)?;
        let mut updated = worker.clone();
        updated.status = WorkerStatus::Running;
        updated.started_at = Some(Utc::now());
        updated.last_log_size = 0;

        self.launch(&stage, issue_id, &staged, &updated, None).await?;

        *graph = staged;
        graph.save(&self.state_dir)?;
        *worker = updated;
        worker.save(&self.state_dir)?;
        Ok(Outcome::Applied)
    }

    async fn reassign(
        &self,
        action: &Action,
        graph: &mut IssueGraph,
        worker: &mut Worker,
    ) -> Result<Outcome> {
        let new_issue = action.new_issue_id.ok_or_else(|| DroverError::Transient {
            action: "reassign".into(),
            reason: "action carries no target issue".into(),
        })?;

        let already_held = graph.get(new_issue).is_some_and(|i| {
            i.status == IssueStatus::InProgress && i.assigned_worker == Some(worker.worker_id)
        });
        if already_held && worker.holds(new_issue) && worker.status == WorkerStatus::Running {
            return Ok(Outcome::AlreadyApplied);
        }

        // readiness is re-checked against the live graph, not the decision
        let mut staged = graph.clone();
        staged.mark(new_issue, IssueStatus::InProgress, Some(worker.worker_id))?;

        let branch = self.config.branch_for(new_issue);
        let workspace = self.config.worktree_for(new_issue);
        self.vcs
            .ensure_worktree(
                &self.config.repo_path(),
                &workspace,
                &branch,
                &self.config.base_ref(),
            )
            .await?;

        let mut updated = worker.clone();
        updated.assign(new_issue, branch, workspace, Utc::now());
        let stage = self.stage_name(&staged, new_issue);

        self.session
            .interrupt(&paths::worker_window(worker.worker_id))
            .await?;
        self.launch(&stage, new_issue, &staged, &updated, None).await?;

        *graph = staged;
        graph.save(&self.state_dir)?;
        *worker = updated;
        worker.save(&self.state_dir)?;
        Ok(Outcome::Applied)
    }

    async fn restart(
        &self,
        action: &Action,
        graph: &mut IssueGraph,
        worker: &mut Worker,
    ) -> Result<Outcome> {
        let issue_id = required_issue(action)?;
        if worker.retry_count != action.attempt || !worker.holds(issue_id) {
            return Ok(Outcome::AlreadyApplied);
        }
        let (workspace, _) = assignment(worker, issue_id)?;

        let continuation = if action.continuation {
            Some(self.continuation(worker.worker_id, &workspace).await?)
        } else {
            None
        };

        let mut updated = worker.clone();
        updated.restart(Utc::now());
        if let Some(c) = &continuation {
            updated.commits = c.commits.clone();
        }
        let stage = self.stage_name(graph, issue_id);

        self.session
            .interrupt(&paths::worker_window(worker.worker_id))
            .await?;
        self.launch(&stage, issue_id, graph, &updated, continuation.as_ref())
            .await?;

        *worker = updated;
        worker.save(&self.state_dir)?;
        Ok(Outcome::Applied)
    }

    async fn skip(
        &self,
        action: &Action,
        graph: &mut IssueGraph,
        worker: &mut Worker,
    ) -> Result<Outcome> {
        let issue_id = required_issue(action)?;
        let issue_failed = graph
            .get(issue_id)
            .is_some_and(|i| i.status == IssueStatus::Failed);
        if issue_failed && !worker.holds(issue_id) {
            return Ok(Outcome::AlreadyApplied);
        }

        self.session
            .interrupt(&paths::worker_window(worker.worker_id))
            .await?;

        if graph.mark(issue_id, IssueStatus::Failed, None)? {
            graph.save(&self.state_dir)?;
        }
        crate::io::remove_if_exists(&paths::worker_signal_path(
            &self.state_dir,
            worker.worker_id,
        ))?;
        worker.release();
        worker.status = WorkerStatus::Failed;
        worker.save(&self.state_dir)?;
        Ok(Outcome::Applied)
    }

    fn idle(&self, worker: &mut Worker) -> Result<Outcome> {
        if worker.status == WorkerStatus::Idle && worker.issue_id.is_none() {
            return Ok(Outcome::AlreadyApplied);
        }
        worker.release();
        worker.status = WorkerStatus::Idle;
        worker.save(&self.state_dir)?;
        Ok(Outcome::Applied)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn stage_name(&self, graph: &IssueGraph, issue: IssueId) -> String {
        let idx = graph.get(issue).map(|i| i.stage).unwrap_or(0);
        self.config
            .pipeline
            .get(idx)
            .or_else(|| self.config.pipeline.first())
            .cloned()
            .unwrap_or_else(|| "implement".to_string())
    }

    /// Recovery context, gathered before the log is truncated.
    async fn continuation(&self, worker_id: WorkerId, workspace: &Path) -> Result<Continuation> {
        let log_path = paths::worker_log_path(&self.state_dir, worker_id);
        let log = crate::io::read_if_exists(&log_path)?.unwrap_or_default();
        Ok(Continuation {
            commits: self
                .vcs
                .commits_since(workspace, &self.config.base_ref())
                .await?,
            diff_stat: self.vcs.diff_stat(workspace).await?,
            status: self.vcs.status_short(workspace).await?,
            failure_hint: prompt::failure_hint(&last_lines(&log, LOG_TAIL_LINES * 10)),
        })
    }

    /// Write the prompt, reset the transcript and signal, and start the agent
    /// in the worker's window.
    async fn launch(
        &self,
        stage: &str,
        issue_id: IssueId,
        graph: &IssueGraph,
        worker: &Worker,
        continuation: Option<&Continuation>,
    ) -> Result<()> {
        let issue = graph
            .get(issue_id)
            .ok_or(DroverError::IssueNotFound(issue_id))?;
        let id = worker.worker_id;
        let workspace = worker
            .workspace
            .clone()
            .unwrap_or_else(|| self.config.worktree_for(issue_id));

        let prompt_path = paths::worker_prompt_path(&self.state_dir, id);
        let log_path = paths::worker_log_path(&self.state_dir, id);
        let signal_path = paths::worker_signal_path(&self.state_dir, id);

        let text = prompt::render(stage, issue, worker, self.config, continuation);
        crate::io::atomic_write(&prompt_path, text.as_bytes())?;
        crate::io::remove_if_exists(&signal_path)?;
        crate::io::truncate(&log_path)?;

        let command = launch_command(
            &workspace,
            &self.config.agent.command,
            &prompt_path,
            &log_path,
            &signal_path,
        );
        let window = paths::worker_window(id);
        self.session.ensure_window(&window).await?;
        self.session.send_command(&window, &command).await?;
        tracing::debug!(worker_id = id, issue_id, stage, "agent started");
        Ok(())
    }
}

/// Shell line that runs one agent attempt and records its exit code.
/// The signal is written to a temp name and renamed so readers never see a
/// partial value.
pub fn launch_command(
    workspace: &Path,
    agent: &str,
    prompt: &Path,
    log: &Path,
    signal: &Path,
) -> String {
    let signal_tmp = format!("{}.tmp", signal.display());
    format!(
        "cd {} && {agent} \"$(cat {})\" > {} 2>&1; echo $? > {} && mv {} {}",
        shell_quote(&workspace.to_string_lossy()),
        shell_quote(&prompt.to_string_lossy()),
        shell_quote(&log.to_string_lossy()),
        shell_quote(&signal_tmp),
        shell_quote(&signal_tmp),
        shell_quote(&signal.to_string_lossy()),
    )
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn required_issue(action: &Action) -> Result<IssueId> {
    action.issue_id.ok_or_else(|| DroverError::Transient {
        action: action.kind.to_string(),
        reason: "action carries no issue".into(),
    })
}

fn assignment(worker: &Worker, issue: IssueId) -> Result<(PathBuf, String)> {
    match (&worker.workspace, &worker.branch) {
        (Some(ws), Some(branch)) if worker.holds(issue) => Ok((ws.clone(), branch.clone())),
        _ => Err(DroverError::InvalidTransition {
            issue,
            from: IssueStatus::InProgress,
            to: IssueStatus::InProgress,
            reason: format!("worker-{} does not hold this issue", worker.worker_id),
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
