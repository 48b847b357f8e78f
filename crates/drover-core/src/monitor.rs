use crate::adapters::{SessionAdapter, Vcs};
use crate::config::Config;
use crate::decision::{self, Action};
use crate::error::Result;
use crate::event_log::{self, Event};
use crate::executor::{ExecutionReport, Executor};
use crate::graph::{self, IssueGraph};
use crate::paths;
use crate::prober::{Prober, WorkerSnapshot};
use crate::types::{IssueStatus, WorkerStatus};
use crate::worker::Worker;
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Poll period for the wake marker while waiting between cycles.
const WAKE_POLL: Duration = Duration::from_secs(1);

/// Everything one cycle looked at and decided, before execution.
#[derive(Debug)]
pub struct Observation {
    pub graph: IssueGraph,
    pub workers: Vec<Worker>,
    pub snapshots: Vec<WorkerSnapshot>,
    pub actions: Vec<Action>,
    pub repairs: Vec<String>,
}

#[derive(Debug)]
pub struct CycleReport {
    pub actions: Vec<Action>,
    pub execution: ExecutionReport,
    pub repairs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub initial_delay: Duration,
    pub cycle_interval: Duration,
    /// Stop after one cycle.
    pub once: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub cycles: u64,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
    pub pending: usize,
    pub finished: bool,
}

impl Summary {
    fn from_graph(graph: &IssueGraph, cycles: u64, finished: bool) -> Self {
        Self {
            cycles,
            completed: graph.count(IssueStatus::Completed),
            failed: graph.count(IssueStatus::Failed),
            in_progress: graph.count(IssueStatus::InProgress),
            pending: graph.count(IssueStatus::Pending),
            finished,
        }
    }
}

/// True when nothing is running or can still start: no issue in progress,
/// no issue ready, no worker running. Pending issues stuck behind a failed
/// dependency do not keep the loop alive.
pub fn all_done(graph: &IssueGraph, workers: &[Worker]) -> bool {
    graph.count(IssueStatus::InProgress) == 0
        && graph.ready_issues().is_empty()
        && workers.iter().all(|w| w.status != WorkerStatus::Running)
}

pub struct Monitor<'a> {
    config: Config,
    /// Re-read before each cycle so `add-issue` edits are picked up.
    config_path: Option<PathBuf>,
    /// Pool size forced by the caller instead of the recorded launch size.
    pool_size: Option<u32>,
    session: &'a dyn SessionAdapter,
    vcs: &'a dyn Vcs,
}

impl<'a> Monitor<'a> {
    pub fn new(
        config: Config,
        config_path: Option<PathBuf>,
        session: &'a dyn SessionAdapter,
        vcs: &'a dyn Vcs,
    ) -> Self {
        Self {
            config,
            config_path,
            pool_size: None,
            session,
            vcs,
        }
    }

    pub fn with_pool_size(mut self, workers: u32) -> Self {
        self.pool_size = Some(workers);
        self
    }

    fn pool_size(&self) -> Result<u32> {
        match self.pool_size {
            Some(n) => Ok(n),
            None => Worker::pool_size(&self.config.state_dir(), self.config.workers),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn reload(&mut self) {
        let Some(path) = &self.config_path else {
            return;
        };
        match Config::load(path) {
            Ok(config) => self.config = config,
            Err(e) => tracing::warn!(error = %e, "config reload failed; keeping previous"),
        }
    }

    fn prober(&self) -> Prober<'_> {
        Prober {
            session: self.session,
            vcs: self.vcs,
            state_dir: self.config.state_dir(),
            process_pattern: self.config.agent.process_pattern.clone(),
            base_ref: self.config.base_ref(),
        }
    }

    /// Load state, repair it in memory, probe and decide. Nothing is written.
    pub async fn observe(&self) -> Result<Observation> {
        self.observe_inner(false).await
    }

    /// Like [`Monitor::observe`], but a failed probe (no tmux, no repository)
    /// degrades to snapshots built from the worker records.
    pub async fn preview(&self) -> Result<Observation> {
        self.observe_inner(true).await
    }

    async fn observe_inner(&self, tolerate_probe_failure: bool) -> Result<Observation> {
        let state_dir = self.config.state_dir();
        let mut graph = IssueGraph::load(&self.config)?;
        let pool_size = self.pool_size()?;
        let mut workers = Worker::load_pool(&state_dir, pool_size)?;
        let repairs = graph::reconcile(&mut graph, &mut workers);

        let snapshots = match self.prober().probe_all(&workers).await {
            Ok(s) => s,
            Err(e) if tolerate_probe_failure => {
                tracing::warn!(error = %e, "probe failed; using recorded worker state");
                workers.iter().map(WorkerSnapshot::unobserved).collect()
            }
            Err(e) => return Err(e),
        };
        let mut policy = self.config.policy();
        policy.pool_size = pool_size;
        let actions = decision::decide(&snapshots, &graph, &workers, &policy, Utc::now());
        Ok(Observation {
            graph,
            workers,
            snapshots,
            actions,
            repairs,
        })
    }

    /// One full cycle: observe, persist repairs, execute.
    pub async fn cycle(&self) -> Result<CycleReport> {
        let state_dir = self.config.state_dir();
        let Observation {
            mut graph,
            mut workers,
            actions,
            repairs,
            ..
        } = self.observe().await?;

        if !repairs.is_empty() {
            graph.save(&state_dir)?;
            for w in &workers {
                w.save(&state_dir)?;
            }
        }

        // a killed session reads as dead workers; relaunches need it back
        self.session.ensure_session().await?;
        let executor = Executor::new(&self.config, self.session, self.vcs);
        let execution = executor.execute_all(&actions, &mut graph, &mut workers).await;
        tracing::info!(
            actions = actions.len(),
            applied = execution.applied.len(),
            failed = execution.failed.len(),
            deferred = execution.deferred.len(),
            completed = graph.count(IssueStatus::Completed),
            pending = graph.count(IssueStatus::Pending),
            "cycle finished"
        );
        Ok(CycleReport {
            actions,
            execution,
            repairs,
        })
    }

    /// Cycle until all work is terminal (or once), sleeping between cycles
    /// unless woken by the wake marker.
    pub async fn run(&mut self, opts: &RunOptions) -> Result<Summary> {
        if !opts.initial_delay.is_zero() {
            tracing::info!(secs = opts.initial_delay.as_secs(), "waiting before first cycle");
            tokio::time::sleep(opts.initial_delay).await;
        }

        let mut cycles = 0u64;
        loop {
            self.reload();
            if let Err(e) = self.cycle().await {
                tracing::warn!(error = %e, "cycle failed; retrying next cycle");
            }
            cycles += 1;

            let state_dir = self.config.state_dir();
            let graph = IssueGraph::load(&self.config)?;
            let workers = Worker::load_pool(&state_dir, self.pool_size()?)?;

            if all_done(&graph, &workers) {
                let summary = Summary::from_graph(&graph, cycles, true);
                let blocked = graph.blocked_issues().len();
                let reason = format!(
                    "all work finished: {} completed, {} failed, {blocked} blocked",
                    summary.completed, summary.failed
                );
                let shutdown = Action::shutdown(reason);
                event_log::append(&state_dir, &Event::record(&shutdown, Utc::now()))?;
                tracing::info!(cycles, "{}", shutdown.reason);
                return Ok(summary);
            }
            if opts.once {
                return Ok(Summary::from_graph(&graph, cycles, false));
            }

            if wait_for_wake(&state_dir, opts.cycle_interval).await? {
                tracing::info!("woken by new work");
            }
        }
    }
}

/// Sleep up to `interval`, returning early (and consuming the marker) when
/// the wake file appears.
pub async fn wait_for_wake(state_dir: &std::path::Path, interval: Duration) -> Result<bool> {
    let wake = paths::wake_path(state_dir);
    let deadline = tokio::time::Instant::now() + interval;
    loop {
        if crate::io::remove_if_exists(&wake)? {
            return Ok(true);
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(WAKE_POLL.min(deadline - now)).await;
    }
}

/// Touch the wake marker so a waiting monitor starts a cycle now.
pub fn request_wake(state_dir: &std::path::Path) -> Result<()> {
    crate::io::atomic_write(&paths::wake_path(state_dir), Utc::now().to_rfc3339().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{FakeSession, FakeVcs};
    use crate::config::IssueDef;
    use crate::types::ActionKind;
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn config(dir: &TempDir, issues: &[(u64, &[u64])]) -> Config {
        let mut config = Config::default();
        config.base_dir = dir.path().to_path_buf();
        config.repo.path = PathBuf::from("repo");
        config.workers = 5;
        config.issues = issues
            .iter()
            .map(|(id, deps)| {
                let mut d = IssueDef::new(*id, format!("issue {id}"));
                d.depends_on = deps.iter().copied().collect();
                d
            })
            .collect();
        config
    }

    fn finish(config: &Config, session: &FakeSession, vcs: &FakeVcs, worker: u32, code: &str) {
        let state = config.state_dir();
        let w = Worker::load(&state, worker).unwrap();
        session.set_running(&paths::worker_window(worker), false);
        std::fs::write(paths::worker_signal_path(&state, worker), code).unwrap();
        if code == "0" {
            vcs.set_commits(w.workspace.as_ref().unwrap(), &["abc123 work"]);
        }
    }

    #[tokio::test]
    async fn scenario_a_first_cycle_assigns_everything() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, &[(52, &[]), (56, &[]), (61, &[]), (55, &[]), (57, &[])]);
        let (session, vcs) = (FakeSession::new(), FakeVcs::new());
        session.ensure_session().await.unwrap();
        let monitor = Monitor::new(cfg.clone(), None, &session, &vcs);

        let report = monitor.cycle().await.unwrap();
        assert_eq!(report.execution.applied.len(), 5);

        let graph = IssueGraph::load(&cfg).unwrap();
        assert_eq!(graph.count(IssueStatus::Pending), 0);
        assert_eq!(graph.count(IssueStatus::InProgress), 5);
        let workers = Worker::load_pool(&cfg.state_dir(), 5).unwrap();
        assert!(workers.iter().all(|w| w.status == WorkerStatus::Running));
        assert!(session.has_window("worker-5"));
    }

    #[tokio::test]
    async fn scenario_b_completion_reassigns_dependent() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, &[(52, &[]), (53, &[52])]);
        cfg.workers = 1;
        let (session, vcs) = (FakeSession::new(), FakeVcs::new());
        session.ensure_session().await.unwrap();
        let monitor = Monitor::new(cfg.clone(), None, &session, &vcs);

        monitor.cycle().await.unwrap();
        finish(&cfg, &session, &vcs, 1, "0");

        let report = monitor.cycle().await.unwrap();
        let kinds: Vec<_> = report.actions.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![ActionKind::Publish, ActionKind::MarkComplete, ActionKind::Reassign]
        );
        assert_eq!(report.execution.applied.len(), 3);

        let graph = IssueGraph::load(&cfg).unwrap();
        assert_eq!(graph.get(52).unwrap().status, IssueStatus::Completed);
        assert_eq!(graph.get(53).unwrap().assigned_worker, Some(1));
        assert_eq!(vcs.pushes(), 1);
    }

    #[tokio::test]
    async fn scenario_c_stall_restarts_and_truncates() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, &[(52, &[])]);
        cfg.workers = 1;
        let (session, vcs) = (FakeSession::new(), FakeVcs::new());
        session.ensure_session().await.unwrap();
        let monitor = Monitor::new(cfg.clone(), None, &session, &vcs);
        monitor.cycle().await.unwrap();

        let log = paths::worker_log_path(&cfg.state_dir(), 1);
        std::fs::write(&log, "thinking...\n").unwrap();
        let stale = SystemTime::now() - Duration::from_secs(cfg.stall_timeout + 60);
        std::fs::File::options()
            .write(true)
            .open(&log)
            .unwrap()
            .set_modified(stale)
            .unwrap();

        let report = monitor.cycle().await.unwrap();
        let kinds: Vec<_> = report.actions.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![ActionKind::Restart]);
        assert_eq!(Worker::load(&cfg.state_dir(), 1).unwrap().retry_count, 1);
        assert_eq!(std::fs::metadata(&log).unwrap().len(), 0);

        // the fresh attempt is healthy on the next cycle
        let report = monitor.cycle().await.unwrap();
        assert_eq!(report.actions[0].kind, ActionKind::Noop);
    }

    #[tokio::test]
    async fn scenario_e_retries_exhausted_then_idle() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, &[(52, &[])]);
        cfg.workers = 1;
        cfg.max_retries = 1;
        let (session, vcs) = (FakeSession::new(), FakeVcs::new());
        session.ensure_session().await.unwrap();
        let monitor = Monitor::new(cfg.clone(), None, &session, &vcs);
        monitor.cycle().await.unwrap();

        finish(&cfg, &session, &vcs, 1, "1");
        let r = monitor.cycle().await.unwrap();
        assert_eq!(r.actions[0].kind, ActionKind::Restart);

        finish(&cfg, &session, &vcs, 1, "1");
        let r = monitor.cycle().await.unwrap();
        assert_eq!(r.actions[0].kind, ActionKind::Skip);

        let r = monitor.cycle().await.unwrap();
        assert_eq!(r.actions[0].kind, ActionKind::Idle);

        let graph = IssueGraph::load(&cfg).unwrap();
        let workers = Worker::load_pool(&cfg.state_dir(), 1).unwrap();
        assert_eq!(graph.get(52).unwrap().status, IssueStatus::Failed);
        assert_eq!(workers[0].status, WorkerStatus::Idle);
        assert!(all_done(&graph, &workers));
    }

    #[tokio::test]
    async fn run_stops_when_all_done_and_logs_shutdown() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, &[(52, &[])]);
        cfg.workers = 1;
        let (session, vcs) = (FakeSession::new(), FakeVcs::new());
        session.ensure_session().await.unwrap();
        Monitor::new(cfg.clone(), None, &session, &vcs)
            .cycle()
            .await
            .unwrap();
        finish(&cfg, &session, &vcs, 1, "0");

        let mut monitor = Monitor::new(cfg.clone(), None, &session, &vcs);
        let summary = monitor
            .run(&RunOptions {
                initial_delay: Duration::ZERO,
                cycle_interval: Duration::from_secs(60),
                once: false,
            })
            .await
            .unwrap();
        assert!(summary.finished);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.cycles, 1);

        let events = event_log::tail(&cfg.state_dir(), 1).unwrap();
        assert_eq!(events[0].action, ActionKind::Shutdown);
    }

    #[tokio::test]
    async fn crash_between_graph_and_worker_writes_is_repaired() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, &[(52, &[])]);
        cfg.workers = 1;
        // the overlay says worker 1 holds #52, but its record was never written
        let mut graph = IssueGraph::load(&cfg).unwrap();
        graph.mark(52, IssueStatus::InProgress, Some(1)).unwrap();
        graph.save(&cfg.state_dir()).unwrap();

        let (session, vcs) = (FakeSession::new(), FakeVcs::new());
        session.ensure_session().await.unwrap();
        let monitor = Monitor::new(cfg.clone(), None, &session, &vcs);
        let report = monitor.cycle().await.unwrap();
        assert_eq!(report.repairs.len(), 1);
        assert_eq!(report.actions[0].kind, ActionKind::Reassign);
        assert_eq!(report.actions[0].new_issue_id, Some(52));
        assert!(Worker::load(&cfg.state_dir(), 1).unwrap().holds(52));
    }

    #[tokio::test]
    async fn killed_session_relaunches_workers() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, &[(52, &[]), (53, &[])]);
        cfg.workers = 2;
        let (session, vcs) = (FakeSession::new(), FakeVcs::new());
        session.ensure_session().await.unwrap();
        let monitor = Monitor::new(cfg.clone(), None, &session, &vcs);
        assert_eq!(monitor.cycle().await.unwrap().execution.applied.len(), 2);

        session.kill_session().await.unwrap();

        let report = monitor.cycle().await.unwrap();
        let kinds: Vec<_> = report.actions.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![ActionKind::Restart, ActionKind::Restart]);
        assert_eq!(report.execution.applied.len(), 2);
        assert!(report.execution.failed.is_empty());
        assert!(session.has_window("worker-1") && session.has_window("worker-2"));
        assert_eq!(Worker::load(&cfg.state_dir(), 2).unwrap().retry_count, 1);

        // relaunched agents read as healthy again
        let report = monitor.cycle().await.unwrap();
        assert!(report.actions.iter().all(|a| a.kind == ActionKind::Noop));
    }

    #[tokio::test]
    async fn missing_worker_window_does_not_block_assignment() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, &[(52, &[]), (53, &[])]);
        cfg.workers = 2;
        let (session, vcs) = (FakeSession::new(), FakeVcs::new());
        session.ensure_session().await.unwrap();
        session.ensure_window("worker-1").await.unwrap();

        let report = Monitor::new(cfg.clone(), None, &session, &vcs)
            .cycle()
            .await
            .unwrap();
        assert_eq!(report.execution.applied.len(), 2);
        assert!(session.has_window("worker-2"));
        let graph = IssueGraph::load(&cfg).unwrap();
        assert_eq!(graph.count(IssueStatus::InProgress), 2);
    }

    #[tokio::test]
    async fn worker_outside_configured_pool_keeps_its_issue() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, &[(52, &[]), (53, &[])]);
        cfg.workers = 1;
        let state = cfg.state_dir();
        // launched with two workers, config still says one
        let mut graph = IssueGraph::load(&cfg).unwrap();
        graph.mark(52, IssueStatus::InProgress, Some(2)).unwrap();
        graph.save(&state).unwrap();
        let mut second = Worker::new(2);
        second.assign(52, cfg.branch_for(52), cfg.worktree_for(52), Utc::now());
        second.save(&state).unwrap();

        let (session, vcs) = (FakeSession::new(), FakeVcs::new());
        session.ensure_session().await.unwrap();
        session.set_running("worker-2", true);
        let monitor = Monitor::new(cfg.clone(), None, &session, &vcs);

        let report = monitor.cycle().await.unwrap();
        assert!(report.repairs.is_empty());
        assert_eq!(report.actions[0].new_issue_id, Some(53));
        assert_eq!(report.actions[1].kind, ActionKind::Noop);
        assert!(Worker::load(&state, 1).unwrap().holds(53));
        assert!(Worker::load(&state, 2).unwrap().holds(52));
        let graph = IssueGraph::load(&cfg).unwrap();
        assert_eq!(graph.get(52).unwrap().assigned_worker, Some(2));

        // once its issue is done the extra worker takes nothing new
        finish(&cfg, &session, &vcs, 2, "0");
        let report = monitor.cycle().await.unwrap();
        let kinds: Vec<_> = report
            .actions
            .iter()
            .filter(|a| a.worker_id == 2)
            .map(|a| a.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![ActionKind::Publish, ActionKind::MarkComplete, ActionKind::Idle]
        );
        let pool = Worker::load_pool(&state, 1).unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn recorded_launch_size_sizes_the_pool() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, &[(52, &[]), (53, &[]), (54, &[])]);
        cfg.workers = 1;
        Worker::record_pool_size(&cfg.state_dir(), 3).unwrap();

        let (session, vcs) = (FakeSession::new(), FakeVcs::new());
        session.ensure_session().await.unwrap();
        let report = Monitor::new(cfg.clone(), None, &session, &vcs)
            .cycle()
            .await
            .unwrap();
        assert_eq!(report.execution.applied.len(), 3);
        assert!(session.has_window("worker-3"));
    }

    #[tokio::test]
    async fn wake_marker_cuts_wait_short() {
        let dir = TempDir::new().unwrap();
        request_wake(dir.path()).unwrap();
        let woke = wait_for_wake(dir.path(), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(woke);
        assert!(!paths::wake_path(dir.path()).exists());

        let woke = wait_for_wake(dir.path(), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(!woke);
    }
}
