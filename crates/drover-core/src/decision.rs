//! Deterministic scheduling policy.
//!
//! `decide` maps one cycle's snapshots and the issue graph to an ordered list
//! of actions. Rules per worker are evaluated first-match-wins:
//!
//! 1. no held issue: reassign to the next ready issue, else idle
//! 2. exited with a success signal: publish, then advance or complete and
//!    reassign
//! 3. exited otherwise (non-zero, no commits, no signal): restart or skip
//! 4. alive with a stale log: restart or skip
//! 5. alive and progressing: noop

use crate::config::Policy;
use crate::graph::IssueGraph;
use crate::prober::WorkerSnapshot;
use crate::types::{ActionKind, IssueId, IssueStatus, WorkerId, WorkerStatus};
use crate::worker::Worker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minimum transcript length for a restart to continue prior work.
pub const MEANINGFUL_OUTPUT_MIN_CHARS: usize = 200;

/// Transcript fragments left by an agent that died rather than finished.
pub const CRASH_MARKERS: &[&str] = &[
    "No messages returned",
    "promise rejected",
    "processTicksAndRejections",
    "ENOMEM",
    "killed",
    "Segmentation fault",
];

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub worker_id: WorkerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<IssueId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_issue_id: Option<IssueId>,
    pub reason: String,
    /// Restart resumes the existing branch with recovery context.
    #[serde(default)]
    pub continuation: bool,
    /// Worker's retry count when the action was decided.
    #[serde(default)]
    pub attempt: u32,
    /// Pipeline stage index the action was decided at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<usize>,
}

impl Action {
    fn new(
        kind: ActionKind,
        worker_id: WorkerId,
        issue_id: Option<IssueId>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            worker_id,
            issue_id,
            new_issue_id: None,
            reason: reason.into(),
            continuation: false,
            attempt: 0,
            stage: None,
        }
    }

    pub fn shutdown(reason: impl Into<String>) -> Self {
        Self::new(ActionKind::Shutdown, 0, None, reason)
    }

    /// Short human form used by `status` and dry runs.
    pub fn summary(&self) -> String {
        let mut s = format!("worker-{} {}", self.worker_id, self.kind);
        if let Some(id) = self.issue_id {
            s.push_str(&format!(" #{id}"));
        }
        if let Some(id) = self.new_issue_id {
            s.push_str(&format!(" -> #{id}"));
        }
        if self.continuation {
            s.push_str(" (continue)");
        }
        s.push_str(&format!(": {}", self.reason));
        s
    }
}

// ---------------------------------------------------------------------------
// Output heuristics
// ---------------------------------------------------------------------------

/// Whether a transcript shows real work worth continuing from.
pub fn has_meaningful_output(log_tail: &str) -> bool {
    let text = log_tail.trim();
    if text.len() < MEANINGFUL_OUTPUT_MIN_CHARS {
        return false;
    }
    !CRASH_MARKERS.iter().any(|m| text.contains(m))
}

// ---------------------------------------------------------------------------
// decide
// ---------------------------------------------------------------------------

/// Compute the actions for one cycle.
///
/// Workers are visited in id order against a working copy of the graph:
/// completions become visible to later workers and every reassignment claims
/// its issue, so no issue is handed out twice.
pub fn decide(
    snapshots: &[WorkerSnapshot],
    graph: &IssueGraph,
    workers: &[Worker],
    policy: &Policy,
    now: DateTime<Utc>,
) -> Vec<Action> {
    let mut working = graph.clone();
    let mut ordered: Vec<&WorkerSnapshot> = snapshots.iter().collect();
    ordered.sort_by_key(|s| s.worker_id);

    let mut actions = Vec::new();
    for snap in ordered {
        let record = workers.iter().find(|w| w.worker_id == snap.worker_id);
        let ctx = WorkerCtx {
            snap,
            retry_count: record.map(|w| w.retry_count).unwrap_or(0),
            started_at: record.and_then(|w| w.started_at),
            retiring: snap.worker_id > policy.pool_size,
        };
        decide_worker(&ctx, &mut working, policy, now, &mut actions);
    }
    actions
}

struct WorkerCtx<'a> {
    snap: &'a WorkerSnapshot,
    retry_count: u32,
    started_at: Option<DateTime<Utc>>,
    /// Outside the pool: finishes its issue, takes nothing new.
    retiring: bool,
}

impl WorkerCtx<'_> {
    fn action(&self, kind: ActionKind, issue: Option<IssueId>, reason: impl Into<String>) -> Action {
        let mut a = Action::new(kind, self.snap.worker_id, issue, reason);
        a.attempt = self.retry_count;
        a
    }
}

fn decide_worker(
    ctx: &WorkerCtx<'_>,
    working: &mut IssueGraph,
    policy: &Policy,
    now: DateTime<Utc>,
    out: &mut Vec<Action>,
) {
    let snap = ctx.snap;
    let held = snap.issue_id.filter(|id| {
        working.get(*id).is_some_and(|i| {
            i.status == IssueStatus::InProgress && i.assigned_worker == Some(snap.worker_id)
        })
    });

    let Some(issue_id) = held else {
        dispatch(ctx, working, "worker free", out);
        return;
    };

    if snap.process_alive {
        // a clock skewed into the future counts as fresh output
        let idle = snap
            .log_mtime
            .or(ctx.started_at)
            .map(|t| now.signed_duration_since(t).to_std().unwrap_or_default());
        let stall_reason = match idle {
            Some(idle) if idle <= policy.stall_timeout => None,
            Some(_) => Some(format!(
                "stalled: no log output for over {}s",
                policy.stall_timeout.as_secs()
            )),
            // nothing to measure idleness against; a fresh attempt records one
            None => Some("stalled: no start time or log output recorded".to_string()),
        };
        match stall_reason {
            Some(reason) => restart_or_skip(ctx, issue_id, working, policy, reason, out),
            None => out.push(ctx.action(ActionKind::Noop, Some(issue_id), "healthy")),
        }
        return;
    }

    let exit_ok = snap.signal_present && snap.signal_value == Some(0);
    let has_commits = !snap.new_commits.is_empty();

    if exit_ok && (has_commits || !policy.require_commits) {
        if has_commits {
            out.push(ctx.action(
                ActionKind::Publish,
                Some(issue_id),
                format!("exit 0 with {} new commit(s)", snap.new_commits.len()),
            ));
        }

        let stage = working.get(issue_id).map(|i| i.stage).unwrap_or(0);
        if stage + 1 < policy.pipeline.len() {
            let mut a = ctx.action(
                ActionKind::AdvanceStage,
                Some(issue_id),
                format!(
                    "stage {} done, next: {}",
                    policy.pipeline[stage],
                    policy.pipeline[stage + 1]
                ),
            );
            a.stage = Some(stage);
            out.push(a);
            return;
        }

        out.push(ctx.action(
            ActionKind::MarkComplete,
            Some(issue_id),
            "all stages finished",
        ));
        if let Err(e) = working.mark(issue_id, IssueStatus::Completed, None) {
            tracing::debug!(issue_id, error = %e, "working graph rejected completion");
        }
        dispatch(ctx, working, &format!("#{issue_id} completed"), out);
        return;
    }

    let reason = if !snap.signal_present {
        "process exited without a completion signal".to_string()
    } else {
        match snap.signal_value {
            Some(0) => "exit 0 but no new commits".to_string(),
            Some(code) => format!("exit code {code}"),
            None => "unreadable completion signal".to_string(),
        }
    };
    restart_or_skip(ctx, issue_id, working, policy, reason, out);
}

/// Hand the worker the best ready issue, or park it.
fn dispatch(ctx: &WorkerCtx<'_>, working: &mut IssueGraph, why: &str, out: &mut Vec<Action>) {
    let snap = ctx.snap;
    let next = working
        .ready_issues()
        .first()
        .filter(|_| !ctx.retiring)
        .map(|i| (i.id, i.wave, i.priority));

    match next {
        Some((id, wave, priority)) => {
            if working
                .mark(id, IssueStatus::InProgress, Some(snap.worker_id))
                .is_err()
            {
                return;
            }
            let mut a = ctx.action(
                ActionKind::Reassign,
                snap.issue_id,
                format!("{why}; next ready issue (wave {wave}, priority {priority})"),
            );
            a.new_issue_id = Some(id);
            out.push(a);
        }
        None if snap.status == WorkerStatus::Idle && snap.issue_id.is_none() => {
            out.push(ctx.action(ActionKind::Noop, None, "idle, nothing ready"));
        }
        None if ctx.retiring => {
            out.push(ctx.action(
                ActionKind::Idle,
                snap.issue_id,
                format!("{why}; outside the pool, retiring"),
            ));
        }
        None => {
            out.push(ctx.action(
                ActionKind::Idle,
                snap.issue_id,
                format!("{why}; no ready issues"),
            ));
        }
    }
}

fn restart_or_skip(
    ctx: &WorkerCtx<'_>,
    issue_id: IssueId,
    working: &mut IssueGraph,
    policy: &Policy,
    reason: String,
    out: &mut Vec<Action>,
) {
    if ctx.retry_count < policy.max_retries {
        let mut a = ctx.action(
            ActionKind::Restart,
            Some(issue_id),
            format!(
                "{reason} (retry {}/{})",
                ctx.retry_count + 1,
                policy.max_retries
            ),
        );
        a.continuation = has_meaningful_output(&ctx.snap.log_tail);
        out.push(a);
    } else {
        out.push(ctx.action(
            ActionKind::Skip,
            Some(issue_id),
            format!("{reason}; {} retries exhausted", policy.max_retries),
        ));
        if let Err(e) = working.mark(issue_id, IssueStatus::Failed, None) {
            tracing::debug!(issue_id, error = %e, "working graph rejected failure");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IssueDef;
    use chrono::Duration as ChronoDuration;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::Duration;

    fn policy() -> Policy {
        Policy {
            max_retries: 3,
            stall_timeout: Duration::from_secs(900),
            require_commits: true,
            pipeline: vec!["implement".into()],
            pool_size: 5,
        }
    }

    fn graph(defs: &[(IssueId, u32, &[IssueId])]) -> IssueGraph {
        let defs: Vec<IssueDef> = defs
            .iter()
            .map(|(id, wave, deps)| {
                let mut d = IssueDef::new(*id, format!("issue {id}"));
                d.wave = *wave;
                d.depends_on = deps.iter().copied().collect();
                d
            })
            .collect();
        IssueGraph::from_parts(&defs, &BTreeMap::new()).unwrap()
    }

    fn free(id: WorkerId) -> (WorkerSnapshot, Worker) {
        let w = Worker::new(id);
        (WorkerSnapshot::unobserved(&w), w)
    }

    /// Worker `id` holding `issue`, process alive, log written just now.
    fn holding(
        g: &mut IssueGraph,
        id: WorkerId,
        issue: IssueId,
        now: DateTime<Utc>,
    ) -> (WorkerSnapshot, Worker) {
        g.mark(issue, IssueStatus::InProgress, Some(id)).unwrap();
        let mut w = Worker::new(id);
        w.assign(
            issue,
            format!("b-{issue}"),
            PathBuf::from(format!("/wt/issue-{issue}")),
            now - ChronoDuration::hours(1),
        );
        let mut s = WorkerSnapshot::unobserved(&w);
        s.process_alive = true;
        s.log_size = 100;
        s.log_mtime = Some(now);
        (s, w)
    }

    fn kinds(actions: &[Action]) -> Vec<ActionKind> {
        actions.iter().map(|a| a.kind).collect()
    }

    fn split(pairs: Vec<(WorkerSnapshot, Worker)>) -> (Vec<WorkerSnapshot>, Vec<Worker>) {
        pairs.into_iter().unzip()
    }

    #[test]
    fn scenario_a_all_free_workers_assigned() {
        let g = graph(&[(52, 1, &[]), (56, 1, &[]), (61, 1, &[]), (55, 1, &[]), (57, 1, &[])]);
        let (snaps, workers) = split((1..=5).map(free).collect());

        let actions = decide(&snaps, &g, &workers, &policy(), Utc::now());
        assert_eq!(kinds(&actions), vec![ActionKind::Reassign; 5]);
        let assigned: Vec<_> = actions.iter().map(|a| a.new_issue_id.unwrap()).collect();
        assert_eq!(assigned, vec![52, 55, 56, 57, 61]);
        let workers: Vec<_> = actions.iter().map(|a| a.worker_id).collect();
        assert_eq!(workers, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn scenario_b_completion_unblocks_dependent() {
        let now = Utc::now();
        let mut g = graph(&[(52, 1, &[]), (53, 1, &[52])]);
        let (mut s, w) = holding(&mut g, 1, 52, now);
        s.process_alive = false;
        s.signal_present = true;
        s.signal_value = Some(0);
        s.new_commits = vec!["abc123 parser".into()];

        let actions = decide(&[s], &g, &[w], &policy(), now);
        assert_eq!(
            kinds(&actions),
            vec![
                ActionKind::Publish,
                ActionKind::MarkComplete,
                ActionKind::Reassign
            ]
        );
        assert_eq!(actions[0].issue_id, Some(52));
        assert_eq!(actions[2].new_issue_id, Some(53));
        // decide never touches the caller's graph
        assert_eq!(g.get(52).unwrap().status, IssueStatus::InProgress);
    }

    #[test]
    fn scenario_c_stall_restarts_once() {
        let now = Utc::now();
        let mut g = graph(&[(52, 1, &[])]);
        let (mut s, w) = holding(&mut g, 1, 52, now);
        s.log_mtime = Some(now - ChronoDuration::seconds(901));

        let actions = decide(&[s], &g, &[w], &policy(), now);
        assert_eq!(kinds(&actions), vec![ActionKind::Restart]);
        assert_eq!(actions[0].attempt, 0);
        assert!(actions[0].reason.starts_with("stalled"));
    }

    #[test]
    fn scenario_d_exit_zero_without_commits_is_failure() {
        let now = Utc::now();
        let mut g = graph(&[(52, 1, &[])]);
        let (mut s, mut w) = holding(&mut g, 1, 52, now);
        s.process_alive = false;
        s.signal_present = true;
        s.signal_value = Some(0);

        let actions = decide(&[s.clone()], &g, &[w.clone()], &policy(), now);
        assert_eq!(kinds(&actions), vec![ActionKind::Restart]);
        assert!(actions[0].reason.contains("no new commits"));

        w.retry_count = 3;
        let actions = decide(&[s], &g, &[w], &policy(), now);
        assert_eq!(kinds(&actions), vec![ActionKind::Skip]);
    }

    #[test]
    fn scenario_e_exhausted_retries_then_idle() {
        let now = Utc::now();
        let mut g = graph(&[(52, 1, &[])]);
        let (mut s, mut w) = holding(&mut g, 1, 52, now);
        s.process_alive = false;
        s.signal_present = true;
        s.signal_value = Some(1);
        w.retry_count = 3;

        let actions = decide(&[s], &g, &[w.clone()], &policy(), now);
        assert_eq!(kinds(&actions), vec![ActionKind::Skip]);

        // next cycle, after the executor failed the issue and freed the worker
        g.mark(52, IssueStatus::Failed, None).unwrap();
        w.release();
        w.status = WorkerStatus::Failed;
        let s = WorkerSnapshot::unobserved(&w);
        let actions = decide(&[s], &g, &[w], &policy(), now);
        assert_eq!(kinds(&actions), vec![ActionKind::Idle]);
    }

    #[test]
    fn orphaned_worker_treated_as_failed() {
        let now = Utc::now();
        let mut g = graph(&[(52, 1, &[])]);
        let (mut s, w) = holding(&mut g, 1, 52, now);
        s.process_alive = false;
        s.log_tail = "x".repeat(300);

        let actions = decide(&[s], &g, &[w], &policy(), now);
        assert_eq!(kinds(&actions), vec![ActionKind::Restart]);
        assert!(actions[0].continuation);
        assert!(actions[0].reason.contains("without a completion signal"));
    }

    #[test]
    fn stall_without_log_uses_start_time() {
        let now = Utc::now();
        let mut g = graph(&[(52, 1, &[])]);
        let (mut s, w) = holding(&mut g, 1, 52, now);
        s.log_mtime = None;
        s.log_size = 0;
        // started an hour ago, timeout 900s
        let actions = decide(&[s], &g, &[w], &policy(), now);
        assert_eq!(kinds(&actions), vec![ActionKind::Restart]);
    }

    #[test]
    fn alive_worker_without_any_timestamp_is_restarted() {
        let now = Utc::now();
        let mut g = graph(&[(52, 1, &[])]);
        let (mut s, mut w) = holding(&mut g, 1, 52, now);
        s.log_mtime = None;
        s.log_size = 0;
        w.started_at = None;

        let actions = decide(&[s.clone()], &g, &[w.clone()], &policy(), now);
        assert_eq!(kinds(&actions), vec![ActionKind::Restart]);
        assert!(actions[0].reason.contains("no start time"));

        w.retry_count = 3;
        let actions = decide(&[s], &g, &[w], &policy(), now);
        assert_eq!(kinds(&actions), vec![ActionKind::Skip]);
    }

    #[test]
    fn future_log_mtime_reads_as_fresh() {
        let now = Utc::now();
        let mut g = graph(&[(52, 1, &[])]);
        let (mut s, w) = holding(&mut g, 1, 52, now);
        s.log_mtime = Some(now + ChronoDuration::minutes(5));
        let actions = decide(&[s], &g, &[w], &policy(), now);
        assert_eq!(kinds(&actions), vec![ActionKind::Noop]);
    }

    #[test]
    fn worker_outside_pool_finishes_then_retires() {
        let now = Utc::now();
        let mut g = graph(&[(52, 1, &[]), (53, 1, &[])]);
        let (s, w) = holding(&mut g, 7, 52, now);
        let actions = decide(&[s.clone()], &g, &[w.clone()], &policy(), now);
        assert_eq!(kinds(&actions), vec![ActionKind::Noop]);

        let mut done = s;
        done.process_alive = false;
        done.signal_present = true;
        done.signal_value = Some(0);
        done.new_commits = vec!["abc123 parser".into()];
        let actions = decide(&[done], &g, &[w], &policy(), now);
        assert_eq!(
            kinds(&actions),
            vec![ActionKind::Publish, ActionKind::MarkComplete, ActionKind::Idle]
        );
        assert!(actions[2].reason.contains("retiring"));
    }

    #[test]
    fn healthy_worker_is_noop() {
        let now = Utc::now();
        let mut g = graph(&[(52, 1, &[])]);
        let (s, w) = holding(&mut g, 1, 52, now);
        let actions = decide(&[s], &g, &[w], &policy(), now);
        assert_eq!(kinds(&actions), vec![ActionKind::Noop]);
    }

    #[test]
    fn signal_while_alive_falls_through_to_liveness() {
        let now = Utc::now();
        let mut g = graph(&[(52, 1, &[])]);
        let (mut s, w) = holding(&mut g, 1, 52, now);
        s.signal_present = true;
        s.signal_value = Some(0);
        let actions = decide(&[s], &g, &[w], &policy(), now);
        assert_eq!(kinds(&actions), vec![ActionKind::Noop]);
    }

    #[test]
    fn zero_commit_success_when_commits_not_required() {
        let now = Utc::now();
        let mut g = graph(&[(52, 1, &[])]);
        let (mut s, w) = holding(&mut g, 1, 52, now);
        s.process_alive = false;
        s.signal_present = true;
        s.signal_value = Some(0);
        let mut p = policy();
        p.require_commits = false;

        let actions = decide(&[s], &g, &[w], &p, now);
        assert_eq!(kinds(&actions), vec![ActionKind::MarkComplete, ActionKind::Idle]);
    }

    #[test]
    fn multi_stage_pipeline_advances_before_completing() {
        let now = Utc::now();
        let mut g = graph(&[(52, 1, &[])]);
        let (mut s, w) = holding(&mut g, 1, 52, now);
        s.process_alive = false;
        s.signal_present = true;
        s.signal_value = Some(0);
        s.new_commits = vec!["abc impl".into()];
        let mut p = policy();
        p.pipeline = vec!["implement".into(), "write_tests".into()];

        let actions = decide(&[s.clone()], &g, &[w.clone()], &p, now);
        assert_eq!(kinds(&actions), vec![ActionKind::Publish, ActionKind::AdvanceStage]);
        assert_eq!(actions[1].stage, Some(0));

        g.set_stage(52, 1).unwrap();
        let actions = decide(&[s], &g, &[w], &p, now);
        assert_eq!(
            kinds(&actions),
            vec![ActionKind::Publish, ActionKind::MarkComplete, ActionKind::Idle]
        );
    }

    #[test]
    fn no_double_assignment_and_completion_visible_to_later_workers() {
        let now = Utc::now();
        let mut g = graph(&[(52, 1, &[]), (53, 2, &[52]), (54, 1, &[])]);
        let (mut s1, w1) = holding(&mut g, 1, 52, now);
        s1.process_alive = false;
        s1.signal_present = true;
        s1.signal_value = Some(0);
        s1.new_commits = vec!["abc".into()];
        let (s2, w2) = free(2);
        let (s3, w3) = free(3);

        let actions = decide(&[s3, s1, s2], &g, &[w1, w2, w3], &policy(), now);
        let reassigns: Vec<_> = actions
            .iter()
            .filter(|a| a.kind == ActionKind::Reassign)
            .map(|a| (a.worker_id, a.new_issue_id.unwrap()))
            .collect();
        // worker 1 frees first and takes #54 (wave 1); worker 2 gets #53
        assert_eq!(reassigns, vec![(1, 54), (2, 53)]);
        let last = actions.last().unwrap();
        assert_eq!((last.worker_id, last.kind), (3, ActionKind::Idle));
    }

    #[test]
    fn idle_worker_stays_quiet() {
        let mut g = graph(&[(52, 1, &[])]);
        g.mark(52, IssueStatus::InProgress, Some(9)).unwrap();
        let mut w = Worker::new(1);
        w.status = WorkerStatus::Idle;
        let s = WorkerSnapshot::unobserved(&w);
        let actions = decide(&[s], &g, &[w], &policy(), Utc::now());
        assert_eq!(kinds(&actions), vec![ActionKind::Noop]);
    }

    #[test]
    fn meaningful_output_heuristic() {
        assert!(!has_meaningful_output(""));
        assert!(!has_meaningful_output("short"));
        assert!(has_meaningful_output(&"a".repeat(250)));
        let crashed = format!("{}\nSegmentation fault", "a".repeat(250));
        assert!(!has_meaningful_output(&crashed));
    }

    #[test]
    fn attempt_carries_retry_count() {
        let now = Utc::now();
        let mut g = graph(&[(52, 1, &[])]);
        let (mut s, mut w) = holding(&mut g, 1, 52, now);
        s.process_alive = false;
        w.retry_count = 2;
        let actions = decide(&[s], &g, &[w], &policy(), now);
        assert_eq!(actions[0].attempt, 2);
        assert!(actions[0].reason.contains("retry 3/3"));
    }
}
