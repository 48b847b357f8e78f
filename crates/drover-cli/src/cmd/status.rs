use super::{adapters, load_config};
use crate::output::{print_json, print_rows, WorkerRow};
use drover_core::decision::Action;
use drover_core::event_log::{self, Event};
use drover_core::graph::Issue;
use drover_core::monitor::{Monitor, Observation};
use drover_core::prober::WorkerSnapshot;
use drover_core::types::IssueStatus;
use drover_core::Worker;
use serde::Serialize;
use std::path::Path;

const RECENT_EVENTS: usize = 10;

#[derive(Serialize)]
struct IssueCounts {
    total: usize,
    pending: usize,
    in_progress: usize,
    completed: usize,
    failed: usize,
}

#[derive(Serialize)]
struct StatusOutput<'a> {
    project: &'a str,
    session: &'a str,
    issues: IssueCounts,
    workers: &'a [Worker],
    snapshots: &'a [WorkerSnapshot],
    ready: Vec<&'a Issue>,
    blocked: Vec<&'a Issue>,
    failed: Vec<&'a Issue>,
    repairs: &'a [String],
    actions: &'a [Action],
    events: &'a [Event],
}

pub async fn run(config_path: &Path, json: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let (session, git) = adapters(&config);
    let Observation {
        graph,
        workers,
        snapshots,
        actions,
        repairs,
    } = Monitor::new(config.clone(), None, &session, &git)
        .preview()
        .await?;
    let events = event_log::tail(&config.state_dir(), RECENT_EVENTS)?;

    let ready = graph.ready_issues();
    let blocked = graph.blocked_issues();
    let failed: Vec<&Issue> = graph
        .issues()
        .filter(|i| i.status == IssueStatus::Failed)
        .collect();

    if json {
        return print_json(&StatusOutput {
            project: &config.project,
            session: &config.session,
            issues: IssueCounts {
                total: graph.len(),
                pending: graph.count(IssueStatus::Pending),
                in_progress: graph.count(IssueStatus::InProgress),
                completed: graph.count(IssueStatus::Completed),
                failed: graph.count(IssueStatus::Failed),
            },
            workers: &workers,
            snapshots: &snapshots,
            ready,
            blocked,
            failed,
            repairs: &repairs,
            actions: &actions,
            events: &events,
        });
    }

    println!(
        "Project: {}  Session: {}  Issues: {} completed, {} in progress, {} pending, {} failed",
        config.project,
        config.session,
        graph.count(IssueStatus::Completed),
        graph.count(IssueStatus::InProgress),
        graph.count(IssueStatus::Pending),
        graph.count(IssueStatus::Failed),
    );
    println!();

    print_rows(
        workers
            .iter()
            .zip(&snapshots)
            .map(|(worker, snapshot)| WorkerRow { worker, snapshot }),
    );

    if !ready.is_empty() {
        println!();
        println!("Ready:");
        for i in &ready {
            println!("  #{} (wave {}, priority {}) {}", i.id, i.wave, i.priority, i.title);
        }
    }
    if !blocked.is_empty() {
        println!();
        println!("Blocked:");
        for i in &blocked {
            let deps: Vec<String> = i.depends_on.iter().map(|d| format!("#{d}")).collect();
            println!("  #{} {} (waiting on {})", i.id, i.title, deps.join(", "));
        }
    }
    if !failed.is_empty() {
        println!();
        println!("Failed:");
        for i in &failed {
            println!("  #{} {}", i.id, i.title);
        }
    }
    if !repairs.is_empty() {
        println!();
        println!("State repairs pending:");
        for r in &repairs {
            println!("  {r}");
        }
    }

    println!();
    println!("Proposed actions:");
    for a in &actions {
        println!("  {}", a.summary());
    }

    if !events.is_empty() {
        println!();
        println!("Recent events:");
        for e in &events {
            let issue = match (e.issue_id, e.new_issue_id) {
                (_, Some(new)) => format!(" -> #{new}"),
                (Some(id), None) => format!(" #{id}"),
                (None, None) => String::new(),
            };
            println!(
                "  {} worker-{} {}{issue}: {}",
                e.timestamp.format("%Y-%m-%d %H:%M:%S"),
                e.worker_id,
                e.action,
                e.reason
            );
        }
    }
    Ok(())
}
