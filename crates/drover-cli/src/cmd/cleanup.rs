use super::{adapters, load_config};
use crate::output::print_json;
use anyhow::Context;
use drover_core::adapters::{SessionAdapter, Vcs};
use drover_core::paths;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Serialize)]
struct CleanupReport {
    session: String,
    signals_removed: usize,
    worktrees_removed: Vec<PathBuf>,
    worktrees_failed: Vec<PathBuf>,
}

pub async fn run(config_path: &Path, keep_worktrees: bool, json: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let (session, git) = adapters(&config);

    session.kill_session().await?;

    let state_dir = config.state_dir();
    let signals_removed = remove_signals(&paths::workers_dir(&state_dir))?;

    let mut worktrees_removed = Vec::new();
    let mut worktrees_failed = Vec::new();
    if !keep_worktrees {
        let repo = config.repo_path();
        for wt in issue_worktrees(&config.worktree_base())? {
            match git.remove_worktree(&repo, &wt).await {
                Ok(()) => worktrees_removed.push(wt),
                Err(e) => {
                    tracing::warn!(worktree = %wt.display(), error = %e, "worktree removal failed");
                    worktrees_failed.push(wt);
                }
            }
        }
        if let Err(e) = git.prune_worktrees(&repo).await {
            tracing::warn!(error = %e, "worktree prune failed");
        }
    }

    let report = CleanupReport {
        session: config.session.clone(),
        signals_removed,
        worktrees_removed,
        worktrees_failed,
    };
    if json {
        return print_json(&report);
    }
    println!("Stopped session '{}'", report.session);
    println!("Removed {} signal file(s)", report.signals_removed);
    if keep_worktrees {
        println!("Worktrees kept");
    } else {
        println!("Removed {} worktree(s)", report.worktrees_removed.len());
        for wt in &report.worktrees_failed {
            println!("  could not remove {}", wt.display());
        }
    }
    Ok(())
}

fn remove_signals(workers_dir: &Path) -> anyhow::Result<usize> {
    let entries = match std::fs::read_dir(workers_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).context("failed to read workers directory"),
    };
    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        let is_signal = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(".signal") || n.ends_with(".signal.tmp"));
        if is_signal && drover_core::io::remove_if_exists(&path)? {
            removed += 1;
        }
    }
    Ok(removed)
}

/// `issue-*` directories directly under the worktree base.
fn issue_worktrees(base: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(base) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).context("failed to read worktree base"),
    };
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry?;
        let is_issue = entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.starts_with("issue-"));
        if is_issue && entry.file_type()?.is_dir() {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}
