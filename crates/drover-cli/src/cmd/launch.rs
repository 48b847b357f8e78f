use super::{adapters, load_config};
use crate::output::{print_json, print_rows};
use anyhow::{bail, Context};
use drover_core::adapters::{SessionAdapter, Vcs};
use drover_core::decision::Action;
use drover_core::executor::Executor;
use drover_core::monitor::Monitor;
use drover_core::paths;
use drover_core::types::ActionKind;
use drover_core::Worker;
use std::path::Path;
use std::time::Duration;

pub async fn run(
    config_path: &Path,
    dry_run: bool,
    workers: Option<u32>,
    json: bool,
) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(n) = workers {
        config.workers = n;
        config.validate().context("invalid --workers")?;
    }

    let missing = missing_prerequisites(config.agent.program());
    if !missing.is_empty() {
        if !dry_run {
            bail!("missing prerequisites on PATH: {}", missing.join(", "));
        }
        for tool in &missing {
            eprintln!("warning: {tool} not found on PATH");
        }
    }

    let (session, git) = adapters(&config);

    if dry_run {
        let observation = Monitor::new(config.clone(), None, &session, &git)
            .with_pool_size(config.workers)
            .preview()
            .await?;
        let launches: Vec<&Action> = observation
            .actions
            .iter()
            .filter(|a| a.kind == ActionKind::Reassign)
            .collect();
        if json {
            return print_json(&launches);
        }
        println!(
            "Would launch {} worker(s) in session '{}':",
            launches.len(),
            config.session
        );
        print_rows(&launches);
        return Ok(());
    }

    git.fetch(&config.repo_path(), &config.repo.remote)
        .await
        .with_context(|| format!("failed to fetch {}", config.repo.remote))?;

    let state_dir = config.state_dir();
    Worker::init_pool(&state_dir, config.workers)?;
    // monitor and status size the pool from this, not the config file
    Worker::record_pool_size(&state_dir, config.workers)?;
    session
        .ensure_session()
        .await
        .context("failed to create session")?;
    for id in 1..=config.workers {
        session.ensure_window(&paths::worker_window(id)).await?;
    }

    let observation = Monitor::new(config.clone(), None, &session, &git)
        .observe()
        .await?;
    let (mut graph, mut pool) = (observation.graph, observation.workers);
    let launches: Vec<Action> = observation
        .actions
        .into_iter()
        .filter(|a| a.kind == ActionKind::Reassign)
        .collect();

    let executor = Executor::new(&config, &session, &git);
    let stagger = Duration::from_secs(config.stagger_delay);
    let mut launched = Vec::new();
    for (i, action) in launches.iter().enumerate() {
        if i > 0 && !stagger.is_zero() {
            tracing::info!(secs = stagger.as_secs(), "staggering next launch");
            tokio::time::sleep(stagger).await;
        }
        let Some(worker) = pool.iter_mut().find(|w| w.worker_id == action.worker_id) else {
            continue;
        };
        match executor.execute(action, &mut graph, worker).await {
            Ok(_) => launched.push(action),
            Err(e) => {
                tracing::warn!(worker_id = action.worker_id, error = %e, "launch failed");
            }
        }
    }

    if json {
        return print_json(&launched);
    }
    println!(
        "Launched {}/{} worker(s). Attach with: tmux attach -t {}",
        launched.len(),
        launches.len(),
        config.session
    );
    print_rows(&launched);
    Ok(())
}

/// Tools that must be on PATH for a real launch.
fn missing_prerequisites(agent: &str) -> Vec<String> {
    ["tmux", "git", "pgrep", agent]
        .into_iter()
        .filter(|tool| which::which(tool).is_err())
        .map(str::to_string)
        .collect()
}
