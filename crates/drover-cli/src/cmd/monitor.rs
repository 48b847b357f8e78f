use super::{adapters, load_config};
use crate::output::print_json;
use drover_core::monitor::{Monitor, RunOptions};
use std::path::Path;
use std::time::Duration;

/// Warm-up before the first cycle so freshly launched workers get going.
const WARM_UP: Duration = Duration::from_secs(60);

pub async fn run(
    config_path: &Path,
    no_delay: bool,
    once: bool,
    cycle: Option<u64>,
    json: bool,
) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let (session, git) = adapters(&config);

    let opts = RunOptions {
        initial_delay: if no_delay { Duration::ZERO } else { WARM_UP },
        cycle_interval: Duration::from_secs(cycle.unwrap_or(config.cycle_interval)),
        once,
    };
    tracing::info!(
        session = %config.session,
        workers = config.workers,
        cycle_secs = opts.cycle_interval.as_secs(),
        "monitor starting"
    );

    let mut monitor = Monitor::new(config, Some(config_path.to_path_buf()), &session, &git);
    let summary = monitor.run(&opts).await?;

    if json {
        return print_json(&summary);
    }
    let state = if summary.finished {
        "all work finished"
    } else {
        "stopped"
    };
    println!(
        "{state} after {} cycle(s): {} completed, {} failed, {} in progress, {} pending",
        summary.cycles, summary.completed, summary.failed, summary.in_progress, summary.pending
    );
    Ok(())
}
