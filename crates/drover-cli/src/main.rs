mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use drover_core::types::IssueId;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "drover",
    about = "Drive a pool of autonomous agent workers through a dependency graph of issues",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file (default: search upward from cwd for drover.yaml)
    #[arg(long, global = true, env = "DROVER_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the session and worker windows, then start the first wave
    Launch {
        /// Print the actions the first cycle would take and exit
        #[arg(long)]
        dry_run: bool,

        /// Override the configured pool size
        #[arg(long)]
        workers: Option<u32>,
    },

    /// Run decision cycles until every issue is terminal
    Monitor {
        /// Skip the warm-up delay before the first cycle
        #[arg(long)]
        no_delay: bool,

        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,

        /// Seconds between cycles (overrides cycle_interval)
        #[arg(long, value_name = "SECS")]
        cycle: Option<u64>,
    },

    /// Show workers, issues, proposed actions and recent events
    Status,

    /// Append an issue to the backlog and wake the monitor
    AddIssue {
        id: IssueId,

        #[arg(long)]
        title: String,

        #[arg(long, default_value_t = 1)]
        wave: u32,

        #[arg(long, default_value_t = 1)]
        priority: u32,

        /// Issue type, e.g. implement or research
        #[arg(long = "type", default_value = "implement")]
        kind: String,

        /// Comma-separated issue ids this one depends on
        #[arg(long, value_delimiter = ',')]
        depends_on: Vec<IssueId>,

        #[arg(long)]
        description: Option<String>,
    },

    /// Stop the session and remove worker signals and worktrees
    Cleanup {
        /// Leave issue worktrees in place
        #[arg(long)]
        keep_worktrees: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Launch { .. } | Commands::Monitor { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = tokio::runtime::Runtime::new()
        .map_err(anyhow::Error::from)
        .and_then(|rt| rt.block_on(run(cli)));

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = root::resolve_config(cli.config.as_deref())?;
    let json = cli.json;

    match cli.command {
        Commands::Launch { dry_run, workers } => {
            cmd::launch::run(&config_path, dry_run, workers, json).await
        }
        Commands::Monitor {
            no_delay,
            once,
            cycle,
        } => cmd::monitor::run(&config_path, no_delay, once, cycle, json).await,
        Commands::Status => cmd::status::run(&config_path, json).await,
        Commands::AddIssue {
            id,
            title,
            wave,
            priority,
            kind,
            depends_on,
            description,
        } => cmd::add_issue::run(
            &config_path,
            cmd::add_issue::NewIssue {
                id,
                title,
                wave,
                priority,
                kind,
                depends_on,
                description,
            },
            json,
        ),
        Commands::Cleanup { keep_worktrees } => {
            cmd::cleanup::run(&config_path, keep_worktrees, json).await
        }
    }
}
