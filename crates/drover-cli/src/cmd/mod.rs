pub mod add_issue;
pub mod cleanup;
pub mod launch;
pub mod monitor;
pub mod status;

use anyhow::Context;
use drover_core::adapters::{Git, TmuxSession};
use drover_core::Config;
use std::path::Path;
use std::time::Duration;

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    Config::load(path).with_context(|| format!("failed to load {}", path.display()))
}

/// Production adapters for a config.
pub fn adapters(config: &Config) -> (TmuxSession, Git) {
    (
        TmuxSession::new(config.session.clone()),
        Git::new(Duration::from_secs(config.action_timeout)),
    )
}
