use anyhow::bail;
use drover_core::paths::CONFIG_FILE;
use std::path::{Path, PathBuf};

/// Resolve the config file.
///
/// Priority:
/// 1. `--config` flag / `DROVER_CONFIG` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `drover.yaml`
pub fn resolve_config(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    match find_config(&cwd) {
        Some(path) => Ok(path),
        None => bail!(
            "no {CONFIG_FILE} in {} or any parent directory (use --config)",
            cwd.display()
        ),
    }
}

fn find_config(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(CONFIG_FILE))
        .find(|candidate| candidate.is_file())
}
