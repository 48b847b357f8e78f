use super::load_config;
use crate::output::print_json;
use anyhow::Context;
use drover_core::monitor::request_wake;
use drover_core::types::IssueId;
use drover_core::{Config, IssueDef};
use std::path::Path;

pub struct NewIssue {
    pub id: IssueId,
    pub title: String,
    pub wave: u32,
    pub priority: u32,
    pub kind: String,
    pub depends_on: Vec<IssueId>,
    pub description: Option<String>,
}

pub fn run(config_path: &Path, new: NewIssue, json: bool) -> anyhow::Result<()> {
    // surface an already-broken config before touching it
    load_config(config_path)?;

    let mut def = IssueDef::new(new.id, new.title);
    def.wave = new.wave;
    def.priority = new.priority;
    def.kind = new.kind;
    def.depends_on = new.depends_on.into_iter().collect();
    def.description = new.description;

    let config = Config::add_issue(config_path, def)
        .with_context(|| format!("cannot add issue #{}", new.id))?;
    request_wake(&config.state_dir()).context("failed to wake the monitor")?;

    if json {
        let added = config.issue(new.id);
        return print_json(&added);
    }
    println!("Added issue #{} ({} issues total)", new.id, config.issues.len());
    Ok(())
}
