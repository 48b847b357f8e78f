use crate::decision::Action;
use crate::error::Result;
use crate::paths;
use crate::types::{ActionKind, IssueId, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One executed action, as appended to `events.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub action: ActionKind,
    pub worker_id: WorkerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<IssueId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_issue_id: Option<IssueId>,
    pub reason: String,
}

impl Event {
    pub fn record(action: &Action, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            action: action.kind,
            worker_id: action.worker_id,
            issue_id: action.issue_id,
            new_issue_id: action.new_issue_id,
            reason: action.reason.clone(),
        }
    }
}

pub fn append(state_dir: &Path, event: &Event) -> Result<()> {
    let line = serde_json::to_string(event)?;
    crate::io::append_line(&paths::event_log_path(state_dir), &line)
}

/// Last `n` events, oldest first. Lines that fail to parse (a torn final
/// write after a crash) are skipped.
pub fn tail(state_dir: &Path, n: usize) -> Result<Vec<Event>> {
    let Some(data) = crate::io::read_if_exists(&paths::event_log_path(state_dir))? else {
        return Ok(Vec::new());
    };
    let events: Vec<Event> = data
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| match serde_json::from_str(l) {
            Ok(e) => Some(e),
            Err(err) => {
                tracing::debug!(error = %err, "skipping unreadable event line");
                None
            }
        })
        .collect();
    let skip = events.len().saturating_sub(n);
    Ok(events.into_iter().skip(skip).collect())
}
