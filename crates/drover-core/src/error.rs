use thiserror::Error;

use crate::types::{IssueId, IssueStatus, WorkerId};

#[derive(Debug, Error)]
pub enum DroverError {
    #[error("config not found: {0}")]
    ConfigNotFound(String),

    #[error("invalid config:\n  - {}", .0.join("\n  - "))]
    Config(Vec<String>),

    #[error("issue #{issue} depends on #{dependency}, which is not defined")]
    UnknownDependency { issue: IssueId, dependency: IssueId },

    #[error("dependency cycle among issues: {}", format_ids(.0))]
    DependencyCycle(Vec<IssueId>),

    #[error("issue not found: #{0}")]
    IssueNotFound(IssueId),

    #[error("issue already exists: #{0}")]
    IssueExists(IssueId),

    #[error("invalid transition for issue #{issue} from {from} to {to}: {reason}")]
    InvalidTransition {
        issue: IssueId,
        from: IssueStatus,
        to: IssueStatus,
        reason: String,
    },

    #[error("worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("{action} failed: {reason}")]
    Transient { action: String, reason: String },

    #[error("{what} timed out after {secs}s")]
    Timeout { what: String, secs: u64 },

    #[error("session error: {0}")]
    Session(String),

    #[error("vcs error: {0}")]
    Vcs(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl DroverError {
    /// Errors that leave state untouched so the next cycle re-observes the
    /// same condition and retries the same action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DroverError::Transient { .. }
                | DroverError::Timeout { .. }
                | DroverError::Session(_)
                | DroverError::Vcs(_)
                | DroverError::Io(_)
        )
    }
}

fn format_ids(ids: &[IssueId]) -> String {
    ids.iter()
        .map(|id| format!("#{id}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, DroverError>;
