use serde::{Deserialize, Serialize};
use std::fmt;

pub type IssueId = u64;
pub type WorkerId = u32;

// ---------------------------------------------------------------------------
// IssueStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl IssueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueStatus::Pending => "pending",
            IssueStatus::InProgress => "in_progress",
            IssueStatus::Completed => "completed",
            IssueStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, IssueStatus::Completed | IssueStatus::Failed)
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// WorkerStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Pending,
    Running,
    Idle,
    Failed,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Pending => "pending",
            WorkerStatus::Running => "running",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ActionKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Noop,
    Publish,
    MarkComplete,
    AdvanceStage,
    Reassign,
    Restart,
    Skip,
    Idle,
    Shutdown,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Noop => "noop",
            ActionKind::Publish => "publish",
            ActionKind::MarkComplete => "mark_complete",
            ActionKind::AdvanceStage => "advance_stage",
            ActionKind::Reassign => "reassign",
            ActionKind::Restart => "restart",
            ActionKind::Skip => "skip",
            ActionKind::Idle => "idle",
            ActionKind::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Pipeline stages
// ---------------------------------------------------------------------------

pub const VALID_STAGES: &[&str] = &[
    "implement",
    "optimize",
    "write_tests",
    "run_tests_fix",
    "document",
    "research",
    "draft",
    "validate",
    "review",
];

pub fn is_valid_stage(stage: &str) -> bool {
    VALID_STAGES.contains(&stage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_status_serializes_snake_case() {
        let yaml = serde_yaml::to_string(&IssueStatus::InProgress).unwrap();
        assert_eq!(yaml.trim(), "in_progress");
        let parsed: IssueStatus = serde_yaml::from_str("completed").unwrap();
        assert_eq!(parsed, IssueStatus::Completed);
    }

    #[test]
    fn terminal_statuses() {
        assert!(IssueStatus::Completed.is_terminal());
        assert!(IssueStatus::Failed.is_terminal());
        assert!(!IssueStatus::Pending.is_terminal());
        assert!(!IssueStatus::InProgress.is_terminal());
    }

    #[test]
    fn action_kind_display_matches_serde() {
        for kind in [
            ActionKind::MarkComplete,
            ActionKind::AdvanceStage,
            ActionKind::Reassign,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{kind}\""));
        }
    }

    #[test]
    fn stage_names() {
        assert!(is_valid_stage("implement"));
        assert!(is_valid_stage("review"));
        assert!(!is_valid_stage("deploy"));
    }
}
