use crate::error::{DroverError, Result};
use crate::graph;
use crate::paths;
use crate::types::{is_valid_stage, IssueId, IssueStatus, VALID_STAGES};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// IssueDef
// ---------------------------------------------------------------------------

/// Immutable definition of one unit of work, as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueDef {
    pub id: IssueId,
    pub title: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_wave")]
    pub wave: u32,
    #[serde(default)]
    pub depends_on: BTreeSet<IssueId>,
    /// Initial status for issues the runtime overlay has never seen.
    #[serde(default)]
    pub status: IssueStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_kind() -> String {
    "implement".to_string()
}

fn default_priority() -> u32 {
    1
}

fn default_wave() -> u32 {
    1
}

impl IssueDef {
    pub fn new(id: IssueId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            kind: default_kind(),
            priority: default_priority(),
            wave: default_wave(),
            depends_on: BTreeSet::new(),
            status: IssueStatus::Pending,
            description: None,
        }
    }
}

// ---------------------------------------------------------------------------
// AgentConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Command line that runs one worker attempt; the prompt is appended as
    /// the final argument.
    #[serde(default = "default_agent_command")]
    pub command: String,
    /// Process name pattern used to decide whether a worker is still alive.
    #[serde(default = "default_process_pattern")]
    pub process_pattern: String,
}

fn default_agent_command() -> String {
    "claude -p --dangerously-skip-permissions".to_string()
}

fn default_process_pattern() -> String {
    "claude".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            process_pattern: default_process_pattern(),
        }
    }
}

impl AgentConfig {
    /// First word of the command, used for prerequisite checks.
    pub fn program(&self) -> &str {
        self.command.split_whitespace().next().unwrap_or("")
    }
}

// ---------------------------------------------------------------------------
// RepoConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoConfig {
    #[serde(default = "default_repo_path")]
    pub path: PathBuf,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    #[serde(default)]
    pub branch_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_base: Option<PathBuf>,
    #[serde(default = "default_remote")]
    pub remote: String,
}

fn default_repo_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_remote() -> String {
    "origin".to_string()
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            path: default_repo_path(),
            default_branch: default_branch(),
            branch_prefix: String::new(),
            worktree_base: None,
            remote: default_remote(),
        }
    }
}

// ---------------------------------------------------------------------------
// ProjectContext
// ---------------------------------------------------------------------------

/// Project facts injected into worker prompts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectContext {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub language: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub build_command: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub test_command: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub commit_prefix: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub safety_rules: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_files: Vec<String>,
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Scheduling knobs consumed by the decision engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub max_retries: u32,
    pub stall_timeout: Duration,
    /// Exit code 0 with no new commits counts as failure when set.
    pub require_commits: bool,
    pub pipeline: Vec<String>,
    /// Workers above this id finish what they hold and take no new work.
    pub pool_size: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            stall_timeout: Duration::from_secs(default_stall_timeout()),
            require_commits: true,
            pipeline: default_pipeline(),
            pool_size: default_workers(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub project: String,
    #[serde(default = "default_session")]
    pub session: String,
    #[serde(default = "default_workers")]
    pub workers: u32,
    /// Seconds between decision cycles.
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval: u64,
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_stagger_delay")]
    pub stagger_delay: u64,
    /// Upper bound in seconds for a single external call made by the executor.
    #[serde(default = "default_action_timeout")]
    pub action_timeout: u64,
    #[serde(default = "default_true")]
    pub require_commits: bool,
    #[serde(default = "default_pipeline")]
    pub pipeline: Vec<String>,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub repo: RepoConfig,
    #[serde(default)]
    pub context: ProjectContext,
    #[serde(default)]
    pub issues: Vec<IssueDef>,

    /// Directory holding the config file; relative paths resolve against it.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

fn default_session() -> String {
    "drover".to_string()
}

fn default_workers() -> u32 {
    5
}

fn default_cycle_interval() -> u64 {
    900
}

fn default_stall_timeout() -> u64 {
    900
}

fn default_max_retries() -> u32 {
    3
}

fn default_stagger_delay() -> u64 {
    30
}

fn default_action_timeout() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn default_pipeline() -> Vec<String> {
    vec!["implement".to_string()]
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(paths::DEFAULT_STATE_DIR)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project: String::new(),
            session: default_session(),
            workers: default_workers(),
            cycle_interval: default_cycle_interval(),
            stall_timeout: default_stall_timeout(),
            max_retries: default_max_retries(),
            stagger_delay: default_stagger_delay(),
            action_timeout: default_action_timeout(),
            require_commits: true,
            pipeline: default_pipeline(),
            state_dir: default_state_dir(),
            agent: AgentConfig::default(),
            repo: RepoConfig::default(),
            context: ProjectContext::default(),
            issues: Vec::new(),
            base_dir: PathBuf::from("."),
        }
    }
}

impl Config {
    /// Parse the config file at `path` without validating it.
    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DroverError::ConfigNotFound(path.display().to_string()));
        }
        let data = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&data)?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(config)
    }

    /// Parse and validate. A malformed or cyclic issue graph is fatal here.
    pub fn load(path: &Path) -> Result<Self> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(path, data.as_bytes())
    }

    /// Append a new issue definition to the config file at `path`.
    ///
    /// The file is only rewritten if the extended configuration still
    /// validates (known dependencies, no cycle, unique id).
    pub fn add_issue(path: &Path, def: IssueDef) -> Result<Self> {
        let mut config = Self::read(path)?;
        if config.issue(def.id).is_some() {
            return Err(DroverError::IssueExists(def.id));
        }
        config.issues.push(def);
        config.validate()?;
        config.save(path)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.workers == 0 {
            errors.push("workers must be at least 1".to_string());
        }
        if self.issues.is_empty() {
            errors.push("no issues configured".to_string());
        }
        if self.pipeline.is_empty() {
            errors.push("pipeline is empty: at least one stage is required".to_string());
        }
        for stage in &self.pipeline {
            if !is_valid_stage(stage) {
                errors.push(format!(
                    "invalid pipeline stage '{stage}' (valid: {})",
                    VALID_STAGES.join(", ")
                ));
            }
        }

        let mut seen = HashSet::new();
        for issue in &self.issues {
            if !seen.insert(issue.id) {
                errors.push(format!("duplicate issue id #{}", issue.id));
            }
            if issue.depends_on.contains(&issue.id) {
                errors.push(format!("issue #{} depends on itself", issue.id));
            }
        }

        if !errors.is_empty() {
            return Err(DroverError::Config(errors));
        }

        graph::topo_order(&self.issues)?;
        Ok(())
    }

    pub fn issue(&self, id: IssueId) -> Option<&IssueDef> {
        self.issues.iter().find(|i| i.id == id)
    }

    pub fn policy(&self) -> Policy {
        Policy {
            max_retries: self.max_retries,
            stall_timeout: Duration::from_secs(self.stall_timeout),
            require_commits: self.require_commits,
            pipeline: self.pipeline.clone(),
            pool_size: self.workers,
        }
    }

    // -----------------------------------------------------------------------
    // Resolved paths
    // -----------------------------------------------------------------------

    fn resolve(&self, p: &Path) -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base_dir.join(p)
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.resolve(&self.state_dir)
    }

    pub fn repo_path(&self) -> PathBuf {
        self.resolve(&self.repo.path)
    }

    pub fn worktree_base(&self) -> PathBuf {
        match &self.repo.worktree_base {
            Some(base) => self.resolve(base),
            None => {
                let repo = self.repo_path();
                let name = repo
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "repo".to_string());
                repo.with_file_name(format!("{name}-worktrees"))
            }
        }
    }

    pub fn branch_for(&self, issue: IssueId) -> String {
        format!("{}{issue}", self.repo.branch_prefix)
    }

    pub fn worktree_for(&self, issue: IssueId) -> PathBuf {
        self.worktree_base().join(format!("issue-{issue}"))
    }

    /// Ref that new commits are counted against.
    pub fn base_ref(&self) -> String {
        format!("{}/{}", self.repo.remote, self.repo.default_branch)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
project: proof
workers: 2
repo:
  path: ../repo
  branch_prefix: proof-
issues:
  - id: 52
    title: Parser
  - id: 53
    title: Checker
    depends_on: [52]
    wave: 2
"#;

    fn write(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("drover.yaml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn load_applies_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(&write(&dir, SAMPLE)).unwrap();
        assert_eq!(config.project, "proof");
        assert_eq!(config.workers, 2);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.cycle_interval, 900);
        assert_eq!(config.pipeline, vec!["implement".to_string()]);
        assert_eq!(config.issues[0].kind, "implement");
        assert_eq!(config.issues[0].priority, 1);
        assert_eq!(config.issues[1].wave, 2);
        assert!(config.require_commits);
    }

    #[test]
    fn resolved_paths_are_relative_to_config() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(&write(&dir, SAMPLE)).unwrap();
        assert_eq!(config.state_dir(), dir.path().join(".drover"));
        assert_eq!(config.repo_path(), dir.path().join("../repo"));
        assert_eq!(config.branch_for(52), "proof-52");
        assert!(config
            .worktree_for(52)
            .ends_with("repo-worktrees/issue-52"));
        assert_eq!(config.base_ref(), "origin/main");
    }

    #[test]
    fn missing_config_is_reported() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(&dir.path().join("drover.yaml")).unwrap_err();
        assert!(matches!(err, DroverError::ConfigNotFound(_)));
    }

    #[test]
    fn undefined_dependency_rejected() {
        let dir = TempDir::new().unwrap();
        let body = "issues:\n  - id: 1\n    title: a\n    depends_on: [9]\n";
        let err = Config::load(&write(&dir, body)).unwrap_err();
        assert!(matches!(
            err,
            DroverError::UnknownDependency {
                issue: 1,
                dependency: 9
            }
        ));
    }

    #[test]
    fn cyclic_graph_rejected() {
        let dir = TempDir::new().unwrap();
        let body = r#"
issues:
  - { id: 1, title: a, depends_on: [3] }
  - { id: 2, title: b, depends_on: [1] }
  - { id: 3, title: c, depends_on: [2] }
"#;
        let err = Config::load(&write(&dir, body)).unwrap_err();
        assert!(matches!(err, DroverError::DependencyCycle(_)), "{err}");
    }

    #[test]
    fn invalid_stage_and_duplicates_collected() {
        let dir = TempDir::new().unwrap();
        let body = r#"
pipeline: [implement, deploy]
issues:
  - { id: 1, title: a }
  - { id: 1, title: again }
"#;
        match Config::load(&write(&dir, body)).unwrap_err() {
            DroverError::Config(errors) => {
                assert_eq!(errors.len(), 2, "{errors:?}");
                assert!(errors.iter().any(|e| e.contains("deploy")));
                assert!(errors.iter().any(|e| e.contains("duplicate")));
            }
            other => panic!("expected Config, got {other:?}"),
        }
    }

    #[test]
    fn add_issue_appends_and_persists() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, SAMPLE);
        let mut def = IssueDef::new(60, "Late addition");
        def.wave = 99;
        Config::add_issue(&path, def).unwrap();

        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.issues.len(), 3);
        assert_eq!(reloaded.issue(60).unwrap().wave, 99);
    }

    #[test]
    fn add_issue_rejects_duplicate_and_bad_dependency() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, SAMPLE);
        assert!(matches!(
            Config::add_issue(&path, IssueDef::new(52, "dup")),
            Err(DroverError::IssueExists(52))
        ));

        let mut def = IssueDef::new(61, "orphan");
        def.depends_on.insert(404);
        assert!(Config::add_issue(&path, def).is_err());
        assert_eq!(Config::load(&path).unwrap().issues.len(), 2);
    }
}
