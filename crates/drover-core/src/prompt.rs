use crate::config::Config;
use crate::decision::CRASH_MARKERS;
use crate::graph::Issue;
use crate::worker::Worker;
use regex::Regex;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::OnceLock;

const MAX_HINT_LINES: usize = 5;
const MAX_HINT_CHARS: usize = 120;

/// Progress carried into a restarted attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Continuation {
    pub commits: Vec<String>,
    pub diff_stat: String,
    pub status: String,
    pub failure_hint: String,
}

static ERROR_RE: OnceLock<Regex> = OnceLock::new();

fn error_re() -> &'static Regex {
    ERROR_RE.get_or_init(|| {
        Regex::new(
            r"FAIL|panic:|fatal:|[Ee]rror:|compilation failed|build failed|cannot |undefined:",
        )
        .unwrap()
    })
}

/// Compact failure reason from a transcript: up to five distinct error lines,
/// scanned from the end, returned in log order.
pub fn failure_hint(log: &str) -> String {
    let lines: Vec<&str> = log.lines().collect();
    if lines.iter().all(|l| l.trim().is_empty()) {
        return "Empty log: the agent did no work.".to_string();
    }

    let last = lines[lines.len().saturating_sub(5)..].join("\n");
    if CRASH_MARKERS[..2].iter().any(|m| last.contains(m)) {
        return "Agent API error (no messages returned). No work was done, start fresh."
            .to_string();
    }

    let mut seen = HashSet::new();
    let mut hits = Vec::new();
    for line in lines.iter().rev() {
        let stripped = line.trim();
        if stripped.is_empty() || !error_re().is_match(stripped) || !seen.insert(stripped) {
            continue;
        }
        hits.push(stripped.chars().take(MAX_HINT_CHARS).collect::<String>());
        if hits.len() >= MAX_HINT_LINES {
            break;
        }
    }

    if hits.is_empty() {
        return "Unknown: no error pattern found in the log. Check git status for clues."
            .to_string();
    }
    hits.reverse();
    hits.join("\n")
}

/// Render the prompt for one attempt at `stage` of `issue`.
pub fn render(
    stage: &str,
    issue: &Issue,
    worker: &Worker,
    config: &Config,
    continuation: Option<&Continuation>,
) -> String {
    let mut out = header(stage, issue, worker, config);
    out.push('\n');
    out.push_str(&stage_body(stage, issue, config));
    if let Some(c) = continuation {
        out.push('\n');
        out.push_str(&continuation_section(c));
    }
    out.push('\n');
    out.push_str(&footer(issue, worker, config));
    out
}

fn header(stage: &str, issue: &Issue, worker: &Worker, config: &Config) -> String {
    let ctx = &config.context;
    let branch = worker
        .branch
        .clone()
        .unwrap_or_else(|| config.branch_for(issue.id));
    let workspace = worker
        .workspace
        .clone()
        .unwrap_or_else(|| config.worktree_for(issue.id));
    let project = if config.project.is_empty() {
        "this"
    } else {
        config.project.as_str()
    };

    let mut s = String::new();
    let _ = writeln!(
        s,
        "You are an autonomous worker in the **{stage}** stage for the {project} project.\n"
    );
    let _ = writeln!(s, "## Your Assignment\n");
    let _ = writeln!(s, "**Issue #{}**: {}", issue.id, issue.title);
    let _ = writeln!(s, "**Branch**: {branch}");
    let _ = writeln!(s, "**Worktree**: {}", workspace.display());
    let _ = writeln!(s, "**Worker ID**: {}", worker.worker_id);
    let _ = writeln!(s, "**Pipeline stage**: {stage}\n");

    if let Some(desc) = &issue.description {
        let _ = writeln!(s, "## Issue Details\n\n{}\n", desc.trim());
    }

    let _ = writeln!(s, "## Repository Context\n");
    let _ = writeln!(
        s,
        "This is a git worktree branched from {}.",
        config.repo.default_branch
    );
    if !ctx.language.is_empty() {
        let _ = writeln!(s, "Language: {}", ctx.language);
    }

    let _ = writeln!(s, "\n## Critical Rules\n");
    let mut rules = vec![
        "**Redirect verbose output to log files.** Use `> /tmp/<name>.log 2>&1`.".to_string(),
    ];
    rules.extend(ctx.safety_rules.iter().cloned());
    rules.push("**Read CLAUDE.md first** if the repo has one.".to_string());
    for (i, rule) in rules.iter().enumerate() {
        let _ = writeln!(s, "{}. {rule}", i + 1);
    }

    if !ctx.key_files.is_empty() {
        let _ = writeln!(s, "\n## Key Files\n");
        for f in &ctx.key_files {
            let _ = writeln!(s, "- `{f}`");
        }
    }
    s
}

fn stage_body(stage: &str, issue: &Issue, config: &Config) -> String {
    let ctx = &config.context;
    let build = or_default(&ctx.build_command, "the build command");
    let test = or_default(&ctx.test_command, "the test command");
    let base = config.base_ref();
    let id = issue.id;

    match stage {
        "implement" => format!(
            "## Workflow: Implement\n\n\
             1. Understand the existing code before changing it\n\
             2. Implement the change described in the issue\n\
             3. Build with {build} and run {test}\n\
             4. Fix any failures and add tests for the new code\n\
             5. Commit your work\n"
        ),
        "optimize" => format!(
            "## Workflow: Optimize\n\n\
             Improve the code on this branch WITHOUT changing behavior.\n\n\
             1. Review the branch: `git diff --stat {base}`\n\
             2. Simplify, remove dead code, tighten error handling\n\
             3. Do not rename cosmetically or add features\n\
             4. Build with {build}, run {test}, commit\n"
        ),
        "write_tests" => format!(
            "## Workflow: Write Tests\n\n\
             1. List changed files: `git diff --stat {base}`\n\
             2. Cover every public function: happy path, edge cases, error paths\n\
             3. Follow existing test patterns; no flaky tests\n\
             4. Run {test} and commit\n"
        ),
        "run_tests_fix" => format!(
            "## Workflow: Run Tests and Fix\n\n\
             1. Run {test}\n\
             2. For each failure decide whether the test or the code is wrong\n\
             3. Fix the root cause, prefer fixing code over weakening tests\n\
             4. Repeat until green, build with {build}, commit\n"
        ),
        "document" => format!(
            "## Workflow: Document\n\n\
             1. Review the branch: `git diff --stat {base}`\n\
             2. Document every new or changed public API in the project's style\n\
             3. Update README or docs for new concepts or configuration\n\
             4. Build with {build} and commit\n"
        ),
        "research" => format!(
            "## Workflow: Research\n\n\
             Extract verifiable facts from the codebase; cite `file:line` for each.\n\n\
             Write `docs-dev/research/issue-{id}-research.md` with a summary, verified\n\
             facts, code references, open questions and contradictions.\n\
             Never modify production files.\n"
        ),
        "draft" => format!(
            "## Workflow: Draft\n\n\
             Read `docs-dev/research/issue-{id}-research.md` and write\n\
             `docs-dev/specifications/issue-{id}-spec.md`. Describe every algorithm\n\
             as input, operation and output, with at least two worked examples.\n"
        ),
        "validate" => format!(
            "## Workflow: Validate\n\n\
             Check `docs-dev/specifications/issue-{id}-spec.md` against the code and\n\
             the research notes. Recompute every worked example and record the result\n\
             in `docs-dev/validation/issue-{id}-validation.md` (PASS, FAIL or\n\
             NEEDS_REVISION).\n"
        ),
        "review" => format!(
            "## Workflow: Review\n\n\
             Read only the specification and try to follow it without guessing.\n\
             Record points of confusion and the decision (APPROVED or\n\
             CHANGES_NEEDED) in `docs-dev/reviews/issue-{id}-review.md`.\n"
        ),
        other => format!("## Workflow: {other}\n\nComplete the {other} stage for this issue.\n"),
    }
}

fn continuation_section(c: &Continuation) -> String {
    let fence = |body: &str, empty: &str| {
        let body = body.trim();
        format!("```\n{}\n```", if body.is_empty() { empty } else { body })
    };
    format!(
        "## Previous Attempt Summary\n\n\
         A previous session on this issue stalled or failed. Do NOT redo completed work.\n\n\
         ### Commits on this branch\n{}\n\n\
         ### Files changed from base\n{}\n\n\
         ### Uncommitted work\n{}\n\n\
         ### Failure reason\n{}\n\n\
         Continue from where the previous session left off.\n",
        fence(&c.commits.join("\n"), "(no commits yet)"),
        fence(&c.diff_stat, "(no changes from base)"),
        fence(&c.status, "(clean working tree)"),
        c.failure_hint.trim(),
    )
}

fn footer(issue: &Issue, worker: &Worker, config: &Config) -> String {
    let ctx = &config.context;
    let commit_example = if ctx.commit_prefix.is_empty() {
        format!("description of change (#{})", issue.id)
    } else {
        format!("{}: description of change (#{})", ctx.commit_prefix, issue.id)
    };
    format!(
        "## Commit Convention\n\n```\n{commit_example}\n```\n\n\
         ## Completion\n\n\
         When this stage is done:\n\
         1. Make sure the build passes ({})\n\
         2. Make sure tests pass ({})\n\
         3. Commit all changes\n\
         4. End with a short summary of what was done\n\n\
         Do NOT push or open pull requests; worker {} is published by the orchestrator.\n",
        or_default(&ctx.build_command, "run the build command"),
        or_default(&ctx.test_command, "run the test command"),
        worker.worker_id,
    )
}

fn or_default(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        format!("`{value}`")
    }
}
