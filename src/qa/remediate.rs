//! QA remediation: collect an epic's open issues, triage them through the
//! master provider (AUTO-FIX vs ESCALATE), and optionally re-test with a
//! regression check between iterations.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::QaError;
use crate::handlers::{HandlerContext, collect_text, invoke_master};
use crate::types::EpicId;
use crate::util::{atomic_write_str, extract_between};

use super::executor::{ExecuteOptions, RunResults, TestStatus, execute_plan, find_source_run};
use super::parser::parse_test_plan_file;

pub const ESCALATIONS_START: &str = "<!-- REMEDIATE_ESCALATIONS_START -->";
pub const ESCALATIONS_END: &str = "<!-- REMEDIATE_ESCALATIONS_END -->";
pub const AUTO_FIX_START: &str = "<!-- REMEDIATE_AUTO_FIX_START -->";
pub const AUTO_FIX_END: &str = "<!-- REMEDIATE_AUTO_FIX_END -->";

/// One issue collected from the epic's artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    /// Where the issue came from: "qa", "code-review", "retro",
    /// "validation", "scorecard".
    pub source: String,
    pub description: String,
}

/// Result of one remediation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationReport {
    pub epic_id: String,
    pub iterations: u32,
    pub issues_collected: usize,
    pub auto_fixed: Vec<String>,
    pub escalations: Vec<String>,
    pub modified_files: Vec<String>,
    /// Files touched in more than one iteration.
    pub refixed_files: Vec<String>,
    pub final_pass_rate: Option<f64>,
}

fn finding_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*-\s+(?:\*\*)?(?:\[)?(?i:critical|error|fail(?:ed)?|issue)(?:\])?(?:\*\*)?[:\s]\s*(.+)$").unwrap())
}

fn modified_file_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*(?:MODIFIED|FIXED FILE):\s*(\S+)").unwrap())
}

fn collect_from_reports(
    dir: &std::path::Path,
    pattern: &str,
    source: &str,
    seen: &mut BTreeSet<String>,
    issues: &mut Vec<Issue>,
) {
    let Ok(entries) = glob::glob(&dir.join(pattern).to_string_lossy()) else {
        return;
    };
    for path in entries.filter_map(Result::ok) {
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        for caps in finding_line_regex().captures_iter(&content) {
            let description = caps[1].trim().to_string();
            // Deduplicated across sources and iterations.
            if seen.insert(description.clone()) {
                issues.push(Issue {
                    source: source.to_string(),
                    description,
                });
            }
        }
    }
}

/// Collect an epic's open issues from QA results, code reviews, retros,
/// validations, and the scorecard. `seen` persists across iterations so a
/// description is only triaged once.
pub fn collect_epic_issues(
    ctx: &HandlerContext,
    epic: &EpicId,
    seen: &mut BTreeSet<String>,
) -> Vec<Issue> {
    let mut issues = Vec::new();

    // Failed/errored QA tests from the latest run.
    if let Ok(run) = find_source_run(&ctx.paths, epic, None) {
        for outcome in &run.outcomes {
            if matches!(outcome.status, TestStatus::Fail | TestStatus::Error) {
                let description = format!(
                    "QA test {} ({}) did not pass: {}",
                    outcome.id,
                    outcome.name,
                    outcome.reason.as_deref().unwrap_or("no reason recorded")
                );
                if seen.insert(description.clone()) {
                    issues.push(Issue {
                        source: "qa".into(),
                        description,
                    });
                }
            }
        }
    }

    collect_from_reports(
        &ctx.paths.code_reviews_dir(),
        &format!("code-review-{epic}-*.md"),
        "code-review",
        seen,
        &mut issues,
    );
    collect_from_reports(
        &ctx.paths.retrospectives_dir(),
        &format!("epic-{epic}-retro-*.md"),
        "retro",
        seen,
        &mut issues,
    );
    collect_from_reports(
        &ctx.paths.validations_dir(),
        &format!("validation-{epic}-*.md"),
        "validation",
        seen,
        &mut issues,
    );
    collect_from_reports(
        &ctx.paths.qa_artifacts_dir(),
        &format!("epic-{epic}-scorecard*.md"),
        "scorecard",
        seen,
        &mut issues,
    );

    issues
}

fn build_triage_prompt(epic: &EpicId, issues: &[Issue]) -> String {
    let mut parts = Vec::new();
    parts.push("<task-context>".to_string());
    parts.push(format!(
        "Triage the open issues for epic {epic}. For each issue decide AUTO-FIX \
         (apply the fix directly in the working tree) or ESCALATE (needs a human). \
         After fixing, list every file you changed as 'MODIFIED: <path>' lines."
    ));
    parts.push("</task-context>".to_string());
    parts.push("<source-document>".to_string());
    for issue in issues {
        parts.push(format!("- [{}] {}", issue.source, issue.description));
    }
    parts.push("</source-document>".to_string());
    parts.push("<output-format>".to_string());
    parts.push(format!(
        "Wrap the list of auto-fixed issues between {AUTO_FIX_START} and {AUTO_FIX_END}, \
         and the escalations between {ESCALATIONS_START} and {ESCALATIONS_END}, one per line."
    ));
    parts.push("</output-format>".to_string());
    parts.join("\n")
}

fn section_lines(output: &str, start: &str, end: &str) -> Vec<String> {
    extract_between(output, start, end)
        .map(|block| {
            block
                .lines()
                .map(|l| l.trim().trim_start_matches('-').trim().to_string())
                .filter(|l| !l.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Extract `MODIFIED:` file paths from the provider output.
pub fn extract_modified_files(output: &str) -> Vec<String> {
    modified_file_regex()
        .captures_iter(output)
        .map(|c| c[1].to_string())
        .collect()
}

/// Run the remediation loop for an epic: collect → triage → (re-test) until
/// clean, regression, or the iteration bound.
pub async fn run_remediation(
    ctx: &HandlerContext,
    epic: &EpicId,
) -> Result<RemediationReport, QaError> {
    let max_iterations = ctx.config.qa.remediate_max_iterations;
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut report = RemediationReport {
        epic_id: epic.to_string(),
        iterations: 0,
        issues_collected: 0,
        auto_fixed: Vec::new(),
        escalations: Vec::new(),
        modified_files: Vec::new(),
        refixed_files: Vec::new(),
        final_pass_rate: None,
    };
    let mut last_pass_rate: Option<f64> = None;

    for iteration in 0..max_iterations {
        let issues = collect_epic_issues(ctx, epic, &mut seen);
        if issues.is_empty() {
            info!(epic = %epic, iteration, "No open issues; remediation clean");
            break;
        }
        report.issues_collected += issues.len();
        report.iterations = iteration + 1;

        let prompt = build_triage_prompt(epic, &issues);
        let result = invoke_master(ctx, &prompt).await?;
        let output = collect_text(&result.stdout);

        report
            .auto_fixed
            .extend(section_lines(&output, AUTO_FIX_START, AUTO_FIX_END));
        report
            .escalations
            .extend(section_lines(&output, ESCALATIONS_START, ESCALATIONS_END));

        for file in extract_modified_files(&output) {
            if report.modified_files.contains(&file) {
                if !report.refixed_files.contains(&file) {
                    warn!("File {file} modified again in a later iteration");
                    report.refixed_files.push(file.clone());
                }
            } else {
                report.modified_files.push(file);
            }
        }

        // Re-test between iterations; a dropped pass rate is a regression
        // and stops the loop.
        if iteration + 1 < max_iterations {
            match retest(ctx, epic).await {
                Ok(results) => {
                    let rate = results.pass_rate();
                    if let Some(previous) = last_pass_rate {
                        if rate < previous {
                            warn!(
                                "Regression detected: pass rate {:.0}% -> {:.0}%; stopping remediation",
                                previous * 100.0,
                                rate * 100.0
                            );
                            report.final_pass_rate = Some(rate);
                            break;
                        }
                    }
                    last_pass_rate = Some(rate);
                    report.final_pass_rate = Some(rate);
                    if results.count(TestStatus::Fail) == 0
                        && results.count(TestStatus::Error) == 0
                    {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Re-test failed (continuing without regression check): {e}");
                }
            }
        }
    }

    save_remediation_report(ctx, epic, &report)?;
    Ok(report)
}

async fn retest(ctx: &HandlerContext, epic: &EpicId) -> Result<RunResults, QaError> {
    let plan_path = ctx.paths.qa_plan_file(epic);
    let plan = parse_test_plan_file(&plan_path, &epic.to_string())?;
    let opts = ExecuteOptions {
        retry: true,
        batch_threshold: ctx.config.qa.batch_threshold,
        batch_size: ctx.config.qa.batch_size,
        test_timeout_secs: ctx.config.qa.test_timeout_secs,
        ..Default::default()
    };
    execute_plan(&ctx.paths, epic, &plan, &opts).await
}

/// Persist the remediation report under qa-artifacts.
pub fn save_remediation_report(
    ctx: &HandlerContext,
    epic: &EpicId,
    report: &RemediationReport,
) -> Result<PathBuf, QaError> {
    let path = ctx
        .paths
        .qa_artifacts_dir()
        .join(format!("epic-{epic}-remediation.yaml"));
    let yaml = serde_yaml::to_string(report).map_err(|e| QaError::Other(e.into()))?;
    atomic_write_str(&path, &yaml).map_err(|e| QaError::SaveFailed {
        path: path.clone(),
        source: std::io::Error::other(e.to_string()),
    })?;
    Ok(path)
}
