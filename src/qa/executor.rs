//! QA plan executor: runs Category A scripts under a timeout, in single or
//! batch mode, with incremental per-batch saves so a crash loses at most one
//! batch.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{info, warn};

use crate::errors::QaError;
use crate::paths::ProjectPaths;
use crate::timing::{format_timestamp, local_now};
use crate::types::EpicId;
use crate::util::atomic_write_str;

use super::parser::{Category, ParsedTestPlan, TestCase};

/// Outcome classification of one test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestStatus {
    Pass,
    Fail,
    Skip,
    Error,
}

/// One executed (or skipped) test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestOutcome {
    pub id: String,
    pub name: String,
    pub category: Category,
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    #[serde(default)]
    pub output_excerpt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Persisted results of one run (or one resumed run).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResults {
    pub epic_id: String,
    pub run_label: String,
    pub category: String,
    pub batches_completed: usize,
    pub outcomes: Vec<TestOutcome>,
}

impl RunResults {
    pub fn count(&self, status: TestStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn pass_rate(&self) -> f64 {
        let executed = self
            .outcomes
            .iter()
            .filter(|o| matches!(o.status, TestStatus::Pass | TestStatus::Fail | TestStatus::Error))
            .count();
        if executed == 0 {
            return 0.0;
        }
        self.count(TestStatus::Pass) as f64 / executed as f64
    }

    /// Human summary block.
    pub fn summary(&self) -> String {
        format!(
            "Epic {} run {}: {} tests — {} passed, {} failed, {} errored, {} skipped ({} batch(es))",
            self.epic_id,
            self.run_label,
            self.outcomes.len(),
            self.count(TestStatus::Pass),
            self.count(TestStatus::Fail),
            self.count(TestStatus::Error),
            self.count(TestStatus::Skip),
            self.batches_completed,
        )
    }
}

/// Execution knobs, mirroring the `qa execute` CLI flags.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// "A" or "all".
    pub category: String,
    /// Explicit batch-mode override; None = auto by threshold.
    pub batch: Option<bool>,
    pub batch_threshold: usize,
    pub batch_size: usize,
    pub test_timeout_secs: u64,
    /// Re-run failed/error tests from a prior run.
    pub retry: bool,
    /// Pin the source run for `--retry` (run label); None = latest.
    pub retry_run: Option<String>,
    /// Expand retry selection to skipped tests.
    pub include_skipped: bool,
    pub show_progress: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            category: "A".into(),
            batch: None,
            batch_threshold: 10,
            batch_size: 10,
            test_timeout_secs: 120,
            retry: false,
            retry_run: None,
            include_skipped: false,
            show_progress: false,
        }
    }
}

/// Find the latest (or pinned) results file for an epic.
pub fn find_source_run(
    paths: &ProjectPaths,
    epic: &EpicId,
    pinned: Option<&str>,
) -> Result<RunResults, QaError> {
    if let Some(label) = pinned {
        let path = paths.qa_run_file(epic, label);
        return load_run(&path).ok_or_else(|| QaError::NoRunToRetry {
            epic: epic.to_string(),
        });
    }

    let pattern = paths
        .qa_test_results_dir()
        .join(format!("epic-{epic}-run-*.yaml"));
    let mut candidates: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
        .map(|it| it.filter_map(Result::ok).collect())
        .unwrap_or_default();
    candidates.sort();

    candidates
        .last()
        .and_then(|p| load_run(p))
        .ok_or_else(|| QaError::NoRunToRetry {
            epic: epic.to_string(),
        })
}

fn load_run(path: &Path) -> Option<RunResults> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_yaml::from_str(&content).ok()
}

fn save_run(path: &Path, results: &RunResults) -> Result<(), QaError> {
    let yaml = serde_yaml::to_string(results).map_err(|e| QaError::Other(e.into()))?;
    atomic_write_str(path, &yaml).map_err(|e| QaError::SaveFailed {
        path: path.to_path_buf(),
        source: std::io::Error::other(e.to_string()),
    })
}

/// Run one Category A script and judge it by exit code and expected-output
/// substrings. Unhandled process errors map to `Error`, never a panic.
async fn run_single_test(
    test: &TestCase,
    project_root: &Path,
    timeout: Duration,
) -> TestOutcome {
    let start = std::time::Instant::now();

    let skip = |reason: &str| TestOutcome {
        id: test.id.clone(),
        name: test.name.clone(),
        category: test.category,
        status: TestStatus::Skip,
        exit_code: None,
        duration_ms: 0,
        output_excerpt: String::new(),
        reason: Some(reason.to_string()),
    };

    match test.category {
        Category::C => return skip("documentation-only test"),
        Category::B => return skip("Playwright wrapper not available in this run"),
        Category::A => {}
    }
    if test.script.is_empty() {
        return skip("checklist entry without a script");
    }

    let output = Command::new("sh")
        .arg("-c")
        .arg(&test.script)
        .current_dir(project_root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, output).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return TestOutcome {
                id: test.id.clone(),
                name: test.name.clone(),
                category: test.category,
                status: TestStatus::Error,
                exit_code: None,
                duration_ms: start.elapsed().as_millis() as u64,
                output_excerpt: String::new(),
                reason: Some(format!("spawn failed: {e}")),
            };
        }
        Err(_) => {
            return TestOutcome {
                id: test.id.clone(),
                name: test.name.clone(),
                category: test.category,
                status: TestStatus::Error,
                exit_code: None,
                duration_ms: start.elapsed().as_millis() as u64,
                output_excerpt: String::new(),
                reason: Some(format!("timed out after {}s", timeout.as_secs())),
            };
        }
    };

    let exit_code = output.status.code().unwrap_or(-1);
    let combined = format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );

    let exit_ok = exit_code == test.expected_exit_code;
    let patterns_ok = test
        .expected_output
        .iter()
        .all(|pattern| combined.contains(pattern.as_str()));

    let mut excerpt: String = combined.chars().take(500).collect();
    if excerpt.len() < combined.len() {
        excerpt.push_str("…");
    }

    TestOutcome {
        id: test.id.clone(),
        name: test.name.clone(),
        category: test.category,
        status: if exit_ok && patterns_ok {
            TestStatus::Pass
        } else {
            TestStatus::Fail
        },
        exit_code: Some(exit_code),
        duration_ms: start.elapsed().as_millis() as u64,
        output_excerpt: excerpt,
        reason: (!exit_ok)
            .then(|| format!("exit code {exit_code}, expected {}", test.expected_exit_code))
            .or_else(|| (!patterns_ok).then(|| "expected output pattern missing".to_string())),
    }
}

/// Execute a parsed plan. Batch mode kicks in above the threshold (or on
/// explicit override); each completed batch is saved before the next starts.
pub async fn execute_plan(
    paths: &ProjectPaths,
    epic: &EpicId,
    plan: &ParsedTestPlan,
    opts: &ExecuteOptions,
) -> Result<RunResults, QaError> {
    let mut selected: Vec<TestCase> = plan
        .tests_by_category(&opts.category)
        .into_iter()
        .cloned()
        .collect();

    // Retry: carry prior outcomes over and run only what needs running.
    let mut carried: BTreeMap<String, TestOutcome> = BTreeMap::new();
    let mut prior_batches = 0;
    if opts.retry {
        let source = find_source_run(paths, epic, opts.retry_run.as_deref())?;
        prior_batches = source.batches_completed;
        for outcome in source.outcomes {
            carried.insert(outcome.id.clone(), outcome);
        }
        selected.retain(|test| match carried.get(&test.id) {
            None => true,
            Some(prev) => {
                matches!(prev.status, TestStatus::Fail | TestStatus::Error)
                    || (opts.include_skipped && prev.status == TestStatus::Skip)
            }
        });
        info!(
            epic = %epic,
            selected = selected.len(),
            carried = carried.len(),
            "Retry selection from prior run"
        );
    }

    let run_label = format_timestamp(local_now());
    let run_path = paths.qa_run_file(epic, &run_label);

    let batch_mode = opts.batch.unwrap_or(selected.len() > opts.batch_threshold);
    let batch_size = if batch_mode { opts.batch_size } else { selected.len().max(1) };

    let progress = opts.show_progress.then(|| {
        let bar = ProgressBar::new(selected.len() as u64);
        bar.set_style(
            ProgressStyle::with_template("{bar:30} {pos}/{len} {msg}").expect("static template"),
        );
        bar
    });

    let mut results = RunResults {
        epic_id: epic.to_string(),
        run_label: run_label.clone(),
        category: opts.category.clone(),
        batches_completed: prior_batches,
        outcomes: Vec::new(),
    };

    // Selected tests replace their carried outcome; the rest carry over.
    let selected_ids: Vec<String> = selected.iter().map(|t| t.id.clone()).collect();
    results.outcomes.extend(
        carried
            .values()
            .filter(|o| !selected_ids.contains(&o.id))
            .cloned(),
    );

    let timeout = Duration::from_secs(opts.test_timeout_secs);
    for batch in selected.chunks(batch_size.max(1)) {
        for test in batch {
            if let Some(bar) = &progress {
                bar.set_message(test.id.clone());
            }
            let outcome = run_single_test(test, &paths.project_root, timeout).await;
            if outcome.status == TestStatus::Fail || outcome.status == TestStatus::Error {
                warn!(test = %test.id, reason = ?outcome.reason, "Test did not pass");
            }
            results.outcomes.push(outcome);
            if let Some(bar) = &progress {
                bar.inc(1);
            }
        }
        results.batches_completed += 1;
        // Incremental save: a crash loses at most the current batch.
        save_run(&run_path, &results)?;
    }

    if selected.is_empty() {
        save_run(&run_path, &results)?;
    }

    if let Some(bar) = progress {
        bar.finish_and_clear();
    }

    results
        .outcomes
        .sort_by(|a, b| (a.category.letter(), &a.id).cmp(&(b.category.letter(), &b.id)));
    save_run(&run_path, &results)?;

    let summary_path = paths
        .qa_test_results_dir()
        .join(format!("epic-{epic}-run-{run_label}.summary.txt"));
    if let Err(e) = atomic_write_str(&summary_path, &results.summary()) {
        warn!("Failed to write run summary: {e}");
    }

    info!("{}", results.summary());
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_case(id: &str, script: &str) -> TestCase {
        TestCase {
            id: id.into(),
            name: format!("test {id}"),
            category: Category::A,
            script: script.into(),
            pre_conditions: Vec::new(),
            expected_exit_code: 0,
            expected_output: Vec::new(),
        }
    }

    fn plan_with(tests: Vec<TestCase>) -> ParsedTestPlan {
        ParsedTestPlan {
            epic_id: "1".into(),
            tests,
            setup_script: String::new(),
        }
    }

    fn setup() -> (tempfile::TempDir, ProjectPaths) {
        let dir = tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        std::fs::create_dir_all(paths.qa_test_results_dir()).unwrap();
        (dir, paths)
    }

    #[tokio::test]
    async fn test_pass_fail_and_pattern_assertions() {
        let (_dir, paths) = setup();
        let mut passing = test_case("E1-A01", "echo ready");
        passing.expected_output = vec!["ready".into()];
        let failing = test_case("E1-A02", "exit 4");

        let plan = plan_with(vec![passing, failing]);
        let results = execute_plan(&paths, &EpicId::Number(1), &plan, &ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(results.count(TestStatus::Pass), 1);
        assert_eq!(results.count(TestStatus::Fail), 1);
        let fail = results.outcomes.iter().find(|o| o.id == "E1-A02").unwrap();
        assert_eq!(fail.exit_code, Some(4));
    }

    #[tokio::test]
    async fn test_missing_pattern_fails() {
        let (_dir, paths) = setup();
        let mut t = test_case("E1-A01", "echo something-else");
        t.expected_output = vec!["the-expected-marker".into()];
        let plan = plan_with(vec![t]);

        let results = execute_plan(&paths, &EpicId::Number(1), &plan, &ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(results.count(TestStatus::Fail), 1);
    }

    #[tokio::test]
    async fn test_category_b_and_scriptless_are_skipped() {
        let (_dir, paths) = setup();
        let mut b = test_case("E1-B01", "await page.goto('/');");
        b.category = Category::B;
        let scriptless = test_case("E1-A05", "");

        let plan = plan_with(vec![b, scriptless]);
        let opts = ExecuteOptions {
            category: "all".into(),
            ..Default::default()
        };
        let results = execute_plan(&paths, &EpicId::Number(1), &plan, &opts)
            .await
            .unwrap();
        assert_eq!(results.count(TestStatus::Skip), 2);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_error() {
        let (_dir, paths) = setup();
        let plan = plan_with(vec![test_case("E1-A01", "sleep 30")]);
        let opts = ExecuteOptions {
            test_timeout_secs: 1,
            ..Default::default()
        };
        let results = execute_plan(&paths, &EpicId::Number(1), &plan, &opts)
            .await
            .unwrap();
        assert_eq!(results.count(TestStatus::Error), 1);
    }

    #[tokio::test]
    async fn test_batching_saves_incrementally() {
        let (_dir, paths) = setup();
        let tests: Vec<TestCase> = (1..=23)
            .map(|i| test_case(&format!("E1-A{i:02}"), "true"))
            .collect();
        let plan = plan_with(tests);
        let opts = ExecuteOptions {
            batch: Some(true),
            batch_size: 10,
            ..Default::default()
        };

        let results = execute_plan(&paths, &EpicId::Number(1), &plan, &opts)
            .await
            .unwrap();
        assert_eq!(results.batches_completed, 3);
        assert_eq!(results.outcomes.len(), 23);

        let saved = find_source_run(&paths, &EpicId::Number(1), None).unwrap();
        assert_eq!(saved.outcomes.len(), 23);
    }

    #[tokio::test]
    async fn test_retry_carries_passes_and_reruns_failures() {
        let (_dir, paths) = setup();
        let epic = EpicId::Number(1);

        // Prior run: A01 passed, A02 failed, A03 never ran (crash).
        let prior = RunResults {
            epic_id: "1".into(),
            run_label: "20260101-000000".into(),
            category: "A".into(),
            batches_completed: 2,
            outcomes: vec![
                TestOutcome {
                    id: "E1-A01".into(),
                    name: "a".into(),
                    category: Category::A,
                    status: TestStatus::Pass,
                    exit_code: Some(0),
                    duration_ms: 5,
                    output_excerpt: String::new(),
                    reason: None,
                },
                TestOutcome {
                    id: "E1-A02".into(),
                    name: "b".into(),
                    category: Category::A,
                    status: TestStatus::Fail,
                    exit_code: Some(1),
                    duration_ms: 5,
                    output_excerpt: String::new(),
                    reason: None,
                },
            ],
        };
        save_run(&paths.qa_run_file(&epic, &prior.run_label), &prior).unwrap();

        let plan = plan_with(vec![
            test_case("E1-A01", "true"),
            test_case("E1-A02", "true"),
            test_case("E1-A03", "true"),
        ]);
        let opts = ExecuteOptions {
            retry: true,
            ..Default::default()
        };

        let results = execute_plan(&paths, &epic, &plan, &opts).await.unwrap();
        // A01 carried, A02 re-run, A03 newly run; no silent re-runs.
        assert_eq!(results.outcomes.len(), 3);
        assert_eq!(results.count(TestStatus::Pass), 3);
        assert_eq!(results.batches_completed, 3);
    }

    #[tokio::test]
    async fn test_retry_without_prior_run_errors() {
        let (_dir, paths) = setup();
        let plan = plan_with(vec![test_case("E1-A01", "true")]);
        let opts = ExecuteOptions {
            retry: true,
            ..Default::default()
        };
        let err = execute_plan(&paths, &EpicId::Number(1), &plan, &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, QaError::NoRunToRetry { .. }));
    }
}
