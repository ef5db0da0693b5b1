//! Multi-provider fan-out handlers: VALIDATE_STORY and CODE_REVIEW.
//!
//! Every configured evaluator gets the same compiled prompt, its own
//! timeout, and its own debug-log sink; they run in true parallel as OS
//! processes. Each success is persisted immediately under a deterministic
//! filename encoding story + evaluator display model. Fewer successes than
//! the minimum-reviews gate fails the phase.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{info, warn};

use crate::bench::{BenchmarkStore, EvaluatorRecord};
use crate::config::ProviderSettings;
use crate::errors::{LoopError, ProviderError};
use crate::metrics::{calculate_aggregate_metrics, extract_evaluator_metrics};
use crate::providers::{self, InvokeOptions, ProviderResult};
use crate::state::{Phase, State};
use crate::util::atomic_write_str;

use super::{HandlerContext, PhaseHandler, PhaseResult, collect_text, compile_prompt};

/// One evaluator's outcome within a fan-out.
pub struct EvaluatorOutcome {
    pub settings: ProviderSettings,
    pub result: Result<ProviderResult, ProviderError>,
}

/// Launch all evaluators in parallel with the same prompt. Falls back to a
/// single master invocation when no evaluators are configured.
pub async fn run_evaluators(ctx: &HandlerContext, prompt: &str) -> Vec<EvaluatorOutcome> {
    let evaluators: Vec<ProviderSettings> = if ctx.config.providers.evaluators.is_empty() {
        vec![ctx.config.providers.master.clone()]
    } else {
        ctx.config.providers.evaluators.clone()
    };

    let futures: Vec<_> = evaluators
        .into_iter()
        .map(|settings| {
            let ctx = ctx.clone();
            let prompt = prompt.to_string();
            async move {
                let mut logger = ctx.debug_logger();
                let emitter = ctx.emitter.clone();
                let opts = InvokeOptions {
                    cwd: Some(ctx.paths.project_root.clone()),
                    on_line: Some(Box::new(move |line| emitter.emit_output(line))),
                };
                let result = providers::invoke(&settings, &prompt, &mut logger, opts).await;
                EvaluatorOutcome { settings, result }
            }
        })
        .collect();

    join_all(futures).await
}

/// Which fan-out this handler drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FanOutKind {
    Validation,
    CodeReview,
}

pub struct MultiProviderHandler {
    phase: Phase,
    workflow: &'static str,
    kind: FanOutKind,
}

impl MultiProviderHandler {
    pub fn validate_story() -> Self {
        Self {
            phase: Phase::ValidateStory,
            workflow: "validate-story",
            kind: FanOutKind::Validation,
        }
    }

    pub fn code_review() -> Self {
        Self {
            phase: Phase::CodeReview,
            workflow: "code-review",
            kind: FanOutKind::CodeReview,
        }
    }

    fn artifact_path(
        &self,
        ctx: &HandlerContext,
        epic: &str,
        story: u32,
        evaluator: &str,
    ) -> std::path::PathBuf {
        match self.kind {
            FanOutKind::Validation => ctx.paths.validations_dir().join(format!(
                "validation-{epic}-{story}-{evaluator}.md"
            )),
            FanOutKind::CodeReview => ctx.paths.code_reviews_dir().join(format!(
                "code-review-{epic}-{story}-{evaluator}.md"
            )),
        }
    }
}

#[async_trait]
impl PhaseHandler for MultiProviderHandler {
    fn phase(&self) -> Phase {
        self.phase
    }

    async fn execute(&self, ctx: &HandlerContext, state: &State) -> PhaseResult {
        let (epic, story) = match ctx.current_story_parts(state) {
            Ok(parts) => parts,
            Err(e) => return PhaseResult::fail(e),
        };
        let epic = epic.to_string();

        let compiled =
            match compile_prompt(ctx, self.workflow, state, BTreeMap::new(), Vec::new()).await {
                Ok(compiled) => compiled,
                Err(e) => return PhaseResult::fail(format!("Compilation failed: {e}")),
            };

        let outcomes = run_evaluators(ctx, &compiled.prompt).await;
        let launched = outcomes.len();

        let mut artifacts = Vec::new();
        let mut evaluator_metrics = Vec::new();
        let mut failures = Vec::new();
        let mut bench_records = Vec::new();

        for outcome in outcomes {
            let display_name = outcome.settings.display_model();
            bench_records.push(EvaluatorRecord {
                evaluator: display_name.clone(),
                phase: self.phase.name().to_string(),
                story: format!("{epic}.{story}"),
                duration_ms: outcome
                    .result
                    .as_ref()
                    .map(|r| r.duration_ms)
                    .unwrap_or(0),
                success: outcome.result.is_ok(),
                session_id: outcome
                    .result
                    .as_ref()
                    .ok()
                    .and_then(|r| r.session_id.clone()),
                findings_total: None,
            });
            match outcome.result {
                Ok(result) => {
                    let report = collect_text(&result.stdout);
                    let path = self.artifact_path(ctx, &epic, story, &display_name);
                    if path.exists() {
                        warn!("Overwriting existing artifact: {}", path.display());
                    }
                    if let Err(e) = atomic_write_str(&path, &report) {
                        failures.push(format!("{display_name}: artifact write failed: {e}"));
                        continue;
                    }
                    // Metrics are enrichment only; extraction cannot fail the
                    // phase.
                    let metrics = extract_evaluator_metrics(&display_name, &report);
                    if let Some(record) = bench_records.last_mut() {
                        record.findings_total = Some(metrics.total_findings());
                    }
                    evaluator_metrics.push(metrics);
                    artifacts.push(path);
                }
                Err(e) => {
                    let exit_status = e.exit_status();
                    warn!("Evaluator {display_name} failed ({exit_status:?}): {e}");
                    failures.push(format!("{display_name}: {e}"));
                }
            }
        }

        // Benchmarking is best-effort; the store swallows its own failures.
        BenchmarkStore::new(ctx.paths.benchmarks_dir()).save(bench_records);

        let succeeded = artifacts.len();
        // The gate never exceeds the fan-out size: a single-provider
        // fallback is judged against itself, not the configured minimum.
        let required = ctx.config.min_reviews.min(launched.max(1));
        if succeeded < required {
            let gate = LoopError::InsufficientReviews {
                required,
                succeeded,
                launched,
            };
            return PhaseResult::fail(format!("{gate}; failures: {failures:?}"));
        }

        let aggregate = calculate_aggregate_metrics(&evaluator_metrics);
        info!(
            phase = %self.phase,
            evaluators = launched,
            succeeded,
            critical_avg = aggregate.critical.avg,
            "Fan-out complete"
        );

        let mut outputs = BTreeMap::new();
        outputs.insert("evaluators_launched".into(), launched.to_string());
        outputs.insert("evaluators_succeeded".into(), succeeded.to_string());
        outputs.insert(
            "artifacts".into(),
            artifacts
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        );
        if let Ok(metrics_json) = serde_json::to_string(&aggregate) {
            outputs.insert("aggregate_metrics".into(), metrics_json);
        }
        if !failures.is_empty() {
            outputs.insert("failures".into(), failures.join("\n"));
        }

        PhaseResult::ok_with(outputs)
    }
}
