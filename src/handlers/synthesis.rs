//! Synthesis handlers: fold the just-completed fan-out's evaluator reports
//! into one master-provider synthesis report.
//!
//! The evaluator artifacts are embedded as context sections, the master is
//! invoked once, structured metrics are pulled from the marker-delimited
//! JSON in its output, and the report is persisted with the deterministic
//! metrics header prepended.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::metrics::{
    calculate_aggregate_metrics, extract_evaluator_metrics, extract_synthesis_metrics,
    format_deterministic_metrics_header,
};
use crate::state::{Phase, State};
use crate::util::atomic_write_str;

use super::{HandlerContext, PhaseHandler, PhaseResult, collect_text, compile_prompt, invoke_master};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SynthesisKind {
    Validation,
    CodeReview,
}

pub struct SynthesisHandler {
    phase: Phase,
    workflow: &'static str,
    kind: SynthesisKind,
}

impl SynthesisHandler {
    pub fn validate_story_synthesis() -> Self {
        Self {
            phase: Phase::ValidateStorySynthesis,
            workflow: "validate-story-synthesis",
            kind: SynthesisKind::Validation,
        }
    }

    pub fn code_review_synthesis() -> Self {
        Self {
            phase: Phase::CodeReviewSynthesis,
            workflow: "code-review-synthesis",
            kind: SynthesisKind::CodeReview,
        }
    }

    fn artifacts_dir(&self, ctx: &HandlerContext) -> PathBuf {
        match self.kind {
            SynthesisKind::Validation => ctx.paths.validations_dir(),
            SynthesisKind::CodeReview => ctx.paths.code_reviews_dir(),
        }
    }

    fn artifact_prefix(&self) -> &'static str {
        match self.kind {
            SynthesisKind::Validation => "validation",
            SynthesisKind::CodeReview => "code-review",
        }
    }

    /// Evaluator reports of the current story, excluding prior syntheses.
    fn load_evaluator_reports(
        &self,
        ctx: &HandlerContext,
        epic: &str,
        story: u32,
    ) -> Vec<(String, String)> {
        let prefix = self.artifact_prefix();
        let pattern = self
            .artifacts_dir(ctx)
            .join(format!("{prefix}-{epic}-{story}-*.md"));

        let mut reports = Vec::new();
        let Ok(entries) = glob::glob(&pattern.to_string_lossy()) else {
            return reports;
        };
        for path in entries.filter_map(Result::ok) {
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            if name.ends_with("-synthesis") {
                continue;
            }
            let evaluator = name
                .strip_prefix(&format!("{prefix}-{epic}-{story}-"))
                .unwrap_or(&name)
                .to_string();
            match std::fs::read_to_string(&path) {
                Ok(content) => reports.push((evaluator, content)),
                Err(e) => warn!("Skipping unreadable report {}: {e}", path.display()),
            }
        }
        reports.sort_by(|a, b| a.0.cmp(&b.0));
        reports
    }
}

#[async_trait]
impl PhaseHandler for SynthesisHandler {
    fn phase(&self) -> Phase {
        self.phase
    }

    async fn execute(&self, ctx: &HandlerContext, state: &State) -> PhaseResult {
        let (epic, story) = match ctx.current_story_parts(state) {
            Ok(parts) => parts,
            Err(e) => return PhaseResult::fail(e),
        };
        let epic = epic.to_string();

        let reports = self.load_evaluator_reports(ctx, &epic, story);
        if reports.is_empty() {
            return PhaseResult::fail(format!(
                "No {} reports found for story {epic}-{story}; run the fan-out phase first",
                self.artifact_prefix()
            ));
        }

        // Deterministic metrics from the evaluator artifacts.
        let evaluator_metrics: Vec<_> = reports
            .iter()
            .map(|(evaluator, content)| extract_evaluator_metrics(evaluator, content))
            .collect();
        let aggregate = calculate_aggregate_metrics(&evaluator_metrics);
        let header = format_deterministic_metrics_header(&evaluator_metrics, &aggregate);

        let extra_context: Vec<(String, String)> = reports
            .iter()
            .map(|(evaluator, content)| (format!("evaluator-report-{evaluator}"), content.clone()))
            .collect();

        let compiled = match compile_prompt(
            ctx,
            self.workflow,
            state,
            BTreeMap::new(),
            extra_context,
        )
        .await
        {
            Ok(compiled) => compiled,
            Err(e) => return PhaseResult::fail(format!("Compilation failed: {e}")),
        };

        let result = match invoke_master(ctx, &compiled.prompt).await {
            Ok(result) => result,
            Err(e) => return PhaseResult::fail(e.to_string()),
        };

        let report_body = collect_text(&result.stdout);

        // Structured metrics are enrichment; absence only warns.
        let synthesis_metrics = extract_synthesis_metrics(&report_body);
        if synthesis_metrics.is_none() {
            warn!(phase = %self.phase, "No structured metrics block in synthesis output");
        }

        let path = self.artifacts_dir(ctx).join(format!(
            "{}-{epic}-{story}-synthesis.md",
            self.artifact_prefix()
        ));
        if path.exists() {
            warn!("Overwriting existing synthesis report: {}", path.display());
        }
        let full_report = format!("{header}\n{report_body}");
        if let Err(e) = atomic_write_str(&path, &full_report) {
            return PhaseResult::fail(format!("Failed to write synthesis report: {e}"));
        }

        info!(
            phase = %self.phase,
            reports = reports.len(),
            path = %path.display(),
            "Synthesis complete"
        );

        let mut outputs = BTreeMap::new();
        outputs.insert("synthesis_report".into(), path.display().to_string());
        outputs.insert("evaluator_reports".into(), reports.len().to_string());
        if let Some(metrics) = synthesis_metrics {
            if let Ok(json) = serde_json::to_string(&metrics) {
                outputs.insert("synthesis_metrics".into(), json);
            }
        }
        PhaseResult::ok_with(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dashboard::events::DashboardEmitter;
    use crate::paths::ProjectPaths;
    use std::fs;
    use tempfile::tempdir;

    fn ctx_for(dir: &std::path::Path) -> HandlerContext {
        HandlerContext {
            config: Config::default(),
            paths: ProjectPaths::new(dir),
            emitter: DashboardEmitter::new("t", false),
            debug_enabled: false,
        }
    }

    #[test]
    fn test_load_evaluator_reports_excludes_synthesis() {
        let dir = tempdir().unwrap();
        let ctx = ctx_for(dir.path());
        fs::create_dir_all(ctx.paths.validations_dir()).unwrap();
        fs::write(
            ctx.paths.validations_dir().join("validation-1-1-alpha.md"),
            "- CRITICAL: a",
        )
        .unwrap();
        fs::write(
            ctx.paths.validations_dir().join("validation-1-1-beta.md"),
            "fine",
        )
        .unwrap();
        fs::write(
            ctx.paths.validations_dir().join("validation-1-1-synthesis.md"),
            "old synthesis",
        )
        .unwrap();
        // A different story's artifact stays out.
        fs::write(
            ctx.paths.validations_dir().join("validation-1-2-alpha.md"),
            "other story",
        )
        .unwrap();

        let handler = SynthesisHandler::validate_story_synthesis();
        let reports = handler.load_evaluator_reports(&ctx, "1", 1);
        let names: Vec<&str> = reports.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_synthesis_fails_without_reports() {
        let dir = tempdir().unwrap();
        let ctx = ctx_for(dir.path());
        let mut state = State::new();
        state.current_story = Some("1.1".into());

        let result = SynthesisHandler::validate_story_synthesis()
            .execute(&ctx, &state)
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("run the fan-out phase first"));
    }
}
