//! RETROSPECTIVE handler.
//!
//! Optionally runs a testarch trace pre-step (non-blocking), invokes the
//! master with the retrospective workflow, extracts the report between its
//! markers, and saves it under `retrospectives/epic-{id}-retro-{YYYYMMDD}.md`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::state::{Phase, State};
use crate::timing::{format_local_date, local_now};
use crate::util::{atomic_write_str, extract_between};

use super::{HandlerContext, PhaseHandler, PhaseResult, collect_text, compile_prompt, invoke_master};

/// Markers delimiting the report body in the provider output.
pub const RETRO_REPORT_START: &str = "<!-- RETRO_REPORT_START -->";
pub const RETRO_REPORT_END: &str = "<!-- RETRO_REPORT_END -->";

pub struct RetrospectiveHandler;

#[async_trait]
impl PhaseHandler for RetrospectiveHandler {
    fn phase(&self) -> Phase {
        Phase::Retrospective
    }

    async fn execute(&self, ctx: &HandlerContext, state: &State) -> PhaseResult {
        let Some(epic) = state.current_epic.clone() else {
            return PhaseResult::fail("Cannot run retrospective: no current epic set");
        };

        // Testarch trace pre-step: best effort, never blocks the phase.
        if ctx
            .config
            .testarch
            .as_ref()
            .is_some_and(|t| t.trace_on_retrospective)
        {
            let trace_prompt = format!(
                "<task-context>Produce a requirements-to-tests traceability summary for epic {epic}.</task-context>"
            );
            match invoke_master(ctx, &trace_prompt).await {
                Ok(result) => {
                    let trace = collect_text(&result.stdout);
                    let path = ctx
                        .paths
                        .qa_traceability_dir()
                        .join(format!("epic-{epic}-trace.md"));
                    if let Err(e) = atomic_write_str(&path, &trace) {
                        warn!("Failed to save trace report: {e}");
                    }
                }
                Err(e) => warn!("Testarch trace pre-step failed (continuing): {e}"),
            }
        }

        let compiled = match compile_prompt(
            ctx,
            "retrospective",
            state,
            BTreeMap::new(),
            Vec::new(),
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

        let output = collect_text(&result.stdout);
        let report = extract_between(&output, RETRO_REPORT_START, RETRO_REPORT_END)
            .unwrap_or_else(|| {
                warn!("Retrospective markers missing; saving full output");
                output.clone()
            });

        let path = ctx
            .paths
            .retro_file(&epic, &format_local_date(local_now()));
        if path.exists() {
            warn!("Overwriting existing retrospective: {}", path.display());
        }
        if let Err(e) = atomic_write_str(&path, &report) {
            return PhaseResult::fail(format!("Failed to save retrospective: {e}"));
        }

        info!(epic = %epic, path = %path.display(), "Retrospective saved");

        let mut outputs = BTreeMap::new();
        outputs.insert("retrospective".into(), path.display().to_string());
        PhaseResult::ok_with(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dashboard::events::DashboardEmitter;
    use crate::paths::ProjectPaths;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_retrospective_requires_current_epic() {
        let dir = tempdir().unwrap();
        let ctx = HandlerContext {
            config: Config::default(),
            paths: ProjectPaths::new(dir.path()),
            emitter: DashboardEmitter::new("t", false),
            debug_enabled: false,
        };
        let result = RetrospectiveHandler.execute(&ctx, &State::new()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("no current epic"));
    }

    #[test]
    fn test_marker_extraction() {
        let output = format!("chatter\n{RETRO_REPORT_START}\n# Retro\nlessons\n{RETRO_REPORT_END}\nbye");
        assert_eq!(
            extract_between(&output, RETRO_REPORT_START, RETRO_REPORT_END).unwrap(),
            "# Retro\nlessons"
        );
    }
}
