//! QA phase handlers: direct invocation into the QA generator, executor,
//! and remediator — no compiled workflow prompt.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::qa::executor::{ExecuteOptions, execute_plan};
use crate::qa::generator::generate_qa_plan;
use crate::qa::parser::parse_test_plan_file;
use crate::qa::remediate::run_remediation;
use crate::state::{Phase, QaCategory, State};

use super::{HandlerContext, PhaseHandler, PhaseResult};

fn current_epic(state: &State) -> Result<crate::types::EpicId, String> {
    state
        .current_epic
        .clone()
        .ok_or_else(|| "No current epic set in state".to_string())
}

pub struct QaPlanGenerateHandler;

#[async_trait]
impl PhaseHandler for QaPlanGenerateHandler {
    fn phase(&self) -> Phase {
        Phase::QaPlanGenerate
    }

    async fn execute(&self, ctx: &HandlerContext, state: &State) -> PhaseResult {
        let epic = match current_epic(state) {
            Ok(epic) => epic,
            Err(e) => return PhaseResult::fail(e),
        };
        match generate_qa_plan(ctx, &epic).await {
            Ok(path) => {
                let mut outputs = BTreeMap::new();
                outputs.insert("qa_plan".into(), path.display().to_string());
                PhaseResult::ok_with(outputs)
            }
            Err(e) => PhaseResult::fail(e.to_string()),
        }
    }
}

pub struct QaPlanExecuteHandler;

#[async_trait]
impl PhaseHandler for QaPlanExecuteHandler {
    fn phase(&self) -> Phase {
        Phase::QaPlanExecute
    }

    async fn execute(&self, ctx: &HandlerContext, state: &State) -> PhaseResult {
        let epic = match current_epic(state) {
            Ok(epic) => epic,
            Err(e) => return PhaseResult::fail(e),
        };

        let plan_path = ctx.paths.qa_plan_file(&epic);
        let plan = match parse_test_plan_file(&plan_path, &epic.to_string()) {
            Ok(plan) => plan,
            Err(e) => return PhaseResult::fail(e.to_string()),
        };

        let category = match state.qa_category {
            QaCategory::A => "A",
            QaCategory::All => "all",
        };
        let opts = ExecuteOptions {
            category: category.into(),
            batch_threshold: ctx.config.qa.batch_threshold,
            batch_size: ctx.config.qa.batch_size,
            test_timeout_secs: ctx.config.qa.test_timeout_secs,
            ..Default::default()
        };

        match execute_plan(&ctx.paths, &epic, &plan, &opts).await {
            Ok(results) => {
                let mut outputs = BTreeMap::new();
                outputs.insert("summary".into(), results.summary());
                outputs.insert(
                    "pass_rate".into(),
                    format!("{:.2}", results.pass_rate()),
                );
                PhaseResult::ok_with(outputs)
            }
            Err(e) => PhaseResult::fail(e.to_string()),
        }
    }
}

pub struct QaRemediateHandler;

#[async_trait]
impl PhaseHandler for QaRemediateHandler {
    fn phase(&self) -> Phase {
        Phase::QaRemediate
    }

    async fn execute(&self, ctx: &HandlerContext, state: &State) -> PhaseResult {
        let epic = match current_epic(state) {
            Ok(epic) => epic,
            Err(e) => return PhaseResult::fail(format!("Cannot remediate: {e}")),
        };
        match run_remediation(ctx, &epic).await {
            Ok(report) => {
                let mut outputs = BTreeMap::new();
                outputs.insert("iterations".into(), report.iterations.to_string());
                outputs.insert("auto_fixed".into(), report.auto_fixed.len().to_string());
                outputs.insert("escalations".into(), report.escalations.len().to_string());
                PhaseResult::ok_with(outputs)
            }
            Err(e) => PhaseResult::fail(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dashboard::events::DashboardEmitter;
    use crate::paths::ProjectPaths;
    use tempfile::tempdir;

    fn ctx_for(dir: &std::path::Path) -> HandlerContext {
        HandlerContext {
            config: Config::default(),
            paths: ProjectPaths::new(dir),
            emitter: DashboardEmitter::new("t", false),
            debug_enabled: false,
        }
    }

    #[tokio::test]
    async fn test_qa_execute_fails_without_plan() {
        let dir = tempdir().unwrap();
        let ctx = ctx_for(dir.path());
        let mut state = State::new();
        state.current_epic = Some(crate::types::EpicId::Number(1));

        let result = QaPlanExecuteHandler.execute(&ctx, &state).await;
        assert!(!result.success);
        // Actionable hint points at the generate command.
        assert!(result.error.unwrap().contains("qa generate"));
    }

    #[tokio::test]
    async fn test_qa_handlers_require_epic() {
        let dir = tempdir().unwrap();
        let ctx = ctx_for(dir.path());
        let state = State::new();

        assert!(!QaPlanGenerateHandler.execute(&ctx, &state).await.success);
        assert!(!QaPlanExecuteHandler.execute(&ctx, &state).await.success);
        assert!(!QaRemediateHandler.execute(&ctx, &state).await.success);
    }
}
