//! Phase handlers: one per phase, uniform `execute(state) → PhaseResult`
//! contract.
//!
//! Common shape: build context from state + paths, compile the workflow
//! prompt, invoke the provider(s), capture artifacts. Provider failures fail
//! the phase; enrichment failures (metrics, debug capture) only warn.

pub mod multi;
pub mod qa;
pub mod retrospective;
pub mod single;
pub mod synthesis;

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::warn;

use crate::compiler::{CompiledWorkflow, CompilerContext, compile_workflow, get_workflow_spec};
use crate::config::Config;
use crate::dashboard::events::DashboardEmitter;
use crate::debug_log::{DebugJsonLogger, save_prompt};
use crate::errors::{CompilerError, ProviderError};
use crate::paths::{GlobalPaths, ProjectPaths};
use crate::providers::{self, InvokeOptions, ProviderResult, stream::extract_text};
use crate::state::{Phase, State};
use crate::timing::local_now;
use crate::types::{EpicId, split_story_key};

/// Outcome of one phase execution.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseResult {
    pub success: bool,
    pub outputs: BTreeMap<String, String>,
    pub error: Option<String>,
}

impl PhaseResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            outputs: BTreeMap::new(),
            error: None,
        }
    }

    pub fn ok_with(outputs: BTreeMap<String, String>) -> Self {
        Self {
            success: true,
            outputs,
            error: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            outputs: BTreeMap::new(),
            error: Some(message.into()),
        }
    }
}

/// Shared environment every handler runs in.
#[derive(Clone)]
pub struct HandlerContext {
    pub config: Config,
    pub paths: ProjectPaths,
    pub emitter: DashboardEmitter,
    pub debug_enabled: bool,
}

impl HandlerContext {
    /// Current story key split into (epic, story number), or an actionable
    /// failure message.
    pub fn current_story_parts(&self, state: &State) -> Result<(EpicId, u32), String> {
        let story = state
            .current_story
            .as_deref()
            .ok_or("No current story set in state")?;
        split_story_key(story).ok_or_else(|| format!("Malformed story key '{story}'"))
    }

    fn debug_json_dir(&self) -> std::path::PathBuf {
        GlobalPaths::resolve()
            .map(|g| g.debug_json_dir())
            .unwrap_or_else(|| self.paths.tool_dir().join("debug").join("json"))
    }

    /// Fresh per-invocation debug logger.
    pub fn debug_logger(&self) -> DebugJsonLogger {
        DebugJsonLogger::new(self.debug_json_dir(), self.debug_enabled, local_now())
    }
}

/// A phase's executable behavior.
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    fn phase(&self) -> Phase;

    async fn execute(&self, ctx: &HandlerContext, state: &State) -> PhaseResult;
}

/// Static dispatch table: phase → handler.
pub fn handler_for(phase: Phase) -> Box<dyn PhaseHandler> {
    match phase {
        Phase::CreateStory => Box::new(single::SingleProviderHandler::create_story()),
        Phase::ValidateStory => Box::new(multi::MultiProviderHandler::validate_story()),
        Phase::ValidateStorySynthesis => {
            Box::new(synthesis::SynthesisHandler::validate_story_synthesis())
        }
        Phase::Atdd => Box::new(single::SingleProviderHandler::atdd()),
        Phase::DevStory => Box::new(single::SingleProviderHandler::dev_story()),
        Phase::CodeReview => Box::new(multi::MultiProviderHandler::code_review()),
        Phase::CodeReviewSynthesis => {
            Box::new(synthesis::SynthesisHandler::code_review_synthesis())
        }
        Phase::TestReview => Box::new(single::SingleProviderHandler::test_review()),
        Phase::Retrospective => Box::new(retrospective::RetrospectiveHandler),
        Phase::QaPlanGenerate => Box::new(qa::QaPlanGenerateHandler),
        Phase::QaPlanExecute => Box::new(qa::QaPlanExecuteHandler),
        Phase::QaRemediate => Box::new(qa::QaRemediateHandler),
    }
}

/// Standard invocation params every workflow compilation gets.
pub fn standard_params(state: &State) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    if let Some(epic) = &state.current_epic {
        params.insert("epic_num".into(), epic.to_string());
    }
    if let Some(story) = &state.current_story {
        params.insert("story_key".into(), story.clone());
        if let Some((_, story_num)) = split_story_key(story) {
            params.insert("story_num".into(), story_num.to_string());
        }
    }
    params
}

/// Compile a workflow prompt for the current state, consulting the patch
/// cache first. The compiled prompt is saved to the debug prompts directory
/// when debug logging is on.
pub async fn compile_prompt(
    ctx: &HandlerContext,
    workflow_name: &str,
    state: &State,
    extra_params: BTreeMap<String, String>,
    extra_context: Vec<(String, String)>,
) -> Result<CompiledWorkflow, CompilerError> {
    let spec = get_workflow_spec(workflow_name)?;

    let mut compiler_ctx = CompilerContext::new(&ctx.paths.project_root, ctx.config.clone());
    compiler_ctx.params = standard_params(state);

    // Enrich with the story title from the sprint ledger when it has one.
    if let Some((epic, story_num)) = state
        .current_story
        .as_deref()
        .and_then(crate::types::split_story_key)
    {
        if let Some(title) = crate::compiler::variables::extract_story_title(
            &ctx.paths.sprint_status(),
            &epic.to_string(),
            story_num,
        ) {
            compiler_ctx.params.insert("story_title".into(), title);
        }
    }

    compiler_ctx.params.extend(extra_params);
    compiler_ctx.extra_context = extra_context;

    let patcher = ctx.config.providers.patcher.clone();
    let (ir, patch_path) = crate::patching::load_workflow_ir(
        workflow_name,
        &spec.workflow_dir(&ctx.paths.project_root),
        &ctx.paths,
        &compiler_ctx.cwd,
        patcher.as_ref(),
    )
    .await
    .map_err(|e| CompilerError::Other(anyhow::anyhow!("{e}")))?;
    compiler_ctx.workflow_ir = Some(ir);
    compiler_ctx.patch_path = patch_path;

    let compiled = compile_workflow(workflow_name, compiler_ctx)?;

    if let Some(global) = GlobalPaths::resolve() {
        save_prompt(
            &global.debug_prompts_dir(),
            &compiled.prompt,
            workflow_name,
            ctx.debug_enabled,
        );
    }

    Ok(compiled)
}

/// Invoke the master provider with the dashboard line fan-out attached.
pub async fn invoke_master(
    ctx: &HandlerContext,
    prompt: &str,
) -> Result<ProviderResult, ProviderError> {
    let mut logger = ctx.debug_logger();
    let emitter = ctx.emitter.clone();
    let opts = InvokeOptions {
        cwd: Some(ctx.paths.project_root.clone()),
        on_line: Some(Box::new(move |line| emitter.emit_output(line))),
    };
    let result = providers::invoke(&ctx.config.providers.master, prompt, &mut logger, opts).await;
    if let Err(e) = &result {
        warn!("Master provider failed: {e}");
    }
    result
}

/// Join the assistant text out of a provider's JSON line stream; falls back
/// to the raw stdout for plain-print providers.
pub fn collect_text(stdout: &str) -> String {
    let text: Vec<String> = stdout.lines().filter_map(extract_text).collect();
    if text.is_empty() {
        stdout.to_string()
    } else {
        text.join("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PHASE_ORDER;

    #[test]
    fn test_every_phase_has_a_handler() {
        for phase in PHASE_ORDER {
            let handler = handler_for(phase);
            assert_eq!(handler.phase(), phase);
        }
    }

    #[test]
    fn test_phase_result_constructors() {
        assert!(PhaseResult::ok().success);
        let failed = PhaseResult::fail("boom");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_standard_params_from_state() {
        let mut state = State::new();
        state.current_epic = Some(EpicId::Number(3));
        state.current_story = Some("3.2".into());

        let params = standard_params(&state);
        assert_eq!(params["epic_num"], "3");
        assert_eq!(params["story_key"], "3.2");
        assert_eq!(params["story_num"], "2");
    }

    #[test]
    fn test_collect_text_prefers_stream_events() {
        let stdout = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Report body"}]},"session_id":"s"}"#;
        assert_eq!(collect_text(stdout), "Report body\n");
        assert_eq!(collect_text("plain text output"), "plain text output");
    }
}
