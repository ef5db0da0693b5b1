//! Single-provider handlers: compile the workflow, invoke the master once,
//! report the outcome.
//!
//! CREATE_STORY, DEV_STORY, ATDD and TEST_REVIEW all share this shape; they
//! differ only in workflow name and in which artifact they expect the
//! provider to leave behind.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::sprint::inference::find_story_file;
use crate::state::{Phase, State};

use super::{HandlerContext, PhaseHandler, PhaseResult, compile_prompt, invoke_master};

pub struct SingleProviderHandler {
    phase: Phase,
    workflow: &'static str,
    /// Whether the story file must exist after the provider returns.
    expects_story_file: bool,
}

impl SingleProviderHandler {
    pub fn create_story() -> Self {
        Self {
            phase: Phase::CreateStory,
            workflow: "create-story",
            expects_story_file: true,
        }
    }

    pub fn dev_story() -> Self {
        Self {
            phase: Phase::DevStory,
            workflow: "dev-story",
            expects_story_file: true,
        }
    }

    pub fn atdd() -> Self {
        Self {
            phase: Phase::Atdd,
            workflow: "atdd",
            expects_story_file: false,
        }
    }

    pub fn test_review() -> Self {
        Self {
            phase: Phase::TestReview,
            workflow: "test-review",
            expects_story_file: false,
        }
    }
}

#[async_trait]
impl PhaseHandler for SingleProviderHandler {
    fn phase(&self) -> Phase {
        self.phase
    }

    async fn execute(&self, ctx: &HandlerContext, state: &State) -> PhaseResult {
        let compiled =
            match compile_prompt(ctx, self.workflow, state, BTreeMap::new(), Vec::new()).await {
                Ok(compiled) => compiled,
                Err(e) => return PhaseResult::fail(format!("Compilation failed: {e}")),
            };

        let result = match invoke_master(ctx, &compiled.prompt).await {
            Ok(result) => result,
            Err(e) => return PhaseResult::fail(e.to_string()),
        };

        info!(
            phase = %self.phase,
            duration_ms = result.duration_ms,
            session = result.session_id.as_deref().unwrap_or("-"),
            "Provider completed"
        );

        let mut outputs = BTreeMap::new();
        if let Some(session) = &result.session_id {
            outputs.insert("session_id".into(), session.clone());
        }

        if self.expects_story_file {
            match ctx.current_story_parts(state) {
                Ok((epic, story)) => {
                    match find_story_file(&ctx.paths, &epic.to_string(), story) {
                        Some(path) => {
                            outputs.insert("story_file".into(), path.display().to_string());
                        }
                        None => {
                            return PhaseResult::fail(format!(
                                "Provider finished but no story file exists for {epic}-{story} under {}",
                                ctx.paths.implementation_artifacts().display()
                            ));
                        }
                    }
                }
                Err(e) => debug!("Skipping story-file check: {e}"),
            }
        }

        PhaseResult::ok_with(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Phase;

    #[test]
    fn test_handlers_declare_their_phase() {
        assert_eq!(SingleProviderHandler::create_story().phase(), Phase::CreateStory);
        assert_eq!(SingleProviderHandler::dev_story().phase(), Phase::DevStory);
        assert_eq!(SingleProviderHandler::atdd().phase(), Phase::Atdd);
        assert_eq!(SingleProviderHandler::test_review().phase(), Phase::TestReview);
    }

    #[test]
    fn test_story_file_expectations() {
        assert!(SingleProviderHandler::create_story().expects_story_file);
        assert!(SingleProviderHandler::dev_story().expects_story_file);
        assert!(!SingleProviderHandler::atdd().expects_story_file);
    }
}
