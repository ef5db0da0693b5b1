//! Guardian: phase-graph progression and anomaly detection.

use tracing::error;

use crate::handlers::PhaseResult;
use crate::state::{PHASE_ORDER, Phase, State};

/// Feature gates that filter the phase graph.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureFlags {
    /// ATDD / TEST_REVIEW run only when testarch is configured.
    pub testarch_enabled: bool,
    /// QA teardown phases run only with `BMAD_QA_ENABLED=1`.
    pub qa_enabled: bool,
}

impl FeatureFlags {
    pub fn resolve(config: &crate::config::Config) -> Self {
        Self {
            testarch_enabled: config.testarch.is_some(),
            qa_enabled: std::env::var("BMAD_QA_ENABLED").as_deref() == Ok("1"),
        }
    }

    fn enabled(&self, phase: Phase) -> bool {
        if phase.requires_testarch() && !self.testarch_enabled {
            return false;
        }
        if phase.requires_qa() && !self.qa_enabled {
            return false;
        }
        true
    }
}

/// Successor of `current` in `PHASE_ORDER`, skipping disabled optional
/// phases. `None` current yields the first enabled phase; `None` out means
/// the graph is exhausted (in particular, after RETROSPECTIVE with QA off).
pub fn get_next_phase(current: Option<Phase>, flags: &FeatureFlags) -> Option<Phase> {
    let start = match current {
        Some(phase) => phase.ordinal() + 1,
        None => 0,
    };
    PHASE_ORDER[start..]
        .iter()
        .copied()
        .find(|phase| flags.enabled(*phase))
}

/// The last per-story phase under the given flags; finishing it completes
/// the story.
pub fn last_story_phase(flags: &FeatureFlags) -> Phase {
    if flags.testarch_enabled {
        Phase::TestReview
    } else {
        Phase::CodeReviewSynthesis
    }
}

/// Whether the loop continues after a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardianDecision {
    Continue,
    Halt,
}

/// Post-phase anomaly check: any failure halts the loop so a broken phase
/// can never spin forever.
pub fn check_anomaly(result: &PhaseResult, state: &State) -> GuardianDecision {
    if result.success {
        return GuardianDecision::Continue;
    }
    error!(
        phase = state.current_phase.map(|p| p.name()).unwrap_or("-"),
        story = state.current_story.as_deref().unwrap_or("-"),
        error = result.error.as_deref().unwrap_or("unknown"),
        "Phase failed; halting loop"
    );
    GuardianDecision::Halt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_off() -> FeatureFlags {
        FeatureFlags {
            testarch_enabled: false,
            qa_enabled: false,
        }
    }

    fn all_on() -> FeatureFlags {
        FeatureFlags {
            testarch_enabled: true,
            qa_enabled: true,
        }
    }

    #[test]
    fn test_next_phase_skips_disabled_optionals() {
        let flags = all_off();
        assert_eq!(
            get_next_phase(Some(Phase::ValidateStorySynthesis), &flags),
            Some(Phase::DevStory)
        );
        assert_eq!(
            get_next_phase(Some(Phase::CodeReviewSynthesis), &flags),
            Some(Phase::Retrospective)
        );
    }

    #[test]
    fn test_next_phase_includes_enabled_optionals() {
        let flags = all_on();
        assert_eq!(
            get_next_phase(Some(Phase::ValidateStorySynthesis), &flags),
            Some(Phase::Atdd)
        );
        assert_eq!(
            get_next_phase(Some(Phase::Retrospective), &flags),
            Some(Phase::QaPlanGenerate)
        );
    }

    #[test]
    fn test_retrospective_is_terminal_without_qa() {
        assert_eq!(get_next_phase(Some(Phase::Retrospective), &all_off()), None);
    }

    #[test]
    fn test_none_yields_first_phase() {
        assert_eq!(get_next_phase(None, &all_off()), Some(Phase::CreateStory));
    }

    #[test]
    fn test_graph_closure_single_traversal() {
        // Walking the graph visits each phase at most once, then None.
        for flags in [all_off(), all_on()] {
            let mut current = None;
            let mut visited = Vec::new();
            while let Some(phase) = get_next_phase(current, &flags) {
                assert!(!visited.contains(&phase), "phase revisited: {phase}");
                visited.push(phase);
                current = Some(phase);
            }
            assert!(visited.len() <= PHASE_ORDER.len());
        }
    }

    #[test]
    fn test_last_story_phase_depends_on_testarch() {
        assert_eq!(last_story_phase(&all_off()), Phase::CodeReviewSynthesis);
        assert_eq!(last_story_phase(&all_on()), Phase::TestReview);
    }

    #[test]
    fn test_check_anomaly() {
        let state = State::new();
        assert_eq!(
            check_anomaly(&PhaseResult::ok(), &state),
            GuardianDecision::Continue
        );
        assert_eq!(
            check_anomaly(&PhaseResult::fail("boom"), &state),
            GuardianDecision::Halt
        );
    }
}
