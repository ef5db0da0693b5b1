//! Loop state: the phase graph and the persisted `state.yaml`.
//!
//! The runner is the only writer. State is mutated exclusively between phase
//! boundaries and written atomically (temp file + fsync + rename) so an
//! interrupted save never corrupts the previous state.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::timing::utc_now_naive;
use crate::types::EpicId;
use crate::util::atomic_write_str;

/// A stage in the fixed per-story / per-epic workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    CreateStory,
    ValidateStory,
    ValidateStorySynthesis,
    Atdd,
    DevStory,
    CodeReview,
    CodeReviewSynthesis,
    TestReview,
    Retrospective,
    QaPlanGenerate,
    QaPlanExecute,
    QaRemediate,
}

/// Fixed phase ordering; ties break by ordinal.
pub const PHASE_ORDER: [Phase; 12] = [
    Phase::CreateStory,
    Phase::ValidateStory,
    Phase::ValidateStorySynthesis,
    Phase::Atdd,
    Phase::DevStory,
    Phase::CodeReview,
    Phase::CodeReviewSynthesis,
    Phase::TestReview,
    Phase::Retrospective,
    Phase::QaPlanGenerate,
    Phase::QaPlanExecute,
    Phase::QaRemediate,
];

impl Phase {
    /// Position in `PHASE_ORDER`.
    pub fn ordinal(&self) -> usize {
        PHASE_ORDER.iter().position(|p| p == self).unwrap_or(0)
    }

    /// Phase name as persisted (snake_case).
    pub fn name(&self) -> &'static str {
        match self {
            Phase::CreateStory => "create_story",
            Phase::ValidateStory => "validate_story",
            Phase::ValidateStorySynthesis => "validate_story_synthesis",
            Phase::Atdd => "atdd",
            Phase::DevStory => "dev_story",
            Phase::CodeReview => "code_review",
            Phase::CodeReviewSynthesis => "code_review_synthesis",
            Phase::TestReview => "test_review",
            Phase::Retrospective => "retrospective",
            Phase::QaPlanGenerate => "qa_plan_generate",
            Phase::QaPlanExecute => "qa_plan_execute",
            Phase::QaRemediate => "qa_remediate",
        }
    }

    /// Phases gated on testarch configuration.
    pub fn requires_testarch(&self) -> bool {
        matches!(self, Phase::Atdd | Phase::TestReview)
    }

    /// Phases gated on QA enablement (epic teardown).
    pub fn requires_qa(&self) -> bool {
        matches!(
            self,
            Phase::QaPlanGenerate | Phase::QaPlanExecute | Phase::QaRemediate
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Which QA test classes the executor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QaCategory {
    #[default]
    A,
    #[serde(rename = "all")]
    All,
}

/// Run-once marker for the testarch preflight step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestarchPreflight {
    pub completed_at: NaiveDateTime,
    #[serde(default)]
    pub test_design: bool,
    #[serde(default)]
    pub framework: bool,
    #[serde(default)]
    pub ci: bool,
}

/// The loop's authoritative persisted state.
///
/// Timestamps are naive UTC on disk. `completed_stories` is insertion-ordered
/// and never contains `current_story`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_epic: Option<EpicId>,
    /// "E.S" story key, consistent with `current_epic`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_story: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<Phase>,
    /// Whether `current_phase` ran to completion. False after a halt or a
    /// mid-phase crash, so a new run re-executes that phase.
    #[serde(default)]
    pub phase_completed: bool,

    #[serde(default)]
    pub completed_epics: Vec<EpicId>,
    #[serde(default)]
    pub completed_stories: Vec<String>,

    pub started_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_started_at: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_started_at: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic_started_at: Option<NaiveDateTime>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub testarch_preflight: Option<TestarchPreflight>,

    #[serde(default)]
    pub qa_category: QaCategory,
}

impl State {
    /// Fresh state at the start of a run.
    pub fn new() -> Self {
        let now = utc_now_naive();
        Self {
            current_epic: None,
            current_story: None,
            current_phase: None,
            phase_completed: false,
            completed_epics: Vec::new(),
            completed_stories: Vec::new(),
            started_at: now,
            updated_at: now,
            phase_started_at: None,
            story_started_at: None,
            epic_started_at: None,
            testarch_preflight: None,
            qa_category: QaCategory::default(),
        }
    }

    /// Mark a story complete, clearing the cursor. Keeps the invariant that
    /// `current_story` is never also in `completed_stories`.
    pub fn complete_current_story(&mut self) {
        if let Some(story) = self.current_story.take() {
            if !self.completed_stories.contains(&story) {
                self.completed_stories.push(story);
            }
        }
        self.story_started_at = None;
    }

    /// Mark the current epic complete and reset the story cursors.
    pub fn complete_current_epic(&mut self) {
        if let Some(epic) = self.current_epic.take() {
            if !self.completed_epics.contains(&epic) {
                self.completed_epics.push(epic);
            }
        }
        self.current_story = None;
        self.story_started_at = None;
        self.epic_started_at = None;
    }

    /// Begin a phase: set the cursor and the phase timer.
    pub fn start_phase(&mut self, phase: Phase) {
        self.current_phase = Some(phase);
        self.phase_completed = false;
        self.phase_started_at = Some(utc_now_naive());
    }

    /// Milliseconds spent in the current phase, 0 when no timer is running.
    pub fn phase_elapsed_ms(&self) -> i64 {
        self.phase_started_at
            .map(crate::timing::elapsed_ms)
            .unwrap_or(0)
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// Loads and persists `State` with the atomic-write contract.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load state from disk.
    pub fn load(&self) -> Result<State> {
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file: {}", self.path.display()))?;
        let state: State = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", self.path.display()))?;
        Ok(state)
    }

    /// Persist state atomically, bumping `updated_at` monotonically.
    pub fn save(&self, state: &mut State) -> Result<()> {
        let now = utc_now_naive();
        if now > state.updated_at {
            state.updated_at = now;
        }
        let yaml =
            serde_yaml::to_string(state).context("Failed to serialize state")?;
        atomic_write_str(&self.path, &yaml)
            .with_context(|| format!("Failed to write state file: {}", self.path.display()))?;
        Ok(())
    }
}
