//! Three-way sprint-status reconciliation.
//!
//! Merges three legs into the authoritative ledger:
//! - **Existing** — sprint-status.yaml as found on disk,
//! - **Generated** — the expectation derived from epic docs + loop State,
//! - **Inferred** — artifact evidence on disk (see `inference`).
//!
//! Conflict resolution for EPIC_STORY entries: explicit file status >
//! artifact evidence > existing value. Every other entry type is preserved
//! byte-for-byte. EPIC_META is recalculated from the final story statuses.
//! Stories present in the ledger but absent from epic docs are flagged and
//! never auto-deleted.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use console::style;
use tracing::{debug, info, warn};

use crate::epics::load_epic_docs;
use crate::errors::SprintError;
use crate::paths::ProjectPaths;
use crate::state::State;
use crate::types::EpicId;

use super::inference::{Confidence, infer_epic_status, infer_story_status};
use super::writer::{Section, SprintDoc};
use super::{EntryType, classify_key};

/// One applied (or proposed) entry change.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryChange {
    pub key: String,
    pub old: Option<String>,
    pub new: String,
    pub reason: String,
}

/// Result of one reconciliation pass.
#[derive(Debug)]
pub struct ReconcileOutcome {
    pub changes: Vec<EntryChange>,
    /// EPIC_STORY keys in the ledger with no counterpart in the epic docs.
    pub removed_stories: Vec<String>,
    /// changed entries / total EPIC_STORY entries considered.
    pub divergence: f64,
    /// Whether the merged document was written to disk.
    pub written: bool,
}

/// Reconciliation knobs.
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Divergence ratio above which operator confirmation is required.
    pub divergence_threshold: f64,
    /// Whether a terminal operator can be prompted. The dashboard context
    /// passes false; high divergence then auto-cancels the write.
    pub interactive_allowed: bool,
    /// Master provider display model (recognizes master code reviews).
    pub master_model: String,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            divergence_threshold: 0.3,
            interactive_allowed: false,
            master_model: "claude".into(),
        }
    }
}

/// Compute and apply the three-way merge. The reconciler is the sole writer
/// of sprint-status.yaml.
pub fn reconcile(
    paths: &ProjectPaths,
    state: &State,
    opts: &ReconcileOptions,
) -> Result<ReconcileOutcome, SprintError> {
    let status_path = paths.sprint_status();
    let mut doc = SprintDoc::load(&status_path)?;

    let epic_docs = load_epic_docs(&paths.epics_dir()).unwrap_or_default();

    let mut changes: Vec<EntryChange> = Vec::new();
    let mut expected_keys: Vec<String> = Vec::new();
    // epic id → final story statuses, for EPIC_META recalculation.
    let mut epic_story_statuses: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for epic_doc in &epic_docs {
        let epic_id = &epic_doc.frontmatter.epic_num;
        // EPIC_META recalculation covers numeric epics; tagged module
        // epics keep their MODULE_STORY entries untouched.
        if !epic_id.is_numeric() {
            continue;
        }

        for story in &epic_doc.stories {
            let key = story.entry_key();
            expected_keys.push(key.clone());

            let existing = doc
                .get(Section::DevelopmentStatus, &key)
                .map(|e| e.value.clone());

            let inference =
                infer_story_status(paths, &epic_id.to_string(), story.story, &opts.master_model);

            // Generated baseline from loop State.
            let state_status = state_derived_status(state, epic_id, story.story);

            let (merged, reason) = match (&inference.status, inference.confidence) {
                (Some(status), Confidence::Explicit) => {
                    (status.clone(), "explicit story Status field".to_string())
                }
                (Some(status), _) => (status.clone(), inference.evidence.clone()),
                (None, _) => match (&existing, state_status) {
                    (Some(existing), _) => (existing.clone(), "preserved existing".to_string()),
                    (None, Some(from_state)) => (from_state, "derived from loop state".to_string()),
                    (None, None) => ("backlog".to_string(), "new story".to_string()),
                },
            };

            epic_story_statuses
                .entry(epic_id.to_string())
                .or_default()
                .push(merged.clone());

            if existing.as_deref() != Some(merged.as_str()) {
                changes.push(EntryChange {
                    key: key.clone(),
                    old: existing,
                    new: merged,
                    reason,
                });
            }
        }
    }

    // EPIC_STORY entries in the ledger that the epic docs no longer declare.
    let removed_stories: Vec<String> = doc
        .entries_in(Section::DevelopmentStatus)
        .filter(|e| classify_key(&e.key) == EntryType::EpicStory)
        .filter(|e| !expected_keys.contains(&e.key))
        .map(|e| e.key.clone())
        .collect();
    for key in &removed_stories {
        warn!("Story '{key}' present in sprint-status but absent from epic docs (kept)");
    }

    // EPIC_META recalculated from the merged story statuses.
    for (epic, statuses) in &epic_story_statuses {
        let key = format!("epic-{epic}");
        let new_status = infer_epic_status(statuses);
        let existing = doc.get(Section::EpicMeta, &key).map(|e| e.value.clone());
        if existing.as_deref() != Some(new_status.as_str()) {
            changes.push(EntryChange {
                key,
                old: existing,
                new: new_status,
                reason: "recalculated from story statuses".to_string(),
            });
        }
    }

    let total = expected_keys.len().max(1);
    let story_changes = changes
        .iter()
        .filter(|c| classify_key(&c.key) == EntryType::EpicStory)
        .count();
    let divergence = story_changes as f64 / total as f64;

    if changes.is_empty() {
        debug!("Sprint-status already consistent");
        return Ok(ReconcileOutcome {
            changes,
            removed_stories,
            divergence,
            written: false,
        });
    }

    // High divergence needs a human; the dashboard context auto-cancels.
    if divergence > opts.divergence_threshold {
        if !opts.interactive_allowed {
            warn!(
                "Sprint-status divergence {:.0}% exceeds threshold; skipping write (non-interactive)",
                divergence * 100.0
            );
            return Ok(ReconcileOutcome {
                changes,
                removed_stories,
                divergence,
                written: false,
            });
        }
        if !confirm_changes(&changes, divergence)? {
            return Err(SprintError::Cancelled);
        }
    }

    for change in &changes {
        let section = if change.key.starts_with("epic-") {
            Section::EpicMeta
        } else {
            Section::DevelopmentStatus
        };
        doc.insert(section, &change.key, &change.new);
    }
    doc.write(&status_path)?;
    info!(
        changes = changes.len(),
        divergence = format!("{:.0}%", divergence * 100.0),
        "Sprint-status reconciled"
    );

    Ok(ReconcileOutcome {
        changes,
        removed_stories,
        divergence,
        written: true,
    })
}

fn state_derived_status(state: &State, epic: &EpicId, story: u32) -> Option<String> {
    let dotted = format!("{epic}.{story}");
    let dashed = format!("{epic}-{story}");
    if state
        .completed_stories
        .iter()
        .any(|s| s == &dotted || s == &dashed)
    {
        return Some("done".to_string());
    }
    if state.current_story.as_deref() == Some(dotted.as_str()) {
        return Some("in-progress".to_string());
    }
    None
}

/// Present the proposed diff and ask for confirmation.
fn confirm_changes(changes: &[EntryChange], divergence: f64) -> Result<bool, SprintError> {
    eprintln!(
        "{}",
        style(format!(
            "Sprint-status divergence {:.0}% — review {} change(s):",
            divergence * 100.0,
            changes.len()
        ))
        .yellow()
        .bold()
    );
    eprintln!("{:<36} {:<14} {:<14} reason", "entry", "current", "proposed");
    for change in changes {
        eprintln!(
            "{:<36} {:<14} {:<14} {}",
            change.key,
            change.old.as_deref().unwrap_or("-"),
            change.new,
            change.reason
        );
    }

    dialoguer::Confirm::new()
        .with_prompt("Apply these sprint-status changes?")
        .default(false)
        .interact()
        .map_err(|_| SprintError::Cancelled)
}

/// Post-save sync callbacks with a recursion guard: a callback that itself
/// saves state must not re-enter reconciliation.
pub struct SyncRegistry {
    callbacks: Mutex<Vec<Box<dyn Fn() + Send>>>,
    in_sync: AtomicBool,
}

impl SyncRegistry {
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(Vec::new()),
            in_sync: AtomicBool::new(false),
        }
    }

    pub fn register(&self, callback: Box<dyn Fn() + Send>) {
        self.callbacks.lock().unwrap().push(callback);
    }

    /// Fire all callbacks unless a sync is already running.
    pub fn fire(&self) {
        if self.in_sync.swap(true, Ordering::SeqCst) {
            debug!("Sync already in progress, skipping nested fire");
            return;
        }
        let callbacks = self.callbacks.lock().unwrap();
        for callback in callbacks.iter() {
            callback();
        }
        self.in_sync.store(false, Ordering::SeqCst);
    }
}

impl Default for SyncRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn setup_project() -> (tempfile::TempDir, ProjectPaths) {
        let dir = tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        fs::create_dir_all(paths.epics_dir()).unwrap();
        fs::create_dir_all(paths.implementation_artifacts()).unwrap();
        fs::create_dir_all(paths.code_reviews_dir()).unwrap();
        fs::create_dir_all(paths.validations_dir()).unwrap();
        (dir, paths)
    }

    fn write_epic(paths: &ProjectPaths) {
        fs::write(
            paths.epics_dir().join("epic-1-demo.md"),
            "---\nepic_num: 1\ntitle: Demo\n---\n## Story 1.1: Login Flow\n## Story 1.2: Logout\n",
        )
        .unwrap();
    }

    fn opts() -> ReconcileOptions {
        ReconcileOptions {
            divergence_threshold: 1.1, // never interactive in unit tests
            interactive_allowed: false,
            master_model: "claude-opus".into(),
        }
    }

    #[test]
    fn test_reconcile_creates_entries_from_epics() {
        let (_dir, paths) = setup_project();
        write_epic(&paths);

        let outcome = reconcile(&paths, &State::new(), &opts()).unwrap();
        assert!(outcome.written);

        let doc = SprintDoc::load(&paths.sprint_status()).unwrap();
        assert_eq!(
            doc.get(Section::DevelopmentStatus, "1-1-login-flow").unwrap().value,
            "backlog"
        );
        assert_eq!(
            doc.get(Section::DevelopmentStatus, "1-2-logout").unwrap().value,
            "backlog"
        );
        assert_eq!(doc.get(Section::EpicMeta, "epic-1").unwrap().value, "backlog");
    }

    #[test]
    fn test_reconcile_preserves_foreign_entries() {
        let (_dir, paths) = setup_project();
        write_epic(&paths);
        fs::write(
            paths.sprint_status(),
            "# hand comment\ndevelopment_status:\n  standalone-03-fix: done\n  testarch-1-setup: review\n  epic-1-retrospective: done\n  weird-key: yes\n",
        )
        .unwrap();

        reconcile(&paths, &State::new(), &opts()).unwrap();

        let content = fs::read_to_string(paths.sprint_status()).unwrap();
        assert!(content.contains("# hand comment"));
        assert!(content.contains("  standalone-03-fix: done"));
        assert!(content.contains("  testarch-1-setup: review"));
        assert!(content.contains("  epic-1-retrospective: done"));
        assert!(content.contains("  weird-key: yes"));
    }

    #[test]
    fn test_reconcile_evidence_beats_existing() {
        let (_dir, paths) = setup_project();
        write_epic(&paths);
        fs::write(
            paths.sprint_status(),
            "development_status:\n  1-1-login-flow: backlog\n",
        )
        .unwrap();
        // Synthesis artifact: story is done regardless of the ledger.
        fs::write(
            paths.code_reviews_dir().join("code-review-1-1-synthesis.md"),
            "synth",
        )
        .unwrap();

        let outcome = reconcile(&paths, &State::new(), &opts()).unwrap();
        let change = outcome
            .changes
            .iter()
            .find(|c| c.key == "1-1-login-flow")
            .unwrap();
        assert_eq!(change.new, "done");

        let doc = SprintDoc::load(&paths.sprint_status()).unwrap();
        assert_eq!(
            doc.get(Section::DevelopmentStatus, "1-1-login-flow").unwrap().value,
            "done"
        );
    }

    #[test]
    fn test_reconcile_explicit_status_beats_evidence() {
        let (_dir, paths) = setup_project();
        write_epic(&paths);
        fs::write(
            paths.implementation_artifacts().join("1-1-login-flow.md"),
            "Status: in-progress\n",
        )
        .unwrap();
        fs::write(
            paths.code_reviews_dir().join("code-review-1-1-synthesis.md"),
            "synth",
        )
        .unwrap();

        reconcile(&paths, &State::new(), &opts()).unwrap();
        let doc = SprintDoc::load(&paths.sprint_status()).unwrap();
        assert_eq!(
            doc.get(Section::DevelopmentStatus, "1-1-login-flow").unwrap().value,
            "in-progress"
        );
    }

    #[test]
    fn test_reconcile_flags_removed_stories() {
        let (_dir, paths) = setup_project();
        write_epic(&paths);
        fs::write(
            paths.sprint_status(),
            "development_status:\n  1-9-ghost-story: done\n",
        )
        .unwrap();

        let outcome = reconcile(&paths, &State::new(), &opts()).unwrap();
        assert_eq!(outcome.removed_stories, vec!["1-9-ghost-story".to_string()]);

        // Flagged, never deleted.
        let content = fs::read_to_string(paths.sprint_status()).unwrap();
        assert!(content.contains("1-9-ghost-story: done"));
    }

    #[test]
    fn test_reconcile_epic_meta_complete_when_all_done() {
        let (_dir, paths) = setup_project();
        write_epic(&paths);
        for story in [1, 2] {
            fs::write(
                paths
                    .code_reviews_dir()
                    .join(format!("code-review-1-{story}-synthesis.md")),
                "synth",
            )
            .unwrap();
        }

        reconcile(&paths, &State::new(), &opts()).unwrap();
        let doc = SprintDoc::load(&paths.sprint_status()).unwrap();
        assert_eq!(doc.get(Section::EpicMeta, "epic-1").unwrap().value, "done");
    }

    #[test]
    fn test_reconcile_high_divergence_noninteractive_skips_write() {
        let (_dir, paths) = setup_project();
        write_epic(&paths);

        let strict = ReconcileOptions {
            divergence_threshold: 0.0,
            interactive_allowed: false,
            master_model: "claude-opus".into(),
        };
        // Force a divergence: story evidence exists, no ledger yet.
        fs::write(
            paths.code_reviews_dir().join("code-review-1-1-synthesis.md"),
            "synth",
        )
        .unwrap();

        let outcome = reconcile(&paths, &State::new(), &strict).unwrap();
        assert!(!outcome.written);
        assert!(!paths.sprint_status().exists());
    }

    #[test]
    fn test_state_derived_statuses() {
        let mut state = State::new();
        state.completed_stories.push("1.1".into());
        state.current_story = Some("1.2".into());

        assert_eq!(
            state_derived_status(&state, &EpicId::Number(1), 1),
            Some("done".into())
        );
        assert_eq!(
            state_derived_status(&state, &EpicId::Number(1), 2),
            Some("in-progress".into())
        );
        assert_eq!(state_derived_status(&state, &EpicId::Number(1), 3), None);
    }

    #[test]
    fn test_sync_registry_recursion_guard() {
        let registry = Arc::new(SyncRegistry::new());
        let count = Arc::new(AtomicUsize::new(0));

        let registry_inner = Arc::clone(&registry);
        let count_inner = Arc::clone(&count);
        registry.register(Box::new(move || {
            count_inner.fetch_add(1, Ordering::SeqCst);
            // Re-entrant fire must be suppressed by the guard.
            registry_inner.fire();
        }));

        registry.fire();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
