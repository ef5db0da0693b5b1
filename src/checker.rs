//! Discrepancy detection between loop State and the project's epic docs.
//!
//! Surfaced by the `status` CLI command so an operator can see where the
//! tool's bookkeeping and the on-disk project diverge before resuming a run.

use serde::Serialize;

use crate::epics::EpicDoc;
use crate::paths::ProjectPaths;
use crate::sprint::inference::infer_story_status;
use crate::state::State;

/// A difference between internal state and project files.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Discrepancy {
    /// Type identifier, e.g. "story_status_mismatch".
    pub r#type: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub story_number: Option<String>,
    pub file_path: Option<String>,
    pub description: String,
}

impl std::fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.description.is_empty() {
            write!(
                f,
                "{}: expected={:?}, actual={:?}",
                self.r#type, self.expected, self.actual
            )
        } else {
            f.write_str(&self.description)
        }
    }
}

/// Compare loop State against epic docs and artifact evidence.
///
/// Results are sorted deterministically by `(type, story_number)`.
pub fn detect_discrepancies(
    state: &State,
    epic_docs: &[EpicDoc],
    paths: &ProjectPaths,
    master_model: &str,
) -> Vec<Discrepancy> {
    let mut discrepancies = Vec::new();

    let mut doc_story_keys = Vec::new();
    for doc in epic_docs {
        for story in &doc.stories {
            doc_story_keys.push(story.story_key());
        }
    }

    // Stories the state tracks but no epic doc declares.
    let mut tracked: Vec<&String> = state.completed_stories.iter().collect();
    if let Some(current) = &state.current_story {
        tracked.push(current);
    }
    for story_key in &tracked {
        if !doc_story_keys.contains(story_key) {
            discrepancies.push(Discrepancy {
                r#type: "story_not_in_epics".into(),
                expected: Some((*story_key).clone()),
                actual: None,
                story_number: Some((*story_key).clone()),
                file_path: None,
                description: format!(
                    "Story {story_key} tracked in state but not found in epic docs"
                ),
            });
        }
    }

    // Completed stories whose artifacts disagree.
    for doc in epic_docs {
        let epic = doc.frontmatter.epic_num.to_string();
        for story in &doc.stories {
            let key = story.story_key();
            let inference = infer_story_status(paths, &epic, story.story, master_model);
            let Some(actual) = inference.status else {
                continue;
            };

            if state.completed_stories.contains(&key) {
                if actual != "done" {
                    discrepancies.push(Discrepancy {
                        r#type: "story_status_mismatch".into(),
                        expected: Some("done".into()),
                        actual: Some(actual.clone()),
                        story_number: Some(key.clone()),
                        file_path: None,
                        description: format!(
                            "Story {key} status mismatch: state=done, artifacts={actual}"
                        ),
                    });
                }
            } else if state.current_story.as_deref() == Some(key.as_str()) && actual == "done" {
                discrepancies.push(Discrepancy {
                    r#type: "story_status_mismatch".into(),
                    expected: Some("in-progress".into()),
                    actual: Some("done".into()),
                    story_number: Some(key.clone()),
                    file_path: None,
                    description: format!(
                        "Story {key} status mismatch: state=in-progress, artifacts=done"
                    ),
                });
            }
        }
    }

    discrepancies.sort_by(|a, b| {
        (a.r#type.as_str(), a.story_number.as_deref().unwrap_or(""))
            .cmp(&(b.r#type.as_str(), b.story_number.as_deref().unwrap_or("")))
    });
    discrepancies
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epics::parse_epic_doc;
    use std::fs;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, ProjectPaths, Vec<EpicDoc>) {
        let dir = tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        fs::create_dir_all(paths.epics_dir()).unwrap();
        fs::create_dir_all(paths.implementation_artifacts()).unwrap();
        fs::create_dir_all(paths.code_reviews_dir()).unwrap();
        fs::create_dir_all(paths.validations_dir()).unwrap();

        let epic_path = paths.epics_dir().join("epic-1-demo.md");
        fs::write(
            &epic_path,
            "---\nepic_num: 1\ntitle: Demo\n---\n## Story 1.1: Alpha\n## Story 1.2: Beta\n",
        )
        .unwrap();
        let docs = vec![parse_epic_doc(&epic_path).unwrap()];
        (dir, paths, docs)
    }

    #[test]
    fn test_no_discrepancies_on_fresh_project() {
        let (_dir, paths, docs) = setup();
        let found = detect_discrepancies(&State::new(), &docs, &paths, "claude");
        assert!(found.is_empty());
    }

    #[test]
    fn test_completed_story_without_done_evidence() {
        let (_dir, paths, docs) = setup();
        let mut state = State::new();
        state.completed_stories.push("1.1".into());
        // Only a validation artifact: inference says ready-for-dev, not done.
        fs::write(
            paths.validations_dir().join("validation-1-1-codex.md"),
            "v",
        )
        .unwrap();

        let found = detect_discrepancies(&state, &docs, &paths, "claude");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].r#type, "story_status_mismatch");
        assert_eq!(found[0].actual.as_deref(), Some("ready-for-dev"));
    }

    #[test]
    fn test_story_tracked_but_not_declared() {
        let (_dir, paths, docs) = setup();
        let mut state = State::new();
        state.completed_stories.push("9.9".into());

        let found = detect_discrepancies(&state, &docs, &paths, "claude");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].r#type, "story_not_in_epics");
    }

    #[test]
    fn test_deterministic_ordering() {
        let (_dir, paths, docs) = setup();
        let mut state = State::new();
        state.completed_stories.push("9.9".into());
        state.completed_stories.push("1.1".into());
        fs::write(
            paths.validations_dir().join("validation-1-1-codex.md"),
            "v",
        )
        .unwrap();

        let found = detect_discrepancies(&state, &docs, &paths, "claude");
        let kinds: Vec<&str> = found.iter().map(|d| d.r#type.as_str()).collect();
        // Sorted by (type, story_number).
        assert_eq!(kinds, vec!["story_not_in_epics", "story_status_mismatch"]);
    }
}
