//! Evidence-based status inference for sprint-status entries.
//!
//! Hierarchy, highest wins:
//! 1. Story file `Status:` field — explicit, authoritative
//! 2. Synthesis or master code-review artifact — story is `done`
//! 3. Any code-review artifact — `review`
//! 4. Any validation report — `ready-for-dev`
//! 5. Story file present without a Status — `in-progress`
//! 6. Nothing — no inference; caller preserves existing or uses `backlog`

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::paths::ProjectPaths;
use crate::types::normalize_status;

/// How confident an inference is, ordered weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Confidence {
    None,
    Weak,
    Medium,
    Strong,
    Explicit,
}

/// An inferred status plus the evidence behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct Inference {
    pub status: Option<String>,
    pub confidence: Confidence,
    pub evidence: String,
}

fn status_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?im)^Status:\s*(.+)$").unwrap())
}

/// Find the story file for `{epic}-{story}-*` under implementation
/// artifacts.
pub fn find_story_file(paths: &ProjectPaths, epic: &str, story: u32) -> Option<std::path::PathBuf> {
    let pattern = paths
        .implementation_artifacts()
        .join(format!("{epic}-{story}-*.md"));
    glob::glob(&pattern.to_string_lossy())
        .ok()?
        .filter_map(Result::ok)
        .find(|p| p.is_file())
}

fn any_match(dir: &Path, pattern: &str) -> bool {
    glob::glob(&dir.join(pattern).to_string_lossy())
        .map(|mut it| it.any(|r| r.is_ok_and(|p| p.is_file())))
        .unwrap_or(false)
}

/// Infer the status of one story from on-disk artifacts.
///
/// `master_model` is the master provider's display model, used to recognize
/// the master's own code review alongside the synthesis report.
pub fn infer_story_status(
    paths: &ProjectPaths,
    epic: &str,
    story: u32,
    master_model: &str,
) -> Inference {
    // 1. Explicit Status: field in the story file.
    let story_file = find_story_file(paths, epic, story);
    if let Some(path) = &story_file {
        if let Ok(content) = std::fs::read_to_string(path) {
            if let Some(caps) = status_line_regex().captures(&content) {
                if let Some(status) = normalize_status(&caps[1]) {
                    debug!("Story {epic}-{story}: explicit status '{status}'");
                    return Inference {
                        status: Some(status),
                        confidence: Confidence::Explicit,
                        evidence: format!("Status: field in {}", path.display()),
                    };
                }
            }
        }
    }

    // 2. Master code review or synthesis report.
    let reviews_dir = paths.code_reviews_dir();
    if any_match(&reviews_dir, &format!("code-review-{epic}-{story}-synthesis.md"))
        || any_match(&reviews_dir, &format!("code-review-{epic}-{story}-{master_model}.md"))
    {
        return Inference {
            status: Some("done".into()),
            confidence: Confidence::Strong,
            evidence: "master code review / synthesis artifact".into(),
        };
    }

    // 3. Any evaluator code review.
    if any_match(&reviews_dir, &format!("code-review-{epic}-{story}-*.md")) {
        return Inference {
            status: Some("review".into()),
            confidence: Confidence::Medium,
            evidence: "evaluator code review artifact".into(),
        };
    }

    // 4. Any validation report.
    if any_match(
        &paths.validations_dir(),
        &format!("validation-{epic}-{story}-*.md"),
    ) {
        return Inference {
            status: Some("ready-for-dev".into()),
            confidence: Confidence::Medium,
            evidence: "validation report artifact".into(),
        };
    }

    // 5. Story file without a recognized Status.
    if story_file.is_some() {
        return Inference {
            status: Some("in-progress".into()),
            confidence: Confidence::Weak,
            evidence: "story file without Status field".into(),
        };
    }

    // 6. No evidence.
    Inference {
        status: None,
        confidence: Confidence::None,
        evidence: "no artifacts found".into(),
    }
}

/// Epic status derived from its final story statuses: done when every story
/// is done, backlog when every story is backlog, in-progress otherwise.
pub fn infer_epic_status(story_statuses: &[String]) -> String {
    if story_statuses.is_empty() {
        return "backlog".into();
    }
    if story_statuses.iter().all(|s| s == "done") {
        return "done".into();
    }
    if story_statuses.iter().all(|s| s == "backlog") {
        return "backlog".into();
    }
    "in-progress".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, ProjectPaths) {
        let dir = tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        fs::create_dir_all(paths.implementation_artifacts()).unwrap();
        fs::create_dir_all(paths.code_reviews_dir()).unwrap();
        fs::create_dir_all(paths.validations_dir()).unwrap();
        (dir, paths)
    }

    #[test]
    fn test_explicit_status_wins_over_artifacts() {
        let (_dir, paths) = setup();
        fs::write(
            paths.implementation_artifacts().join("3-2-token.md"),
            "# Story 3.2\nStatus: Ready For Dev\n",
        )
        .unwrap();
        // Even with a synthesis artifact present, the explicit field rules.
        fs::write(
            paths.code_reviews_dir().join("code-review-3-2-synthesis.md"),
            "synth",
        )
        .unwrap();

        let inference = infer_story_status(&paths, "3", 2, "claude-opus");
        assert_eq!(inference.status.as_deref(), Some("ready-for-dev"));
        assert_eq!(inference.confidence, Confidence::Explicit);
    }

    #[test]
    fn test_synthesis_artifact_means_done() {
        let (_dir, paths) = setup();
        fs::write(
            paths.code_reviews_dir().join("code-review-3-2-synthesis.md"),
            "synth",
        )
        .unwrap();
        let inference = infer_story_status(&paths, "3", 2, "claude-opus");
        assert_eq!(inference.status.as_deref(), Some("done"));
        assert_eq!(inference.confidence, Confidence::Strong);
    }

    #[test]
    fn test_evaluator_review_means_review() {
        let (_dir, paths) = setup();
        fs::write(
            paths.code_reviews_dir().join("code-review-3-2-gemini-pro.md"),
            "review",
        )
        .unwrap();
        let inference = infer_story_status(&paths, "3", 2, "claude-opus");
        assert_eq!(inference.status.as_deref(), Some("review"));
    }

    #[test]
    fn test_validation_report_means_ready_for_dev() {
        let (_dir, paths) = setup();
        fs::write(
            paths.validations_dir().join("validation-3-2-codex.md"),
            "validated",
        )
        .unwrap();
        let inference = infer_story_status(&paths, "3", 2, "claude-opus");
        assert_eq!(inference.status.as_deref(), Some("ready-for-dev"));
    }

    #[test]
    fn test_story_file_without_status_is_in_progress() {
        let (_dir, paths) = setup();
        fs::write(
            paths.implementation_artifacts().join("3-2-token.md"),
            "# Story 3.2\nNo status line here.\n",
        )
        .unwrap();
        let inference = infer_story_status(&paths, "3", 2, "claude-opus");
        assert_eq!(inference.status.as_deref(), Some("in-progress"));
        assert_eq!(inference.confidence, Confidence::Weak);
    }

    #[test]
    fn test_no_evidence_returns_none() {
        let (_dir, paths) = setup();
        let inference = infer_story_status(&paths, "3", 2, "claude-opus");
        assert_eq!(inference.status, None);
        assert_eq!(inference.confidence, Confidence::None);
    }

    #[test]
    fn test_unrecognized_explicit_status_falls_through() {
        let (_dir, paths) = setup();
        fs::write(
            paths.implementation_artifacts().join("3-2-token.md"),
            "Status: shipped-to-mars\n",
        )
        .unwrap();
        let inference = infer_story_status(&paths, "3", 2, "claude-opus");
        // Invalid value is not explicit; file presence still counts.
        assert_eq!(inference.status.as_deref(), Some("in-progress"));
    }

    #[test]
    fn test_infer_epic_status() {
        assert_eq!(infer_epic_status(&[]), "backlog");
        assert_eq!(infer_epic_status(&["done".into(), "done".into()]), "done");
        assert_eq!(
            infer_epic_status(&["backlog".into(), "backlog".into()]),
            "backlog"
        );
        assert_eq!(
            infer_epic_status(&["done".into(), "backlog".into()]),
            "in-progress"
        );
    }
}
