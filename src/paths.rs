//! Canonical filesystem layout for a bmad-assist project.
//!
//! All artifact locations are derived from the project root here so handlers
//! and the reconciler never hand-build paths. Paths stay relative strings in
//! config and are resolved when consumed.

use std::path::{Path, PathBuf};

use crate::types::EpicId;

/// Tool-private directory name under the project root.
pub const TOOL_DIR: &str = ".bmad-assist";
/// Shared output directory name under the project root.
pub const OUTPUT_DIR: &str = "_bmad-output";

/// Resolved path set for one project.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub project_root: PathBuf,
}

impl ProjectPaths {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    /// `.bmad-assist/` — tool-private files.
    pub fn tool_dir(&self) -> PathBuf {
        self.project_root.join(TOOL_DIR)
    }

    /// `.bmad-assist/state.yaml` — the loop's authoritative state.
    pub fn state_file(&self) -> PathBuf {
        self.tool_dir().join("state.yaml")
    }

    /// `.bmad-assist/pause` — presence requests a cooperative pause.
    pub fn pause_flag(&self) -> PathBuf {
        self.tool_dir().join("pause")
    }

    /// `.bmad-assist/patches/` — workflow patch files.
    pub fn patches_dir(&self) -> PathBuf {
        self.tool_dir().join("patches")
    }

    /// `.bmad-assist/cache/` — compiled workflow templates.
    pub fn cache_dir(&self) -> PathBuf {
        self.tool_dir().join("cache")
    }

    /// `.bmad-assist/benchmarks/` — per-evaluator benchmarking records.
    pub fn benchmarks_dir(&self) -> PathBuf {
        self.tool_dir().join("benchmarks")
    }

    /// `.bmad-assist/logs/` — run logs.
    pub fn logs_dir(&self) -> PathBuf {
        self.tool_dir().join("logs")
    }

    /// `docs/epics/` — epic documents.
    pub fn epics_dir(&self) -> PathBuf {
        self.project_root.join("docs").join("epics")
    }

    /// `_bmad-output/` — shared output root.
    pub fn output_dir(&self) -> PathBuf {
        self.project_root.join(OUTPUT_DIR)
    }

    /// `_bmad-output/planning-artifacts/`.
    pub fn planning_artifacts(&self) -> PathBuf {
        self.output_dir().join("planning-artifacts")
    }

    /// `_bmad-output/implementation-artifacts/` — stories and per-phase output.
    pub fn implementation_artifacts(&self) -> PathBuf {
        self.output_dir().join("implementation-artifacts")
    }

    /// The authoritative sprint-status ledger.
    pub fn sprint_status(&self) -> PathBuf {
        self.implementation_artifacts().join("sprint-status.yaml")
    }

    /// Legacy sprint-status location, still honored for resolution checks.
    pub fn sprint_status_legacy(&self) -> PathBuf {
        self.project_root.join("docs").join("sprint-status.yaml")
    }

    pub fn validations_dir(&self) -> PathBuf {
        self.implementation_artifacts().join("story-validations")
    }

    pub fn code_reviews_dir(&self) -> PathBuf {
        self.implementation_artifacts().join("code-reviews")
    }

    pub fn retrospectives_dir(&self) -> PathBuf {
        self.implementation_artifacts().join("retrospectives")
    }

    pub fn qa_artifacts_dir(&self) -> PathBuf {
        self.implementation_artifacts().join("qa-artifacts")
    }

    pub fn qa_test_plans_dir(&self) -> PathBuf {
        self.qa_artifacts_dir().join("test-plans")
    }

    pub fn qa_test_results_dir(&self) -> PathBuf {
        self.qa_artifacts_dir().join("test-results")
    }

    pub fn qa_traceability_dir(&self) -> PathBuf {
        self.qa_artifacts_dir().join("traceability")
    }

    /// Story file path: `{E}-{S}-{slug}.md` under implementation artifacts.
    pub fn story_file(&self, epic: &EpicId, story: u32, slug: &str) -> PathBuf {
        self.implementation_artifacts()
            .join(format!("{epic}-{story}-{slug}.md"))
    }

    /// Validation artifact for one evaluator.
    pub fn validation_file(&self, epic: &EpicId, story: u32, evaluator: &str) -> PathBuf {
        self.validations_dir()
            .join(format!("validation-{epic}-{story}-{evaluator}.md"))
    }

    /// Code-review artifact for one evaluator.
    pub fn code_review_file(&self, epic: &EpicId, story: u32, evaluator: &str) -> PathBuf {
        self.code_reviews_dir()
            .join(format!("code-review-{epic}-{story}-{evaluator}.md"))
    }

    /// Retrospective report: `epic-{id}-retro-{YYYYMMDD}.md`.
    pub fn retro_file(&self, epic: &EpicId, yyyymmdd: &str) -> PathBuf {
        self.retrospectives_dir()
            .join(format!("epic-{epic}-retro-{yyyymmdd}.md"))
    }

    /// QA plan: `epic-{id}-e2e-plan.md`.
    pub fn qa_plan_file(&self, epic: &EpicId) -> PathBuf {
        self.qa_test_plans_dir()
            .join(format!("epic-{epic}-e2e-plan.md"))
    }

    /// QA results: `epic-{id}-run-{timestamp}.yaml`.
    pub fn qa_run_file(&self, epic: &EpicId, timestamp: &str) -> PathBuf {
        self.qa_test_results_dir()
            .join(format!("epic-{epic}-run-{timestamp}.yaml"))
    }
}

/// Global (per-user) directories under `~/.bmad-assist/`.
#[derive(Debug, Clone)]
pub struct GlobalPaths {
    pub home_dir: PathBuf,
}

impl GlobalPaths {
    /// Resolve from the user's home directory.
    pub fn resolve() -> Option<Self> {
        dirs::home_dir().map(|home| Self {
            home_dir: home.join(TOOL_DIR),
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.home_dir.join("config.yaml")
    }

    pub fn patcher_config(&self) -> PathBuf {
        self.home_dir.join("patcher.yaml")
    }

    pub fn patches_dir(&self) -> PathBuf {
        self.home_dir.join("patches")
    }

    pub fn debug_json_dir(&self) -> PathBuf {
        self.home_dir.join("debug").join("json")
    }

    pub fn debug_prompts_dir(&self) -> PathBuf {
        self.home_dir.join("debug").join("prompts")
    }
}

/// Expand `~`, `{project-root}` and `{installed_path}` in a path string.
///
/// `installed_path` is the parent of the workflow config file consuming the
/// value; pass `None` when no workflow is in scope.
pub fn expand_path(raw: &str, project_root: &Path, installed_path: Option<&Path>) -> PathBuf {
    let mut s = raw.to_string();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return expand_path(
                &home.join(rest).to_string_lossy(),
                project_root,
                installed_path,
            );
        }
    } else if s == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    s = s.replace("{project-root}", &project_root.to_string_lossy());
    if let Some(ip) = installed_path {
        s = s.replace("{installed_path}", &ip.to_string_lossy());
    }
    PathBuf::from(s)
}

/// Original working directory per `BMAD_ORIGINAL_CWD`; empty counts as unset.
pub fn original_cwd() -> Option<PathBuf> {
    match std::env::var("BMAD_ORIGINAL_CWD") {
        Ok(v) if !v.is_empty() => Some(PathBuf::from(v)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EpicId;

    #[test]
    fn test_layout_under_project_root() {
        let paths = ProjectPaths::new("/proj");
        assert_eq!(paths.state_file(), PathBuf::from("/proj/.bmad-assist/state.yaml"));
        assert_eq!(
            paths.sprint_status(),
            PathBuf::from("/proj/_bmad-output/implementation-artifacts/sprint-status.yaml")
        );
        assert_eq!(
            paths.validations_dir(),
            PathBuf::from("/proj/_bmad-output/implementation-artifacts/story-validations")
        );
    }

    #[test]
    fn test_artifact_filenames() {
        let paths = ProjectPaths::new("/proj");
        let epic = EpicId::Number(3);
        assert!(
            paths
                .story_file(&epic, 2, "user-login")
                .ends_with("3-2-user-login.md")
        );
        assert!(
            paths
                .validation_file(&epic, 2, "claude-opus")
                .ends_with("validation-3-2-claude-opus.md")
        );
        assert!(
            paths
                .retro_file(&epic, "20260301")
                .ends_with("epic-3-retro-20260301.md")
        );
        let tagged = EpicId::Tag("testarch".into());
        assert!(
            paths
                .qa_plan_file(&tagged)
                .ends_with("epic-testarch-e2e-plan.md")
        );
    }

    #[test]
    fn test_expand_path_placeholders() {
        let root = Path::new("/proj");
        let wf = Path::new("/proj/.bmad/workflows/create-story");
        assert_eq!(
            expand_path("{project-root}/docs", root, None),
            PathBuf::from("/proj/docs")
        );
        assert_eq!(
            expand_path("{installed_path}/instructions.xml", root, Some(wf)),
            PathBuf::from("/proj/.bmad/workflows/create-story/instructions.xml")
        );
    }

    #[test]
    fn test_original_cwd_empty_is_unset() {
        // Serialized through env var; empty string must behave as unset.
        unsafe {
            std::env::set_var("BMAD_ORIGINAL_CWD", "");
        }
        assert!(original_cwd().is_none());
        unsafe {
            std::env::set_var("BMAD_ORIGINAL_CWD", "/somewhere");
        }
        assert_eq!(original_cwd(), Some(PathBuf::from("/somewhere")));
        unsafe {
            std::env::remove_var("BMAD_ORIGINAL_CWD");
        }
    }
}
