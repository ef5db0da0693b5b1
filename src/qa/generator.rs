//! QA plan generator: builds an E2E test plan for an epic via the master
//! provider.
//!
//! Loads the epic content plus optional traceability and UX/test-design
//! docs, invokes the master with an embedded prompt, and saves the plan. An
//! existing plan is backed up with a timestamp before regeneration.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::errors::QaError;
use crate::handlers::{HandlerContext, collect_text, invoke_master};
use crate::timing::local_now;
use crate::types::EpicId;
use crate::util::atomic_write_str;

/// Back up an existing plan as `…backup-{YYYYMMDD}T{HHMMSS}.md`. Returns
/// the backup path when one was made.
pub fn backup_existing_plan(
    plan_path: &std::path::Path,
) -> Result<Option<PathBuf>, QaError> {
    if !plan_path.exists() {
        return Ok(None);
    }
    let stamp = local_now().format("%Y%m%dT%H%M%S");
    let backup = plan_path.with_file_name(format!(
        "{}.backup-{stamp}.md",
        plan_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "plan".into())
    ));
    std::fs::copy(plan_path, &backup).map_err(|e| QaError::SaveFailed {
        path: backup.clone(),
        source: e,
    })?;
    info!("Backed up existing QA plan to {}", backup.display());
    Ok(Some(backup))
}

fn read_optional(path: &std::path::Path) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

/// Build the generation prompt from the docs on disk.
pub fn build_generation_prompt(ctx: &HandlerContext, epic: &EpicId) -> Result<String, QaError> {
    let epic_pattern = ctx
        .paths
        .epics_dir()
        .join(format!("epic-{epic}-*.md"));
    let epic_content = glob::glob(&epic_pattern.to_string_lossy())
        .ok()
        .and_then(|mut it| it.find_map(Result::ok))
        .and_then(|p| read_optional(&p))
        .ok_or_else(|| QaError::Other(anyhow::anyhow!("No epic doc found for epic {epic}")))?;

    let traceability = read_optional(
        &ctx.paths
            .qa_traceability_dir()
            .join(format!("epic-{epic}-trace.md")),
    );
    let ux_elements = read_optional(&ctx.paths.project_root.join("docs/ux-elements.md"));
    let test_design = read_optional(&ctx.paths.project_root.join("docs/test-design.md"));

    let mut parts = Vec::new();
    parts.push("<task-context>".to_string());
    parts.push(format!(
        "Produce a complete E2E test plan for epic {epic}. Use three categories: \
         A (CLI/bash, safe to run headless), B (Playwright UI, typescript), \
         C (documentation-only, not executable). Test IDs follow E{epic}-A01 style. \
         Start with a Master Checklist table of every test, then one ###-section \
         per test with its script in a fenced code block (bash for A, typescript for B)."
    ));
    parts.push("</task-context>".to_string());
    parts.push("<source-document>".to_string());
    parts.push(format!("<epic>\n{epic_content}\n</epic>"));
    if let Some(trace) = traceability {
        parts.push(format!("<traceability>\n{trace}\n</traceability>"));
    }
    if let Some(ux) = ux_elements {
        parts.push(format!("<ux-elements>\n{ux}\n</ux-elements>"));
    }
    if let Some(design) = test_design {
        parts.push(format!("<test-design>\n{design}\n</test-design>"));
    }
    parts.push("</source-document>".to_string());
    parts.push("<output-format>".to_string());
    parts.push("Write the complete Markdown test plan, nothing else.".to_string());
    parts.push("</output-format>".to_string());
    Ok(parts.join("\n"))
}

/// Generate (or regenerate) the plan for an epic. Returns the plan path.
pub async fn generate_qa_plan(ctx: &HandlerContext, epic: &EpicId) -> Result<PathBuf, QaError> {
    let prompt = build_generation_prompt(ctx, epic)?;
    let plan_path = ctx.paths.qa_plan_file(epic);

    backup_existing_plan(&plan_path)?;

    let result = invoke_master(ctx, &prompt).await?;
    let plan = collect_text(&result.stdout);
    if plan.trim().is_empty() {
        return Err(QaError::Other(anyhow::anyhow!(
            "Master provider returned an empty QA plan for epic {epic}"
        )));
    }

    atomic_write_str(&plan_path, &plan).map_err(|e| {
        warn!("Failed to write QA plan: {e}");
        QaError::SaveFailed {
            path: plan_path.clone(),
            source: std::io::Error::other(e.to_string()),
        }
    })?;

    info!("QA plan saved to {}", plan_path.display());
    Ok(plan_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dashboard::events::DashboardEmitter;
    use crate::paths::ProjectPaths;
    use std::fs;
    use tempfile::tempdir;

    fn ctx_for(dir: &std::path::Path) -> HandlerContext {
        HandlerContext {
            config: Config::default(),
            paths: ProjectPaths::new(dir),
            emitter: DashboardEmitter::new("t", false),
            debug_enabled: false,
        }
    }

    #[test]
    fn test_backup_existing_plan() {
        let dir = tempdir().unwrap();
        let plan = dir.path().join("epic-1-e2e-plan.md");
        fs::write(&plan, "old plan").unwrap();

        let backup = backup_existing_plan(&plan).unwrap().unwrap();
        assert!(backup.exists());
        let name = backup.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("epic-1-e2e-plan.backup-"));
        assert!(name.ends_with(".md"));
        assert_eq!(fs::read_to_string(backup).unwrap(), "old plan");
    }

    #[test]
    fn test_backup_absent_plan_is_none() {
        let dir = tempdir().unwrap();
        assert!(
            backup_existing_plan(&dir.path().join("missing.md"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_build_generation_prompt_embeds_docs() {
        let dir = tempdir().unwrap();
        let ctx = ctx_for(dir.path());
        fs::create_dir_all(ctx.paths.epics_dir()).unwrap();
        fs::create_dir_all(ctx.paths.qa_traceability_dir()).unwrap();
        fs::write(
            ctx.paths.epics_dir().join("epic-1-demo.md"),
            "---\nepic_num: 1\n---\n# Epic body",
        )
        .unwrap();
        fs::write(
            ctx.paths.qa_traceability_dir().join("epic-1-trace.md"),
            "trace table",
        )
        .unwrap();

        let prompt = build_generation_prompt(&ctx, &EpicId::Number(1)).unwrap();
        assert!(prompt.contains("# Epic body"));
        assert!(prompt.contains("trace table"));
        assert!(prompt.contains("Master Checklist"));
    }

    #[test]
    fn test_build_generation_prompt_missing_epic() {
        let dir = tempdir().unwrap();
        let ctx = ctx_for(dir.path());
        assert!(build_generation_prompt(&ctx, &EpicId::Number(9)).is_err());
    }
}
