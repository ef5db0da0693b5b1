//! Context-file discovery and embedding.
//!
//! Each workflow declares glob patterns for the documents it needs. Matches
//! are ordered general → specific (shallower paths first) so broad project
//! documents precede narrowly scoped ones in the prompt.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::errors::CompilerError;

use super::{CompilerContext, WorkflowSpec};

/// Discover matching files and embed their contents as tagged sections.
pub fn discover_and_embed(
    spec: &WorkflowSpec,
    ctx: &CompilerContext,
) -> Result<Vec<(String, String)>, CompilerError> {
    let mut sections = Vec::new();

    for pattern in spec.context_patterns {
        let matches = discover_files(&ctx.project_root, pattern)?;
        if spec.unique_patterns.contains(pattern) && matches.len() > 1 {
            return Err(CompilerError::AmbiguousFile {
                pattern: (*pattern).to_string(),
                candidates: matches,
            });
        }
        for path in matches {
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    let tag = section_tag(&ctx.project_root, &path);
                    sections.push((tag, content));
                }
                Err(e) => warn!("Skipping unreadable context file {}: {e}", path.display()),
            }
        }
    }

    debug!(
        workflow = spec.name,
        files = sections.len(),
        "Embedded context files"
    );
    Ok(sections)
}

/// Expand one glob pattern under the project root, ordered general →
/// specific: fewer path components first, then lexicographic.
pub fn discover_files(project_root: &Path, pattern: &str) -> Result<Vec<PathBuf>, CompilerError> {
    let full_pattern = project_root.join(pattern);
    let full_pattern = full_pattern.to_string_lossy();

    let mut matches: Vec<PathBuf> = glob::glob(&full_pattern)
        .map_err(|e| CompilerError::Parser(format!("invalid glob '{pattern}': {e}")))?
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .collect();

    matches.sort_by_key(|p| (p.components().count(), p.clone()));
    Ok(matches)
}

/// Tag name for an embedded file: its project-relative path with separators
/// flattened (e.g. `docs/epics/epic-1.md` → `file-docs-epics-epic-1.md`).
fn section_tag(project_root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(project_root).unwrap_or(path);
    let flat = rel
        .to_string_lossy()
        .replace(std::path::MAIN_SEPARATOR, "-");
    format!("file-{flat}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_discover_files_orders_general_to_specific() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("docs/epics/details")).unwrap();
        fs::write(dir.path().join("docs/overview.md"), "overview").unwrap();
        fs::write(dir.path().join("docs/epics/epic-1.md"), "epic").unwrap();
        fs::write(dir.path().join("docs/epics/details/epic-1-notes.md"), "notes").unwrap();

        let matches = discover_files(dir.path(), "docs/**/*.md").unwrap();
        let names: Vec<String> = matches
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["overview.md", "epic-1.md", "epic-1-notes.md"]);
    }

    #[test]
    fn test_discover_files_skips_directories() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("docs/epic-1.md")).unwrap();
        fs::write(dir.path().join("docs/epic-2.md"), "real file").unwrap();

        let matches = discover_files(dir.path(), "docs/epic-*.md").unwrap();
        assert_eq!(matches.len(), 1);
        assert!(matches[0].ends_with("docs/epic-2.md"));
    }

    #[test]
    fn test_embed_produces_tagged_sections() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("docs/epics")).unwrap();
        fs::write(dir.path().join("docs/epics/epic-1-demo.md"), "# Epic").unwrap();

        let spec = crate::compiler::get_workflow_spec("create-story").unwrap();
        let ctx = CompilerContext::new(dir.path(), Config::default());
        let sections = discover_and_embed(spec, &ctx).unwrap();

        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].0, "file-docs-epics-epic-1-demo.md");
        assert_eq!(sections[0].1, "# Epic");
    }
}
