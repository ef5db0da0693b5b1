//! Safe project-file serving for the dashboard.
//!
//! Every served path must resolve inside the project root; symlinks are
//! rejected outright. Responses are `text/plain` — the dashboard renders,
//! the server never interprets.

use std::path::{Component, Path, PathBuf};

use crate::errors::DashboardError;
use crate::paths::ProjectPaths;

/// Resolve a requested path against the project root and enforce
/// containment. Rejects `..`, absolute escapes, and symlinks.
pub fn resolve_contained(
    project_root: &Path,
    requested: &str,
) -> Result<PathBuf, DashboardError> {
    let candidate = Path::new(requested);
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(DashboardError::PathOutsideProject(candidate.to_path_buf()));
    }

    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        project_root.join(candidate)
    };

    if joined
        .symlink_metadata()
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
    {
        return Err(DashboardError::SymlinkRejected(joined));
    }

    let root = project_root
        .canonicalize()
        .unwrap_or_else(|_| project_root.to_path_buf());
    let resolved = joined.canonicalize().unwrap_or(joined);
    if !resolved.starts_with(&root) {
        return Err(DashboardError::PathOutsideProject(resolved));
    }
    Ok(resolved)
}

/// Read a contained file as text.
pub fn read_contained(project_root: &Path, requested: &str) -> Result<String, DashboardError> {
    let path = resolve_contained(project_root, requested)?;
    std::fs::read_to_string(&path)
        .map_err(|_| DashboardError::NotFound(path.display().to_string()))
}

/// Locate the saved prompt for `(epic, story, phase)` in the debug prompts
/// directory — most recent match wins.
pub fn find_prompt_file(prompts_dir: &Path, phase: &str) -> Option<PathBuf> {
    let pattern = prompts_dir.join(format!("*-{phase}.xml"));
    let mut matches: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
        .ok()?
        .filter_map(Result::ok)
        .collect();
    matches.sort();
    matches.pop()
}

/// Concatenate all validation reports for a story.
pub fn load_validations(
    paths: &ProjectPaths,
    epic: &str,
    story: &str,
) -> Result<String, DashboardError> {
    let pattern = paths
        .validations_dir()
        .join(format!("validation-{epic}-{story}-*.md"));
    let mut reports: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
        .map(|it| it.filter_map(Result::ok).collect())
        .unwrap_or_default();
    reports.sort();

    if reports.is_empty() {
        return Err(DashboardError::NotFound(format!(
            "no validations for story {epic}.{story}"
        )));
    }

    let mut combined = String::new();
    for report in reports {
        let name = report
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        combined.push_str(&format!("===== {name} =====\n"));
        combined.push_str(&std::fs::read_to_string(&report).unwrap_or_default());
        combined.push('\n');
    }
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_resolve_contained_accepts_inside() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/a.md"), "content").unwrap();

        let resolved = resolve_contained(dir.path(), "docs/a.md").unwrap();
        assert!(resolved.ends_with("docs/a.md"));
        assert_eq!(read_contained(dir.path(), "docs/a.md").unwrap(), "content");
    }

    #[test]
    fn test_resolve_contained_rejects_parent_components() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            resolve_contained(dir.path(), "../etc/passwd"),
            Err(DashboardError::PathOutsideProject(_))
        ));
    }

    #[test]
    fn test_resolve_contained_rejects_absolute_escape() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            resolve_contained(dir.path(), "/etc/hostname"),
            Err(DashboardError::PathOutsideProject(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_contained_rejects_symlinks() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("real.md");
        fs::write(&target, "real").unwrap();
        let link = dir.path().join("link.md");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        assert!(matches!(
            resolve_contained(dir.path(), "link.md"),
            Err(DashboardError::SymlinkRejected(_))
        ));
    }

    #[test]
    fn test_load_validations_concatenates() {
        let dir = tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        fs::create_dir_all(paths.validations_dir()).unwrap();
        fs::write(
            paths.validations_dir().join("validation-1-1-alpha.md"),
            "alpha says ok",
        )
        .unwrap();
        fs::write(
            paths.validations_dir().join("validation-1-1-beta.md"),
            "beta says no",
        )
        .unwrap();

        let combined = load_validations(&paths, "1", "1").unwrap();
        assert!(combined.contains("validation-1-1-alpha.md"));
        assert!(combined.contains("alpha says ok"));
        assert!(combined.contains("beta says no"));

        assert!(matches!(
            load_validations(&paths, "9", "9"),
            Err(DashboardError::NotFound(_))
        ));
    }
}
