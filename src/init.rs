//! Project initialization: create the `.bmad-assist/` structure and keep
//! tool artifacts out of version control. Idempotent — re-running never
//! clobbers existing files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::paths::ProjectPaths;

/// Gitignore entries the tool needs.
const GITIGNORE_ENTRIES: [&str; 2] = [".bmad-assist/", "_bmad-output/"];

/// Result of initializing a project.
#[derive(Debug)]
pub struct InitResult {
    pub tool_dir: PathBuf,
    /// Whether the directory was newly created.
    pub created: bool,
    /// Gitignore entries appended by this run.
    pub gitignore_added: Vec<String>,
}

/// Initialize a bmad-assist project in the given directory.
pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let paths = ProjectPaths::new(project_dir);
    let tool_dir = paths.tool_dir();
    let created = !tool_dir.exists();

    for dir in [
        tool_dir.clone(),
        paths.patches_dir(),
        paths.cache_dir(),
        paths.benchmarks_dir(),
        paths.logs_dir(),
    ] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let config_path = project_dir.join("bmad-assist.yaml");
    if !config_path.exists() {
        std::fs::write(&config_path, default_project_config())
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
    }

    let gitignore_added = append_gitignore_entries(project_dir)?;

    Ok(InitResult {
        tool_dir,
        created,
        gitignore_added,
    })
}

fn default_project_config() -> &'static str {
    "\
# bmad-assist project configuration.
# Global defaults live in ~/.bmad-assist/config.yaml; this file overrides them.
providers:
  master:
    provider: claude
  evaluators: []
min_reviews: 2
"
}

/// Append the tool's entries to `.gitignore`, skipping ones already present.
/// Creates the file when missing.
pub fn append_gitignore_entries(project_dir: &Path) -> Result<Vec<String>> {
    let gitignore = project_dir.join(".gitignore");
    let existing = std::fs::read_to_string(&gitignore).unwrap_or_default();
    let existing_lines: Vec<&str> = existing.lines().map(str::trim).collect();

    let missing: Vec<String> = GITIGNORE_ENTRIES
        .iter()
        .filter(|entry| !existing_lines.contains(&entry.trim_end_matches('/')) && !existing_lines.contains(entry))
        .map(ToString::to_string)
        .collect();

    if missing.is_empty() {
        return Ok(Vec::new());
    }

    let mut content = existing;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    for entry in &missing {
        content.push_str(entry);
        content.push('\n');
    }
    std::fs::write(&gitignore, content)
        .with_context(|| format!("Failed to update {}", gitignore.display()))?;
    Ok(missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_init_creates_structure() {
        let dir = tempdir().unwrap();
        let result = init_project(dir.path()).unwrap();

        assert!(result.created);
        assert!(dir.path().join(".bmad-assist").exists());
        assert!(dir.path().join(".bmad-assist/patches").exists());
        assert!(dir.path().join(".bmad-assist/cache").exists());
        assert!(dir.path().join("bmad-assist.yaml").exists());
        assert_eq!(result.gitignore_added.len(), 2);
        let gitignore = fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert!(gitignore.contains(".bmad-assist/"));
        assert!(gitignore.contains("_bmad-output/"));
    }

    #[test]
    fn test_init_is_idempotent() {
        let dir = tempdir().unwrap();
        init_project(dir.path()).unwrap();

        // Customize, then re-init: nothing is clobbered or duplicated.
        fs::write(dir.path().join("bmad-assist.yaml"), "project_name: mine\n").unwrap();
        let second = init_project(dir.path()).unwrap();

        assert!(!second.created);
        assert!(second.gitignore_added.is_empty());
        assert_eq!(
            fs::read_to_string(dir.path().join("bmad-assist.yaml")).unwrap(),
            "project_name: mine\n"
        );
        let gitignore = fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert_eq!(gitignore.matches(".bmad-assist/").count(), 1);
    }

    #[test]
    fn test_gitignore_append_preserves_existing() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(".gitignore"), "target/\n_bmad-output/\n").unwrap();

        let added = append_gitignore_entries(dir.path()).unwrap();
        assert_eq!(added, vec![".bmad-assist/".to_string()]);

        let content = fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert!(content.starts_with("target/\n"));
    }
}
