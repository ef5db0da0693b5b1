//! Epic document parsing.
//!
//! Epic docs live at `docs/epics/epic-{id}-*.md` with YAML frontmatter
//! (`epic_num`, `title`, `status`) and `## Story E.S: Title` headings. The
//! reconciler's "generated" leg and first-run state initialization both read
//! the backlog from here.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::types::EpicId;

/// Frontmatter of an epic document.
#[derive(Debug, Clone, Deserialize)]
pub struct EpicFrontmatter {
    pub epic_num: EpicId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// One story declared by an epic doc.
#[derive(Debug, Clone, PartialEq)]
pub struct EpicStory {
    pub epic: EpicId,
    pub story: u32,
    pub title: String,
}

impl EpicStory {
    /// Kebab-case slug derived from the title.
    pub fn slug(&self) -> String {
        let mut slug = String::new();
        for c in self.title.to_lowercase().chars() {
            if c.is_ascii_alphanumeric() {
                slug.push(c);
            } else if !slug.ends_with('-') && !slug.is_empty() {
                slug.push('-');
            }
        }
        slug.trim_matches('-').to_string()
    }

    /// Sprint-status entry key: `{epic}-{story}-{slug}`.
    pub fn entry_key(&self) -> String {
        format!("{}-{}-{}", self.epic, self.story, self.slug())
    }

    /// State story key: `{epic}.{story}`.
    pub fn story_key(&self) -> String {
        format!("{}.{}", self.epic, self.story)
    }
}

/// A parsed epic document.
#[derive(Debug, Clone)]
pub struct EpicDoc {
    pub path: PathBuf,
    pub frontmatter: EpicFrontmatter,
    pub stories: Vec<EpicStory>,
}

fn story_heading_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^#{2,3}\s*Story\s+([0-9a-zA-Z]+)\.(\d+)\s*:?\s*(.*)$").unwrap()
    })
}

/// Parse one epic document.
pub fn parse_epic_doc(path: &Path) -> Result<EpicDoc> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read epic doc: {}", path.display()))?;

    let frontmatter = parse_frontmatter(&content)
        .with_context(|| format!("Failed to parse frontmatter in {}", path.display()))?;

    let mut stories = Vec::new();
    for caps in story_heading_regex().captures_iter(&content) {
        let epic = EpicId::parse(&caps[1]);
        if epic != frontmatter.epic_num {
            warn!(
                "Story heading {}.{} does not match epic {} in {}",
                &caps[1],
                &caps[2],
                frontmatter.epic_num,
                path.display()
            );
            continue;
        }
        stories.push(EpicStory {
            epic,
            story: caps[2].parse().unwrap_or(0),
            title: caps[3].trim().to_string(),
        });
    }
    stories.sort_by_key(|s| s.story);

    Ok(EpicDoc {
        path: path.to_path_buf(),
        frontmatter,
        stories,
    })
}

fn parse_frontmatter(content: &str) -> Result<EpicFrontmatter> {
    let rest = content
        .strip_prefix("---\n")
        .context("missing frontmatter delimiter")?;
    let end = rest.find("\n---").context("unterminated frontmatter")?;
    let fm: EpicFrontmatter = serde_yaml::from_str(&rest[..end])?;
    Ok(fm)
}

/// Load all epic docs under `docs/epics/`, ordered by epic ID (numeric
/// first, then tags alphabetically). Unparseable docs are skipped with a
/// warning.
pub fn load_epic_docs(epics_dir: &Path) -> Result<Vec<EpicDoc>> {
    let pattern = epics_dir.join("epic-*.md");
    let mut docs = Vec::new();

    for entry in glob::glob(&pattern.to_string_lossy())
        .context("invalid epic glob pattern")?
        .filter_map(std::result::Result::ok)
    {
        match parse_epic_doc(&entry) {
            Ok(doc) => docs.push(doc),
            Err(e) => warn!("Skipping unparseable epic doc {}: {e}", entry.display()),
        }
    }

    docs.sort_by(|a, b| a.frontmatter.epic_num.cmp(&b.frontmatter.epic_num));
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const EPIC_DOC: &str = "\
---
epic_num: 3
title: Session Handling
status: in-progress
---
# Epic 3: Session Handling

## Story 3.1: Login Flow
Body text.

### Story 3.2: Token Refresh!
More body.
";

    #[test]
    fn test_parse_epic_doc() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("epic-3-session.md");
        fs::write(&path, EPIC_DOC).unwrap();

        let doc = parse_epic_doc(&path).unwrap();
        assert_eq!(doc.frontmatter.epic_num, EpicId::Number(3));
        assert_eq!(doc.frontmatter.title, "Session Handling");
        assert_eq!(doc.stories.len(), 2);
        assert_eq!(doc.stories[0].title, "Login Flow");
        assert_eq!(doc.stories[1].story, 2);
    }

    #[test]
    fn test_story_slug_and_keys() {
        let story = EpicStory {
            epic: EpicId::Number(3),
            story: 2,
            title: "Token Refresh!".into(),
        };
        assert_eq!(story.slug(), "token-refresh");
        assert_eq!(story.entry_key(), "3-2-token-refresh");
        assert_eq!(story.story_key(), "3.2");
    }

    #[test]
    fn test_parse_epic_doc_missing_frontmatter() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("epic-1-x.md");
        fs::write(&path, "# No frontmatter here").unwrap();
        assert!(parse_epic_doc(&path).is_err());
    }

    #[test]
    fn test_load_epic_docs_ordering() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("epic-testarch-tools.md"),
            "---\nepic_num: testarch\ntitle: Tools\n---\n## Story testarch.1: Setup\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("epic-2-second.md"),
            "---\nepic_num: 2\ntitle: Second\n---\n## Story 2.1: A\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("epic-1-first.md"),
            "---\nepic_num: 1\ntitle: First\n---\n## Story 1.1: B\n",
        )
        .unwrap();
        // Unparseable doc is skipped, not fatal.
        fs::write(dir.path().join("epic-bad.md"), "no frontmatter").unwrap();

        let docs = load_epic_docs(dir.path()).unwrap();
        let ids: Vec<String> = docs
            .iter()
            .map(|d| d.frontmatter.epic_num.to_string())
            .collect();
        assert_eq!(ids, vec!["1", "2", "testarch"]);
    }

    #[test]
    fn test_mismatched_story_heading_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("epic-1-x.md");
        fs::write(
            &path,
            "---\nepic_num: 1\ntitle: X\n---\n## Story 1.1: Mine\n## Story 2.1: Not mine\n",
        )
        .unwrap();
        let doc = parse_epic_doc(&path).unwrap();
        assert_eq!(doc.stories.len(), 1);
    }
}
