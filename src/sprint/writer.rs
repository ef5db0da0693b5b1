//! Line-preserving sprint-status document model and atomic writer.
//!
//! Untouched lines — comments, blank lines, preserved entries — keep their
//! original bytes on rewrite. Only entries the reconciler changes are
//! re-rendered, and new entries append at the end of their section. The
//! write itself is atomic (temp + fsync + rename).
//!
//! Concurrency: the reconciler is the single writer by convention; no OS
//! lock is taken on this file. External editors must not write concurrently.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::errors::SprintError;
use crate::util::atomic_write_str;

/// Section of sprint-status.yaml an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    DevelopmentStatus,
    EpicMeta,
}

impl Section {
    fn header(&self) -> &'static str {
        match self {
            Section::DevelopmentStatus => "development_status:",
            Section::EpicMeta => "epic_meta:",
        }
    }
}

/// One `key: value` entry with its position in the document.
#[derive(Debug, Clone)]
pub struct Entry {
    pub section: Section,
    pub key: String,
    pub value: String,
    /// Index into `SprintDoc::lines`.
    line: usize,
}

/// Parsed sprint-status document with full line fidelity.
#[derive(Debug, Clone)]
pub struct SprintDoc {
    lines: Vec<String>,
    entries: Vec<Entry>,
}

fn entry_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Two-space indented "key: value", optional trailing comment.
    RE.get_or_init(|| Regex::new(r"^  ([^\s:#][^:]*):\s*([^#]*?)\s*(#.*)?$").unwrap())
}

impl SprintDoc {
    /// Parse document content. Unrecognized lines are carried verbatim.
    pub fn parse(content: &str) -> Self {
        let lines: Vec<String> = content.lines().map(str::to_string).collect();
        let mut entries = Vec::new();
        let mut section: Option<Section> = None;

        for (i, line) in lines.iter().enumerate() {
            if line.starts_with(Section::DevelopmentStatus.header()) {
                section = Some(Section::DevelopmentStatus);
                continue;
            }
            if line.starts_with(Section::EpicMeta.header()) {
                section = Some(Section::EpicMeta);
                continue;
            }
            if !line.starts_with(' ') && !line.trim().is_empty() {
                // A new top-level key ends the current section.
                section = None;
                continue;
            }
            let Some(current) = section else { continue };
            if let Some(caps) = entry_regex().captures(line) {
                entries.push(Entry {
                    section: current,
                    key: caps[1].trim().to_string(),
                    value: caps[2].trim().to_string(),
                    line: i,
                });
            }
        }

        Self { lines, entries }
    }

    /// Load from a file; a missing file parses as an empty document with
    /// both section headers.
    pub fn load(path: &Path) -> Result<Self, SprintError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Self::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::parse("development_status:\n\nepic_meta:\n"))
            }
            Err(e) => Err(SprintError::ReadFailed {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn entries_in(&self, section: Section) -> impl Iterator<Item = &Entry> {
        self.entries.iter().filter(move |e| e.section == section)
    }

    pub fn get(&self, section: Section, key: &str) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|e| e.section == section && e.key == key)
    }

    /// Update an entry's value in place, preserving indentation and any
    /// trailing comment. Returns false when the key is absent.
    pub fn set(&mut self, section: Section, key: &str, value: &str) -> bool {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.section == section && e.key == key)
        else {
            return false;
        };
        if entry.value == value {
            return true;
        }

        let old_line = &self.lines[entry.line];
        let comment = old_line
            .find('#')
            .map(|i| format!(" {}", old_line[i..].trim_end()))
            .unwrap_or_default();
        self.lines[entry.line] = format!("  {key}: {value}{comment}");
        entry.value = value.to_string();
        true
    }

    /// Append a new entry at the end of its section, creating the section if
    /// the document lacks it.
    pub fn insert(&mut self, section: Section, key: &str, value: &str) {
        if self.set(section, key, value) {
            return;
        }

        let header = section.header();
        let header_idx = match self.lines.iter().position(|l| l.starts_with(header)) {
            Some(i) => i,
            None => {
                if !self.lines.last().is_none_or(|l| l.trim().is_empty()) {
                    self.lines.push(String::new());
                }
                self.lines.push(header.to_string());
                self.lines.len() - 1
            }
        };

        // Insertion point: after the last entry of this section, or right
        // after the header when the section is empty.
        let insert_at = self
            .entries
            .iter()
            .filter(|e| e.section == section)
            .map(|e| e.line + 1)
            .max()
            .unwrap_or(header_idx + 1);

        self.lines.insert(insert_at, format!("  {key}: {value}"));
        for entry in &mut self.entries {
            if entry.line >= insert_at {
                entry.line += 1;
            }
        }
        self.entries.push(Entry {
            section,
            key: key.to_string(),
            value: value.to_string(),
            line: insert_at,
        });
    }

    /// Render the document, line-for-line.
    pub fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        out.push('\n');
        out
    }

    /// Atomic write (temp + fsync + rename).
    pub fn write(&self, path: &Path) -> Result<(), SprintError> {
        atomic_write_str(path, &self.render()).map_err(|e| SprintError::WriteFailed {
            path: path.to_path_buf(),
            source: std::io::Error::other(e.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const DOC: &str = "\
# Sprint ledger - do not edit manually
development_status:
  3-1-login-flow: done  # shipped in v0.3
  3-2-token-refresh: in-progress
  standalone-03-fix-ci: done
  mystery-entry: whatever

epic_meta:
  epic-3: in-progress
";

    #[test]
    fn test_parse_entries_and_sections() {
        let doc = SprintDoc::parse(DOC);
        assert_eq!(doc.entries_in(Section::DevelopmentStatus).count(), 4);
        assert_eq!(doc.entries_in(Section::EpicMeta).count(), 1);
        assert_eq!(
            doc.get(Section::DevelopmentStatus, "3-1-login-flow").unwrap().value,
            "done"
        );
        assert_eq!(doc.get(Section::EpicMeta, "epic-3").unwrap().value, "in-progress");
    }

    #[test]
    fn test_set_preserves_comment_and_untouched_lines() {
        let mut doc = SprintDoc::parse(DOC);
        assert!(doc.set(Section::DevelopmentStatus, "3-1-login-flow", "review"));

        let rendered = doc.render();
        assert!(rendered.contains("  3-1-login-flow: review  # shipped in v0.3"));
        // Everything else byte-identical.
        assert!(rendered.contains("# Sprint ledger - do not edit manually"));
        assert!(rendered.contains("  3-2-token-refresh: in-progress"));
        assert!(rendered.contains("  mystery-entry: whatever"));
    }

    #[test]
    fn test_set_same_value_is_noop() {
        let mut doc = SprintDoc::parse(DOC);
        assert!(doc.set(Section::DevelopmentStatus, "3-1-login-flow", "done"));
        assert_eq!(doc.render(), SprintDoc::parse(DOC).render());
    }

    #[test]
    fn test_insert_appends_to_section_end() {
        let mut doc = SprintDoc::parse(DOC);
        doc.insert(Section::DevelopmentStatus, "3-3-logout", "backlog");

        let rendered = doc.render();
        let dev_block: Vec<&str> = rendered
            .lines()
            .skip_while(|l| !l.starts_with("development_status:"))
            .take_while(|l| !l.starts_with("epic_meta:"))
            .collect();
        assert!(dev_block.iter().any(|l| l.contains("3-3-logout: backlog")));
        // epic_meta entry still intact below.
        assert!(rendered.contains("  epic-3: in-progress"));
        assert_eq!(
            doc.get(Section::DevelopmentStatus, "3-3-logout").unwrap().value,
            "backlog"
        );
    }

    #[test]
    fn test_insert_creates_missing_section() {
        let mut doc = SprintDoc::parse("development_status:\n  1-1-a: done\n");
        doc.insert(Section::EpicMeta, "epic-1", "done");
        let rendered = doc.render();
        assert!(rendered.contains("epic_meta:\n  epic-1: done"));
    }

    #[test]
    fn test_load_missing_file_gives_empty_doc() {
        let dir = tempdir().unwrap();
        let doc = SprintDoc::load(&dir.path().join("sprint-status.yaml")).unwrap();
        assert_eq!(doc.entries().len(), 0);
        assert!(doc.render().contains("development_status:"));
    }

    #[test]
    fn test_write_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sprint-status.yaml");
        let mut doc = SprintDoc::parse(DOC);
        doc.set(Section::DevelopmentStatus, "3-2-token-refresh", "done");
        doc.write(&path).unwrap();

        let reloaded = SprintDoc::load(&path).unwrap();
        assert_eq!(
            reloaded.get(Section::DevelopmentStatus, "3-2-token-refresh").unwrap().value,
            "done"
        );
        // Comments survive the round trip.
        assert!(reloaded.render().contains("# Sprint ledger"));
    }
}
