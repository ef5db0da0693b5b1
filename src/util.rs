//! Shared utility functions.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

/// Write a file atomically: temp file in the same directory, write, fsync,
/// rename. On any failure the temp file is removed and the previous content
/// (if any) is left intact.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("No parent directory for {}", path.display()))?;
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(content)
        .with_context(|| format!("Failed to write temp file for {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("Failed to fsync temp file for {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("Failed to rename temp file into {}", path.display()))?;
    Ok(())
}

/// Atomic write of UTF-8 text.
pub fn atomic_write_str(path: &Path, content: &str) -> Result<()> {
    atomic_write(path, content.as_bytes())
}

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}

/// Extract content between `<!-- {marker}-start -->` and `<!-- {marker}-end -->`
/// style delimiters, or raw `{marker}_START`/`{marker}_END` lines.
pub fn extract_between(text: &str, start_marker: &str, end_marker: &str) -> Option<String> {
    let start = text.find(start_marker)? + start_marker.len();
    let end = text[start..].find(end_marker)? + start;
    Some(text[start..end].trim().to_string())
}

/// Truncate a string with an ellipsis.
pub fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_write_creates_and_replaces() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/out.yaml");

        atomic_write_str(&path, "first").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "first");

        atomic_write_str(&path, "second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");

        // No temp files left behind
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "out.yaml")
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_extract_json_object_simple() {
        let text = r#"Here is the JSON: {"key": "value"} trailing"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"key": "value"}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"{"outer": {"inner": "value"}}"#;
        assert_eq!(extract_json_object(text), Some(text.to_string()));
    }

    #[test]
    fn test_extract_json_object_unclosed() {
        assert_eq!(extract_json_object(r#"{"key": "value""#), None);
        assert_eq!(extract_json_object("no json"), None);
    }

    #[test]
    fn test_extract_between() {
        let text = "before\nREPORT_START\nbody line\nREPORT_END\nafter";
        assert_eq!(
            extract_between(text, "REPORT_START", "REPORT_END"),
            Some("body line".to_string())
        );
        assert_eq!(extract_between(text, "X_START", "X_END"), None);
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("a very long string", 10), "a very ...");
    }
}
