//! Sprint-status: the authoritative project ledger.
//!
//! `sprint-status.yaml` maps entry keys (`3-2-some-slug`) to status strings,
//! plus an `epic_meta` section. The document model here is line-preserving:
//! entries the reconciler does not touch keep their original bytes,
//! comments included. The reconciler (`reconciler.rs`) is the sole writer.

pub mod inference;
pub mod reconciler;
pub mod writer;

use std::sync::OnceLock;

use regex::Regex;

/// Classification of a sprint-status entry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    /// `{numeric-epic}-{story}-{slug}` — owned and merged by the reconciler.
    EpicStory,
    /// Entry under the `epic_meta` section — recalculated from stories.
    EpicMeta,
    /// `standalone-*` — preserved byte-for-byte.
    Standalone,
    /// `{module}-{story}-{slug}` with a non-numeric module tag — preserved.
    ModuleStory,
    /// `epic-*-retrospective` — preserved.
    Retrospective,
    /// Anything else — preserved, never inferred.
    Unknown,
}

fn epic_story_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)-(\d+)-(.+)$").unwrap())
}

fn module_story_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([a-z][a-z0-9]*)-(\d+)-(.+)$").unwrap())
}

fn retrospective_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^epic-[0-9a-z-]+-retro(spective)?$").unwrap())
}

/// Classify an entry key from the `development_status` section.
pub fn classify_key(key: &str) -> EntryType {
    if retrospective_regex().is_match(key) {
        return EntryType::Retrospective;
    }
    if key.starts_with("standalone-") {
        return EntryType::Standalone;
    }
    if epic_story_regex().is_match(key) {
        return EntryType::EpicStory;
    }
    if module_story_regex().is_match(key) {
        return EntryType::ModuleStory;
    }
    EntryType::Unknown
}

/// Split an EPIC_STORY key into (epic, story, slug).
pub fn parse_epic_story_key(key: &str) -> Option<(u32, u32, String)> {
    let caps = epic_story_regex().captures(key)?;
    Some((
        caps[1].parse().ok()?,
        caps[2].parse().ok()?,
        caps[3].to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_epic_story() {
        assert_eq!(classify_key("3-2-token-refresh"), EntryType::EpicStory);
        assert_eq!(classify_key("17-10-a"), EntryType::EpicStory);
    }

    #[test]
    fn test_classify_module_story() {
        assert_eq!(classify_key("testarch-1-setup"), EntryType::ModuleStory);
        assert_eq!(classify_key("auth-2-tokens"), EntryType::ModuleStory);
    }

    #[test]
    fn test_classify_retrospective_and_standalone() {
        assert_eq!(classify_key("epic-3-retrospective"), EntryType::Retrospective);
        assert_eq!(classify_key("epic-3-retro"), EntryType::Retrospective);
        assert_eq!(classify_key("standalone-03-fix-ci"), EntryType::Standalone);
    }

    #[test]
    fn test_classify_unknown() {
        assert_eq!(classify_key("whatever"), EntryType::Unknown);
        assert_eq!(classify_key("3-x-bad"), EntryType::Unknown);
    }

    #[test]
    fn test_parse_epic_story_key() {
        assert_eq!(
            parse_epic_story_key("3-2-token-refresh"),
            Some((3, 2, "token-refresh".to_string()))
        );
        assert_eq!(parse_epic_story_key("not-a-story"), None);
    }
}
