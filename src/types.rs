//! Core identifier types shared across the kernel.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Epic identifier: numeric ("1", "2") or a stable string tag ("testarch").
///
/// Ordering: numeric epics ascend first, then tags alphabetically.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EpicId {
    Number(u32),
    Tag(String),
}

impl EpicId {
    /// Parse from a string, yielding `Number` when the value is numeric.
    pub fn parse(value: &str) -> EpicId {
        match value.trim().parse::<u32>() {
            Ok(n) => EpicId::Number(n),
            Err(_) => EpicId::Tag(value.trim().to_string()),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, EpicId::Number(_))
    }
}

impl fmt::Display for EpicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpicId::Number(n) => write!(f, "{n}"),
            EpicId::Tag(s) => write!(f, "{s}"),
        }
    }
}

impl Ord for EpicId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (EpicId::Number(a), EpicId::Number(b)) => a.cmp(b),
            (EpicId::Number(_), EpicId::Tag(_)) => Ordering::Less,
            (EpicId::Tag(_), EpicId::Number(_)) => Ordering::Greater,
            (EpicId::Tag(a), EpicId::Tag(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for EpicId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<u32> for EpicId {
    fn from(n: u32) -> Self {
        EpicId::Number(n)
    }
}

impl From<&str> for EpicId {
    fn from(s: &str) -> Self {
        EpicId::parse(s)
    }
}

// On disk an epic ID is a bare scalar ("3" or "testarch"); numeric strings
// round-trip back to Number.
impl Serialize for EpicId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            EpicId::Number(n) => serializer.serialize_u32(*n),
            EpicId::Tag(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for EpicId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;
        impl serde::de::Visitor<'_> for Visitor {
            type Value = EpicId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an integer or string epic id")
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<EpicId, E> {
                Ok(EpicId::Number(v as u32))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<EpicId, E> {
                Ok(EpicId::Number(v.max(0) as u32))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<EpicId, E> {
                Ok(EpicId::parse(v))
            }
        }
        deserializer.deserialize_any(Visitor)
    }
}

/// Normalized story status values recognized in story files and sprint-status.
pub const VALID_STATUSES: [&str; 5] =
    ["backlog", "ready-for-dev", "in-progress", "review", "done"];

/// Normalize a raw status string: trim, lowercase, spaces/underscores to
/// hyphens. Returns None when the result is not a recognized status.
pub fn normalize_status(raw: &str) -> Option<String> {
    let norm = raw.trim().to_lowercase().replace([' ', '_'], "-");
    if VALID_STATUSES.contains(&norm.as_str()) {
        Some(norm)
    } else {
        None
    }
}

/// Story key "E.S" split into its epic and story components.
pub fn split_story_key(key: &str) -> Option<(EpicId, u32)> {
    let (epic, story) = key.split_once(['.', '-'])?;
    let story = story.parse::<u32>().ok()?;
    Some((EpicId::parse(epic), story))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epic_id_parse() {
        assert_eq!(EpicId::parse("3"), EpicId::Number(3));
        assert_eq!(EpicId::parse("testarch"), EpicId::Tag("testarch".into()));
        assert_eq!(EpicId::parse("0a"), EpicId::Tag("0a".into()));
    }

    #[test]
    fn test_epic_id_ordering_numeric_first() {
        let mut ids = vec![
            EpicId::Tag("testarch".into()),
            EpicId::Number(3),
            EpicId::Tag("alpha".into()),
            EpicId::Number(1),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                EpicId::Number(1),
                EpicId::Number(3),
                EpicId::Tag("alpha".into()),
                EpicId::Tag("testarch".into()),
            ]
        );
    }

    #[test]
    fn test_epic_id_yaml_round_trip() {
        let n: EpicId = serde_yaml::from_str("3").unwrap();
        assert_eq!(n, EpicId::Number(3));
        let t: EpicId = serde_yaml::from_str("testarch").unwrap();
        assert_eq!(t, EpicId::Tag("testarch".into()));
        assert_eq!(serde_yaml::to_string(&n).unwrap().trim(), "3");
        assert_eq!(serde_yaml::to_string(&t).unwrap().trim(), "testarch");
    }

    #[test]
    fn test_normalize_status() {
        assert_eq!(normalize_status("Ready For Dev"), Some("ready-for-dev".into()));
        assert_eq!(normalize_status(" in_progress "), Some("in-progress".into()));
        assert_eq!(normalize_status("Done"), Some("done".into()));
        assert_eq!(normalize_status("shipped"), None);
    }

    #[test]
    fn test_split_story_key() {
        assert_eq!(split_story_key("3.2"), Some((EpicId::Number(3), 2)));
        assert_eq!(split_story_key("3-2"), Some((EpicId::Number(3), 2)));
        assert_eq!(
            split_story_key("testarch.1"),
            Some((EpicId::Tag("testarch".into()), 1))
        );
        assert_eq!(split_story_key("nope"), None);
    }
}
