//! Validation of compiled template output against patch rules.
//!
//! `must_contain` / `must_not_contain` entries are substrings unless written
//! slash-delimited (`/pattern/`), in which case they are regexes compiled
//! with MULTILINE semantics.

use regex::RegexBuilder;

use super::{TransformResult, Validation};

/// Minimum share of transforms that must succeed (percent, floor division).
pub const SUCCESS_THRESHOLD_PERCENT: usize = 75;

/// A `/pattern/` entry is a regex; anything else is a substring.
pub fn is_regex(pattern: &str) -> bool {
    pattern.len() >= 2 && pattern.starts_with('/') && pattern.ends_with('/')
}

/// Compile a `/pattern/` entry with MULTILINE semantics.
pub fn parse_regex(pattern: &str) -> Result<regex::Regex, regex::Error> {
    let inner = pattern[1..pattern.len() - 1].replace(r"\/", "/");
    RegexBuilder::new(&inner).multi_line(true).build()
}

/// Check `must_contain` (all must match) and `must_not_contain` (none may).
/// Returns error messages; empty means the output validated.
pub fn validate_output(content: &str, validation: Option<&Validation>) -> Vec<String> {
    let Some(validation) = validation else {
        return Vec::new();
    };

    let mut errors = Vec::new();

    for rule in &validation.must_contain {
        if is_regex(rule) {
            match parse_regex(rule) {
                Ok(pattern) => {
                    if !pattern.is_match(content) {
                        errors.push(format!("must_contain regex {rule} not found in output"));
                    }
                }
                Err(e) => errors.push(format!("Invalid regex in must_contain {rule}: {e}")),
            }
        } else if !content.contains(rule.as_str()) {
            errors.push(format!("must_contain substring '{rule}' not found in output"));
        }
    }

    for rule in &validation.must_not_contain {
        if is_regex(rule) {
            match parse_regex(rule) {
                Ok(pattern) => {
                    if pattern.is_match(content) {
                        errors.push(format!("must_not_contain regex {rule} found in output"));
                    }
                }
                Err(e) => errors.push(format!("Invalid regex in must_not_contain {rule}: {e}")),
            }
        } else if content.contains(rule.as_str()) {
            errors.push(format!("must_not_contain substring '{rule}' found in output"));
        }
    }

    errors
}

/// True when the transform success rate meets the threshold (floor division;
/// an empty transform list passes).
pub fn check_threshold(results: &[TransformResult]) -> bool {
    if results.is_empty() {
        return true;
    }
    let successful = results.iter().filter(|r| r.success).count();
    (successful * 100) / results.len() >= SUCCESS_THRESHOLD_PERCENT
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(success: bool) -> TransformResult {
        TransformResult {
            instruction: "t".into(),
            success,
            error: None,
        }
    }

    #[test]
    fn test_is_regex_detection() {
        assert!(is_regex("/^Step/"));
        assert!(!is_regex("plain text"));
        assert!(!is_regex("/"));
    }

    #[test]
    fn test_parse_regex_multiline() {
        let re = parse_regex("/^name:/").unwrap();
        assert!(re.is_match("first\nname: x"));
    }

    #[test]
    fn test_parse_regex_unescapes_slashes() {
        let re = parse_regex(r"/a\/b/").unwrap();
        assert!(re.is_match("a/b"));
    }

    #[test]
    fn test_validate_output_substring_rules() {
        let validation = Validation {
            must_contain: vec!["<instructions>".into()],
            must_not_contain: vec!["<ask>".into()],
        };
        assert!(validate_output("<instructions>ok</instructions>", Some(&validation)).is_empty());

        let errors = validate_output("<ask>hm</ask>", Some(&validation));
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_validate_output_regex_rules() {
        let validation = Validation {
            must_contain: vec!["/^## Summary/".into()],
            must_not_contain: vec![],
        };
        assert!(validate_output("intro\n## Summary\nbody", Some(&validation)).is_empty());
        assert_eq!(validate_output("no summary", Some(&validation)).len(), 1);
    }

    #[test]
    fn test_validate_output_none_passes() {
        assert!(validate_output("anything", None).is_empty());
    }

    #[test]
    fn test_check_threshold_floor_division() {
        // 3/4 = 75% exactly — passes.
        let results = vec![result(true), result(true), result(true), result(false)];
        assert!(check_threshold(&results));

        // 2/3 = 66% floor — fails.
        let results = vec![result(true), result(true), result(false)];
        assert!(!check_threshold(&results));

        assert!(check_threshold(&[]));
    }
}
