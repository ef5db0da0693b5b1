//! Instruction filtering and variable substitution.
//!
//! Raw workflow instructions carry elements meant for interactive execution
//! inside an editor agent. Subprocess compilation strips the non-executable
//! ones per a declarative rule set, then substitutes resolved variables.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use tracing::error;

/// How a filtered element is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterMode {
    /// Remove the element and its content entirely.
    Strip,
    /// Remove the tags but keep the inner content.
    Unwrap,
}

/// Declarative filter rules: element name → handling.
const FILTER_RULES: &[(&str, FilterMode)] = &[
    // Interactive prompts hang a subprocess; stripped wholesale.
    ("ask", FilterMode::Strip),
    ("elicit", FilterMode::Strip),
    // Editor-only flow control.
    ("goto", FilterMode::Strip),
    ("invoke-workflow", FilterMode::Strip),
    // Presentation wrappers whose content still matters.
    ("critical", FilterMode::Unwrap),
    ("example", FilterMode::Unwrap),
];

fn element_regex(tag: &str) -> Regex {
    // Matches both <tag ...>...</tag> and self-closing <tag ... />.
    Regex::new(&format!(
        r"(?s)<{tag}(?:\s[^>]*)?>.*?</{tag}>|<{tag}(?:\s[^>]*)?/>"
    ))
    .expect("static filter regex")
}

fn unwrap_regex(tag: &str) -> Regex {
    Regex::new(&format!(r"(?s)<{tag}(?:\s[^>]*)?>(.*?)</{tag}>")).expect("static unwrap regex")
}

/// Remove non-executable elements per the rule set.
pub fn filter_instructions(raw: &str) -> String {
    let mut out = raw.to_string();
    for (tag, mode) in FILTER_RULES {
        match mode {
            FilterMode::Strip => {
                out = element_regex(tag).replace_all(&out, "").into_owned();
            }
            FilterMode::Unwrap => {
                out = unwrap_regex(tag).replace_all(&out, "$1").into_owned();
            }
        }
    }
    // Collapse the blank runs left behind by removals.
    static BLANKS: OnceLock<Regex> = OnceLock::new();
    let blanks = BLANKS.get_or_init(|| Regex::new(r"\n{3,}").unwrap());
    blanks.replace_all(&out, "\n\n").into_owned()
}

/// Substitute `{{var}}` and `{var}` tokens with resolved values. Unknown
/// tokens are left as-is.
pub fn substitute_variables(text: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = text.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{{{name}}}}}"), value);
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}

/// Log a CRITICAL warning when the final instructions still contain `<ask>`
/// elements and no patch was applied — subprocess mode will hang on them.
pub fn check_interactive_hazard(
    workflow_name: &str,
    instructions: &str,
    patch_path: Option<&std::path::Path>,
) {
    if patch_path.is_some() {
        return;
    }
    static ASK: OnceLock<Regex> = OnceLock::new();
    let ask = ASK.get_or_init(|| Regex::new(r"(?i)<ask[\s>]").unwrap());
    if ask.is_match(instructions) {
        error!(
            "CRITICAL: workflow '{workflow_name}' contains <ask> elements and no patch was applied. \
             Interactive prompts will hang in subprocess mode; add a patch that removes them."
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ask_elements() {
        let raw = "<step n=\"1\">Do work</step>\n<ask>Which option?</ask>\n<step n=\"2\">More</step>";
        let filtered = filter_instructions(raw);
        assert!(!filtered.contains("<ask>"));
        assert!(!filtered.contains("Which option?"));
        assert!(filtered.contains("Do work"));
        assert!(filtered.contains("More"));
    }

    #[test]
    fn test_strip_self_closing_and_attributed() {
        let raw = "<goto step=\"3\"/>\n<ask default=\"y\">Proceed?</ask>\nkeep";
        let filtered = filter_instructions(raw);
        assert!(!filtered.contains("goto"));
        assert!(!filtered.contains("Proceed?"));
        assert!(filtered.contains("keep"));
    }

    #[test]
    fn test_unwrap_keeps_content() {
        let raw = "<critical>Never skip tests</critical>";
        let filtered = filter_instructions(raw);
        assert!(!filtered.contains("<critical>"));
        assert!(filtered.contains("Never skip tests"));
    }

    #[test]
    fn test_filter_collapses_blank_runs() {
        let raw = "a\n<ask>x</ask>\n\n\n\nb";
        let filtered = filter_instructions(raw);
        assert!(!filtered.contains("\n\n\n"));
    }

    #[test]
    fn test_substitute_both_token_forms() {
        let mut vars = BTreeMap::new();
        vars.insert("story_key".to_string(), "3.2".to_string());
        let out = substitute_variables("Story {{story_key}} aka {story_key}", &vars);
        assert_eq!(out, "Story 3.2 aka 3.2");
    }

    #[test]
    fn test_substitute_leaves_unknown_tokens() {
        let vars = BTreeMap::new();
        let out = substitute_variables("keep {unknown} and {{unknown}}", &vars);
        assert!(out.contains("{unknown}"));
        assert!(out.contains("{{unknown}}"));
    }
}
