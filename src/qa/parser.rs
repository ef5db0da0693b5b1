//! E2E test-plan parser.
//!
//! A plan is a Markdown document with two sources of truth: the master
//! checklist table (full test inventory) and per-test `###`/`####` sections
//! carrying the scripts. Headers are collected first and iterated pairwise
//! so Markdown-looking content inside heredocs is never mistaken for a
//! section boundary.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::errors::QaError;

/// Test category: A = CLI/bash, B = Playwright UI, C = documentation-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Category {
    A,
    B,
    C,
}

impl Category {
    fn from_letter(letter: &str) -> Option<Self> {
        match letter {
            "A" => Some(Category::A),
            "B" => Some(Category::B),
            "C" => Some(Category::C),
            _ => None,
        }
    }

    pub fn letter(&self) -> &'static str {
        match self {
            Category::A => "A",
            Category::B => "B",
            Category::C => "C",
        }
    }
}

/// One parsed test case.
#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    /// Test ID like `E17-A01`.
    pub id: String,
    pub name: String,
    pub category: Category,
    /// Bash (Category A) or TypeScript (Category B) script; empty when the
    /// test appears only in the checklist.
    pub script: String,
    pub pre_conditions: Vec<String>,
    pub expected_exit_code: i32,
    pub expected_output: Vec<String>,
}

/// A fully parsed plan.
#[derive(Debug, Clone)]
pub struct ParsedTestPlan {
    pub epic_id: String,
    pub tests: Vec<TestCase>,
    pub setup_script: String,
}

impl ParsedTestPlan {
    /// Tests filtered by category; "all" means A and B (C never executes).
    pub fn tests_by_category(&self, category: &str) -> Vec<&TestCase> {
        if category.eq_ignore_ascii_case("all") {
            self.tests
                .iter()
                .filter(|t| matches!(t.category, Category::A | Category::B))
                .collect()
        } else {
            self.tests
                .iter()
                .filter(|t| t.category.letter().eq_ignore_ascii_case(category))
                .collect()
        }
    }

    pub fn category_count(&self, category: Category) -> usize {
        self.tests.iter().filter(|t| t.category == category).count()
    }
}

fn test_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"E(\d+)-([ABC])(\d+)").unwrap())
}

fn header_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^#{3,4}\s+(E\d+-[ABC]\d+):\s*(.+)$").unwrap())
}

fn checklist_row_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\|\s*(?:\[[ x]\]\s*)?(E\d+-[ABC]\d+)\s*\|\s*([^|]+)\s*\|").unwrap()
    })
}

fn bash_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```bash\n(.*?)```").unwrap())
}

fn typescript_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:typescript|ts)\n(.*?)```").unwrap())
}

fn setup_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?si)##\s*Setup.*?\n```bash\n(.*?)```").unwrap())
}

fn list_items(text: &str) -> Vec<String> {
    text.lines()
        .map(|l| l.trim().trim_start_matches('-').trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

fn extract_field<'a>(section: &'a str, label_pattern: &Regex) -> Option<&'a str> {
    let caps = label_pattern.captures(section)?;
    caps.get(1).map(|m| m.as_str())
}

fn pre_conditions_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?si)\*\*Pre-conditions?:\*\*\s*(.+?)(?:\n\n|\n\*\*|\n```|$)").unwrap()
    })
}

fn expected_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?si)\*\*Expected[^:*]*:\*\*\s*(.+?)(?:\n\n|\n\*\*|\n```|$)").unwrap()
    })
}

/// Parse a plan's Markdown content.
pub fn parse_test_plan(content: &str, epic_id: &str) -> ParsedTestPlan {
    let setup_script = setup_regex()
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();
    if !setup_script.is_empty() {
        debug!("Found setup script: {} chars", setup_script.len());
    }

    // First pass: the checklist inventory.
    let mut inventory: Vec<(String, String)> = Vec::new();
    for caps in checklist_row_regex().captures_iter(content) {
        inventory.push((caps[1].to_string(), caps[2].trim().to_string()));
    }
    debug!("Found {} tests in checklist", inventory.len());

    // Second pass: detailed sections, iterated pairwise by header offsets so
    // heredoc content inside a section cannot open a new one.
    let headers: Vec<(usize, usize, String, String)> = header_regex()
        .captures_iter(content)
        .map(|caps| {
            let whole = caps.get(0).unwrap();
            (
                whole.start(),
                whole.end(),
                caps[1].to_string(),
                caps[2].trim().to_string(),
            )
        })
        .collect();

    let mut tests: Vec<TestCase> = Vec::new();
    for (i, (_, section_start, id, name)) in headers.iter().enumerate() {
        let Some(id_caps) = test_id_regex().captures(id) else {
            warn!("Invalid test ID format: {id}");
            continue;
        };
        let Some(category) = Category::from_letter(&id_caps[2]) else {
            continue;
        };

        let section_end = headers
            .get(i + 1)
            .map(|(start, ..)| *start)
            .unwrap_or(content.len());
        let section = &content[*section_start..section_end];

        let script = match category {
            Category::A => bash_block_regex()
                .captures(section)
                .map(|c| c[1].trim().to_string()),
            Category::B => typescript_block_regex()
                .captures(section)
                .map(|c| c[1].trim().to_string()),
            Category::C => None,
        }
        .unwrap_or_default();

        let pre_conditions = extract_field(section, pre_conditions_regex())
            .map(list_items)
            .unwrap_or_default();
        let expected_output = extract_field(section, expected_regex())
            .map(list_items)
            .unwrap_or_default();

        tests.push(TestCase {
            id: id.clone(),
            name: name.clone(),
            category,
            script,
            pre_conditions,
            expected_exit_code: 0,
            expected_output,
        });
    }

    // Checklist-only tests have no script but still count.
    let known: Vec<String> = tests.iter().map(|t| t.id.clone()).collect();
    for (id, name) in inventory {
        if known.contains(&id) {
            continue;
        }
        let Some(id_caps) = test_id_regex().captures(&id) else {
            continue;
        };
        let Some(category) = Category::from_letter(&id_caps[2]) else {
            continue;
        };
        tests.push(TestCase {
            id,
            name,
            category,
            script: String::new(),
            pre_conditions: Vec::new(),
            expected_exit_code: 0,
            expected_output: Vec::new(),
        });
    }

    tests.sort_by(|a, b| (a.category.letter(), &a.id).cmp(&(b.category.letter(), &b.id)));

    info!(
        "Parsed {} tests: A={}, B={}, C={}",
        tests.len(),
        tests.iter().filter(|t| t.category == Category::A).count(),
        tests.iter().filter(|t| t.category == Category::B).count(),
        tests.iter().filter(|t| t.category == Category::C).count(),
    );

    ParsedTestPlan {
        epic_id: epic_id.to_string(),
        tests,
        setup_script,
    }
}

/// Parse a plan file from disk.
pub fn parse_test_plan_file(path: &Path, epic_id: &str) -> Result<ParsedTestPlan, QaError> {
    let content = std::fs::read_to_string(path).map_err(|_| QaError::PlanNotFound {
        path: path.to_path_buf(),
        epic: epic_id.to_string(),
    })?;
    if content.trim().is_empty() {
        return Err(QaError::PlanEmpty {
            path: path.to_path_buf(),
        });
    }
    Ok(parse_test_plan(&content, epic_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"# Epic 17 E2E Test Plan

## Setup

```bash
export APP_ENV=test
```

## Master Checklist

| ID | Name | Category |
|----|------|----------|
| [ ] E17-A01 | CLI boots | A |
| [x] E17-A02 | Config validates | A |
| [ ] E17-B01 | Dashboard renders | B |
| [ ] E17-C01 | Docs mention limits | C |

## Detailed Tests

### E17-A01: CLI boots

**Pre-conditions:**
- binary built

**Expected output:**
- Usage

```bash
my-tool --help
cat <<'EOF'
### E99-A99: not a real section
EOF
```

#### E17-B01: Dashboard renders

```typescript
await page.goto('/');
```
"#;

    #[test]
    fn test_parse_checklist_and_sections() {
        let plan = parse_test_plan(PLAN, "17");
        assert_eq!(plan.tests.len(), 4);
        assert_eq!(plan.setup_script, "export APP_ENV=test");

        let a01 = plan.tests.iter().find(|t| t.id == "E17-A01").unwrap();
        assert_eq!(a01.category, Category::A);
        assert!(a01.script.contains("my-tool --help"));
        assert_eq!(a01.pre_conditions, vec!["binary built"]);
        assert_eq!(a01.expected_output, vec!["Usage"]);
    }

    #[test]
    fn test_heredoc_does_not_split_sections() {
        let plan = parse_test_plan(PLAN, "17");
        // The fake header inside the heredoc belongs to E17-A01's script.
        assert!(plan.tests.iter().all(|t| t.id != "E99-A99"));
        let a01 = plan.tests.iter().find(|t| t.id == "E17-A01").unwrap();
        assert!(a01.script.contains("E99-A99"));
    }

    #[test]
    fn test_checklist_only_tests_have_no_script() {
        let plan = parse_test_plan(PLAN, "17");
        let a02 = plan.tests.iter().find(|t| t.id == "E17-A02").unwrap();
        assert!(a02.script.is_empty());
        assert_eq!(a02.name, "Config validates");
    }

    #[test]
    fn test_category_b_typescript_script() {
        let plan = parse_test_plan(PLAN, "17");
        let b01 = plan.tests.iter().find(|t| t.id == "E17-B01").unwrap();
        assert_eq!(b01.category, Category::B);
        assert!(b01.script.contains("page.goto"));
    }

    #[test]
    fn test_tests_by_category_filter() {
        let plan = parse_test_plan(PLAN, "17");
        assert_eq!(plan.tests_by_category("A").len(), 2);
        assert_eq!(plan.tests_by_category("B").len(), 1);
        // "all" executes A and B, never C.
        assert_eq!(plan.tests_by_category("all").len(), 3);
    }

    #[test]
    fn test_boundary_test_ids_parse() {
        let content = "\
| E1-A1 | tiny | A |
| E10-A100 | big | A |

### E1-A1: tiny

```bash
true
```

### E10-A100: big

```bash
true
```
";
        let plan = parse_test_plan(content, "1");
        assert!(plan.tests.iter().any(|t| t.id == "E1-A1"));
        assert!(plan.tests.iter().any(|t| t.id == "E10-A100"));
    }
}
