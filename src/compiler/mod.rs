//! Workflow compiler: turns a named workflow (workflow.yaml + XML
//! instructions) into a single standalone prompt.
//!
//! Compilation pipeline:
//! 1. Look the workflow up in the static registry (normalized name).
//! 2. Load the `WorkflowIR` — a cached patched template when one exists, or
//!    the raw workflow files.
//! 3. Resolve variables (invocation > external config > workflow defaults).
//! 4. Resolve the sprint-status location.
//! 5. Discover and embed context files per the workflow's glob patterns.
//! 6. Filter non-executable instruction elements, substitute variables.
//! 7. Emit the XML prompt and check the token budget.

pub mod context;
pub mod instructions;
pub mod variables;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde_yaml::Value;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::CompilerError;
use crate::paths::ProjectPaths;

/// Intermediate representation of a loaded-but-unrendered workflow.
#[derive(Debug, Clone)]
pub struct WorkflowIR {
    /// Parsed workflow.yaml.
    pub raw_config: Value,
    /// Raw XML instructions (original or cached template).
    pub raw_instructions: String,
    /// Path to the workflow.yaml the IR came from.
    pub config_path: PathBuf,
}

/// The final object handed to a provider.
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    pub workflow_name: String,
    pub mission: String,
    /// Embedded context files as (tag, content) sections.
    pub context: Vec<(String, String)>,
    pub variables: BTreeMap<String, String>,
    pub instructions: String,
    pub output_template: Option<String>,
    pub token_estimate: usize,
    /// The fully rendered prompt.
    pub prompt: String,
}

/// Everything a compilation needs from the environment.
#[derive(Debug, Clone)]
pub struct CompilerContext {
    pub project_root: PathBuf,
    pub cwd: PathBuf,
    pub config: Config,
    /// Invocation-level variable overrides (highest precedence).
    pub params: BTreeMap<String, String>,
    /// Pre-loaded IR; set by the patching layer before `compile` runs.
    pub workflow_ir: Option<WorkflowIR>,
    /// Patch applied to produce the IR, if any.
    pub patch_path: Option<PathBuf>,
    /// Caller-supplied context sections appended after discovered files
    /// (e.g. evaluator reports embedded by the synthesis handlers).
    pub extra_context: Vec<(String, String)>,
}

impl CompilerContext {
    pub fn new(project_root: impl Into<PathBuf>, config: Config) -> Self {
        let project_root = project_root.into();
        Self {
            cwd: project_root.clone(),
            project_root,
            config,
            params: BTreeMap::new(),
            workflow_ir: None,
            patch_path: None,
            extra_context: Vec::new(),
        }
    }

    pub fn paths(&self) -> ProjectPaths {
        ProjectPaths::new(&self.project_root)
    }
}

/// Static description of one compilable workflow.
#[derive(Debug, Clone)]
pub struct WorkflowSpec {
    /// Canonical name, e.g. "create-story".
    pub name: &'static str,
    /// One-line mission statement injected into the prompt.
    pub mission: &'static str,
    /// Workflow directory relative to the project root.
    pub dir: &'static str,
    /// Glob patterns for context files to embed.
    pub context_patterns: &'static [&'static str],
    /// Patterns that must match exactly one file.
    pub unique_patterns: &'static [&'static str],
    /// Workflow-default variables (lowest precedence).
    pub defaults: &'static [(&'static str, &'static str)],
}

impl WorkflowSpec {
    pub fn workflow_dir(&self, project_root: &Path) -> PathBuf {
        project_root.join(self.dir)
    }
}

/// The fixed workflow registry. The original resolved compilers by dynamic
/// import; here every workflow is registered at compile time.
pub static WORKFLOWS: &[WorkflowSpec] = &[
    WorkflowSpec {
        name: "create-story",
        mission: "Draft the next story from the epic backlog with acceptance criteria.",
        dir: ".bmad/workflows/create-story",
        context_patterns: &["docs/epics/epic-*.md", "docs/prd*.md"],
        unique_patterns: &[],
        defaults: &[("story_status", "ready-for-dev")],
    },
    WorkflowSpec {
        name: "validate-story",
        mission: "Adversarially validate the drafted story against the epic and architecture.",
        dir: ".bmad/workflows/validate-story",
        context_patterns: &["docs/epics/epic-*.md", "docs/architecture*.md"],
        unique_patterns: &[],
        defaults: &[],
    },
    WorkflowSpec {
        name: "validate-story-synthesis",
        mission: "Synthesize all validation reports into one actionable report.",
        dir: ".bmad/workflows/validate-story-synthesis",
        context_patterns: &[],
        unique_patterns: &[],
        defaults: &[],
    },
    WorkflowSpec {
        name: "atdd",
        mission: "Write failing acceptance tests for the story before implementation.",
        dir: ".bmad/workflows/atdd",
        context_patterns: &["docs/epics/epic-*.md"],
        unique_patterns: &[],
        defaults: &[],
    },
    WorkflowSpec {
        name: "dev-story",
        mission: "Implement the story to completion, keeping tests green.",
        dir: ".bmad/workflows/dev-story",
        context_patterns: &["docs/architecture*.md"],
        unique_patterns: &[],
        defaults: &[],
    },
    WorkflowSpec {
        name: "code-review",
        mission: "Review the story implementation for defects and deviations.",
        dir: ".bmad/workflows/code-review",
        context_patterns: &["docs/epics/epic-*.md"],
        unique_patterns: &[],
        defaults: &[],
    },
    WorkflowSpec {
        name: "code-review-synthesis",
        mission: "Synthesize all code reviews into one prioritized report.",
        dir: ".bmad/workflows/code-review-synthesis",
        context_patterns: &[],
        unique_patterns: &[],
        defaults: &[],
    },
    WorkflowSpec {
        name: "test-review",
        mission: "Review test quality and coverage for the implemented story.",
        dir: ".bmad/workflows/test-review",
        context_patterns: &[],
        unique_patterns: &[],
        defaults: &[],
    },
    WorkflowSpec {
        name: "retrospective",
        mission: "Run the epic retrospective and capture lessons learned.",
        dir: ".bmad/workflows/retrospective",
        context_patterns: &["docs/epics/epic-*.md"],
        unique_patterns: &[],
        defaults: &[],
    },
];

fn workflow_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_-]*$").unwrap())
}

/// Look up a workflow spec by (normalized) name.
///
/// Names are trimmed and validated; hyphens and underscores are
/// interchangeable for lookup.
pub fn get_workflow_spec(workflow_name: &str) -> Result<&'static WorkflowSpec, CompilerError> {
    let normalized = workflow_name.trim();
    if normalized.is_empty() {
        return Err(CompilerError::EmptyWorkflowName);
    }
    if !workflow_name_pattern().is_match(normalized) {
        return Err(CompilerError::InvalidWorkflowName(workflow_name.to_string()));
    }

    let canonical = normalized.replace('_', "-");
    WORKFLOWS
        .iter()
        .find(|spec| spec.name == canonical)
        .ok_or_else(|| CompilerError::UnknownWorkflow(normalized.to_string()))
}

/// Load the raw workflow files (workflow.yaml + instructions.xml) from disk.
pub fn load_raw_workflow(workflow_dir: &Path) -> Result<WorkflowIR, CompilerError> {
    let config_path = workflow_dir.join("workflow.yaml");
    let instructions_path = workflow_dir.join("instructions.xml");

    let config_text =
        std::fs::read_to_string(&config_path).map_err(|e| CompilerError::WorkflowReadFailed {
            path: config_path.clone(),
            source: e,
        })?;
    let raw_config: Value = serde_yaml::from_str(&config_text)
        .map_err(|e| CompilerError::Parser(format!("{}: {e}", config_path.display())))?;

    let raw_instructions = std::fs::read_to_string(&instructions_path).map_err(|e| {
        CompilerError::WorkflowReadFailed {
            path: instructions_path,
            source: e,
        }
    })?;

    Ok(WorkflowIR {
        raw_config,
        raw_instructions,
        config_path,
    })
}

/// Rough token estimate: one token per four characters.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

/// Compile a workflow by name with the given context.
///
/// The context's `workflow_ir`/`patch_path` must already be populated by the
/// patching layer (see `patching::load_workflow_ir`); when absent, the raw
/// workflow files are loaded directly.
pub fn compile_workflow(
    workflow_name: &str,
    mut ctx: CompilerContext,
) -> Result<CompiledWorkflow, CompilerError> {
    let spec = get_workflow_spec(workflow_name)?;

    let ir = match ctx.workflow_ir.clone() {
        Some(ir) => ir,
        None => {
            let ir = load_raw_workflow(&spec.workflow_dir(&ctx.project_root))?;
            ctx.workflow_ir = Some(ir.clone());
            ir
        }
    };

    // Variables: invocation > external config > workflow defaults, with
    // placeholder substitution and sprint-status resolution.
    let mut vars = variables::resolve_variables(spec, &ir, &ctx)?;
    variables::resolve_sprint_status(&mut vars, &ctx)?;

    // Context embedding, general → specific, then caller-supplied sections.
    let mut context_sections = context::discover_and_embed(spec, &ctx)?;
    context_sections.extend(ctx.extra_context.iter().cloned());

    // Interactive-hazard check runs against the raw instructions: an
    // unpatched workflow with <ask> elements will hang subprocess mode.
    instructions::check_interactive_hazard(
        spec.name,
        &ir.raw_instructions,
        ctx.patch_path.as_deref(),
    );

    // Instruction filtering + substitution.
    let filtered = instructions::filter_instructions(&ir.raw_instructions);
    let instructions_text = instructions::substitute_variables(&filtered, &vars);

    let output_template = ir
        .raw_config
        .get("output_template")
        .and_then(Value::as_str)
        .map(str::to_string);

    let prompt = emit_prompt(
        spec,
        &context_sections,
        &instructions_text,
        output_template.as_deref(),
    );

    let token_estimate = estimate_tokens(&prompt);
    let hard_limit = ctx.config.compiler.hard_token_limit;
    let soft_limit = ctx.config.compiler.soft_limit();
    if token_estimate > hard_limit {
        return Err(CompilerError::TokenBudgetExceeded {
            estimated: token_estimate,
            hard_limit,
        });
    }
    if token_estimate > soft_limit {
        warn!(
            workflow = spec.name,
            token_estimate, soft_limit, "Prompt exceeds soft token limit"
        );
    }

    debug!(
        workflow = spec.name,
        token_estimate,
        context_files = context_sections.len(),
        patched = ctx.patch_path.is_some(),
        "Compiled workflow"
    );

    Ok(CompiledWorkflow {
        workflow_name: spec.name.to_string(),
        mission: spec.mission.to_string(),
        context: context_sections,
        variables: vars,
        instructions: instructions_text,
        output_template,
        token_estimate,
        prompt,
    })
}

/// Render the final XML prompt.
fn emit_prompt(
    spec: &WorkflowSpec,
    context_sections: &[(String, String)],
    instructions_text: &str,
    output_template: Option<&str>,
) -> String {
    let mut parts = Vec::new();

    parts.push("<task-context>".to_string());
    parts.push(spec.mission.to_string());
    parts.push("</task-context>".to_string());
    parts.push(String::new());

    parts.push("<source-document>".to_string());
    for (tag, content) in context_sections {
        parts.push(format!("<{tag}>"));
        parts.push(content.clone());
        parts.push(format!("</{tag}>"));
    }
    parts.push("</source-document>".to_string());
    parts.push(String::new());

    parts.push("<instructions>".to_string());
    parts.push(instructions_text.to_string());
    parts.push("</instructions>".to_string());
    parts.push(String::new());

    parts.push("<output-format>".to_string());
    parts.push(
        output_template
            .unwrap_or("Write the requested artifact in full, with no commentary before or after.")
            .to_string(),
    );
    parts.push("</output-format>".to_string());

    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_get_workflow_spec_normalizes_name() {
        assert_eq!(get_workflow_spec("create-story").unwrap().name, "create-story");
        assert_eq!(get_workflow_spec("create_story").unwrap().name, "create-story");
        assert_eq!(get_workflow_spec(" dev-story ").unwrap().name, "dev-story");
    }

    #[test]
    fn test_get_workflow_spec_rejects_bad_names() {
        assert!(matches!(
            get_workflow_spec(""),
            Err(CompilerError::EmptyWorkflowName)
        ));
        assert!(matches!(
            get_workflow_spec("Create.Story"),
            Err(CompilerError::InvalidWorkflowName(_))
        ));
        assert!(matches!(
            get_workflow_spec("no-such-workflow"),
            Err(CompilerError::UnknownWorkflow(_))
        ));
    }

    fn write_workflow(root: &Path, name: &str, instructions: &str) {
        let dir = root.join(".bmad/workflows").join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("workflow.yaml"),
            "name: test\nvariables:\n  greeting: hello\n",
        )
        .unwrap();
        fs::write(dir.join("instructions.xml"), instructions).unwrap();
    }

    #[test]
    fn test_compile_workflow_end_to_end() {
        let dir = tempdir().unwrap();
        write_workflow(
            dir.path(),
            "create-story",
            "<step n=\"1\">Say {{greeting}} about {project-root}</step>",
        );
        fs::create_dir_all(dir.path().join("docs/epics")).unwrap();
        fs::write(
            dir.path().join("docs/epics/epic-1-demo.md"),
            "---\nepic_num: 1\ntitle: Demo\n---\n# Epic 1",
        )
        .unwrap();

        let ctx = CompilerContext::new(dir.path(), Config::default());
        let compiled = compile_workflow("create-story", ctx).unwrap();

        assert_eq!(compiled.workflow_name, "create-story");
        assert!(compiled.prompt.contains("<task-context>"));
        assert!(compiled.prompt.contains("<instructions>"));
        assert!(compiled.prompt.contains("Say hello"));
        assert!(!compiled.prompt.contains("{{greeting}}"));
        // Epic doc embedded as context
        assert!(compiled.prompt.contains("# Epic 1"));
        assert!(compiled.token_estimate > 0);
    }

    #[test]
    fn test_compile_workflow_missing_files() {
        let dir = tempdir().unwrap();
        let ctx = CompilerContext::new(dir.path(), Config::default());
        let err = compile_workflow("dev-story", ctx).unwrap_err();
        assert!(matches!(err, CompilerError::WorkflowReadFailed { .. }));
    }

    #[test]
    fn test_compile_workflow_token_budget() {
        let dir = tempdir().unwrap();
        write_workflow(dir.path(), "dev-story", &"x".repeat(4000));

        let mut config = Config::default();
        config.compiler.hard_token_limit = 100;
        let ctx = CompilerContext::new(dir.path(), config);
        let err = compile_workflow("dev-story", ctx).unwrap_err();
        assert!(matches!(err, CompilerError::TokenBudgetExceeded { .. }));
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }
}
