//! Variable resolution for workflow compilation.
//!
//! Precedence, highest first: invocation params > external config
//! (`power_prompts.variables`) > workflow defaults. Placeholders
//! (`{project-root}`, `{installed_path}`) are substituted before the final
//! `{{var}}` / `{var}` pass so variable values may themselves carry
//! placeholders.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde_yaml::Value;
use tracing::debug;

use crate::errors::CompilerError;

use super::{CompilerContext, WorkflowIR, WorkflowSpec};

/// Resolve the variable map for one compilation.
pub fn resolve_variables(
    spec: &WorkflowSpec,
    ir: &WorkflowIR,
    ctx: &CompilerContext,
) -> Result<BTreeMap<String, String>, CompilerError> {
    let mut vars: BTreeMap<String, String> = BTreeMap::new();

    // Workflow defaults (lowest precedence): static spec defaults, then the
    // workflow.yaml `variables` mapping.
    for (k, v) in spec.defaults {
        vars.insert((*k).to_string(), (*v).to_string());
    }
    if let Some(Value::Mapping(map)) = ir.raw_config.get("variables") {
        for (k, v) in map {
            if let (Some(k), Some(v)) = (k.as_str(), scalar_to_string(v)) {
                vars.insert(k.to_string(), v);
            }
        }
    }

    // External config layer.
    for (k, v) in &ctx.config.power_prompts.variables {
        if let Some(v) = scalar_to_string(v) {
            vars.insert(k.clone(), v);
        }
    }

    // Invocation params (highest precedence).
    for (k, v) in &ctx.params {
        vars.insert(k.clone(), v.clone());
    }

    // Placeholder pass over all values.
    let installed_path = ir.config_path.parent().map(Path::to_path_buf);
    for value in vars.values_mut() {
        *value = substitute_placeholders(value, &ctx.project_root, installed_path.as_deref());
    }

    // config_source paths must stay inside the project root.
    if let Some(source) = vars.get("config_source") {
        check_containment("config_source", source, &ctx.project_root)?;
    }

    debug!(workflow = spec.name, count = vars.len(), "Resolved variables");
    Ok(vars)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Substitute `{project-root}` and `{installed_path}` placeholders.
pub fn substitute_placeholders(
    value: &str,
    project_root: &Path,
    installed_path: Option<&Path>,
) -> String {
    let mut out = value.replace("{project-root}", &project_root.to_string_lossy());
    if let Some(ip) = installed_path {
        out = out.replace("{installed_path}", &ip.to_string_lossy());
    }
    out
}

/// Reject a configured path that escapes the project root.
///
/// `..` components are rejected outright; the resolved path must be inside
/// the (resolved) project root. Paths on a different filesystem prefix are
/// containment violations like any other escape.
pub fn check_containment(
    variable: &str,
    raw_path: &str,
    project_root: &Path,
) -> Result<PathBuf, CompilerError> {
    // Expansion first: `~` and placeholder forms resolve before the check,
    // so a home-relative path is judged by where it actually points.
    let candidate = crate::paths::expand_path(raw_path, project_root, None);
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(CompilerError::Variable {
            variable: variable.to_string(),
            message: format!("path '{raw_path}' contains '..' components"),
        });
    }

    let absolute = if candidate.is_absolute() {
        candidate
    } else {
        project_root.join(candidate)
    };

    // Canonicalize where possible so symlinked roots compare equal; fall
    // back to the lexical path for not-yet-existing files.
    let resolved = absolute.canonicalize().unwrap_or(absolute);
    let root = project_root
        .canonicalize()
        .unwrap_or_else(|_| project_root.to_path_buf());

    if !resolved.starts_with(&root) {
        return Err(CompilerError::Variable {
            variable: variable.to_string(),
            message: format!(
                "path '{}' escapes the project root '{}'",
                resolved.display(),
                root.display()
            ),
        });
    }

    Ok(resolved)
}

/// Resolve the `sprint_status` variable to the ledger path.
///
/// Exactly one of the two canonical locations may exist; both is an
/// ambiguity error; neither resolves to the literal value `"none"`.
pub fn resolve_sprint_status(
    vars: &mut BTreeMap<String, String>,
    ctx: &CompilerContext,
) -> Result<(), CompilerError> {
    let paths = ctx.paths();
    let locations = [paths.sprint_status(), paths.sprint_status_legacy()];
    let existing: Vec<&PathBuf> = locations.iter().filter(|p| p.exists()).collect();

    match existing.len() {
        0 => {
            vars.insert("sprint_status".to_string(), "none".to_string());
            debug!("No sprint-status.yaml found, set sprint_status to 'none'");
        }
        1 => {
            vars.insert(
                "sprint_status".to_string(),
                existing[0].to_string_lossy().into_owned(),
            );
        }
        _ => {
            return Err(CompilerError::Variable {
                variable: "sprint_status".to_string(),
                message: format!(
                    "Ambiguous sprint-status.yaml location; found in multiple locations: {:?}\n  How to fix: keep sprint-status.yaml in only one location",
                    existing
                ),
            });
        }
    }
    Ok(())
}

/// Extract the story title from a sprint-status key `{epic}-{story}-{title}`.
pub fn extract_story_title(sprint_status_path: &Path, epic: &str, story: u32) -> Option<String> {
    let content = std::fs::read_to_string(sprint_status_path).ok()?;
    let data: Value = serde_yaml::from_str(&content).ok()?;
    let dev_status = data.get("development_status")?.as_mapping()?;

    let prefix = format!("{epic}-{story}-");
    for key in dev_status.keys() {
        if let Some(key) = key.as_str() {
            if let Some(title) = key.strip_prefix(&prefix) {
                if !title.is_empty() {
                    return Some(title.to_string());
                }
            }
        }
    }
    None
}
