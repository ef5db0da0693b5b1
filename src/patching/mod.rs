//! Workflow patching: an optional LLM-driven transform of a workflow into a
//! cached standalone template.
//!
//! A patch is a YAML file of natural-language transform instructions plus
//! validation rules. Compilation sends the raw workflow and the numbered
//! instructions to the patcher provider, extracts the transformed document,
//! post-processes it, validates it, and caches it keyed by the hash of the
//! source files + patch. Patch failures degrade to the unpatched workflow
//! with a warning; they are never fatal.

pub mod cache;
pub mod git_intel;
pub mod session;
pub mod validation;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::compiler::{WorkflowIR, load_raw_workflow};
use crate::config::ProviderSettings;
use crate::errors::PatchError;
use crate::paths::{GlobalPaths, ProjectPaths};
use crate::timing::utc_now_naive;

use cache::{CacheMeta, TemplateCache, compute_source_hash};

/// Patch identity metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchConfig {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Version compatibility requirements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Compatibility {
    #[serde(default)]
    pub bmad_version: Option<String>,
    #[serde(default)]
    pub workflow: Option<String>,
}

/// Output validation rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    #[serde(default)]
    pub must_contain: Vec<String>,
    #[serde(default)]
    pub must_not_contain: Vec<String>,
}

/// A deterministic post-processing replacement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostProcessRule {
    pub pattern: String,
    #[serde(default)]
    pub replacement: String,
    /// Space/comma separated: IGNORECASE, MULTILINE, DOTALL.
    #[serde(default)]
    pub flags: String,
}

/// One git command the compiler runs for embedding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GitCommand {
    pub name: String,
    pub command: String,
}

/// Git intelligence section of a patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitIntelligence {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_embed_marker")]
    pub embed_marker: String,
    #[serde(default = "default_no_git_message")]
    pub no_git_message: String,
    #[serde(default)]
    pub commands: Vec<GitCommand>,
}

fn default_embed_marker() -> String {
    "git-context".into()
}

fn default_no_git_message() -> String {
    "Project is not a git repository; no git context available.".into()
}

/// Complete patch definition as declared in YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPatch {
    pub config: PatchConfig,
    #[serde(default)]
    pub compatibility: Compatibility,
    pub transforms: Vec<String>,
    #[serde(default)]
    pub validation: Option<Validation>,
    #[serde(default)]
    pub post_process: Vec<PostProcessRule>,
    #[serde(default)]
    pub git_intelligence: Option<GitIntelligence>,
}

/// Result of applying one transform instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformResult {
    pub instruction: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Search order for a workflow's patch file: project `.bmad-assist/patches/`,
/// then the CWD, then the global patches directory. At most one applies.
pub fn discover_patch(
    workflow_name: &str,
    project_paths: &ProjectPaths,
    cwd: &Path,
) -> Option<PathBuf> {
    let filename = format!("{workflow_name}.patch.yaml");
    let mut candidates = vec![
        project_paths.patches_dir().join(&filename),
        cwd.join(&filename),
    ];
    if let Some(global) = GlobalPaths::resolve() {
        candidates.push(global.patches_dir().join(&filename));
    }

    candidates.into_iter().find(|p| p.exists())
}

/// Load and parse a patch file.
pub fn load_patch(path: &Path) -> Result<WorkflowPatch, PatchError> {
    let content = std::fs::read_to_string(path).map_err(|e| PatchError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;
    let patch: WorkflowPatch =
        serde_yaml::from_str(&content).map_err(|e| PatchError::Invalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    if patch.transforms.is_empty() {
        return Err(PatchError::Invalid {
            path: path.to_path_buf(),
            message: "patch declares no transforms".to_string(),
        });
    }
    Ok(patch)
}

/// Compile a patch into a template and store it in the cache.
///
/// Returns the template content. Validation failures and sub-threshold
/// transform success are errors; the caller decides whether to fall back.
pub async fn compile_patch(
    workflow_name: &str,
    workflow_dir: &Path,
    patch_path: &Path,
    patch: &WorkflowPatch,
    patcher: &ProviderSettings,
    project_paths: &ProjectPaths,
    source_hash: &str,
) -> Result<String, PatchError> {
    let raw = load_raw_workflow(workflow_dir)
        .map_err(|e| PatchError::Other(anyhow::anyhow!("{e}")))?;

    let document =
        session::run_patch_session(patcher, &patch.transforms, &raw.raw_instructions).await;

    // One session applies every transform; its outcome is shared by all.
    let results: Vec<TransformResult> = patch
        .transforms
        .iter()
        .map(|t| TransformResult {
            instruction: t.clone(),
            success: document.is_ok(),
            error: document.as_ref().err().map(|e| e.to_string()),
        })
        .collect();

    let document = document?;
    let mut template = session::post_process_compiled(&document, &patch.post_process);

    if let Some(git) = &patch.git_intelligence {
        let block = git_intel::extract_git_intelligence(git, &project_paths.project_root, &[]).await;
        if !block.is_empty() {
            let placeholder = format!("<{}/>", git.embed_marker);
            if template.contains(&placeholder) {
                template = template.replace(&placeholder, &block);
            } else {
                template.push('\n');
                template.push_str(&block);
                template.push('\n');
            }
        }
    }

    let errors = validation::validate_output(&template, patch.validation.as_ref());
    if !errors.is_empty() {
        return Err(PatchError::ValidationFailed { errors });
    }

    if !validation::check_threshold(&results) {
        return Err(PatchError::ThresholdNotMet {
            succeeded: results.iter().filter(|r| r.success).count(),
            total: results.len(),
        });
    }

    let cache = TemplateCache::new(project_paths.cache_dir(), workflow_name);
    let meta = CacheMeta {
        workflow: workflow_name.to_string(),
        patch_name: patch.config.name.clone(),
        patch_version: patch.config.version.clone(),
        source_hash: source_hash.to_string(),
        compiled_at: utc_now_naive(),
        transforms_total: results.len(),
        transforms_succeeded: results.iter().filter(|r| r.success).count(),
    };
    cache
        .store(&template, &meta)
        .map_err(PatchError::Other)?;

    info!(
        workflow = workflow_name,
        patch = %patch_path.display(),
        transforms = patch.transforms.len(),
        "Compiled and cached workflow template"
    );
    Ok(template)
}

/// Load the `WorkflowIR` for a workflow: the cached patched template when a
/// patch exists and the hash matches, a freshly compiled template on a miss,
/// or the raw workflow files when there is no patch (or patching fails).
///
/// Returns the IR plus the applied patch path, if any.
pub async fn load_workflow_ir(
    workflow_name: &str,
    workflow_dir: &Path,
    project_paths: &ProjectPaths,
    cwd: &Path,
    patcher: Option<&ProviderSettings>,
) -> Result<(WorkflowIR, Option<PathBuf>), PatchError> {
    let raw = load_raw_workflow(workflow_dir)
        .map_err(|e| PatchError::Other(anyhow::anyhow!("{e}")))?;

    let Some(patch_path) = discover_patch(workflow_name, project_paths, cwd) else {
        debug!(workflow = workflow_name, "No patch found, using raw workflow");
        return Ok((raw, None));
    };

    let patch = match load_patch(&patch_path) {
        Ok(patch) => patch,
        Err(e) => {
            warn!("Ignoring invalid patch {}: {e}", patch_path.display());
            return Ok((raw, None));
        }
    };

    let source_hash = compute_source_hash(&[
        &workflow_dir.join("workflow.yaml"),
        &workflow_dir.join("instructions.xml"),
        &patch_path,
    ]);

    let cache = TemplateCache::new(project_paths.cache_dir(), workflow_name);
    if let Some((template, _meta)) = cache.load_if_valid(&source_hash) {
        return Ok((
            WorkflowIR {
                raw_instructions: template,
                ..raw
            },
            Some(patch_path),
        ));
    }

    let Some(patcher) = patcher else {
        warn!(
            workflow = workflow_name,
            "Patch present but no patcher provider configured; using raw workflow"
        );
        return Ok((raw, None));
    };

    match compile_patch(
        workflow_name,
        workflow_dir,
        &patch_path,
        &patch,
        patcher,
        project_paths,
        &source_hash,
    )
    .await
    {
        Ok(template) => Ok((
            WorkflowIR {
                raw_instructions: template,
                ..raw
            },
            Some(patch_path),
        )),
        Err(e) => {
            // Fall back to the unpatched workflow; compilation must go on.
            warn!("Patch compilation failed for '{workflow_name}': {e}; using raw workflow");
            Ok((raw, None))
        }
    }
}
