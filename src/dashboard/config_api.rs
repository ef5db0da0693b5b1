//! Config import/export logic behind the dashboard's config endpoints.
//!
//! Export always redacts dangerous fields. Import is a two-step flow:
//! preview validates the payload and computes a diff plus the list of risky
//! fields it touches; apply re-validates, rotates a backup of the project
//! config, writes atomically, and lets the server broadcast
//! `config_reloaded`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use serde_yaml::Value;
use tracing::info;

use crate::config::{Config, LoadedConfig, redact, risky_paths, validate};
use crate::errors::{DashboardError, FieldError};
use crate::timing::{format_local_date, local_now};
use crate::util::atomic_write_str;

/// Which layer an export covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportScope {
    Merged,
    Global,
    Project,
}

impl ExportScope {
    pub fn parse(value: &str) -> Result<Self, DashboardError> {
        match value {
            "merged" => Ok(ExportScope::Merged),
            "global" => Ok(ExportScope::Global),
            "project" => Ok(ExportScope::Project),
            other => Err(DashboardError::BadRequest(format!(
                "unknown export scope '{other}' (expected merged|global|project)"
            ))),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ExportScope::Merged => "merged",
            ExportScope::Global => "global",
            ExportScope::Project => "project",
        }
    }
}

/// Redacted YAML export plus its download filename (dated).
pub fn export_config(
    loaded: &LoadedConfig,
    scope: ExportScope,
) -> Result<(String, String), DashboardError> {
    let tree = match scope {
        ExportScope::Merged => loaded.merged.clone(),
        ExportScope::Global => read_layer(loaded.global_path.as_deref())?,
        ExportScope::Project => read_layer(loaded.project_path.as_deref())?,
    };
    let redacted = redact(&tree);
    let yaml = serde_yaml::to_string(&redacted)
        .map_err(|e| DashboardError::BadRequest(e.to_string()))?;
    let filename = format!(
        "bmad-assist-config-{}-{}.yaml",
        scope.label(),
        format_local_date(local_now())
    );
    Ok((filename, yaml))
}

fn read_layer(path: Option<&Path>) -> Result<Value, DashboardError> {
    let Some(path) = path else {
        return Ok(Value::Mapping(Default::default()));
    };
    let content = std::fs::read_to_string(path)
        .map_err(|_| DashboardError::NotFound(path.display().to_string()))?;
    serde_yaml::from_str(&content).map_err(|e| DashboardError::BadRequest(e.to_string()))
}

/// One changed path in an import diff.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffEntry {
    pub path: String,
    pub current: Option<String>,
    pub proposed: Option<String>,
}

/// Outcome of the import preview step.
#[derive(Debug, Clone, Serialize)]
pub struct ImportPreview {
    pub valid: bool,
    pub errors: Vec<FieldError>,
    pub diff: Vec<DiffEntry>,
    /// Risky fields the import would change.
    pub risky_changes: Vec<String>,
}

fn flatten(prefix: &str, value: &Value, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Mapping(map) => {
            for (k, v) in map {
                let key = k.as_str().map(str::to_string).unwrap_or_else(|| {
                    serde_yaml::to_string(k).unwrap_or_default().trim().to_string()
                });
                let child_prefix = if prefix.is_empty() {
                    key
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(&child_prefix, v, out);
            }
        }
        other => {
            let rendered = serde_yaml::to_string(other)
                .unwrap_or_default()
                .trim()
                .to_string();
            out.insert(prefix.to_string(), rendered);
        }
    }
}

/// Compute the flat diff between two config trees.
pub fn diff_configs(current: &Value, proposed: &Value) -> Vec<DiffEntry> {
    let mut current_flat = BTreeMap::new();
    let mut proposed_flat = BTreeMap::new();
    flatten("", current, &mut current_flat);
    flatten("", proposed, &mut proposed_flat);

    let mut paths: Vec<&String> = current_flat.keys().chain(proposed_flat.keys()).collect();
    paths.sort();
    paths.dedup();

    paths
        .into_iter()
        .filter_map(|path| {
            let current = current_flat.get(path).cloned();
            let proposed = proposed_flat.get(path).cloned();
            (current != proposed).then(|| DiffEntry {
                path: path.clone(),
                current,
                proposed,
            })
        })
        .collect()
}

fn parse_and_validate(
    payload: &str,
    limit: usize,
) -> Result<(Value, Vec<FieldError>), DashboardError> {
    if payload.len() > limit {
        return Err(DashboardError::ImportTooLarge {
            size: payload.len(),
            limit,
        });
    }
    let proposed: Value = serde_yaml::from_str(payload)
        .map_err(|e| DashboardError::BadRequest(format!("invalid YAML: {e}")))?;

    let errors = match serde_yaml::from_value::<Config>(proposed.clone()) {
        Ok(config) => validate(&config),
        Err(e) => vec![FieldError {
            loc: "<root>".into(),
            msg: e.to_string(),
            kind: "type_error".into(),
        }],
    };
    Ok((proposed, errors))
}

/// Preview an import against the current merged config.
pub fn preview_import(
    current: &Value,
    payload: &str,
    limit: usize,
) -> Result<ImportPreview, DashboardError> {
    let (proposed, errors) = parse_and_validate(payload, limit)?;
    let diff = diff_configs(current, &proposed);

    let risky = risky_paths();
    let risky_changes: Vec<String> = diff
        .iter()
        .map(|d| d.path.clone())
        .filter(|path| risky.iter().any(|r| path == r || path.starts_with(&format!("{r}."))))
        .collect();

    Ok(ImportPreview {
        valid: errors.is_empty(),
        errors,
        diff,
        risky_changes,
    })
}

/// Apply an import: re-validate, rotate a `.bak` of the project config, and
/// write atomically. The caller broadcasts `config_reloaded` on success.
pub fn apply_import(
    project_config_path: &Path,
    payload: &str,
    limit: usize,
) -> Result<(), DashboardError> {
    let (_proposed, errors) = parse_and_validate(payload, limit)?;
    if !errors.is_empty() {
        return Err(DashboardError::BadRequest(format!(
            "config invalid: {} error(s): {}",
            errors.len(),
            errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        )));
    }

    if project_config_path.exists() {
        let backup = project_config_path.with_extension("yaml.bak");
        std::fs::copy(project_config_path, &backup)
            .map_err(|e| DashboardError::BadRequest(format!("backup failed: {e}")))?;
        info!("Rotated config backup to {}", backup.display());
    }

    atomic_write_str(project_config_path, payload)
        .map_err(|e| DashboardError::BadRequest(format!("write failed: {e}")))?;
    info!("Applied config import to {}", project_config_path.display());
    Ok(())
}
