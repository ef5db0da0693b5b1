//! Template cache: compiled workflow templates keyed by source hash.
//!
//! Layout: `.bmad-assist/cache/{workflow}.tpl.xml` + `{workflow}.meta.yaml`.
//! A cache hit requires the recorded hash to equal the hash of the current
//! workflow sources plus the patch file; any mismatch forces recompilation.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::util::atomic_write_str;

/// Metadata recorded next to a compiled template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMeta {
    pub workflow: String,
    pub patch_name: String,
    pub patch_version: String,
    /// Combined hash of workflow sources + patch file.
    pub source_hash: String,
    pub compiled_at: NaiveDateTime,
    pub transforms_total: usize,
    pub transforms_succeeded: usize,
}

/// Hash the given files in order. Missing files contribute a fixed marker so
/// adding or removing a source changes the key.
pub fn compute_source_hash<P: AsRef<Path>>(files: &[P]) -> String {
    let mut hasher = Sha256::new();
    for path in files {
        match fs::read(path.as_ref()) {
            Ok(bytes) => {
                hasher.update((bytes.len() as u64).to_le_bytes());
                hasher.update(&bytes);
            }
            Err(_) => hasher.update(b"<missing>"),
        }
    }
    format!("{:x}", hasher.finalize())
}

/// Handle on one workflow's cache slot.
#[derive(Debug, Clone)]
pub struct TemplateCache {
    cache_dir: PathBuf,
    workflow: String,
}

impl TemplateCache {
    pub fn new(cache_dir: impl Into<PathBuf>, workflow: &str) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            workflow: workflow.to_string(),
        }
    }

    pub fn template_path(&self) -> PathBuf {
        self.cache_dir.join(format!("{}.tpl.xml", self.workflow))
    }

    pub fn meta_path(&self) -> PathBuf {
        self.cache_dir.join(format!("{}.meta.yaml", self.workflow))
    }

    /// Load the cached template when its recorded hash matches `source_hash`.
    pub fn load_if_valid(&self, source_hash: &str) -> Option<(String, CacheMeta)> {
        let meta_text = fs::read_to_string(self.meta_path()).ok()?;
        let meta: CacheMeta = serde_yaml::from_str(&meta_text).ok()?;
        if meta.source_hash != source_hash {
            debug!(
                workflow = %self.workflow,
                "Template cache stale (hash mismatch), recompiling"
            );
            return None;
        }
        let template = fs::read_to_string(self.template_path()).ok()?;
        debug!(workflow = %self.workflow, "Template cache hit");
        Some((template, meta))
    }

    /// Write template + meta atomically (template first so a crash between
    /// the two writes leaves only a stale meta, which reads as a miss).
    pub fn store(&self, template: &str, meta: &CacheMeta) -> anyhow::Result<()> {
        atomic_write_str(&self.template_path(), template)?;
        let meta_yaml = serde_yaml::to_string(meta)?;
        atomic_write_str(&self.meta_path(), &meta_yaml)?;
        Ok(())
    }
}
