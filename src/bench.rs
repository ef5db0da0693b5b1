//! Benchmarking store: per-evaluator invocation records and aggregate
//! reports.
//!
//! Storage failures are non-fatal by design — benchmarking must never break
//! a run. Records land under `.bmad-assist/benchmarks/` as one YAML file
//! per phase execution.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::timing::{format_timestamp, local_now, utc_now_naive};
use crate::util::atomic_write_str;

/// One evaluator's performance in one fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorRecord {
    pub evaluator: String,
    pub phase: String,
    pub story: String,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub findings_total: Option<usize>,
}

/// A batch of records from one phase execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkBatch {
    pub recorded_at: chrono::NaiveDateTime,
    pub records: Vec<EvaluatorRecord>,
}

/// Aggregate view across all stored batches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub batches: usize,
    pub invocations: usize,
    pub successes: usize,
    pub avg_duration_ms: f64,
    /// Per-evaluator (invocations, successes).
    pub per_evaluator: std::collections::BTreeMap<String, (usize, usize)>,
}

/// File-backed store of evaluator records.
pub struct BenchmarkStore {
    dir: PathBuf,
}

impl BenchmarkStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Persist one batch. Failures log and return None — never an error.
    pub fn save(&self, records: Vec<EvaluatorRecord>) -> Option<PathBuf> {
        if records.is_empty() {
            return None;
        }
        let batch = BenchmarkBatch {
            recorded_at: utc_now_naive(),
            records,
        };
        let path = self
            .dir
            .join(format!("bench-{}.yaml", format_timestamp(local_now())));

        let yaml = match serde_yaml::to_string(&batch) {
            Ok(yaml) => yaml,
            Err(e) => {
                warn!("Failed to serialize benchmark batch: {e}");
                return None;
            }
        };
        if let Err(e) = atomic_write_str(&path, &yaml) {
            warn!("Failed to save benchmark batch: {e}");
            return None;
        }
        Some(path)
    }

    fn load_batch(path: &Path) -> Option<BenchmarkBatch> {
        let content = std::fs::read_to_string(path).ok()?;
        serde_yaml::from_str(&content).ok()
    }

    /// Aggregate everything stored so far. Unreadable batches are skipped.
    pub fn report(&self) -> BenchmarkReport {
        let pattern = self.dir.join("bench-*.yaml");
        let batches: Vec<BenchmarkBatch> = glob::glob(&pattern.to_string_lossy())
            .map(|it| {
                it.filter_map(Result::ok)
                    .filter_map(|p| Self::load_batch(&p))
                    .collect()
            })
            .unwrap_or_default();

        let mut report = BenchmarkReport {
            batches: batches.len(),
            ..Default::default()
        };
        let mut total_duration: u128 = 0;
        for batch in &batches {
            for record in &batch.records {
                report.invocations += 1;
                if record.success {
                    report.successes += 1;
                }
                total_duration += u128::from(record.duration_ms);
                let entry = report
                    .per_evaluator
                    .entry(record.evaluator.clone())
                    .or_insert((0, 0));
                entry.0 += 1;
                if record.success {
                    entry.1 += 1;
                }
            }
        }
        if report.invocations > 0 {
            report.avg_duration_ms = total_duration as f64 / report.invocations as f64;
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(evaluator: &str, duration_ms: u64, success: bool) -> EvaluatorRecord {
        EvaluatorRecord {
            evaluator: evaluator.into(),
            phase: "validate_story".into(),
            story: "1.1".into(),
            duration_ms,
            success,
            session_id: None,
            findings_total: Some(3),
        }
    }

    #[test]
    fn test_save_and_report_round_trip() {
        let dir = tempdir().unwrap();
        let store = BenchmarkStore::new(dir.path());

        store
            .save(vec![record("opus", 1000, true), record("codex", 3000, false)])
            .unwrap();

        let report = store.report();
        assert_eq!(report.batches, 1);
        assert_eq!(report.invocations, 2);
        assert_eq!(report.successes, 1);
        assert!((report.avg_duration_ms - 2000.0).abs() < f64::EPSILON);
        assert_eq!(report.per_evaluator["opus"], (1, 1));
        assert_eq!(report.per_evaluator["codex"], (1, 0));
    }

    #[test]
    fn test_save_empty_batch_is_none() {
        let dir = tempdir().unwrap();
        let store = BenchmarkStore::new(dir.path());
        assert!(store.save(Vec::new()).is_none());
    }

    #[test]
    fn test_save_to_unwritable_dir_is_silent() {
        // Non-fatal contract: a bad directory yields None, not an error.
        let store = BenchmarkStore::new("/proc/definitely/not/writable");
        assert!(store.save(vec![record("opus", 1, true)]).is_none());
    }

    #[test]
    fn test_report_skips_corrupt_batches() {
        let dir = tempdir().unwrap();
        let store = BenchmarkStore::new(dir.path());
        store.save(vec![record("opus", 10, true)]).unwrap();
        std::fs::write(dir.path().join("bench-garbage.yaml"), "{not yaml").unwrap();

        let report = store.report();
        assert_eq!(report.batches, 1);
    }
}
