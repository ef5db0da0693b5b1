//! Deterministic metrics extracted from evaluator reports.
//!
//! Counts are computed by regex over the report markdown, never by LLM
//! judgment, so the same artifacts always yield the same numbers. Aggregates
//! across evaluators feed the Markdown header prepended to synthesis
//! reports, and the marker-delimited JSON block in synthesis output carries
//! the LLM's own structured metrics.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Per-evaluator deterministic counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorMetrics {
    pub evaluator: String,
    pub critical_count: usize,
    pub enhancement_count: usize,
    pub optimization_count: usize,
}

impl EvaluatorMetrics {
    pub fn total_findings(&self) -> usize {
        self.critical_count + self.enhancement_count + self.optimization_count
    }
}

/// Min/max/avg/stdev across one severity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityStats {
    pub min: usize,
    pub max: usize,
    pub avg: f64,
    pub stdev: f64,
}

impl SeverityStats {
    fn from_counts(counts: &[usize]) -> Self {
        let min = counts.iter().copied().min().unwrap_or(0);
        let max = counts.iter().copied().max().unwrap_or(0);
        let n = counts.len().max(1) as f64;
        let avg = counts.iter().sum::<usize>() as f64 / n;
        let variance = counts
            .iter()
            .map(|&c| (c as f64 - avg).powi(2))
            .sum::<f64>()
            / n;
        Self {
            min,
            max,
            avg,
            stdev: variance.sqrt(),
        }
    }
}

/// Aggregate metrics across all evaluators of one fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    pub evaluator_count: usize,
    pub critical: SeverityStats,
    pub enhancement: SeverityStats,
    pub optimization: SeverityStats,
}

fn severity_patterns() -> &'static [(&'static str, Regex); 3] {
    static PATTERNS: OnceLock<[(&'static str, Regex); 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (
                "critical",
                Regex::new(r"(?im)^\s*(?:-\s*)?(?:\*\*)?(?:\[)?critical(?:\])?(?:\*\*)?[:\s]").unwrap(),
            ),
            (
                "enhancement",
                Regex::new(r"(?im)^\s*(?:-\s*)?(?:\*\*)?(?:\[)?enhancement(?:\])?(?:\*\*)?[:\s]").unwrap(),
            ),
            (
                "optimization",
                Regex::new(r"(?im)^\s*(?:-\s*)?(?:\*\*)?(?:\[)?optimization(?:\])?(?:\*\*)?[:\s]").unwrap(),
            ),
        ]
    })
}

/// Parse one evaluator report into severity counts.
pub fn extract_evaluator_metrics(evaluator: &str, report: &str) -> EvaluatorMetrics {
    let [critical, enhancement, optimization] = severity_patterns();
    EvaluatorMetrics {
        evaluator: evaluator.to_string(),
        critical_count: critical.1.find_iter(report).count(),
        enhancement_count: enhancement.1.find_iter(report).count(),
        optimization_count: optimization.1.find_iter(report).count(),
    }
}

/// Aggregate across evaluators. Empty input yields an all-zero aggregate.
pub fn calculate_aggregate_metrics(metrics: &[EvaluatorMetrics]) -> AggregateMetrics {
    let criticals: Vec<usize> = metrics.iter().map(|m| m.critical_count).collect();
    let enhancements: Vec<usize> = metrics.iter().map(|m| m.enhancement_count).collect();
    let optimizations: Vec<usize> = metrics.iter().map(|m| m.optimization_count).collect();

    AggregateMetrics {
        evaluator_count: metrics.len(),
        critical: SeverityStats::from_counts(&criticals),
        enhancement: SeverityStats::from_counts(&enhancements),
        optimization: SeverityStats::from_counts(&optimizations),
    }
}

/// Format the Markdown header prepended to synthesis reports.
pub fn format_deterministic_metrics_header(
    metrics: &[EvaluatorMetrics],
    aggregate: &AggregateMetrics,
) -> String {
    let mut lines = Vec::new();
    lines.push("<!-- deterministic-metrics: regex-derived, not LLM output -->".to_string());
    lines.push("## Deterministic Metrics".to_string());
    lines.push(String::new());
    lines.push("| Evaluator | Critical | Enhancement | Optimization |".to_string());
    lines.push("|-----------|----------|-------------|--------------|".to_string());
    for m in metrics {
        lines.push(format!(
            "| {} | {} | {} | {} |",
            m.evaluator, m.critical_count, m.enhancement_count, m.optimization_count
        ));
    }
    lines.push(String::new());
    lines.push(format!(
        "Aggregate over {} evaluator(s): critical min {} / max {} / avg {:.1} / stdev {:.1}; \
         enhancement avg {:.1}; optimization avg {:.1}",
        aggregate.evaluator_count,
        aggregate.critical.min,
        aggregate.critical.max,
        aggregate.critical.avg,
        aggregate.critical.stdev,
        aggregate.enhancement.avg,
        aggregate.optimization.avg,
    ));
    lines.push(String::new());
    lines.join("\n")
}

/// Marker strings delimiting the structured JSON in synthesis output.
pub const METRICS_JSON_START: &str = "<!-- METRICS_JSON_START -->";
pub const METRICS_JSON_END: &str = "<!-- METRICS_JSON_END -->";

/// Structured metrics the synthesis LLM reports about its own inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisMetrics {
    #[serde(default)]
    pub quality: Option<serde_json::Value>,
    #[serde(default)]
    pub consensus: Option<serde_json::Value>,
}

/// Extract the marker-delimited JSON metrics from synthesis output.
///
/// Extraction is graceful: missing markers or invalid JSON log a warning and
/// return None so metrics never block the synthesis phase.
pub fn extract_synthesis_metrics(raw_output: &str) -> Option<SynthesisMetrics> {
    let start = raw_output.find(METRICS_JSON_START)?;
    let Some(end) = raw_output.find(METRICS_JSON_END) else {
        warn!("Synthesis metrics start marker without end marker");
        return None;
    };
    if end <= start {
        warn!("Synthesis metrics markers out of order");
        return None;
    }

    let json_str = raw_output[start + METRICS_JSON_START.len()..end].trim();
    match serde_json::from_str::<SynthesisMetrics>(json_str) {
        Ok(metrics) if metrics.quality.is_some() || metrics.consensus.is_some() => Some(metrics),
        Ok(_) => {
            warn!("Synthesis metrics JSON has no recognized sections");
            None
        }
        Err(e) => {
            warn!("Invalid JSON in synthesis metrics: {e}");
            None
        }
    }
}
