//! Dashboard event marker protocol.
//!
//! The runner communicates with the dashboard process over stdout: lines
//! prefixed `DASHBOARD_EVENT:` carry a JSON payload `{type, timestamp,
//! run_id, sequence_id, data}`. Emission is gated by
//! `BMAD_DASHBOARD_MODE=1`; without it the emitter is silent. `sequence_id`
//! increases monotonically per `run_id` so SSE clients can reorder.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::timing::utc_now;

/// Marker prefix on stdout.
pub const EVENT_PREFIX: &str = "DASHBOARD_EVENT:";

/// Typed dashboard event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardEvent {
    pub r#type: String,
    pub timestamp: String,
    pub run_id: String,
    pub sequence_id: u64,
    pub data: serde_json::Value,
}

impl DashboardEvent {
    /// Parse a stdout line; `None` when it is not a marker line or the
    /// payload fails schema validation.
    pub fn parse_line(line: &str) -> Option<Self> {
        let payload = line.strip_prefix(EVENT_PREFIX)?.trim();
        let event: DashboardEvent = serde_json::from_str(payload).ok()?;
        if event.r#type.is_empty() || event.run_id.is_empty() {
            return None;
        }
        Some(event)
    }
}

/// Emits marker lines on stdout, sequenced per run.
#[derive(Clone)]
pub struct DashboardEmitter {
    run_id: Arc<str>,
    sequence: Arc<AtomicU64>,
    enabled: bool,
}

impl DashboardEmitter {
    /// Emitter gated by `BMAD_DASHBOARD_MODE=1`.
    pub fn from_env(run_id: &str) -> Self {
        let enabled = std::env::var("BMAD_DASHBOARD_MODE").as_deref() == Ok("1");
        Self::new(run_id, enabled)
    }

    pub fn new(run_id: &str, enabled: bool) -> Self {
        Self {
            run_id: Arc::from(run_id),
            sequence: Arc::new(AtomicU64::new(0)),
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Build the event (always, so tests can observe sequencing) and print
    /// the marker line when enabled.
    pub fn emit(&self, event_type: &str, data: serde_json::Value) -> DashboardEvent {
        let event = DashboardEvent {
            r#type: event_type.to_string(),
            timestamp: utc_now().to_rfc3339(),
            run_id: self.run_id.to_string(),
            sequence_id: self.sequence.fetch_add(1, Ordering::SeqCst),
            data,
        };
        if self.enabled {
            // Single println so the marker line is never interleaved.
            println!(
                "{EVENT_PREFIX}{}",
                serde_json::to_string(&event).unwrap_or_default()
            );
        }
        event
    }

    /// `output` event carrying one provider/runner line.
    pub fn emit_output(&self, line: &str) {
        self.emit("output", json!({ "line": line }));
    }

    /// `workflow_status` event at a phase boundary.
    pub fn emit_workflow_status(
        &self,
        phase: &str,
        story: Option<&str>,
        status: &str,
    ) -> DashboardEvent {
        self.emit(
            "workflow_status",
            json!({ "phase": phase, "story": story, "status": status }),
        )
    }

    /// `story_status` event after a status change.
    pub fn emit_story_status(&self, story: &str, status: &str) {
        self.emit("story_status", json!({ "story": story, "status": status }));
    }

    /// `story_transition` event when a story completes.
    pub fn emit_story_transition(&self, story: &str, transition: &str) {
        self.emit(
            "story_transition",
            json!({ "story": story, "transition": transition }),
        );
    }

    pub fn emit_loop_paused(&self) {
        self.emit("LOOP_PAUSED", json!({}));
    }

    pub fn emit_loop_resumed(&self) {
        self.emit("LOOP_RESUMED", json!({}));
    }
}
