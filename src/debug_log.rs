//! Crash-resilient JSONL capture of provider streams.
//!
//! Every append opens the file, writes, fsyncs, and closes, so interrupts
//! never truncate mid-record. The file is named after the provider session
//! ID extracted from the first init line; lines arriving before init are
//! buffered and flushed once the ID is known.
//!
//! Layout:
//!   ~/.bmad-assist/debug/json/{YY.MM.DD-HH.MM}-{session_id}.jsonl
//!   ~/.bmad-assist/debug/prompts/{timestamp}-{phase_name}.xml

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use tracing::{debug, warn};

use crate::providers::stream::extract_session_id;
use crate::timing::local_now;

/// Maximum size for a single JSON line (1 MiB); longer lines are truncated.
pub const MAX_LINE_SIZE: usize = 1024 * 1024;

/// Append-only JSONL logger for one provider invocation.
pub struct DebugJsonLogger {
    debug_dir: PathBuf,
    enabled: bool,
    file_path: Option<PathBuf>,
    session_id: Option<String>,
    run_timestamp: NaiveDateTime,
    line_count: usize,
    pending_lines: Vec<String>,
}

impl DebugJsonLogger {
    /// Create a logger writing into `debug_dir`. `run_timestamp` keeps
    /// filenames consistent across the providers of one run.
    pub fn new(debug_dir: impl Into<PathBuf>, enabled: bool, run_timestamp: NaiveDateTime) -> Self {
        Self {
            debug_dir: debug_dir.into(),
            enabled,
            file_path: None,
            session_id: None,
            run_timestamp,
            line_count: 0,
            pending_lines: Vec::new(),
        }
    }

    /// Disabled logger; every call is a no-op.
    pub fn disabled() -> Self {
        Self::new(PathBuf::new(), false, local_now())
    }

    /// Append one raw JSON line. The first init line names the file.
    pub fn append(&mut self, json_line: &str) {
        if !self.enabled || json_line.trim().is_empty() {
            return;
        }

        if self.session_id.is_none() {
            if let Some(session_id) = extract_session_id(json_line) {
                self.create_file(&session_id);
                self.write_line(json_line);
            } else {
                // Buffer until init is seen; flushed on create or close.
                self.pending_lines.push(json_line.to_string());
            }
        } else {
            self.write_line(json_line);
        }
    }

    /// Flush remaining buffered lines. Without a session ID a unique
    /// fallback filename is used so parallel providers never collide.
    pub fn close(&mut self) {
        if !self.enabled {
            return;
        }

        if !self.pending_lines.is_empty() && self.file_path.is_none() {
            let ts = self.run_timestamp.format("%y.%m.%d-%H.%M.%S");
            let micros = self.run_timestamp.and_utc().timestamp_subsec_micros();
            let name = format!("{ts}-unknown-{micros:06}-{}.jsonl", std::process::id());
            self.file_path = Some(self.debug_dir.join(name));
            let pending = std::mem::take(&mut self.pending_lines);
            for line in &pending {
                self.write_line(line);
            }
        }

        if self.line_count > 0 {
            debug!(
                "Debug log complete: {:?} ({} lines)",
                self.file_path, self.line_count
            );
        }
    }

    /// Log file path, once known.
    pub fn path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    /// Provider session/thread ID from the init line, if seen.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn create_file(&mut self, session_id: &str) {
        self.session_id = Some(session_id.to_string());
        let ts = self.run_timestamp.format("%y.%m.%d-%H.%M");
        self.file_path = Some(self.debug_dir.join(format!("{ts}-{session_id}.jsonl")));
        debug!("Debug log created: {:?}", self.file_path);

        let pending = std::mem::take(&mut self.pending_lines);
        for line in &pending {
            self.write_line(line);
        }
    }

    fn write_line(&mut self, json_line: &str) {
        let Some(path) = self.file_path.clone() else {
            return;
        };

        let mut line = json_line.trim_end_matches('\n').to_string();
        if line.len() > MAX_LINE_SIZE {
            let marker = format!("...\"[TRUNCATED: {} chars -> {}]\"", line.len(), MAX_LINE_SIZE);
            let safe_len = MAX_LINE_SIZE - marker.len() - 10;
            let mut cut = safe_len;
            while !line.is_char_boundary(cut) {
                cut -= 1;
            }
            line.truncate(cut);
            line.push_str(&marker);
        }
        line.push('\n');

        if let Err(e) = fs::create_dir_all(&self.debug_dir) {
            warn!("Failed to create debug dir {:?}: {e}", self.debug_dir);
            return;
        }

        // Open → write → fsync → close per line so a crash never truncates.
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| {
                f.write_all(line.as_bytes())?;
                f.sync_all()
            });

        match result {
            Ok(()) => self.line_count += 1,
            Err(e) => warn!("Failed to write debug log {}: {e}", path.display()),
        }
    }
}

/// Save a compiled prompt to the debug prompts directory. Returns the path
/// if written; failures are warnings only.
pub fn save_prompt(prompts_dir: &Path, prompt: &str, phase_name: &str, enabled: bool) -> Option<PathBuf> {
    if !enabled {
        return None;
    }

    let ts = local_now().format("%y.%m.%d-%H.%M.%S");
    let path = prompts_dir.join(format!("{ts}-{phase_name}.xml"));

    if let Err(e) = fs::create_dir_all(prompts_dir) {
        warn!("Failed to create prompts dir {}: {e}", prompts_dir.display());
        return None;
    }
    match fs::write(&path, prompt) {
        Ok(()) => {
            debug!("Saved prompt: {} ({} chars)", path.display(), prompt.len());
            Some(path)
        }
        Err(e) => {
            warn!("Failed to save prompt {}: {e}", path.display());
            None
        }
    }
}
