//! Append-only JSONL event log.
//!
//! Every step of an attempt — tool calls, LLM requests, patch applications,
//! test runs, the final outcome — is recorded as one [`Event`] line in
//! `events.jsonl`. The file is opened in append mode, advisory-locked for
//! the duration of a single write, and `fsync`ed before the lock is
//! released, so a crash mid-attempt never corrupts a prior line and a
//! concurrent reader never observes a partial one.
//!
//! [`NullEventLogger`] exists for tests and one-off tool invocations that
//! have no run directory to write into; it implements [`EventSink`] as a
//! no-op rather than making every caller handle an `Option`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use fs2::FileExt;
use serde_json::Value;

use crate::model::{Event, EventKind};
use crate::truncate::truncate_json;

/// Where an attempt's events go. Implemented by [`EventLogger`] (the real
/// thing) and [`NullEventLogger`] (discards everything).
pub trait EventSink: Send + Sync {
    /// Appends one event, stamped with the current step counter.
    fn log(&self, event_type: EventKind, payload: Value);

    /// Advances the step counter and returns the new value. Called once per
    /// agent-loop iteration so every event emitted during that step — tool
    /// started, tool finished, turn finished — shares one `step_id`.
    fn advance_step(&self) -> u64 {
        0
    }

    /// Appends one line to the optional `llm_messages.jsonl` transcript.
    /// No-op unless the harness was configured with
    /// `log_llm_transcripts = true`.
    fn log_llm_message(&self, _role: &str, _content: &Value) {}
}

/// Discards every event. Used where a [`EventSink`] is required by a
/// function signature but there is no run directory to write into (unit
/// tests, a standalone tool invocation).
pub struct NullEventLogger;

impl EventSink for NullEventLogger {
    fn log(&self, _event_type: EventKind, _payload: Value) {}
}

/// Writes `events.jsonl` (and, when enabled, `llm_messages.jsonl`) under a
/// run's artifact directory.
pub struct EventLogger {
    run_id: String,
    events_path: PathBuf,
    llm_path: Option<PathBuf>,
    step_counter: AtomicU64,
    write_lock: Mutex<()>,
    truncation_chars: usize,
}

impl EventLogger {
    /// Creates the artifact directory if needed and opens `events.jsonl`.
    pub fn new(
        run_id: impl Into<String>,
        artifacts_dir: &Path,
        log_llm_transcripts: bool,
        truncation_chars: usize,
    ) -> std::io::Result<Self> {
        std::fs::create_dir_all(artifacts_dir)?;
        Ok(Self {
            run_id: run_id.into(),
            events_path: artifacts_dir.join("events.jsonl"),
            llm_path: log_llm_transcripts.then(|| artifacts_dir.join("llm_messages.jsonl")),
            step_counter: AtomicU64::new(0),
            write_lock: Mutex::new(()),
            truncation_chars,
        })
    }

    fn append_line(&self, path: &Path, line: &str) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.lock_exclusive()?;
        let result = (|| {
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()
        })();
        let _ = FileExt::unlock(&file);
        result
    }
}

impl EventSink for EventLogger {
    fn log(&self, event_type: EventKind, payload: Value) {
        let step_id = self.step_counter.load(Ordering::SeqCst);
        let event = Event {
            event_type,
            timestamp: Utc::now(),
            run_id: self.run_id.clone(),
            step_id,
            event_version: "1.0".to_string(),
            payload: truncate_json(&payload, self.truncation_chars),
        };
        if let Ok(line) = serde_json::to_string(&event) {
            let _ = self.append_line(&self.events_path, &line);
        }
    }

    fn advance_step(&self) -> u64 {
        self.step_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn log_llm_message(&self, role: &str, content: &Value) {
        let Some(path) = &self.llm_path else { return };
        let record = serde_json::json!({
            "run_id": self.run_id,
            "timestamp": Utc::now(),
            "role": role,
            "content": truncate_json(content, self.truncation_chars),
        });
        if let Ok(line) = serde_json::to_string(&record) {
            let _ = self.append_line(path, &line);
        }
    }
}
