// Traceroute fleet simulator. Appends progress events to `<data_dir>/progress/<run_id>.jsonl`,
// consumable by an SSE endpoint.
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

//! Progress Tracker: an append-only JSONL log per run, consumable by an SSE endpoint (out of
//! this crate's scope, but the log format is the contract between them).

use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tsim::SchedulerError;

/// One progress event, serialized as one JSON line.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    /// Orchestrator phase name (e.g. `"path_discovery"`, `"probes"`).
    pub phase: String,
    /// Completion percentage, 0..=100.
    pub percent: u8,
    /// Human-readable status message.
    pub message: String,
    /// Unix timestamp.
    pub ts: u64,
}

/// Final event appended to a run's log, closing the SSE stream.
#[derive(Debug, Clone, Serialize)]
pub struct TerminalEvent {
    /// Always `true`; present so the SSE consumer can distinguish this from [`ProgressEvent`].
    pub complete: bool,
    /// Final job status, rendered as its `Display`/`Debug` form by the caller.
    pub status: String,
}

/// Appends to, and tails, one run's progress log.
#[derive(Debug)]
pub struct ProgressTracker {
    path: PathBuf,
}

impl ProgressTracker {
    /// The progress log path for `run_id` under `progress_dir`.
    pub fn for_run(progress_dir: &Path, run_id: &str) -> Result<Self, SchedulerError> {
        std::fs::create_dir_all(progress_dir).map_err(|e| SchedulerError::Queue(e.to_string()))?;
        Ok(Self { path: progress_dir.join(format!("{run_id}.jsonl")) })
    }

    fn append_line(&self, line: &str) -> Result<(), SchedulerError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| SchedulerError::Queue(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| SchedulerError::Queue(e.to_string()))
    }

    /// Append one progress event.
    pub fn emit(&self, event: &ProgressEvent) -> Result<(), SchedulerError> {
        let line = serde_json::to_string(event).map_err(|e| SchedulerError::Queue(e.to_string()))?;
        self.append_line(&line)
    }

    /// Append the terminal event, closing the stream.
    pub fn complete(&self, status: &str) -> Result<(), SchedulerError> {
        let event = TerminalEvent { complete: true, status: status.to_string() };
        let line = serde_json::to_string(&event).map_err(|e| SchedulerError::Queue(e.to_string()))?;
        self.append_line(&line)
    }

    /// Read every line appended so far, for tests and for a polling (non-SSE) client.
    pub fn tail(&self) -> Result<Vec<String>, SchedulerError> {
        let Ok(file) = std::fs::File::open(&self.path) else {
            return Ok(Vec::new());
        };
        BufReader::new(file)
            .lines()
            .map(|l| l.map_err(|e| SchedulerError::Queue(e.to_string())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitted_events_and_terminal_event_are_both_tailed() {
        let dir = std::env::temp_dir().join(format!("tsim_progress_test_{}", std::process::id()));
        let tracker = ProgressTracker::for_run(&dir, "run-1").unwrap();
        tracker
            .emit(&ProgressEvent { phase: "path_discovery".to_string(), percent: 10, message: "ok".to_string(), ts: 0 })
            .unwrap();
        tracker.complete("SUCCESS").unwrap();

        let lines = tracker.tail().unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("\"complete\":true"));

        std::fs::remove_dir_all(&dir).ok();
    }
}
