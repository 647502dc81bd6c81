// Traceroute fleet simulator. Persists finished-job state to `<data_dir>/queue/history.json`,
// using the same locked-file read-modify-write idiom as `queue.rs` and `tsim_fabric::registry`.
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

//! Append-only record of finished jobs, for audit and for the leader's orphan-refcount sweep on
//! restart.

use crate::queue::{Job, Status};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use tsim::SchedulerError;

/// One finished job, with its terminal status and the router set it held while running (used by
/// the leader's orphan-refcount sweep if Teardown did not complete before a crash).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The job as it looked at completion.
    pub job: Job,
    /// Router names the job held locks/DSCP on while running.
    pub router_set: Vec<String>,
    /// True if Teardown is known to have completed for this job.
    pub teardown_complete: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryState {
    entries: Vec<HistoryEntry>,
}

/// Persistent history log at `<data_dir>/queue/history.json`.
#[derive(Debug)]
pub struct History {
    path: PathBuf,
}

impl History {
    /// Open (creating if absent) the history file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SchedulerError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SchedulerError::Queue(e.to_string()))?;
        }
        if !path.exists() {
            std::fs::write(&path, b"").map_err(|e| SchedulerError::Queue(e.to_string()))?;
        }
        Ok(Self { path })
    }

    fn with_locked_state<T>(&self, f: impl FnOnce(&mut HistoryState) -> T) -> Result<T, SchedulerError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| SchedulerError::Queue(e.to_string()))?;
        file.lock_exclusive().map_err(|e| SchedulerError::Queue(e.to_string()))?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).map_err(|e| SchedulerError::Queue(e.to_string()))?;
        let mut state: HistoryState = if bytes.is_empty() {
            HistoryState::default()
        } else {
            serde_json::from_slice(&bytes).unwrap_or_default()
        };

        let result = f(&mut state);

        let encoded = serde_json::to_vec(&state).map_err(|e| SchedulerError::Queue(e.to_string()))?;
        file.seek(SeekFrom::Start(0)).map_err(|e| SchedulerError::Queue(e.to_string()))?;
        file.set_len(0).map_err(|e| SchedulerError::Queue(e.to_string()))?;
        file.write_all(&encoded).map_err(|e| SchedulerError::Queue(e.to_string()))?;
        file.unlock().ok();
        Ok(result)
    }

    /// Record a finished job.
    pub fn record(&self, entry: HistoryEntry) -> Result<(), SchedulerError> {
        self.with_locked_state(|state| state.entries.push(entry))
    }

    /// All entries whose Teardown did not complete, i.e. candidates for the leader's startup
    /// sweep.
    pub fn orphans(&self) -> Result<Vec<HistoryEntry>, SchedulerError> {
        self.with_locked_state(|state| {
            state.entries.iter().filter(|e| !e.teardown_complete).cloned().collect()
        })
    }

    /// Mark every in-flight entry (status `Running`) as `Error` with `teardown_complete = true`,
    /// called once by a newly-elected leader that finds stale `Running` entries left by a
    /// previous leader's crash.
    pub fn mark_stale_running_as_error(&self) -> Result<usize, SchedulerError> {
        self.with_locked_state(|state| {
            let mut count = 0;
            for entry in state.entries.iter_mut() {
                if matches!(entry.job.status, Status::Running) {
                    entry.job.status = Status::Error;
                    entry.teardown_complete = true;
                    count += 1;
                }
            }
            count
        })
    }
}
