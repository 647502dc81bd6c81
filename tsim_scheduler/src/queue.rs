// Traceroute fleet simulator. Adapted from the Registry's locked-file read-modify-write idiom for
// the same atomic-append/atomic-swap durability requirement.
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

//! Persistent FIFO Queue of reachability jobs, plus the pure `pop_compatible` conflict rule.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tsim::model::types::{Dscp, PortRange, Proto};
use tsim::SchedulerError;

/// How a job should share the fabric with concurrently running jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Shares routers with other quick jobs via DSCP tagging.
    Quick,
    /// Requires exclusive use of every router on its path.
    Detailed,
}

/// One `(port, proto)` pair a job probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortProto {
    /// Destination port.
    pub port: u16,
    /// Transport protocol.
    pub proto: Proto,
}

/// Current lifecycle status of a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Waiting in the queue.
    Queued,
    /// Popped and assigned to a worker.
    Running,
    /// Completed successfully.
    Success,
    /// Completed, but the reported verdict is "not reachable" / blocked.
    Fail,
    /// Failed to complete (phase error, timeout, leader crash).
    Error,
}

/// A reachability test submitted for the scheduler to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique run identifier.
    pub run_id: String,
    /// Submitting user, for audit and the Report.
    pub username: String,
    /// Unix timestamp of submission.
    pub created_at: u64,
    /// Quick or detailed.
    pub mode: Mode,
    /// Source address.
    pub src: std::net::Ipv4Addr,
    /// Optional fixed source port.
    pub sport: Option<u16>,
    /// Destination address.
    pub dst: std::net::Ipv4Addr,
    /// Destination ports/protocols to probe.
    pub ports: Vec<PortProto>,
    /// Current status.
    pub status: Status,
}

impl Job {
    /// Router names this job touches, used by [`pop_compatible`]'s conflict rule. The router set
    /// is not known until the Path Planner has run; callers pass it in explicitly since the Queue
    /// itself holds no Fleet reference.
    pub fn conflicts_with(router_set: &HashSet<String>, other_router_set: &HashSet<String>) -> bool {
        !router_set.is_disjoint(other_router_set)
    }
}

/// A [`Job`] currently assigned to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningJob {
    /// The underlying job.
    pub job: Job,
    /// Router names on this job's path, used for conflict detection.
    pub router_set: Vec<String>,
    /// DSCP codepoint allocated to this job, if quick.
    pub dscp: Option<Dscp>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueState {
    jobs: Vec<Job>,
}

/// Persistent, file-locked FIFO queue at `<data_dir>/queue/queue.json`.
#[derive(Debug)]
pub struct Queue {
    path: PathBuf,
}

impl Queue {
    /// Open (creating if absent) the queue file at `path`.
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

    fn with_locked_state<T>(&self, f: impl FnOnce(&mut QueueState) -> T) -> Result<T, SchedulerError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| SchedulerError::Queue(e.to_string()))?;
        file.lock_exclusive().map_err(|e| SchedulerError::Queue(e.to_string()))?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).map_err(|e| SchedulerError::Queue(e.to_string()))?;
        let mut state: QueueState =
            if bytes.is_empty() { QueueState::default() } else { serde_json::from_slice(&bytes).unwrap_or_default() };

        let result = f(&mut state);

        let encoded = serde_json::to_vec(&state).map_err(|e| SchedulerError::Queue(e.to_string()))?;
        file.seek(SeekFrom::Start(0)).map_err(|e| SchedulerError::Queue(e.to_string()))?;
        file.set_len(0).map_err(|e| SchedulerError::Queue(e.to_string()))?;
        file.write_all(&encoded).map_err(|e| SchedulerError::Queue(e.to_string()))?;
        file.unlock().ok();
        Ok(result)
    }

    /// Append a job atomically, preserving FIFO order.
    pub fn enqueue(&self, job: Job) -> Result<(), SchedulerError> {
        self.with_locked_state(|state| state.jobs.push(job))
    }

    /// All currently queued jobs, in FIFO order.
    pub fn snapshot(&self) -> Result<Vec<Job>, SchedulerError> {
        self.with_locked_state(|state| state.jobs.clone())
    }

    /// Remove and return the job with the given `run_id`, if queued.
    pub fn remove(&self, run_id: &str) -> Result<Option<Job>, SchedulerError> {
        self.with_locked_state(|state| {
            let index = state.jobs.iter().position(|j| j.run_id == run_id)?;
            Some(state.jobs.remove(index))
        })
    }

    /// Put a job back at the head of the queue (used when a popped job could not acquire its
    /// locks, preserving FIFO for everything behind it).
    pub fn requeue_at_head(&self, job: Job) -> Result<(), SchedulerError> {
        self.with_locked_state(|state| state.jobs.insert(0, job))
    }
}

/// Maximum number of quick jobs permitted to run simultaneously.
pub const MAX_CONCURRENT_QUICK: usize = 32;

/// Pure function of the queue head and the current running set, implementing the conflict rule
/// that lets non-overlapping jobs run concurrently while serializing anything that shares a
/// router. `router_set_of` resolves a job's path to the set of router names it touches (the Path
/// Planner's result; callers precompute this since `Queue` itself has no Fleet reference).
///
/// - A `Detailed` job at the head is popped alone if its router set does not intersect any
///   running job's router set; otherwise nothing is popped (head-of-line blocking).
/// - A `Quick` job at the head is popped, along with as many subsequent quick jobs as fit under
///   [`MAX_CONCURRENT_QUICK`], skipping any whose router set intersects a running `Detailed` job.
///   Quick jobs never conflict with each other.
pub fn pop_compatible(
    queued: &[Job],
    running: &[RunningJob],
    router_set_of: impl Fn(&Job) -> HashSet<String>,
) -> Vec<Job> {
    let Some(head) = queued.first() else {
        return Vec::new();
    };

    let running_detailed_routers: Vec<HashSet<String>> = running
        .iter()
        .filter(|r| r.job.mode == Mode::Detailed)
        .map(|r| r.router_set.iter().cloned().collect())
        .collect();

    match head.mode {
        Mode::Detailed => {
            let head_routers = router_set_of(head);
            let conflicts = running_detailed_routers.iter().any(|s| !s.is_disjoint(&head_routers))
                || running.iter().any(|r| !router_set_of(&r.job).is_disjoint(&head_routers));
            if conflicts {
                Vec::new()
            } else {
                vec![head.clone()]
            }
        }
        Mode::Quick => {
            let running_quick_count = running.iter().filter(|r| r.job.mode == Mode::Quick).count();
            let mut slots_left = MAX_CONCURRENT_QUICK.saturating_sub(running_quick_count);
            let mut popped = Vec::new();
            for job in queued {
                if slots_left == 0 {
                    break;
                }
                if job.mode == Mode::Detailed {
                    // Head-of-line blocking: a later detailed job must wait its turn, but does
                    // not block quick jobs ahead of it in the scan since those already passed.
                    break;
                }
                let job_routers = router_set_of(job);
                let conflicts_with_detailed =
                    running_detailed_routers.iter().any(|s| !s.is_disjoint(&job_routers));
                if !conflicts_with_detailed {
                    popped.push(job.clone());
                    slots_left -= 1;
                }
            }
            popped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn job(run_id: &str, mode: Mode) -> Job {
        Job {
            run_id: run_id.to_string(),
            username: "alice".to_string(),
            created_at: 0,
            mode,
            src: "10.0.0.1".parse().unwrap(),
            sport: None,
            dst: "10.0.0.2".parse().unwrap(),
            ports: vec![PortProto { port: 22, proto: Proto::Tcp }],
            status: Status::Queued,
        }
    }

    fn routers(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn detailed_job_is_blocked_by_overlapping_running_detailed_job() {
        let queued = vec![job("b", Mode::Detailed)];
        let running = vec![RunningJob {
            job: job("a", Mode::Detailed),
            router_set: vec!["hq-core".to_string()],
            dscp: None,
        }];
        let router_sets: std::collections::HashMap<&str, HashSet<String>> =
            [("a", routers(&["hq-core"])), ("b", routers(&["hq-core", "dc-core"]))].into_iter().collect();
        let popped = pop_compatible(&queued, &running, |j| router_sets[j.run_id.as_str()].clone());
        assert!(popped.is_empty());
    }

    #[test]
    fn quick_jobs_pop_up_to_the_concurrency_cap() {
        let queued: Vec<Job> = (0..40).map(|i| job(&format!("q{i}"), Mode::Quick)).collect();
        let popped = pop_compatible(&queued, &[], |_| routers(&["hq-core"]));
        assert_eq!(popped.len(), MAX_CONCURRENT_QUICK);
    }

    #[test]
    fn quick_job_conflicting_with_running_detailed_is_skipped() {
        let queued = vec![job("q1", Mode::Quick)];
        let running = vec![RunningJob {
            job: job("d1", Mode::Detailed),
            router_set: vec!["hq-core".to_string()],
            dscp: None,
        }];
        let popped = pop_compatible(&queued, &running, |_| routers(&["hq-core"]));
        assert!(popped.is_empty());
    }
}
