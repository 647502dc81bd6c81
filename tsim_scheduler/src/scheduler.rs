// Traceroute fleet simulator, adapted from snowcap_bencher's worker pool
// (snowcap_bencher::runner_strategy::{worker_runner, worker}), which spawns a fixed number of OS
// threads pulling from a shared job counter and reporting results over an mpsc channel, guarded
// by a cooperative `Stopper`. Leader election is new: adapted from the Registry's own
// `flock`-based mutual exclusion, applied here to a single leader slot instead of a code table.
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

//! Scheduler: file-lock leader election, a DSCP allocator, per-router lock acquisition, and a
//! bounded worker pool that runs the Reachability Orchestrator.

use fs2::FileExt;
use log::{info, warn};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{spawn, JoinHandle};
use tsim::model::types::{Dscp, DSCP_POOL_END, DSCP_POOL_START};
use tsim::{SchedulerError, Stopper};

use crate::queue::{pop_compatible, Job, Queue, RunningJob};

/// Size of the bounded thread pool workers are submitted to: one slot per DSCP codepoint plus one
/// for a running detailed job.
pub const WORKER_POOL_CAPACITY: usize = 33;

/// Holds the leader lock for as long as it is alive; dropping it (or process exit) releases the
/// lock so another process can become leader.
pub struct LeaderGuard {
    _file: File,
}

/// Attempt to become the scheduler leader by taking a non-blocking exclusive lock on
/// `<lock_dir>/scheduler_leader`. Returns `None` if another process already holds it.
pub fn try_become_leader(lock_dir: &Path) -> Result<Option<LeaderGuard>, SchedulerError> {
    std::fs::create_dir_all(lock_dir).map_err(|e| SchedulerError::LeaderLockFailed(e.to_string()))?;
    let path = lock_dir.join("scheduler_leader");
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&path)
        .map_err(|e| SchedulerError::LeaderLockFailed(e.to_string()))?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(LeaderGuard { _file: file })),
        Err(_) => Ok(None),
    }
}

/// Allocates DSCP codepoints to quick jobs from the pool `32..64`, releasing them back on job
/// completion.
#[derive(Debug, Default)]
pub struct DscpAllocator {
    in_use: Mutex<HashSet<Dscp>>,
}

impl DscpAllocator {
    /// An allocator with the whole pool free.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the lowest free codepoint, or `None` if the pool is exhausted.
    pub fn allocate(&self) -> Option<Dscp> {
        let mut in_use = self.in_use.lock().unwrap();
        for candidate in DSCP_POOL_START..DSCP_POOL_END {
            if !in_use.contains(&candidate) {
                in_use.insert(candidate);
                return Some(candidate);
            }
        }
        None
    }

    /// Return a codepoint to the pool.
    pub fn release(&self, dscp: Dscp) {
        self.in_use.lock().unwrap().remove(&dscp);
    }
}

/// Non-blocking exclusive lock on one router's file, released on drop. Acquired by a detailed
/// job for every router on its path during phases 2-4.
pub struct RouterLock {
    _file: File,
    router: String,
}

impl RouterLock {
    /// Router name this lock is held for.
    pub fn router(&self) -> &str {
        &self.router
    }
}

/// Attempt to acquire non-blocking exclusive locks on every router in `routers`. If any one
/// fails, all already-acquired locks in this call are released (Rust's drop order) and `None` is
/// returned, so the caller re-queues the job at the head instead of holding a partial lock set.
pub fn try_lock_routers(lock_dir: &Path, routers: &[String]) -> Result<Option<Vec<RouterLock>>, SchedulerError> {
    let router_lock_dir = lock_dir.join("router");
    std::fs::create_dir_all(&router_lock_dir).map_err(|e| SchedulerError::LeaderLockFailed(e.to_string()))?;
    let mut locks = Vec::with_capacity(routers.len());
    for router in routers {
        let path = router_lock_dir.join(format!("{router}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .map_err(|e| SchedulerError::LeaderLockFailed(e.to_string()))?;
        match file.try_lock_exclusive() {
            Ok(()) => locks.push(RouterLock { _file: file, router: router.clone() }),
            Err(_) => return Ok(None),
        }
    }
    Ok(Some(locks))
}

/// Outcome of one worker's run, sent back to the leader loop over the result channel.
#[derive(Debug, Clone)]
pub struct WorkerResult {
    /// run_id of the completed job.
    pub run_id: String,
    /// DSCP codepoint to release, if this was a quick job.
    pub dscp: Option<Dscp>,
    /// Human-readable outcome, recorded in history.
    pub outcome: String,
}

/// Runs the leader loop: pop compatible jobs, allocate DSCP/locks, submit to a bounded worker
/// pool, reap completions. `run_job` is the Reachability Orchestrator entry point, injected so
/// this module stays free of the `tsim_fabric`/orchestrator-specific types; it is called on a
/// worker thread with the job and its allocated DSCP.
pub fn leader_loop(
    queue: &Queue,
    lock_dir: &Path,
    router_set_of: impl Fn(&Job) -> Vec<String>,
    run_job: impl Fn(Job, Option<Dscp>) -> String + Send + Sync + Clone + 'static,
    mut stopper: Stopper,
    max_iterations: Option<usize>,
) -> Result<Vec<WorkerResult>, SchedulerError> {
    let dscp_pool = Arc::new(DscpAllocator::new());
    let running: Arc<Mutex<Vec<RunningJob>>> = Arc::new(Mutex::new(Vec::new()));
    let held_locks: Arc<Mutex<std::collections::HashMap<String, Vec<RouterLock>>>> =
        Arc::new(Mutex::new(std::collections::HashMap::new()));
    let (result_tx, result_rx) = channel::<WorkerResult>();
    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    let mut results = Vec::new();

    let mut iterations = 0usize;
    loop {
        if stopper.try_is_stop().unwrap_or(false) {
            break;
        }
        if let Some(max) = max_iterations {
            if iterations >= max {
                break;
            }
        }
        iterations += 1;

        while let Ok(result) = result_rx.try_recv() {
            if let Some(dscp) = result.dscp {
                dscp_pool.release(dscp);
            }
            running.lock().unwrap().retain(|r| r.job.run_id != result.run_id);
            held_locks.lock().unwrap().remove(&result.run_id);
            results.push(result);
        }

        let queued = queue.snapshot()?;
        let running_snapshot = running.lock().unwrap().clone();
        if queued.is_empty() && running_snapshot.is_empty() {
            break;
        }

        let popped = pop_compatible(&queued, &running_snapshot, |j| router_set_of(j).into_iter().collect());
        for mut job in popped {
            let router_set = router_set_of(&job);
            let dscp = match job.mode {
                crate::queue::Mode::Quick => match dscp_pool.allocate() {
                    Some(d) => Some(d),
                    None => {
                        warn!("DSCP pool exhausted, leaving {} queued", job.run_id);
                        continue;
                    }
                },
                crate::queue::Mode::Detailed => {
                    match try_lock_routers(lock_dir, &router_set)? {
                        Some(locks) => {
                            held_locks.lock().unwrap().insert(job.run_id.clone(), locks);
                            None
                        }
                        None => {
                            queue.requeue_at_head(job.clone())?;
                            continue;
                        }
                    }
                }
            };

            queue.remove(&job.run_id)?;
            job.status = crate::queue::Status::Running;
            running.lock().unwrap().push(RunningJob { job: job.clone(), router_set, dscp });

            let tx: Sender<WorkerResult> = result_tx.clone();
            let run_job = run_job.clone();
            let run_id = job.run_id.clone();
            handles.push(spawn(move || {
                let outcome = run_job(job, dscp);
                let _ = tx.send(WorkerResult { run_id, dscp, outcome });
            }));
        }
    }

    for handle in handles {
        let _ = handle.join();
    }
    while let Ok(result) = result_rx.try_recv() {
        results.push(result);
    }
    info!("leader loop exiting after {iterations} iterations, {} jobs completed", results.len());
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dscp_allocator_exhausts_and_releases() {
        let pool = DscpAllocator::new();
        let mut allocated = Vec::new();
        for _ in DSCP_POOL_START..DSCP_POOL_END {
            allocated.push(pool.allocate().expect("pool should not be exhausted yet"));
        }
        assert!(pool.allocate().is_none());
        pool.release(allocated[0]);
        assert_eq!(pool.allocate(), Some(allocated[0]));
    }

    #[test]
    fn leader_lock_is_exclusive() {
        let dir = std::env::temp_dir().join(format!("tsim_leader_test_{}", std::process::id()));
        let first = try_become_leader(&dir).unwrap();
        assert!(first.is_some());
        let second = try_become_leader(&dir).unwrap();
        assert!(second.is_none(), "a second process must not also become leader");
        drop(first);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn router_locks_are_all_or_nothing() {
        let dir = std::env::temp_dir().join(format!("tsim_routerlock_test_{}", std::process::id()));
        let routers = vec!["hq-core".to_string(), "dc-core".to_string()];
        let first = try_lock_routers(&dir, &routers).unwrap();
        assert!(first.is_some());
        let second = try_lock_routers(&dir, &routers).unwrap();
        assert!(second.is_none());
        drop(first);
        std::fs::remove_dir_all(&dir).ok();
    }
}
