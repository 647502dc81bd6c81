// Traceroute fleet simulator. Exercises the scheduler-level scenarios of this workspace's leader
// loop end to end against a real file-backed Queue.
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

use std::collections::HashMap;
use std::sync::{Arc, Barrier, Mutex};
use std::time::{Duration, Instant};
use tsim::Stopper;
use tsim_scheduler::queue::{Job, Mode, PortProto, Queue, Status};
use tsim_scheduler::scheduler::leader_loop;

fn temp_queue(label: &str) -> Queue {
    let path = std::env::temp_dir().join(format!("tsim_scenarios_{label}_{}.json", std::process::id()));
    std::fs::remove_file(&path).ok();
    Queue::open(path).unwrap()
}

fn temp_lock_dir(label: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("tsim_scenarios_locks_{label}_{}", std::process::id()));
    std::fs::remove_dir_all(&dir).ok();
    dir
}

fn quick_job(run_id: &str, port: u16) -> Job {
    Job {
        run_id: run_id.to_string(),
        username: "alice".to_string(),
        created_at: 0,
        mode: Mode::Quick,
        src: "10.1.1.1".parse().unwrap(),
        sport: None,
        dst: "10.1.2.1".parse().unwrap(),
        ports: vec![PortProto { port, proto: tsim::model::types::Proto::Tcp }],
        status: Status::Queued,
    }
}

fn detailed_job(run_id: &str) -> Job {
    Job {
        run_id: run_id.to_string(),
        username: "bob".to_string(),
        created_at: 0,
        mode: Mode::Detailed,
        src: "10.1.1.100".parse().unwrap(),
        sport: None,
        dst: "10.3.20.100".parse().unwrap(),
        ports: vec![PortProto { port: 80, proto: tsim::model::types::Proto::Tcp }],
        status: Status::Queued,
    }
}

/// S5: two quick jobs with disjoint port sets between the same S,D run simultaneously under
/// distinct DSCP codepoints.
#[test]
fn s5_parallel_quick_jobs_get_distinct_dscp() {
    let queue = temp_queue("s5");
    let lock_dir = temp_lock_dir("s5");
    queue.enqueue(quick_job("q1", 22)).unwrap();
    queue.enqueue(quick_job("q2", 443)).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let seen: Arc<Mutex<Vec<(String, Option<u8>)>>> = Arc::new(Mutex::new(Vec::new()));

    let barrier_for_job = barrier.clone();
    let seen_for_job = seen.clone();
    let run_job = move |job: Job, dscp: Option<u8>| {
        seen_for_job.lock().unwrap().push((job.run_id.clone(), dscp));
        // Both jobs must reach this point before either proceeds, proving they ran concurrently.
        barrier_for_job.wait();
        "reachable".to_string()
    };

    let results =
        leader_loop(&queue, &lock_dir, |_| vec!["hq-core".to_string()], run_job, Stopper::new(), Some(10_000))
            .unwrap();

    assert_eq!(results.len(), 2);
    let dscps: Vec<Option<u8>> = seen.lock().unwrap().iter().map(|(_, d)| *d).collect();
    assert!(dscps.iter().all(Option::is_some), "both quick jobs must be assigned a DSCP codepoint");
    assert_ne!(dscps[0], dscps[1], "concurrent quick jobs must not share a DSCP codepoint");

    std::fs::remove_dir_all(&lock_dir).ok();
}

/// S6: two detailed jobs whose router sets both contain hq-core; the second must stay queued
/// until the first has finished running, never executing concurrently with it.
#[test]
fn s6_detailed_job_queues_behind_running_detailed() {
    let queue = temp_queue("s6");
    let lock_dir = temp_lock_dir("s6");
    queue.enqueue(detailed_job("d1")).unwrap();
    queue.enqueue(detailed_job("d2")).unwrap();

    let spans: Arc<Mutex<HashMap<String, (Instant, Instant)>>> = Arc::new(Mutex::new(HashMap::new()));
    let spans_for_job = spans.clone();
    let run_job = move |job: Job, _dscp: Option<u8>| {
        let start = Instant::now();
        if job.run_id == "d1" {
            std::thread::sleep(Duration::from_millis(60));
        }
        let end = Instant::now();
        spans_for_job.lock().unwrap().insert(job.run_id.clone(), (start, end));
        "reachable".to_string()
    };

    let results = leader_loop(
        &queue,
        &lock_dir,
        |_| vec!["hq-core".to_string()],
        run_job,
        Stopper::new(),
        Some(100_000),
    )
    .unwrap();

    assert_eq!(results.len(), 2);
    let spans = spans.lock().unwrap();
    let (_, d1_end) = spans["d1"];
    let (d2_start, _) = spans["d2"];
    assert!(d2_start >= d1_end, "d2 must not start until d1, sharing hq-core, has finished");

    std::fs::remove_dir_all(&lock_dir).ok();
}
