// Traceroute fleet simulator
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

mod config;

use clap::{Parser, Subcommand};
use config::{exit_code_for_error, ConfigOverrides, TsimConfig};
use log::info;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tsim::model::types::Proto;
use tsim_fabric::fabric::FabricBuilder;
use tsim_fabric::host_registry::HostRegistry;
use tsim_fabric::linux_ops::SystemLinuxOps;
use tsim_fabric::registry::Registry;
use tsim_fabric::service_runner::ServiceRunner;
use tsim_scheduler::orchestrator::run_reachability;
use tsim_scheduler::queue::{Job, Mode, PortProto, Queue, Status};
use tsim_scheduler::scheduler::leader_loop;

/// Command-line entry point for the traceroute fleet simulator's symbolic engine, fabric
/// lifecycle, job queue, and scheduler.
#[derive(Parser, Debug)]
#[command(name = "tsim")]
struct Cli {
    /// Path to a JSON config file layering over the built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the facts directory (`TSIM_FACTS_DIR`).
    #[arg(long)]
    facts_dir: Option<PathBuf>,
    /// Override the data directory (`TSIM_DATA_DIR`).
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Override the log directory (`TSIM_LOG_DIR`).
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// Override the lock directory (`TSIM_LOCK_DIR`).
    #[arg(long)]
    lock_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate a facts directory without doing anything else.
    FactsLoad,
    /// Plan a symbolic forwarding path between two addresses and print the verdict and exit
    /// code, without touching the live fabric.
    Path {
        /// Source IPv4 address.
        src: Ipv4Addr,
        /// Destination IPv4 address.
        dst: Ipv4Addr,
    },
    /// Run a one-shot reachability test: realizes the hosts it needs on the live fabric, probes
    /// them, and tears them back down, printing the assembled report and exit code.
    Run {
        /// Source IPv4 address.
        src: Ipv4Addr,
        /// Destination IPv4 address.
        dst: Ipv4Addr,
        /// Destination port.
        port: u16,
        /// Source port; an ephemeral one is used if omitted.
        #[arg(long)]
        sport: Option<u16>,
        /// DSCP codepoint to tag the probe traffic with.
        #[arg(long)]
        dscp: Option<u8>,
        /// Per-probe timeout in milliseconds.
        #[arg(long, default_value_t = 2000)]
        timeout_ms: u64,
    },
    /// Bring up every router's namespace, veths, and restored rules.
    FabricUp,
    /// Tear down every router namespace and dynamic host created by this fabric.
    FabricDown,
    /// Append a job to the persistent queue.
    QueueEnqueue {
        /// Submitting username.
        username: String,
        /// Source IPv4 address.
        src: Ipv4Addr,
        /// Destination IPv4 address.
        dst: Ipv4Addr,
        /// Destination port.
        port: u16,
        /// Run every router on the path exclusively instead of sharing via DSCP tagging.
        #[arg(long)]
        detailed: bool,
    },
    /// Print the current queue contents.
    QueueStatus,
    /// Scheduler operations: leader election and the worker pool draining the job queue.
    Scheduler {
        #[command(subcommand)]
        action: SchedulerCommand,
    },
}

#[derive(Subcommand, Debug)]
enum SchedulerCommand {
    /// Run the foreground leader loop: pops compatible jobs off the queue and runs each through
    /// the Reachability Orchestrator until the queue drains or the process is asked to stop.
    Run {
        /// Stop after this many leader-loop iterations instead of running until the queue drains.
        #[arg(long)]
        max_iterations: Option<usize>,
    },
}

fn main() -> ExitCode {
    pretty_env_logger::init();
    let cli = Cli::parse();
    let config = TsimConfig::resolve(
        cli.config.as_deref(),
        ConfigOverrides {
            facts_dir: cli.facts_dir,
            data_dir: cli.data_dir,
            log_dir: cli.log_dir,
            lock_dir: cli.lock_dir,
        },
    );

    match run(&config, cli.command) {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(10)
        }
    }
}

fn run(config: &TsimConfig, command: Command) -> Result<config::ExitCode, tsim::Error> {
    match command {
        Command::FactsLoad => {
            let fleet = tsim::facts::load_fleet(&config.facts_dir)?;
            info!("loaded {} routers from {}", fleet.len(), config.facts_dir.display());
            Ok(config::ExitCode::Reachable)
        }
        Command::Path { src, dst } => {
            let fleet = tsim::facts::load_fleet(&config.facts_dir)?;
            match tsim::path_planner::plan_path(&fleet, src, dst, tsim::path_planner::DEFAULT_HOP_CAP) {
                Ok(path) => {
                    let names: Vec<&str> =
                        path.routers().filter_map(|id| fleet.router(id)).map(|r| r.name()).collect();
                    println!("{}", names.join(" -> "));
                    match path.outcome {
                        tsim::path_planner::PathOutcome::Delivered => Ok(config::ExitCode::Reachable),
                        tsim::path_planner::PathOutcome::ReachesFleetEdge => {
                            Ok(config::ExitCode::FleetEdgeReached)
                        }
                    }
                }
                Err(e) => {
                    let error = tsim::Error::Path(e);
                    let code = exit_code_for_error(&error);
                    eprintln!("{error}");
                    Ok(code)
                }
            }
        }
        Command::Run { src, dst, port, sport, dscp, timeout_ms } => {
            let fleet = tsim::facts::load_fleet(&config.facts_dir)?;
            let ops = SystemLinuxOps;
            let registry = Registry::open(config.data_dir.join("registry.json"))
                .map_err(tsim::Error::Fabric)?;
            let fabric = FabricBuilder::new(&fleet, &ops, &registry);
            let host_registry = HostRegistry::new();
            let service_runner = ServiceRunner::new(&ops);

            let job = Job {
                run_id: uuid::Uuid::new_v4().to_string(),
                username: std::env::var("USER").unwrap_or_else(|_| "cli".to_string()),
                created_at: unix_timestamp_now(),
                mode: Mode::Quick,
                src,
                sport,
                dst,
                ports: vec![PortProto { port, proto: Proto::Tcp }],
                status: Status::Running,
            };
            let report = run_reachability(
                &fleet,
                &fabric,
                &host_registry,
                &service_runner,
                &job,
                &job.ports[0],
                dscp,
                Duration::from_millis(timeout_ms),
            );

            if let Some(path) = &report.path {
                println!("path: {}", path.join(" -> "));
            } else {
                println!("path: none found");
            }
            if let Some(probes) = &report.probes {
                println!(
                    "probes: ping={:?} traceroute={:?} service={:?}",
                    probes.ping, probes.traceroute, probes.service
                );
            }
            for verdict in &report.router_verdicts {
                println!(
                    "router {}: blocked={} chain={:?} rule={:?} packets={}",
                    verdict.router, verdict.service_blocked, verdict.chain, verdict.rule_index,
                    verdict.delta_packets
                );
            }
            for error in &report.phase_errors {
                eprintln!("{error}");
            }
            println!("reachable: {}", report.reachable);

            Ok(if report.reachable { config::ExitCode::Reachable } else { config::ExitCode::NoPath })
        }
        Command::FabricUp => {
            let fleet = tsim::facts::load_fleet(&config.facts_dir)?;
            let ops = SystemLinuxOps;
            let registry = Registry::open(config.data_dir.join("registry.json"))
                .map_err(tsim::Error::Fabric)?;
            let fabric = FabricBuilder::new(&fleet, &ops, &registry);
            fabric.setup_fabric().map_err(tsim::Error::Fabric)?;
            Ok(config::ExitCode::Reachable)
        }
        Command::FabricDown => {
            let fleet = tsim::facts::load_fleet(&config.facts_dir)?;
            let ops = SystemLinuxOps;
            let registry = Registry::open(config.data_dir.join("registry.json"))
                .map_err(tsim::Error::Fabric)?;
            let fabric = FabricBuilder::new(&fleet, &ops, &registry);
            fabric.teardown_fabric();
            Ok(config::ExitCode::Reachable)
        }
        Command::QueueEnqueue { username, src, dst, port, detailed } => {
            let queue = Queue::open(config.data_dir.join("queue").join("queue.json"))
                .map_err(tsim::Error::Scheduler)?;
            let job = Job {
                run_id: uuid::Uuid::new_v4().to_string(),
                username,
                created_at: unix_timestamp_now(),
                mode: if detailed { Mode::Detailed } else { Mode::Quick },
                src,
                sport: None,
                dst,
                ports: vec![PortProto { port, proto: tsim::model::types::Proto::Tcp }],
                status: Status::Queued,
            };
            println!("{}", job.run_id);
            queue.enqueue(job).map_err(tsim::Error::Scheduler)?;
            Ok(config::ExitCode::Reachable)
        }
        Command::QueueStatus => {
            let queue = Queue::open(config.data_dir.join("queue").join("queue.json"))
                .map_err(tsim::Error::Scheduler)?;
            let jobs = queue.snapshot().map_err(tsim::Error::Scheduler)?;
            for job in jobs {
                println!("{} {} {}->{} {:?}", job.run_id, job.username, job.src, job.dst, job.status);
            }
            Ok(config::ExitCode::Reachable)
        }
        Command::Scheduler { action: SchedulerCommand::Run { max_iterations } } => {
            // The leader loop's run_job closure must be 'static; the fleet, fabric, host
            // registry and service runner it drives outlive every job this process ever runs,
            // so leaking them for the process lifetime is simpler than threading an Arc through
            // four layers of non-'static borrows.
            let fleet: &'static tsim::fleet::Fleet =
                Box::leak(Box::new(tsim::facts::load_fleet(&config.facts_dir)?));
            let ops: &'static SystemLinuxOps = Box::leak(Box::new(SystemLinuxOps));
            let registry: &'static Registry = Box::leak(Box::new(
                Registry::open(config.data_dir.join("registry.json")).map_err(tsim::Error::Fabric)?,
            ));
            let fabric: &'static FabricBuilder<'static> =
                Box::leak(Box::new(FabricBuilder::new(fleet, ops, registry)));
            let host_registry: &'static HostRegistry = Box::leak(Box::new(HostRegistry::new()));
            let service_runner: &'static ServiceRunner<'static> =
                Box::leak(Box::new(ServiceRunner::new(ops)));
            let probe_timeout = Duration::from_millis(2000);

            let queue = Queue::open(config.data_dir.join("queue").join("queue.json"))
                .map_err(tsim::Error::Scheduler)?;

            let router_set_of = |job: &Job| -> Vec<String> {
                tsim::path_planner::plan_path(fleet, job.src, job.dst, tsim::path_planner::DEFAULT_HOP_CAP)
                    .map(|p| {
                        p.routers().filter_map(|id| fleet.router(id)).map(|r| r.name().to_string()).collect()
                    })
                    .unwrap_or_default()
            };
            let run_job = move |job: Job, dscp: Option<tsim::model::types::Dscp>| -> String {
                let mut outcome = "no ports".to_string();
                for port in &job.ports {
                    let report = run_reachability(
                        fleet,
                        fabric,
                        host_registry,
                        service_runner,
                        &job,
                        port,
                        dscp,
                        probe_timeout,
                    );
                    outcome = if report.reachable { "reachable".to_string() } else { "unreachable".to_string() };
                }
                outcome
            };

            let results = leader_loop(
                &queue,
                &config.lock_dir,
                router_set_of,
                run_job,
                tsim::Stopper::new(),
                max_iterations,
            )
            .map_err(tsim::Error::Scheduler)?;
            for result in &results {
                println!("{} dscp={:?} {}", result.run_id, result.dscp, result.outcome);
            }
            Ok(config::ExitCode::Reachable)
        }
    }
}

fn unix_timestamp_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
