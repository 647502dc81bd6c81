// Traceroute fleet simulator. Runs a five-phase pipeline for one job, adapted from Snowcap's
// `Stopper`-guarded worker shape for the parallel-probe fan-out in phase 3.
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

//! Reachability Orchestrator: runs the five-phase pipeline for one job and assembles a Report.

use log::warn;
use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::time::Duration;
use tsim::analyzer::{analyze_delta, Mode as AnalyzerMode, Snapshot};
use tsim::fleet::Fleet;
use tsim::matcher::{Chain, DEFAULT_CHAIN_POLICY};
use tsim::model::iptables::{Table, Verdict};
use tsim::model::types::{Dscp, PacketTuple, Proto};
use tsim::path_planner::{plan_path, Path, DEFAULT_HOP_CAP};
use tsim_fabric::fabric::FabricBuilder;
use tsim_fabric::host_registry::HostRegistry;
use tsim_fabric::service_runner::{ProbeVerdict, ServiceRunner};

use crate::queue::{Job, PortProto};

/// Verdict of one probe kind in phase 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The probe completed and indicates the destination is reachable.
    Success,
    /// The probe completed and indicates the destination is unreachable.
    Failure,
    /// The probe did not complete before its timeout.
    Timeout,
}

/// Result of phase 3's parallel ping/traceroute/service fan-out.
#[derive(Debug, Clone)]
pub struct ProbeResults {
    /// ICMP echo outcome.
    pub ping: ProbeOutcome,
    /// Hop-by-hop trace outcome (always `Success` if any hop responded).
    pub traceroute: ProbeOutcome,
    /// Application-level service test outcome.
    pub service: ProbeOutcome,
}

/// One router's blocking/allowing verdict from phase 4.
#[derive(Debug, Clone)]
pub struct RouterVerdict {
    /// Router name.
    pub router: String,
    /// True if this router's counters show the probe was blocked.
    pub service_blocked: bool,
    /// Chain the matched rule lives in, if any.
    pub chain: Option<String>,
    /// Index of the matched rule within its chain, if any.
    pub rule_index: Option<usize>,
    /// Packets attributed to the matched rule during the probe window.
    pub delta_packets: u64,
}

/// The assembled result of [`run_reachability`].
#[derive(Debug, Clone)]
pub struct Report {
    /// True if the destination was judged reachable overall.
    pub reachable: bool,
    /// The planned forwarding path, if one was found.
    pub path: Option<Vec<String>>,
    /// Phase-3 probe results.
    pub probes: Option<ProbeResults>,
    /// Phase-4 per-router verdicts.
    pub router_verdicts: Vec<RouterVerdict>,
    /// Phase-level errors recorded but not fatal to the pipeline.
    pub phase_errors: Vec<String>,
}

/// Runs the five-phase reachability pipeline for `job`'s first `(port, proto)` pair (multi-port
/// jobs run one Report per pair; the scheduler calls this once per pair), releasing every
/// acquired host reference in a teardown step that always runs regardless of which phase failed.
#[allow(clippy::too_many_arguments)]
pub fn run_reachability(
    fleet: &Fleet,
    fabric: &FabricBuilder,
    host_registry: &HostRegistry,
    service_runner: &ServiceRunner,
    job: &Job,
    port: &PortProto,
    dscp: Option<Dscp>,
    probe_timeout: Duration,
) -> Report {
    let mut phase_errors = Vec::new();
    let mut acquired: Vec<(Ipv4Addr, String, String)> = Vec::new();

    // Phase 1: path discovery.
    let path: Option<Path> = match plan_path(fleet, job.src, job.dst, DEFAULT_HOP_CAP) {
        Ok(p) => Some(p),
        Err(e) => {
            phase_errors.push(format!("path discovery: {e}"));
            None
        }
    };
    let router_names: Vec<String> = path
        .as_ref()
        .map(|p| p.routers().filter_map(|id| fleet.router(id)).map(|r| r.name().to_string()).collect())
        .unwrap_or_default();

    // Phase 2: environment setup. Every (ip, router) pair on the path gets a host reference;
    // the namespace behind it is only actually created the first time a reference to that pair
    // is taken, `fabric.add_host` supplying the real namespace name in that case.
    let mut service_handle = None;
    if !router_names.is_empty() {
        for router in &router_names {
            for ip in [job.src, job.dst] {
                let add_err: RefCell<Option<String>> = RefCell::new(None);
                let (host_name, _created) = host_registry.acquire_host_ref(ip, router, || {
                    match fabric.add_host(&ip.to_string(), router) {
                        Ok(name) => name,
                        Err(e) => {
                            *add_err.borrow_mut() = Some(e.to_string());
                            format!("host-{ip}-{router}")
                        }
                    }
                });
                if let Some(e) = add_err.into_inner() {
                    phase_errors.push(format!("environment setup: add_host {ip}@{router}: {e}"));
                }
                acquired.push((ip, router.clone(), host_name));
            }
        }
        let dst_router = router_names.last().cloned();
        let dst_host = dst_router.and_then(|r| {
            acquired.iter().find(|(ip, rt, _)| *ip == job.dst && *rt == r).map(|(_, _, n)| n.clone())
        });
        if let Some(dst_host) = dst_host {
            match service_runner.start_service(&dst_host, job.dst, port.port, port.proto) {
                Ok(handle) => service_handle = Some(handle),
                Err(e) => phase_errors.push(format!("environment setup: {e}")),
            }
        } else {
            phase_errors.push("environment setup skipped: destination host not acquired".to_string());
        }
    } else {
        phase_errors.push("environment setup skipped: no path".to_string());
    }

    let src_router = router_names.first().cloned();
    let src_host = src_router.and_then(|r| {
        acquired.iter().find(|(ip, rt, _)| *ip == job.src && *rt == r).map(|(_, _, n)| n.clone())
    });

    // Phase 3: parallel probes.
    let probes = match (&service_handle, &src_host) {
        (Some(_), Some(src_host)) => {
            Some(run_parallel_probes(service_runner, src_host, job, port, probe_timeout, dscp))
        }
        _ => {
            phase_errors.push("probes skipped: service not started".to_string());
            None
        }
    };

    // Phase 4: packet-count analysis, one pass per router on the path, stopping at the first
    // router whose FORWARD chain drops or rejects the probe since the packet never reaches
    // anything downstream of it. `Chain::walk` needs a `&mut Router`, so each router is diffed
    // against its own clone rather than against the long-lived fleet the Fabric Builder also
    // borrows immutably for the lifetime of this call.
    let mut router_verdicts = Vec::new();
    if !router_names.is_empty() {
        let tuple = PacketTuple::new(job.src, job.dst, port.proto, job.sport.unwrap_or(0), port.port)
            .with_dscp(dscp.unwrap_or(0));
        for router_name in &router_names {
            let Some(router) = fleet.router_id(router_name).and_then(|id| fleet.router(id)) else {
                continue;
            };
            let mut probe_router = router.clone();
            let before = Snapshot::capture(&probe_router, Table::Filter);
            let verdict =
                Chain::new(&mut probe_router, Table::Filter).walk("FORWARD", &tuple, PROBE_PACKET_LEN, DEFAULT_CHAIN_POLICY);
            let after = Snapshot::capture(&probe_router, Table::Filter);
            let verdict = match verdict {
                Ok(v) => v,
                Err(e) => {
                    phase_errors.push(format!("packet-count analysis: {router_name}: {e}"));
                    continue;
                }
            };
            let blocked = matches!(verdict, Verdict::Drop | Verdict::Reject);
            let mode = if blocked { AnalyzerMode::Blocking } else { AnalyzerMode::Allowing };
            match analyze_delta(&probe_router, &before, &after, &tuple, Table::Filter, mode) {
                Some(m) => router_verdicts.push(RouterVerdict {
                    router: router_name.clone(),
                    service_blocked: blocked,
                    chain: Some(m.chain),
                    rule_index: Some(m.index),
                    delta_packets: m.delta_packets,
                }),
                None => router_verdicts.push(RouterVerdict {
                    router: router_name.clone(),
                    service_blocked: blocked,
                    chain: None,
                    rule_index: None,
                    delta_packets: 0,
                }),
            }
            if blocked {
                break;
            }
        }
    }

    // Phase 5: report assembly.
    let reachable = path.is_some()
        && probes.as_ref().map(|p| matches!(p.service, ProbeOutcome::Success)).unwrap_or(false)
        && !router_verdicts.iter().any(|v| v.service_blocked);

    let report = Report {
        reachable,
        path: if router_names.is_empty() { None } else { Some(router_names) },
        probes,
        router_verdicts,
        phase_errors,
    };

    // Teardown: always releases exactly what this job acquired, regardless of which phase
    // failed above. The namespace behind a (ip, router) pair is only actually removed once the
    // Host Registry reports no other reference remains.
    if let Some(handle) = service_handle {
        service_runner.stop_service(handle);
    }
    for (ip, router, host_name) in acquired {
        if host_registry.release_host_ref(ip, &router) {
            fabric.remove_host(&host_name, false);
        }
    }

    report
}

/// Packet length used for probe chain walks; matches a typical TCP SYN so rules keyed on packet
/// size see a realistic value.
const PROBE_PACKET_LEN: u64 = 64;

fn run_parallel_probes(
    service_runner: &ServiceRunner,
    src_host: &str,
    job: &Job,
    port: &PortProto,
    timeout: Duration,
    dscp: Option<Dscp>,
) -> ProbeResults {
    let mut ping = ProbeOutcome::Timeout;
    let mut traceroute = ProbeOutcome::Timeout;

    let service_verdict =
        std::thread::scope(|scope| {
            let ping_handle = scope.spawn(|| match service_runner.ping(src_host, job.dst, timeout) {
                Ok(true) => ProbeOutcome::Success,
                Ok(false) => ProbeOutcome::Failure,
                Err(e) => {
                    warn!("ping probe failed: {e}");
                    ProbeOutcome::Timeout
                }
            });
            let trace_handle = scope.spawn(|| {
                match service_runner.traceroute(src_host, job.dst, DEFAULT_HOP_CAP as u8) {
                    Ok(hops) if !hops.is_empty() => ProbeOutcome::Success,
                    Ok(_) => ProbeOutcome::Failure,
                    Err(e) => {
                        warn!("traceroute probe failed: {e}");
                        ProbeOutcome::Timeout
                    }
                }
            });

            let service_verdict =
                service_runner.test_service(src_host, job.dst, port.port, port.proto, timeout, dscp);

            ping = ping_handle.join().unwrap_or(ProbeOutcome::Timeout);
            traceroute = trace_handle.join().unwrap_or(ProbeOutcome::Timeout);
            service_verdict
        });

    let service = match service_verdict {
        ProbeVerdict::Ok => ProbeOutcome::Success,
        ProbeVerdict::Fail => ProbeOutcome::Failure,
        ProbeVerdict::Timeout => ProbeOutcome::Timeout,
        ProbeVerdict::Error => ProbeOutcome::Failure,
    };

    ProbeResults { ping, traceroute, service }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Mode;
    use std::collections::HashMap;
    use tsim::model::metadata::RouterMetadata;
    use tsim::model::router::{Interface, Router};
    use tsim::model::types::RouterId;
    use tsim_fabric::linux_ops::MockLinuxOps;
    use tsim_fabric::registry::Registry;

    fn single_router_fleet() -> Fleet {
        let mut fleet = Fleet::new();
        let router = Router::new(
            "gw".to_string(),
            RouterId::new(0),
            vec![
                Interface {
                    name: "eth0".to_string(),
                    code: None,
                    addresses: vec!["10.0.0.1/24".parse().unwrap()],
                    mtu: 1500,
                    up: true,
                },
            ],
            HashMap::new(),
            vec![],
            HashMap::new(),
            HashMap::new(),
            "*filter\n:FORWARD ACCEPT [0:0]\nCOMMIT\n".to_string(),
            String::new(),
            RouterMetadata::default(),
        );
        fleet.add_router(router).unwrap();
        fleet
    }

    #[test]
    fn teardown_releases_every_acquisition_even_when_unreachable() {
        let fleet = single_router_fleet();
        let ops = MockLinuxOps::new();
        let registry_path = std::env::temp_dir().join(format!("tsim_orch_registry_{}.json", std::process::id()));
        let registry = Registry::open(&registry_path).unwrap();
        let fabric = FabricBuilder::new(&fleet, &ops, &registry);
        let host_registry = HostRegistry::new();
        let service_runner = ServiceRunner::new(&ops);

        let job = Job {
            run_id: "r1".to_string(),
            username: "alice".to_string(),
            created_at: 0,
            mode: Mode::Quick,
            src: "10.0.0.1".parse().unwrap(),
            sport: None,
            dst: "10.0.0.99".parse().unwrap(),
            ports: vec![PortProto { port: 22, proto: Proto::Tcp }],
            status: crate::queue::Status::Running,
        };
        let report = run_reachability(
            &fleet,
            &fabric,
            &host_registry,
            &service_runner,
            &job,
            &job.ports[0],
            Some(40),
            Duration::from_millis(10),
        );

        assert!(!report.reachable);
        assert_eq!(host_registry.refcount(job.src, "gw"), 0);
        assert_eq!(host_registry.refcount(job.dst, "gw"), 0);

        std::fs::remove_file(&registry_path).ok();
    }

    fn iface(name: &str, cidr: &str) -> Interface {
        Interface { name: name.to_string(), code: None, addresses: vec![cidr.parse().unwrap()], mtu: 1500, up: true }
    }

    fn route(dest: &str, gateway: Option<&str>, dev: &str) -> tsim::model::route::Route {
        tsim::model::route::Route {
            dest: dest.parse().unwrap(),
            gateway: gateway.map(|g| g.parse().unwrap()),
            dev: dev.to_string(),
            src: None,
            table: tsim::model::types::MAIN_TABLE,
            metric: 0,
            protocol: "static".to_string(),
            scope: "global".to_string(),
        }
    }

    /// Two routers, `gw` dropping every forwarded TCP packet on its FORWARD chain so phase 4 has
    /// a real rule to attribute the probe to.
    fn two_router_fleet_with_drop() -> Fleet {
        use tsim::model::iptables::{IptablesRule, Predicate, Target};

        let mut fleet = Fleet::new();

        let mut gw_tables = HashMap::new();
        gw_tables.insert(
            tsim::model::types::MAIN_TABLE,
            vec![route("10.0.2.0/24", Some("10.0.0.2"), "eth0")],
        );
        let mut gw_iptables = HashMap::new();
        gw_iptables.insert(
            (Table::Filter, "FORWARD".to_string()),
            vec![IptablesRule {
                table: Table::Filter,
                chain: "FORWARD".to_string(),
                index: 0,
                predicates: vec![Predicate::Proto(Proto::Tcp)],
                target: Target::Drop,
                counters: Default::default(),
            }],
        );
        let gw = Router::new(
            "gw".to_string(),
            RouterId::new(0),
            vec![iface("eth0", "10.0.0.1/30"), iface("eth1", "10.0.1.1/24")],
            gw_tables,
            vec![],
            gw_iptables,
            HashMap::new(),
            String::new(),
            String::new(),
            RouterMetadata::default(),
        );

        let core = Router::new(
            "core".to_string(),
            RouterId::new(0),
            vec![iface("eth0", "10.0.0.2/30"), iface("eth1", "10.0.2.1/24")],
            HashMap::new(),
            vec![],
            HashMap::new(),
            HashMap::new(),
            String::new(),
            String::new(),
            RouterMetadata::default(),
        );

        fleet.add_router(gw).unwrap();
        fleet.add_router(core).unwrap();
        fleet
    }

    #[test]
    fn blocking_router_stops_the_walk_and_is_unreachable() {
        let fleet = two_router_fleet_with_drop();
        let ops = MockLinuxOps::new();
        let registry_path =
            std::env::temp_dir().join(format!("tsim_orch_registry_block_{}.json", std::process::id()));
        let registry = Registry::open(&registry_path).unwrap();
        let fabric = FabricBuilder::new(&fleet, &ops, &registry);
        let host_registry = HostRegistry::new();
        let service_runner = ServiceRunner::new(&ops);

        let job = Job {
            run_id: "r2".to_string(),
            username: "alice".to_string(),
            created_at: 0,
            mode: Mode::Quick,
            src: "10.0.1.5".parse().unwrap(),
            sport: None,
            dst: "10.0.2.5".parse().unwrap(),
            ports: vec![PortProto { port: 443, proto: Proto::Tcp }],
            status: crate::queue::Status::Running,
        };
        let report = run_reachability(
            &fleet,
            &fabric,
            &host_registry,
            &service_runner,
            &job,
            &job.ports[0],
            None,
            Duration::from_millis(10),
        );

        assert!(!report.reachable);
        assert_eq!(report.router_verdicts.len(), 1, "walk must stop at the blocking router");
        assert!(report.router_verdicts[0].service_blocked);
        assert_eq!(report.router_verdicts[0].router, "gw");
        assert_eq!(report.router_verdicts[0].delta_packets, 1);

        // Every add_host call this job made must be matched by a netns_del once released.
        let adds = ops.invocations().iter().filter(|i| i.op == "netns_add").count();
        let dels = ops.invocations().iter().filter(|i| i.op == "netns_del").count();
        assert!(adds > 0, "phase 2 must have realized at least one dynamic host");
        assert_eq!(adds, dels, "every realized host must be torn back down");

        std::fs::remove_file(&registry_path).ok();
    }
}
