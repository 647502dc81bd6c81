// Traceroute fleet simulator. Exercises the end-to-end scenarios a four-router fleet (hq-gw,
// hq-core, br-gw, dc-core) is expected to produce across the path planner and packet-count
// analyzer.
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

use std::collections::HashMap;
use tsim::analyzer::{analyze_delta, Mode, Snapshot};
use tsim::fleet::Fleet;
use tsim::matcher::Chain;
use tsim::model::iptables::{Counters, IptablesRule, Predicate, Table, Target, Verdict};
use tsim::model::metadata::{Role, RouterMetadata};
use tsim::model::route::Route;
use tsim::model::router::{Interface, Router};
use tsim::model::types::{PacketTuple, PortRange, Proto, RouterId, MAIN_TABLE};
use tsim::path_planner::{plan_path, PathOutcome, DEFAULT_HOP_CAP};

fn iface(name: &str, cidr: &str) -> Interface {
    Interface { name: name.to_string(), code: None, addresses: vec![cidr.parse().unwrap()], mtu: 1500, up: true }
}

fn route(dest: &str, gateway: Option<&str>, dev: &str) -> Route {
    Route {
        dest: dest.parse().unwrap(),
        gateway: gateway.map(|g| g.parse().unwrap()),
        dev: dev.to_string(),
        src: None,
        table: MAIN_TABLE,
        metric: 0,
        protocol: "static".to_string(),
        scope: "global".to_string(),
    }
}

fn router_with(
    name: &str,
    ifaces: Vec<Interface>,
    routes: Vec<Route>,
    iptables: HashMap<(Table, String), Vec<IptablesRule>>,
    role: Role,
) -> Router {
    let mut tables = HashMap::new();
    tables.insert(MAIN_TABLE, routes);
    Router::new(
        name.to_string(),
        RouterId::new(0),
        ifaces,
        tables,
        vec![],
        iptables,
        HashMap::new(),
        String::new(),
        String::new(),
        RouterMetadata { role, ..RouterMetadata::default() },
    )
}

/// The fleet spans two sites (hq, br) joined by a VPN tunnel, and a WAN link to a third site
/// (dc) whose core router drops cross-site traffic to one subnet.
fn test_fleet() -> Fleet {
    let mut fleet = Fleet::new();

    let hq_gw = router_with(
        "hq-gw",
        vec![
            iface("eth0", "10.1.1.1/24"),
            iface("eth1", "10.1.100.1/30"),
            iface("wg0", "10.1.200.1/30"),
        ],
        vec![
            route("10.1.2.0/24", Some("10.1.100.2"), "eth1"),
            route("10.3.0.0/16", Some("10.1.100.2"), "eth1"),
            route("10.2.0.0/16", Some("10.1.200.2"), "wg0"),
            route("0.0.0.0/0", Some("203.0.113.1"), "eth2"),
        ],
        HashMap::new(),
        Role::Gateway,
    );

    let hq_core = router_with(
        "hq-core",
        vec![iface("eth0", "10.1.100.2/30"), iface("eth1", "10.1.2.1/24"), iface("eth2", "10.9.9.1/30")],
        vec![route("10.3.0.0/16", Some("10.9.9.2"), "eth2")],
        HashMap::new(),
        Role::Core,
    );

    let br_gw = router_with(
        "br-gw",
        vec![iface("wg0", "10.1.200.2/30"), iface("eth0", "10.2.1.1/24")],
        vec![],
        HashMap::new(),
        Role::Gateway,
    );

    let dc_drop_rule = IptablesRule {
        table: Table::Filter,
        chain: "FORWARD".to_string(),
        index: 0,
        predicates: vec![
            Predicate::SrcCidr("10.1.0.0/16".parse().unwrap()),
            Predicate::DstCidr("10.3.20.0/24".parse().unwrap()),
            Predicate::Proto(Proto::Tcp),
            Predicate::Dport(PortRange::exact(80)),
        ],
        target: Target::Drop,
        counters: Counters::default(),
    };
    let mut dc_core_iptables = HashMap::new();
    dc_core_iptables.insert((Table::Filter, "FORWARD".to_string()), vec![dc_drop_rule]);

    let dc_core = router_with(
        "dc-core",
        vec![iface("eth0", "10.9.9.2/30"), iface("eth1", "10.3.20.100/24")],
        vec![],
        dc_core_iptables,
        Role::Core,
    );

    fleet.add_router(hq_gw).unwrap();
    fleet.add_router(hq_core).unwrap();
    fleet.add_router(br_gw).unwrap();
    fleet.add_router(dc_core).unwrap();
    fleet
}

#[test]
fn s1_intra_location_reachable() {
    let fleet = test_fleet();
    let path = plan_path(&fleet, "10.1.1.1".parse().unwrap(), "10.1.2.1".parse().unwrap(), DEFAULT_HOP_CAP)
        .unwrap();
    assert_eq!(path.outcome, PathOutcome::Delivered);
    let names: Vec<&str> = path.hops.iter().map(|h| h.router_name.as_str()).collect();
    assert_eq!(names, vec!["hq-gw", "hq-core"]);
}

#[test]
fn s2_inter_location_via_vpn() {
    let fleet = test_fleet();
    let path = plan_path(&fleet, "10.1.1.1".parse().unwrap(), "10.2.1.1".parse().unwrap(), DEFAULT_HOP_CAP)
        .unwrap();
    assert_eq!(path.outcome, PathOutcome::Delivered);
    assert_eq!(path.hops[0].router_name, "hq-gw");
    assert_eq!(path.hops[0].out_iface.as_deref(), Some("wg0"));
    assert_eq!(path.hops.last().unwrap().router_name, "br-gw");
}

#[test]
fn s3_blocked_across_wan() {
    let mut fleet = test_fleet();
    let src = "10.1.1.100".parse().unwrap();
    let dst = "10.3.20.100".parse().unwrap();

    let path = plan_path(&fleet, src, dst, DEFAULT_HOP_CAP).unwrap();
    assert_eq!(path.outcome, PathOutcome::Delivered);
    assert_eq!(path.hops.last().unwrap().router_name, "dc-core");

    let dc_core_id = fleet.router_id("dc-core").unwrap();
    let probe = PacketTuple::new(src, dst, Proto::Tcp, 54321, 80);

    let before = Snapshot::capture(fleet.router(dc_core_id).unwrap(), Table::Filter);
    {
        let dc_core = fleet.router_mut(dc_core_id).unwrap();
        let mut chain = Chain::new(dc_core, Table::Filter);
        let verdict = chain.walk("FORWARD", &probe, 64, Verdict::Accept).unwrap();
        assert_eq!(verdict, Verdict::Drop);
    }
    let after = Snapshot::capture(fleet.router(dc_core_id).unwrap(), Table::Filter);

    let hit = analyze_delta(fleet.router(dc_core_id).unwrap(), &before, &after, &probe, Table::Filter, Mode::Blocking)
        .expect("dc-core's DROP rule should be attributed");
    assert_eq!(hit.chain, "FORWARD");
    assert!(hit.delta_packets >= 1);

    let rule = &fleet.router(dc_core_id).unwrap().chain(Table::Filter, "FORWARD")[hit.index];
    assert!(rule.predicates.contains(&Predicate::SrcCidr("10.1.0.0/16".parse().unwrap())));
    assert!(rule.predicates.contains(&Predicate::DstCidr("10.3.20.0/24".parse().unwrap())));
}

#[test]
fn s4_external_fallback_reaches_fleet_edge() {
    let fleet = test_fleet();
    let path = plan_path(&fleet, "10.1.1.1".parse().unwrap(), "8.8.8.8".parse().unwrap(), DEFAULT_HOP_CAP)
        .unwrap();
    assert_eq!(path.outcome, PathOutcome::ReachesFleetEdge);
    let last = path.hops.last().unwrap();
    assert_eq!(last.router_name, "hq-gw");
    let hq_gw = fleet.router(fleet.router_id("hq-gw").unwrap()).unwrap();
    assert_eq!(hq_gw.metadata().role, Role::Gateway);
}
