// Traceroute fleet simulator, adapted from Snowcap's forwarding-state cache
// (snowcap::netsim::forwarding_state::ForwardingState), which walks router-by-router accumulating
// a path and classifies the outcome as a valid path, a forwarding loop, or a blackhole.
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

//! Path Planner: computes the hop-by-hop forwarding path between two hosts without touching
//! iptables.

use crate::error::PathError;
use crate::fleet::Fleet;
use crate::model::types::{PacketTuple, Proto, RouterId};
use crate::routing::{forward, Forward};
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Default hard cap on the number of hops a path may contain before planning gives up.
pub const DEFAULT_HOP_CAP: usize = 30;

/// One hop of a planned path: the router visited and the interface the packet left on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    /// Router visited at this hop.
    pub router: RouterId,
    /// Router name, kept alongside the id for reporting without a further fleet lookup.
    pub router_name: String,
    /// Egress interface used to leave this router, `None` for the terminal hop (local delivery).
    pub out_iface: Option<String>,
}

/// Terminal classification of a planned path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathOutcome {
    /// The path reaches a router that owns D.
    Delivered,
    /// The path exits the fleet: the last hop's next-hop IP has no owning router.
    ReachesFleetEdge,
}

/// A fully planned path from S to D.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    /// Source address the path was planned for.
    pub source: Ipv4Addr,
    /// Destination address the path was planned for.
    pub destination: Ipv4Addr,
    /// Hops visited in order.
    pub hops: Vec<Hop>,
    /// How the path terminated.
    pub outcome: PathOutcome,
}

impl Path {
    /// Router ids visited by this path, in order.
    pub fn routers(&self) -> impl Iterator<Item = RouterId> + '_ {
        self.hops.iter().map(|h| h.router)
    }
}

/// Plan the forwarding path from `source` to `destination` through `fleet`.
///
/// Locates the router owning `source` (directly, or as the gateway of `source`'s subnet), then
/// repeatedly runs the Routing Engine and follows the resulting next hop to the connected router
/// via the shared-subnet index, until the destination is locally delivered, the path leaves the
/// fleet, a loop is detected, or `hop_cap` is exceeded. This planner never evaluates iptables;
/// whether a path is actually blocked is decided by live packet-count analysis.
pub fn plan_path(
    fleet: &Fleet,
    source: Ipv4Addr,
    destination: Ipv4Addr,
    hop_cap: usize,
) -> Result<Path, PathError> {
    let start = fleet
        .router_owning_address(source)
        .or_else(|| fleet.router_owning_subnet(source))
        .ok_or_else(|| PathError::UnknownSource(source.to_string()))?;

    let mut hops = Vec::new();
    let mut visited: HashSet<(RouterId, String)> = HashSet::new();
    let mut current = start;
    let probe = PacketTuple::new(source, destination, Proto::Icmp, 0, 0);

    loop {
        if hops.len() >= hop_cap {
            return Err(PathError::HopCapExceeded(hop_cap));
        }
        let router = fleet.router(current).ok_or_else(|| {
            PathError::InvalidProbe(format!("router id {current:?} vanished mid-plan"))
        })?;

        match forward(router, &probe) {
            Forward::LocalDelivery => {
                hops.push(Hop {
                    router: current,
                    router_name: router.name().to_string(),
                    out_iface: None,
                });
                return Ok(Path { source, destination, hops, outcome: PathOutcome::Delivered });
            }
            Forward::NoRoute => {
                return Err(PathError::Blackhole(router.name().to_string(), destination.to_string()))
            }
            Forward::NextHop { next_hop, out_iface } => {
                let key = (current, out_iface.clone());
                if !visited.insert(key) {
                    return Err(PathError::ForwardingLoop(
                        router.name().to_string(),
                        destination.to_string(),
                    ));
                }
                hops.push(Hop {
                    router: current,
                    router_name: router.name().to_string(),
                    out_iface: Some(out_iface),
                });

                match fleet.peer_for_next_hop(next_hop) {
                    Some(peer) => current = peer,
                    None => {
                        return Ok(Path {
                            source,
                            destination,
                            hops,
                            outcome: PathOutcome::ReachesFleetEdge,
                        })
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::metadata::RouterMetadata;
    use crate::model::router::{Interface, Router};
    use std::collections::HashMap;

    fn iface(name: &str, cidr: &str) -> Interface {
        Interface { name: name.to_string(), code: None, addresses: vec![cidr.parse().unwrap()], mtu: 1500, up: true }
    }

    fn route(dest: &str, gateway: Option<&str>, dev: &str) -> crate::model::route::Route {
        crate::model::route::Route {
            dest: dest.parse().unwrap(),
            gateway: gateway.map(|g| g.parse().unwrap()),
            dev: dev.to_string(),
            src: None,
            table: crate::model::types::MAIN_TABLE,
            metric: 0,
            protocol: "static".to_string(),
            scope: "global".to_string(),
        }
    }

    fn bare_router(name: &str, ifaces: Vec<Interface>, routes: Vec<crate::model::route::Route>) -> Router {
        let mut tables = HashMap::new();
        tables.insert(crate::model::types::MAIN_TABLE, routes);
        Router::new(
            name.to_string(),
            RouterId::new(0),
            ifaces,
            tables,
            vec![],
            HashMap::new(),
            HashMap::new(),
            String::new(),
            String::new(),
            RouterMetadata::default(),
        )
    }

    #[test]
    fn two_hop_path_is_delivered() {
        let mut fleet = Fleet::new();
        let gw = bare_router(
            "gw",
            vec![iface("eth0", "10.0.0.1/30"), iface("eth1", "10.0.1.1/24")],
            vec![route("10.0.2.0/24", Some("10.0.0.2"), "eth0")],
        );
        let core = bare_router(
            "core",
            vec![iface("eth0", "10.0.0.2/30"), iface("eth1", "10.0.2.1/24")],
            vec![],
        );
        fleet.add_router(gw).unwrap();
        fleet.add_router(core).unwrap();

        let path = plan_path(&fleet, "10.0.1.5".parse().unwrap(), "10.0.2.5".parse().unwrap(), DEFAULT_HOP_CAP)
            .unwrap();
        assert_eq!(path.outcome, PathOutcome::Delivered);
        assert_eq!(path.hops.len(), 2);
        assert_eq!(path.hops[0].router_name, "gw");
        assert_eq!(path.hops[1].router_name, "core");
    }

    #[test]
    fn blackhole_when_no_route_matches() {
        let mut fleet = Fleet::new();
        let gw = bare_router("gw", vec![iface("eth1", "10.0.1.1/24")], vec![]);
        fleet.add_router(gw).unwrap();

        let err = plan_path(&fleet, "10.0.1.5".parse().unwrap(), "192.168.9.9".parse().unwrap(), DEFAULT_HOP_CAP)
            .unwrap_err();
        assert!(matches!(err, PathError::Blackhole(_, _)));
    }
}
