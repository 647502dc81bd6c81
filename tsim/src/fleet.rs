// Traceroute fleet simulator, adapted from Snowcap's network module (snowcap::netsim::network),
// which keeps the topology in a petgraph graph and exposes router lookups by name/id over it.
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

//! The `Fleet`: every router in a facts directory, connected by shared L2 subnets.

use crate::error::FactsError;
use crate::model::{RouterId, Router};
use ipnet::Ipv4Net;
use petgraph::stable_graph::StableUnGraph;
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// An edge of the fleet graph: the subnet two routers share an interface on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedSubnet(pub Ipv4Net);

/// The fleet graph and the lookup indices built on top of it by [`crate::facts::load_fleet`].
///
/// Routers are nodes; an edge between two routers means they have interfaces configured in the
/// same subnet (the L2 segment the Namespace Fabric Builder realizes as a bridge). Multi-router
/// segments (more than two routers sharing a subnet) are represented as a clique of edges, one per
/// pair, all carrying the same [`SharedSubnet`].
#[derive(Debug, Default)]
pub struct Fleet {
    graph: StableUnGraph<Router, SharedSubnet>,
    by_name: HashMap<String, RouterId>,
    /// Router address -> owning router, for locating where a probe source/destination lives.
    by_address: HashMap<Ipv4Addr, RouterId>,
    /// Subnet -> routers with an interface in it, used to resolve a next-hop IP to a router.
    by_subnet: Vec<(Ipv4Net, Vec<RouterId>)>,
}

impl Fleet {
    /// An empty fleet, as built up incrementally by the Facts Model loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully-constructed, already-validated router. Returns an error if another router
    /// with the same name already exists.
    pub fn add_router(&mut self, router: Router) -> Result<RouterId, FactsError> {
        if self.by_name.contains_key(router.name()) {
            return Err(FactsError::DuplicateRouter(router.name().to_string()));
        }
        let name = router.name().to_string();
        let id = self.graph.add_node(router);
        self.graph[id].set_router_id(id);
        self.by_name.insert(name, id);
        self.reindex_subnets();
        self.reindex_addresses();
        self.link_shared_subnets();
        Ok(id)
    }

    fn reindex_addresses(&mut self) {
        self.by_address.clear();
        for id in self.graph.node_indices() {
            let router = &self.graph[id];
            for iface in router.interfaces() {
                for addr in &iface.addresses {
                    self.by_address.insert(addr.addr(), id);
                }
            }
        }
    }

    fn reindex_subnets(&mut self) {
        let mut map: HashMap<Ipv4Net, Vec<RouterId>> = HashMap::new();
        for id in self.graph.node_indices() {
            let router = &self.graph[id];
            for iface in router.interfaces() {
                for addr in &iface.addresses {
                    let net = Ipv4Net::new(addr.network(), addr.prefix_len())
                        .unwrap_or(*addr);
                    map.entry(net).or_default().push(id);
                }
            }
        }
        self.by_subnet = map.into_iter().collect();
    }

    fn link_shared_subnets(&mut self) {
        for (net, routers) in self.by_subnet.clone() {
            for i in 0..routers.len() {
                for j in (i + 1)..routers.len() {
                    if self.graph.find_edge(routers[i], routers[j]).is_none() {
                        self.graph.add_edge(routers[i], routers[j], SharedSubnet(net));
                    }
                }
            }
        }
    }

    /// Look up a router by its configured name.
    pub fn router_id(&self, name: &str) -> Option<RouterId> {
        self.by_name.get(name).copied()
    }

    /// Borrow a router by id.
    pub fn router(&self, id: RouterId) -> Option<&Router> {
        self.graph.node_weight(id)
    }

    /// Mutably borrow a router by id (used to apply the Registry's short codes).
    pub fn router_mut(&mut self, id: RouterId) -> Option<&mut Router> {
        self.graph.node_weight_mut(id)
    }

    /// Find the router that owns `addr` as a configured interface address (local delivery).
    pub fn router_owning_address(&self, addr: Ipv4Addr) -> Option<RouterId> {
        self.by_address.get(&addr).copied()
    }

    /// Find the router that acts as the default gateway for `addr` (its subnet contains `addr`,
    /// but no interface carries it directly).
    pub fn router_owning_subnet(&self, addr: Ipv4Addr) -> Option<RouterId> {
        self.graph
            .node_indices()
            .find(|&id| self.graph[id].interface_for_subnet(addr).is_some())
    }

    /// Given a next-hop IP, find the fleet peer whose interface owns that address. Returns `None`
    /// when the next hop is outside the fleet (the path reaches the fleet edge).
    pub fn peer_for_next_hop(&self, next_hop: Ipv4Addr) -> Option<RouterId> {
        self.router_owning_address(next_hop)
    }

    /// All routers currently in the fleet.
    pub fn routers(&self) -> impl Iterator<Item = RouterId> + '_ {
        self.graph.node_indices()
    }

    /// Number of routers in the fleet.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// True if the fleet has no routers.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Neighboring routers reachable over a shared subnet.
    pub fn neighbors(&self, id: RouterId) -> impl Iterator<Item = RouterId> + '_ {
        self.graph.neighbors(id)
    }
}
