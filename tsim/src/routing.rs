// Traceroute fleet simulator, adapted from Snowcap's forwarding-state route selection
// (snowcap::netsim::forwarding_state), which ranks candidate routes by prefix length then metric
// before picking a next hop.
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

//! Routing Engine: policy-rule dispatch followed by longest-prefix-match route selection.

use crate::model::route::Route;
use crate::model::router::Router;
use crate::model::types::{PacketTuple, MAIN_TABLE};
use std::net::Ipv4Addr;

/// Where a forwarded packet goes next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Forward {
    /// The destination is configured on one of the router's own interfaces.
    LocalDelivery,
    /// The packet is forwarded via `next_hop` out of `out_iface`.
    NextHop {
        /// IP address of the next hop (the packet's destination, for directly-connected routes).
        next_hop: Ipv4Addr,
        /// Egress interface name.
        out_iface: String,
    },
    /// No route matched in the selected table.
    NoRoute,
}

/// Run policy-rule dispatch then longest-prefix match for `tuple` on `router`.
///
/// Policy rules are evaluated in priority order (ascending, as stored by [`Router::policy_rules`]
/// which sorts on construction); the first match selects a table. If no policy rule matches, the
/// main table (254) is used. Candidates in the selected table are ranked by longest prefix, ties
/// broken by lowest metric, then by original insertion order (a stable sort preserves that for
/// equal prefix+metric).
pub fn forward(router: &Router, tuple: &PacketTuple) -> Forward {
    if router.owns_address(tuple.dst) {
        return Forward::LocalDelivery;
    }

    let table_id = router
        .policy_rules()
        .iter()
        .find(|rule| {
            rule.matches(
                tuple.src,
                tuple.dst,
                tuple.fwmark,
                tuple.dscp,
                tuple.in_iface.as_deref(),
                tuple.out_iface.as_deref(),
            )
        })
        .map(|rule| rule.table)
        .unwrap_or(MAIN_TABLE);

    let routes = router.table(table_id);
    match select_route(routes, tuple.dst) {
        Some(route) => {
            let next_hop = route.gateway.unwrap_or(tuple.dst);
            Forward::NextHop { next_hop, out_iface: route.dev.clone() }
        }
        None => Forward::NoRoute,
    }
}

/// Pick the best matching route for `dst`: longest prefix first, then lowest metric, then
/// earliest declaration (a stable sort of the candidates already preserves declaration order for
/// ties on both preceding keys).
fn select_route(routes: &[Route], dst: Ipv4Addr) -> Option<&Route> {
    let mut candidates: Vec<&Route> = routes.iter().filter(|r| r.dest.contains(&dst)).collect();
    candidates.sort_by(|a, b| {
        b.prefix_len().cmp(&a.prefix_len()).then_with(|| a.metric.cmp(&b.metric))
    });
    candidates.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipnet::Ipv4Net;

    fn route(dest: &str, gateway: Option<&str>, dev: &str, metric: u32) -> Route {
        Route {
            dest: dest.parse().unwrap(),
            gateway: gateway.map(|g| g.parse().unwrap()),
            dev: dev.to_string(),
            src: None,
            table: MAIN_TABLE,
            metric,
            protocol: "static".to_string(),
            scope: "global".to_string(),
        }
    }

    #[test]
    fn longest_prefix_beats_default() {
        let routes = vec![
            route("0.0.0.0/0", Some("10.0.0.1"), "eth0", 0),
            route("192.168.1.0/24", Some("10.0.0.2"), "eth1", 0),
        ];
        let picked = select_route(&routes, "192.168.1.5".parse().unwrap()).unwrap();
        assert_eq!(picked.dev, "eth1");
    }

    #[test]
    fn lowest_metric_breaks_prefix_tie() {
        let routes = vec![
            route("10.0.0.0/24", Some("10.0.0.1"), "eth0", 10),
            route("10.0.0.0/24", Some("10.0.0.2"), "eth1", 5),
        ];
        let picked = select_route(&routes, "10.0.0.5".parse().unwrap()).unwrap();
        assert_eq!(picked.dev, "eth1");
    }

    #[test]
    fn no_match_is_no_route() {
        let routes = vec![route("10.0.0.0/24", Some("10.0.0.1"), "eth0", 0)];
        assert!(select_route(&routes, "192.168.1.5".parse::<Ipv4Addr>().unwrap()).is_none());
    }
}
