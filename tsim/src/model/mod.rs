// Traceroute fleet simulator, adapted from Snowcap's netsim module layout, which groups the
// network's data model (router, types, route-map) under one submodule tree.
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

//! Pure data model: routers, interfaces, routes, policy rules, and iptables/ipset facts.
//!
//! Nothing in this module touches the filesystem or a subprocess; it is the shape that
//! [`crate::facts`] parses into and that [`crate::matcher`], [`crate::routing`] and
//! [`crate::path_planner`] operate over.

pub mod ipset;
pub mod iptables;
pub mod metadata;
pub mod route;
pub mod router;
pub mod types;

pub use ipset::{Ipset, IpsetMember, IpsetType, SetElem};
pub use iptables::{Counters, IptablesRule, Predicate, SetDirection, Table, Target, Verdict};
pub use metadata::{Role, RouterMetadata};
pub use route::{PolicyRule, Route};
pub use router::{Interface, Router};
pub use types::{
    net_contains, Dscp, PacketTuple, PortRange, Proto, RouterId, TableId, DSCP_POOL_END,
    DSCP_POOL_START, MAIN_TABLE,
};
