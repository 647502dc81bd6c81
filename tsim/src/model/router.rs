// Traceroute fleet simulator, adapted from Snowcap's router model (snowcap::netsim::router),
// which holds one router's parsed-and-validated configuration state behind a narrow accessor API.
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

//! One router's immutable-after-load facts: interfaces, routing tables, policy rules, and
//! iptables/ipset state.

use crate::error::FactsError;
use crate::model::ipset::Ipset;
use crate::model::iptables::{IptablesRule, Table};
use crate::model::metadata::RouterMetadata;
use crate::model::route::{PolicyRule, Route};
use crate::model::types::{RouterId, TableId, MAIN_TABLE};
use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// One interface of a router, as declared in the facts directory.
#[derive(Debug, Clone, PartialEq)]
pub struct Interface {
    /// Logical interface name (`eth0`, `wg0`, ...).
    pub name: String,
    /// Short kernel-safe code assigned by the shared Registry (`iNNN`); `None` until registered.
    pub code: Option<String>,
    /// Addresses configured on this interface, each with its prefix length.
    pub addresses: Vec<Ipv4Net>,
    /// MTU, in bytes.
    pub mtu: u32,
    /// Whether the interface is administratively up.
    pub up: bool,
}

impl Interface {
    /// Returns true if `addr` is configured on this interface.
    pub fn has_address(&self, addr: Ipv4Addr) -> bool {
        self.addresses.iter().any(|n| n.addr() == addr)
    }

    /// Returns true if `addr` falls within one of this interface's subnets.
    pub fn subnet_contains(&self, addr: Ipv4Addr) -> bool {
        self.addresses.iter().any(|n| n.contains(&addr))
    }
}

/// One router's complete, parsed and validated facts.
///
/// Parsing is strict (the Facts Model rejects unknown stanzas and non-dense rule indices); once
/// loaded, a `Router` is never mutated by the symbolic engine except for iptables counters, which
/// [`crate::matcher::Chain::walk`] updates in place during a probe. The live Namespace Fabric
/// Builder realizes kernel state from the verbatim `iptables_save`/`ipset_save` text carried here,
/// not from this parsed form.
#[derive(Debug, Clone)]
pub struct Router {
    name: String,
    router_id: RouterId,
    /// Short kernel-safe code assigned by the shared Registry (`rNNN`).
    code: Option<String>,
    interfaces: Vec<Interface>,
    routing_tables: HashMap<TableId, Vec<Route>>,
    /// Policy rules, kept sorted ascending by priority.
    policy_rules: Vec<PolicyRule>,
    /// `(table, chain) -> rules`, each inner vector ordered by `IptablesRule::index`.
    iptables: HashMap<(Table, String), Vec<IptablesRule>>,
    ipsets: HashMap<String, Ipset>,
    /// Verbatim `iptables-save` text, fed to `iptables-restore` by the Fabric Builder.
    iptables_save: String,
    /// Verbatim `ipset save` text, fed to `ipset restore` by the Fabric Builder.
    ipset_save: String,
    metadata: RouterMetadata,
}

impl Router {
    /// Construct a router from already-parsed facts. Used by `crate::facts::load_fleet`; call
    /// [`Router::validate`] afterwards to enforce the facts-model invariants.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        router_id: RouterId,
        interfaces: Vec<Interface>,
        routing_tables: HashMap<TableId, Vec<Route>>,
        mut policy_rules: Vec<PolicyRule>,
        iptables: HashMap<(Table, String), Vec<IptablesRule>>,
        ipsets: HashMap<String, Ipset>,
        iptables_save: String,
        ipset_save: String,
        metadata: RouterMetadata,
    ) -> Self {
        policy_rules.sort_by_key(|r| r.priority);
        Self {
            name,
            router_id,
            code: None,
            interfaces,
            routing_tables,
            policy_rules,
            iptables,
            ipsets,
            iptables_save,
            ipset_save,
            metadata,
        }
    }

    /// Validate the facts-model invariants: dense rule indices per chain, every `match-set`
    /// predicate referencing a declared ipset, and well-formed interface CIDRs.
    pub fn validate(&self) -> Result<(), FactsError> {
        for ((_table, chain), rules) in self.iptables.iter() {
            for (expected, rule) in rules.iter().enumerate() {
                if rule.index != expected {
                    return Err(FactsError::NonDenseRuleIndex {
                        router: self.name.clone(),
                        chain: chain.clone(),
                        found: rule.index,
                        expected,
                    });
                }
                for pred in &rule.predicates {
                    if let crate::model::iptables::Predicate::MatchSet { name, .. } = pred {
                        if !self.ipsets.contains_key(name) {
                            return Err(FactsError::UnknownIpset {
                                router: self.name.clone(),
                                set: name.clone(),
                            });
                        }
                    }
                }
            }
        }
        for iface in &self.interfaces {
            for addr in &iface.addresses {
                if addr.prefix_len() > 32 {
                    return Err(FactsError::MalformedCidr {
                        router: self.name.clone(),
                        cidr: addr.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Router name, as used throughout facts and reports.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The ID of this router in the fleet graph.
    pub fn router_id(&self) -> RouterId {
        self.router_id
    }

    /// Short kernel-safe code (`rNNN`), if the shared Registry has assigned one.
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Record the short code assigned by the shared Registry.
    pub fn set_code(&mut self, code: String) {
        self.code = Some(code);
    }

    /// Overwrite the router id, used by [`crate::fleet::Fleet::add_router`] once the graph has
    /// assigned the real node index (the constructor's `router_id` argument is a placeholder
    /// until then).
    pub fn set_router_id(&mut self, id: RouterId) {
        self.router_id = id;
    }

    /// All interfaces, in declaration order.
    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    /// Find an interface by name.
    pub fn interface(&self, name: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    /// Returns true if `addr` is configured on one of this router's interfaces (local delivery).
    pub fn owns_address(&self, addr: Ipv4Addr) -> bool {
        self.interfaces.iter().any(|i| i.has_address(addr))
    }

    /// Returns the interface whose subnet contains `addr`, if any (this router is the default
    /// gateway for hosts in that subnet).
    pub fn interface_for_subnet(&self, addr: Ipv4Addr) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.subnet_contains(addr))
    }

    /// Policy rules, ordered ascending by priority.
    pub fn policy_rules(&self) -> &[PolicyRule] {
        &self.policy_rules
    }

    /// Routes of the given table, or an empty slice if the table does not exist.
    pub fn table(&self, id: TableId) -> &[Route] {
        self.routing_tables.get(&id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// The main routing table (table 254).
    pub fn main_table(&self) -> &[Route] {
        self.table(MAIN_TABLE)
    }

    /// Rules of one `(table, chain)`, ordered by index, or an empty slice if the chain is absent.
    pub fn chain(&self, table: Table, chain: &str) -> &[IptablesRule] {
        self.iptables.get(&(table, chain.to_string())).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Mutable access to one `(table, chain)`'s rules, so [`crate::matcher::Chain::walk`] can
    /// update counters in place during a probe.
    pub fn chain_mut(&mut self, table: Table, chain: &str) -> &mut Vec<IptablesRule> {
        self.iptables.entry((table, chain.to_string())).or_default()
    }

    /// All `(table, chain)` pairs declared for this router.
    pub fn chains(&self) -> impl Iterator<Item = (Table, &str)> {
        self.iptables.keys().map(|(t, c)| (*t, c.as_str()))
    }

    /// Look up an ipset by name.
    pub fn ipset(&self, name: &str) -> Option<&Ipset> {
        self.ipsets.get(name)
    }

    /// Verbatim `iptables-save` text for this router.
    pub fn iptables_save(&self) -> &str {
        &self.iptables_save
    }

    /// Verbatim `ipset save` text for this router.
    pub fn ipset_save(&self) -> &str {
        &self.ipset_save
    }

    /// Per-router metadata (role, location, manageability, ...).
    pub fn metadata(&self) -> &RouterMetadata {
        &self.metadata
    }
}
