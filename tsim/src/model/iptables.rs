// Traceroute fleet simulator, adapted from Snowcap's route-map model
// (snowcap::netsim::route_map::{RouteMapMatch, RouteMapSet}), which uses the same
// tagged-predicate / short-circuit-match shape for a different protocol (BGP route maps).
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version.

//! Iptables rule predicates, targets and mutable counters.

use crate::model::types::{PortRange, Proto};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which iptables table a rule belongs to. Only `filter`'s FORWARD chain drives reachability
/// decisions; `nat` and `mangle` are retained verbatim and consulted only to explain counter
/// deltas attributable to MASQUERADE/SNAT/DNAT/MARK/DSCP-set targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Table {
    /// `filter`
    Filter,
    /// `nat`
    Nat,
    /// `mangle`
    Mangle,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filter => write!(f, "filter"),
            Self::Nat => write!(f, "nat"),
            Self::Mangle => write!(f, "mangle"),
        }
    }
}

/// Connection tracking state. Symbolic evaluation never tracks per-connection state, so a
/// `State` predicate only ever matches a probe packet that was tagged with an observed state
/// out-of-band (live mode); it is always a non-match in pure symbolic evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnState {
    /// `NEW`
    New,
    /// `ESTABLISHED`
    Established,
    /// `RELATED`
    Related,
    /// `INVALID`
    Invalid,
}

/// Direction a `match-set` predicate is evaluated in: against the packet's source or destination
/// fields (and, for `hash:net,iface`, the corresponding interface).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetDirection {
    /// Match against source address/port/iface.
    Src,
    /// Match against destination address/port/iface.
    Dst,
}

/// A single match predicate. `Chain::walk` requires every predicate of a rule to match
/// (conjunction).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// Source CIDR
    SrcCidr(Ipv4Net),
    /// Destination CIDR
    DstCidr(Ipv4Net),
    /// Transport protocol
    Proto(Proto),
    /// Source port range (inclusive)
    Sport(PortRange),
    /// Destination port range (inclusive)
    Dport(PortRange),
    /// Ingress interface, exact match
    InIface(String),
    /// Egress interface, exact match
    OutIface(String),
    /// `match-set NAME src|dst`
    MatchSet {
        /// Set name
        name: String,
        /// Direction to test
        dir: SetDirection,
    },
    /// DSCP field, exact match
    Dscp(u8),
    /// fwmark, exact match
    Mark(u32),
    /// Connection tracking state (see [`ConnState`])
    State(Vec<ConnState>),
}

/// Terminal or continuation verdict of evaluating one rule or walking a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Packet is accepted.
    Accept,
    /// Packet is dropped silently.
    Drop,
    /// Packet is rejected (drop + ICMP/TCP-RST response).
    Reject,
    /// No terminal verdict yet; keep walking the chain.
    Continue,
    /// Jump to a user-defined chain.
    Jump(String),
}

/// The action a rule takes once its predicates match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Target {
    /// `-j ACCEPT`
    Accept,
    /// `-j DROP`
    Drop,
    /// `-j REJECT`
    Reject,
    /// `-j LOG`, falls through to the next rule (never terminal on its own).
    LogContinue,
    /// `-j <chain>`, a jump to a user-defined chain.
    Jump(String),
    /// `-j MASQUERADE`
    Masquerade,
    /// `-j SNAT --to-source <addr>`
    Snat(std::net::Ipv4Addr),
    /// `-j DNAT --to-destination <addr>[:port]`
    Dnat(std::net::Ipv4Addr, Option<u16>),
    /// `-j MARK --set-mark <mark>`
    Mark(u32),
    /// `-j DSCP --set-dscp <value>`
    DscpSet(u8),
}

impl Target {
    /// Maps a target to the verdict it produces once its rule's predicates have all matched.
    /// Targets with side effects but no terminal verdict (MASQUERADE, SNAT, DNAT, MARK, DSCP-set,
    /// LOG) continue chain evaluation, exactly like the kernel does.
    pub fn verdict(&self) -> Verdict {
        match self {
            Target::Accept => Verdict::Accept,
            Target::Drop => Verdict::Drop,
            Target::Reject => Verdict::Reject,
            Target::Jump(chain) => Verdict::Jump(chain.clone()),
            Target::LogContinue
            | Target::Masquerade
            | Target::Snat(_)
            | Target::Dnat(_, _)
            | Target::Mark(_)
            | Target::DscpSet(_) => Verdict::Continue,
        }
    }
}

/// Packet/byte counters. Mutated in place by [`crate::matcher::Chain::walk`] and snapshotted by
/// the Packet-Count Analyzer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    /// Packets matched since the counters were last reset.
    pub packets: u64,
    /// Bytes matched since the counters were last reset.
    pub bytes: u64,
}

impl Counters {
    /// Record one matching packet of `len` bytes.
    pub fn hit(&mut self, len: u64) {
        self.packets += 1;
        self.bytes += len;
    }
}

/// One line of an `iptables-save` FORWARD/PREROUTING/... chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IptablesRule {
    /// Table this rule belongs to.
    pub table: Table,
    /// Chain name (`FORWARD`, `INPUT`, or a user-defined chain).
    pub chain: String,
    /// Index within the chain, starting at 0. Dense and stable across snapshots of one router
    /// within a job (an invariant the Facts Model enforces on load).
    pub index: usize,
    /// Conjunction of match predicates.
    pub predicates: Vec<Predicate>,
    /// Action once all predicates match.
    pub target: Target,
    /// Mutable packet/byte counters.
    pub counters: Counters,
}

impl fmt::Display for IptablesRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-A {} [{}] -j {:?}", self.chain, self.index, self.target)
    }
}
