// Traceroute fleet simulator
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

//! Module containing the fleet-wide identifiers and the packet tuple.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

type IndexType = u32;
/// Router identification, and index into the fleet graph.
pub type RouterId = petgraph::graph::NodeIndex<IndexType>;
/// Routing table identifier (254 = `main`, anything else is an additional table id as found in
/// `ip rule`/`ip route show table <id>`).
pub type TableId = u32;
/// The default routing table, used when no policy rule selects another one.
pub const MAIN_TABLE: TableId = 254;

/// Transport protocol carried by a probe or matched by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    /// TCP
    Tcp,
    /// UDP
    Udp,
    /// ICMP (used for ping/traceroute probes)
    Icmp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
            Self::Icmp => write!(f, "icmp"),
        }
    }
}

/// DSCP codepoint, 6 bits of the IPv4 header's DS field. Quick jobs are assigned one in
/// `DSCP_POOL_START..DSCP_POOL_END` so that concurrent jobs remain disambiguated by the
/// Packet-Count Analyzer.
pub type Dscp = u8;
/// First codepoint handed out to quick jobs.
pub const DSCP_POOL_START: Dscp = 32;
/// One past the last codepoint handed out to quick jobs.
pub const DSCP_POOL_END: Dscp = 64;

/// Inclusive port range. A single port is represented as `PortRange(p, p)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange(pub u16, pub u16);

impl PortRange {
    /// A range matching exactly one port.
    pub fn exact(port: u16) -> Self {
        Self(port, port)
    }

    /// A range matching every port.
    pub fn any() -> Self {
        Self(0, u16::MAX)
    }

    /// Returns true if `port` falls within this inclusive range.
    pub fn contains(&self, port: u16) -> bool {
        port >= self.0 && port <= self.1
    }
}

/// The 5-tuple (plus DSCP, marks and interfaces) a probe or a rule is evaluated against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PacketTuple {
    /// Source address
    pub src: Ipv4Addr,
    /// Destination address
    pub dst: Ipv4Addr,
    /// Transport protocol
    pub proto: Proto,
    /// Source port (0 for ICMP)
    pub sport: u16,
    /// Destination port (0 for ICMP)
    pub dport: u16,
    /// Ingress interface name, if known
    pub in_iface: Option<String>,
    /// Egress interface name, if known
    pub out_iface: Option<String>,
    /// fwmark carried by the packet
    pub fwmark: u32,
    /// DSCP codepoint carried by the packet
    pub dscp: u8,
}

impl PacketTuple {
    /// Build a bare tuple: no ports, no marks, no DSCP.
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, proto: Proto, sport: u16, dport: u16) -> Self {
        Self {
            src,
            dst,
            proto,
            sport,
            dport,
            in_iface: None,
            out_iface: None,
            fwmark: 0,
            dscp: 0,
        }
    }

    /// Return a copy of this tuple tagged with the given DSCP codepoint.
    pub fn with_dscp(mut self, dscp: Dscp) -> Self {
        self.dscp = dscp;
        self
    }

    /// Return a copy of this tuple with the ingress interface set.
    pub fn with_in_iface(mut self, iface: impl Into<String>) -> Self {
        self.in_iface = Some(iface.into());
        self
    }

    /// Return a copy of this tuple with the egress interface set.
    pub fn with_out_iface(mut self, iface: impl Into<String>) -> Self {
        self.out_iface = Some(iface.into());
        self
    }
}

/// Returns whether `addr` falls within `net`. Kept as a free function so longest-prefix-match code
/// reads as a sequence of checks rather than method chains on a re-exported type.
pub fn net_contains(net: &Ipv4Net, addr: Ipv4Addr) -> bool {
    net.contains(&addr)
}
