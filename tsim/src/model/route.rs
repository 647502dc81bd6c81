// Traceroute fleet simulator, adapted from Snowcap's network configuration model.
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

//! Routes and policy rules of one router's routing tables.

use crate::model::types::TableId;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// A single entry of a routing table (`ip route`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Destination CIDR. `0.0.0.0/0` for the default route.
    pub dest: Ipv4Net,
    /// Next-hop gateway. `None` for a directly-connected route (`dev` only).
    pub gateway: Option<Ipv4Addr>,
    /// Egress device name.
    pub dev: String,
    /// Preferred source address (`src` keyword), used for locally-originated traffic.
    pub src: Option<Ipv4Addr>,
    /// Routing table this route belongs to.
    pub table: TableId,
    /// Route metric; lower wins among equal-length prefixes.
    pub metric: u32,
    /// Routing protocol that installed the route (`kernel`, `static`, `boot`, ...).
    pub protocol: String,
    /// Route scope (`global`, `link`, `host`).
    pub scope: String,
}

impl Route {
    /// Prefix length of the destination, used to rank candidates during longest-prefix match.
    pub fn prefix_len(&self) -> u8 {
        self.dest.prefix_len()
    }
}

/// A single policy routing rule (`ip rule`), selecting a table before LPM is performed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Priority; lower values are evaluated first.
    pub priority: u32,
    /// Source CIDR to match, if any.
    pub from: Option<Ipv4Net>,
    /// Destination CIDR to match, if any.
    pub to: Option<Ipv4Net>,
    /// fwmark to match, if any.
    pub fwmark: Option<u32>,
    /// TOS/DSCP byte to match, if any.
    pub tos: Option<u8>,
    /// Ingress interface to match, if any.
    pub iif: Option<String>,
    /// Egress interface to match, if any.
    pub oif: Option<String>,
    /// Table selected when this rule matches.
    pub table: TableId,
}

impl PolicyRule {
    /// Returns true if this rule matches the given packet fields.
    pub fn matches(
        &self,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        fwmark: u32,
        tos: u8,
        iif: Option<&str>,
        oif: Option<&str>,
    ) -> bool {
        if let Some(from) = &self.from {
            if !from.contains(&src) {
                return false;
            }
        }
        if let Some(to) = &self.to {
            if !to.contains(&dst) {
                return false;
            }
        }
        if let Some(mark) = self.fwmark {
            if mark != fwmark {
                return false;
            }
        }
        if let Some(rule_tos) = self.tos {
            if rule_tos != tos {
                return false;
            }
        }
        if let Some(rule_iif) = &self.iif {
            if Some(rule_iif.as_str()) != iif {
                return false;
            }
        }
        if let Some(rule_oif) = &self.oif {
            if Some(rule_oif.as_str()) != oif {
                return false;
            }
        }
        true
    }
}
