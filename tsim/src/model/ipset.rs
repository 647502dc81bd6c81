// Traceroute fleet simulator, adapted from Snowcap's network configuration model.
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

//! Ipset types and membership tests.
//!
//! An ipset is a kernel-maintained named set, referenced from iptables with `match-set`. We keep
//! the verbatim `ipset save` text for restoration (see [`crate::model::router::Router::ipset_save`])
//! and a parsed form here for O(1)-ish membership tests during symbolic matching.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// The supported ipset types. Multi-dimensional hash sets store a tuple per member and match as
/// a conjunction of their components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpsetType {
    /// `bitmap:ip`
    BitmapIp,
    /// `bitmap:ip,mac`
    BitmapIpMac,
    /// `bitmap:port`
    BitmapPort,
    /// `hash:ip`
    HashIp,
    /// `hash:mac`
    HashMac,
    /// `hash:net`
    HashNet,
    /// `hash:ip,port`
    HashIpPort,
    /// `hash:net,iface`
    HashNetIface,
    /// `hash:ip,port,net`
    HashIpPortNet,
    /// `hash:net,port,net`
    HashNetPortNet,
}

/// One member of an ipset. Which variant is populated depends on the set's [`IpsetType`]; the
/// loader in `crate::facts` refuses to build a member that does not match its set's declared type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IpsetMember {
    /// Single address (`bitmap:ip`, `hash:ip`).
    Ip(Ipv4Addr),
    /// Address plus MAC (`bitmap:ip,mac`).
    IpMac(Ipv4Addr, [u8; 6]),
    /// Single port (`bitmap:port`).
    Port(u16),
    /// CIDR prefix (`hash:net`). Sets may hold members of different prefix lengths; longest
    /// matching prefix wins, as for routing tables.
    Net(Ipv4Net),
    /// Address+port pair (`hash:ip,port`).
    IpPort(Ipv4Addr, u16),
    /// CIDR plus an exact interface name (`hash:net,iface`).
    NetIface(Ipv4Net, String),
    /// Address, port, and containing CIDR (`hash:ip,port,net`).
    IpPortNet(Ipv4Addr, u16, Ipv4Net),
    /// CIDR, port, and a second CIDR (`hash:net,port,net`).
    NetPortNet(Ipv4Net, u16, Ipv4Net),
}

/// A parsed ipset: its declared type plus members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ipset {
    /// Set name, as referenced by `match-set` in iptables rules.
    pub name: String,
    /// Declared element type.
    pub set_type: IpsetType,
    /// Members of the set.
    pub members: Vec<IpsetMember>,
}

/// The element offered to a set for a membership test; which fields are populated depends on the
/// direction (`src`/`dst`) and the iptables rule doing the lookup.
#[derive(Debug, Clone, Copy)]
pub struct SetElem<'a> {
    /// Candidate address.
    pub ip: Option<Ipv4Addr>,
    /// Candidate port.
    pub port: Option<u16>,
    /// Candidate interface name, borrowed from the packet tuple.
    pub iface: Option<&'a str>,
}

impl Ipset {
    /// Returns true if `elem` is a member of this set, using longest-prefix-match semantics for
    /// any CIDR component, matching kernel `hash:net`-family set lookup.
    pub fn contains(&self, elem: &SetElem<'_>) -> bool {
        match self.set_type {
            IpsetType::BitmapIp | IpsetType::HashIp => {
                let Some(ip) = elem.ip else { return false };
                self.members.iter().any(|m| matches!(m, IpsetMember::Ip(a) if *a == ip))
            }
            IpsetType::BitmapIpMac => {
                let Some(ip) = elem.ip else { return false };
                self.members.iter().any(|m| matches!(m, IpsetMember::IpMac(a, _) if *a == ip))
            }
            IpsetType::HashMac => false,
            IpsetType::BitmapPort => {
                let Some(port) = elem.port else { return false };
                self.members.iter().any(|m| matches!(m, IpsetMember::Port(p) if *p == port))
            }
            IpsetType::HashNet => {
                let Some(ip) = elem.ip else { return false };
                longest_prefix_net(&self.members, ip).is_some()
            }
            IpsetType::HashIpPort => {
                let (Some(ip), Some(port)) = (elem.ip, elem.port) else { return false };
                self.members
                    .iter()
                    .any(|m| matches!(m, IpsetMember::IpPort(a, p) if *a == ip && *p == port))
            }
            IpsetType::HashNetIface => {
                let (Some(ip), Some(iface)) = (elem.ip, elem.iface) else { return false };
                self.members.iter().any(|m| match m {
                    IpsetMember::NetIface(net, ifname) => net.contains(&ip) && ifname == iface,
                    _ => false,
                })
            }
            IpsetType::HashIpPortNet => {
                let (Some(ip), Some(port)) = (elem.ip, elem.port) else { return false };
                self.members.iter().any(|m| match m {
                    IpsetMember::IpPortNet(a, p, net) => {
                        *a == ip && *p == port && net.contains(&ip)
                    }
                    _ => false,
                })
            }
            IpsetType::HashNetPortNet => {
                let (Some(ip), Some(port)) = (elem.ip, elem.port) else { return false };
                self.members.iter().any(|m| match m {
                    IpsetMember::NetPortNet(net, p, net2) => {
                        net.contains(&ip) && *p == port && net2.contains(&ip)
                    }
                    _ => false,
                })
            }
        }
    }
}

/// Find the longest matching `Net` member for `ip`, testing longest-first for `hash:net` sets
/// holding members of mixed prefix lengths.
fn longest_prefix_net(members: &[IpsetMember], ip: Ipv4Addr) -> Option<&Ipv4Net> {
    members
        .iter()
        .filter_map(|m| match m {
            IpsetMember::Net(net) if net.contains(&ip) => Some(net),
            _ => None,
        })
        .max_by_key(|net| net.prefix_len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net_set(nets: &[&str]) -> Ipset {
        Ipset {
            name: "s".into(),
            set_type: IpsetType::HashNet,
            members: nets.iter().map(|n| IpsetMember::Net(n.parse().unwrap())).collect(),
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let set = net_set(&["10.0.0.0/8", "10.1.0.0/16", "10.1.1.0/24"]);
        let elem = SetElem { ip: Some("10.1.1.5".parse().unwrap()), port: None, iface: None };
        assert!(set.contains(&elem));
        assert_eq!(
            longest_prefix_net(&set.members, "10.1.1.5".parse().unwrap()).unwrap().prefix_len(),
            24
        );
    }

    #[test]
    fn outside_any_prefix_does_not_match() {
        let set = net_set(&["10.1.1.0/24"]);
        let elem = SetElem { ip: Some("10.2.2.2".parse().unwrap()), port: None, iface: None };
        assert!(!set.contains(&elem));
    }
}
