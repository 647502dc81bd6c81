// Traceroute fleet simulator, adapted from Snowcap's config-parsing entry points
// (snowcap::netsim::config), which load one structured on-disk description per device and
// reject anything the schema does not recognize.
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

//! Facts Model loader: `LoadFleet(facts_dir) -> Fleet`.
//!
//! Each router contributes a `<router>.json` file with `interfaces`, `routing_tables`,
//! `policy_rules`, `iptables_save` and `ipset_save` sections, plus an optional
//! `<router>_metadata.json` sidecar. Parsing is strict: `serde(deny_unknown_fields)` rejects
//! unknown stanzas, and [`Router::validate`] enforces the remaining facts-model invariants after
//! construction.

use crate::error::FactsError;
use crate::fleet::Fleet;
use crate::model::iptables::{IptablesRule, Table};
use crate::model::ipset::Ipset;
use crate::model::metadata::RouterMetadata;
use crate::model::route::{PolicyRule, Route};
use crate::model::router::{Interface, Router};
use crate::model::types::RouterId;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// On-disk shape of `<router>.json`; deserialized then lowered into [`Router`] together with the
/// verbatim `iptables_save`/`ipset_save` text, which is parsed separately (see
/// [`crate::facts::iptables_text`]/[`crate::facts::ipset_text`]).
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RouterFacts {
    interfaces: Vec<InterfaceFacts>,
    routing_tables: HashMap<String, Vec<Route>>,
    #[serde(default)]
    policy_rules: Vec<PolicyRule>,
    iptables_save: String,
    ipset_save: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InterfaceFacts {
    name: String,
    addresses: Vec<String>,
    #[serde(default = "default_mtu")]
    mtu: u32,
    #[serde(default = "default_up")]
    up: bool,
}

fn default_mtu() -> u32 {
    1500
}

fn default_up() -> bool {
    true
}

/// Load every `<name>.json` in `facts_dir` into a [`Fleet`], consulting `<name>_metadata.json`
/// when present.
pub fn load_fleet(facts_dir: &Path) -> Result<Fleet, FactsError> {
    let mut fleet = Fleet::new();
    let entries = fs::read_dir(facts_dir).map_err(|source| FactsError::Io {
        router: facts_dir.display().to_string(),
        source,
    })?;

    let mut router_files: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension().map(|e| e == "json").unwrap_or(false)
                && !p.file_stem().map(|s| s.to_string_lossy().ends_with("_metadata")).unwrap_or(false)
        })
        .collect();
    router_files.sort();

    for path in router_files {
        let router_name = path.file_stem().unwrap().to_string_lossy().to_string();
        let router = load_router(&path, &router_name)?;
        router.validate()?;
        fleet.add_router(router)?;
    }

    Ok(fleet)
}

fn load_router(path: &Path, name: &str) -> Result<Router, FactsError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| FactsError::Io { router: name.to_string(), source })?;
    let facts: RouterFacts = serde_json::from_str(&raw)
        .map_err(|source| FactsError::Malformed { router: name.to_string(), source })?;

    let interfaces = facts
        .interfaces
        .into_iter()
        .map(|i| lower_interface(name, i))
        .collect::<Result<Vec<_>, _>>()?;

    let mut routing_tables = HashMap::new();
    for (table_name, routes) in facts.routing_tables {
        let table_id = parse_table_id(name, &table_name)?;
        routing_tables.insert(table_id, routes);
    }

    let iptables = iptables_text::parse(&facts.iptables_save, name)?;
    let ipsets = ipset_text::parse(&facts.ipset_save, name)?;

    let metadata_path = path.with_file_name(format!("{name}_metadata.json"));
    let metadata = if metadata_path.exists() {
        let raw = fs::read_to_string(&metadata_path)
            .map_err(|source| FactsError::Io { router: name.to_string(), source })?;
        serde_json::from_str(&raw)
            .map_err(|source| FactsError::Malformed { router: name.to_string(), source })?
    } else {
        RouterMetadata::default()
    };

    Ok(Router::new(
        name.to_string(),
        RouterId::new(0),
        interfaces,
        routing_tables,
        facts.policy_rules,
        iptables,
        ipsets,
        facts.iptables_save,
        facts.ipset_save,
        metadata,
    ))
}

fn lower_interface(router: &str, raw: InterfaceFacts) -> Result<Interface, FactsError> {
    let addresses = raw
        .addresses
        .iter()
        .map(|a| a.parse().map_err(|_| FactsError::MalformedCidr {
            router: router.to_string(),
            cidr: a.clone(),
        }))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Interface { name: raw.name, code: None, addresses, mtu: raw.mtu, up: raw.up })
}

fn parse_table_id(router: &str, name: &str) -> Result<u32, FactsError> {
    if name == "main" {
        return Ok(crate::model::types::MAIN_TABLE);
    }
    name.parse().map_err(|_| FactsError::Malformed {
        router: router.to_string(),
        source: serde_json::Error::io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("routing table key {name:?} is not \"main\" or a numeric table id"),
        )),
    })
}

/// Line-oriented parser for the subset of `iptables-save` syntax the facts model needs: per-table
/// `*table` / `:CHAIN POLICY [packets:bytes]` / `-A CHAIN <predicates> -j TARGET` lines. Kept
/// intentionally small; full grammar coverage is not this tool's job; the verbatim text is always
/// retained alongside the parsed form for faithful restoration.
mod iptables_text {
    use super::*;
    use crate::model::iptables::{ConnState, Counters, Predicate, SetDirection, Target};
    use crate::model::types::{PortRange, Proto};

    pub fn parse(text: &str, router: &str) -> Result<HashMap<(Table, String), Vec<IptablesRule>>, FactsError> {
        let mut out: HashMap<(Table, String), Vec<IptablesRule>> = HashMap::new();
        let mut table = Table::Filter;
        let mut counters: HashMap<(Table, String), usize> = HashMap::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('*') {
                table = match name {
                    "filter" => Table::Filter,
                    "nat" => Table::Nat,
                    "mangle" => Table::Mangle,
                    other => {
                        return Err(FactsError::Malformed {
                            router: router.to_string(),
                            source: serde_json::Error::io(std::io::Error::new(
                                std::io::ErrorKind::InvalidData,
                                format!("unknown iptables table {other:?}"),
                            )),
                        })
                    }
                };
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            if line == "COMMIT" {
                continue;
            }
            if let Some(rest) = line.strip_prefix("-A ") {
                let mut parts = rest.split_whitespace();
                let chain = parts.next().unwrap_or_default().to_string();
                let rule = parse_rule_line(parts, table, &chain, router)?;
                let index = counters.entry((table, chain.clone())).or_insert(0);
                let mut rule = rule;
                rule.index = *index;
                *index += 1;
                out.entry((table, chain)).or_default().push(rule);
            }
        }
        Ok(out)
    }

    fn parse_rule_line(
        tokens: std::str::SplitWhitespace<'_>,
        table: Table,
        chain: &str,
        router: &str,
    ) -> Result<IptablesRule, FactsError> {
        let tokens: Vec<&str> = tokens.collect();
        let mut predicates = Vec::new();
        let mut target = None;
        let mut i = 0;
        while i < tokens.len() {
            match tokens[i] {
                "-s" | "--source" => {
                    predicates.push(Predicate::SrcCidr(parse_net(router, tokens[i + 1])?));
                    i += 2;
                }
                "-d" | "--destination" => {
                    predicates.push(Predicate::DstCidr(parse_net(router, tokens[i + 1])?));
                    i += 2;
                }
                "-p" | "--protocol" => {
                    predicates.push(Predicate::Proto(parse_proto(tokens[i + 1])));
                    i += 2;
                }
                "--sport" => {
                    predicates.push(Predicate::Sport(parse_port_range(tokens[i + 1])));
                    i += 2;
                }
                "--dport" => {
                    predicates.push(Predicate::Dport(parse_port_range(tokens[i + 1])));
                    i += 2;
                }
                "-i" | "--in-interface" => {
                    predicates.push(Predicate::InIface(tokens[i + 1].to_string()));
                    i += 2;
                }
                "-o" | "--out-interface" => {
                    predicates.push(Predicate::OutIface(tokens[i + 1].to_string()));
                    i += 2;
                }
                "--match-set" => {
                    let name = tokens[i + 1].to_string();
                    let dir = if tokens[i + 2] == "src" { SetDirection::Src } else { SetDirection::Dst };
                    predicates.push(Predicate::MatchSet { name, dir });
                    i += 3;
                }
                "--dscp" => {
                    predicates.push(Predicate::Dscp(tokens[i + 1].parse().unwrap_or(0)));
                    i += 2;
                }
                "--mark" => {
                    predicates.push(Predicate::Mark(tokens[i + 1].parse().unwrap_or(0)));
                    i += 2;
                }
                "--ctstate" => {
                    let states = tokens[i + 1]
                        .split(',')
                        .filter_map(|s| match s {
                            "NEW" => Some(ConnState::New),
                            "ESTABLISHED" => Some(ConnState::Established),
                            "RELATED" => Some(ConnState::Related),
                            "INVALID" => Some(ConnState::Invalid),
                            _ => None,
                        })
                        .collect();
                    predicates.push(Predicate::State(states));
                    i += 2;
                }
                "-j" | "--jump" => {
                    target = Some(parse_target(router, &tokens, i + 1)?);
                    i += 2;
                }
                _ => {
                    i += 1;
                }
            }
        }
        let target = target.ok_or_else(|| FactsError::Malformed {
            router: router.to_string(),
            source: serde_json::Error::io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("rule in chain {chain} has no -j target"),
            )),
        })?;
        Ok(IptablesRule {
            table,
            chain: chain.to_string(),
            index: 0,
            predicates,
            target,
            counters: Counters::default(),
        })
    }

    fn parse_target(router: &str, tokens: &[&str], at: usize) -> Result<Target, FactsError> {
        let name = tokens[at];
        Ok(match name {
            "ACCEPT" => Target::Accept,
            "DROP" => Target::Drop,
            "REJECT" => Target::Reject,
            "LOG" => Target::LogContinue,
            "MASQUERADE" => Target::Masquerade,
            "SNAT" => {
                let addr = find_flag_value(tokens, at, "--to-source")
                    .and_then(|s| s.split(':').next())
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| malformed(router, "SNAT without --to-source"))?;
                Target::Snat(addr)
            }
            "DNAT" => {
                let value = find_flag_value(tokens, at, "--to-destination")
                    .ok_or_else(|| malformed(router, "DNAT without --to-destination"))?;
                let mut split = value.splitn(2, ':');
                let addr = split.next().unwrap().parse().map_err(|_| malformed(router, "bad DNAT address"))?;
                let port = split.next().and_then(|p| p.parse().ok());
                Target::Dnat(addr, port)
            }
            "MARK" => {
                let mark = find_flag_value(tokens, at, "--set-mark")
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| malformed(router, "MARK without --set-mark"))?;
                Target::Mark(mark)
            }
            "DSCP" => {
                let dscp = find_flag_value(tokens, at, "--set-dscp")
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| malformed(router, "DSCP without --set-dscp"))?;
                Target::DscpSet(dscp)
            }
            other => Target::Jump(other.to_string()),
        })
    }

    fn find_flag_value<'a>(tokens: &[&'a str], from: usize, flag: &str) -> Option<&'a str> {
        tokens[from..].iter().position(|t| *t == flag).map(|i| tokens[from + i + 1])
    }

    fn malformed(router: &str, msg: &str) -> FactsError {
        FactsError::Malformed {
            router: router.to_string(),
            source: serde_json::Error::io(std::io::Error::new(std::io::ErrorKind::InvalidData, msg)),
        }
    }

    fn parse_net(router: &str, s: &str) -> Result<ipnet::Ipv4Net, FactsError> {
        if s.contains('/') {
            s.parse().map_err(|_| FactsError::MalformedCidr { router: router.to_string(), cidr: s.to_string() })
        } else {
            format!("{s}/32")
                .parse()
                .map_err(|_| FactsError::MalformedCidr { router: router.to_string(), cidr: s.to_string() })
        }
    }

    fn parse_proto(s: &str) -> Proto {
        match s {
            "udp" => Proto::Udp,
            "icmp" => Proto::Icmp,
            _ => Proto::Tcp,
        }
    }

    fn parse_port_range(s: &str) -> PortRange {
        if let Some((lo, hi)) = s.split_once(':') {
            PortRange(lo.parse().unwrap_or(0), hi.parse().unwrap_or(u16::MAX))
        } else {
            PortRange::exact(s.parse().unwrap_or(0))
        }
    }
}

/// Line-oriented parser for `ipset save` output: `create NAME type ...` and `add NAME member...`.
mod ipset_text {
    use super::*;
    use crate::model::ipset::{IpsetMember, IpsetType};

    pub fn parse(text: &str, router: &str) -> Result<HashMap<String, Ipset>, FactsError> {
        let mut sets: HashMap<String, Ipset> = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut tokens = line.split_whitespace();
            match tokens.next() {
                Some("create") => {
                    let name = tokens.next().unwrap_or_default().to_string();
                    let type_str = tokens.next().unwrap_or_default();
                    let set_type = parse_set_type(router, type_str)?;
                    sets.insert(name.clone(), Ipset { name, set_type, members: Vec::new() });
                }
                Some("add") => {
                    let name = tokens.next().unwrap_or_default();
                    let rest: Vec<&str> = tokens.collect();
                    if let Some(set) = sets.get_mut(name) {
                        let member = parse_member(router, set.set_type, &rest)?;
                        set.members.push(member);
                    }
                }
                _ => {}
            }
        }
        Ok(sets)
    }

    fn parse_set_type(router: &str, s: &str) -> Result<IpsetType, FactsError> {
        Ok(match s {
            "bitmap:ip" => IpsetType::BitmapIp,
            "bitmap:ip,mac" => IpsetType::BitmapIpMac,
            "bitmap:port" => IpsetType::BitmapPort,
            "hash:ip" => IpsetType::HashIp,
            "hash:mac" => IpsetType::HashMac,
            "hash:net" => IpsetType::HashNet,
            "hash:ip,port" => IpsetType::HashIpPort,
            "hash:net,iface" => IpsetType::HashNetIface,
            "hash:ip,port,net" => IpsetType::HashIpPortNet,
            "hash:net,port,net" => IpsetType::HashNetPortNet,
            other => {
                return Err(FactsError::Malformed {
                    router: router.to_string(),
                    source: serde_json::Error::io(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("unknown ipset type {other:?}"),
                    )),
                })
            }
        })
    }

    fn parse_member(router: &str, set_type: IpsetType, fields: &[&str]) -> Result<IpsetMember, FactsError> {
        let first = fields.first().copied().unwrap_or_default();
        let err = || FactsError::Malformed {
            router: router.to_string(),
            source: serde_json::Error::io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("cannot parse ipset member {fields:?} for type {set_type:?}"),
            )),
        };
        Ok(match set_type {
            IpsetType::BitmapIp | IpsetType::HashIp => IpsetMember::Ip(first.parse().map_err(|_| err())?),
            IpsetType::HashNet => IpsetMember::Net(first.parse().map_err(|_| err())?),
            IpsetType::BitmapPort => IpsetMember::Port(first.parse().map_err(|_| err())?),
            IpsetType::HashIpPort => {
                let (ip, port) = first.split_once(',').ok_or_else(err)?;
                IpsetMember::IpPort(ip.parse().map_err(|_| err())?, port.parse().map_err(|_| err())?)
            }
            IpsetType::HashNetIface => {
                let (net, iface) = first.split_once(',').ok_or_else(err)?;
                IpsetMember::NetIface(net.parse().map_err(|_| err())?, iface.to_string())
            }
            IpsetType::HashIpPortNet => {
                let mut parts = first.splitn(3, ',');
                let ip = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
                let port = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
                let net = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
                IpsetMember::IpPortNet(ip, port, net)
            }
            IpsetType::HashNetPortNet => {
                let mut parts = first.splitn(3, ',');
                let net = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
                let port = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
                let net2 = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
                IpsetMember::NetPortNet(net, port, net2)
            }
            IpsetType::BitmapIpMac | IpsetType::HashMac => return Err(err()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_stanza() {
        let json = r#"{"interfaces": [], "routing_tables": {}, "iptables_save": "", "ipset_save": "", "bogus_field": 1}"#;
        let result: Result<RouterFacts, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn parses_simple_forward_chain() {
        let text = "*filter\n:FORWARD ACCEPT [0:0]\n-A FORWARD -s 10.0.0.0/24 -d 10.0.1.0/24 -p tcp --dport 22 -j ACCEPT\nCOMMIT\n";
        let rules = iptables_text::parse(text, "r1").unwrap();
        let forward = rules.get(&(Table::Filter, "FORWARD".to_string())).unwrap();
        assert_eq!(forward.len(), 1);
        assert_eq!(forward[0].index, 0);
        assert_eq!(forward[0].target, crate::model::iptables::Target::Accept);
    }

    #[test]
    fn parses_hash_net_ipset() {
        let text = "create corp hash:net family inet hashsize 1024 maxelem 65536\nadd corp 10.0.0.0/8\n";
        let sets = ipset_text::parse(text, "r1").unwrap();
        let set = sets.get("corp").unwrap();
        assert_eq!(set.members.len(), 1);
    }
}
