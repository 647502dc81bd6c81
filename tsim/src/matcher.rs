// Traceroute fleet simulator, adapted from Snowcap's route-map matcher
// (snowcap::netsim::route_map::{RouteMapMatch, RouteMapSet}), which evaluates a tagged-variant
// predicate list short-circuiting on the first mismatch and dispatches on an enum target instead
// of a trait object.
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

//! Ipset/Iptables Matcher: evaluates a single rule against a packet tuple, and walks a chain.

use crate::error::MatcherError;
use crate::model::iptables::{Predicate, SetDirection, Table, Verdict};
use crate::model::router::Router;
use crate::model::types::PacketTuple;
use crate::model::{IpsetMember, SetElem};
use std::collections::HashSet;

/// Resolves `match-set` predicates against the owning router's parsed ipsets.
pub struct SetResolver<'a> {
    router: &'a Router,
}

impl<'a> SetResolver<'a> {
    /// Build a resolver bound to one router's ipsets.
    pub fn new(router: &'a Router) -> Self {
        Self { router }
    }

    /// Returns true if `elem` belongs to the named set, or false if the set is unknown (a
    /// condition [`Router::validate`] already rejects, so this should not be reachable in
    /// practice, but the matcher stays total rather than panicking).
    fn contains(&self, name: &str, elem: &SetElem<'_>) -> bool {
        self.router.ipset(name).map(|s| s.contains(elem)).unwrap_or(false)
    }
}

/// Returns true if every predicate of `predicates` matches `tuple` (short-circuiting on the first
/// mismatch, as `Chain::walk` requires).
pub fn predicates_match(predicates: &[Predicate], tuple: &PacketTuple, resolver: &SetResolver<'_>) -> bool {
    predicates.iter().all(|p| predicate_matches(p, tuple, resolver))
}

fn predicate_matches(predicate: &Predicate, tuple: &PacketTuple, resolver: &SetResolver<'_>) -> bool {
    match predicate {
        Predicate::SrcCidr(net) => net.contains(&tuple.src),
        Predicate::DstCidr(net) => net.contains(&tuple.dst),
        Predicate::Proto(proto) => *proto == tuple.proto,
        Predicate::Sport(range) => range.contains(tuple.sport),
        Predicate::Dport(range) => range.contains(tuple.dport),
        Predicate::InIface(name) => tuple.in_iface.as_deref() == Some(name.as_str()),
        Predicate::OutIface(name) => tuple.out_iface.as_deref() == Some(name.as_str()),
        Predicate::Dscp(value) => *value == tuple.dscp,
        Predicate::Mark(value) => *value == tuple.fwmark,
        Predicate::State(_) => false,
        Predicate::MatchSet { name, dir } => {
            let elem = match dir {
                SetDirection::Src => SetElem {
                    ip: Some(tuple.src),
                    port: Some(tuple.sport),
                    iface: tuple.in_iface.as_deref(),
                },
                SetDirection::Dst => SetElem {
                    ip: Some(tuple.dst),
                    port: Some(tuple.dport),
                    iface: tuple.out_iface.as_deref(),
                },
            };
            resolver.contains(name, &elem)
        }
    }
}

/// Outcome of matching a single rule: either no match, or the rule's terminal/continuation
/// verdict once its predicates are satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    /// No predicate matched; move to the next rule.
    NoMatch,
    /// The rule matched and produced this verdict.
    Matched(Verdict),
}

/// Evaluate one rule against `tuple`. Does not update counters; [`Chain::walk`] does that once it
/// knows the packet length.
pub fn match_rule(
    predicates: &[Predicate],
    target_verdict: Verdict,
    tuple: &PacketTuple,
    resolver: &SetResolver<'_>,
) -> RuleOutcome {
    if predicates_match(predicates, tuple, resolver) {
        RuleOutcome::Matched(target_verdict)
    } else {
        RuleOutcome::NoMatch
    }
}

/// Default policy applied when a built-in chain (`FORWARD`, `INPUT`, ...) is walked to its end
/// without a terminal verdict; iptables defaults FORWARD to ACCEPT unless the facts say otherwise,
/// but a conservative default of DROP is safer for a tool whose purpose is to find unexpected
/// blocks, so the caller supplies the real policy read from `iptables-save`'s `:CHAIN POLICY` line.
pub const DEFAULT_CHAIN_POLICY: Verdict = Verdict::Drop;

/// Walks one chain of one router/packet length, following `JUMP` targets, updating matched rules'
/// counters, and returning the first terminal verdict (or the supplied policy if the chain runs
/// out of rules without one).
pub struct Chain<'a> {
    router: &'a mut Router,
    table: Table,
}

impl<'a> Chain<'a> {
    /// Bind a chain walk to one router and table; the starting chain name is passed to
    /// [`Chain::walk`] so the same `Chain` can be reused across FORWARD/custom-chain jumps.
    pub fn new(router: &'a mut Router, table: Table) -> Self {
        Self { router, table }
    }

    /// Walk `chain_name` against `tuple`/`len`, following jumps, and return the resulting verdict.
    /// `policy` is the default verdict for the entry chain if it runs out of rules.
    pub fn walk(
        &mut self,
        chain_name: &str,
        tuple: &PacketTuple,
        len: u64,
        policy: Verdict,
    ) -> Result<Verdict, MatcherError> {
        let mut visited = HashSet::new();
        self.walk_inner(chain_name, tuple, len, policy, &mut visited)
    }

    fn walk_inner(
        &mut self,
        chain_name: &str,
        tuple: &PacketTuple,
        len: u64,
        policy: Verdict,
        visited: &mut HashSet<String>,
    ) -> Result<Verdict, MatcherError> {
        if !visited.insert(chain_name.to_string()) {
            return Err(MatcherError::JumpCycle {
                router: self.router.name().to_string(),
                chain: chain_name.to_string(),
            });
        }
        let rule_count = self.router.chain(self.table, chain_name).len();
        for index in 0..rule_count {
            let resolver = SetResolver::new(self.router);
            let predicates = self.router.chain(self.table, chain_name)[index].predicates.clone();
            let target_verdict = self.router.chain(self.table, chain_name)[index].target.verdict();
            let outcome = match_rule(&predicates, target_verdict.clone(), tuple, &resolver);
            if let RuleOutcome::Matched(verdict) = outcome {
                self.router.chain_mut(self.table, chain_name)[index].counters.hit(len);
                match verdict {
                    Verdict::Continue => continue,
                    Verdict::Jump(next_chain) => {
                        if self.router.chain(self.table, &next_chain).is_empty()
                            && !self.router.chains().any(|(t, c)| t == self.table && c == next_chain)
                        {
                            return Err(MatcherError::UndeclaredChain {
                                router: self.router.name().to_string(),
                                table: self.table,
                                chain: next_chain,
                            });
                        }
                        let inner =
                            self.walk_inner(&next_chain, tuple, len, Verdict::Continue, visited)?;
                        if inner != Verdict::Continue {
                            return Ok(inner);
                        }
                        continue;
                    }
                    terminal => return Ok(terminal),
                }
            }
        }
        Ok(policy)
    }
}
