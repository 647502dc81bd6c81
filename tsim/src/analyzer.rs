// Traceroute fleet simulator, adapted from Snowcap's forwarding-state snapshot/diff idiom
// (snowcap::netsim::forwarding_state caches a per-prefix result and compares across updates); here
// a snapshot of one router's rule counters is diffed against a later snapshot to find the rule a
// probe actually hit.
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

//! Packet-Count Analyzer: attributes a counter delta to the rule a probe actually matched.

use crate::matcher::{predicates_match, SetResolver};
use crate::model::iptables::{Counters, Table, Verdict};
use crate::model::router::Router;
use crate::model::types::PacketTuple;
use std::collections::HashMap;

/// Which terminal verdict the analyzer is looking to attribute, derived from the probe's observed
/// outcome (a failed probe looks for the blocking DROP/REJECT; a successful one looks for the
/// permitting ACCEPT).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Find the rule that dropped or rejected the probe.
    Blocking,
    /// Find the rule that accepted the probe.
    Allowing,
}

/// Packet/byte counters for every rule of a router's FORWARD chain, keyed by `(chain, index)`.
/// Taken before and after a probe and diffed by [`diff`].
#[derive(Debug, Clone, Default)]
pub struct Snapshot(HashMap<(String, usize), Counters>);

impl Snapshot {
    /// Capture the current counters of `table`'s chains on `router`.
    pub fn capture(router: &Router, table: Table) -> Self {
        let mut map = HashMap::new();
        for (t, chain) in router.chains() {
            if t != table {
                continue;
            }
            for rule in router.chain(t, chain) {
                map.insert((chain.to_string(), rule.index), rule.counters);
            }
        }
        Snapshot(map)
    }
}

/// One candidate rule whose counters increased between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    /// Chain the rule lives in.
    pub chain: String,
    /// Rule index within the chain.
    pub index: usize,
    /// Packets seen between the two snapshots.
    pub delta_packets: u64,
}

/// Diff `before`/`after` snapshots of `router`'s `table`, keep only rules whose verdict matches
/// `mode` and whose predicates are consistent with `tuple` (including its DSCP value, so
/// concurrent quick jobs on different DSCP codepoints never see each other's deltas), and return
/// the rule with the greatest packet delta, breaking ties by chain traversal order (FORWARD before
/// any jumped-to chain, then ascending index).
pub fn analyze_delta(
    router: &Router,
    before: &Snapshot,
    after: &Snapshot,
    tuple: &PacketTuple,
    table: Table,
    mode: Mode,
) -> Option<RuleMatch> {
    let mut candidates = Vec::new();
    for (t, chain) in router.chains() {
        if t != table {
            continue;
        }
        let resolver = SetResolver::new(router);
        for rule in router.chain(t, chain) {
            let key = (chain.to_string(), rule.index);
            let before_count = before.0.get(&key).map(|c| c.packets).unwrap_or(0);
            let after_count = after.0.get(&key).map(|c| c.packets).unwrap_or(0);
            let delta = after_count.saturating_sub(before_count);
            if delta == 0 {
                continue;
            }
            let verdict = rule.target.verdict();
            let verdict_matches = match mode {
                Mode::Blocking => matches!(verdict, Verdict::Drop | Verdict::Reject),
                Mode::Allowing => matches!(verdict, Verdict::Accept),
            };
            if !verdict_matches {
                continue;
            }
            if !predicates_match(&rule.predicates, tuple, &resolver) {
                continue;
            }
            candidates.push(RuleMatch { chain: chain.to_string(), index: rule.index, delta_packets: delta });
        }
    }

    candidates.sort_by(|a, b| {
        b.delta_packets.cmp(&a.delta_packets).then_with(|| a.chain.cmp(&b.chain)).then_with(|| a.index.cmp(&b.index))
    });
    candidates.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::iptables::{IptablesRule, Predicate, Target};
    use crate::model::metadata::RouterMetadata;
    use crate::model::router::Interface;
    use crate::model::types::{Proto, RouterId};
    use std::collections::HashMap;

    fn router_with_rules(rules: Vec<IptablesRule>) -> Router {
        let mut iptables = HashMap::new();
        iptables.insert((Table::Filter, "FORWARD".to_string()), rules);
        Router::new(
            "r1".to_string(),
            RouterId::new(0),
            vec![Interface { name: "eth0".into(), code: None, addresses: vec![], mtu: 1500, up: true }],
            HashMap::new(),
            vec![],
            iptables,
            HashMap::new(),
            String::new(),
            String::new(),
            RouterMetadata::default(),
        )
    }

    #[test]
    fn picks_the_rule_that_actually_incremented() {
        let rule = IptablesRule {
            table: Table::Filter,
            chain: "FORWARD".to_string(),
            index: 0,
            predicates: vec![Predicate::Dscp(40)],
            target: Target::Drop,
            counters: Counters { packets: 3, bytes: 300 },
        };
        let router = router_with_rules(vec![rule]);
        let before = Snapshot(HashMap::from([(("FORWARD".to_string(), 0), Counters::default())]));
        let after = Snapshot::capture(&router, Table::Filter);

        let tuple = PacketTuple::new(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            Proto::Tcp,
            1234,
            80,
        )
        .with_dscp(40);

        let result = analyze_delta(&router, &before, &after, &tuple, Table::Filter, Mode::Blocking).unwrap();
        assert_eq!(result.index, 0);
        assert_eq!(result.delta_packets, 3);
    }

    #[test]
    fn disjoint_dscp_does_not_attribute_to_wrong_job() {
        let rule = IptablesRule {
            table: Table::Filter,
            chain: "FORWARD".to_string(),
            index: 0,
            predicates: vec![Predicate::Dscp(40)],
            target: Target::Drop,
            counters: Counters { packets: 3, bytes: 300 },
        };
        let router = router_with_rules(vec![rule]);
        let before = Snapshot(HashMap::from([(("FORWARD".to_string(), 0), Counters::default())]));
        let after = Snapshot::capture(&router, Table::Filter);

        let other_job_tuple = PacketTuple::new(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            Proto::Tcp,
            1234,
            80,
        )
        .with_dscp(41);

        assert!(analyze_delta(&router, &before, &after, &other_job_tuple, Table::Filter, Mode::Blocking).is_none());
    }
}
