// Traceroute fleet simulator, adapted from Snowcap's error model
// (snowcap::error::{Error, NetworkError}), which groups one thiserror enum per subsystem and
// funnels them into a single top-level `Error` via `#[from]`.
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

//! Crate-wide error types, one enum per subsystem plus a top-level [`Error`] that unifies them.

use crate::model::iptables::Table;
use thiserror::Error;

/// Errors raised while loading or validating the on-disk Facts Model.
#[derive(Debug, Error)]
pub enum FactsError {
    /// A router's fact file could not be read from disk.
    #[error("cannot read facts for {router}: {source}")]
    Io {
        /// Router whose facts file failed to read.
        router: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The fact file contained an unknown stanza, or failed strict JSON deserialization.
    #[error("malformed facts for {router}: {source}")]
    Malformed {
        /// Router whose facts file is malformed.
        router: String,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },
    /// An iptables chain's rule indices are not a dense `0..n` sequence.
    #[error("{router}: chain {chain} rule index {found} is not dense (expected {expected})")]
    NonDenseRuleIndex {
        /// Router the chain belongs to.
        router: String,
        /// Chain name.
        chain: String,
        /// Index actually found.
        found: usize,
        /// Index expected at this position.
        expected: usize,
    },
    /// A `match-set` predicate references an ipset that was never declared.
    #[error("{router}: rule references unknown ipset {set}")]
    UnknownIpset {
        /// Router the rule belongs to.
        router: String,
        /// Name of the missing ipset.
        set: String,
    },
    /// A CIDR string failed to parse or had an out-of-range prefix length.
    #[error("{router}: malformed CIDR {cidr}")]
    MalformedCidr {
        /// Router the CIDR was declared on.
        router: String,
        /// Offending CIDR text.
        cidr: String,
    },
    /// Two routers in the same facts directory declare the same name.
    #[error("duplicate router name {0} in facts directory")]
    DuplicateRouter(String),
    /// A router references a neighbor or subnet with no matching peer in the fleet.
    #[error("{router}: no fleet peer shares subnet {subnet}")]
    DanglingSubnet {
        /// Router declaring the subnet.
        router: String,
        /// Subnet with no peer.
        subnet: String,
    },
}

/// Errors raised while planning or executing a path.
#[derive(Debug, Error)]
pub enum PathError {
    /// The source router is not known to the fleet.
    #[error("unknown source router {0}")]
    UnknownSource(String),
    /// A hop produced a routing loop before reaching the destination.
    #[error("forwarding loop detected at {0}, prefix {1}")]
    ForwardingLoop(String, String),
    /// A hop's routing table had no matching route for the destination.
    #[error("blackhole at {0}: no route to {1}")]
    Blackhole(String, String),
    /// The hop count exceeded the configured cap without reaching a terminal state.
    #[error("path exceeded hop cap of {0}")]
    HopCapExceeded(usize),
    /// A probe tuple was invalid (e.g. zero address, malformed port range).
    #[error("invalid probe: {0}")]
    InvalidProbe(String),
}

/// Errors raised by the Ipset/Iptables Matcher while walking a chain.
#[derive(Debug, Error)]
pub enum MatcherError {
    /// A `-j <chain>` target jumps to a chain that was never declared.
    #[error("{router}: jump to undeclared chain {table}/{chain}")]
    UndeclaredChain {
        /// Router the jump occurs on.
        router: String,
        /// Table the chain lives in.
        table: Table,
        /// Missing chain name.
        chain: String,
    },
    /// Chain-to-chain jumps formed a cycle.
    #[error("{router}: jump cycle through chain {chain}")]
    JumpCycle {
        /// Router the cycle occurs on.
        router: String,
        /// Chain where the cycle was detected.
        chain: String,
    },
}

/// Errors raised by the live Namespace Fabric Builder (`tsim_fabric`).
#[derive(Debug, Error)]
pub enum FabricError {
    /// A `LinuxOps` subprocess call exited non-zero or failed to spawn.
    #[error("command {command} failed: {detail}")]
    CommandFailed {
        /// Command that was run (e.g. `ip`, `iptables-restore`).
        command: String,
        /// stderr or spawn-failure detail.
        detail: String,
    },
    /// The shared Registry could not be opened or is corrupt.
    #[error("registry error: {0}")]
    Registry(String),
    /// Two concurrent jobs tried to realize the same router namespace.
    #[error("router {0} is already held by another job")]
    RouterLocked(String),
    /// A namespace/veth resource could not be allocated (exhausted code space, name collision).
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

/// Errors raised by the Scheduler and Reachability Orchestrator (`tsim_scheduler`).
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The persisted job queue file is corrupt or unreadable.
    #[error("queue error: {0}")]
    Queue(String),
    /// A worker thread panicked or returned an internal error.
    #[error("worker {0} failed: {1}")]
    WorkerFailed(usize, String),
    /// No compatible job could be popped within the configured wait.
    #[error("no compatible job available")]
    NoCompatibleJob,
    /// Leader election failed to acquire the scheduler lock.
    #[error("could not acquire scheduler leader lock: {0}")]
    LeaderLockFailed(String),
}

/// Top-level error type returned by all public `tsim` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Error from the Facts Model loader.
    #[error("facts error: {0}")]
    Facts(#[from] FactsError),
    /// Error from the Path Planner.
    #[error("path error: {0}")]
    Path(#[from] PathError),
    /// Error from the Ipset/Iptables Matcher.
    #[error("matcher error: {0}")]
    Matcher(#[from] MatcherError),
    /// Error from the Namespace Fabric Builder.
    #[error("fabric error: {0}")]
    Fabric(#[from] FabricError),
    /// Error from the Scheduler.
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    /// Unclassified internal invariant violation; should never surface in normal operation.
    #[error("internal error: {0}")]
    Internal(String),
}
