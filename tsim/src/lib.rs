// Traceroute fleet simulator
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

#![deny(missing_docs)]

//! Symbolic routing/firewall reachability engine for a fleet of Linux routers.
//!
//! Given the routing tables, policy rules, iptables FORWARD rules and ipsets of a fleet of Linux
//! routers (collected up front into a [`facts`] directory), this crate answers: can a TCP/UDP/ICMP
//! packet reach a destination from a given source, and if not, where is it blocked?
//!
//! ## Structure
//!
//! - **[`model`]**: the pure data model (routers, interfaces, routes, policy rules, iptables
//!   rules, ipsets). Nothing here touches the filesystem.
//! - **[`facts`]**: loads a facts directory into a [`fleet::Fleet`], enforcing the facts model's
//!   strictness (unknown stanza -> error, dense rule indices, known ipset references).
//! - **[`fleet`]**: the `Fleet` graph connecting routers that share an L2 subnet.
//! - **[`matcher`]**: the Ipset/Iptables Matcher, evaluating one rule or walking a whole chain.
//! - **[`routing`]**: the Routing Engine, policy-rule dispatch followed by longest-prefix match.
//! - **[`path_planner`]**: the Path Planner, the cross-router hop-by-hop traversal.
//! - **[`analyzer`]**: the Packet-Count Analyzer, attributing a counter delta to a rule.
//!
//! Everything that touches a kernel namespace, a subprocess, or a scheduler lives in the
//! `tsim_fabric` and `tsim_scheduler` crates; this crate is pure and synchronous.
//!
//! ```no_run
//! use std::path::Path;
//!
//! fn main() -> Result<(), tsim::Error> {
//!     let fleet = tsim::facts::load_fleet(Path::new("/etc/tsim/facts"))?;
//!     let path = tsim::path_planner::plan_path(
//!         &fleet,
//!         "10.1.1.1".parse().unwrap(),
//!         "10.1.2.1".parse().unwrap(),
//!         tsim::path_planner::DEFAULT_HOP_CAP,
//!     )?;
//!     println!("{:#?}", path);
//!     Ok(())
//! }
//! ```

pub mod analyzer;
mod error;
pub mod facts;
pub mod fleet;
pub mod matcher;
pub mod model;
pub mod path_planner;
pub mod routing;

pub use error::{Error, FabricError, FactsError, MatcherError, PathError, SchedulerError};

use std::sync::{Arc, RwLock};

/// Cooperative abort flag, shared between a long-running operation and whoever wants to cancel it.
///
/// Checking the flag takes a read lock; [`Stopper::try_is_stop`] throttles that check to roughly
/// one in nine calls so hot loops (the worker pool's job loop, a chain walk over many rules) do
/// not pay lock overhead on every iteration.
#[derive(Clone, Debug)]
pub struct Stopper {
    flag: Arc<RwLock<bool>>,
    calls_since_check: usize,
}

impl Default for Stopper {
    fn default() -> Self {
        Self::new()
    }
}

impl Stopper {
    /// Create a new, unset stopper.
    pub fn new() -> Self {
        Self { flag: Arc::new(RwLock::new(false)), calls_since_check: 0 }
    }

    /// Request that whoever polls this stopper stop. Blocks until the write lock is acquired.
    pub fn send_stop(&self) {
        *self.flag.write().unwrap() = true;
    }

    /// Throttled poll: returns `Some(bool)` only on roughly every ninth call, `None` otherwise, so
    /// a hot loop need not take the lock on every iteration.
    pub fn try_is_stop(&mut self) -> Option<bool> {
        self.calls_since_check += 1;
        if self.calls_since_check >= 9 {
            self.calls_since_check = 0;
            self.flag.try_read().map(|v| *v).ok()
        } else {
            None
        }
    }

    /// Unthrottled poll: blocks until the read lock is acquired.
    pub fn is_stop(&self) -> bool {
        *self.flag.read().unwrap()
    }
}
