// Traceroute fleet simulator
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

#![deny(missing_docs)]

//! Persistent job queue, leader-elected scheduler, and the Reachability Orchestrator for the
//! traceroute fleet simulator.
//!
//! ## Structure
//!
//! - **[`queue`]**: the persistent FIFO Queue and the pure `pop_compatible` conflict rule.
//! - **[`history`]**: append-only record of finished jobs, for the leader's orphan sweep.
//! - **[`progress`]**: per-run JSONL progress log.
//! - **[`scheduler`]**: file-lock leader election, the DSCP allocator, per-router locks, and the
//!   bounded worker pool.
//! - **[`orchestrator`]**: the five-phase Reachability Orchestrator pipeline.

pub mod history;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod scheduler;
