// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Plan and drive a rolling software update across a cluster
//!
//! The fleet is split into groups by [`planner::plan_update()`].  Groups are
//! then updated one at a time by [`RollingUpdate`]; within a group, every
//! node is driven through its own [`driver_update::NodeUpdater`]
//! concurrently.  Before a node that holds a manager responsibility is
//! touched, that responsibility is handed to another node chosen by
//! [`failover::resolve_handoffs()`].  If too many nodes fail, the run stops
//! before the next group starts.
//!
//! Nothing in here knows how to talk to a node.  That's the job of a
//! [`NodeExecutor`]; [`sim::SimExecutor`] is one that only pretends.

mod coordinator;
pub mod driver_update;
mod executor;
pub mod failover;
pub mod planner;
mod registry;
pub mod sim;

pub use coordinator::GroupReport;
pub use coordinator::RollingUpdate;
pub use coordinator::RunError;
pub use coordinator::RunOutcome;
pub use coordinator::RunReport;
pub use driver_update::NodeUpdateResult;
pub use executor::ActionOutcome;
pub use executor::ExecutorError;
pub use executor::NodeExecutor;
pub use failover::FailoverError;
pub use failover::Handoff;
pub use registry::Registry;
pub use registry::RegistryError;
