// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared by the rolling update planner, its executor, and the
//! command-line tooling built on top of them.

pub mod managers;
pub mod node;
pub mod plan;
pub mod snapshot;
pub mod version;

pub use managers::ManagerAssignments;
pub use managers::ResourceKey;
pub use node::ActionStatus;
pub use node::DaemonState;
pub use node::NodeRecord;
pub use node::NodeRole;
pub use plan::UpdateGroup;
pub use plan::UpdatePlan;
pub use snapshot::ClusterSnapshot;
pub use snapshot::SnapshotError;
pub use version::TargetVersion;
pub use version::TargetVersionError;
