// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fleet members and the per-run state tracked for each of them

use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

/// Weight of a node that is the primary or secondary configuration server.
///
/// This overrides whatever the node's role would give it.
pub const CONFIG_SERVER_WEIGHT: u32 = 11;
pub const QUORUM_MANAGER_WEIGHT: u32 = 8;
pub const QUORUM_WEIGHT: u32 = 5;
pub const MANAGER_WEIGHT: u32 = 3;
pub const CLIENT_WEIGHT: u32 = 1;

/// The role a node plays in the cluster
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    QuorumManager,
    Quorum,
    Manager,
    Client,
}

impl NodeRole {
    /// Returns true if nodes with this role may take over a manager
    /// responsibility from another node.
    pub fn is_quorum(&self) -> bool {
        matches!(self, NodeRole::QuorumManager | NodeRole::Quorum)
    }

    pub fn weight(&self) -> u32 {
        match self {
            NodeRole::QuorumManager => QUORUM_MANAGER_WEIGHT,
            NodeRole::Quorum => QUORUM_WEIGHT,
            NodeRole::Manager => MANAGER_WEIGHT,
            NodeRole::Client => CLIENT_WEIGHT,
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeRole::QuorumManager => "quorum-manager",
            NodeRole::Quorum => "quorum",
            NodeRole::Manager => "manager",
            NodeRole::Client => "client",
        };
        f.write_str(s)
    }
}

/// State of the filesystem daemon on a node, as last observed
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    Active,
    Down,
    Arbitrating,
    #[default]
    Unknown,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DaemonState::Active => "active",
            DaemonState::Down => "down",
            DaemonState::Arbitrating => "arbitrating",
            DaemonState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Where a node is in the current rolling update
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    #[default]
    Idle,
    Starting,
    RunningAction,
    Rebooting,
    Finished,
    Broken,
}

impl ActionStatus {
    /// Returns true while a node is in the middle of its own update.
    pub fn is_updating(&self) -> bool {
        matches!(
            self,
            ActionStatus::Starting
                | ActionStatus::RunningAction
                | ActionStatus::Rebooting
        )
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionStatus::Idle => "idle",
            ActionStatus::Starting => "starting",
            ActionStatus::RunningAction => "running_action",
            ActionStatus::Rebooting => "rebooting",
            ActionStatus::Finished => "finished",
            ActionStatus::Broken => "broken",
        };
        f.write_str(s)
    }
}

/// One member of the fleet
///
/// The node's weight is never stored: it is always derived from its role and
/// whether it is a configuration server (see [`NodeRecord::weight()`]).  The
/// serialized form carries a `weight` field for the benefit of people reading
/// snapshots, but it is ignored on the way back in.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(from = "NodeRecordRepr", into = "NodeRecordRepr")]
pub struct NodeRecord {
    pub short_name: String,
    pub admin_name: String,
    pub ip: IpAddr,
    pub role: NodeRole,
    pub is_config_server: bool,
    pub failure_groups: BTreeSet<i32>,
    pub daemon_state: DaemonState,
    pub action_status: ActionStatus,
    pub kernel_version: Option<String>,
    pub installed_software: BTreeMap<String, String>,
}

impl NodeRecord {
    /// Returns a record for a node that has not been touched by any update.
    pub fn new(
        short_name: impl Into<String>,
        admin_name: impl Into<String>,
        ip: IpAddr,
        role: NodeRole,
    ) -> NodeRecord {
        NodeRecord {
            short_name: short_name.into(),
            admin_name: admin_name.into(),
            ip,
            role,
            is_config_server: false,
            failure_groups: BTreeSet::new(),
            daemon_state: DaemonState::Unknown,
            action_status: ActionStatus::Idle,
            kernel_version: None,
            installed_software: BTreeMap::new(),
        }
    }

    /// Priority of this node when partitioning the fleet into update groups
    pub fn weight(&self) -> u32 {
        node_weight(self.role, self.is_config_server)
    }

    /// The failure group used to order nodes of equal weight
    ///
    /// Nodes that serve no disks sort as failure group 0.
    pub fn first_failure_group(&self) -> i32 {
        self.failure_groups.first().copied().unwrap_or(0)
    }
}

/// Computes the weight of a node from its role and configuration-server
/// designation.
pub fn node_weight(role: NodeRole, is_config_server: bool) -> u32 {
    if is_config_server { CONFIG_SERVER_WEIGHT } else { role.weight() }
}

#[derive(Deserialize, Serialize)]
struct NodeRecordRepr {
    short_name: String,
    admin_name: String,
    ip: IpAddr,
    role: NodeRole,
    #[serde(default)]
    is_config_server: bool,
    #[serde(default)]
    failure_groups: BTreeSet<i32>,
    #[serde(default)]
    weight: Option<u32>,
    #[serde(default)]
    daemon_state: DaemonState,
    #[serde(default)]
    action_status: ActionStatus,
    #[serde(default)]
    kernel_version: Option<String>,
    #[serde(default)]
    installed_software: BTreeMap<String, String>,
}

impl From<NodeRecordRepr> for NodeRecord {
    fn from(repr: NodeRecordRepr) -> Self {
        // `repr.weight` is deliberately dropped.
        NodeRecord {
            short_name: repr.short_name,
            admin_name: repr.admin_name,
            ip: repr.ip,
            role: repr.role,
            is_config_server: repr.is_config_server,
            failure_groups: repr.failure_groups,
            daemon_state: repr.daemon_state,
            action_status: repr.action_status,
            kernel_version: repr.kernel_version,
            installed_software: repr.installed_software,
        }
    }
}

impl From<NodeRecord> for NodeRecordRepr {
    fn from(node: NodeRecord) -> Self {
        let weight = Some(node.weight());
        NodeRecordRepr {
            short_name: node.short_name,
            admin_name: node.admin_name,
            ip: node.ip,
            role: node.role,
            is_config_server: node.is_config_server,
            failure_groups: node.failure_groups,
            weight,
            daemon_state: node.daemon_state,
            action_status: node.action_status,
            kernel_version: node.kernel_version,
            installed_software: node.installed_software,
        }
    }
}
