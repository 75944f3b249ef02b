// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Canned clusters for tests

use rolling_update_types::ClusterSnapshot;
use rolling_update_types::DaemonState;
use rolling_update_types::NodeRecord;
use rolling_update_types::NodeRole;
use rolling_update_types::ResourceKey;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::net::Ipv4Addr;

/// Version every node in a canned cluster starts out running
pub const INSTALLED_VERSION: &str = "3.5.0-7";
/// Version the canned clusters are usually updated to
pub const TARGET_VERSION: &str = "3.5.0-11";
/// Kernel every node in a canned cluster is running
pub const KERNEL_VERSION: &str = "2.6.32-358.el6.x86_64";
pub const GLUE_PACKAGE_PREFIX: &str = "gpfs.gplbin-";

/// Packages installed on every node of a canned cluster
pub fn installed_software(version: &str) -> BTreeMap<String, String> {
    ["gpfs.base", "gpfs.docs", "gpfs.gpl", "gpfs.msg.en_US"]
        .into_iter()
        .map(String::from)
        .chain(std::iter::once(format!(
            "{GLUE_PACKAGE_PREFIX}{KERNEL_VERSION}"
        )))
        .map(|name| (name, version.to_string()))
        .collect()
}

/// Returns a healthy node running [`INSTALLED_VERSION`].
pub fn node(
    name: &str,
    index: u8,
    role: NodeRole,
    is_config_server: bool,
    failure_groups: &[i32],
) -> NodeRecord {
    let mut node = NodeRecord::new(
        name,
        format!("{name}-admin.example.com"),
        IpAddr::V4(Ipv4Addr::new(10, 1, 0, index)),
        role,
    );
    node.is_config_server = is_config_server;
    node.failure_groups.extend(failure_groups.iter().copied());
    node.daemon_state = DaemonState::Active;
    node.kernel_version = Some(KERNEL_VERSION.to_string());
    node.installed_software = installed_software(INSTALLED_VERSION);
    node
}

/// Six nodes: two quorum-managers (`qm1` is the primary configuration server
/// and the cluster manager, `qm2` manages filesystem `gpfs0`), two quorum
/// nodes, and two clients.
///
/// Split into three groups this gives `[qm1, q1]`, `[qm2, c1]`, `[q2, c2]`.
pub fn six_node_cluster() -> ClusterSnapshot {
    let nodes = [
        node("qm1", 1, NodeRole::QuorumManager, true, &[1]),
        node("qm2", 2, NodeRole::QuorumManager, false, &[2]),
        node("q1", 3, NodeRole::Quorum, false, &[2]),
        node("q2", 4, NodeRole::Quorum, false, &[1]),
        node("c1", 5, NodeRole::Client, false, &[]),
        node("c2", 6, NodeRole::Client, false, &[]),
    ];
    ClusterSnapshot {
        nodes: nodes
            .into_iter()
            .map(|n| (n.short_name.clone(), n))
            .collect(),
        managers: [
            (ResourceKey::Cluster, "qm1".to_string()),
            (ResourceKey::filesystem("gpfs0"), "qm2".to_string()),
        ]
        .into_iter()
        .collect(),
        quorum_nodes: ["qm1", "qm2", "q1", "q2"]
            .into_iter()
            .map(String::from)
            .collect(),
        min_quorum_nodes: Some(3),
    }
}
