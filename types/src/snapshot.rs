// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Serialized form of the fleet handed to (and written back by) the rolling
//! update engine

use crate::ManagerAssignments;
use crate::NodeRecord;
use crate::NodeRole;
use crate::ResourceKey;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use thiserror::Error;

/// Everything the engine knows about the fleet at a point in time
///
/// This is produced by whatever discovered the cluster, and written back out
/// in the same shape when a run finishes.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ClusterSnapshot {
    /// all nodes, keyed by short name
    pub nodes: BTreeMap<String, NodeRecord>,
    /// current owner of each manager responsibility
    #[serde(default)]
    pub managers: ManagerAssignments,
    /// short names of nodes eligible to take over a manager responsibility,
    /// in preference order
    #[serde(default)]
    pub quorum_nodes: Vec<String>,
    /// number of quorum nodes that must stay up for the cluster to stay up
    #[serde(default)]
    pub min_quorum_nodes: Option<usize>,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to parse cluster snapshot")]
    Parse(#[from] serde_json::Error),
    #[error("node stored under key {key:?} has short name {short_name:?}")]
    NodeKeyMismatch { key: String, short_name: String },
    #[error("manager of {resource} is unknown node {node:?}")]
    UnknownManager { resource: ResourceKey, node: String },
    #[error("quorum pool names unknown node {0:?}")]
    UnknownQuorumNode(String),
    #[error("quorum pool names {node:?} more than once")]
    DuplicateQuorumNode { node: String },
    #[error("quorum pool names {node:?}, whose role is {role}")]
    NotQuorumCapable { node: String, role: NodeRole },
}

impl ClusterSnapshot {
    /// Checks that the snapshot is internally consistent.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        for (key, node) in &self.nodes {
            if *key != node.short_name {
                return Err(SnapshotError::NodeKeyMismatch {
                    key: key.clone(),
                    short_name: node.short_name.clone(),
                });
            }
        }

        for (resource, owner) in &self.managers {
            if !self.nodes.contains_key(owner) {
                return Err(SnapshotError::UnknownManager {
                    resource: resource.clone(),
                    node: owner.clone(),
                });
            }
        }

        let mut seen = BTreeSet::new();
        for name in &self.quorum_nodes {
            let Some(node) = self.nodes.get(name) else {
                return Err(SnapshotError::UnknownQuorumNode(name.clone()));
            };
            if !node.role.is_quorum() {
                return Err(SnapshotError::NotQuorumCapable {
                    node: name.clone(),
                    role: node.role,
                });
            }
            if !seen.insert(name.as_str()) {
                return Err(SnapshotError::DuplicateQuorumNode {
                    node: name.clone(),
                });
            }
        }

        Ok(())
    }

    /// Parses a snapshot from JSON and validates it.
    pub fn from_json(data: &str) -> Result<ClusterSnapshot, SnapshotError> {
        let snapshot: ClusterSnapshot = serde_json::from_str(data)?;
        snapshot.validate()?;
        Ok(snapshot)
    }
}
