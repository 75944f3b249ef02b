// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory view of the fleet while a rolling update runs

use rolling_update_types::ActionStatus;
use rolling_update_types::ClusterSnapshot;
use rolling_update_types::DaemonState;
use rolling_update_types::ManagerAssignments;
use rolling_update_types::NodeRecord;
use rolling_update_types::ResourceKey;
use rolling_update_types::SnapshotError;
use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no node named {0:?} in the registry")]
    UnknownNode(String),
    #[error("no manager assignment for {0}")]
    UnknownResource(ResourceKey),
}

/// Nodes, manager assignments, and the set of nodes that have finished
///
/// The set of nodes and the set of manager responsibilities are fixed when
/// the registry is built.  Each entry has its own lock, so writes to one node
/// never wait on another, while writes to the same node are serialized.
pub struct Registry {
    nodes: BTreeMap<String, Mutex<NodeRecord>>,
    managers: BTreeMap<ResourceKey, Mutex<String>>,
    quorum_pool: Vec<String>,
    min_quorum_nodes: Option<usize>,
    finished: Mutex<Vec<String>>,
}

impl Registry {
    pub fn new(snapshot: ClusterSnapshot) -> Result<Registry, SnapshotError> {
        snapshot.validate()?;

        let ClusterSnapshot {
            nodes,
            managers,
            quorum_nodes,
            min_quorum_nodes,
        } = snapshot;
        Ok(Registry {
            nodes: nodes
                .into_iter()
                .map(|(name, node)| (name, Mutex::new(node)))
                .collect(),
            managers: managers
                .into_iter()
                .map(|(resource, owner)| (resource, Mutex::new(owner)))
                .collect(),
            quorum_pool: quorum_nodes,
            min_quorum_nodes,
            finished: Mutex::new(Vec::new()),
        })
    }

    fn entry(&self, name: &str) -> Result<&Mutex<NodeRecord>, RegistryError> {
        self.nodes
            .get(name)
            .ok_or_else(|| RegistryError::UnknownNode(name.to_string()))
    }

    pub fn node(&self, name: &str) -> Result<NodeRecord, RegistryError> {
        Ok(self.entry(name)?.lock().unwrap().clone())
    }

    /// Returns every node, ordered by short name.
    pub fn nodes(&self) -> Vec<NodeRecord> {
        self.nodes.values().map(|n| n.lock().unwrap().clone()).collect()
    }

    pub fn action_statuses(&self) -> BTreeMap<String, ActionStatus> {
        self.nodes
            .iter()
            .map(|(name, n)| (name.clone(), n.lock().unwrap().action_status))
            .collect()
    }

    pub fn set_action_status(
        &self,
        name: &str,
        status: ActionStatus,
    ) -> Result<(), RegistryError> {
        self.entry(name)?.lock().unwrap().action_status = status;
        Ok(())
    }

    pub fn set_daemon_state(
        &self,
        name: &str,
        state: DaemonState,
    ) -> Result<(), RegistryError> {
        self.entry(name)?.lock().unwrap().daemon_state = state;
        Ok(())
    }

    pub fn set_installed_software(
        &self,
        name: &str,
        software: BTreeMap<String, String>,
    ) -> Result<(), RegistryError> {
        self.entry(name)?.lock().unwrap().installed_software = software;
        Ok(())
    }

    pub fn manager_of(&self, resource: &ResourceKey) -> Option<String> {
        self.managers.get(resource).map(|owner| owner.lock().unwrap().clone())
    }

    pub fn managers(&self) -> ManagerAssignments {
        self.managers
            .iter()
            .map(|(resource, owner)| {
                (resource.clone(), owner.lock().unwrap().clone())
            })
            .collect()
    }

    pub fn set_manager(
        &self,
        resource: &ResourceKey,
        owner: &str,
    ) -> Result<(), RegistryError> {
        if !self.nodes.contains_key(owner) {
            return Err(RegistryError::UnknownNode(owner.to_string()));
        }
        let slot = self
            .managers
            .get(resource)
            .ok_or_else(|| RegistryError::UnknownResource(resource.clone()))?;
        *slot.lock().unwrap() = owner.to_string();
        Ok(())
    }

    /// Nodes eligible to take over a manager responsibility, in preference
    /// order
    pub fn quorum_pool(&self) -> &[String] {
        &self.quorum_pool
    }

    pub fn min_quorum_nodes(&self) -> Option<usize> {
        self.min_quorum_nodes
    }

    /// Nodes that have completed this update successfully, in the order in
    /// which they finished
    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().unwrap().clone()
    }

    pub fn mark_finished(&self, name: &str) -> Result<(), RegistryError> {
        self.entry(name)?;
        let mut finished = self.finished.lock().unwrap();
        if !finished.iter().any(|n| n == name) {
            finished.push(name.to_string());
        }
        Ok(())
    }

    /// Returns the current state in the same shape the registry was built
    /// from.
    pub fn snapshot(&self) -> ClusterSnapshot {
        ClusterSnapshot {
            nodes: self
                .nodes
                .iter()
                .map(|(name, n)| (name.clone(), n.lock().unwrap().clone()))
                .collect(),
            managers: self.managers(),
            quorum_nodes: self.quorum_pool.clone(),
            min_quorum_nodes: self.min_quorum_nodes,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rolling_update_types::NodeRole;
    use std::net::IpAddr;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn snapshot() -> ClusterSnapshot {
        let mut snapshot = ClusterSnapshot::default();
        for (i, (name, role)) in [
            ("qm1", NodeRole::QuorumManager),
            ("qm2", NodeRole::QuorumManager),
            ("c1", NodeRole::Client),
        ]
        .into_iter()
        .enumerate()
        {
            let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, i as u8 + 1));
            snapshot.nodes.insert(
                name.to_string(),
                NodeRecord::new(name, format!("{name}.example.com"), ip, role),
            );
        }
        snapshot.managers.insert(ResourceKey::Cluster, "qm1".to_string());
        snapshot.quorum_nodes = vec!["qm1".to_string(), "qm2".to_string()];
        snapshot
    }

    #[test]
    fn test_updates_are_keyed() {
        let registry = Registry::new(snapshot()).unwrap();
        registry.set_action_status("c1", ActionStatus::Starting).unwrap();
        registry.set_daemon_state("c1", DaemonState::Active).unwrap();
        assert_eq!(
            registry.node("c1").unwrap().action_status,
            ActionStatus::Starting
        );
        assert_eq!(
            registry.node("qm1").unwrap().action_status,
            ActionStatus::Idle
        );

        assert_eq!(
            registry.set_action_status("nope", ActionStatus::Broken),
            Err(RegistryError::UnknownNode("nope".to_string()))
        );
        assert_eq!(
            registry.set_manager(&ResourceKey::filesystem("fs1"), "qm2"),
            Err(RegistryError::UnknownResource(ResourceKey::filesystem(
                "fs1"
            )))
        );
        assert_eq!(
            registry.set_manager(&ResourceKey::Cluster, "ghost"),
            Err(RegistryError::UnknownNode("ghost".to_string()))
        );

        registry.set_manager(&ResourceKey::Cluster, "qm2").unwrap();
        assert_eq!(
            registry.manager_of(&ResourceKey::Cluster).as_deref(),
            Some("qm2")
        );
    }

    #[test]
    fn test_finished_only_grows() {
        let registry = Registry::new(snapshot()).unwrap();
        registry.mark_finished("qm2").unwrap();
        registry.mark_finished("c1").unwrap();
        registry.mark_finished("qm2").unwrap();
        assert_eq!(registry.finished(), ["qm2", "c1"]);
        assert!(registry.mark_finished("ghost").is_err());
    }

    #[test]
    fn test_concurrent_writers() {
        let registry = Arc::new(Registry::new(snapshot()).unwrap());
        let handles: Vec<_> = ["qm1", "qm2", "c1"]
            .into_iter()
            .map(|name| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        registry
                            .set_action_status(name, ActionStatus::Starting)
                            .unwrap();
                        registry
                            .set_action_status(name, ActionStatus::Finished)
                            .unwrap();
                        registry.mark_finished(name).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut finished = registry.finished();
        finished.sort();
        assert_eq!(finished, ["c1", "qm1", "qm2"]);
        assert!(
            registry
                .nodes()
                .iter()
                .all(|n| n.action_status == ActionStatus::Finished)
        );
    }

    #[test]
    fn test_snapshot_matches_input() {
        let input = snapshot();
        let registry = Registry::new(input.clone()).unwrap();
        assert_eq!(registry.snapshot(), input);
    }
}
