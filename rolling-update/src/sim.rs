// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A simulated fleet that a rolling update can be run against
//!
//! [`SimExecutor`] keeps its own idea of each node's installed software,
//! daemon state, and of who manages what.  Successful update actions install
//! the target version of every package (including the glue package for the
//! node's running kernel).  Individual nodes can be told to misbehave, and
//! every call is recorded so tests can check what was asked of the fleet and
//! in which order.

use crate::ActionOutcome;
use crate::ExecutorError;
use crate::NodeExecutor;
use async_trait::async_trait;
use rolling_update_types::ClusterSnapshot;
use rolling_update_types::DaemonState;
use rolling_update_types::ManagerAssignments;
use rolling_update_types::NodeRecord;
use rolling_update_types::ResourceKey;
use rolling_update_types::TargetVersion;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

/// One request made of the simulated fleet
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SimCall {
    UpdateAction { node: String, version: String, reboot: bool, dry_run: bool },
    QueryInstalledSoftware { node: String },
    QueryDaemonState { node: String },
    StartDaemon { node: String },
    ChangeManager { resource: ResourceKey, new_manager: String },
}

/// How a node's daemon behaves after it has been updated
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DaemonBehavior {
    /// comes back up on its own
    #[default]
    Healthy,
    /// stays down until explicitly started
    DownUntilRestart,
    /// never comes back
    NeverActive,
}

#[derive(Debug)]
struct SimNode {
    kernel_version: Option<String>,
    installed_software: BTreeMap<String, String>,
    daemon_state: DaemonState,
    daemon_behavior: DaemonBehavior,
    fail_update: bool,
    panic_on_update: bool,
    stale_packages: BTreeSet<String>,
}

#[derive(Debug)]
struct SimState {
    nodes: BTreeMap<String, SimNode>,
    managers: ManagerAssignments,
    refuse_manager_changes: bool,
    action_delay: Duration,
    calls: Vec<SimCall>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Simulated fleet
#[derive(Debug)]
pub struct SimExecutor {
    glue_package_prefix: String,
    inner: Mutex<SimState>,
}

impl SimExecutor {
    /// Builds a simulated fleet that starts out looking like `snapshot`.
    pub fn new(
        snapshot: &ClusterSnapshot,
        glue_package_prefix: &str,
    ) -> SimExecutor {
        let nodes = snapshot
            .nodes
            .iter()
            .map(|(name, node)| {
                let sim_node = SimNode {
                    kernel_version: node.kernel_version.clone(),
                    installed_software: node.installed_software.clone(),
                    daemon_state: node.daemon_state,
                    daemon_behavior: DaemonBehavior::default(),
                    fail_update: false,
                    panic_on_update: false,
                    stale_packages: BTreeSet::new(),
                };
                (name.clone(), sim_node)
            })
            .collect();
        SimExecutor {
            glue_package_prefix: glue_package_prefix.to_string(),
            inner: Mutex::new(SimState {
                nodes,
                managers: snapshot.managers.clone(),
                refuse_manager_changes: false,
                action_delay: Duration::ZERO,
                calls: Vec::new(),
                in_flight: 0,
                max_in_flight: 0,
            }),
        }
    }

    fn with_node<T>(&self, name: &str, f: impl FnOnce(&mut SimNode) -> T) -> T {
        let mut inner = self.inner.lock().unwrap();
        let node = inner
            .nodes
            .get_mut(name)
            .unwrap_or_else(|| panic!("no simulated node named {name:?}"));
        f(node)
    }

    /// Makes the update action on `node` report failure.
    pub fn fail_update(&self, node: &str) {
        self.with_node(node, |n| n.fail_update = true);
    }

    /// Makes the update action on `node` panic.
    pub fn panic_on_update(&self, node: &str) {
        self.with_node(node, |n| n.panic_on_update = true);
    }

    pub fn set_daemon_behavior(&self, node: &str, behavior: DaemonBehavior) {
        self.with_node(node, |n| n.daemon_behavior = behavior);
    }

    /// Makes updates on `node` leave `package` at its old version.
    pub fn leave_package_stale(&self, node: &str, package: &str) {
        self.with_node(node, |n| {
            n.stale_packages.insert(package.to_string());
        });
    }

    pub fn refuse_manager_changes(&self, refuse: bool) {
        self.inner.lock().unwrap().refuse_manager_changes = refuse;
    }

    /// Makes every update action take at least `delay`.
    pub fn set_action_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().action_delay = delay;
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// The largest number of update actions that were ever running at once
    pub fn max_in_flight(&self) -> usize {
        self.inner.lock().unwrap().max_in_flight
    }

    pub fn managers(&self) -> ManagerAssignments {
        self.inner.lock().unwrap().managers.clone()
    }

    pub fn installed_software(
        &self,
        node: &str,
    ) -> Option<BTreeMap<String, String>> {
        let inner = self.inner.lock().unwrap();
        inner.nodes.get(node).map(|n| n.installed_software.clone())
    }

    pub fn daemon_state(&self, node: &str) -> Option<DaemonState> {
        let inner = self.inner.lock().unwrap();
        inner.nodes.get(node).map(|n| n.daemon_state)
    }

    fn install(&self, node: &mut SimNode, version: &TargetVersion) {
        let stale = &node.stale_packages;
        for (name, installed) in node.installed_software.iter_mut() {
            if name.starts_with(&self.glue_package_prefix)
                || stale.contains(name)
            {
                continue;
            }
            *installed = version.to_string();
        }
        if let Some(kernel) = &node.kernel_version {
            let glue = format!("{}{}", self.glue_package_prefix, kernel);
            if !stale.contains(&glue) {
                node.installed_software.insert(glue, version.to_string());
            }
        }
        node.daemon_state = match node.daemon_behavior {
            DaemonBehavior::Healthy => DaemonState::Active,
            DaemonBehavior::DownUntilRestart | DaemonBehavior::NeverActive => {
                DaemonState::Down
            }
        };
    }
}

#[async_trait]
impl NodeExecutor for SimExecutor {
    async fn run_update_action(
        &self,
        node: &NodeRecord,
        version: &TargetVersion,
        reboot: bool,
        dry_run: bool,
    ) -> Result<ActionOutcome, ExecutorError> {
        let delay = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.nodes.contains_key(&node.short_name) {
                return Err(ExecutorError::UnknownNode(node.short_name.clone()));
            }
            inner.calls.push(SimCall::UpdateAction {
                node: node.short_name.clone(),
                version: version.to_string(),
                reboot,
                dry_run,
            });
            inner.in_flight += 1;
            inner.max_in_flight = inner.max_in_flight.max(inner.in_flight);
            inner.action_delay
        };

        tokio::time::sleep(delay).await;

        let mut inner = self.inner.lock().unwrap();
        inner.in_flight -= 1;
        let Some(sim_node) = inner.nodes.get_mut(&node.short_name) else {
            return Err(ExecutorError::UnknownNode(node.short_name.clone()));
        };
        if sim_node.panic_on_update {
            drop(inner);
            panic!("simulated panic updating {}", node.short_name);
        }
        if sim_node.fail_update {
            return Ok(ActionOutcome::failure(format!(
                "simulated failure installing {version}"
            )));
        }
        if dry_run {
            return Ok(ActionOutcome::success(format!(
                "would install {version}"
            )));
        }
        self.install(sim_node, version);
        Ok(ActionOutcome::success(format!("installed {version}")))
    }

    async fn query_installed_software(
        &self,
        node: &NodeRecord,
    ) -> Result<BTreeMap<String, String>, ExecutorError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(SimCall::QueryInstalledSoftware {
            node: node.short_name.clone(),
        });
        inner
            .nodes
            .get(&node.short_name)
            .map(|n| n.installed_software.clone())
            .ok_or_else(|| ExecutorError::UnknownNode(node.short_name.clone()))
    }

    async fn query_daemon_state(
        &self,
        node: &NodeRecord,
    ) -> Result<DaemonState, ExecutorError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .calls
            .push(SimCall::QueryDaemonState { node: node.short_name.clone() });
        inner
            .nodes
            .get(&node.short_name)
            .map(|n| n.daemon_state)
            .ok_or_else(|| ExecutorError::UnknownNode(node.short_name.clone()))
    }

    async fn start_daemon(
        &self,
        node: &NodeRecord,
    ) -> Result<(), ExecutorError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .calls
            .push(SimCall::StartDaemon { node: node.short_name.clone() });
        let sim_node = inner
            .nodes
            .get_mut(&node.short_name)
            .ok_or_else(|| {
                ExecutorError::UnknownNode(node.short_name.clone())
            })?;
        if sim_node.daemon_behavior != DaemonBehavior::NeverActive {
            sim_node.daemon_state = DaemonState::Active;
        }
        Ok(())
    }

    async fn change_manager(
        &self,
        resource: &ResourceKey,
        new_manager: &str,
    ) -> Result<bool, ExecutorError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(SimCall::ChangeManager {
            resource: resource.clone(),
            new_manager: new_manager.to_string(),
        });
        if inner.refuse_manager_changes {
            return Ok(false);
        }
        if !inner.nodes.contains_key(new_manager) {
            return Err(ExecutorError::UnknownNode(new_manager.to_string()));
        }
        inner.managers.insert(resource.clone(), new_manager.to_string());
        Ok(true)
    }
}
