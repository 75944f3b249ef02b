// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use async_trait::async_trait;
use rolling_update_types::DaemonState;
use rolling_update_types::NodeRecord;
use rolling_update_types::ResourceKey;
use rolling_update_types::TargetVersion;
use std::collections::BTreeMap;
use thiserror::Error;

/// What came back from asking a node to update itself
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ActionOutcome {
    pub success: bool,
    pub message: String,
}

impl ActionOutcome {
    pub fn success(message: impl Into<String>) -> ActionOutcome {
        ActionOutcome { success: true, message: message.into() }
    }

    pub fn failure(message: impl Into<String>) -> ActionOutcome {
        ActionOutcome { success: false, message: message.into() }
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to start {what} for {node}")]
    Spawn {
        node: String,
        what: &'static str,
        #[source]
        error: std::io::Error,
    },
    #[error("{what} for {node} failed: {message}")]
    Command { node: String, what: &'static str, message: String },
    #[error("unexpected output from {what} for {node}: {message}")]
    Output { node: String, what: &'static str, message: String },
    #[error("no {what} command is configured")]
    NotConfigured { what: &'static str },
    #[error("node {0:?} is not known to this executor")]
    UnknownNode(String),
}

/// Carries out actions on nodes on behalf of the rolling update
///
/// Implementations are responsible for getting to the node (ssh, a parallel
/// shell, a simulator, ...).  The rolling update only ever looks at what
/// these return.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Installs `version` on `node`, rebooting it afterwards if `reboot`.
    ///
    /// When `dry_run` is set, implementations must not change anything on
    /// the node.
    async fn run_update_action(
        &self,
        node: &NodeRecord,
        version: &TargetVersion,
        reboot: bool,
        dry_run: bool,
    ) -> Result<ActionOutcome, ExecutorError>;

    /// Returns the version of every package installed on `node`, keyed by
    /// package name.
    async fn query_installed_software(
        &self,
        node: &NodeRecord,
    ) -> Result<BTreeMap<String, String>, ExecutorError>;

    async fn query_daemon_state(
        &self,
        node: &NodeRecord,
    ) -> Result<DaemonState, ExecutorError>;

    /// Asks the filesystem daemon on `node` to start.
    async fn start_daemon(
        &self,
        node: &NodeRecord,
    ) -> Result<(), ExecutorError>;

    /// Makes `new_manager` responsible for `resource`.
    ///
    /// Returns whether the cluster accepted the change.
    async fn change_manager(
        &self,
        resource: &ResourceKey,
        new_manager: &str,
    ) -> Result<bool, ExecutorError>;
}
