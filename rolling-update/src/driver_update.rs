// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drive one node through its update
//!
//! A node starts out `Starting` (the coordinator puts it there), hands off
//! any manager responsibilities it holds, moves to `RunningAction` while the
//! update itself runs, optionally `Rebooting`, and ends up either `Finished`
//! or `Broken`.  Nothing here writes to the [`crate::Registry`]: the outcome
//! is returned as a [`NodeUpdateResult`] for the coordinator to merge.

use crate::FailoverError;
use crate::Handoff;
use crate::NodeExecutor;
use rolling_update_types::ActionStatus;
use rolling_update_types::DaemonState;
use rolling_update_types::NodeRecord;
use rolling_update_types::TargetVersion;
use slog::Logger;
use slog::{debug, error, info, o, warn};
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// How long to wait after restarting the daemon before checking on it again
pub const DEFAULT_RESTART_SETTLE: Duration = Duration::from_secs(30);

/// Name prefix of the package that binds the filesystem to a particular
/// kernel.  The rest of the package name is the kernel version.
pub const DEFAULT_GLUE_PACKAGE_PREFIX: &str = "gpfs.gplbin-";

/// Settings shared by every node in a run
#[derive(Clone, Debug)]
pub struct UpdateSettings {
    pub target_version: TargetVersion,
    pub reboot: bool,
    pub dry_run: bool,
    pub restart_settle: Duration,
    pub glue_package_prefix: String,
}

/// What happened to one node
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeUpdateResult {
    pub short_name: String,
    pub final_status: ActionStatus,
    /// daemon state observed at the end (not checked in dry runs)
    pub final_daemon_state: Option<DaemonState>,
    /// installed software observed at the end (not checked in dry runs)
    pub installed_software: Option<BTreeMap<String, String>>,
    /// manager handoffs that took place (or, for an interrupted update,
    /// may have)
    pub handoffs: Vec<Handoff>,
    /// every status the node passed through, in order
    pub transitions: Vec<ActionStatus>,
    /// problems found while checking installed software
    pub verification_errors: Vec<String>,
    /// why the node ended up `Broken`
    pub failure: Option<String>,
    pub failed: bool,
}

impl NodeUpdateResult {
    /// Returns a result for a node whose update never got to run at all.
    pub fn broken(short_name: &str, reason: impl Into<String>) -> Self {
        NodeUpdateResult {
            short_name: short_name.to_string(),
            final_status: ActionStatus::Broken,
            final_daemon_state: None,
            installed_software: None,
            handoffs: Vec::new(),
            transitions: vec![ActionStatus::Broken],
            verification_errors: Vec::new(),
            failure: Some(reason.into()),
            failed: true,
        }
    }

    /// Returns a result for a node whose update stopped partway through
    /// (its task panicked or was lost).  Whether `handoffs` took place is
    /// unknown, so they are reported as done: the old manager may already
    /// have given the role away, and treating it as a manager again would
    /// let its successor be updated without a handoff.
    pub fn interrupted(
        short_name: &str,
        reason: impl Into<String>,
        handoffs: Vec<Handoff>,
    ) -> Self {
        NodeUpdateResult {
            handoffs,
            ..NodeUpdateResult::broken(short_name, reason)
        }
    }

    /// Returns true if the node finished and passed verification.
    pub fn succeeded(&self) -> bool {
        self.final_status == ActionStatus::Finished && !self.failed
    }
}

/// Checks `installed` against `target`.
///
/// Every package must be at `target`, with one exception: glue packages
/// (those named `glue_prefix` followed by a kernel version) only matter for
/// the kernel the node is actually running.  Exactly one glue package for
/// that kernel must be installed at `target`.
///
/// Returns a description of each problem found.
pub fn verify_installed_software(
    installed: &BTreeMap<String, String>,
    target: &TargetVersion,
    kernel_version: Option<&str>,
    glue_prefix: &str,
) -> Vec<String> {
    let mut problems = Vec::new();
    let mut running_kernel_glue = Vec::new();

    for (name, version) in installed {
        if let Some(glue_kernel) = name.strip_prefix(glue_prefix) {
            if Some(glue_kernel) == kernel_version {
                running_kernel_glue.push((name, version));
            }
            continue;
        }
        if !target.matches(version) {
            problems.push(format!(
                "{name} is at version {version}, expected {target}"
            ));
        }
    }

    match kernel_version {
        None => problems.push(format!(
            "kernel version is unknown, so no {glue_prefix}* package can be \
             checked"
        )),
        Some(kernel) => {
            let matching = running_kernel_glue
                .iter()
                .filter(|(_, version)| target.matches(version))
                .count();
            if matching != 1 {
                let found: Vec<_> = running_kernel_glue
                    .iter()
                    .map(|(name, version)| format!("{name} {version}"))
                    .collect();
                problems.push(format!(
                    "expected exactly one {glue_prefix}{kernel} package at \
                     version {target}, found {matching} (installed: {})",
                    if found.is_empty() {
                        "none".to_string()
                    } else {
                        found.join(", ")
                    }
                ));
            }
        }
    }

    problems
}

/// Drives a single node through its update
pub struct NodeUpdater {
    log: Logger,
    node: NodeRecord,
    failover: Result<Vec<Handoff>, FailoverError>,
    executor: Arc<dyn NodeExecutor>,
    settings: Arc<UpdateSettings>,
    status: ActionStatus,
    transitions: Vec<ActionStatus>,
    handoffs: Vec<Handoff>,
}

impl NodeUpdater {
    /// `failover` is the outcome of resolving this node's manager handoffs.
    /// If it's an error, the node goes straight to `Broken`.
    pub fn new(
        log: &Logger,
        node: NodeRecord,
        failover: Result<Vec<Handoff>, FailoverError>,
        executor: Arc<dyn NodeExecutor>,
        settings: Arc<UpdateSettings>,
    ) -> NodeUpdater {
        let log = log.new(o!(
            "component" => "NodeUpdater",
            "node" => node.short_name.clone(),
            "dry_run" => settings.dry_run,
        ));
        NodeUpdater {
            log,
            node,
            failover,
            executor,
            settings,
            status: ActionStatus::Starting,
            transitions: vec![ActionStatus::Starting],
            handoffs: Vec::new(),
        }
    }

    fn transition(&mut self, next: ActionStatus) {
        debug!(
            self.log, "status change";
            "from" => %self.status,
            "to" => %next,
        );
        self.status = next;
        self.transitions.push(next);
    }

    /// Runs the update to completion (or failure).
    pub async fn run(mut self) -> NodeUpdateResult {
        let failover = std::mem::replace(&mut self.failover, Ok(Vec::new()));
        let handoffs = match failover {
            Ok(handoffs) => handoffs,
            Err(error) => {
                return self.fail(error.to_string(), None, None, Vec::new());
            }
        };

        for handoff in handoffs {
            if let Err(reason) = self.hand_off(&handoff).await {
                return self.fail(reason, None, None, Vec::new());
            }
            self.handoffs.push(handoff);
        }

        self.transition(ActionStatus::RunningAction);
        let settings = Arc::clone(&self.settings);
        info!(
            self.log, "running update action";
            "version" => %settings.target_version,
            "reboot" => settings.reboot,
        );
        let outcome = self
            .executor
            .run_update_action(
                &self.node,
                &settings.target_version,
                settings.reboot,
                settings.dry_run,
            )
            .await;
        match outcome {
            Ok(outcome) if outcome.success => {
                info!(
                    self.log, "update action completed";
                    "message" => &outcome.message,
                );
            }
            Ok(outcome) => {
                let reason =
                    format!("update action failed: {}", outcome.message);
                return self.fail(reason, None, None, Vec::new());
            }
            Err(error) => {
                let reason = format!(
                    "update action failed: {}",
                    InlineErrorChain::new(&error)
                );
                return self.fail(reason, None, None, Vec::new());
            }
        }

        if settings.reboot {
            self.transition(ActionStatus::Rebooting);
            info!(self.log, "node is rebooting");
        }

        if settings.dry_run {
            info!(self.log, "skipping post-update verification");
            return self.finish(None, None, Vec::new());
        }

        let (software, verification_errors) = self.verify_software().await;
        let daemon_state = self.check_daemon().await;
        if daemon_state != DaemonState::Active {
            let reason = format!(
                "daemon is {daemon_state} after one restart attempt"
            );
            return self.fail(
                reason,
                Some(daemon_state),
                software,
                verification_errors,
            );
        }

        self.finish(Some(daemon_state), software, verification_errors)
    }

    async fn hand_off(&self, handoff: &Handoff) -> Result<(), String> {
        info!(
            self.log, "handing off manager responsibility";
            "resource" => %handoff.resource,
            "new_manager" => &handoff.to,
        );
        if self.settings.dry_run {
            return Ok(());
        }

        match self
            .executor
            .change_manager(&handoff.resource, &handoff.to)
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => Err(format!(
                "{} refused to take over {} from {}",
                handoff.to, handoff.resource, handoff.from
            )),
            Err(error) => Err(format!(
                "failed to hand {} over to {}: {}",
                handoff.resource,
                handoff.to,
                InlineErrorChain::new(&error)
            )),
        }
    }

    async fn verify_software(
        &self,
    ) -> (Option<BTreeMap<String, String>>, Vec<String>) {
        let installed =
            match self.executor.query_installed_software(&self.node).await {
                Ok(installed) => installed,
                Err(error) => {
                    let problem = format!(
                        "failed to query installed software: {}",
                        InlineErrorChain::new(&error)
                    );
                    warn!(self.log, "{}", problem);
                    return (None, vec![problem]);
                }
            };

        let problems = verify_installed_software(
            &installed,
            &self.settings.target_version,
            self.node.kernel_version.as_deref(),
            &self.settings.glue_package_prefix,
        );
        for problem in &problems {
            warn!(
                self.log, "software verification failed";
                "problem" => problem,
            );
        }
        (Some(installed), problems)
    }

    async fn query_daemon_state(&self) -> DaemonState {
        match self.executor.query_daemon_state(&self.node).await {
            Ok(state) => state,
            Err(error) => {
                warn!(
                    self.log, "failed to query daemon state";
                    "error" => InlineErrorChain::new(&error),
                );
                DaemonState::Unknown
            }
        }
    }

    /// Makes sure the daemon is active, restarting it at most once.
    async fn check_daemon(&self) -> DaemonState {
        let state = self.query_daemon_state().await;
        if state == DaemonState::Active {
            return state;
        }

        warn!(
            self.log, "daemon is not active after update, restarting it";
            "state" => %state,
        );
        if let Err(error) = self.executor.start_daemon(&self.node).await {
            warn!(
                self.log, "failed to start daemon";
                "error" => InlineErrorChain::new(&error),
            );
        }
        tokio::time::sleep(self.settings.restart_settle).await;

        let state = self.query_daemon_state().await;
        if state != DaemonState::Active {
            error!(
                self.log, "daemon did not come back after restart";
                "state" => %state,
            );
        }
        state
    }

    fn fail(
        mut self,
        reason: String,
        daemon_state: Option<DaemonState>,
        software: Option<BTreeMap<String, String>>,
        verification_errors: Vec<String>,
    ) -> NodeUpdateResult {
        error!(self.log, "node update failed"; "reason" => &reason);
        self.transition(ActionStatus::Broken);
        NodeUpdateResult {
            short_name: self.node.short_name,
            final_status: ActionStatus::Broken,
            final_daemon_state: daemon_state,
            installed_software: software,
            handoffs: self.handoffs,
            transitions: self.transitions,
            verification_errors,
            failure: Some(reason),
            failed: true,
        }
    }

    fn finish(
        mut self,
        daemon_state: Option<DaemonState>,
        software: Option<BTreeMap<String, String>>,
        verification_errors: Vec<String>,
    ) -> NodeUpdateResult {
        self.transition(ActionStatus::Finished);
        let failed = !verification_errors.is_empty();
        if failed {
            warn!(
                self.log, "node finished, but failed verification";
                "problems" => verification_errors.len(),
            );
        } else {
            info!(self.log, "node finished");
        }
        NodeUpdateResult {
            short_name: self.node.short_name,
            final_status: ActionStatus::Finished,
            final_daemon_state: daemon_state,
            installed_software: software,
            handoffs: self.handoffs,
            transitions: self.transitions,
            verification_errors,
            failure: None,
            failed,
        }
    }
}
