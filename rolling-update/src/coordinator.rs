// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Run an update plan one group at a time

use crate::NodeExecutor;
use crate::Registry;
use crate::RegistryError;
use crate::driver_update::DEFAULT_GLUE_PACKAGE_PREFIX;
use crate::driver_update::DEFAULT_RESTART_SETTLE;
use crate::driver_update::NodeUpdateResult;
use crate::driver_update::NodeUpdater;
use crate::driver_update::UpdateSettings;
use crate::failover::FailoverError;
use crate::failover::Handoff;
use crate::failover::SuccessorCandidates;
use crate::failover::resolve_handoffs;
use crate::planner::groups_risking_quorum;
use futures::FutureExt;
use rolling_update_types::ActionStatus;
use rolling_update_types::ManagerAssignments;
use rolling_update_types::NodeRecord;
use rolling_update_types::UpdateGroup;
use rolling_update_types::UpdatePlan;
use slog::Logger;
use slog::{error, info, o, warn};
use std::any::Any;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("plan does not match the registry")]
    Registry(#[from] RegistryError),
}

/// What happened to one group
#[derive(Clone, Debug)]
pub struct GroupReport {
    pub index: usize,
    /// one result per member that was attempted, in member order
    pub results: Vec<NodeUpdateResult>,
    /// members put back to `Idle` without being attempted
    pub skipped: Vec<String>,
    /// handoffs that could not be resolved for this group
    pub planning_errors: Vec<FailoverError>,
    pub failures: usize,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RunOutcome {
    /// every group was attempted
    Completed,
    /// the failure budget was exceeded and later groups were not started
    Aborted {
        after_group: usize,
        total_failures: usize,
        failure_budget: usize,
    },
}

#[derive(Clone, Debug)]
pub struct RunReport {
    pub groups: Vec<GroupReport>,
    pub total_failures: usize,
    pub outcome: RunOutcome,
}

impl RunReport {
    pub fn is_aborted(&self) -> bool {
        matches!(self.outcome, RunOutcome::Aborted { .. })
    }
}

/// Executes update plans against a [`Registry`]
///
/// Groups run strictly one after another.  Within a group every member is
/// updated concurrently (optionally capped with
/// [`RollingUpdate::with_max_parallelism`]), and the next group does not
/// start until every member of the current one has reached a final status.
pub struct RollingUpdate {
    log: Logger,
    registry: Arc<Registry>,
    executor: Arc<dyn NodeExecutor>,
    restart_settle: Duration,
    glue_package_prefix: String,
    max_parallelism: Option<NonZeroUsize>,
}

impl RollingUpdate {
    pub fn new(
        log: &Logger,
        registry: Arc<Registry>,
        executor: Arc<dyn NodeExecutor>,
    ) -> RollingUpdate {
        RollingUpdate {
            log: log.new(o!("component" => "RollingUpdate")),
            registry,
            executor,
            restart_settle: DEFAULT_RESTART_SETTLE,
            glue_package_prefix: DEFAULT_GLUE_PACKAGE_PREFIX.to_string(),
            max_parallelism: None,
        }
    }

    pub fn with_restart_settle(mut self, restart_settle: Duration) -> Self {
        self.restart_settle = restart_settle;
        self
    }

    pub fn with_glue_package_prefix(
        mut self,
        prefix: impl Into<String>,
    ) -> Self {
        self.glue_package_prefix = prefix.into();
        self
    }

    /// Caps how many members of a group are updated at the same time.
    pub fn with_max_parallelism(mut self, limit: NonZeroUsize) -> Self {
        self.max_parallelism = Some(limit);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Runs every group of `plan` in order, stopping early if the failure
    /// budget is exceeded.
    pub async fn run(&self, plan: &UpdatePlan) -> Result<RunReport, RunError> {
        let log = self.log.new(o!(
            "version" => plan.target_version.to_string(),
            "dry_run" => plan.dry_run,
        ));
        let settings = Arc::new(UpdateSettings {
            target_version: plan.target_version.clone(),
            reboot: plan.reboot,
            dry_run: plan.dry_run,
            restart_settle: self.restart_settle,
            glue_package_prefix: self.glue_package_prefix.clone(),
        });
        let semaphore = self
            .max_parallelism
            .map(|limit| Arc::new(Semaphore::new(limit.get())));

        info!(
            log, "starting rolling update";
            "groups" => plan.groups.len(),
            "nodes" => plan.node_count(),
            "failure_budget" => plan.failure_budget,
            "reboot" => plan.reboot,
        );
        let risky = groups_risking_quorum(
            &plan.groups,
            self.registry.quorum_pool(),
            self.registry.min_quorum_nodes(),
        );
        if !risky.is_empty() {
            warn!(
                log, "some groups take down enough quorum nodes to lose quorum";
                "groups" => ?risky,
            );
        }

        // Manager assignments as this run sees them.  In a dry run the
        // registry is never told about handoffs, so later groups rely on
        // this copy to see the earlier ones.
        let mut assignments = self.registry.managers();
        let mut reports = Vec::with_capacity(plan.groups.len());
        let mut total_failures = 0;

        for group in &plan.groups {
            let report = self
                .run_group(&log, group, &settings, &semaphore, &mut assignments)
                .await?;
            total_failures += report.failures;
            reports.push(report);

            if total_failures > plan.failure_budget {
                error!(
                    log,
                    "failure budget exceeded, not starting any more groups";
                    "after_group" => group.index,
                    "total_failures" => total_failures,
                    "failure_budget" => plan.failure_budget,
                );
                return Ok(RunReport {
                    groups: reports,
                    total_failures,
                    outcome: RunOutcome::Aborted {
                        after_group: group.index,
                        total_failures,
                        failure_budget: plan.failure_budget,
                    },
                });
            }
        }

        info!(
            log, "rolling update complete";
            "total_failures" => total_failures,
        );
        Ok(RunReport {
            groups: reports,
            total_failures,
            outcome: RunOutcome::Completed,
        })
    }

    async fn run_group(
        &self,
        log: &Logger,
        group: &UpdateGroup,
        settings: &Arc<UpdateSettings>,
        semaphore: &Option<Arc<Semaphore>>,
        assignments: &mut ManagerAssignments,
    ) -> Result<GroupReport, RunError> {
        let log = log.new(o!("group" => group.index));
        let mut report = GroupReport {
            index: group.index,
            results: Vec::new(),
            skipped: Vec::new(),
            planning_errors: Vec::new(),
            failures: 0,
        };
        if group.is_empty() {
            info!(log, "group is empty");
            return Ok(report);
        }
        info!(
            log, "starting group";
            "members" => group.member_names().collect::<Vec<_>>().join(","),
        );

        let mut members = Vec::with_capacity(group.len());
        for member in group.member_names() {
            self.registry.set_action_status(member, ActionStatus::Starting)?;
            members.push(self.registry.node(member)?);
        }

        // Every member is `Starting` by now, so none of them can be chosen
        // to take over from another.
        let statuses = self.registry.action_statuses();
        let finished = self.registry.finished();
        let candidates = SuccessorCandidates {
            quorum_pool: self.registry.quorum_pool(),
            finished: &finished,
            statuses: &statuses,
        };
        let mut proposed = assignments.clone();
        let failover: Vec<Result<Vec<Handoff>, FailoverError>> = members
            .iter()
            .map(|node| {
                resolve_handoffs(&node.short_name, &mut proposed, &candidates)
            })
            .collect();

        if failover.iter().any(|f| f.is_err()) {
            return self
                .abandon_group(&log, members, failover, settings, report)
                .await;
        }

        let before = std::mem::replace(assignments, proposed);
        let planned: BTreeMap<String, Vec<Handoff>> = members
            .iter()
            .zip(failover)
            .map(|(node, handoffs)| {
                (node.short_name.clone(), handoffs.unwrap_or_default())
            })
            .collect();
        for (node, handoffs) in &planned {
            for handoff in handoffs {
                info!(
                    log, "planned manager handoff";
                    "node" => node,
                    "resource" => %handoff.resource,
                    "new_manager" => &handoff.to,
                );
            }
        }

        let mut tasks = JoinSet::new();
        for node in &members {
            let handoffs = planned
                .get(&node.short_name)
                .cloned()
                .unwrap_or_default();
            let updater = NodeUpdater::new(
                &log,
                node.clone(),
                Ok(handoffs.clone()),
                Arc::clone(&self.executor),
                Arc::clone(settings),
            );
            let semaphore = semaphore.clone();
            let name = node.short_name.clone();
            let log = log.clone();
            tasks.spawn(async move {
                let _permit = match semaphore {
                    Some(semaphore) => semaphore.acquire_owned().await.ok(),
                    None => None,
                };
                let result =
                    AssertUnwindSafe(updater.run()).catch_unwind().await;
                result.unwrap_or_else(|payload| {
                    let message = format!(
                        "update task panicked: {}",
                        panic_message(&*payload)
                    );
                    warn_interrupted(&log, &name, &handoffs);
                    NodeUpdateResult::interrupted(&name, message, handoffs)
                })
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => {
                    results.insert(result.short_name.clone(), result);
                }
                Err(error) => {
                    error!(
                        log, "failed to join node update task";
                        "error" => %error,
                    );
                }
            }
        }

        for node in &members {
            let handoffs = planned
                .get(&node.short_name)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let result = results.remove(&node.short_name).unwrap_or_else(|| {
                warn_interrupted(&log, &node.short_name, handoffs);
                NodeUpdateResult::interrupted(
                    &node.short_name,
                    "update task did not report a result",
                    handoffs.to_vec(),
                )
            });
            self.merge(
                &result,
                handoffs,
                &before,
                assignments,
                settings.dry_run,
            )?;
            report.results.push(result);
        }

        report.failures = report.results.iter().filter(|r| r.failed).count();
        let succeeded =
            report.results.iter().filter(|r| r.succeeded()).count();
        info!(
            log, "group done";
            "succeeded" => succeeded,
            "failures" => report.failures,
        );
        Ok(report)
    }

    /// Handles a group in which some member's responsibilities could not be
    /// handed off: those members go to `Broken` without being touched, and
    /// the rest go back to `Idle`.
    async fn abandon_group(
        &self,
        log: &Logger,
        members: Vec<NodeRecord>,
        failover: Vec<Result<Vec<Handoff>, FailoverError>>,
        settings: &Arc<UpdateSettings>,
        mut report: GroupReport,
    ) -> Result<GroupReport, RunError> {
        for (node, failover) in members.into_iter().zip(failover) {
            match failover {
                Err(error) => {
                    warn!(
                        log, "cannot hand off manager responsibilities";
                        "node" => &node.short_name,
                        "error" => %error,
                    );
                    report.planning_errors.push(error.clone());
                    let result = NodeUpdater::new(
                        log,
                        node,
                        Err(error),
                        Arc::clone(&self.executor),
                        Arc::clone(settings),
                    )
                    .run()
                    .await;
                    self.registry.set_action_status(
                        &result.short_name,
                        result.final_status,
                    )?;
                    report.results.push(result);
                }
                Ok(_) => {
                    self.registry.set_action_status(
                        &node.short_name,
                        ActionStatus::Idle,
                    )?;
                    report.skipped.push(node.short_name);
                }
            }
        }
        report.failures = report.results.iter().filter(|r| r.failed).count();
        warn!(
            log, "group abandoned";
            "failures" => report.failures,
            "skipped" => report.skipped.join(","),
        );
        Ok(report)
    }

    /// Folds one node's result back into the registry.
    fn merge(
        &self,
        result: &NodeUpdateResult,
        planned: &[Handoff],
        before: &ManagerAssignments,
        assignments: &mut ManagerAssignments,
        dry_run: bool,
    ) -> Result<(), RegistryError> {
        let name = &result.short_name;
        self.registry.set_action_status(name, result.final_status)?;

        if !dry_run {
            if let Some(state) = result.final_daemon_state {
                self.registry.set_daemon_state(name, state)?;
            }
            if let Some(software) = &result.installed_software {
                self.registry.set_installed_software(name, software.clone())?;
            }
        }

        for handoff in planned {
            if result.handoffs.contains(handoff) {
                if !dry_run {
                    self.registry.set_manager(&handoff.resource, &handoff.to)?;
                }
            } else if let Some(owner) = before.get(&handoff.resource) {
                assignments.insert(handoff.resource.clone(), owner.clone());
            }
        }

        if result.succeeded() {
            self.registry.mark_finished(name)?;
        }
        Ok(())
    }
}

fn warn_interrupted(log: &Logger, node: &str, handoffs: &[Handoff]) {
    for handoff in handoffs {
        warn!(
            log, "node update was interrupted, assuming handoff took place";
            "node" => node,
            "resource" => %handoff.resource,
            "new_manager" => &handoff.to,
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
