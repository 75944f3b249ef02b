// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Choose who takes over a manager responsibility before its owner is
//! updated
//!
//! Only nodes in the quorum pool may take over.  Among those, a node that has
//! already finished this update is preferred: it's known to be running the
//! new software and won't be disrupted again.  Failing that, any quorum node
//! that isn't itself in the middle of an update will do.  If there is no such
//! node, the handoff fails and the owner must not be updated.

use rolling_update_types::ActionStatus;
use rolling_update_types::ManagerAssignments;
use rolling_update_types::ResourceKey;
use rolling_update_types::managers::resources_owned_by;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// A manager responsibility moving from one node to another
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Handoff {
    pub resource: ResourceKey,
    pub from: String,
    pub to: String,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FailoverError {
    #[error(
        "no eligible node can take over {resource} from {node}: every quorum \
         node is either being updated or unavailable"
    )]
    NoSuccessor { resource: ResourceKey, node: String },
}

/// What the resolver is allowed to look at when picking a successor
pub struct SuccessorCandidates<'a> {
    /// the quorum pool, in preference order
    pub quorum_pool: &'a [String],
    /// nodes that have finished this update, in completion order
    pub finished: &'a [String],
    /// current action status of every node
    pub statuses: &'a BTreeMap<String, ActionStatus>,
}

impl SuccessorCandidates<'_> {
    fn in_pool(&self, name: &str) -> bool {
        self.quorum_pool.iter().any(|q| q == name)
    }

    fn is_available(&self, name: &str) -> bool {
        match self.statuses.get(name) {
            Some(status) => {
                !status.is_updating() && *status != ActionStatus::Broken
            }
            None => false,
        }
    }

    /// Picks the node that should take over responsibilities from `node`.
    pub fn select_successor(&self, node: &str) -> Option<&str> {
        self.finished
            .iter()
            .find(|f| f.as_str() != node && self.in_pool(f))
            .or_else(|| {
                self.quorum_pool
                    .iter()
                    .find(|q| q.as_str() != node && self.is_available(q))
            })
            .map(String::as_str)
    }
}

/// Moves every responsibility owned by `node` in `assignments` to a
/// successor, returning the handoffs made.
///
/// Either every responsibility is moved or, on error, `assignments` is left
/// untouched.
pub fn resolve_handoffs(
    node: &str,
    assignments: &mut ManagerAssignments,
    candidates: &SuccessorCandidates<'_>,
) -> Result<Vec<Handoff>, FailoverError> {
    let owned: Vec<ResourceKey> =
        resources_owned_by(assignments, node).cloned().collect();
    let Some(first) = owned.first() else {
        return Ok(Vec::new());
    };

    let successor = candidates.select_successor(node).ok_or_else(|| {
        FailoverError::NoSuccessor {
            resource: first.clone(),
            node: node.to_string(),
        }
    })?;

    let handoffs: Vec<Handoff> = owned
        .into_iter()
        .map(|resource| Handoff {
            resource,
            from: node.to_string(),
            to: successor.to_string(),
        })
        .collect();
    for handoff in &handoffs {
        assignments.insert(handoff.resource.clone(), handoff.to.clone());
    }
    Ok(handoffs)
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn statuses(
        entries: &[(&str, ActionStatus)],
    ) -> BTreeMap<String, ActionStatus> {
        entries.iter().map(|(n, s)| (n.to_string(), *s)).collect()
    }

    fn assignments(entries: &[(&str, &str)]) -> ManagerAssignments {
        entries
            .iter()
            .map(|(r, n)| (ResourceKey::from(r.to_string()), n.to_string()))
            .collect()
    }

    #[test]
    fn test_prefers_finished_nodes() {
        let pool = strings(&["qm1", "qm2", "q1"]);
        let finished = strings(&["c1", "q1"]);
        let statuses = statuses(&[
            ("qm1", ActionStatus::Starting),
            ("qm2", ActionStatus::Idle),
            ("q1", ActionStatus::Finished),
            ("c1", ActionStatus::Finished),
        ]);
        let candidates = SuccessorCandidates {
            quorum_pool: &pool,
            finished: &finished,
            statuses: &statuses,
        };

        let mut managers = assignments(&[
            ("cluster", "qm1"),
            ("gpfs0", "qm1"),
            ("fs1", "qm2"),
        ]);
        let handoffs =
            resolve_handoffs("qm1", &mut managers, &candidates).unwrap();
        assert_eq!(
            handoffs,
            vec![
                Handoff {
                    resource: ResourceKey::Cluster,
                    from: "qm1".to_string(),
                    to: "q1".to_string(),
                },
                Handoff {
                    resource: ResourceKey::filesystem("gpfs0"),
                    from: "qm1".to_string(),
                    to: "q1".to_string(),
                },
            ]
        );
        assert_eq!(
            managers,
            assignments(&[("cluster", "q1"), ("gpfs0", "q1"), ("fs1", "qm2")])
        );
    }

    #[test]
    fn test_falls_back_to_idle_quorum_node() {
        let pool = strings(&["qm1", "qm2", "q1"]);
        let statuses = statuses(&[
            ("qm1", ActionStatus::Starting),
            ("qm2", ActionStatus::RunningAction),
            ("q1", ActionStatus::Idle),
        ]);
        let candidates = SuccessorCandidates {
            quorum_pool: &pool,
            finished: &[],
            statuses: &statuses,
        };
        assert_eq!(candidates.select_successor("qm1"), Some("q1"));
    }

    #[test]
    fn test_owner_of_nothing_needs_no_successor() {
        let pool = strings(&["qm1"]);
        let statuses = statuses(&[("qm1", ActionStatus::Starting)]);
        let candidates = SuccessorCandidates {
            quorum_pool: &pool,
            finished: &[],
            statuses: &statuses,
        };
        let mut managers = assignments(&[("cluster", "qm1")]);
        assert_eq!(
            resolve_handoffs("c1", &mut managers, &candidates),
            Ok(Vec::new())
        );
    }

    #[test]
    fn test_no_successor_is_an_error() {
        let pool = strings(&["qm1", "qm2", "q1"]);
        let statuses = statuses(&[
            ("qm1", ActionStatus::Starting),
            ("qm2", ActionStatus::Starting),
            ("q1", ActionStatus::Broken),
        ]);
        let candidates = SuccessorCandidates {
            quorum_pool: &pool,
            finished: &[],
            statuses: &statuses,
        };
        let before = assignments(&[("cluster", "qm1"), ("gpfs0", "qm1")]);
        let mut managers = before.clone();
        assert_matches!(
            resolve_handoffs("qm1", &mut managers, &candidates),
            Err(FailoverError::NoSuccessor { resource, node })
                if resource == ResourceKey::Cluster && node == "qm1"
        );
        assert_eq!(managers, before);
    }

    fn arb_status() -> impl Strategy<Value = ActionStatus> {
        prop_oneof![
            Just(ActionStatus::Idle),
            Just(ActionStatus::Starting),
            Just(ActionStatus::RunningAction),
            Just(ActionStatus::Rebooting),
            Just(ActionStatus::Finished),
            Just(ActionStatus::Broken),
        ]
    }

    proptest! {
        #[test]
        fn proptest_successor_is_eligible(
            // (status, in quorum pool, finished)
            fleet in prop::collection::vec(
                (arb_status(), any::<bool>(), any::<bool>()),
                1..12,
            ),
            updating in 0usize..12,
        ) {
            let names: Vec<String> =
                (0..fleet.len()).map(|i| format!("n{i}")).collect();
            let updating = &names[updating % names.len()];
            let pool: Vec<String> = names
                .iter()
                .zip(&fleet)
                .filter(|(_, (_, in_pool, _))| *in_pool)
                .map(|(n, _)| n.clone())
                .collect();
            let finished: Vec<String> = names
                .iter()
                .zip(&fleet)
                .filter(|(_, (_, _, finished))| *finished)
                .map(|(n, _)| n.clone())
                .collect();
            let statuses: BTreeMap<String, ActionStatus> = names
                .iter()
                .zip(&fleet)
                .map(|(n, (s, _, _))| (n.clone(), *s))
                .collect();
            let candidates = SuccessorCandidates {
                quorum_pool: &pool,
                finished: &finished,
                statuses: &statuses,
            };

            let preferred: Vec<&String> = finished
                .iter()
                .filter(|f| *f != updating && pool.contains(f))
                .collect();

            match candidates.select_successor(updating) {
                Some(successor) => {
                    prop_assert_ne!(successor, updating.as_str());
                    prop_assert!(pool.iter().any(|p| p == successor));
                    if !preferred.is_empty() {
                        prop_assert_eq!(successor, preferred[0].as_str());
                    }
                }
                None => {
                    prop_assert!(preferred.is_empty());
                    let all_unavailable = pool.iter().all(|p| {
                        p == updating
                            || statuses[p].is_updating()
                            || statuses[p] == ActionStatus::Broken
                    });
                    prop_assert!(all_unavailable);
                }
            }
        }
    }
}
