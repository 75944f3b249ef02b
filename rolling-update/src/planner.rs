// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Partition the fleet into update groups
//!
//! Nodes are sorted by weight (highest first), then by their first failure
//! group, then by name, and dealt out to the groups round-robin.  Dealing
//! rather than splitting into contiguous blocks is what keeps the
//! configuration servers and manager-capable nodes spread across groups:
//! each group ends up with about `count / num_groups` of every weight class.

use crate::Registry;
use rolling_update_types::NodeRecord;
use rolling_update_types::TargetVersion;
use rolling_update_types::UpdateGroup;
use rolling_update_types::UpdatePlan;
use std::cmp::Reverse;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("the number of update groups must be at least 1")]
    NoGroups,
}

/// Caller-chosen knobs for a rolling update
#[derive(Clone, Debug)]
pub struct PlanParams {
    pub num_groups: usize,
    pub target_version: TargetVersion,
    pub reboot: bool,
    pub dry_run: bool,
    pub failure_budget: usize,
}

/// Deals `nodes` out into `num_groups` groups.
///
/// The result always has exactly `num_groups` groups.  When there are more
/// groups than nodes, the extra groups are empty.
pub fn plan_groups(
    nodes: impl IntoIterator<Item = NodeRecord>,
    num_groups: usize,
) -> Result<Vec<UpdateGroup>, PlanError> {
    if num_groups == 0 {
        return Err(PlanError::NoGroups);
    }

    let mut nodes: Vec<_> = nodes.into_iter().collect();
    nodes.sort_by(|a, b| {
        let key = |n: &NodeRecord| {
            (Reverse(n.weight()), n.first_failure_group())
        };
        key(a).cmp(&key(b)).then_with(|| a.short_name.cmp(&b.short_name))
    });

    let mut groups: Vec<_> = (0..num_groups)
        .map(|index| UpdateGroup { index, members: Vec::new() })
        .collect();
    for (i, node) in nodes.into_iter().enumerate() {
        groups[i % num_groups].members.push(node);
    }
    Ok(groups)
}

/// Builds a complete plan for every node in `registry`.
pub fn plan_update(
    registry: &Registry,
    params: PlanParams,
) -> Result<UpdatePlan, PlanError> {
    let groups = plan_groups(registry.nodes(), params.num_groups)?;
    Ok(UpdatePlan {
        groups,
        target_version: params.target_version,
        reboot: params.reboot,
        dry_run: params.dry_run,
        failure_budget: params.failure_budget,
    })
}

/// Returns the indexes of groups that would take down enough quorum nodes
/// at once to leave fewer than `min_quorum_nodes` of `quorum_pool` up.
pub fn groups_risking_quorum(
    groups: &[UpdateGroup],
    quorum_pool: &[String],
    min_quorum_nodes: Option<usize>,
) -> Vec<usize> {
    let Some(min_quorum_nodes) = min_quorum_nodes else {
        return Vec::new();
    };

    groups
        .iter()
        .filter(|group| {
            let down = group
                .member_names()
                .filter(|name| quorum_pool.iter().any(|q| q == name))
                .count();
            down > 0 && quorum_pool.len() - down < min_quorum_nodes
        })
        .map(|group| group.index)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;
    use rolling_update_types::NodeRole;
    use std::collections::BTreeSet;
    use std::net::IpAddr;
    use std::net::Ipv4Addr;

    fn node(
        name: &str,
        role: NodeRole,
        config_server: bool,
        fgs: &[i32],
    ) -> NodeRecord {
        let mut n = NodeRecord::new(
            name,
            format!("{name}.example.com"),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            role,
        );
        n.is_config_server = config_server;
        n.failure_groups.extend(fgs.iter().copied());
        n
    }

    fn names(group: &UpdateGroup) -> Vec<&str> {
        group.member_names().collect()
    }

    /// Two quorum-managers (one of them the primary configuration server),
    /// two quorum nodes, and two clients
    fn six_nodes() -> Vec<NodeRecord> {
        vec![
            node("c1", NodeRole::Client, false, &[]),
            node("q1", NodeRole::Quorum, false, &[2]),
            node("qm1", NodeRole::QuorumManager, true, &[1]),
            node("c2", NodeRole::Client, false, &[]),
            node("qm2", NodeRole::QuorumManager, false, &[2]),
            node("q2", NodeRole::Quorum, false, &[1]),
        ]
    }

    #[test]
    fn test_round_robin_spreads_managers() {
        let groups = plan_groups(six_nodes(), 3).unwrap();
        assert_eq!(groups.len(), 3);
        // sorted: qm1 (config server), qm2, q2 (fg 1), q1 (fg 2), c1, c2
        assert_eq!(names(&groups[0]), ["qm1", "q1"]);
        assert_eq!(names(&groups[1]), ["qm2", "c1"]);
        assert_eq!(names(&groups[2]), ["q2", "c2"]);
        for g in &groups {
            let quorum_managers = g
                .members
                .iter()
                .filter(|n| n.role == NodeRole::QuorumManager)
                .count();
            let quorum =
                g.members.iter().filter(|n| n.role.is_quorum()).count();
            assert!(quorum_managers <= 1, "group {}", g.index);
            assert!(quorum >= 1, "group {} has no quorum node", g.index);
        }
    }

    #[test]
    fn test_empty_failure_groups_sort_as_zero() {
        let nodes = vec![
            node("a", NodeRole::Client, false, &[3]),
            node("b", NodeRole::Client, false, &[]),
            node("c", NodeRole::Client, false, &[1]),
        ];
        let groups = plan_groups(nodes, 1).unwrap();
        assert_eq!(names(&groups[0]), ["b", "c", "a"]);
    }

    #[test]
    fn test_more_groups_than_nodes() {
        let groups = plan_groups(six_nodes(), 8).unwrap();
        assert_eq!(groups.len(), 8);
        assert!(groups[..6].iter().all(|g| g.len() == 1));
        assert!(groups[6..].iter().all(|g| g.is_empty()));
        let indexes: Vec<_> = groups.iter().map(|g| g.index).collect();
        assert_eq!(indexes, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_zero_groups() {
        assert_eq!(plan_groups(six_nodes(), 0), Err(PlanError::NoGroups));
    }

    #[test]
    fn test_quorum_risk() {
        let pool: Vec<String> =
            ["qm1", "qm2", "q1", "q2"].iter().map(|s| s.to_string()).collect();

        let groups = plan_groups(six_nodes(), 1).unwrap();
        assert!(groups_risking_quorum(&groups, &pool, None).is_empty());
        assert_eq!(groups_risking_quorum(&groups, &pool, Some(1)), vec![0]);

        let groups = plan_groups(six_nodes(), 4).unwrap();
        assert!(groups_risking_quorum(&groups, &pool, Some(3)).is_empty());
    }

    fn arb_role() -> impl Strategy<Value = NodeRole> {
        prop_oneof![
            Just(NodeRole::QuorumManager),
            Just(NodeRole::Quorum),
            Just(NodeRole::Manager),
            Just(NodeRole::Client),
        ]
    }

    fn arb_nodes() -> impl Strategy<Value = Vec<NodeRecord>> {
        prop::collection::vec(
            (arb_role(), any::<bool>(), prop::collection::vec(-1i32..8, 0..3)),
            0..40,
        )
        .prop_map(|specs| {
            specs
                .into_iter()
                .enumerate()
                .map(|(i, (role, cs, fgs))| {
                    node(&format!("node{i:02}"), role, cs, &fgs)
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn proptest_groups_partition_the_fleet(
            nodes in arb_nodes(),
            num_groups in 1usize..10,
        ) {
            let groups = plan_groups(nodes.clone(), num_groups).unwrap();
            prop_assert_eq!(groups.len(), num_groups);

            let sizes: Vec<_> = groups.iter().map(|g| g.len()).collect();
            let max = *sizes.iter().max().unwrap();
            let min = *sizes.iter().min().unwrap();
            prop_assert!(max - min <= 1, "sizes {:?}", sizes);

            let mut seen = BTreeSet::new();
            for g in &groups {
                for name in g.member_names() {
                    prop_assert!(seen.insert(name.to_string()));
                }
            }
            let expected: BTreeSet<_> =
                nodes.iter().map(|n| n.short_name.clone()).collect();
            prop_assert_eq!(seen, expected);
        }

        #[test]
        fn proptest_top_weight_is_balanced(
            nodes in arb_nodes(),
            num_groups in 1usize..10,
        ) {
            let Some(top) = nodes.iter().map(|n| n.weight()).max() else {
                return Ok(());
            };
            let groups = plan_groups(nodes, num_groups).unwrap();
            let counts: Vec<_> = groups
                .iter()
                .map(|g| g.members.iter().filter(|n| n.weight() == top).count())
                .collect();
            let max = *counts.iter().max().unwrap();
            let min = *counts.iter().min().unwrap();
            prop_assert!(max - min <= 1, "counts {:?}", counts);
        }

        #[test]
        fn proptest_planning_is_deterministic(
            nodes in arb_nodes(),
            num_groups in 1usize..10,
        ) {
            let mut reversed = nodes.clone();
            reversed.reverse();
            let a = plan_groups(nodes, num_groups).unwrap();
            let b = plan_groups(reversed, num_groups).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
