// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Manager responsibilities and who currently holds them

use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Key used for the cluster-wide manager in serialized assignments
pub const CLUSTER_RESOURCE: &str = "cluster";

/// Something that exactly one node is responsible for managing
#[derive(
    Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(from = "String", into = "String")]
pub enum ResourceKey {
    /// The cluster manager
    Cluster,
    /// The manager of one filesystem
    Filesystem(String),
}

impl ResourceKey {
    pub fn filesystem(name: impl Into<String>) -> ResourceKey {
        ResourceKey::Filesystem(name.into())
    }
}

impl From<String> for ResourceKey {
    fn from(value: String) -> Self {
        if value == CLUSTER_RESOURCE {
            ResourceKey::Cluster
        } else {
            ResourceKey::Filesystem(value)
        }
    }
}

impl From<ResourceKey> for String {
    fn from(value: ResourceKey) -> Self {
        match value {
            ResourceKey::Cluster => CLUSTER_RESOURCE.to_string(),
            ResourceKey::Filesystem(name) => name,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::Cluster => f.write_str(CLUSTER_RESOURCE),
            ResourceKey::Filesystem(name) => f.write_str(name),
        }
    }
}

/// Maps each manager responsibility to the short name of its current owner
pub type ManagerAssignments = BTreeMap<ResourceKey, String>;

/// Returns the resources currently owned by `node`, in key order.
pub fn resources_owned_by<'a>(
    assignments: &'a ManagerAssignments,
    node: &'a str,
) -> impl Iterator<Item = &'a ResourceKey> + 'a {
    assignments
        .iter()
        .filter(move |(_, owner)| owner.as_str() == node)
        .map(|(resource, _)| resource)
}
