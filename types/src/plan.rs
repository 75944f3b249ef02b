// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::NodeRecord;
use crate::TargetVersion;
use serde::Deserialize;
use serde::Serialize;

/// Default number of failed nodes tolerated before a run is aborted
pub const DEFAULT_FAILURE_BUDGET: usize = 2;

/// Nodes that are updated concurrently, in one wave
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct UpdateGroup {
    /// position of this group within its plan
    pub index: usize,
    /// members as they were when the plan was made
    pub members: Vec<NodeRecord>,
}

impl UpdateGroup {
    pub fn member_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.members.iter().map(|m| m.short_name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }
}

/// A complete description of a rolling update: what to install, in what
/// order, and how much failure to put up with along the way
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct UpdatePlan {
    pub groups: Vec<UpdateGroup>,
    pub target_version: TargetVersion,
    pub reboot: bool,
    pub dry_run: bool,
    /// maximum number of failed nodes tolerated; exceeding it stops the run
    /// before the next group starts
    pub failure_budget: usize,
}

impl UpdatePlan {
    pub fn node_count(&self) -> usize {
        self.groups.iter().map(UpdateGroup::len).sum()
    }
}
