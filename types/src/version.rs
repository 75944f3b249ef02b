// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use regex::Regex;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use thiserror::Error;

static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]+\.[0-9]+\.[0-9]+-[0-9]+$")
        .expect("version regex is valid")
});

/// A software version of the form `MAJOR.MINOR.PATCH-BUILD`, e.g. `3.5.0-11`
///
/// Values of this type can only be obtained by parsing, so holding one means
/// the version string has already been validated.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TargetVersion(String);

#[derive(Debug, Error, PartialEq, Eq)]
#[error(
    "target version {0:?} is not of the form MAJOR.MINOR.PATCH-BUILD \
     (e.g. 3.5.0-11)"
)]
pub struct TargetVersionError(pub String);

impl TargetVersion {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if `installed` names exactly this version.
    pub fn matches(&self, installed: &str) -> bool {
        self.0 == installed
    }
}

impl FromStr for TargetVersion {
    type Err = TargetVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if VERSION_RE.is_match(s) {
            Ok(TargetVersion(s.to_string()))
        } else {
            Err(TargetVersionError(s.to_string()))
        }
    }
}

impl TryFrom<String> for TargetVersion {
    type Error = TargetVersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TargetVersion> for String {
    fn from(value: TargetVersion) -> Self {
        value.0
    }
}

impl fmt::Display for TargetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
