// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration for the `rolling-update` command

use camino::{Utf8Path, Utf8PathBuf};
use dropshot::ConfigLogging;
use rolling_update::driver_update::DEFAULT_GLUE_PACKAGE_PREFIX;
use rolling_update::driver_update::DEFAULT_RESTART_SETTLE;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// overrides `--log-level` when present
    #[serde(default)]
    pub log: Option<ConfigLogging>,
    #[serde(default)]
    pub update: UpdateConfig,
    /// required unless running against the simulator
    #[serde(default)]
    pub commands: Option<CommandsConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateConfig {
    #[serde(default = "default_restart_settle_secs")]
    pub restart_settle_secs: u64,
    #[serde(default = "default_glue_package_prefix")]
    pub glue_package_prefix: String,
}

fn default_restart_settle_secs() -> u64 {
    DEFAULT_RESTART_SETTLE.as_secs()
}

fn default_glue_package_prefix() -> String {
    DEFAULT_GLUE_PACKAGE_PREFIX.to_string()
}

impl Default for UpdateConfig {
    fn default() -> Self {
        UpdateConfig {
            restart_settle_secs: default_restart_settle_secs(),
            glue_package_prefix: default_glue_package_prefix(),
        }
    }
}

impl UpdateConfig {
    pub fn restart_settle(&self) -> Duration {
        Duration::from_secs(self.restart_settle_secs)
    }
}

/// Shell command templates used to act on nodes
///
/// Each template is run with `sh -c` after its `{placeholder}`s have been
/// replaced.  See [`crate::command_executor`] for the placeholders each one
/// may use and what its output must look like.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandsConfig {
    pub update: String,
    pub installed_software: String,
    pub daemon_state: String,
    pub start_daemon: String,
    pub change_manager: String,
}

impl Config {
    /// Load a `Config` from the given TOML file
    pub fn from_file<P: AsRef<Utf8Path>>(
        path: P,
    ) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|error| {
            ConfigError::Io { error, path: path.to_owned() }
        })?;
        let config: Config =
            toml::from_str(&data).map_err(|error| ConfigError::Parse {
                error,
                path: path.to_owned(),
            })?;
        if config.update.glue_package_prefix.is_empty() {
            return Err(ConfigError::Invalid {
                path: path.to_owned(),
                message: "update.glue_package_prefix must not be empty"
                    .to_string(),
            });
        }
        Ok(config)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {path}")]
    Io {
        #[source]
        error: std::io::Error,
        path: Utf8PathBuf,
    },
    #[error("Failed to parse config file: {path}")]
    Parse {
        #[source]
        error: toml::de::Error,
        path: Utf8PathBuf,
    },
    #[error("Invalid config file {path}: {message}")]
    Invalid { path: Utf8PathBuf, message: String },
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use camino_tempfile::Utf8TempDir;

    fn write_config(dir: &Utf8TempDir, contents: &str) -> Utf8PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_full_config() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
            [log]
            mode = "stderr-terminal"
            level = "debug"

            [update]
            restart_settle_secs = 5
            glue_package_prefix = "fs.kmod-"

            [commands]
            update = "ssh {admin_name} update-software {version} {reboot}"
            installed_software = """ssh {admin_name} rpm -qa 'gpfs*' \
                --queryformat '%{NAME} %{VERSION}-%{RELEASE}\n'"""
            daemon_state = "ssh {admin_name} daemon-state"
            start_daemon = "ssh {admin_name} startup"
            change_manager = "chmgr {resource_arg} {new_manager}"
            "#,
        );

        let config = Config::from_file(&path).unwrap();
        assert_matches!(config.log, Some(ConfigLogging::StderrTerminal { .. }));
        assert_eq!(config.update.restart_settle(), Duration::from_secs(5));
        assert_eq!(config.update.glue_package_prefix, "fs.kmod-");
        let commands = config.commands.unwrap();
        assert_eq!(
            commands.installed_software,
            "ssh {admin_name} rpm -qa 'gpfs*' --queryformat \
             '%{NAME} %{VERSION}-%{RELEASE}\n'"
        );
    }

    #[test]
    fn test_empty_config() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_config(&dir, "");

        let config = Config::from_file(&path).unwrap();
        assert!(config.log.is_none());
        assert!(config.commands.is_none());
        assert_eq!(config.update.restart_settle(), DEFAULT_RESTART_SETTLE);
        assert_eq!(
            config.update.glue_package_prefix,
            DEFAULT_GLUE_PACKAGE_PREFIX
        );
    }

    #[test]
    fn test_bad_configs() {
        let dir = Utf8TempDir::new().unwrap();

        let missing = dir.path().join("nope.toml");
        assert_matches!(
            Config::from_file(&missing),
            Err(ConfigError::Io { path, .. }) if path == missing
        );

        let path = write_config(&dir, "[update]\nrestart_settle = 5\n");
        assert_matches!(
            Config::from_file(&path),
            Err(ConfigError::Parse { .. })
        );

        let path = write_config(&dir, "[commands]\nupdate = \"true\"\n");
        assert_matches!(
            Config::from_file(&path),
            Err(ConfigError::Parse { .. })
        );

        let path = write_config(&dir, "[update]\nglue_package_prefix = \"\"\n");
        assert_matches!(
            Config::from_file(&path),
            Err(ConfigError::Invalid { .. })
        );
    }
}
