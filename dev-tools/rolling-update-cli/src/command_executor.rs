// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Act on nodes by running configured shell commands
//!
//! Each command template may refer to these placeholders, which are replaced
//! with shell-quoted values before the command is handed to `sh -c`:
//!
//! | placeholder      | value                                         |
//! |------------------|-----------------------------------------------|
//! | `{node}`         | the node's short name                         |
//! | `{admin_name}`   | the node's admin interface name               |
//! | `{ip}`           | the node's IP address                         |
//! | `{version}`      | target version (`update` only)                |
//! | `{reboot}`       | `reboot` or `no-reboot` (`update` only)       |
//! | `{resource}`     | `cluster` or a filesystem name                |
//! | `{resource_arg}` | `-c` for the cluster, else the filesystem name |
//! | `{new_manager}`  | short name of the node taking over            |
//! | `{cluster_host}` | the `--cluster-host` argument                 |
//!
//! `{resource}`, `{resource_arg}`, `{new_manager}`, and `{cluster_host}` are
//! only available to `change_manager`, which runs once for the whole cluster
//! rather than on a particular node.  Anything else in braces is left alone,
//! as is any brace sequence right after a `%`, so an rpm query format such
//! as `%{version}` is never mistaken for a placeholder.
//!
//! `installed_software` should list only the filesystem's own packages (for
//! example `rpm -qa 'gpfs*'`): every package it reports, other than glue
//! packages for other kernels, must be at the target version.
//!
//! A command succeeds if it exits with status 0.  `installed_software` must
//! print one `name version` pair per line.  `daemon_state` must print
//! `active`, `down`, or `arbitrating` (in any case) as its first word.

use crate::config::CommandsConfig;
use async_trait::async_trait;
use regex::Captures;
use regex::Regex;
use rolling_update::ActionOutcome;
use rolling_update::ExecutorError;
use rolling_update::NodeExecutor;
use rolling_update_types::DaemonState;
use rolling_update_types::NodeRecord;
use rolling_update_types::ResourceKey;
use rolling_update_types::TargetVersion;
use slog::Logger;
use slog::{debug, info, o, warn};
use std::collections::BTreeMap;
use std::process::Output;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Instant;

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([a-z_]+)\}").expect("placeholder regex is valid")
});

const PLACEHOLDERS: &[&str] = &[
    "node",
    "admin_name",
    "ip",
    "version",
    "reboot",
    "resource",
    "resource_arg",
    "new_manager",
    "cluster_host",
];

/// Replaces every known `{placeholder}` in `template` with the shell-quoted
/// value from `values`.
///
/// Fails if the template uses a known placeholder that has no value here.
fn render(
    template: &str,
    values: &BTreeMap<&str, String>,
) -> Result<String, String> {
    let mut missing = None;
    let rendered = PLACEHOLDER_RE.replace_all(template, |caps: &Captures| {
        let name = &caps[1];
        let start = caps.get(0).map_or(0, |m| m.start());
        if template[..start].ends_with('%') {
            return caps[0].to_string();
        }
        match values.get(name) {
            Some(value) => shell_words::quote(value).into_owned(),
            None => {
                if PLACEHOLDERS.contains(&name) {
                    missing.get_or_insert_with(|| name.to_string());
                }
                caps[0].to_string()
            }
        }
    });
    match missing {
        Some(name) => Err(format!(
            "template uses {{{name}}}, which is not available to this command"
        )),
        None => Ok(rendered.into_owned()),
    }
}

fn node_values(node: &NodeRecord) -> BTreeMap<&'static str, String> {
    BTreeMap::from([
        ("node", node.short_name.clone()),
        ("admin_name", node.admin_name.clone()),
        ("ip", node.ip.to_string()),
    ])
}

/// Parses `name version` lines.
pub fn parse_installed_software(
    stdout: &str,
) -> Result<BTreeMap<String, String>, String> {
    let mut software = BTreeMap::new();
    for line in stdout.lines() {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            continue;
        };
        match (words.next(), words.next()) {
            (Some(version), None) => {
                software.insert(name.to_string(), version.to_string());
            }
            _ => {
                return Err(format!(
                    "expected \"name version\", found {line:?}"
                ));
            }
        }
    }
    Ok(software)
}

pub fn parse_daemon_state(stdout: &str) -> DaemonState {
    let word = stdout.split_whitespace().next().unwrap_or_default();
    match word.to_ascii_lowercase().as_str() {
        "active" => DaemonState::Active,
        "down" => DaemonState::Down,
        "arbitrating" => DaemonState::Arbitrating,
        _ => DaemonState::Unknown,
    }
}

fn describe_failure(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        format!("exited with {}: {}", output.status, stderr)
    }
}

/// [`NodeExecutor`] that runs the commands from a [`CommandsConfig`]
pub struct CommandExecutor {
    log: Logger,
    commands: CommandsConfig,
    cluster_host: Option<String>,
}

impl CommandExecutor {
    pub fn new(
        log: &Logger,
        commands: CommandsConfig,
        cluster_host: Option<String>,
    ) -> CommandExecutor {
        CommandExecutor {
            log: log.new(o!("component" => "CommandExecutor")),
            commands,
            cluster_host,
        }
    }

    fn render(
        &self,
        target: &str,
        what: &'static str,
        template: &str,
        values: &BTreeMap<&str, String>,
    ) -> Result<String, ExecutorError> {
        render(template, values).map_err(|message| ExecutorError::Command {
            node: target.to_string(),
            what,
            message,
        })
    }

    async fn run(
        &self,
        target: &str,
        what: &'static str,
        command: &str,
    ) -> Result<Output, ExecutorError> {
        debug!(
            self.log, "running command";
            "node" => target,
            "what" => what,
            "command" => command,
        );
        let start = Instant::now();
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|error| ExecutorError::Spawn {
                node: target.to_string(),
                what,
                error,
            })?;
        debug!(
            self.log, "command exited";
            "node" => target,
            "what" => what,
            "status" => %output.status,
            "elapsed" => ?start.elapsed(),
        );
        Ok(output)
    }

    async fn run_checked(
        &self,
        target: &str,
        what: &'static str,
        command: &str,
    ) -> Result<String, ExecutorError> {
        let output = self.run(target, what, command).await?;
        if !output.status.success() {
            return Err(ExecutorError::Command {
                node: target.to_string(),
                what,
                message: describe_failure(&output),
            });
        }
        String::from_utf8(output.stdout).map_err(|_| ExecutorError::Output {
            node: target.to_string(),
            what,
            message: "stdout was not UTF-8".to_string(),
        })
    }
}

#[async_trait]
impl NodeExecutor for CommandExecutor {
    async fn run_update_action(
        &self,
        node: &NodeRecord,
        version: &TargetVersion,
        reboot: bool,
        dry_run: bool,
    ) -> Result<ActionOutcome, ExecutorError> {
        const WHAT: &str = "update";
        let mut values = node_values(node);
        values.insert("version", version.to_string());
        values.insert(
            "reboot",
            if reboot { "reboot" } else { "no-reboot" }.to_string(),
        );
        let command = self.render(
            &node.short_name,
            WHAT,
            &self.commands.update,
            &values,
        )?;

        if dry_run {
            info!(
                self.log, "not running update command";
                "node" => &node.short_name,
                "command" => &command,
                "dry_run" => true,
            );
            return Ok(ActionOutcome::success(format!(
                "dry run: would have run {command}"
            )));
        }

        let output = self.run(&node.short_name, WHAT, &command).await?;
        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let last = stdout.lines().last().unwrap_or_default().trim();
            Ok(ActionOutcome::success(last))
        } else {
            Ok(ActionOutcome::failure(describe_failure(&output)))
        }
    }

    async fn query_installed_software(
        &self,
        node: &NodeRecord,
    ) -> Result<BTreeMap<String, String>, ExecutorError> {
        const WHAT: &str = "installed_software";
        let command = self.render(
            &node.short_name,
            WHAT,
            &self.commands.installed_software,
            &node_values(node),
        )?;
        let stdout = self.run_checked(&node.short_name, WHAT, &command).await?;
        parse_installed_software(&stdout).map_err(|message| {
            ExecutorError::Output {
                node: node.short_name.clone(),
                what: WHAT,
                message,
            }
        })
    }

    async fn query_daemon_state(
        &self,
        node: &NodeRecord,
    ) -> Result<DaemonState, ExecutorError> {
        const WHAT: &str = "daemon_state";
        let command = self.render(
            &node.short_name,
            WHAT,
            &self.commands.daemon_state,
            &node_values(node),
        )?;
        let stdout = self.run_checked(&node.short_name, WHAT, &command).await?;
        Ok(parse_daemon_state(&stdout))
    }

    async fn start_daemon(
        &self,
        node: &NodeRecord,
    ) -> Result<(), ExecutorError> {
        const WHAT: &str = "start_daemon";
        let command = self.render(
            &node.short_name,
            WHAT,
            &self.commands.start_daemon,
            &node_values(node),
        )?;
        self.run_checked(&node.short_name, WHAT, &command).await?;
        Ok(())
    }

    async fn change_manager(
        &self,
        resource: &ResourceKey,
        new_manager: &str,
    ) -> Result<bool, ExecutorError> {
        const WHAT: &str = "change_manager";
        let resource_arg = match resource {
            ResourceKey::Cluster => "-c".to_string(),
            ResourceKey::Filesystem(name) => name.clone(),
        };
        let mut values = BTreeMap::from([
            ("resource", resource.to_string()),
            ("resource_arg", resource_arg),
            ("new_manager", new_manager.to_string()),
        ]);
        if let Some(host) = &self.cluster_host {
            values.insert("cluster_host", host.clone());
        }
        let command = self.render(
            new_manager,
            WHAT,
            &self.commands.change_manager,
            &values,
        )?;

        let output = self.run(new_manager, WHAT, &command).await?;
        if output.status.success() {
            Ok(true)
        } else {
            warn!(
                self.log, "manager change was refused";
                "resource" => %resource,
                "new_manager" => new_manager,
                "reason" => describe_failure(&output),
            );
            Ok(false)
        }
    }
}
