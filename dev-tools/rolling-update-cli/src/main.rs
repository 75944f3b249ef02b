// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Plan and run rolling software updates from the command line

use anyhow::Context;
use anyhow::anyhow;
use anyhow::bail;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use rolling_update::NodeExecutor;
use rolling_update::Registry;
use rolling_update::RollingUpdate;
use rolling_update::RunOutcome;
use rolling_update::RunReport;
use rolling_update::planner::PlanParams;
use rolling_update::planner::groups_risking_quorum;
use rolling_update::planner::plan_groups;
use rolling_update::planner::plan_update;
use rolling_update::sim::SimExecutor;
use rolling_update_types::ClusterSnapshot;
use rolling_update_types::TargetVersion;
use rolling_update_types::UpdateGroup;
use rolling_update_types::plan::DEFAULT_FAILURE_BUDGET;
use slog::{info, o, warn};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tabled::Tabled;

mod command_executor;
mod config;

use command_executor::CommandExecutor;
use config::Config;

#[tokio::main]
async fn main() {
    let args = RollingUpdateArgs::parse();
    if let Err(error) = args.exec().await {
        eprintln!("error: {:#}", error);
        std::process::exit(1);
    }
}

/// Update a cluster one group of nodes at a time
#[derive(Debug, Parser)]
#[command(version)]
struct RollingUpdateArgs {
    /// log level filter
    #[arg(
        env,
        long,
        global = true,
        value_parser = parse_dropshot_log_level,
        default_value = "info",
    )]
    log_level: dropshot::ConfigLoggingLevel,

    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show how the fleet would be split into update groups
    Plan(PlanArgs),
    /// Update the fleet
    Run(RunArgs),
}

#[derive(Debug, Args)]
struct PlanArgs {
    /// JSON snapshot of the cluster
    #[arg(long)]
    snapshot: Utf8PathBuf,

    /// number of groups to split the fleet into
    #[arg(long)]
    num_groups: NonZeroUsize,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    plan: PlanArgs,

    /// version to install, e.g. 3.5.0-11
    #[arg(long)]
    target_version: TargetVersion,

    /// reboot each node after updating it
    #[arg(long)]
    reboot: bool,

    /// go through the motions without changing anything
    #[arg(long)]
    dry_run: bool,

    /// stop once more than this many nodes have failed
    #[arg(long, default_value_t = DEFAULT_FAILURE_BUDGET)]
    max_failures: usize,

    /// at most this many nodes of a group are updated at once
    #[arg(long)]
    max_parallelism: Option<NonZeroUsize>,

    /// where to write the final state of the cluster
    #[arg(long, default_value = "rolling-update-state.json")]
    output: Utf8PathBuf,

    /// run against a simulated copy of the snapshot instead of the cluster
    #[arg(long)]
    simulate: bool,

    /// node on which cluster-wide commands (manager changes) are run
    #[arg(long)]
    cluster_host: Option<String>,
}

fn parse_dropshot_log_level(
    s: &str,
) -> Result<dropshot::ConfigLoggingLevel, anyhow::Error> {
    serde_json::from_str(&format!("{:?}", s)).context("parsing log level")
}

impl RollingUpdateArgs {
    async fn exec(self) -> Result<(), anyhow::Error> {
        let config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("loading config {path}"))?,
            None => Config::default(),
        };
        let log_config = config.log.clone().unwrap_or(
            dropshot::ConfigLogging::StderrTerminal {
                level: self.log_level.clone(),
            },
        );
        let log = log_config
            .to_logger("rolling-update")
            .context("failed to create logger")?;

        match self.command {
            Command::Plan(args) => cmd_plan(&args),
            Command::Run(args) => cmd_run(&log, &config, args).await,
        }
    }
}

fn load_snapshot(path: &Utf8Path) -> anyhow::Result<ClusterSnapshot> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading {path}"))?;
    ClusterSnapshot::from_json(&data)
        .with_context(|| format!("loading cluster snapshot {path}"))
}

fn write_snapshot(
    path: &Utf8Path,
    snapshot: &ClusterSnapshot,
) -> anyhow::Result<()> {
    let data = serde_json::to_string_pretty(snapshot)
        .context("serializing cluster snapshot")?;
    std::fs::write(path, data + "\n")
        .with_context(|| format!("writing {path}"))
}

fn warn_quorum_risk(groups: &[UpdateGroup], registry: &Registry) {
    for index in groups_risking_quorum(
        groups,
        registry.quorum_pool(),
        registry.min_quorum_nodes(),
    ) {
        eprintln!(
            "warning: group {index} takes down enough quorum nodes to leave \
             fewer than {} up",
            registry.min_quorum_nodes().unwrap_or_default(),
        );
    }
}

fn cmd_plan(args: &PlanArgs) -> anyhow::Result<()> {
    let snapshot = load_snapshot(&args.snapshot)?;
    let registry = Registry::new(snapshot)?;
    let groups = plan_groups(registry.nodes(), args.num_groups.get())?;

    #[derive(Tabled)]
    #[tabled(rename_all = "SCREAMING_SNAKE_CASE")]
    struct PlanRow {
        group: usize,
        node: String,
        role: String,
        config_server: bool,
        weight: u32,
        failure_groups: String,
    }

    let rows = groups.iter().flat_map(|group| {
        group.members.iter().map(|node| PlanRow {
            group: group.index,
            node: node.short_name.clone(),
            role: node.role.to_string(),
            config_server: node.is_config_server,
            weight: node.weight(),
            failure_groups: node
                .failure_groups
                .iter()
                .map(|fg| fg.to_string())
                .collect::<Vec<_>>()
                .join(","),
        })
    });
    let table = tabled::Table::new(rows)
        .with(tabled::settings::Style::empty())
        .with(tabled::settings::Padding::new(0, 1, 0, 0))
        .to_string();
    println!("{}", table);

    warn_quorum_risk(&groups, &registry);
    Ok(())
}

async fn cmd_run(
    log: &slog::Logger,
    config: &Config,
    args: RunArgs,
) -> anyhow::Result<()> {
    let snapshot = load_snapshot(&args.plan.snapshot)?;
    let registry = Arc::new(Registry::new(snapshot.clone())?);
    let log = log.new(o!("dry_run" => args.dry_run));

    let executor: Arc<dyn NodeExecutor> = if args.simulate {
        info!(log, "running against a simulated cluster");
        Arc::new(SimExecutor::new(
            &snapshot,
            &config.update.glue_package_prefix,
        ))
    } else {
        let commands = config.commands.clone().ok_or_else(|| {
            anyhow!(
                "no [commands] are configured: pass --config with a \
                 [commands] table, or use --simulate"
            )
        })?;
        Arc::new(CommandExecutor::new(&log, commands, args.cluster_host))
    };

    let plan = plan_update(
        &registry,
        PlanParams {
            num_groups: args.plan.num_groups.get(),
            target_version: args.target_version,
            reboot: args.reboot,
            dry_run: args.dry_run,
            failure_budget: args.max_failures,
        },
    )?;
    warn_quorum_risk(&plan.groups, &registry);

    let mut updater = RollingUpdate::new(&log, Arc::clone(&registry), executor)
        .with_restart_settle(config.update.restart_settle())
        .with_glue_package_prefix(config.update.glue_package_prefix.clone());
    if let Some(limit) = args.max_parallelism {
        updater = updater.with_max_parallelism(limit);
    }

    let report = updater.run(&plan).await.context("running update")?;
    print_report(&report, plan.groups.len());

    write_snapshot(&args.output, &registry.snapshot())?;
    info!(log, "wrote final cluster state"; "path" => %args.output);

    match report.outcome {
        RunOutcome::Completed => {
            if report.total_failures > 0 {
                warn!(
                    log, "update completed with failures";
                    "total_failures" => report.total_failures,
                );
            }
            Ok(())
        }
        RunOutcome::Aborted { after_group, total_failures, failure_budget } => {
            bail!(
                "update aborted after group {after_group}: {total_failures} \
                 nodes failed, more than the {failure_budget} allowed"
            )
        }
    }
}

fn print_report(report: &RunReport, total_groups: usize) {
    #[derive(Tabled)]
    #[tabled(rename_all = "SCREAMING_SNAKE_CASE")]
    struct ResultRow {
        group: usize,
        node: String,
        status: String,
        daemon: String,
        failed: bool,
        detail: String,
    }

    let mut rows = Vec::new();
    for group in &report.groups {
        for result in &group.results {
            let detail = match &result.failure {
                Some(failure) => failure.clone(),
                None => result.verification_errors.join("; "),
            };
            rows.push(ResultRow {
                group: group.index,
                node: result.short_name.clone(),
                status: result.final_status.to_string(),
                daemon: result
                    .final_daemon_state
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                failed: result.failed,
                detail,
            });
        }
        for name in &group.skipped {
            rows.push(ResultRow {
                group: group.index,
                node: name.clone(),
                status: "skipped".to_string(),
                daemon: "-".to_string(),
                failed: false,
                detail: "another member of the group had no failover \
                         successor"
                    .to_string(),
            });
        }
    }

    let table = tabled::Table::new(rows)
        .with(tabled::settings::Style::empty())
        .with(tabled::settings::Padding::new(0, 1, 0, 0))
        .to_string();
    println!("{}", table);
    println!(
        "{} of {} groups run, {} failed nodes",
        report.groups.len(),
        total_groups,
        report.total_failures,
    );
}
