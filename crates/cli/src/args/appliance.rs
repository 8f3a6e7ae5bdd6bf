use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgGroup, Args, Subcommand};
use uuid::Uuid;

use crate::backup::DEFAULT_CONCURRENCY;

/// Matches `backup::DEFAULT_TIMEOUT`.
const DEFAULT_TIMEOUT_ARG: &str = "30m";

#[derive(Debug, Subcommand)]
pub enum ApplianceCommands {
    /// Back up appliances through the backup API.
    Backup(BackupArgs),
}

#[derive(Debug, Clone, Args)]
#[command(args_conflicts_with_subcommands = true)]
#[command(group(ArgGroup::new("scope").args(["all", "primary", "current"]).multiple(false)))]
pub struct BackupArgs {
    #[command(subcommand)]
    pub command: Option<BackupCommands>,

    /// Directory the backups are written to.
    #[arg(long)]
    pub destination: Option<PathBuf>,

    /// Back up every appliance in the collective.
    #[arg(long)]
    pub all: bool,

    /// Back up the primary controller only.
    #[arg(long)]
    pub primary: bool,

    /// Back up the appliance this command runs next to.
    #[arg(long)]
    pub current: bool,

    /// Only appliances matching `key=value[,value]` (name, id, tag, hostname, function, version).
    #[arg(long = "include")]
    pub include: Vec<String>,

    /// Skip appliances matching `key=value[,value]`.
    #[arg(long = "exclude")]
    pub exclude: Vec<String>,

    /// Extra data to include: audit, logs.
    #[arg(long = "with")]
    pub with: Vec<String>,

    /// URL the collective calls when each backup is ready (API version 16 and later).
    #[arg(long, value_parser = crate::parse_notify_url)]
    pub notify: Option<String>,

    /// Per-appliance timeout, e.g. 30m or 1h30m.
    #[arg(long, value_parser = crate::parse_duration_arg, default_value = DEFAULT_TIMEOUT_ARG)]
    pub timeout: Duration,

    /// Appliances backed up at the same time.
    #[arg(
        long,
        value_parser = crate::parse_concurrency,
        default_value_t = DEFAULT_CONCURRENCY
    )]
    pub concurrency: usize,

    /// Only print errors and the written file paths.
    #[arg(long, short)]
    pub quiet: bool,

    /// Appliance ids to back up.
    #[arg(value_parser = crate::parse_uuid)]
    pub ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum BackupCommands {
    /// Enable or disable the backup API of the collective.
    Api(BackupApiArgs),
}

#[derive(Debug, Clone, Args)]
pub struct BackupApiArgs {
    /// Disable the backup API instead of enabling it.
    #[arg(long)]
    pub disable: bool,
}
