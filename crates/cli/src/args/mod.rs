use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::version;

pub mod appliance;
pub mod configure;

pub use appliance::*;
pub use configure::*;

#[derive(Debug, Parser)]
#[command(
    name = "sdpctl",
    version = version::VERSION,
    long_version = version::FULL_VERSION,
    about = "sdpctl - administer an SDP collective"
)]
pub struct Cli {
    #[command(flatten)]
    pub globals: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Default, Args)]
pub struct GlobalArgs {
    /// Collective admin URL; overrides the configured one.
    #[arg(long, env = "SDPCTL_URL", global = true, hide_env_values = true)]
    pub url: Option<String>,

    /// Skip TLS verification.
    #[arg(long, env = "SDPCTL_INSECURE", global = true)]
    pub insecure: bool,

    /// PEM file holding the only trusted root for the collective.
    #[arg(long = "pem", env = "SDPCTL_PEM_FILEPATH", global = true)]
    pub pem_filepath: Option<PathBuf>,

    /// Pin the peer API version instead of negotiating it.
    #[arg(long = "api-version", env = "SDPCTL_VERSION", global = true)]
    pub api_version: Option<u32>,

    /// Never prompt; fail when input would be required.
    #[arg(long, global = true)]
    pub no_interactive: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Configure the collective to manage, and sign in or out.
    Configure(ConfigureArgs),
    /// Appliance commands.
    Appliance {
        #[command(subcommand)]
        command: ApplianceCommands,
    },
}
