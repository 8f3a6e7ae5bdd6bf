pub mod args;
pub mod auth;
pub mod backup;
pub mod change;
pub mod commands;
pub mod config;
pub mod error;
pub mod inventory;
pub mod parse;
pub mod progress;
pub mod prompt;
pub mod secrets;
pub mod session;
pub mod telemetry;
#[cfg(test)]
mod test_support;
pub mod transport;
pub mod version;

pub use args::*;
pub use commands::CommandContext;
pub use parse::*;

use clap::Parser;
use tokio::sync::watch;

use crate::commands::backup::handle_backup;
use crate::commands::configure::handle_configure;

/// Shared async entrypoint used by the CLI binary. `cancel` flips to `true` on interrupt.
pub async fn run(cancel: watch::Receiver<bool>) -> anyhow::Result<()> {
    let cli = Cli::parse();
    run_parsed(cli, cancel).await
}

/// Execute the CLI given a pre-parsed argument struct.
pub async fn run_parsed(cli: Cli, cancel: watch::Receiver<bool>) -> anyhow::Result<()> {
    let mut ctx = CommandContext::new(cli.globals, cancel)?;

    match cli.command {
        Commands::Configure(args) => handle_configure(&mut ctx, args).await?,
        Commands::Appliance { command } => match command {
            ApplianceCommands::Backup(args) => handle_backup(&ctx, args).await?,
        },
    }

    Ok(())
}
