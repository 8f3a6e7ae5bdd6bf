use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Context;
use tracing::{info, warn};

use crate::args::{BackupApiArgs, BackupArgs, BackupCommands};
use crate::backup::plan::{self, PlanRequest};
use crate::backup::settings::{self, PassphraseSource};
use crate::backup::{self, BackupApi, BackupOptions, Include, NOTIFY_MIN_API_VERSION, file};
use crate::commands::CommandContext;
use crate::inventory::{Filter, Inventory, Scope, Selection};
use crate::progress;

const HOSTNAME_FILES: [&str; 2] = ["/proc/sys/kernel/hostname", "/etc/hostname"];

pub async fn handle_backup(ctx: &CommandContext, args: BackupArgs) -> anyhow::Result<()> {
    match args.command.clone() {
        Some(BackupCommands::Api(api_args)) => handle_api(ctx, api_args).await,
        None => run_backup(ctx, args).await,
    }
}

async fn handle_api(ctx: &CommandContext, args: BackupApiArgs) -> anyhow::Result<()> {
    let api = BackupApi::new(ctx.interruptible(ctx.api()).await?);
    let message = ctx
        .interruptible(settings::toggle(&api, args.disable, || {
            PassphraseSource::detect(ctx.prompter())
        }))
        .await?;
    println!("{message}");
    Ok(())
}

async fn run_backup(ctx: &CommandContext, args: BackupArgs) -> anyhow::Result<()> {
    let selection = selection_from(&args)?;
    plan::require_selection(&selection, ctx.interactive)?;
    let include = Include::parse(&args.with)?;
    let destination = resolve_destination(args.destination.clone())?;

    let client = ctx.interruptible(ctx.api()).await?;
    let api_version = client.version();
    let api = BackupApi::new(client.clone());
    ctx.interruptible(plan::ensure_api_enabled(&api, ctx.prompter(), ctx.interactive))
        .await?;
    let destination = file::prepare_destination(&destination)?;

    let primary_host = ctx.host()?;
    let local_host = local_hostname().unwrap_or_default();
    let request = PlanRequest {
        selection: &selection,
        primary_host: &primary_host,
        local_host: &local_host,
        interactive: ctx.interactive,
        quiet: args.quiet,
    };
    let mut stdout = io::stdout();
    let inventory = Inventory::new(client);
    let targets = ctx
        .interruptible(plan::select_targets(
            &inventory,
            &request,
            ctx.prompter(),
            &mut stdout,
        ))
        .await?;
    info!(
        count = targets.len(),
        destination = %destination.display(),
        "starting backup"
    );

    let mut opts = BackupOptions::new(destination);
    opts.include = include;
    opts.notify_url = notify_url(args.notify.clone(), api_version);
    opts.per_appliance_timeout = args.timeout;
    opts.concurrency = args.concurrency;

    let outcome = backup::run(
        api,
        targets,
        opts,
        progress::for_stdout(args.quiet),
        ctx.cancel(),
    )
    .await;

    for (name, id) in &outcome.cleanup_failures {
        warn!(appliance = %name, backup_id = %id, "backup left on the appliance");
    }
    outcome.report(&mut stdout).context("printing the backup report")?;
    stdout.flush().ok();
    outcome.into_result()?;
    Ok(())
}

/// `--notify` is dropped with a warning on collectives older than API version 16.
fn notify_url(requested: Option<String>, api_version: u32) -> Option<String> {
    let url = requested?;
    if api_version < NOTIFY_MIN_API_VERSION {
        warn!(
            api_version,
            "--notify needs API version {NOTIFY_MIN_API_VERSION} or later, ignoring it"
        );
        return None;
    }
    Some(url)
}

/// Maps the scope flags, filters and positional ids onto a [`Selection`].
fn selection_from(args: &BackupArgs) -> anyhow::Result<Selection> {
    let scope = if args.all {
        Some(Scope::All)
    } else if args.primary {
        Some(Scope::PrimaryOnly)
    } else if args.current {
        Some(Scope::CurrentOnly)
    } else if !args.ids.is_empty() {
        Some(Scope::ExplicitIds(args.ids.clone()))
    } else {
        None
    };
    Ok(Selection {
        scope,
        include: Filter::parse(&args.include)?,
        exclude: Filter::parse(&args.exclude)?,
    })
}

fn resolve_destination(flag: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    flag.or_else(file::default_destination)
        .ok_or_else(|| anyhow::anyhow!("HOME is not set; pass --destination"))
}

fn local_hostname() -> Option<String> {
    HOSTNAME_FILES
        .iter()
        .filter_map(|path| std::fs::read_to_string(path).ok())
        .map(|raw| raw.trim().to_string())
        .find(|name| !name.is_empty())
        .or_else(|| {
            std::env::var("HOSTNAME")
                .ok()
                .filter(|name| !name.trim().is_empty())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::{ApplianceCommands, Cli, Commands};
    use clap::Parser;
    use uuid::Uuid;

    fn backup_args(argv: &[&str]) -> BackupArgs {
        let cli = Cli::try_parse_from(
            ["sdpctl", "appliance", "backup"]
                .into_iter()
                .chain(argv.iter().copied()),
        )
        .expect("parse");
        match cli.command {
            Commands::Appliance {
                command: ApplianceCommands::Backup(args),
            } => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn ids_become_an_explicit_scope() {
        let id = Uuid::new_v4();
        let selection = selection_from(&backup_args(&[&id.to_string()])).expect("selection");
        assert_eq!(selection.scope, Some(Scope::ExplicitIds(vec![id])));
    }

    #[test]
    fn filters_without_scope_still_count_as_a_selection() {
        let selection =
            selection_from(&backup_args(&["--include", "function=gateway"])).expect("selection");
        assert!(selection.scope.is_none());
        assert!(!selection.is_unspecified());

        let empty = selection_from(&backup_args(&[])).expect("selection");
        assert!(empty.is_unspecified());
    }

    #[test]
    fn bad_filter_is_rejected() {
        assert!(selection_from(&backup_args(&["--exclude", "colour=blue"])).is_err());
    }

    #[test]
    fn notify_url_is_parsed_and_gated_by_api_version() {
        let args = backup_args(&["--all", "--notify", "https://hooks.example/backup"]);
        let url = args.notify.clone();
        assert_eq!(url.as_deref(), Some("https://hooks.example/backup"));
        assert_eq!(notify_url(url.clone(), 16), url);
        assert_eq!(notify_url(url, 15), None);
        assert_eq!(notify_url(None, 19), None);
    }

    #[test]
    fn explicit_destination_wins() {
        let dir = PathBuf::from("/tmp/backups");
        assert_eq!(
            resolve_destination(Some(dir.clone())).expect("destination"),
            dir
        );
    }
}
