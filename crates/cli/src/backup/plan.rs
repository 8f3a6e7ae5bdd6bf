//! Checks made before the first backup is initiated, and the choice of targets.

use std::io::Write;

use tracing::info;

use super::BackupError;
use super::api::BackupApi;
use super::settings::{self, PassphraseSource};
use crate::inventory::{
    self, Inventory, InventoryError, MIN_BACKUP_VERSION, Member, Selection, find_primary,
};
use crate::prompt::Prompter;

const SUMMARY_HEADER: &str = "Will perform backup on the following appliances:";
const MULTISELECT_PROMPT: &str = "select appliances to backup:";
const OFFLINE_NOTICE: &str = "Skipping appliance. Appliance is offline.";
const LEGACY_WARNING: &str = "WARNING: some selected appliances have no admin interface and are reached through their peer interface";

/// Everything the planner needs to know about the invocation.
pub struct PlanRequest<'a> {
    pub selection: &'a Selection,
    /// Host of the configured collective URL, used to find the primary controller.
    pub primary_host: &'a str,
    pub local_host: &'a str,
    pub interactive: bool,
    pub quiet: bool,
}

/// Runs before any request: a non-interactive run must say what to back up.
pub fn require_selection(selection: &Selection, interactive: bool) -> Result<(), BackupError> {
    if selection.is_unspecified() && !interactive {
        return Err(BackupError::NoSelection);
    }
    Ok(())
}

/// Offers to enable a disabled backup API when interactive; fails otherwise.
pub async fn ensure_api_enabled(
    api: &BackupApi,
    prompter: &dyn Prompter,
    interactive: bool,
) -> Result<(), BackupError> {
    if settings::is_enabled(api).await? {
        return Ok(());
    }
    if !interactive
        || !prompter.confirm(
            "Backup API is disabled on the appliance. Do you want to enable it now?",
            false,
        )?
    {
        return Err(BackupError::ApiDisabled);
    }
    settings::toggle(api, false, || PassphraseSource::Prompt(prompter)).await?;
    info!("backup API enabled");
    Ok(())
}

/// Resolves the appliances to back up, enforcing the minimum primary version, and prints
/// the skip notices and the summary to `out`.
pub async fn select_targets(
    inventory: &Inventory,
    req: &PlanRequest<'_>,
    prompter: &dyn Prompter,
    out: &mut dyn Write,
) -> Result<Vec<Member>, BackupError> {
    let members = inventory.joined().await.map_err(InventoryError::from)?;
    let primary = find_primary(&members, req.primary_host)?;
    inventory::check_min_version(primary.version(), &MIN_BACKUP_VERSION)?;

    let chosen = if req.selection.is_unspecified() && req.interactive {
        pick(&members, prompter)?
    } else {
        req.selection
            .resolve(&members, req.primary_host, req.local_host)?
    };

    let (online, offline) = inventory::partition_online(chosen);
    for member in &offline {
        writeln!(out, "{}: {OFFLINE_NOTICE}", member.name()).map_err(write_failed)?;
        info!(appliance = member.name(), "skipping offline appliance");
    }
    if online.is_empty() {
        return Err(InventoryError::EmptySelection.into());
    }
    if online.iter().any(Member::is_legacy) {
        writeln!(out, "{LEGACY_WARNING}").map_err(write_failed)?;
    }
    if !req.quiet {
        writeln!(out, "{SUMMARY_HEADER}").map_err(write_failed)?;
        for member in &online {
            writeln!(out, " - {}", member.name()).map_err(write_failed)?;
        }
    }
    Ok(online)
}

fn pick(members: &[Member], prompter: &dyn Prompter) -> Result<Vec<Member>, BackupError> {
    let candidates: Vec<&Member> = members.iter().filter(|m| m.is_online()).collect();
    if candidates.is_empty() {
        return Err(InventoryError::EmptySelection.into());
    }
    let names: Vec<String> = candidates.iter().map(|m| m.name().to_string()).collect();
    let picked = prompter.multiselect(MULTISELECT_PROMPT, &names)?;
    Ok(picked
        .into_iter()
        .filter_map(|i| candidates.get(i).map(|m| (*m).clone()))
        .collect())
}

fn write_failed(err: std::io::Error) -> BackupError {
    BackupError::Output(err)
}
