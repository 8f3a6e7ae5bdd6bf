//! The collective-wide backup API toggle and its passphrase.

use std::io::{self, BufRead, IsTerminal};

use tracing::info;
use zeroize::Zeroizing;

use super::BackupError;
use super::api::BackupApi;
use crate::prompt::Prompter;

pub const ALREADY_ENABLED: &str = "The Backup API is already enabled";
pub const DISABLED: &str = "The Backup API has been disabled";
pub const UPDATED: &str = "The Backup API and the passphrase have been updated";
const PASSPHRASE_PROMPT: &str =
    "The passphrase to encrypt the appliance backups when the Backup API is used:";

/// Where a new passphrase comes from.
pub enum PassphraseSource<'a> {
    /// A line read from piped stdin.
    Stdin,
    Prompt(&'a dyn Prompter),
    Given(String),
}

impl PassphraseSource<'_> {
    /// Stdin when it is piped, otherwise the prompter.
    pub fn detect(prompter: &dyn Prompter) -> PassphraseSource<'_> {
        if io::stdin().is_terminal() {
            PassphraseSource::Prompt(prompter)
        } else {
            PassphraseSource::Stdin
        }
    }

    fn read(self) -> Result<Zeroizing<String>, BackupError> {
        let passphrase = match self {
            PassphraseSource::Given(value) => Zeroizing::new(value),
            PassphraseSource::Stdin => {
                let mut line = Zeroizing::new(String::new());
                io::stdin()
                    .lock()
                    .read_line(&mut line)
                    .map_err(|err| BackupError::Passphrase(format!("could not read stdin: {err}")))?;
                Zeroizing::new(line.trim_end_matches(['\r', '\n']).to_string())
            }
            PassphraseSource::Prompt(prompter) => {
                let first = Zeroizing::new(prompter.password(PASSPHRASE_PROMPT)?);
                let second = Zeroizing::new(prompter.password("Confirm your passphrase:")?);
                if *first != *second {
                    return Err(BackupError::Passphrase("the passphrases did not match".into()));
                }
                first
            }
        };
        if passphrase.is_empty() {
            return Err(BackupError::Passphrase("the passphrase cannot be empty".into()));
        }
        Ok(passphrase)
    }
}

pub async fn is_enabled(api: &BackupApi) -> Result<bool, BackupError> {
    Ok(api.global_settings().await?.backup_api_enabled)
}

/// Enables (with a new passphrase) or disables the backup API and returns the message to print.
/// Unknown settings are sent back unchanged.
pub async fn toggle<'p>(
    api: &BackupApi,
    disable: bool,
    passphrase: impl FnOnce() -> PassphraseSource<'p>,
) -> Result<&'static str, BackupError> {
    let mut settings = api.global_settings().await?;
    if settings.backup_api_enabled && !disable {
        return Ok(ALREADY_ENABLED);
    }
    let message = if disable {
        settings.backup_api_enabled = false;
        settings.backup_passphrase = None;
        DISABLED
    } else {
        let secret = passphrase().read()?;
        settings.backup_api_enabled = true;
        settings.backup_passphrase = Some(secret.to_string());
        UPDATED
    };
    api.put_global_settings(&settings).await?;
    info!(enabled = settings.backup_api_enabled, "updated backup API setting");
    Ok(message)
}
