use std::future::Future;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;

use crate::args::GlobalArgs;
use crate::auth::AuthError;
use crate::change;
use crate::config::{self, Config};
use crate::error::Interrupted;
use crate::prompt::{NoPrompter, Prompter, TerminalPrompter};
use crate::secrets::{self, KeyringVault, SecretName, SecretStore};
use crate::session::Session;
use crate::transport::{ApiClient, TransportConfig, build_client};

pub mod backup;
pub mod configure;

/// Everything a command needs: settings, the prompter and the cancellation signal.
pub struct CommandContext {
    pub config_dir: PathBuf,
    pub config: Config,
    pub globals: GlobalArgs,
    pub interactive: bool,
    prompter: Arc<dyn Prompter>,
    cancel: watch::Receiver<bool>,
}

impl CommandContext {
    /// Loads the config file; prompts only when stdin is a terminal and `--no-interactive`
    /// was not given.
    pub fn new(globals: GlobalArgs, cancel: watch::Receiver<bool>) -> anyhow::Result<Self> {
        let config_dir = config::config_dir()?;
        let config = Config::load_from(&config_dir)?;
        let interactive = !globals.no_interactive && io::stdin().is_terminal();
        let prompter: Arc<dyn Prompter> = if interactive {
            Arc::new(TerminalPrompter)
        } else {
            Arc::new(NoPrompter)
        };
        Ok(Self {
            config_dir,
            config,
            globals,
            interactive,
            prompter,
            cancel,
        })
    }

    pub fn with_prompter(mut self, prompter: Arc<dyn Prompter>, interactive: bool) -> Self {
        self.prompter = prompter;
        self.interactive = interactive;
        self
    }

    pub fn prompter(&self) -> &dyn Prompter {
        self.prompter.as_ref()
    }

    pub fn cancel(&self) -> watch::Receiver<bool> {
        self.cancel.clone()
    }

    /// Runs `work` until it finishes or the operator interrupts, whichever comes first.
    pub async fn interruptible<T, E>(
        &self,
        work: impl Future<Output = Result<T, E>>,
    ) -> anyhow::Result<T>
    where
        E: Into<anyhow::Error>,
    {
        let mut cancel = self.cancel.clone();
        tokio::select! {
            biased;
            _ = change::cancelled(&mut cancel) => Err(Interrupted.into()),
            res = work => res.map_err(Into::into),
        }
    }

    /// `--url`/`SDPCTL_URL` over the configured URL.
    pub fn url(&self) -> anyhow::Result<String> {
        match self.globals.url.as_deref() {
            Some(url) => config::normalize_url(url),
            None => self.config.url.clone().ok_or_else(|| {
                anyhow::anyhow!("no collective configured, run 'sdpctl configure <url>'")
            }),
        }
    }

    pub fn host(&self) -> anyhow::Result<String> {
        let probe = Config {
            url: Some(self.url()?),
            ..Config::default()
        };
        probe.host()
    }

    pub fn http_client(&self) -> anyhow::Result<reqwest::Client> {
        let mut transport = TransportConfig::new(self.url()?);
        transport.insecure = self.globals.insecure || self.config.insecure;
        let pem = self
            .globals
            .pem_filepath
            .as_ref()
            .or(self.config.pem_filepath.as_ref());
        if let Some(path) = pem {
            transport.trusted_pem = Some(config::read_pem(path)?);
        }
        Ok(build_client(&transport)?)
    }

    /// The OS credential store backed by the encrypted file vault, or environment-only
    /// secrets under `SDPCTL_NO_KEYRING`.
    pub fn secrets(&self) -> anyhow::Result<SecretStore> {
        let host = self.host()?;
        if secrets::keyring_disabled() {
            return Ok(SecretStore::env_only(&host));
        }
        Ok(SecretStore::new(
            Arc::new(KeyringVault::system(&self.config_dir)),
            &host,
        ))
    }

    /// The stored session, if it is still valid.
    pub async fn stored_session(&self, secrets: &SecretStore) -> anyhow::Result<Option<Session>> {
        let bearer = secrets
            .get(SecretName::Bearer)
            .await
            .context("reading the stored bearer")?;
        let mut config = self.config.clone();
        if self.globals.url.is_some() {
            config.url = Some(self.url()?);
        }
        Ok(Session::restore(&config, bearer))
    }

    /// An authenticated client; fails with an auth error when nobody is signed in.
    pub async fn api(&self) -> anyhow::Result<ApiClient> {
        let secrets = self.secrets()?;
        let session = self
            .stored_session(&secrets)
            .await?
            .ok_or(AuthError::NotSignedIn)?;
        let version = self.globals.api_version.unwrap_or(session.api_version);
        Ok(ApiClient::new(self.http_client()?, self.url()?, version).with_bearer(session.bearer))
    }

    pub fn save_config(&self) -> anyhow::Result<()> {
        self.config
            .save_to(&self.config_dir)
            .with_context(|| format!("saving config in {}", self.config_dir.display()))
    }
}
