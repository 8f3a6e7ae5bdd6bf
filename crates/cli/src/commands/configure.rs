use anyhow::Context;
use tracing::info;

use crate::args::{ConfigureArgs, ConfigureCommands, SigninArgs};
use crate::auth::{self, Authenticator, SignInOptions, SignInOutcome};
use crate::commands::CommandContext;
use crate::config;
use crate::secrets::{SecretName, SecretStore};
use crate::session::resolve_device_id;

const URL_PROMPT: &str =
    "Enter the url for the Controller API (example https://controller.company.com:8443):";

pub async fn handle_configure(ctx: &mut CommandContext, args: ConfigureArgs) -> anyhow::Result<()> {
    match args.command {
        Some(ConfigureCommands::Signin(signin)) => handle_signin(ctx, signin).await,
        Some(ConfigureCommands::Signout) => handle_signout(ctx).await,
        None => handle_set_url(ctx, args.url),
    }
}

fn handle_set_url(ctx: &mut CommandContext, url: Option<String>) -> anyhow::Result<()> {
    let raw = match url {
        Some(url) => url,
        None if ctx.interactive => ctx.prompter().input(URL_PROMPT)?,
        None => anyhow::bail!("missing url; run 'sdpctl configure <url>'"),
    };
    let url = config::normalize_url(&raw)?;
    if let Some(pem) = ctx.globals.pem_filepath.as_ref() {
        config::read_pem(pem).context("validating --pem")?;
        ctx.config.pem_filepath = Some(pem.clone());
    }
    if ctx.config.url.as_deref() != Some(url.as_str()) {
        ctx.config.clear_session();
        ctx.config.api_version = None;
        ctx.config.primary_controller_version = None;
        ctx.config.provider = None;
    }
    ctx.config.url = Some(url.clone());
    ctx.config.insecure = ctx.globals.insecure;
    ctx.save_config()?;
    println!("Configuration updated successfully: {url}");
    Ok(())
}

async fn handle_signin(ctx: &mut CommandContext, args: SigninArgs) -> anyhow::Result<()> {
    let host = ctx.host()?;
    let url = ctx.url()?;
    let secrets = ctx.secrets()?;
    let (device_id, device_changed) = resolve_device_id(&mut ctx.config);
    if device_changed {
        info!(%device_id, "generated a new device id");
    }
    let stored = ctx.interruptible(ctx.stored_session(&secrets)).await?;

    let opts = SignInOptions {
        provider: args.provider.clone(),
        saved_provider: ctx.config.provider.clone(),
        pinned_version: ctx.globals.api_version,
        interactive: ctx.interactive,
        ..SignInOptions::default()
    };
    let client = ctx.http_client()?;
    let authenticator =
        Authenticator::new(client, url.clone(), host, device_id, &secrets, ctx.prompter());
    let outcome = ctx
        .interruptible(authenticator.sign_in(&opts, stored.as_ref()))
        .await?;

    persist_sign_in(ctx, &secrets, &outcome, args.remember_me).await?;
    if ctx.config.url.is_none() {
        ctx.config.url = Some(url);
    }
    ctx.save_config()?;
    info!(
        api_version = outcome.session.api_version,
        reused = outcome.reused,
        "signed in"
    );
    Ok(())
}

/// Writes the bearer to the secret store (or the config file when the store is disabled or
/// stopped responding) and records the session metadata in the config.
async fn persist_sign_in(
    ctx: &mut CommandContext,
    secrets: &SecretStore,
    outcome: &SignInOutcome,
    remember_me: bool,
) -> anyhow::Result<()> {
    let session = &outcome.session;
    secrets
        .set(SecretName::Bearer, &session.bearer)
        .await
        .context("storing the bearer")?;
    if secrets.is_persistent() {
        ctx.config.bearer = None;
    } else {
        ctx.config.bearer = Some(session.bearer.clone());
    }
    if let Some(token) = outcome.refresh_token.as_deref() {
        secrets
            .set(SecretName::RefreshToken, token)
            .await
            .context("storing the refresh token")?;
    }
    if let Some(credentials) = outcome.credentials.as_ref()
        && remember_me
        && credentials.is_storable()
    {
        credentials.remember(secrets).await?;
        ctx.config.remember_me = true;
    }
    if let Some(provider) = outcome.provider.as_ref() {
        ctx.config.provider = Some(provider.clone());
    }
    ctx.config.api_version = Some(session.api_version);
    ctx.config.expires_at = Some(session.expires_at);
    if session.primary_controller_version.is_some() {
        ctx.config.primary_controller_version = session.primary_controller_version.clone();
    }
    Ok(())
}

async fn handle_signout(ctx: &mut CommandContext) -> anyhow::Result<()> {
    let secrets = ctx.secrets()?;
    auth::sign_out(&secrets, ctx.config.remember_me).await?;
    ctx.config.clear_session();
    ctx.save_config()?;
    info!("signed out");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::GlobalArgs;
    use crate::config::Config;
    use crate::prompt::{Answer, ScriptedPrompter};
    use crate::secrets::{SecretError, Vault};
    use crate::session::Session;
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;

    fn context(dir: &std::path::Path) -> CommandContext {
        let (_tx, rx) = watch::channel(false);
        CommandContext {
            config_dir: dir.to_path_buf(),
            config: Config::default(),
            globals: GlobalArgs::default(),
            interactive: false,
            prompter: Arc::new(crate::prompt::NoPrompter),
            cancel: rx,
        }
    }

    #[test]
    fn set_url_normalizes_and_resets_the_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut ctx = context(dir.path());
        ctx.config.url = Some("https://old.example:8443/admin".into());
        ctx.config.api_version = Some(18);
        ctx.config.bearer = Some("old".into());

        handle_set_url(&mut ctx, Some("ctrl.example".into())).expect("configured");

        let saved = Config::load_from(dir.path()).expect("load");
        assert_eq!(saved.url.as_deref(), Some("https://ctrl.example:8443/admin"));
        assert_eq!(saved.api_version, None);
        assert_eq!(saved.bearer, None);
    }

    #[test]
    fn set_url_rejects_invalid_pem() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pem = dir.path().join("ca.pem");
        std::fs::write(&pem, "not a certificate").expect("write");
        let mut ctx = context(dir.path());
        ctx.globals.pem_filepath = Some(pem);

        let err = handle_set_url(&mut ctx, Some("ctrl.example".into())).expect_err("bad pem");
        assert!(format!("{err:#}").contains("does not contain a PEM certificate"));
        assert!(!dir.path().join(config::CONFIG_FILE).exists());
    }

    #[test]
    fn missing_url_is_prompted_for_when_interactive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prompter = Arc::new(ScriptedPrompter::new([Answer::Text(
            "https://ctrl.example:444".into(),
        )]));
        let mut ctx = context(dir.path()).with_prompter(prompter, true);

        handle_set_url(&mut ctx, None).expect("configured");
        assert_eq!(
            ctx.config.url.as_deref(),
            Some("https://ctrl.example:444/admin")
        );

        let mut quiet = context(dir.path());
        assert!(handle_set_url(&mut quiet, None).is_err());
    }

    struct HungVault;

    impl Vault for HungVault {
        fn get(&self, _key: &str) -> Result<Option<String>, SecretError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(None)
        }
        fn set(&self, _key: &str, _value: &str) -> Result<(), SecretError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        }
        fn delete(&self, _key: &str) -> Result<(), SecretError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn bearer_falls_back_to_config_when_the_store_hangs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut ctx = context(dir.path());
        let secrets = SecretStore::new(Arc::new(HungVault), "ctrl.example")
            .with_deadline(Duration::from_millis(30));
        let outcome = SignInOutcome {
            session: Session {
                bearer: "fresh".into(),
                expires_at: Utc::now() + chrono::Duration::hours(1),
                api_version: 19,
                primary_controller_version: None,
                host: "ctrl.example".into(),
                device_id: uuid::Uuid::nil(),
            },
            provider: Some("local".into()),
            credentials: None,
            refresh_token: Some("refresh".into()),
            reused: false,
        };

        persist_sign_in(&mut ctx, &secrets, &outcome, false)
            .await
            .expect("sign-in persisted");

        assert!(!secrets.is_persistent());
        assert_eq!(ctx.config.bearer.as_deref(), Some("fresh"));
        assert_eq!(ctx.config.api_version, Some(19));
        assert_eq!(ctx.config.provider.as_deref(), Some("local"));
    }
}
