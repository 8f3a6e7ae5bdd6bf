//! Sign-in state machine: version negotiation, provider sign-in, optional one-time password,
//! then the authorization exchange that yields the bearer.

use ::common::api::{
    IdentityProvider, ListResponse, LoginRequest, LoginResponse, NotAcceptable, ProviderType,
};
use chrono::Utc;
use reqwest::{Method, StatusCode};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ApiError, Classify, ErrorKind};
use crate::inventory::{self, Inventory};
use crate::prompt::{PromptError, Prompter};
use crate::secrets::{self, SecretError, SecretName, SecretStore};
use crate::session::Session;
use crate::transport::{self, ApiClient, MediaType, NEGOTIATION_START_VERSION};

mod local;
pub mod oidc;
pub mod otp;

pub use local::Credentials;
pub use oidc::OidcSettings;

pub const NOT_SIGNED_IN: &str = "no authentication, run 'sdpctl configure signin'";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error("invalid one-time password")]
    InvalidOtp,
    #[error("authentication requires one-time-password, but a TTY prompt is not allowed, can't continue")]
    OtpRequiresPrompt,
    #[error("could not automatically determine api version to use")]
    Negotiation,
    #[error("the collective supports API versions {min} to {max}, which this client cannot use")]
    UnsupportedVersion { min: u32, max: u32 },
    #[error("the collective advertises no identity providers")]
    NoProvider,
    #[error("no identity provider selected; set SDPCTL_PROVIDER")]
    ProviderNotSelected,
    #[error("invalid provider {name}. Available providers: {}", available.join(", "))]
    UnknownProvider { name: String, available: Vec<String> },
    #[error("{0}")]
    UnsupportedProvider(String),
    #[error("No TTY present, and missing required environment variables to authenticate")]
    MissingCredentials,
    #[error("OpenID Connect sign-in failed: {0}")]
    Oidc(String),
    #[error("{}", NOT_SIGNED_IN)]
    NotSignedIn,
    #[error("sign-in invariant violated: {0}")]
    Invariant(String),
    #[error("{0}")]
    Api(#[from] ApiError),
    #[error("{0}")]
    Prompt(#[from] PromptError),
    #[error("{0}")]
    Secret(#[from] SecretError),
}

impl Classify for AuthError {
    fn kind(&self) -> ErrorKind {
        match self {
            AuthError::ProviderNotSelected
            | AuthError::UnknownProvider { .. }
            | AuthError::UnsupportedProvider(_) => ErrorKind::Validation,
            AuthError::Api(err) => err.kind(),
            AuthError::Prompt(PromptError::Cancelled) => ErrorKind::Cancelled,
            AuthError::Secret(err) => err.kind(),
            AuthError::Invariant(_) => ErrorKind::Unknown,
            _ => ErrorKind::Auth,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SignInOptions {
    /// `--provider` / `SDPCTL_PROVIDER`.
    pub provider: Option<String>,
    /// Provider remembered from the last sign-in.
    pub saved_provider: Option<String>,
    /// `SDPCTL_VERSION`; skips the negotiation probe.
    pub pinned_version: Option<u32>,
    pub interactive: bool,
    pub oidc: OidcSettings,
}

#[derive(Debug)]
pub struct SignInOutcome {
    pub session: Session,
    pub provider: Option<String>,
    /// Credentials used by a local-style provider.
    pub credentials: Option<Credentials>,
    /// New refresh token from an OIDC provider.
    pub refresh_token: Option<String>,
    /// True when the stored bearer was still accepted and nothing new was issued.
    pub reused: bool,
}

struct ProviderLogin {
    request: LoginRequest,
    credentials: Option<Credentials>,
    refresh_token: Option<String>,
}

/// Drives one sign-in against a collective.
pub struct Authenticator<'a> {
    client: reqwest::Client,
    base: String,
    host: String,
    device_id: Uuid,
    secrets: &'a SecretStore,
    prompter: &'a dyn Prompter,
}

impl<'a> Authenticator<'a> {
    pub fn new(
        client: reqwest::Client,
        base: impl Into<String>,
        host: impl Into<String>,
        device_id: Uuid,
        secrets: &'a SecretStore,
        prompter: &'a dyn Prompter,
    ) -> Self {
        Self {
            client,
            base: base.into(),
            host: host.into(),
            device_id,
            secrets,
            prompter,
        }
    }

    fn api(&self, version: u32) -> ApiClient {
        ApiClient::new(self.client.clone(), self.base.clone(), version)
    }

    pub async fn sign_in(
        &self,
        opts: &SignInOptions,
        stored: Option<&Session>,
    ) -> Result<SignInOutcome, AuthError> {
        if let Some(session) = stored
            && self.still_authorized(session).await
        {
            info!("stored bearer is still valid");
            return Ok(SignInOutcome {
                session: session.clone(),
                provider: None,
                credentials: None,
                refresh_token: None,
                reused: true,
            });
        }

        let version = match opts.pinned_version {
            Some(version) => version,
            None => self.negotiate().await?,
        };
        let api = self.api(version);
        let providers: ListResponse<IdentityProvider> =
            api.get("/identity-providers/names").await?;
        let provider = select_provider(&providers.data, opts, self.prompter)?;
        debug!(provider = %provider.name, kind = provider.kind.as_str(), "selected identity provider");

        let login = self.provider_login(provider, opts).await?;
        let (login_token, api) = self.authenticate(api, &login.request).await?;
        let bearer = self
            .authorize(&api, &login_token, login.credentials.as_ref(), opts.interactive)
            .await?;

        let session = Session {
            bearer: bearer.token,
            expires_at: bearer.expires,
            api_version: api.version(),
            primary_controller_version: None,
            host: self.host.clone(),
            device_id: self.device_id,
        };
        if !session.is_valid(Utc::now()) {
            return Err(AuthError::Invariant(
                "sign-in returned an empty or expired token".into(),
            ));
        }

        let primary_controller_version = self.primary_version(&session).await;
        Ok(SignInOutcome {
            session: Session {
                primary_controller_version,
                ..session
            },
            provider: Some(provider.name.clone()),
            credentials: login.credentials,
            refresh_token: login.refresh_token,
            reused: false,
        })
    }

    async fn still_authorized(&self, session: &Session) -> bool {
        if !session.is_valid(Utc::now()) || session.host != self.host {
            return false;
        }
        let api = self.api(session.api_version).with_bearer(&session.bearer);
        let req = api.request(Method::GET, "/authorization", MediaType::Json);
        match api.send_raw(req).await {
            Ok(res) if res.status().is_success() => true,
            Ok(res) => {
                debug!(status = %res.status(), "stored bearer rejected");
                false
            }
            Err(err) => {
                debug!(%err, "stored bearer check failed");
                false
            }
        }
    }

    /// Offers the lowest version with only the device id; the 406 reply names the range.
    pub async fn negotiate(&self) -> Result<u32, AuthError> {
        let api = self.api(NEGOTIATION_START_VERSION);
        let probe = LoginRequest {
            provider_name: String::new(),
            device_id: self.device_id,
            username: None,
            password: None,
            id_token: None,
            access_token: None,
        };
        let req = api
            .request(Method::POST, "/authentication", MediaType::Json)
            .json(&probe);
        let res = api.send_raw(req).await?;
        if res.status() != StatusCode::NOT_ACCEPTABLE {
            debug!(status = %res.status(), "negotiation probe was not answered with 406");
            return Err(AuthError::Negotiation);
        }
        let range: NotAcceptable = transport::decode_json(res).await?;
        check_range(range)
    }

    async fn provider_login(
        &self,
        provider: &IdentityProvider,
        opts: &SignInOptions,
    ) -> Result<ProviderLogin, AuthError> {
        let mut request = LoginRequest {
            provider_name: provider.name.clone(),
            device_id: self.device_id,
            username: None,
            password: None,
            id_token: None,
            access_token: None,
        };
        match &provider.kind {
            ProviderType::Credentials
            | ProviderType::Ldap
            | ProviderType::LdapCertificate
            | ProviderType::Radius => {
                let creds = Credentials::load(self.secrets)
                    .await?
                    .complete(self.prompter, opts.interactive)?;
                request.username = creds.username.clone();
                request.password = creds.password.clone();
                Ok(ProviderLogin {
                    request,
                    credentials: Some(creds),
                    refresh_token: None,
                })
            }
            ProviderType::Oidc => {
                if secrets::keyring_disabled() {
                    return Err(AuthError::UnsupportedProvider(format!(
                        "{} provider does not work when environment variable {} is set",
                        provider.kind.as_str(),
                        secrets::NO_KEYRING_ENV
                    )));
                }
                let tokens = self.oidc_tokens(provider, opts).await?;
                request.id_token = Some(tokens.id_token);
                request.access_token = Some(tokens.access_token);
                Ok(ProviderLogin {
                    request,
                    credentials: None,
                    refresh_token: tokens.refresh_token,
                })
            }
            other => Err(AuthError::UnsupportedProvider(format!(
                "{} {} identity provider is not supported",
                provider.name,
                other.as_str()
            ))),
        }
    }

    async fn oidc_tokens(
        &self,
        provider: &IdentityProvider,
        opts: &SignInOptions,
    ) -> Result<oidc::OidcTokens, AuthError> {
        if let Some(refresh_token) = self.secrets.get(SecretName::RefreshToken).await? {
            match oidc::refresh(&self.client, provider, &refresh_token).await {
                Ok(tokens) => return Ok(tokens),
                Err(err) => info!(%err, "refresh token rejected, starting browser sign-in"),
            }
        }
        if !opts.interactive {
            return Err(AuthError::MissingCredentials);
        }
        oidc::browser_flow(&self.client, provider, &opts.oidc).await
    }

    /// `POST /authentication`, re-offering once at the server's maximum on 406.
    async fn authenticate(
        &self,
        mut api: ApiClient,
        request: &LoginRequest,
    ) -> Result<(LoginResponse, ApiClient), AuthError> {
        let mut renegotiated = false;
        loop {
            let req = api
                .request(Method::POST, "/authentication", MediaType::Json)
                .json(request);
            let res = api.send_raw(req).await?;
            match res.status() {
                StatusCode::NOT_ACCEPTABLE if !renegotiated => {
                    let range: NotAcceptable = transport::decode_json(res).await?;
                    let version = check_range(range)?;
                    debug!(version, "server asked for a different API version");
                    api = api.with_version(version);
                    renegotiated = true;
                }
                StatusCode::UNAUTHORIZED => {
                    let err = transport::error_from_response(res).await;
                    return Err(AuthError::InvalidCredentials(err.message().to_string()));
                }
                _ => {
                    let res = transport::check_status(res).await?;
                    let login: LoginResponse = transport::decode_json(res).await?;
                    return Ok((login, api));
                }
            }
        }
    }

    /// `GET /authorization` with the login token, answering one-time password challenges.
    async fn authorize(
        &self,
        api: &ApiClient,
        login: &LoginResponse,
        credentials: Option<&Credentials>,
        interactive: bool,
    ) -> Result<LoginResponse, AuthError> {
        let mut token = login.token.clone();
        let mut challenged = false;
        loop {
            let authed = api.clone().with_bearer(&token);
            let req = authed.request(Method::GET, "/authorization", MediaType::Json);
            let res = authed.send_raw(req).await?;
            if res.status() == StatusCode::PRECONDITION_FAILED && !challenged {
                let password = credentials.and_then(|c| c.password.as_deref());
                let accepted = otp::challenge(&authed, password, self.prompter, interactive).await?;
                token = accepted.token;
                challenged = true;
                continue;
            }
            let res = transport::check_status(res).await?;
            return Ok(transport::decode_json(res).await?);
        }
    }

    async fn primary_version(&self, session: &Session) -> Option<String> {
        let api = self.api(session.api_version).with_bearer(&session.bearer);
        let members = match Inventory::new(api).joined().await {
            Ok(members) => members,
            Err(err) => {
                warn!(%err, "could not read appliance stats for the primary controller version");
                return None;
            }
        };
        match inventory::find_primary(&members, &self.host) {
            Ok(primary) => primary.version().map(str::to_string),
            Err(err) => {
                warn!(%err, "could not determine the primary controller version");
                None
            }
        }
    }
}

fn check_range(range: NotAcceptable) -> Result<u32, AuthError> {
    let NotAcceptable {
        min_supported_version: min,
        max_supported_version: max,
    } = range;
    if max == 0 || max < min || max < NEGOTIATION_START_VERSION {
        return Err(AuthError::UnsupportedVersion { min, max });
    }
    Ok(max)
}

/// `--provider` > saved provider > the only provider > interactive choice.
pub fn select_provider<'p>(
    providers: &'p [IdentityProvider],
    opts: &SignInOptions,
    prompter: &dyn Prompter,
) -> Result<&'p IdentityProvider, AuthError> {
    if providers.is_empty() {
        return Err(AuthError::NoProvider);
    }
    let by_name = |name: &str| providers.iter().find(|p| p.name == name);
    let available = || providers.iter().map(|p| p.name.clone()).collect::<Vec<_>>();

    if let Some(name) = opts.provider.as_deref().filter(|n| !n.is_empty()) {
        return by_name(name).ok_or_else(|| AuthError::UnknownProvider {
            name: name.to_string(),
            available: available(),
        });
    }
    if let Some(provider) = opts.saved_provider.as_deref().and_then(by_name) {
        return Ok(provider);
    }
    if let [only] = providers {
        return Ok(only);
    }
    if !opts.interactive {
        return Err(AuthError::ProviderNotSelected);
    }
    let labels: Vec<String> = providers
        .iter()
        .map(|p| match p.display_name.as_deref() {
            Some(display) if display != p.name => format!("{} ({display})", p.name),
            _ => p.name.clone(),
        })
        .collect();
    let idx = prompter.select("Choose a provider:", &labels)?;
    providers
        .get(idx)
        .ok_or_else(|| AuthError::Prompt(PromptError::InvalidSelection(idx.to_string())))
}

/// Forgets the bearer and refresh token, and the credentials unless they were remembered.
pub async fn sign_out(secrets: &SecretStore, keep_credentials: bool) -> Result<(), AuthError> {
    secrets.delete(SecretName::Bearer).await?;
    secrets.delete(SecretName::RefreshToken).await?;
    if !keep_credentials {
        Credentials::forget(secrets).await?;
    }
    Ok(())
}
