//! Browser-based OpenID Connect sign-in with PKCE and a loopback redirect listener.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ::common::api::IdentityProvider;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, warn};
use url::Url;

use super::AuthError;

pub const DEFAULT_LOOPBACK_PORT: u16 = 29001;
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const DONE_PAGE: &str = "<!DOCTYPE html><html><head><title>sdpctl</title></head>\
<body><h3>Authentication complete.</h3><p>You can close this window and return to the terminal.</p></body></html>";

#[derive(Debug, Clone)]
pub struct OidcSettings {
    pub port: u16,
    pub open_browser: bool,
    pub callback_timeout: Duration,
}

impl Default for OidcSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_LOOPBACK_PORT,
            open_browser: true,
            callback_timeout: DEFAULT_CALLBACK_TIMEOUT,
        }
    }
}

impl OidcSettings {
    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}/oidc", self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OidcTokens {
    pub id_token: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OidcErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    pub fn generate() -> Self {
        let verifier = random_token(48);
        let challenge = code_challenge(&verifier);
        Self { verifier, challenge }
    }
}

/// `BASE64URL(SHA256(verifier))` without padding.
pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

fn provider_field<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str, AuthError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AuthError::Oidc(format!("identity provider does not advertise {field}")))
}

pub fn authorization_url(
    provider: &IdentityProvider,
    redirect_uri: &str,
    state: &str,
    challenge: &str,
) -> Result<Url, AuthError> {
    let auth_url = provider_field(&provider.auth_url, "authUrl")?;
    let mut url = Url::parse(auth_url)
        .map_err(|err| AuthError::Oidc(format!("invalid authUrl '{auth_url}': {err}")))?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("scope", provider.scope.as_deref().unwrap_or("openid"))
        .append_pair("client_id", provider_field(&provider.client_id, "clientId")?)
        .append_pair("state", state)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("code_challenge", challenge)
        .append_pair("code_challenge_method", "S256");
    Ok(url)
}

async fn token_request(
    client: &reqwest::Client,
    provider: &IdentityProvider,
    form: &[(&str, &str)],
) -> Result<OidcTokens, AuthError> {
    let token_url = provider_field(&provider.token_url, "tokenUrl")?;
    let res = client
        .post(token_url)
        .form(form)
        .send()
        .await
        .map_err(|err| AuthError::Oidc(format!("token request failed: {err}")))?;
    let status = res.status();
    let body = res
        .text()
        .await
        .map_err(|err| AuthError::Oidc(format!("token response unreadable: {err}")))?;
    if !status.is_success() {
        let detail = serde_json::from_str::<OidcErrorBody>(&body)
            .map(|e| format!("{} {}", e.error, e.error_description).trim().to_string())
            .unwrap_or_else(|_| body.trim().to_string());
        return Err(AuthError::Oidc(format!(
            "token endpoint returned {status}: {detail}"
        )));
    }
    let tokens: OidcTokens = serde_json::from_str(&body)
        .map_err(|err| AuthError::Oidc(format!("token response malformed: {err}")))?;
    if tokens.id_token.is_empty() || tokens.access_token.is_empty() {
        return Err(AuthError::Oidc("token response is missing tokens".into()));
    }
    Ok(tokens)
}

pub async fn exchange_code(
    client: &reqwest::Client,
    provider: &IdentityProvider,
    code: &str,
    verifier: &str,
    redirect_uri: &str,
) -> Result<OidcTokens, AuthError> {
    let client_id = provider_field(&provider.client_id, "clientId")?;
    token_request(
        client,
        provider,
        &[
            ("client_id", client_id),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri),
            ("code_verifier", verifier),
            ("code", code),
        ],
    )
    .await
}

pub async fn refresh(
    client: &reqwest::Client,
    provider: &IdentityProvider,
    refresh_token: &str,
) -> Result<OidcTokens, AuthError> {
    let client_id = provider_field(&provider.client_id, "clientId")?;
    token_request(
        client,
        provider,
        &[
            ("client_id", client_id),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ],
    )
    .await
}

#[derive(Clone)]
struct LoopbackState {
    auth_url: String,
    state: String,
    codes: mpsc::Sender<Result<String, AuthError>>,
    done: Arc<Mutex<bool>>,
}

async fn start_redirect(State(st): State<LoopbackState>) -> Response {
    Redirect::to(&st.auth_url).into_response()
}

async fn receive_code(
    State(st): State<LoopbackState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mut done = st.done.lock().await;
    if *done {
        return (StatusCode::GONE, "sign-in already completed").into_response();
    }

    let outcome = if let Some(err) = params.get("error") {
        let description = params.get("error_description").cloned().unwrap_or_default();
        Err(AuthError::Oidc(format!("{err} {description}").trim().to_string()))
    } else if params.get("state").map(String::as_str) != Some(st.state.as_str()) {
        Err(AuthError::Oidc("state mismatch in redirect".into()))
    } else {
        match params.get("code").filter(|c| !c.is_empty()) {
            Some(code) => Ok(code.clone()),
            None => Err(AuthError::Oidc("missing code in redirect".into())),
        }
    };

    let status = if outcome.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    *done = true;
    let _ = st.codes.send(outcome).await;
    (status, Html(DONE_PAGE)).into_response()
}

fn open_browser(url: &str) {
    let opener = if cfg!(target_os = "macos") {
        "open"
    } else if cfg!(target_os = "windows") {
        "explorer"
    } else {
        "xdg-open"
    };
    if let Err(err) = std::process::Command::new(opener).arg(url).spawn() {
        warn!(%err, "could not launch a browser");
    }
}

/// Runs the interactive flow: serve the loopback listener, wait for one redirect,
/// then exchange the code for tokens.
pub async fn browser_flow(
    client: &reqwest::Client,
    provider: &IdentityProvider,
    settings: &OidcSettings,
) -> Result<OidcTokens, AuthError> {
    let pkce = Pkce::generate();
    let state = random_token(16);
    let redirect_uri = settings.redirect_uri();
    let auth_url = authorization_url(provider, &redirect_uri, &state, &pkce.challenge)?;

    let addr = SocketAddr::from(([127, 0, 0, 1], settings.port));
    let listener = TcpListener::bind(addr).await.map_err(|err| {
        AuthError::Oidc(format!("cannot listen on {addr} for the sign-in redirect: {err}"))
    })?;

    let (codes_tx, mut codes_rx) = mpsc::channel(1);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let app = Router::new()
        .route("/", get(start_redirect))
        .route("/oidc", get(receive_code))
        .with_state(LoopbackState {
            auth_url: auth_url.to_string(),
            state,
            codes: codes_tx,
            done: Arc::new(Mutex::new(false)),
        });
    let server = tokio::spawn(async move {
        let shutdown = async {
            let _ = stop_rx.await;
        };
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            warn!(%err, "sign-in redirect listener failed");
        }
    });

    let start_url = format!("http://localhost:{}/", settings.port);
    eprintln!("Complete the sign-in in your browser. If it does not open, visit:\n{start_url}");
    if settings.open_browser {
        open_browser(&start_url);
    }

    let received = tokio::time::timeout(settings.callback_timeout, codes_rx.recv()).await;
    let _ = stop_tx.send(());
    let _ = server.await;

    let code = match received {
        Ok(Some(outcome)) => outcome?,
        Ok(None) => return Err(AuthError::Oidc("redirect listener stopped early".into())),
        Err(_) => {
            return Err(AuthError::Oidc(
                "timed out waiting for the browser sign-in to complete".into(),
            ));
        }
    };
    debug!("received authorization code");
    exchange_code(client, provider, &code, &pkce.verifier, &redirect_uri).await
}
