//! In-process fake of a collective's admin API for end-to-end tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Json, Path, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::Utc;
use common::api::{
    AdminInterface, Appliance, ApplianceStat, BackupCreated, BackupRequest, BackupStatus,
    ErrorBody, FunctionToggle, GlobalSettings, IdentityProvider, ListResponse, LoginRequest,
    LoginResponse, NotAcceptable, OtpInitializeResponse, OtpRequest, OtpSeedType, ProviderType,
};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};
use tokio::time::sleep;
use uuid::Uuid;

pub const SESSION_TOKEN: &str = "session-token";
pub const LOGIN_TOKEN: &str = "login-token";
pub const OTP_TOKEN: &str = "otp-token";
pub const BACKUP_BODY: &[u8] = b"-----BEGIN PGP MESSAGE-----\nbackup\n-----END PGP MESSAGE-----\n";

/// One request as the fake saw it.
#[derive(Debug, Clone)]
pub struct Seen {
    pub method: String,
    pub path: String,
    pub accept: Option<String>,
    pub authorization: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuthScript {
    pub min_version: u32,
    pub max_version: u32,
    pub otp_required: bool,
    pub accepted_otp: String,
}

impl Default for AuthScript {
    fn default() -> Self {
        Self {
            min_version: 7,
            max_version: 19,
            otp_required: false,
            accepted_otp: "123456".into(),
        }
    }
}

#[derive(Default)]
pub struct FakeState {
    pub appliances: Vec<Appliance>,
    pub stats: Vec<ApplianceStat>,
    /// Status replies per appliance; the last one repeats.
    pub scripts: HashMap<Uuid, VecDeque<BackupStatus>>,
    pub settings: GlobalSettings,
    pub auth: AuthScript,
    pub backups: HashMap<Uuid, Uuid>,
    pub initiated: Vec<Uuid>,
    pub polls: HashMap<Uuid, u32>,
    pub downloads: Vec<Uuid>,
    pub deleted: Vec<(Uuid, Uuid)>,
    pub otp_attempts: u32,
    pub settings_puts: Vec<serde_json::Value>,
    pub requests: Vec<Seen>,
}

type Shared = Arc<Mutex<FakeState>>;

pub struct FakeCollective {
    addr: SocketAddr,
    state: Shared,
    handle: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl FakeCollective {
    pub async fn start(state: FakeState) -> anyhow::Result<Self> {
        let state = Arc::new(Mutex::new(state));
        let listener = bind_listener().await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let router = Router::new()
            .nest("/admin", Self::router(state.clone()))
            .layer(middleware::from_fn_with_state(state.clone(), record));
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            let _ = server.await;
        });
        Ok(Self {
            addr,
            state,
            handle: Some(handle),
            shutdown_tx: Some(shutdown_tx),
        })
    }

    fn router(state: Shared) -> Router {
        Router::new()
            .route("/authentication", post(authentication))
            .route("/authorization", get(authorization))
            .route("/authentication/otp/initialize", post(otp_initialize))
            .route("/authentication/otp", post(otp_submit))
            .route("/identity-providers/names", get(providers))
            .route("/appliances", get(appliances))
            .route("/stats/appliances", get(stats))
            .route("/global-settings", get(get_settings).put(put_settings))
            .route("/appliances/{id}/backup", post(initiate))
            .route("/appliances/{id}/backup/{backup}/status", get(status))
            .route(
                "/appliances/{id}/backup/{backup}",
                get(download).delete(delete_backup),
            )
            .with_state(state)
    }

    /// Admin URL of the fake, as `sdpctl configure` would store it.
    pub fn url(&self) -> String {
        format!("http://{}/admin", self.addr)
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub async fn with_state<T>(&self, f: impl FnOnce(&FakeState) -> T) -> T {
        let guard = self.state.lock().await;
        f(&guard)
    }

    pub async fn deleted(&self) -> Vec<(Uuid, Uuid)> {
        self.with_state(|s| s.deleted.clone()).await
    }

    pub async fn initiated(&self) -> Vec<Uuid> {
        self.with_state(|s| s.initiated.clone()).await
    }

    pub async fn polls(&self, appliance: Uuid) -> u32 {
        self.with_state(|s| s.polls.get(&appliance).copied().unwrap_or_default())
            .await
    }

    pub async fn requests(&self) -> Vec<Seen> {
        self.with_state(|s| s.requests.clone()).await
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn bind_listener() -> anyhow::Result<TcpListener> {
    let mut attempts = 0;
    loop {
        match TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await {
            Ok(listener) => return Ok(listener),
            Err(err) if err.kind() == ErrorKind::AddrInUse && attempts < 5 => {
                attempts += 1;
                sleep(Duration::from_millis(50)).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// A controller that is the primary for `host`.
pub fn controller(name: &str, host: &str, version: &str) -> (Appliance, ApplianceStat) {
    let (mut appliance, stat) = appliance(name, version);
    appliance.admin_interface = Some(AdminInterface {
        hostname: host.to_string(),
        https_port: Some(8443),
    });
    appliance.controller = Some(FunctionToggle { enabled: true });
    (appliance, stat)
}

/// An activated, healthy gateway.
pub fn appliance(name: &str, version: &str) -> (Appliance, ApplianceStat) {
    let id = Uuid::new_v4();
    let appliance = Appliance {
        id,
        name: name.to_string(),
        hostname: format!("{name}.devops"),
        activated: true,
        admin_interface: Some(AdminInterface {
            hostname: format!("{name}.devops"),
            https_port: Some(8443),
        }),
        gateway: Some(FunctionToggle { enabled: true }),
        ..Appliance::default()
    };
    let stat = ApplianceStat {
        id,
        name: name.to_string(),
        status: "healthy".into(),
        version: Some(version.to_string()),
        ..ApplianceStat::default()
    };
    (appliance, stat)
}

pub fn processing() -> BackupStatus {
    BackupStatus {
        status: "processing".into(),
        ..BackupStatus::default()
    }
}

pub fn done() -> BackupStatus {
    BackupStatus {
        status: "done".into(),
        result: Some("success".into()),
        details: None,
    }
}

pub fn failed(details: &str) -> BackupStatus {
    BackupStatus {
        status: "done".into(),
        result: Some("failure".into()),
        details: Some(details.to_string()),
    }
}

impl FakeState {
    pub fn add(&mut self, (appliance, stat): (Appliance, ApplianceStat), script: Vec<BackupStatus>) -> Uuid {
        let id = appliance.id;
        self.appliances.push(appliance);
        self.stats.push(stat);
        self.scripts.insert(id, script.into());
        id
    }

    pub fn enable_backup_api(&mut self) {
        self.settings.backup_api_enabled = true;
    }
}

async fn record(State(state): State<Shared>, req: Request, next: Next) -> Response {
    let seen = {
        let value_of = |name: header::HeaderName| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Seen {
            method: req.method().to_string(),
            path: req.uri().path().to_string(),
            accept: value_of(header::ACCEPT),
            authorization: value_of(header::AUTHORIZATION),
        }
    };
    state.lock().await.requests.push(seen);
    next.run(req).await
}

fn requested_version(headers: &HeaderMap) -> Option<u32> {
    let accept = headers.get(header::ACCEPT)?.to_str().ok()?;
    let rest = accept.strip_prefix("application/vnd.appgate.peer-v")?;
    let (version, _media) = rest.split_once('+')?;
    version.parse().ok()
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

fn error(status: StatusCode, id: &str, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            id: id.to_string(),
            message: message.to_string(),
            errors: Vec::new(),
        }),
    )
        .into_response()
}

/// Rejects anything but the session bearer at the negotiated version.
async fn guard(state: &Shared, headers: &HeaderMap) -> Option<Response> {
    let max = state.lock().await.auth.max_version;
    if requested_version(headers) != Some(max) {
        return Some(error(StatusCode::NOT_ACCEPTABLE, "not acceptable", "wrong version"));
    }
    if bearer(headers).as_deref() != Some(SESSION_TOKEN) {
        return Some(error(StatusCode::UNAUTHORIZED, "unauthorized", "invalid token"));
    }
    None
}

fn token(value: &str) -> LoginResponse {
    LoginResponse {
        token: value.to_string(),
        expires: Utc::now() + chrono::Duration::hours(12),
    }
}

async fn authentication(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<LoginRequest>,
) -> Response {
    let auth = state.lock().await.auth.clone();
    if requested_version(&headers) != Some(auth.max_version) {
        return (
            StatusCode::NOT_ACCEPTABLE,
            Json(NotAcceptable {
                min_supported_version: auth.min_version,
                max_supported_version: auth.max_version,
            }),
        )
            .into_response();
    }
    if body.username.as_deref() != Some("admin") || body.password.as_deref() != Some("admin") {
        return error(StatusCode::UNAUTHORIZED, "unauthorized", "Invalid credentials");
    }
    let issued = if auth.otp_required { LOGIN_TOKEN } else { SESSION_TOKEN };
    Json(token(issued)).into_response()
}

async fn authorization(State(state): State<Shared>, headers: HeaderMap) -> Response {
    let otp_required = state.lock().await.auth.otp_required;
    match bearer(&headers).as_deref() {
        Some(LOGIN_TOKEN) if otp_required => error(
            StatusCode::PRECONDITION_FAILED,
            "otp required",
            "one-time password required",
        ),
        Some(OTP_TOKEN | SESSION_TOKEN) => Json(token(SESSION_TOKEN)).into_response(),
        _ => error(StatusCode::UNAUTHORIZED, "unauthorized", "invalid token"),
    }
}

async fn otp_initialize(headers: HeaderMap) -> Response {
    if bearer(&headers).as_deref() != Some(LOGIN_TOKEN) {
        return error(StatusCode::UNAUTHORIZED, "unauthorized", "invalid token");
    }
    Json(OtpInitializeResponse {
        kind: OtpSeedType::AlreadySeeded,
        barcode: None,
        secret: None,
    })
    .into_response()
}

async fn otp_submit(State(state): State<Shared>, Json(body): Json<OtpRequest>) -> Response {
    let mut guard = state.lock().await;
    guard.otp_attempts += 1;
    if body.otp == guard.auth.accepted_otp {
        return Json(token(OTP_TOKEN)).into_response();
    }
    error(StatusCode::UNAUTHORIZED, "unauthorized", "Invalid one-time password")
}

async fn providers() -> Json<ListResponse<IdentityProvider>> {
    Json(ListResponse {
        data: vec![IdentityProvider {
            name: "local".into(),
            display_name: Some("Local".into()),
            kind: ProviderType::Credentials,
            auth_url: None,
            token_url: None,
            client_id: None,
            scope: None,
        }],
    })
}

async fn appliances(State(state): State<Shared>, headers: HeaderMap) -> Response {
    if let Some(rejected) = guard(&state, &headers).await {
        return rejected;
    }
    let data = state.lock().await.appliances.clone();
    Json(ListResponse { data }).into_response()
}

async fn stats(State(state): State<Shared>, headers: HeaderMap) -> Response {
    if let Some(rejected) = guard(&state, &headers).await {
        return rejected;
    }
    let data = state.lock().await.stats.clone();
    Json(ListResponse { data }).into_response()
}

async fn get_settings(State(state): State<Shared>, headers: HeaderMap) -> Response {
    if let Some(rejected) = guard(&state, &headers).await {
        return rejected;
    }
    let settings = state.lock().await.settings.clone();
    Json(settings).into_response()
}

async fn put_settings(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    if let Some(rejected) = guard(&state, &headers).await {
        return rejected;
    }
    let mut guard = state.lock().await;
    if let Ok(settings) = serde_json::from_value::<GlobalSettings>(body.clone()) {
        guard.settings = settings;
    }
    guard.settings_puts.push(body);
    StatusCode::NO_CONTENT.into_response()
}

async fn initiate(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path(appliance): Path<Uuid>,
    Json(_body): Json<BackupRequest>,
) -> Response {
    if let Some(rejected) = guard(&state, &headers).await {
        return rejected;
    }
    let mut guard = state.lock().await;
    if !guard.settings.backup_api_enabled {
        return error(StatusCode::CONFLICT, "conflict", "backup API is disabled");
    }
    let id = Uuid::new_v4();
    guard.backups.insert(id, appliance);
    guard.initiated.push(appliance);
    Json(BackupCreated { id }).into_response()
}

async fn status(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path((appliance, backup)): Path<(Uuid, Uuid)>,
) -> Response {
    if let Some(rejected) = guard(&state, &headers).await {
        return rejected;
    }
    let mut guard = state.lock().await;
    if guard.backups.get(&backup) != Some(&appliance) {
        return error(StatusCode::NOT_FOUND, "not found", "no such backup");
    }
    *guard.polls.entry(appliance).or_default() += 1;
    let script = guard.scripts.entry(appliance).or_default();
    let reply = if script.len() > 1 {
        script.pop_front()
    } else {
        script.front().cloned()
    };
    Json(reply.unwrap_or_else(done)).into_response()
}

async fn download(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path((appliance, backup)): Path<(Uuid, Uuid)>,
) -> Response {
    if let Some(rejected) = guard(&state, &headers).await {
        return rejected;
    }
    let mut guard = state.lock().await;
    if guard.backups.get(&backup) != Some(&appliance) {
        return error(StatusCode::NOT_FOUND, "not found", "no such backup");
    }
    guard.downloads.push(appliance);
    (
        [(header::CONTENT_TYPE, "application/vnd.appgate.peer-v19+gpg")],
        BACKUP_BODY,
    )
        .into_response()
}

async fn delete_backup(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path((appliance, backup)): Path<(Uuid, Uuid)>,
) -> Response {
    if let Some(rejected) = guard(&state, &headers).await {
        return rejected;
    }
    let mut guard = state.lock().await;
    if guard.backups.remove(&backup).is_none() {
        return error(StatusCode::NOT_FOUND, "not found", "no such backup");
    }
    guard.deleted.push((appliance, backup));
    StatusCode::NO_CONTENT.into_response()
}

