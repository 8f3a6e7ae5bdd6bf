use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{ApiError, ErrorKind};

pub const VENDOR: &str = "appgate";
/// Version offered on the first sign-in attempt.
pub const NEGOTIATION_START_VERSION: u32 = 5;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Json,
    /// Encrypted backup blobs.
    Gpg,
}

impl MediaType {
    fn suffix(&self) -> &'static str {
        match self {
            MediaType::Json => "json",
            MediaType::Gpg => "gpg",
        }
    }
}

pub fn accept_header(version: u32, media: MediaType) -> String {
    format!("application/vnd.{VENDOR}.peer-v{version}+{}", media.suffix())
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub base_url: String,
    pub insecure: bool,
    /// When set, the only trusted root.
    pub trusted_pem: Option<Vec<u8>>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl TransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            insecure: false,
            trusted_pem: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            user_agent: format!("sdpctl/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Builds the process-wide client. Proxy settings come from `HTTP_PROXY`/`HTTPS_PROXY`.
pub fn build_client(cfg: &TransportConfig) -> Result<Client, ApiError> {
    let mut builder = Client::builder()
        .user_agent(cfg.user_agent.clone())
        .connect_timeout(cfg.connect_timeout)
        .read_timeout(cfg.request_timeout);

    if let Some(pem) = cfg.trusted_pem.as_ref() {
        let cert = reqwest::Certificate::from_pem(pem).map_err(|err| {
            ApiError::new(ErrorKind::Tls, format!("invalid PEM certificate: {}", err))
        })?;
        builder = builder
            .tls_built_in_root_certs(false)
            .add_root_certificate(cert);
    }

    if cfg.insecure {
        warn!("TLS certificate verification is disabled");
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder.build().map_err(|err| {
        ApiError::new(ErrorKind::Tls, "failed to build HTTP client").with_source(err)
    })
}

/// Typed access to the admin API with version pinning and bearer injection.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base: String,
    version: u32,
    bearer: Option<String>,
    request_timeout: Duration,
}

impl ApiClient {
    pub fn new(client: Client, base: impl Into<String>, version: u32) -> Self {
        Self {
            client,
            base: base.into(),
            version,
            bearer: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_bearer(mut self, bearer: impl Into<String>) -> Self {
        self.bearer = Some(bearer.into());
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn has_bearer(&self) -> bool {
        self.bearer.as_deref().is_some_and(|b| !b.is_empty())
    }

    pub fn url(&self, path: &str) -> String {
        let trimmed = path.trim_start_matches('/');
        format!("{}/{}", self.base.trim_end_matches('/'), trimmed)
    }

    /// Starts a request carrying the pinned `Accept` header and, once signed in, the bearer.
    pub fn request(&self, method: Method, path: &str, media: MediaType) -> RequestBuilder {
        let mut req = self
            .client
            .request(method, self.url(path))
            .header(ACCEPT, accept_header(self.version, media));
        if let Some(bearer) = self.bearer.as_deref()
            && let Ok(value) = HeaderValue::from_str(&format!("Bearer {bearer}"))
        {
            req = req.header(AUTHORIZATION, value);
        }
        req
    }

    /// Sends without interpreting the status; callers that branch on 406/412 use this.
    pub async fn send_raw(&self, req: RequestBuilder) -> Result<Response, ApiError> {
        let req = req.build().map_err(|err| ApiError::from_reqwest(err, &self.base))?;
        let url = req.url().to_string();
        debug!(method = %req.method(), %url, "api request");
        let res = self
            .client
            .execute(req)
            .await
            .map_err(|err| ApiError::from_reqwest(err, &url))?;
        debug!(status = %res.status(), %url, "api response");
        Ok(res)
    }

    pub async fn send(&self, req: RequestBuilder) -> Result<Response, ApiError> {
        let res = self.send_raw(req).await?;
        check_status(res).await
    }

    pub async fn get<T>(&self, path: &str) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let req = self
            .request(Method::GET, path, MediaType::Json)
            .timeout(self.request_timeout);
        let res = self.send(req).await?;
        decode_json(res).await
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let req = self
            .request(Method::POST, path, MediaType::Json)
            .timeout(self.request_timeout)
            .json(body);
        let res = self.send(req).await?;
        decode_json(res).await
    }

    /// PUT with a body serialized by `serde_json`, which never HTML-escapes.
    pub async fn put_json<B>(&self, path: &str, body: &B) -> Result<(), ApiError>
    where
        B: Serialize + ?Sized,
    {
        let req = self
            .request(Method::PUT, path, MediaType::Json)
            .timeout(self.request_timeout)
            .json(body);
        let res = self.send(req).await?;
        drain(res).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        let req = self
            .request(Method::DELETE, path, MediaType::Json)
            .timeout(self.request_timeout);
        let res = self.send(req).await?;
        drain(res).await
    }

    /// Opens a streaming download of an encrypted blob. No total timeout is applied;
    /// the caller bounds the transfer.
    pub async fn download(&self, path: &str) -> Result<Response, ApiError> {
        let req = self.request(Method::GET, path, MediaType::Gpg);
        self.send(req).await
    }
}

/// Converts a non-2xx response into an [`ApiError`].
pub async fn check_status(res: Response) -> Result<Response, ApiError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    Err(error_from_response(res).await)
}

pub async fn error_from_response(res: Response) -> ApiError {
    let status = res.status();
    let url = res.url().to_string();
    let headers = res.headers().clone();
    let body = res.text().await.unwrap_or_default();
    ApiError::from_response(status, &headers, &body, &url)
}

pub async fn decode_json<T: DeserializeOwned>(res: Response) -> Result<T, ApiError> {
    let url = res.url().to_string();
    let bytes = res
        .bytes()
        .await
        .map_err(|err| ApiError::from_reqwest(err, &url))?;
    serde_json::from_slice(&bytes).map_err(|err| {
        ApiError::new(
            ErrorKind::Unknown,
            format!("failed to decode response from {}", url),
        )
        .with_source(err)
    })
}

async fn drain(res: Response) -> Result<(), ApiError> {
    let url = res.url().to_string();
    res.bytes()
        .await
        .map_err(|err| ApiError::from_reqwest(err, &url))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Classify;
    use httpmock::prelude::*;
    use serde_json::json;

    fn api(server: &MockServer, version: u32) -> ApiClient {
        let client = build_client(&TransportConfig::new(server.base_url())).expect("client");
        ApiClient::new(client, server.url("/admin"), version)
    }

    #[test]
    fn accept_header_pins_vendor_and_version() {
        assert_eq!(
            accept_header(19, MediaType::Json),
            "application/vnd.appgate.peer-v19+json"
        );
        assert_eq!(
            accept_header(19, MediaType::Gpg),
            "application/vnd.appgate.peer-v19+gpg"
        );
    }

    #[test]
    fn url_joins_without_double_slashes() {
        let api = ApiClient::new(Client::new(), "https://ctrl.example.com:8443/admin/", 19);
        assert_eq!(
            api.url("/appliances"),
            "https://ctrl.example.com:8443/admin/appliances"
        );
    }

    #[tokio::test]
    async fn get_sends_bearer_and_versioned_accept() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/admin/appliances")
                    .header("accept", "application/vnd.appgate.peer-v19+json")
                    .header("authorization", "Bearer tok");
                then.status(200).json_body(json!({"data": []}));
            })
            .await;

        let api = api(&server, 19).with_bearer("tok");
        let list: ::common::api::ListResponse<::common::api::Appliance> =
            api.get("/appliances").await.expect("get");
        assert!(list.data.is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn download_uses_gpg_media_type() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/admin/appliances/a/backup/b")
                    .header("accept", "application/vnd.appgate.peer-v18+gpg")
                    .header("authorization", "Bearer tok");
                then.status(200).body("blob");
            })
            .await;

        let api = api(&server, 18).with_bearer("tok");
        let res = api.download("/appliances/a/backup/b").await.expect("download");
        assert_eq!(res.bytes().await.expect("body").as_ref(), b"blob");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_success_is_classified() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(DELETE).path("/admin/appliances/a/backup/b");
                then.status(403)
                    .header("x-request-id", "req-1")
                    .json_body(json!({"id": "forbidden", "message": "Not allowed."}));
            })
            .await;

        let api = api(&server, 19).with_bearer("tok");
        let err = api
            .delete("/appliances/a/backup/b")
            .await
            .expect_err("forbidden");
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert_eq!(err.request_id(), Some("req-1"));
        assert!(err.to_string().contains("Not allowed."));
    }

    #[tokio::test]
    async fn connection_refused_is_transport_kind() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let client = build_client(&TransportConfig::new(format!("http://{addr}"))).expect("client");
        let api = ApiClient::new(client, format!("http://{addr}/admin"), 19);
        let err = api
            .get::<serde_json::Value>("/appliances")
            .await
            .expect_err("refused");
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.is_transient());
    }
}
