//! Error classification shared by every component that talks to the collective.

use std::error::Error as StdError;
use std::fmt;

use ::common::api::ErrorBody;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;

pub const PRIVILEGES_HINT: &str = "Run 'sdpctl privileges' to see your current user privileges";
pub const PEM_HINT: &str =
    "Trust the certificate or import a PEM file using 'sdpctl configure --pem=<path/to/pem>'";
pub const TIMEOUT_MESSAGE: &str = "Command timed out";
pub const CANCELLED_MESSAGE: &str = "Cancelled by user";

/// The operator interrupted the command.
#[derive(Debug, thiserror::Error)]
#[error("{}", CANCELLED_MESSAGE)]
pub struct Interrupted;

impl Classify for Interrupted {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Cancelled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Tls,
    Auth,
    Forbidden,
    Validation,
    Server,
    NotFound,
    Timeout,
    Cancelled,
    Conflict,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Tls => "tls",
            ErrorKind::Auth => "auth",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Validation => "validation",
            ErrorKind::Server => "server",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Kinds that abort every in-flight appliance pipeline.
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(self, ErrorKind::Auth | ErrorKind::Tls)
    }

    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::UNAUTHORIZED => ErrorKind::Auth,
            StatusCode::FORBIDDEN => ErrorKind::Forbidden,
            StatusCode::NOT_FOUND => ErrorKind::NotFound,
            StatusCode::CONFLICT => ErrorKind::Conflict,
            StatusCode::REQUEST_TIMEOUT => ErrorKind::Timeout,
            s if s.is_server_error() => ErrorKind::Server,
            s if s.is_client_error() => ErrorKind::Validation,
            _ => ErrorKind::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything that can report an [`ErrorKind`].
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

/// A failed call against the admin API.
#[derive(Debug)]
pub struct ApiError {
    kind: ErrorKind,
    status: Option<StatusCode>,
    message: String,
    details: Vec<String>,
    request_id: Option<String>,
    url: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
            details: Vec::new(),
            request_id: None,
            url: None,
            source: None,
        }
    }

    /// Builds an error from a non-2xx response body.
    pub fn from_response(status: StatusCode, headers: &HeaderMap, body: &str, url: &str) -> Self {
        let request_id = headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let parsed = serde_json::from_str::<ErrorBody>(body).ok();
        let (message, details) = match parsed {
            Some(body) if !body.message.is_empty() || !body.errors.is_empty() => {
                let details = body
                    .errors
                    .iter()
                    .map(|e| {
                        if e.field.is_empty() {
                            e.message.clone()
                        } else {
                            format!("{}: {}", e.field, e.message)
                        }
                    })
                    .collect();
                let message = if body.message.is_empty() {
                    format!("request failed with status {}", status)
                } else {
                    body.message
                };
                (message, details)
            }
            _ => {
                let trimmed = body.trim();
                let message = if trimmed.is_empty() || trimmed.starts_with('<') {
                    format!("request failed with status {}", status)
                } else {
                    format!("{} (status {})", trimmed, status)
                };
                (message, Vec::new())
            }
        };

        Self {
            kind: ErrorKind::from_status(status),
            status: Some(status),
            message,
            details,
            request_id,
            url: Some(url.to_string()),
            source: None,
        }
    }

    /// Classifies a transport-level failure from reqwest.
    pub fn from_reqwest(err: reqwest::Error, url: &str) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if is_tls_failure(&err) {
            ErrorKind::Tls
        } else if let Some(status) = err.status() {
            ErrorKind::from_status(status)
        } else if err.is_decode() {
            ErrorKind::Unknown
        } else {
            ErrorKind::Transport
        };
        let message = match kind {
            ErrorKind::Tls => format!("TLS verification failed for {}", url),
            ErrorKind::Timeout => format!("request to {} timed out", url),
            ErrorKind::Unknown => format!("unexpected response from {}", url),
            _ => format!("request to {} failed", url),
        };
        Self {
            kind,
            status: err.status(),
            message,
            details: Vec::new(),
            request_id: None,
            url: Some(url.to_string()),
            source: Some(Box::new(err)),
        }
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Flattened field errors from the server body.
    pub fn details(&self) -> &[String] {
        &self.details
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Connection failures and 5xx responses are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Transport | ErrorKind::Timeout | ErrorKind::Server
        )
    }

    fn render(&self) -> String {
        let mut out = self.message.clone();
        if let Some(source) = &self.source
            && matches!(self.kind, ErrorKind::Tls | ErrorKind::Transport)
        {
            out.push_str(&format!(": {}", root_cause(source.as_ref())));
        }
        if let Some(id) = &self.request_id {
            out.push_str(&format!(" [request_id={id}]"));
        }
        out
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl StdError for ApiError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

impl Classify for ApiError {
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

fn root_cause(err: &(dyn StdError + 'static)) -> String {
    let mut current = err;
    while let Some(next) = current.source() {
        current = next;
    }
    current.to_string()
}

/// True when a rustls error sits anywhere in the chain. rustls errors usually arrive wrapped
/// in an `io::Error`, whose `source()` skips the wrapped value, so those are unpacked here.
fn is_tls_failure(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<rustls::Error>() {
            return true;
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>()
            && let Some(inner) = io.get_ref()
            && is_tls_failure(inner)
        {
            return true;
        }
        current = e.source();
    }
    false
}

/// Append-only aggregate of independent failures.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<anyhow::Error>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: impl Into<anyhow::Error>) {
        self.errors.push(err.into());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[anyhow::Error] {
        &self.errors
    }

    /// `Ok(())` when nothing was collected.
    pub fn into_result(self) -> Result<(), MultiError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.len() {
            0 => f.write_str("no errors"),
            1 => f.write_str(&describe(&self.errors[0])),
            n => {
                write!(f, "{} errors occurred:", n)?;
                for err in &self.errors {
                    write!(f, "\n\t* {}", describe(err))?;
                }
                Ok(())
            }
        }
    }
}

impl StdError for MultiError {}

impl Classify for MultiError {
    /// The most severe kind wins so exit codes reflect cancellation and auth first.
    fn kind(&self) -> ErrorKind {
        let kinds: Vec<ErrorKind> = self.errors.iter().map(kind_of).collect();
        for preferred in [
            ErrorKind::Cancelled,
            ErrorKind::Auth,
            ErrorKind::Timeout,
            ErrorKind::Tls,
        ] {
            if kinds.contains(&preferred) {
                return preferred;
            }
        }
        kinds.first().copied().unwrap_or(ErrorKind::Unknown)
    }
}

/// Walks an error chain and returns the first classified kind.
pub fn kind_of(err: &anyhow::Error) -> ErrorKind {
    for cause in err.chain() {
        if cause.is::<Interrupted>() {
            return ErrorKind::Cancelled;
        }
        if let Some(e) = cause.downcast_ref::<MultiError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<ApiError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<crate::auth::AuthError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<crate::backup::BackupError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<crate::change::WaitError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<crate::secrets::SecretError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<crate::prompt::PromptError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<crate::inventory::InventoryError>() {
            return e.kind();
        }
    }
    ErrorKind::Unknown
}

/// Joins the error chain with `: `, skipping causes whose text the previous entry already
/// ends with. Stops after the first [`ApiError`], which renders its own root cause.
pub fn describe(err: &anyhow::Error) -> String {
    let mut out = String::new();
    let mut previous = String::new();
    for cause in err.chain() {
        let text = cause.to_string();
        if previous.is_empty() || !previous.ends_with(&text) {
            if !out.is_empty() {
                out.push_str(": ");
            }
            out.push_str(&text);
        }
        if cause.is::<ApiError>() {
            break;
        }
        previous = text;
    }
    out
}

/// Renders an error for the terminal: one bullet per flattened entry plus hints.
pub fn render_error(err: &anyhow::Error) -> String {
    let mut entries: Vec<String> = Vec::new();
    collect_entries(err, &mut entries);

    let kinds = collect_kinds(err);
    if kinds.contains(&ErrorKind::Forbidden) {
        entries.push(PRIVILEGES_HINT.to_string());
    }
    if kinds.contains(&ErrorKind::Tls) {
        entries.push(PEM_HINT.to_string());
    }
    if kinds.contains(&ErrorKind::Timeout) {
        entries.push(TIMEOUT_MESSAGE.to_string());
    }
    entries.dedup();

    match entries.len() {
        0 => describe(err),
        1 => entries.remove(0),
        n => {
            let mut out = format!("{} errors occurred:", n);
            for entry in entries {
                out.push_str("\n\t* ");
                out.push_str(&entry);
            }
            out
        }
    }
}

fn collect_entries(err: &anyhow::Error, entries: &mut Vec<String>) {
    if let Some(multi) = err.downcast_ref::<MultiError>() {
        for inner in multi.errors() {
            collect_entries(inner, entries);
        }
        return;
    }
    if let Some(api) = err.chain().find_map(|c| c.downcast_ref::<ApiError>()) {
        entries.push(describe(err));
        entries.extend(api.details().iter().cloned());
        if api.kind() == ErrorKind::Forbidden
            && let Some(url) = api.url()
        {
            entries.push(url.to_string());
        }
        return;
    }
    entries.push(describe(err));
}

fn collect_kinds(err: &anyhow::Error) -> Vec<ErrorKind> {
    if let Some(multi) = err.downcast_ref::<MultiError>() {
        return multi.errors().iter().flat_map(collect_kinds).collect();
    }
    vec![kind_of(err)]
}
