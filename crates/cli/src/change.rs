//! Polling of long-running server jobs until they reach a terminal state.

use std::future::Future;
use std::time::Duration;

use ::common::api::{BackupStatus, ChangeStatus};
use rand::Rng;
use tokio::sync::watch;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::debug;

use crate::error::{ApiError, Classify, ErrorKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Succeeded,
    Failed(String),
}

/// A status document that can say whether its job is finished.
pub trait Terminal {
    fn phase(&self) -> Result<Phase, WaitError>;
}

impl Terminal for BackupStatus {
    fn phase(&self) -> Result<Phase, WaitError> {
        let details = || {
            self.details
                .clone()
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| "backup failed".to_string())
        };
        match (self.status.as_str(), self.result.as_deref()) {
            ("processing", _) => Ok(Phase::Pending),
            ("done", None | Some("success")) => Ok(Phase::Succeeded),
            ("done", Some(_)) | ("failure" | "failed", _) => Ok(Phase::Failed(details())),
            (other, _) => Ok(Phase::Failed(format!("unexpected backup status '{other}'"))),
        }
    }
}

impl Terminal for ChangeStatus {
    fn phase(&self) -> Result<Phase, WaitError> {
        match (self.status.as_str(), self.result.as_deref()) {
            ("running", _) => Ok(Phase::Pending),
            ("completed", Some("success")) => Ok(Phase::Succeeded),
            ("completed", Some(result)) => Ok(Phase::Failed(
                self.details
                    .clone()
                    .filter(|d| !d.is_empty())
                    .unwrap_or_else(|| format!("change finished with result '{result}'")),
            )),
            ("completed", None) => Err(WaitError::Invariant(
                "change completed without a result".into(),
            )),
            (other, _) => Ok(Phase::Failed(format!("unexpected change status '{other}'"))),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("{0}")]
    Failed(String),
    #[error("timed out waiting for {0}")]
    DeadlineExceeded(String),
    #[error("cancelled while waiting for {0}")]
    Cancelled(String),
    #[error("{0}")]
    Api(#[from] ApiError),
    #[error("invalid terminal state: {0}")]
    Invariant(String),
}

impl Classify for WaitError {
    fn kind(&self) -> ErrorKind {
        match self {
            WaitError::Failed(_) => ErrorKind::Server,
            WaitError::DeadlineExceeded(_) => ErrorKind::Timeout,
            WaitError::Cancelled(_) => ErrorKind::Cancelled,
            WaitError::Api(err) => err.kind(),
            WaitError::Invariant(_) => ErrorKind::Unknown,
        }
    }
}

/// Exponential backoff with proportional jitter and a cap.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self
            .initial
            .checked_mul(2u32.saturating_pow(attempt.min(16)))
            .unwrap_or(self.max)
            .min(self.max);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64((1.0 + spread).max(0.0)).min(self.max)
    }
}

#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub backoff: Backoff,
    pub deadline: Option<Instant>,
    /// Transient failures tolerated in a row.
    pub max_transient: u32,
    /// `404` responses tolerated in a row; the job may not be visible yet.
    pub max_not_found: u32,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            deadline: None,
            max_transient: 5,
            max_not_found: 3,
        }
    }
}

/// Resolves once `rx` flips to `true`; never resolves if the sender is gone.
pub async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// Polls `fetch` until the body reports a terminal phase.
///
/// `on_poll` is told the attempt number before every fetch. Cancellation and the
/// deadline are observed during the fetch and during every sleep.
pub async fn wait_until_terminal<T, F, Fut>(
    what: &str,
    mut fetch: F,
    opts: &WaitOptions,
    cancel: &mut watch::Receiver<bool>,
    mut on_poll: impl FnMut(u32),
) -> Result<T, WaitError>
where
    T: Terminal,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0u32;
    let mut transient = 0u32;
    let mut not_found = 0u32;

    loop {
        if *cancel.borrow() {
            return Err(WaitError::Cancelled(what.to_string()));
        }
        attempt += 1;
        on_poll(attempt);

        let result = tokio::select! {
            res = fetch() => res,
            _ = cancelled(cancel) => return Err(WaitError::Cancelled(what.to_string())),
            _ = until(opts.deadline) => return Err(WaitError::DeadlineExceeded(what.to_string())),
        };

        match result {
            Ok(body) => match body.phase()? {
                Phase::Succeeded => return Ok(body),
                Phase::Failed(details) => return Err(WaitError::Failed(details)),
                Phase::Pending => {
                    transient = 0;
                    not_found = 0;
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound && not_found < opts.max_not_found => {
                not_found += 1;
                debug!(what, attempt, "status not found yet, retrying");
            }
            Err(err) if err.is_transient() && transient < opts.max_transient => {
                transient += 1;
                debug!(what, attempt, error = %err, "transient status failure, retrying");
            }
            Err(err) => return Err(WaitError::Api(err)),
        }

        let delay = opts.backoff.delay(attempt - 1);
        tokio::select! {
            _ = sleep(delay) => {}
            _ = cancelled(cancel) => return Err(WaitError::Cancelled(what.to_string())),
            _ = until(opts.deadline) => return Err(WaitError::DeadlineExceeded(what.to_string())),
        }
    }
}
