//! Fleet backup: initiate, poll, download and clean up, one pipeline per appliance.

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use ::common::api::BackupRequest;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::change::{Backoff, WaitError};
use crate::error::{ApiError, CANCELLED_MESSAGE, Classify, ErrorKind, MultiError};
use crate::inventory::InventoryError;
use crate::prompt::PromptError;

pub mod api;
pub mod file;
mod orchestrator;
pub mod plan;
pub mod settings;

pub use api::BackupApi;
pub use orchestrator::run;

pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);
pub const INITIATE_ATTEMPTS: u32 = 3;
/// First API version whose initiate body accepts `notifyUrl`.
pub const NOTIFY_MIN_API_VERSION: u32 = 16;

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error(
        "Backup API is disabled in the collective. Use the 'sdpctl appliance backup api' command to enable it."
    )]
    ApiDisabled,
    #[error("This should not be executed on an appliance")]
    OnAppliance,
    #[error("cannot use backup destination {}: {cause}", path.display())]
    Destination {
        path: PathBuf,
        #[source]
        cause: io::Error,
    },
    #[error("unknown include '{0}', expected audit or logs")]
    InvalidInclude(String),
    #[error("{0}")]
    Passphrase(String),
    #[error(
        "no appliances selected; use --all, --primary, --current, --include or appliance IDs"
    )]
    NoSelection,
    #[error("{appliance}: {cause}")]
    Appliance {
        appliance: String,
        #[source]
        cause: JobError,
    },
    #[error("{0}")]
    Api(#[from] ApiError),
    #[error("{0}")]
    Prompt(#[from] PromptError),
    #[error("{0}")]
    Inventory(#[from] InventoryError),
    #[error("could not write to the terminal: {0}")]
    Output(#[source] io::Error),
}

impl Classify for BackupError {
    fn kind(&self) -> ErrorKind {
        match self {
            BackupError::ApiDisabled
            | BackupError::OnAppliance
            | BackupError::InvalidInclude(_)
            | BackupError::Passphrase(_)
            | BackupError::NoSelection => ErrorKind::Validation,
            BackupError::Destination { .. } | BackupError::Output(_) => ErrorKind::Unknown,
            BackupError::Appliance { cause, .. } => cause.kind(),
            BackupError::Api(err) => err.kind(),
            BackupError::Prompt(err) => err.kind(),
            BackupError::Inventory(err) => err.kind(),
        }
    }
}

/// Why a single appliance pipeline failed.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("initiating backup failed: {0}")]
    Initiate(#[source] ApiError),
    #[error("{0}")]
    Wait(#[source] WaitError),
    #[error("download failed: {0}")]
    Download(#[source] ApiError),
    #[error("writing {} failed: {cause}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        cause: io::Error,
    },
    #[error("refusing to overwrite existing file {}", .0.display())]
    FileExists(PathBuf),
    #[error("backup did not finish before the deadline")]
    Timeout,
    #[error("{}", CANCELLED_MESSAGE)]
    Cancelled,
    #[error("aborted after a fatal error on another appliance")]
    Aborted,
}

impl Classify for JobError {
    fn kind(&self) -> ErrorKind {
        match self {
            JobError::Initiate(err) | JobError::Download(err) => err.kind(),
            JobError::Wait(err) => err.kind(),
            JobError::Write { .. } | JobError::Aborted => ErrorKind::Unknown,
            JobError::FileExists(_) => ErrorKind::Conflict,
            JobError::Timeout => ErrorKind::Timeout,
            JobError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Extra data to include in each backup (`--with audit,logs`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Include {
    pub audit: bool,
    pub logs: bool,
}

impl Include {
    pub fn parse<S: AsRef<str>>(values: &[S]) -> Result<Self, BackupError> {
        let mut include = Include::default();
        for raw in values.iter().flat_map(|v| v.as_ref().split(',')) {
            match raw.trim().to_ascii_lowercase().as_str() {
                "" => {}
                "audit" => include.audit = true,
                "logs" => include.logs = true,
                other => return Err(BackupError::InvalidInclude(other.to_string())),
            }
        }
        Ok(include)
    }
}

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub destination: PathBuf,
    pub include: Include,
    /// Sent with every initiate call; the caller only sets it for API version 16 and later.
    pub notify_url: Option<String>,
    pub per_appliance_timeout: Duration,
    pub concurrency: usize,
    pub backoff: Backoff,
    pub initiate_attempts: u32,
    pub cleanup_timeout: Duration,
}

impl BackupOptions {
    pub fn new(destination: PathBuf) -> Self {
        Self {
            destination,
            include: Include::default(),
            notify_url: None,
            per_appliance_timeout: DEFAULT_TIMEOUT,
            concurrency: DEFAULT_CONCURRENCY,
            backoff: Backoff::default(),
            initiate_attempts: INITIATE_ATTEMPTS,
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
        }
    }

    pub fn request(&self) -> BackupRequest {
        BackupRequest {
            audit: self.include.audit,
            logs: self.include.logs,
            notify_url: self.notify_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobPhase {
    Pending,
    Processing,
    Done,
    Failed,
}

/// One appliance's backup as tracked by the orchestrator.
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub appliance_id: Uuid,
    pub appliance_name: String,
    pub backup_id: Option<Uuid>,
    pub phase: JobPhase,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub local_path: Option<PathBuf>,
    pub bytes_written: u64,
    pub last_error: Option<String>,
}

impl BackupJob {
    pub fn new(appliance_id: Uuid, appliance_name: impl Into<String>) -> Self {
        Self {
            appliance_id,
            appliance_name: appliance_name.into(),
            backup_id: None,
            phase: JobPhase::Pending,
            started_at: None,
            completed_at: None,
            local_path: None,
            bytes_written: 0,
            last_error: None,
        }
    }

    /// Moves forward only; a stale or backwards transition is ignored.
    fn advance(&mut self, phase: JobPhase) {
        if phase > self.phase && self.phase < JobPhase::Done {
            self.phase = phase;
        }
    }

    fn record_backup_id(&mut self, id: Uuid) {
        if self.backup_id.is_none() {
            self.backup_id = Some(id);
        }
        self.advance(JobPhase::Processing);
    }

    fn succeed(&mut self, path: PathBuf, bytes: u64) {
        self.advance(JobPhase::Done);
        if self.phase == JobPhase::Done {
            self.local_path = Some(path);
            self.bytes_written = bytes;
            self.completed_at = Some(Utc::now());
        }
    }

    fn fail(&mut self, err: &JobError) {
        self.advance(JobPhase::Failed);
        self.last_error = Some(err.to_string());
        self.completed_at = Some(Utc::now());
    }
}

/// Result of a whole run, after cleanup.
#[derive(Debug)]
pub struct Outcome {
    pub jobs: Vec<BackupJob>,
    pub failures: MultiError,
    /// Backups whose server-side object could not be removed.
    pub cleanup_failures: Vec<(String, Uuid)>,
}

impl Outcome {
    pub fn succeeded(&self) -> impl Iterator<Item = &BackupJob> {
        self.jobs.iter().filter(|j| j.phase == JobPhase::Done)
    }

    /// One line per written file.
    pub fn report(&self, out: &mut impl Write) -> io::Result<()> {
        for job in self.succeeded() {
            if let Some(path) = job.local_path.as_ref() {
                writeln!(
                    out,
                    "{}: wrote backup to {}",
                    job.appliance_name,
                    path.display()
                )?;
            }
        }
        Ok(())
    }

    pub fn into_result(self) -> Result<Vec<BackupJob>, MultiError> {
        self.failures.into_result()?;
        Ok(self.jobs)
    }
}
