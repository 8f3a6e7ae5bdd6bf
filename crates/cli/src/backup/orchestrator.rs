use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::api::BackupApi;
use super::file::{backup_file_name, stream_to_file};
use super::{BackupError, BackupJob, BackupOptions, JobError, Outcome};
use crate::change::{self, WaitError, WaitOptions};
use crate::error::{Classify, MultiError};
use crate::inventory::Member;
use crate::progress::{JobState, SharedReporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Interrupted,
    Deadline,
    Fatal,
}

/// A backup the server created and that must be deleted again.
#[derive(Debug, Clone)]
struct Initiated {
    appliance_id: Uuid,
    appliance_name: String,
    backup_id: Uuid,
}

struct Shared {
    api: BackupApi,
    opts: BackupOptions,
    reporter: SharedReporter,
    permits: Semaphore,
    initiated: Mutex<Vec<Initiated>>,
    stop: watch::Sender<bool>,
    reason: OnceLock<StopReason>,
}

impl Shared {
    fn stop(&self, reason: StopReason) {
        if self.reason.set(reason).is_ok() {
            debug!(?reason, "stopping backup run");
        }
        self.stop.send_replace(true);
    }

    /// How a pipeline interrupted by the run-wide signal reports itself.
    fn interrupted(&self) -> JobError {
        match self.reason.get() {
            Some(StopReason::Deadline) => JobError::Timeout,
            Some(StopReason::Fatal) => JobError::Aborted,
            Some(StopReason::Interrupted) | None => JobError::Cancelled,
        }
    }

    fn remember(&self, entry: Initiated) {
        match self.initiated.lock() {
            Ok(mut queue) => queue.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }

    fn take_initiated(&self) -> Vec<Initiated> {
        match self.initiated.lock() {
            Ok(mut queue) => std::mem::take(&mut *queue),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

/// Backs up every target and returns once all pipelines and the cleanup phase are done.
///
/// At most `opts.concurrency` pipelines run at a time. Setting `cancel` to `true` stops every
/// pipeline at its next suspension point; every backup the server created is still deleted.
pub async fn run(
    api: BackupApi,
    targets: Vec<Member>,
    opts: BackupOptions,
    reporter: SharedReporter,
    mut cancel: watch::Receiver<bool>,
) -> Outcome {
    let (stop_tx, stop_rx) = watch::channel(false);
    let count = u32::try_from(targets.len()).unwrap_or(u32::MAX).max(1);
    let overall = opts
        .per_appliance_timeout
        .checked_mul(count)
        .unwrap_or(Duration::from_secs(u64::from(u32::MAX)));
    let concurrency = opts.concurrency.max(1);
    let shared = Arc::new(Shared {
        api,
        opts,
        reporter,
        permits: Semaphore::new(concurrency),
        initiated: Mutex::new(Vec::new()),
        stop: stop_tx,
        reason: OnceLock::new(),
    });

    if *cancel.borrow() {
        shared.stop(StopReason::Interrupted);
    }
    let watchdog = {
        let shared = Arc::clone(&shared);
        let deadline = Instant::now() + overall;
        tokio::spawn(async move {
            tokio::select! {
                _ = change::cancelled(&mut cancel) => shared.stop(StopReason::Interrupted),
                _ = sleep_until(deadline) => shared.stop(StopReason::Deadline),
            }
        })
    };

    let mut jobs: Vec<BackupJob> = Vec::with_capacity(targets.len());
    let mut results: Vec<Option<Result<(), JobError>>> = Vec::with_capacity(targets.len());
    let mut tasks = JoinSet::new();
    for (index, member) in targets.iter().enumerate() {
        let job = BackupJob::new(member.id(), member.name());
        shared.reporter.update(member.name(), JobState::Queued);
        let shared = Arc::clone(&shared);
        let stop = stop_rx.clone();
        let mut task_job = job.clone();
        tasks.spawn(async move {
            let result = pipeline(&shared, &mut task_job, stop).await;
            match &result {
                Ok(()) => {}
                Err(err) => {
                    task_job.fail(err);
                    shared
                        .reporter
                        .update(&task_job.appliance_name, JobState::Failed(err.to_string()));
                    if err.kind().is_fatal_for_run() {
                        warn!(appliance = %task_job.appliance_name, error = %err, "aborting backup run");
                        shared.stop(StopReason::Fatal);
                    }
                }
            }
            (index, task_job, result)
        });
        jobs.push(job);
        results.push(None);
    }

    let mut failures = MultiError::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, job, result)) => {
                jobs[index] = job;
                results[index] = Some(result);
            }
            Err(err) => failures.push(anyhow::anyhow!("backup task failed: {err}")),
        }
    }
    watchdog.abort();
    shared.reporter.finish();

    let cleanup_failures = cleanup(&shared.api, shared.take_initiated(), shared.opts.cleanup_timeout).await;

    for (job, result) in jobs.iter().zip(results) {
        if let Some(Err(cause)) = result {
            failures.push(BackupError::Appliance {
                appliance: job.appliance_name.clone(),
                cause,
            });
        }
    }
    Outcome {
        jobs,
        failures,
        cleanup_failures,
    }
}

/// initiate → poll → download for one appliance.
async fn pipeline(
    shared: &Shared,
    job: &mut BackupJob,
    mut stop: watch::Receiver<bool>,
) -> Result<(), JobError> {
    let _permit = tokio::select! {
        permit = shared.permits.acquire() => permit.map_err(|_| shared.interrupted())?,
        _ = change::cancelled(&mut stop) => return Err(shared.interrupted()),
    };
    if *stop.borrow() {
        return Err(shared.interrupted());
    }
    let name = job.appliance_name.clone();
    let appliance = job.appliance_id;
    let deadline = Instant::now() + shared.opts.per_appliance_timeout;
    job.started_at = Some(Utc::now());
    shared.reporter.update(&name, JobState::Initiating);

    let backup_id = initiate(shared, appliance, &name, deadline, &mut stop).await?;
    job.record_backup_id(backup_id);
    info!(appliance = %name, %backup_id, "backup initiated");

    let wait = WaitOptions {
        backoff: shared.opts.backoff,
        deadline: Some(deadline),
        ..WaitOptions::default()
    };
    let what = format!("backup {backup_id} on {name}");
    let api = &shared.api;
    change::wait_until_terminal(
        &what,
        || api.status(appliance, backup_id),
        &wait,
        &mut stop,
        |polls| shared.reporter.update(&name, JobState::Polling(polls)),
    )
    .await
    .map_err(|err| match err {
        WaitError::Cancelled(_) => shared.interrupted(),
        WaitError::DeadlineExceeded(_) => JobError::Timeout,
        other => JobError::Wait(other),
    })?;

    shared.reporter.update(&name, JobState::Downloading(0));
    let res = tokio::select! {
        res = api.download(appliance, backup_id) => res.map_err(JobError::Download)?,
        _ = change::cancelled(&mut stop) => return Err(shared.interrupted()),
        _ = sleep_until(deadline) => return Err(JobError::Timeout),
    };
    let dest: PathBuf = shared
        .opts
        .destination
        .join(backup_file_name(&name, Utc::now()));
    let bytes = stream_to_file(res, &dest, deadline, &mut stop, |written| {
        shared.reporter.update(&name, JobState::Downloading(written))
    })
    .await
    .map_err(|err| match err {
        JobError::Cancelled => shared.interrupted(),
        other => other,
    })?;

    info!(appliance = %name, path = %dest.display(), bytes, "backup downloaded");
    shared.reporter.update(&name, JobState::Done(dest.clone()));
    job.succeed(dest, bytes);
    Ok(())
}

/// `POST …/backup`, retried on transient failures. Every id the server hands back is
/// queued for cleanup before this returns.
async fn initiate(
    shared: &Shared,
    appliance: Uuid,
    name: &str,
    deadline: Instant,
    stop: &mut watch::Receiver<bool>,
) -> Result<Uuid, JobError> {
    let attempts = shared.opts.initiate_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        let request = shared.api.initiate(appliance, shared.opts.request());
        tokio::pin!(request);
        let halted = tokio::select! {
            res = &mut request => Ok(res),
            _ = change::cancelled(stop) => Err(shared.interrupted()),
            _ = sleep_until(deadline) => Err(JobError::Timeout),
        };
        let result = match halted {
            Ok(res) => res,
            Err(reason) => {
                // The request is already on the wire and may have created a backup.
                match tokio::time::timeout(shared.opts.cleanup_timeout, request).await {
                    Ok(Ok(backup_id)) => {
                        debug!(%appliance, %backup_id, "backup created while stopping");
                        remember(shared, appliance, name, backup_id);
                    }
                    Ok(Err(err)) => debug!(%appliance, error = %err, "initiate failed while stopping"),
                    Err(_) => warn!(%appliance, "initiate still pending after stop; a backup may be left behind"),
                }
                return Err(reason);
            }
        };
        attempt += 1;
        match result {
            Ok(id) => {
                remember(shared, appliance, name, id);
                return Ok(id);
            }
            Err(err) if err.is_transient() && attempt < attempts => {
                debug!(%appliance, attempt, error = %err, "retrying backup initiation");
            }
            Err(err) => return Err(JobError::Initiate(err)),
        }
        tokio::select! {
            _ = sleep(shared.opts.backoff.delay(attempt - 1)) => {}
            _ = change::cancelled(stop) => return Err(shared.interrupted()),
            _ = sleep_until(deadline) => return Err(JobError::Timeout),
        }
    }
}

fn remember(shared: &Shared, appliance: Uuid, name: &str, backup_id: Uuid) {
    shared.remember(Initiated {
        appliance_id: appliance,
        appliance_name: name.to_string(),
        backup_id,
    });
}

/// Deletes every initiated backup, each under its own short timeout. Runs after
/// cancellation too, so it listens to no stop signal.
async fn cleanup(api: &BackupApi, initiated: Vec<Initiated>, timeout: Duration) -> Vec<(String, Uuid)> {
    let mut deletes = JoinSet::new();
    for entry in initiated {
        let api = api.clone();
        deletes.spawn(async move {
            let failure = match tokio::time::timeout(
                timeout,
                api.delete(entry.appliance_id, entry.backup_id),
            )
            .await
            {
                Ok(Ok(())) => {
                    debug!(appliance = %entry.appliance_name, backup_id = %entry.backup_id, "removed backup from appliance");
                    return None;
                }
                Ok(Err(err)) => err.to_string(),
                Err(_) => format!("no response within {}s", timeout.as_secs_f32()),
            };
            warn!(
                appliance = %entry.appliance_name,
                backup_id = %entry.backup_id,
                error = %failure,
                "failed to remove backup from appliance"
            );
            Some((entry.appliance_name, entry.backup_id))
        });
    }
    let mut failed = Vec::new();
    while let Some(joined) = deletes.join_next().await {
        if let Ok(Some(entry)) = joined {
            failed.push(entry);
        }
    }
    failed
}
