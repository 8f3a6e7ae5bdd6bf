//! Local side of a backup: destination directory, file naming and the atomic write.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use super::{BackupError, JobError};
use crate::change;
use crate::error::ApiError;
use crate::transport::VENDOR;

/// Present only on appliances.
const APPLIANCE_MARKER: &str = "/mnt/state/config";

pub fn is_on_appliance() -> bool {
    Path::new(APPLIANCE_MARKER).exists()
}

/// `$HOME/Downloads/appgate/backup`.
pub fn default_destination() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(|home| PathBuf::from(home).join("Downloads").join(VENDOR).join("backup"))
}

/// `<vendor>_backup_<name>_<YYYYMMDD>_<HHMMSS>.bkp`; path separators in the name are replaced.
pub fn backup_file_name(appliance_name: &str, at: DateTime<Utc>) -> String {
    let name: String = appliance_name
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect();
    format!("{VENDOR}_backup_{name}_{}.bkp", at.format("%Y%m%d_%H%M%S"))
}

/// Creates the directory with user-only permissions and checks that it accepts files.
pub fn prepare_destination(dir: &Path) -> Result<PathBuf, BackupError> {
    let fail = |cause: io::Error| BackupError::Destination {
        path: dir.to_path_buf(),
        cause,
    };
    if is_on_appliance() {
        return Err(BackupError::OnAppliance);
    }
    std::fs::create_dir_all(dir).map_err(fail)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let meta = std::fs::metadata(dir).map_err(fail)?;
        let mode = meta.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).map_err(fail)?;
        }
    }
    // Probe writability; the probe file is removed on drop.
    NamedTempFile::new_in(dir).map_err(fail)?;
    std::fs::canonicalize(dir).map_err(fail)
}

/// Streams `res` into `dest`. The body lands in a temporary file next to `dest` that is
/// synced and then renamed without clobbering; on any failure the partial file is removed.
pub async fn stream_to_file(
    mut res: reqwest::Response,
    dest: &Path,
    deadline: Instant,
    cancel: &mut watch::Receiver<bool>,
    mut on_progress: impl FnMut(u64),
) -> Result<u64, JobError> {
    let write_err = |cause: io::Error| JobError::Write {
        path: dest.to_path_buf(),
        cause,
    };
    if dest.exists() {
        return Err(JobError::FileExists(dest.to_path_buf()));
    }
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let tmp = tempfile::Builder::new()
        .prefix(".sdpctl-partial-")
        .tempfile_in(dir)
        .map_err(write_err)?;
    let mut file = tokio::fs::File::from_std(tmp.reopen().map_err(write_err)?);

    let url = res.url().to_string();
    let mut written = 0u64;
    loop {
        if *cancel.borrow() {
            return Err(JobError::Cancelled);
        }
        let chunk = tokio::select! {
            chunk = res.chunk() => chunk
                .map_err(|err| JobError::Download(ApiError::from_reqwest(err, &url)))?,
            _ = change::cancelled(cancel) => return Err(JobError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(JobError::Timeout),
        };
        let Some(chunk) = chunk else { break };
        file.write_all(&chunk).await.map_err(write_err)?;
        written += chunk.len() as u64;
        on_progress(written);
    }
    file.flush().await.map_err(write_err)?;
    file.sync_all().await.map_err(write_err)?;
    drop(file);

    tmp.persist_noclobber(dest).map_err(|err| {
        if err.error.kind() == io::ErrorKind::AlreadyExists {
            JobError::FileExists(dest.to_path_buf())
        } else {
            write_err(err.error)
        }
    })?;
    debug!(path = %dest.display(), bytes = written, "backup written");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use httpmock::prelude::*;
    use std::time::Duration;

    #[test]
    fn file_name_uses_utc_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).single().expect("time");
        assert_eq!(
            backup_file_name("controller-one", at),
            "appgate_backup_controller-one_20240309_070501.bkp"
        );
        assert_eq!(
            backup_file_name("a/b", at),
            "appgate_backup_a_b_20240309_070501.bkp"
        );
    }

    #[cfg(unix)]
    #[test]
    fn destination_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let root = tempfile::tempdir().expect("tempdir");
        let dir = root.path().join("nested").join("backup");
        let resolved = prepare_destination(&dir).expect("prepared");
        let mode = std::fs::metadata(&resolved).expect("meta").permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }

    async fn body(server: &MockServer, payload: &'static str) -> reqwest::Response {
        server
            .mock_async(|when, then| {
                when.method(GET).path("/blob");
                then.status(200).body(payload);
            })
            .await;
        reqwest::get(server.url("/blob")).await.expect("response")
    }

    #[tokio::test]
    async fn writes_body_atomically_with_private_mode() {
        let server = MockServer::start_async().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("appgate_backup_x.bkp");
        let (_tx, mut rx) = watch::channel(false);
        let mut seen = 0;
        let written = stream_to_file(
            body(&server, "encrypted-bytes").await,
            &dest,
            Instant::now() + Duration::from_secs(5),
            &mut rx,
            |n| seen = n,
        )
        .await
        .expect("written");
        assert_eq!(written, 15);
        assert_eq!(seen, 15);
        assert_eq!(std::fs::read_to_string(&dest).expect("read"), "encrypted-bytes");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dest).expect("meta").permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".sdpctl-partial-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn existing_file_is_not_overwritten() {
        let server = MockServer::start_async().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("taken.bkp");
        std::fs::write(&dest, "old").expect("seed");
        let (_tx, mut rx) = watch::channel(false);
        let err = stream_to_file(
            body(&server, "new").await,
            &dest,
            Instant::now() + Duration::from_secs(5),
            &mut rx,
            |_| {},
        )
        .await
        .expect_err("refused");
        assert!(matches!(err, JobError::FileExists(_)));
        assert_eq!(std::fs::read_to_string(&dest).expect("read"), "old");
    }

    #[tokio::test]
    async fn cancellation_removes_partial_file() {
        let server = MockServer::start_async().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("cancelled.bkp");
        let (tx, mut rx) = watch::channel(false);
        let res = body(&server, "never-written").await;
        tx.send_replace(true);
        let err = stream_to_file(
            res,
            &dest,
            Instant::now() + Duration::from_secs(5),
            &mut rx,
            |_| {},
        )
        .await
        .expect_err("cancelled");
        assert!(matches!(err, JobError::Cancelled));
        assert!(!dest.exists());
        assert_eq!(std::fs::read_dir(dir.path()).expect("read_dir").count(), 0);
    }
}
