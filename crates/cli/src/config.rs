use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

pub const CONFIG_DIR_ENV: &str = "SDPCTL_CONFIG_DIR";
pub const CONFIG_FILE: &str = "config.json";
pub const DEFAULT_ADMIN_PORT: u16 = 8443;

/// Persisted CLI configuration for one collective.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pem_filepath: Option<PathBuf>,
    /// Peer API version negotiated at the last sign-in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_controller_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Bearer kept here only when the secret store is disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer: Option<String>,
    #[serde(default)]
    pub remember_me: bool,
}

/// `SDPCTL_CONFIG_DIR` > `$XDG_CONFIG_HOME/sdpctl` > `$HOME/.config/sdpctl`.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV)
        && !dir.trim().is_empty()
    {
        return Ok(PathBuf::from(dir));
    }
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME")
        && !xdg.trim().is_empty()
    {
        return Ok(PathBuf::from(xdg).join("sdpctl"));
    }
    let home = std::env::var("HOME")
        .map(PathBuf::from)
        .map_err(|_| anyhow::anyhow!("HOME is not set and neither SDPCTL_CONFIG_DIR nor XDG_CONFIG_HOME is set"))?;
    Ok(home.join(".config").join("sdpctl"))
}

impl Config {
    pub fn load_from(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }

        ensure_private_file(&path)?;
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let cfg = serde_json::from_str::<Self>(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(cfg)
    }

    pub fn save_to(&self, dir: &Path) -> anyhow::Result<()> {
        ensure_private_dir(dir)?;

        let rendered = serde_json::to_string_pretty(self)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        set_private_file_perms(tmp.path())?;
        tmp.write_all(rendered.as_bytes())?;
        tmp.flush()?;
        tmp.persist(dir.join(CONFIG_FILE))?;
        Ok(())
    }

    /// Host of the configured URL, used to scope secrets and find the primary controller.
    pub fn host(&self) -> anyhow::Result<String> {
        let raw = self
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no collective configured, run 'sdpctl configure <url>'"))?;
        let parsed = Url::parse(raw).with_context(|| format!("invalid url '{raw}'"))?;
        parsed
            .host_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("url '{raw}' has no host"))
    }

    /// Forgets the session but keeps connection settings.
    pub fn clear_session(&mut self) {
        self.expires_at = None;
        self.bearer = None;
    }
}

/// Normalizes an admin URL: `https` by default, port 8443 when absent, path `/admin`.
pub fn normalize_url(input: &str) -> anyhow::Result<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        anyhow::bail!("url cannot be empty");
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let mut parsed =
        Url::parse(&with_scheme).with_context(|| format!("invalid url '{trimmed}'"))?;
    if !matches!(parsed.scheme(), "https" | "http") {
        anyhow::bail!("unsupported url scheme '{}'", parsed.scheme());
    }
    if parsed.host_str().is_none() {
        anyhow::bail!("url '{trimmed}' has no host");
    }
    if parsed.port().is_none() {
        parsed
            .set_port(Some(DEFAULT_ADMIN_PORT))
            .map_err(|_| anyhow::anyhow!("cannot set port on '{trimmed}'"))?;
    }
    parsed.set_path("/admin");
    parsed.set_query(None);
    parsed.set_fragment(None);
    Ok(parsed.to_string())
}

/// Reads a PEM bundle and checks that it holds at least one certificate.
pub fn read_pem(path: &Path) -> anyhow::Result<Vec<u8>> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let text = String::from_utf8_lossy(&bytes);
    if !text.contains("-----BEGIN CERTIFICATE-----") {
        anyhow::bail!("{} does not contain a PEM certificate", path.display());
    }
    Ok(bytes)
}

pub(crate) fn ensure_private_dir(path: &Path) -> anyhow::Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

pub(crate) fn set_private_file_perms(path: &Path) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn ensure_private_file(path: &Path) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(path)?.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            anyhow::bail!(
                "config is too permissive (mode {:o}); run: chmod 600 {}",
                mode,
                path.display()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_dir_prefers_explicit_override() {
        let _guard = crate::test_support::ENV_LOCK.lock().expect("lock");
        let saved_home = std::env::var_os("HOME");
        let saved_xdg = std::env::var_os("XDG_CONFIG_HOME");
        let dir = tempfile::tempdir().expect("tempdir");
        // SAFETY: Tests hold ENV_LOCK to serialize env mutations.
        unsafe {
            std::env::set_var(CONFIG_DIR_ENV, dir.path().join("custom"));
            std::env::set_var("XDG_CONFIG_HOME", dir.path().join("xdg"));
        }
        assert_eq!(config_dir().expect("dir"), dir.path().join("custom"));

        unsafe {
            std::env::remove_var(CONFIG_DIR_ENV);
        }
        assert_eq!(config_dir().expect("dir"), dir.path().join("xdg").join("sdpctl"));

        unsafe {
            std::env::remove_var("XDG_CONFIG_HOME");
            std::env::set_var("HOME", dir.path());
        }
        assert_eq!(
            config_dir().expect("dir"),
            dir.path().join(".config").join("sdpctl")
        );

        unsafe {
            match saved_home {
                Some(home) => std::env::set_var("HOME", home),
                None => std::env::remove_var("HOME"),
            }
            if let Some(xdg) = saved_xdg {
                std::env::set_var("XDG_CONFIG_HOME", xdg);
            }
        }
    }

    #[test]
    fn save_writes_private_json_and_roundtrips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg_dir = dir.path().join("sdpctl");
        let cfg = Config {
            url: Some("https://ctrl.example.com:8443/admin".into()),
            provider: Some("local".into()),
            api_version: Some(19),
            device_id: Some(Uuid::new_v4()),
            remember_me: true,
            ..Default::default()
        };
        cfg.save_to(&cfg_dir).expect("save");

        let loaded = Config::load_from(&cfg_dir).expect("load");
        assert_eq!(loaded, cfg);
        let raw = fs::read_to_string(cfg_dir.join(CONFIG_FILE)).expect("read");
        assert!(raw.contains("\"api_version\": 19"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let file_mode = fs::metadata(cfg_dir.join(CONFIG_FILE))
                .expect("metadata")
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(file_mode, 0o600);
            let dir_mode = fs::metadata(&cfg_dir)
                .expect("metadata")
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(dir_mode, 0o700);
        }
    }

    #[test]
    fn load_returns_default_when_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded = Config::load_from(dir.path()).expect("load");
        assert_eq!(loaded, Config::default());
    }

    #[cfg(unix)]
    #[test]
    fn load_fails_when_file_is_too_permissive() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "{}").expect("write");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).expect("chmod");

        let err = Config::load_from(dir.path()).expect_err("should fail");
        assert!(err.to_string().contains("too permissive"));
    }

    #[test]
    fn normalize_url_fills_scheme_port_and_path() {
        assert_eq!(
            normalize_url("ctrl.example.com").expect("url"),
            "https://ctrl.example.com:8443/admin"
        );
        assert_eq!(
            normalize_url("https://ctrl.example.com:444/whatever?x=1").expect("url"),
            "https://ctrl.example.com:444/admin"
        );
        assert!(normalize_url("ftp://ctrl.example.com").is_err());
        assert!(normalize_url("  ").is_err());
    }

    #[test]
    fn host_is_extracted_from_url() {
        let cfg = Config {
            url: Some("https://Ctrl.Example.com:8443/admin".into()),
            ..Default::default()
        };
        assert_eq!(cfg.host().expect("host"), "ctrl.example.com");
        assert!(Config::default().host().is_err());
    }

    #[test]
    fn read_pem_requires_certificate_block() {
        let dir = tempfile::tempdir().expect("tempdir");
        let good = dir.path().join("ca.pem");
        fs::write(
            &good,
            "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n",
        )
        .expect("write");
        assert!(read_pem(&good).is_ok());

        let bad = dir.path().join("bad.pem");
        fs::write(&bad, "not a cert").expect("write");
        assert!(read_pem(&bad).is_err());
        assert!(read_pem(&dir.path().join("missing.pem")).is_err());
    }
}
