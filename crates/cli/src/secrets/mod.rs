//! Secret storage for credentials and tokens, scoped per collective host.
//!
//! Reads consult `SDPCTL_USERNAME`, `SDPCTL_PASSWORD` and `SDPCTL_BEARER` before the backing
//! vault. Every vault call runs on the blocking pool under a deadline. A backend that misses
//! the deadline is abandoned for the rest of the process: reads report nothing stored, writes
//! are dropped and [`SecretStore::is_persistent`] turns false.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Classify, ErrorKind};

mod file;
mod keychain;
mod memory;

pub use file::FileVault;
pub use keychain::{Keychain, KeyringVault, SERVICE, SystemKeychain};
pub use memory::MemoryVault;

pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(5);
pub const NO_KEYRING_ENV: &str = "SDPCTL_NO_KEYRING";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretName {
    Username,
    Password,
    Bearer,
    RefreshToken,
}

impl SecretName {
    pub const ALL: [SecretName; 4] = [
        SecretName::Username,
        SecretName::Password,
        SecretName::Bearer,
        SecretName::RefreshToken,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SecretName::Username => "username",
            SecretName::Password => "password",
            SecretName::Bearer => "bearer",
            SecretName::RefreshToken => "refreshToken",
        }
    }

    fn env_var(&self) -> Option<&'static str> {
        match self {
            SecretName::Username => Some("SDPCTL_USERNAME"),
            SecretName::Password => Some("SDPCTL_PASSWORD"),
            SecretName::Bearer => Some("SDPCTL_BEARER"),
            SecretName::RefreshToken => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret store backend failed: {0}")]
    Backend(String),
    #[error("secret store data is unreadable: {0}")]
    Corrupt(String),
    #[error("secret store I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for SecretError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Unknown
    }
}

/// Blocking key/value backend.
pub trait Vault: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<String>, SecretError>;
    fn set(&self, key: &str, value: &str) -> Result<(), SecretError>;
    fn delete(&self, key: &str) -> Result<(), SecretError>;
}

#[derive(Clone)]
pub struct SecretStore {
    vault: Option<Arc<dyn Vault>>,
    prefix: String,
    deadline: Duration,
    unresponsive: Arc<AtomicBool>,
}

impl SecretStore {
    pub fn new(vault: Arc<dyn Vault>, host: &str) -> Self {
        Self {
            vault: Some(vault),
            prefix: prefix_for(host),
            deadline: DEFAULT_DEADLINE,
            unresponsive: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Environment-only store: reads fall through to env vars, writes are dropped.
    pub fn env_only(host: &str) -> Self {
        Self {
            vault: None,
            prefix: prefix_for(host),
            deadline: DEFAULT_DEADLINE,
            unresponsive: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// False for env-only stores and once the backend has missed its deadline.
    pub fn is_persistent(&self) -> bool {
        self.vault.is_some() && !self.unresponsive.load(Ordering::Relaxed)
    }

    pub fn key(&self, name: SecretName) -> String {
        format!("{}.{}", self.prefix, name.as_str())
    }

    /// Environment override first, then the vault. `Ok(None)` when nothing is stored.
    pub async fn get(&self, name: SecretName) -> Result<Option<String>, SecretError> {
        if let Some(var) = name.env_var()
            && let Ok(value) = std::env::var(var)
            && !value.is_empty()
        {
            return Ok(Some(value));
        }
        self.get_stored(name).await
    }

    /// Vault lookup only, ignoring environment overrides.
    pub async fn get_stored(&self, name: SecretName) -> Result<Option<String>, SecretError> {
        let key = self.key(name);
        self.run(move |vault| vault.get(&key)).await.map(Option::flatten)
    }

    pub async fn set(&self, name: SecretName, value: &str) -> Result<(), SecretError> {
        let key = self.key(name);
        let value = value.to_string();
        debug!(secret = name.as_str(), "storing secret");
        self.run(move |vault| vault.set(&key, &value))
            .await
            .map(|_| ())
    }

    pub async fn delete(&self, name: SecretName) -> Result<(), SecretError> {
        let key = self.key(name);
        self.run(move |vault| vault.delete(&key)).await.map(|_| ())
    }

    pub async fn clear(&self) -> Result<(), SecretError> {
        for name in SecretName::ALL {
            self.delete(name).await?;
        }
        Ok(())
    }

    async fn run<F, T>(&self, op: F) -> Result<Option<T>, SecretError>
    where
        F: FnOnce(&dyn Vault) -> Result<T, SecretError> + Send + 'static,
        T: Send + 'static,
    {
        let Some(vault) = self.vault.clone() else {
            return Ok(None);
        };
        if self.unresponsive.load(Ordering::Relaxed) {
            return Ok(None);
        }
        let task = tokio::task::spawn_blocking(move || op(vault.as_ref()));
        match tokio::time::timeout(self.deadline, task).await {
            Ok(Ok(result)) => result.map(Some),
            Ok(Err(join)) => Err(SecretError::Backend(join.to_string())),
            Err(_) => {
                if !self.unresponsive.swap(true, Ordering::Relaxed) {
                    warn!(
                        deadline = ?self.deadline,
                        "secret store did not respond; continuing with environment variables only"
                    );
                }
                Ok(None)
            }
        }
    }
}

/// Stable per-host key prefix so several collectives can share one vault.
pub fn prefix_for(host: &str) -> String {
    let normalized = host.trim().to_ascii_lowercase();
    let digest = blake3::hash(normalized.as_bytes());
    digest.to_hex()[..16].to_string()
}

/// True when `SDPCTL_NO_KEYRING` asks for environment-only secrets.
pub fn keyring_disabled() -> bool {
    std::env::var(NO_KEYRING_ENV)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}
