use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use super::{FileVault, SecretError, Vault};

/// Service name every entry is filed under in the OS credential store.
pub const SERVICE: &str = "sdpctl";

/// Blocking access to an OS credential store.
pub trait Keychain: Send + Sync + 'static {
    fn get(&self, key: &str) -> keyring::Result<String>;
    fn set(&self, key: &str, value: &str) -> keyring::Result<()>;
    fn delete(&self, key: &str) -> keyring::Result<()>;
}

/// Secret Service on Linux, Keychain on macOS, Credential Manager on Windows.
pub struct SystemKeychain {
    service: String,
}

impl SystemKeychain {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl Keychain for SystemKeychain {
    fn get(&self, key: &str) -> keyring::Result<String> {
        keyring::Entry::new(&self.service, key)?.get_password()
    }

    fn set(&self, key: &str, value: &str) -> keyring::Result<()> {
        keyring::Entry::new(&self.service, key)?.set_password(value)
    }

    fn delete(&self, key: &str) -> keyring::Result<()> {
        keyring::Entry::new(&self.service, key)?.delete_credential()
    }
}

/// OS credential store first. Values the store rejects as too long, and everything once the
/// store turns out to be unreachable, go to the encrypted [`FileVault`].
pub struct KeyringVault<K = SystemKeychain> {
    keychain: K,
    overflow: FileVault,
    unavailable: AtomicBool,
}

impl KeyringVault {
    pub fn system(config_dir: &Path) -> Self {
        Self::new(SystemKeychain::new(SERVICE), FileVault::new(config_dir))
    }
}

impl<K: Keychain> KeyringVault<K> {
    pub fn new(keychain: K, overflow: FileVault) -> Self {
        Self {
            keychain,
            overflow,
            unavailable: AtomicBool::new(false),
        }
    }

    fn usable(&self) -> bool {
        !self.unavailable.load(Ordering::Relaxed)
    }

    fn give_up(&self, err: &keyring::Error) {
        if !self.unavailable.swap(true, Ordering::Relaxed) {
            warn!(error = %err, "OS credential store unavailable, using the encrypted file vault");
        }
    }
}

fn unreachable_store(err: &keyring::Error) -> bool {
    matches!(
        err,
        keyring::Error::NoStorageAccess(_) | keyring::Error::PlatformFailure(_)
    )
}

fn backend(err: keyring::Error) -> SecretError {
    SecretError::Backend(err.to_string())
}

impl<K: Keychain> Vault for KeyringVault<K> {
    fn get(&self, key: &str) -> Result<Option<String>, SecretError> {
        if self.usable() {
            match self.keychain.get(key) {
                Ok(value) => return Ok(Some(value)),
                Err(keyring::Error::NoEntry) => {}
                Err(err) if unreachable_store(&err) => self.give_up(&err),
                Err(err) => return Err(backend(err)),
            }
        }
        self.overflow.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SecretError> {
        if self.usable() {
            match self.keychain.set(key, value) {
                Ok(()) => {
                    if let Err(err) = self.overflow.delete(key) {
                        debug!(key, error = %err, "could not drop file vault copy");
                    }
                    return Ok(());
                }
                Err(keyring::Error::TooLong(attr, limit)) => {
                    debug!(key, %attr, limit, "value too long for the OS credential store");
                    match self.keychain.delete(key) {
                        Ok(()) | Err(keyring::Error::NoEntry) => {}
                        Err(err) => return Err(backend(err)),
                    }
                }
                Err(err) if unreachable_store(&err) => self.give_up(&err),
                Err(err) => return Err(backend(err)),
            }
        }
        self.overflow.set(key, value)
    }

    fn delete(&self, key: &str) -> Result<(), SecretError> {
        if self.usable() {
            match self.keychain.delete(key) {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(err) if unreachable_store(&err) => self.give_up(&err),
                Err(err) => return Err(backend(err)),
            }
        }
        self.overflow.delete(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory credential store with a length limit, or one that is always locked.
    #[derive(Default)]
    struct FakeKeychain {
        entries: Mutex<HashMap<String, String>>,
        limit: Option<usize>,
        locked: bool,
    }

    impl FakeKeychain {
        fn locked() -> Self {
            Self {
                locked: true,
                ..Self::default()
            }
        }

        fn check(&self) -> keyring::Result<()> {
            if self.locked {
                return Err(keyring::Error::NoStorageAccess(Box::new(
                    std::io::Error::other("collection is locked"),
                )));
            }
            Ok(())
        }
    }

    impl Keychain for FakeKeychain {
        fn get(&self, key: &str) -> keyring::Result<String> {
            self.check()?;
            self.entries
                .lock()
                .expect("lock")
                .get(key)
                .cloned()
                .ok_or(keyring::Error::NoEntry)
        }

        fn set(&self, key: &str, value: &str) -> keyring::Result<()> {
            self.check()?;
            if let Some(limit) = self.limit
                && value.len() > limit
            {
                return Err(keyring::Error::TooLong("password".into(), limit as u32));
            }
            self.entries
                .lock()
                .expect("lock")
                .insert(key.to_string(), value.to_string());
            Ok(())
        }

        fn delete(&self, key: &str) -> keyring::Result<()> {
            self.check()?;
            self.entries
                .lock()
                .expect("lock")
                .remove(key)
                .map(|_| ())
                .ok_or(keyring::Error::NoEntry)
        }
    }

    fn overflow(dir: &Path) -> FileVault {
        FileVault::with_key_material(dir, b"test-machine\0tester")
    }

    #[test]
    fn values_live_in_the_keychain() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = KeyringVault::new(FakeKeychain::default(), overflow(dir.path()));
        vault.set("abc.bearer", "token").expect("set");

        assert_eq!(vault.get("abc.bearer").expect("get").as_deref(), Some("token"));
        assert_eq!(
            vault.keychain.entries.lock().expect("lock").get("abc.bearer").map(String::as_str),
            Some("token")
        );
        assert!(!dir.path().join("secrets.enc").exists());

        vault.delete("abc.bearer").expect("delete");
        assert_eq!(vault.get("abc.bearer").expect("get"), None);
        vault.delete("abc.bearer").expect("deleting twice");
    }

    #[test]
    fn long_values_overflow_to_the_file_vault() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keychain = FakeKeychain {
            limit: Some(16),
            ..FakeKeychain::default()
        };
        let vault = KeyringVault::new(keychain, overflow(dir.path()));
        vault.set("abc.bearer", "short").expect("set short");
        let long = "x".repeat(64);
        vault.set("abc.bearer", &long).expect("set long");

        assert!(vault.keychain.entries.lock().expect("lock").is_empty());
        assert_eq!(vault.get("abc.bearer").expect("get"), Some(long));

        vault.set("abc.bearer", "short again").expect("set short");
        assert_eq!(
            overflow(dir.path()).get("abc.bearer").expect("file get"),
            None
        );
    }

    #[test]
    fn unreachable_keychain_falls_back_to_the_file_vault() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = KeyringVault::new(FakeKeychain::locked(), overflow(dir.path()));
        vault.set("abc.username", "admin").expect("set");

        assert!(!vault.usable());
        assert_eq!(vault.get("abc.username").expect("get").as_deref(), Some("admin"));
        assert_eq!(
            overflow(dir.path()).get("abc.username").expect("file get").as_deref(),
            Some("admin")
        );
    }
}
