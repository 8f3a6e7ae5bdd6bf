use std::collections::HashMap;
use std::sync::Mutex;

use super::{SecretError, Vault};

/// Process-local vault for tests and environment-only runs.
#[derive(Default)]
pub struct MemoryVault {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryVault {
    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, SecretError> {
        self.entries
            .lock()
            .map_err(|_| SecretError::Backend("memory vault lock poisoned".into()))
    }
}

impl Vault for MemoryVault {
    fn get(&self, key: &str) -> Result<Option<String>, SecretError> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SecretError> {
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), SecretError> {
        self.entries()?.remove(key);
        Ok(())
    }
}
