use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::session::MACHINE_ID_PATHS;

use super::{SecretError, Vault};

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const KEY_CONTEXT: &str = "sdpctl secret vault v2";
const DATA_FILE: &str = "secrets.enc";

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct VaultKey {
    bytes: [u8; KEY_SIZE],
}

impl VaultKey {
    /// Nothing derived from `material` is written to disk.
    fn derive(material: &[u8]) -> Self {
        Self {
            bytes: blake3::derive_key(KEY_CONTEXT, material),
        }
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305, SecretError> {
        ChaCha20Poly1305::new_from_slice(&self.bytes)
            .map_err(|err| SecretError::Backend(format!("failed to create cipher: {err}")))
    }
}

/// Encrypted JSON map in the config directory. Used when no OS credential store is
/// reachable and for values too long for one. The key is derived from the machine id, the
/// local user and the directory path, so a copied `secrets.enc` does not open elsewhere.
pub struct FileVault {
    data_path: PathBuf,
    key: VaultKey,
    lock: Mutex<()>,
}

impl FileVault {
    pub fn new(config_dir: &Path) -> Self {
        let mut material = host_key_material(config_dir);
        let vault = Self::with_key_material(config_dir, &material);
        material.zeroize();
        vault
    }

    pub fn with_key_material(config_dir: &Path, material: &[u8]) -> Self {
        Self {
            data_path: config_dir.join(DATA_FILE),
            key: VaultKey::derive(material),
            lock: Mutex::new(()),
        }
    }

    fn read_map(&self, key: &VaultKey) -> Result<BTreeMap<String, String>, SecretError> {
        if !self.data_path.exists() {
            return Ok(BTreeMap::new());
        }
        let sealed = fs::read(&self.data_path)?;
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(SecretError::Corrupt("vault file is truncated".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        let mut plain = key
            .cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SecretError::Corrupt("vault failed authentication".into()))?;
        let map = serde_json::from_slice(&plain)
            .map_err(|err| SecretError::Corrupt(err.to_string()));
        plain.zeroize();
        map
    }

    fn write_map(&self, key: &VaultKey, map: &BTreeMap<String, String>) -> Result<(), SecretError> {
        let mut plain =
            serde_json::to_vec(map).map_err(|err| SecretError::Backend(err.to_string()))?;
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = key
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), plain.as_slice())
            .map_err(|err| SecretError::Backend(format!("encryption failed: {err}")));
        plain.zeroize();

        let mut sealed = Vec::with_capacity(NONCE_SIZE + TAG_SIZE + map.len() * 64);
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext?);
        write_private(&self.data_path, &sealed)
    }
}

impl Vault for FileVault {
    fn get(&self, key: &str) -> Result<Option<String>, SecretError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| SecretError::Backend("vault lock poisoned".into()))?;
        Ok(self.read_map(&self.key)?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SecretError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| SecretError::Backend("vault lock poisoned".into()))?;
        let mut map = self.read_map(&self.key)?;
        map.insert(key.to_string(), value.to_string());
        self.write_map(&self.key, &map)
    }

    fn delete(&self, key: &str) -> Result<(), SecretError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| SecretError::Backend("vault lock poisoned".into()))?;
        if !self.data_path.exists() {
            return Ok(());
        }
        let mut map = self.read_map(&self.key)?;
        if map.remove(key).is_some() {
            self.write_map(&self.key, &map)?;
        }
        Ok(())
    }
}

/// Machine id, user name and the directory path, NUL-separated.
fn host_key_material(config_dir: &Path) -> Vec<u8> {
    let mut material = Vec::new();
    if let Some(id) = MACHINE_ID_PATHS
        .iter()
        .find_map(|path| fs::read_to_string(path).ok().filter(|id| !id.trim().is_empty()))
    {
        material.extend_from_slice(id.trim().as_bytes());
    }
    material.push(0);
    for var in ["USER", "USERNAME"] {
        if let Ok(user) = std::env::var(var) {
            material.extend_from_slice(user.as_bytes());
            break;
        }
    }
    material.push(0);
    let dir = fs::canonicalize(config_dir).unwrap_or_else(|_| config_dir.to_path_buf());
    material.extend_from_slice(dir.to_string_lossy().as_bytes());
    material
}

fn write_private(path: &Path, bytes: &[u8]) -> Result<(), SecretError> {
    let dir = path
        .parent()
        .ok_or_else(|| SecretError::Backend("vault path has no parent".into()))?;
    crate::config::ensure_private_dir(dir)
        .map_err(|err| SecretError::Backend(format!("{err:#}")))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    crate::config::set_private_file_perms(tmp.path())
        .map_err(|err| SecretError::Backend(format!("{err:#}")))?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| SecretError::Io(err.error))?;
    Ok(())
}
