use std::path::Path;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::Config;

pub const DEVICE_ID_ENV: &str = "SDPCTL_DEVICE_ID";
pub(crate) const MACHINE_ID_PATHS: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];
const DEVICE_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_8d3b_4b7a_9e52_1f0c_d4a7_3b19);

/// Result of a successful sign-in, shared read-only with every command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub bearer: String,
    pub expires_at: DateTime<Utc>,
    pub api_version: u32,
    pub primary_controller_version: Option<String>,
    pub host: String,
    pub device_id: Uuid,
}

impl Session {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        !self.bearer.is_empty() && self.expires_at > now
    }

    /// Rebuilds a session from config plus a bearer pulled from the secret store.
    pub fn restore(cfg: &Config, bearer: Option<String>) -> Option<Self> {
        let bearer = bearer.or_else(|| cfg.bearer.clone())?;
        let session = Self {
            bearer,
            expires_at: cfg.expires_at?,
            api_version: cfg.api_version?,
            primary_controller_version: cfg.primary_controller_version.clone(),
            host: cfg.host().ok()?,
            device_id: cfg.device_id.unwrap_or_else(Uuid::nil),
        };
        session.is_valid(Utc::now()).then_some(session)
    }
}

/// `SDPCTL_DEVICE_ID` > machine identity > a random id persisted in config.
///
/// Returns the id and whether the config changed.
pub fn resolve_device_id(cfg: &mut Config) -> (Uuid, bool) {
    if let Ok(raw) = std::env::var(DEVICE_ID_ENV)
        && let Ok(id) = Uuid::parse_str(raw.trim())
    {
        return (id, false);
    }
    if let Some(id) = machine_device_id(MACHINE_ID_PATHS.iter().map(Path::new)) {
        return (id, false);
    }
    if let Some(id) = cfg.device_id {
        return (id, false);
    }
    let id = Uuid::new_v4();
    cfg.device_id = Some(id);
    (id, true)
}

fn machine_device_id<'a>(candidates: impl IntoIterator<Item = &'a Path>) -> Option<Uuid> {
    candidates.into_iter().find_map(|path| {
        let raw = std::fs::read_to_string(path).ok()?;
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then(|| Uuid::new_v5(&DEVICE_NAMESPACE, trimmed.as_bytes()))
    })
}
