use std::sync::Mutex;

/// Serializes tests that mutate process environment variables.
pub(crate) static ENV_LOCK: Mutex<()> = Mutex::new(());
