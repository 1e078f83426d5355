use std::fs;
use std::path::Path;

use serde::{Serialize, de::DeserializeOwned};

use crate::error::{EngineError, Result};

pub mod entity;
pub mod keyring;

pub use entity::EntityStore;
pub use keyring::KeyRing;

/// Encrypted singleton files (`sys_access_policy`, `nodes.json`,
/// `metrics.json`, `fsm_state.json`). Same at-rest format as entity files.
pub fn write_blob<T: Serialize>(keys: &KeyRing, path: &Path, value: &T) -> Result<()> {
    let plain = serde_json::to_vec(value)?;
    let sealed = keys.encrypt(&plain)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, sealed)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_blob<T: DeserializeOwned>(keys: &KeyRing, path: &Path) -> Result<Option<T>> {
    let sealed = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let plain = keys.decrypt(&sealed)?;
    serde_json::from_slice(&plain)
        .map(Some)
        .map_err(|_| EngineError::Corrupt(path.display().to_string()))
}
