use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::ClientError;

pub const IDENTITY_FILE: &str = "tnv_anon_uid";

pub fn default_identity_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("technova")
        .join(IDENTITY_FILE)
}

/// Reads the persisted anonymous id, generating and saving one on first use.
pub fn load_or_create(path: &Path) -> Result<String, ClientError> {
    match fs::read_to_string(path) {
        Ok(existing) if !existing.trim().is_empty() => return Ok(existing.trim().to_string()),
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }

    let id = Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, &id)?;
    log::debug!("Generated anonymous identity {} at {}", id, path.display());
    Ok(id)
}
