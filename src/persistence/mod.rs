//! Persistence - JSON-backed stores in the application-support directory

mod names;
mod registry;

pub use names::CustomNames;
pub use registry::{CloneRecord, CloneRegistry};

use std::path::Path;

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};

use crate::core::Settings;

/// Read a JSON value from `path`, returning `None` when the file is absent.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context(format!("Failed to read {:?}", path)),
    };
    let value = serde_json::from_slice(&data).context(format!("Failed to parse {:?}", path))?;
    Ok(Some(value))
}

/// Write a JSON value atomically: serialize to a sibling temp file, then
/// rename over the destination so readers never observe a torn file.
pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .context(format!("Failed to create directory {:?}", parent))?;
    }
    let data = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data).context(format!("Failed to write {:?}", tmp))?;
    std::fs::rename(&tmp, path).context(format!("Failed to replace {:?}", path))?;
    Ok(())
}

/// Load settings from the data directory, falling back to defaults.
pub fn load_settings(data_dir: &Path) -> Result<Settings> {
    let mut settings: Settings = read_json(&data_dir.join("settings.json"))?.unwrap_or_default();
    settings.validate();
    Ok(settings)
}

/// Persist settings to the data directory.
pub fn save_settings(data_dir: &Path, settings: &Settings) -> Result<()> {
    write_json(&data_dir.join("settings.json"), settings)
}
