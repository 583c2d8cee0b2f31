//! Small JSON records stored next to each volume's data

use crate::errors::{Result, VolumeError};
use crate::volume::{Ttl, VolumeState};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

pub const DATA_DIR: &str = "volume";
pub const PARENT_LINK: &str = "parent";
pub const PROPERTIES_FILE: &str = "properties.json";
pub const TTL_FILE: &str = "ttl.json";
pub const STATE_FILE: &str = "state.json";
pub const PRIVILEGED_FILE: &str = "privileged.json";

/// TTL together with the instant it runs out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TtlRecord {
    pub ttl: Ttl,
    pub expires_at: DateTime<Utc>,
}

impl TtlRecord {
    /// Start counting `ttl` down from now
    pub fn starting_now(ttl: Ttl) -> Self {
        let now = Utc::now();
        Self {
            ttl,
            expires_at: ttl.expires_at(now),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StateRecord {
    pub state: VolumeState,
}

/// Read and decode `dir/name`
pub(crate) fn read_record<T: DeserializeOwned>(dir: &Path, name: &str) -> Result<T> {
    let path = dir.join(name);
    let bytes = fs::read(&path)
        .map_err(|e| VolumeError::Metadata(format!("read {}: {}", path.display(), e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| VolumeError::Metadata(format!("decode {}: {}", path.display(), e)))
}

/// Like [`read_record`], but a missing file yields `None`
pub(crate) fn read_optional_record<T: DeserializeOwned>(
    dir: &Path,
    name: &str,
) -> Result<Option<T>> {
    match fs::symlink_metadata(dir.join(name)) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        _ => read_record(dir, name).map(Some),
    }
}

/// Encode `value` into `dir/name`, replacing it atomically
pub(crate) fn write_record<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<()> {
    let path = dir.join(name);
    let staging = dir.join(format!(".{}.tmp", name));
    let bytes = serde_json::to_vec(value)
        .map_err(|e| VolumeError::Metadata(format!("encode {}: {}", path.display(), e)))?;

    fs::write(&staging, bytes)
        .and_then(|()| fs::rename(&staging, &path))
        .map_err(|e| {
            let _ = fs::remove_file(&staging);
            VolumeError::Metadata(format!("write {}: {}", path.display(), e))
        })
}
