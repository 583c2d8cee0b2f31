//! Creation strategies: how a new volume gets its initial content

use crate::errors::{Result, VolumeError};
use crate::filesystem::{Filesystem, InitVolume};
use crate::utils;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// How a new volume's initial content is produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Start empty
    Empty,
    /// Copy-on-write child of a live volume
    CopyOnWrite { parent: String },
    /// Copy a directory tree from the host
    Import { path: PathBuf },
}

impl Strategy {
    pub fn cow(parent: impl Into<String>) -> Self {
        Strategy::CopyOnWrite {
            parent: parent.into(),
        }
    }

    pub fn import(path: impl Into<PathBuf>) -> Self {
        Strategy::Import { path: path.into() }
    }

    /// Handle of the volume this strategy layers on, if any
    pub fn parent_handle(&self) -> Option<&str> {
        match self {
            Strategy::CopyOnWrite { parent } => Some(parent),
            _ => None,
        }
    }

    /// Produce an `init/` stage volume named `handle`.
    ///
    /// The caller holds the leases on `handle` and on the parent of a
    /// copy-on-write child.
    pub(crate) fn materialize(&self, filesystem: &Filesystem, handle: &str) -> Result<InitVolume> {
        match self {
            Strategy::Empty => filesystem.new_volume(handle),
            Strategy::CopyOnWrite { parent } => {
                if parent.is_empty() {
                    return Err(VolumeError::NoParentProvided);
                }
                let parent_volume = filesystem
                    .lookup_volume(parent)?
                    .ok_or_else(|| VolumeError::ParentNotFound(parent.clone()))?;
                parent_volume.new_subvolume(handle)
            }
            Strategy::Import { path } => {
                let init = filesystem.new_volume(handle)?;
                debug!("importing {} into {}", path.display(), handle);
                if let Err(e) = utils::copy_tree(path, &init.data_path()) {
                    if let Err(rollback) = init.destroy() {
                        error!("rollback of import into {} failed: {}", handle, rollback);
                    }
                    return Err(VolumeError::Import(format!("{}: {}", path.display(), e)));
                }
                Ok(init)
            }
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Empty => write!(f, "empty"),
            Strategy::CopyOnWrite { parent } => write!(f, "cow of {}", parent),
            Strategy::Import { path } => write!(f, "import from {}", path.display()),
        }
    }
}

/// Strategy as it arrives from clients: `{"type": "cow", "volume": "h"}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategySpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl TryFrom<StrategySpec> for Strategy {
    type Error = VolumeError;

    fn try_from(spec: StrategySpec) -> Result<Self> {
        match spec.kind.as_str() {
            "empty" => Ok(Strategy::Empty),
            "cow" => Ok(Strategy::CopyOnWrite {
                parent: spec.volume.unwrap_or_default(),
            }),
            "import" => spec
                .path
                .map(|path| Strategy::Import { path })
                .ok_or_else(|| VolumeError::Import("no import path provided".to_string())),
            other => Err(VolumeError::UnknownStrategy(other.to_string())),
        }
    }
}
