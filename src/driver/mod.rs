//! Storage drivers: copy-on-write volume storage
//!
//! A driver implements volume creation, destruction and copy-on-write
//! layering for one filesystem technology. Drivers only ever see paths;
//! handles and metadata belong to the layers above.
//!
//! # Drivers
//!
//! - **naive**: Plain directories, copy-on-write by recursive copy
//! - **btrfs**: Subvolumes and snapshots via the `btrfs` tool
//! - **overlay**: Bind mounts and overlayfs with per-volume upper layers
//!
//! # Examples
//!
//! ```ignore
//! use baggageclaim::driver::{Driver, NaiveDriver};
//!
//! let driver = NaiveDriver;
//! driver.create_volume(Path::new("/volumes/init/a/volume"))?;
//! ```

pub mod btrfs;
pub mod naive;
pub mod overlay;

pub use btrfs::BtrfsDriver;
pub use naive::NaiveDriver;
pub use overlay::OverlayDriver;

use crate::errors::{Result, VolumeError};
use crate::utils;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// Path-level volume storage operations
pub trait Driver: Send + Sync {
    /// Create an empty volume at `path`. Fails if `path` already exists.
    fn create_volume(&self, path: &Path) -> Result<()>;

    /// Release every piece of storage backing `path`.
    ///
    /// Destroying a missing, unmounted or half torn down volume succeeds.
    fn destroy_volume(&self, path: &Path) -> Result<()>;

    /// Create a volume at `path` whose content starts as a copy of `parent`.
    /// Writes to either side are never visible on the other.
    fn create_cow_layer(&self, path: &Path, parent: &Path) -> Result<()>;

    /// Bytes used by the volume at `path`
    fn volume_size(&self, path: &Path) -> Result<u64> {
        utils::dir_size(path)
    }

    /// Rebuild driver-private state for existing volumes.
    ///
    /// Each ancestry lists data paths from the oldest ancestor down to the
    /// volume itself.
    fn recover(&self, _ancestries: &[Vec<PathBuf>]) -> Result<()> {
        Ok(())
    }
}

/// Available storage drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverKind {
    #[default]
    Naive,
    Btrfs,
    Overlay,
}

impl DriverKind {
    pub fn all() -> &'static [DriverKind] {
        &[DriverKind::Naive, DriverKind::Btrfs, DriverKind::Overlay]
    }

    /// Whether the driver needs mount or subvolume privileges
    pub fn requires_root(&self) -> bool {
        !matches!(self, DriverKind::Naive)
    }

    /// Instantiate the driver; `overlays_dir` is only used by overlay
    pub fn build(&self, overlays_dir: &Path) -> Result<Arc<dyn Driver>> {
        let driver: Arc<dyn Driver> = match self {
            DriverKind::Naive => Arc::new(NaiveDriver),
            DriverKind::Btrfs => Arc::new(BtrfsDriver::default()),
            DriverKind::Overlay => Arc::new(OverlayDriver::new(overlays_dir)?),
        };
        Ok(driver)
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverKind::Naive => write!(f, "naive"),
            DriverKind::Btrfs => write!(f, "btrfs"),
            DriverKind::Overlay => write!(f, "overlay"),
        }
    }
}

impl FromStr for DriverKind {
    type Err = VolumeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "naive" => Ok(DriverKind::Naive),
            "btrfs" => Ok(DriverKind::Btrfs),
            "overlay" => Ok(DriverKind::Overlay),
            other => Err(VolumeError::InvalidConfig(format!(
                "Unknown driver: {}",
                other
            ))),
        }
    }
}

pub(crate) fn driver_error(op: &str, path: &Path, err: impl fmt::Display) -> VolumeError {
    VolumeError::StorageDriver(format!("{} {}: {}", op, path.display(), err))
}
