//! Btrfs subvolume driver

use super::{driver_error, Driver};
use crate::errors::Result;
use log::debug;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use walkdir::WalkDir;

/// Inode number btrfs assigns to the root of every subvolume
const SUBVOLUME_INODE: u64 = 256;

/// Each volume is a subvolume; copy-on-write is a snapshot
#[derive(Debug, Clone)]
pub struct BtrfsDriver {
    binary: PathBuf,
}

impl Default for BtrfsDriver {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("btrfs"),
        }
    }
}

impl BtrfsDriver {
    /// Use a specific `btrfs` executable
    pub fn with_binary(binary: impl AsRef<Path>) -> Self {
        Self {
            binary: binary.as_ref().to_path_buf(),
        }
    }

    fn run(&self, op: &str, path: &Path, args: &[&OsStr]) -> Result<()> {
        debug!("btrfs {:?}", args);
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|e| driver_error(op, path, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(driver_error(op, path, stderr.trim()));
        }
        Ok(())
    }

    /// Subvolumes at or below `path`, parents before children
    fn subvolumes(path: &Path) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for entry in WalkDir::new(path).follow_links(false) {
            let entry = entry.map_err(|e| driver_error("scan", path, e))?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let meta = entry.metadata().map_err(|e| driver_error("scan", path, e))?;
            if meta.ino() == SUBVOLUME_INODE {
                found.push(entry.path().to_path_buf());
            }
        }
        Ok(found)
    }
}

impl Driver for BtrfsDriver {
    fn create_volume(&self, path: &Path) -> Result<()> {
        if fs::symlink_metadata(path).is_ok() {
            return Err(driver_error("create", path, "already exists"));
        }
        self.run(
            "create",
            path,
            &[OsStr::new("subvolume"), OsStr::new("create"), path.as_os_str()],
        )
    }

    fn destroy_volume(&self, path: &Path) -> Result<()> {
        match fs::symlink_metadata(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(driver_error("destroy", path, e)),
            Ok(_) => {}
        }

        // Nested subvolumes must go first or the outer delete fails.
        for subvolume in Self::subvolumes(path)?.iter().rev() {
            self.run(
                "destroy",
                subvolume,
                &[
                    OsStr::new("subvolume"),
                    OsStr::new("delete"),
                    subvolume.as_os_str(),
                ],
            )?;
        }

        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(driver_error("destroy", path, e)),
        }
    }

    fn create_cow_layer(&self, path: &Path, parent: &Path) -> Result<()> {
        self.run(
            "snapshot",
            path,
            &[
                OsStr::new("subvolume"),
                OsStr::new("snapshot"),
                parent.as_os_str(),
                path.as_os_str(),
            ],
        )
    }
}
