//! Utility functions for volume operations

use crate::errors::{Result, VolumeError};
#[cfg(test)]
use std::cell::Cell;
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::Path;
use walkdir::WalkDir;

#[cfg(test)]
thread_local! {
    static ROOT_OVERRIDE: Cell<Option<bool>> = const { Cell::new(None) };
}

/// Check if running as root
pub fn is_root() -> bool {
    #[cfg(test)]
    {
        if let Some(value) = ROOT_OVERRIDE.with(|cell| cell.get()) {
            return value;
        }
    }

    unsafe { libc::geteuid() == 0 }
}

/// Ensure we have root privileges
pub fn require_root(operation: &str) -> Result<()> {
    if !is_root() {
        Err(VolumeError::PermissionDenied(format!(
            "{} requires root privileges",
            operation
        )))
    } else {
        Ok(())
    }
}

/// A handle must name exactly one directory entry
pub fn validate_handle(handle: &str) -> Result<()> {
    if handle.is_empty() || handle == "." || handle == ".." || handle.contains('/') {
        return Err(VolumeError::InvalidHandle(handle.to_string()));
    }
    if handle.contains('\0') {
        return Err(VolumeError::InvalidHandle(handle.to_string()));
    }
    Ok(())
}

/// Total size in bytes of the regular files below `path`
pub fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(io::Error::from)?.len();
        }
    }
    Ok(total)
}

/// Copy the directory tree at `src` into the existing directory `dst`.
///
/// Symlinks are recreated rather than followed; file and directory
/// permissions are carried over.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let root_meta = fs::metadata(src)?;
    if !root_meta.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a directory", src.display()),
        ));
    }

    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::other(e.to_string()))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir(&target)?;
            fs::set_permissions(&target, entry.metadata()?.permissions())?;
        } else if file_type.is_symlink() {
            symlink(fs::read_link(entry.path())?, &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        }
        // Sockets, fifos and device nodes are not part of volume content.
    }

    fs::set_permissions(dst, root_meta.permissions())?;
    Ok(())
}

#[cfg(test)]
pub fn set_root_override(value: Option<bool>) {
    ROOT_OVERRIDE.with(|cell| cell.set(value));
}
