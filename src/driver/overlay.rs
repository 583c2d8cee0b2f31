//! Overlay filesystem driver
//!
//! Every volume owns a writable upper layer under `<overlays>/layers/<entry>`,
//! where `<entry>` is the name of the directory holding the volume's data
//! path. A volume without lower layers bind-mounts its upper layer; one with
//! lower layers mounts overlayfs over them, with its work directory under
//! `<overlays>/work/<entry>`.
//!
//! Lower layers are always frozen: creating a child of a parent whose upper
//! layer holds anything moves that layer to `<overlays>/frozen/<id>`,
//! gives the parent a fresh upper layer and remounts the parent over the
//! frozen one. Parent and child then share the frozen layer read-only, so
//! neither side's later writes reach the other. Each volume's lower chain is
//! persisted under `<overlays>/chains/<entry>` for recovery, and a frozen
//! layer is removed once no chain names it.

use super::{driver_error, Driver};
use crate::errors::{Result, VolumeError};
use crate::filesystem::metadata::{read_optional_record, write_record};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;
/// Mount primitives used by the overlay driver
pub(crate) trait Mounter: Send + Sync {
    fn bind(&self, source: &Path, target: &Path) -> Result<()>;
    fn overlay(&self, options: &str, target: &Path) -> Result<()>;
    fn unmount(&self, target: &Path) -> Result<()>;
    /// Mount points currently present in this mount namespace
    fn mounted(&self) -> Result<HashSet<PathBuf>>;
}

/// Mounts through mount(2)/umount2(2)
pub(crate) struct SyscallMounter;

impl Mounter for SyscallMounter {
    fn bind(&self, source: &Path, target: &Path) -> Result<()> {
        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| driver_error("bind mount", target, e))
    }

    fn overlay(&self, options: &str, target: &Path) -> Result<()> {
        mount(
            Some("overlay"),
            target,
            Some("overlay"),
            MsFlags::empty(),
            Some(options),
        )
        .map_err(|e| driver_error("overlay mount", target, e))
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        match umount2(target, MntFlags::MNT_DETACH) {
            Ok(()) | Err(Errno::EINVAL) | Err(Errno::ENOENT) => Ok(()),
            Err(e) => Err(driver_error("unmount", target, e)),
        }
    }

    fn mounted(&self) -> Result<HashSet<PathBuf>> {
        let contents = fs::read_to_string("/proc/self/mountinfo")?;
        Ok(parse_mountinfo(&contents))
    }
}

/// Extract mount points (fifth field) from /proc/self/mountinfo
pub(crate) fn parse_mountinfo(contents: &str) -> HashSet<PathBuf> {
    contents
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape_mountinfo(field)))
        .collect()
}

/// Undo the octal escaping (`\040` for a space) the kernel applies to paths
fn unescape_mountinfo(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(value) = u8::from_str_radix(digits, 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Overlay mount configuration for one copy-on-write volume
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Lower layers, nearest ancestor first
    pub lower: Vec<PathBuf>,
    /// Upper layer (this volume's writes)
    pub upper: PathBuf,
    /// Work directory required by overlayfs
    pub work: PathBuf,
    /// Merged mount point (the volume's data path)
    pub merged: PathBuf,
}

impl OverlayConfig {
    /// Get overlay mount string for mount(2)
    pub fn get_mount_options(&self) -> Result<String> {
        let mut lowers = Vec::with_capacity(self.lower.len());
        for layer in &self.lower {
            lowers.push(path_str(layer)?);
        }
        Ok(format!(
            "lowerdir={},upperdir={},workdir={}",
            lowers.join(":"),
            path_str(&self.upper)?,
            path_str(&self.work)?
        ))
    }
}

fn path_str(path: &Path) -> Result<&str> {
    let s = path
        .to_str()
        .ok_or_else(|| driver_error("mount", path, "path is not valid UTF-8"))?;
    if s.contains(':') || s.contains(',') {
        return Err(driver_error("mount", path, "path contains overlay separator"));
    }
    Ok(s)
}

/// Overlay-backed driver with a process-wide mount table
pub struct OverlayDriver {
    layers_dir: PathBuf,
    frozen_dir: PathBuf,
    work_dir: PathBuf,
    chains_dir: PathBuf,
    /// entry -> frozen lower layers, nearest first
    mounts: Mutex<HashMap<String, Vec<String>>>,
    mounter: Box<dyn Mounter>,
}

impl OverlayDriver {
    /// Create new overlay driver storing layers under `overlays_dir`
    pub fn new(overlays_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_mounter(overlays_dir, Box::new(SyscallMounter))
    }

    pub(crate) fn with_mounter(
        overlays_dir: impl AsRef<Path>,
        mounter: Box<dyn Mounter>,
    ) -> Result<Self> {
        let layers_dir = overlays_dir.as_ref().join("layers");
        let frozen_dir = overlays_dir.as_ref().join("frozen");
        let work_dir = overlays_dir.as_ref().join("work");
        let chains_dir = overlays_dir.as_ref().join("chains");
        fs::create_dir_all(&layers_dir)?;
        fs::create_dir_all(&frozen_dir)?;
        fs::create_dir_all(&work_dir)?;
        fs::create_dir_all(&chains_dir)?;

        Ok(Self {
            layers_dir,
            frozen_dir,
            work_dir,
            chains_dir,
            mounts: Mutex::new(HashMap::new()),
            mounter,
        })
    }

    /// Upper layer directory of the volume at `path`
    pub fn layer_path(&self, path: &Path) -> Result<PathBuf> {
        Ok(self.layers_dir.join(entry_name(path)?))
    }

    /// Lower layer chain of a mounted volume, nearest first
    pub fn lower_layers(&self, path: &Path) -> Result<Option<Vec<PathBuf>>> {
        let entry = entry_name(path)?;
        Ok(self
            .table()
            .get(&entry)
            .map(|lowers| lowers.iter().map(|l| self.frozen_dir.join(l)).collect()))
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Vec<String>>> {
        self.mounts
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    fn mount_fresh(&self, entry: &str, path: &Path) -> Result<()> {
        self.mounter.bind(&self.layers_dir.join(entry), path)
    }

    fn mount_layered(&self, entry: &str, lowers: &[String], path: &Path) -> Result<()> {
        let config = OverlayConfig {
            lower: lowers.iter().map(|l| self.frozen_dir.join(l)).collect(),
            upper: self.layers_dir.join(entry),
            work: self.work_dir.join(entry),
            merged: path.to_path_buf(),
        };
        fs::create_dir_all(&config.work)
            .map_err(|e| driver_error("create work dir", &config.work, e))?;
        let options = config.get_mount_options()?;
        debug!("mounting overlay at {}: {}", path.display(), options);
        self.mounter.overlay(&options, &config.merged)
    }

    fn mount(&self, entry: &str, lowers: &[String], path: &Path) -> Result<()> {
        if lowers.is_empty() {
            self.mount_fresh(entry, path)
        } else {
            self.mount_layered(entry, lowers, path)
        }
    }

    fn store_chain(&self, entry: &str, lowers: &[String]) -> Result<()> {
        write_record(&self.chains_dir, entry, &lowers)
    }

    fn load_chain(&self, entry: &str) -> Result<Vec<String>> {
        Ok(read_optional_record(&self.chains_dir, entry)?.unwrap_or_default())
    }

    /// Freeze the parent's upper layer if it holds anything and return the
    /// lower chain a new child of it stacks on.
    fn freeze(&self, entry: &str, path: &Path) -> Result<Vec<String>> {
        let lowers = self.table().get(entry).cloned().ok_or_else(|| {
            VolumeError::StorageDriver(format!("parent layer {} is not mounted", path.display()))
        })?;

        let upper = self.layers_dir.join(entry);
        if is_empty_dir(&upper)? {
            return Ok(lowers);
        }

        let frozen = Uuid::new_v4().simple().to_string();
        let frozen_dir = self.frozen_dir.join(&frozen);
        let mut stacked = Vec::with_capacity(lowers.len() + 1);
        stacked.push(frozen);
        stacked.extend(lowers.iter().cloned());

        self.mounter.unmount(path)?;
        if let Err(e) = fs::rename(&upper, &frozen_dir) {
            self.remount_after_failed_freeze(entry, &lowers, path);
            return Err(driver_error("freeze layer", &upper, e));
        }
        let restacked = self
            .store_chain(entry, &stacked)
            .and_then(|()| {
                fs::create_dir(&upper).map_err(|e| driver_error("create layer", &upper, e))
            })
            .and_then(|()| self.mount_layered(entry, &stacked, path));
        if let Err(e) = restacked {
            self.unfreeze(entry, &lowers, &frozen_dir, path);
            return Err(e);
        }

        debug!("froze layer of {} into {}", entry, stacked[0]);
        self.table().insert(entry.to_string(), stacked.clone());
        Ok(stacked)
    }

    /// Put a parent back the way it was before a freeze failed halfway
    fn unfreeze(&self, entry: &str, lowers: &[String], frozen_dir: &Path, path: &Path) {
        let upper = self.layers_dir.join(entry);
        let _ = self.mounter.unmount(path);
        let restored = remove_if_present(&upper)
            .and_then(|()| {
                fs::rename(frozen_dir, &upper).map_err(|e| driver_error("thaw layer", &upper, e))
            })
            .and_then(|()| self.store_chain(entry, lowers));
        match restored {
            Ok(()) => self.remount_after_failed_freeze(entry, lowers, path),
            Err(e) => warn!("failed to restore layer of {}: {}", entry, e),
        }
    }

    fn remount_after_failed_freeze(&self, entry: &str, lowers: &[String], path: &Path) {
        if let Err(e) = self.mount(entry, lowers, path) {
            warn!("failed to remount {}: {}", path.display(), e);
        }
    }

    /// Remove frozen layers no mounted volume stacks on any more
    fn release_layers(&self, candidates: &[String]) {
        let table = self.table();
        for layer in candidates {
            if table.values().any(|lowers| lowers.contains(layer)) {
                continue;
            }
            match remove_if_present(&self.frozen_dir.join(layer)) {
                Ok(()) => debug!("released frozen layer {}", layer),
                Err(e) => warn!("failed to release frozen layer {}: {}", layer, e),
            }
        }
    }

    fn frozen_layers(&self) -> Result<Vec<String>> {
        let mut layers = Vec::new();
        for dirent in fs::read_dir(&self.frozen_dir)? {
            layers.push(dirent?.file_name().to_string_lossy().into_owned());
        }
        Ok(layers)
    }
}

/// The directory holding a data path names the volume's layers
fn entry_name(path: &Path) -> Result<String> {
    path.parent()
        .and_then(Path::file_name)
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| driver_error("resolve layer", path, "no enclosing volume entry"))
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    let mut entries = fs::read_dir(path).map_err(|e| driver_error("read layer", path, e))?;
    Ok(entries.next().is_none())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(driver_error("remove", path, e)),
    }
}

fn remove_file_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(driver_error("remove", path, e)),
    }
}

impl Driver for OverlayDriver {
    fn create_volume(&self, path: &Path) -> Result<()> {
        let entry = entry_name(path)?;
        let layer = self.layers_dir.join(&entry);
        fs::create_dir(&layer).map_err(|e| driver_error("create layer", &layer, e))?;
        fs::create_dir(path).map_err(|e| driver_error("create", path, e))?;

        self.store_chain(&entry, &[])?;
        self.mount_fresh(&entry, path)?;
        self.table().insert(entry, Vec::new());
        Ok(())
    }

    fn destroy_volume(&self, path: &Path) -> Result<()> {
        let entry = entry_name(path)?;
        if fs::symlink_metadata(path).is_ok() {
            self.mounter.unmount(path)?;
        }
        remove_if_present(path)?;
        remove_if_present(&self.layers_dir.join(&entry))?;
        remove_if_present(&self.work_dir.join(&entry))?;
        remove_file_if_present(&self.chains_dir.join(&entry))?;

        // Before recovery the table is empty and the recovery sweep releases.
        let lowers = self.table().remove(&entry);
        if let Some(lowers) = lowers {
            self.release_layers(&lowers);
        }
        Ok(())
    }

    fn create_cow_layer(&self, path: &Path, parent: &Path) -> Result<()> {
        let entry = entry_name(path)?;
        let lowers = self.freeze(&entry_name(parent)?, parent)?;

        let layer = self.layers_dir.join(&entry);
        fs::create_dir(&layer).map_err(|e| driver_error("create layer", &layer, e))?;
        fs::create_dir(path).map_err(|e| driver_error("create", path, e))?;

        self.store_chain(&entry, &lowers)?;
        self.mount(&entry, &lowers, path)?;
        self.table().insert(entry, lowers);
        Ok(())
    }

    fn recover(&self, ancestries: &[Vec<PathBuf>]) -> Result<()> {
        let already_mounted = self.mounter.mounted()?;
        let mut seen: HashSet<String> = HashSet::new();
        let mut remounted = 0usize;

        for path in ancestries.iter().flatten() {
            let entry = entry_name(path)?;
            if !seen.insert(entry.clone()) {
                continue;
            }
            let lowers = self.load_chain(&entry)?;
            if !already_mounted.contains(path) {
                let upper = self.layers_dir.join(&entry);
                fs::create_dir_all(&upper).map_err(|e| driver_error("create layer", &upper, e))?;
                self.mount(&entry, &lowers, path)?;
                remounted += 1;
            }
            self.table().insert(entry, lowers);
        }

        // Layers frozen by a freeze that never completed name no chain.
        let frozen = self.frozen_layers()?;
        self.release_layers(&frozen);

        info!(
            "overlay driver recovered {} layer(s), remounted {}",
            seen.len(),
            remounted
        );
        Ok(())
    }
}
