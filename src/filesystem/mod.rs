//! Filesystem layout: staged volume directories and their metadata
//!
//! Every volume lives in one of three staging directories under the
//! volumes root:
//!
//! ```text
//! {root}/
//! ├── init/{handle}/     # being created, never listed
//! ├── live/{handle}/     # visible to lookup and listing
//! └── dead/{handle}/     # being torn down
//!     ├── volume/            # data path handed to the driver
//!     ├── parent -> {root}/live/{parent}   (copy-on-write children only)
//!     ├── properties.json
//!     ├── ttl.json
//!     ├── privileged.json
//!     └── state.json
//! ```
//!
//! Moving between stages is a single `rename(2)`, so a lister never sees a
//! half promoted volume and a restart can rebuild state from directory
//! presence alone.

pub mod metadata;

pub use metadata::TtlRecord;

use crate::driver::Driver;
use crate::errors::{Result, VolumeError};
use crate::utils;
use crate::volume::{Properties, VolumeState};
use log::{debug, error, info, warn};
use metadata::{
    read_optional_record, read_record, write_record, StateRecord, DATA_DIR, PARENT_LINK,
    PRIVILEGED_FILE, PROPERTIES_FILE, STATE_FILE, TTL_FILE,
};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const INIT_DIR: &str = "init";
const LIVE_DIR: &str = "live";
const DEAD_DIR: &str = "dead";

struct Layout {
    init_dir: PathBuf,
    live_dir: PathBuf,
    dead_dir: PathBuf,
    driver: Arc<dyn Driver>,
}

impl Layout {
    /// Reserve `init/{handle}`
    fn init_entry(&self, handle: &str) -> Result<PathBuf> {
        utils::validate_handle(handle)?;
        let dir = self.init_dir.join(handle);
        match fs::create_dir(&dir) {
            Ok(()) => Ok(dir),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(VolumeError::VolumeExists(handle.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn live_volume(self: &Arc<Self>, handle: &str) -> LiveVolume {
        LiveVolume {
            handle: handle.to_string(),
            dir: self.live_dir.join(handle),
            layout: Arc::clone(self),
        }
    }

    fn lookup(self: &Arc<Self>, handle: &str) -> Result<Option<LiveVolume>> {
        if utils::validate_handle(handle).is_err() {
            return Ok(None);
        }
        match fs::symlink_metadata(self.live_dir.join(handle)) {
            Ok(meta) if meta.is_dir() => Ok(Some(self.live_volume(handle))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Release the driver storage of a staged entry and remove the entry
    fn teardown(&self, dir: &Path) -> Result<()> {
        self.driver.destroy_volume(&dir.join(DATA_DIR))?;
        match fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Outcome of [`Filesystem::recover`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Interrupted destructions finished from `dead/`
    pub finished_teardowns: usize,
    /// Never-promoted volumes discarded from `init/`
    pub discarded_orphans: usize,
    /// Live volumes whose state record was rewritten
    pub repaired_states: usize,
    /// Live volumes handed to the driver for recovery
    pub live_volumes: usize,
}

/// Handle-indexed volume catalog on top of a storage driver
pub struct Filesystem {
    root: PathBuf,
    layout: Arc<Layout>,
}

impl Filesystem {
    /// Open (creating if needed) the volumes directory at `root`
    pub fn new(root: impl AsRef<Path>, driver: Arc<dyn Driver>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let layout = Layout {
            init_dir: root.join(INIT_DIR),
            live_dir: root.join(LIVE_DIR),
            dead_dir: root.join(DEAD_DIR),
            driver,
        };
        for dir in [&layout.init_dir, &layout.live_dir, &layout.dead_dir] {
            fs::create_dir_all(dir)?;
        }

        Ok(Self {
            root,
            layout: Arc::new(layout),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.layout.driver
    }

    /// Create an empty volume in the `init/` stage
    pub fn new_volume(&self, handle: &str) -> Result<InitVolume> {
        let dir = self.layout.init_entry(handle)?;
        let volume = InitVolume {
            handle: handle.to_string(),
            dir,
            layout: Arc::clone(&self.layout),
        };

        let created = self
            .layout
            .driver
            .create_volume(&volume.data_path())
            .and_then(|()| volume.store_state(VolumeState::Creating));
        if let Err(e) = created {
            volume.rollback("new volume");
            return Err(e);
        }

        debug!("created volume {} in init stage", handle);
        Ok(volume)
    }

    pub fn lookup_volume(&self, handle: &str) -> Result<Option<LiveVolume>> {
        self.layout.lookup(handle)
    }

    /// Every volume currently in the `live/` stage
    pub fn list_volumes(&self) -> Result<Vec<LiveVolume>> {
        let mut volumes = Vec::new();
        for entry in fs::read_dir(&self.layout.live_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Ok(handle) = entry.file_name().into_string() else {
                continue;
            };
            if handle.starts_with('.') {
                continue;
            }
            volumes.push(self.layout.live_volume(&handle));
        }
        Ok(volumes)
    }

    /// Driver-reported size of a live volume
    pub fn volume_size(&self, volume: &LiveVolume) -> Result<u64> {
        self.layout.driver.volume_size(&volume.data_path())
    }

    /// Bring the staging directories back to a consistent state after a
    /// restart, then let the driver rebuild its own state.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for dir in entries(&self.layout.dead_dir)? {
            match self.layout.teardown(&dir) {
                Ok(()) => report.finished_teardowns += 1,
                Err(e) => error!("failed to finish teardown of {}: {}", dir.display(), e),
            }
        }

        for dir in entries(&self.layout.init_dir)? {
            warn!("discarding volume never promoted: {}", dir.display());
            match self.layout.teardown(&dir) {
                Ok(()) => report.discarded_orphans += 1,
                Err(e) => error!("failed to discard {}: {}", dir.display(), e),
            }
        }

        let volumes = self.list_volumes()?;
        let mut ancestries = Vec::with_capacity(volumes.len());
        for volume in &volumes {
            let state = volume.load_state().ok();
            if state != Some(VolumeState::Active) {
                warn!(
                    "volume {} is live but recorded as {:?}, marking active",
                    volume.handle(),
                    state
                );
                volume.store_state(VolumeState::Active)?;
                report.repaired_states += 1;
            }

            let chain = volume
                .ancestry()?
                .iter()
                .map(LiveVolume::data_path)
                .collect::<Vec<_>>();
            ancestries.push(chain);
        }
        report.live_volumes = volumes.len();

        self.layout.driver.recover(&ancestries)?;

        info!(
            "recovered {}: {} live, {} teardowns finished, {} orphans discarded",
            self.root.display(),
            report.live_volumes,
            report.finished_teardowns,
            report.discarded_orphans
        );
        Ok(report)
    }
}

fn entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            found.push(entry.path());
        }
    }
    Ok(found)
}

/// A volume under construction in the `init/` stage
pub struct InitVolume {
    handle: String,
    dir: PathBuf,
    layout: Arc<Layout>,
}

impl InitVolume {
    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn data_path(&self) -> PathBuf {
        self.dir.join(DATA_DIR)
    }

    pub fn store_properties(&self, properties: &Properties) -> Result<()> {
        write_record(&self.dir, PROPERTIES_FILE, properties)
    }

    pub fn store_ttl(&self, ttl: &TtlRecord) -> Result<()> {
        write_record(&self.dir, TTL_FILE, ttl)
    }

    pub fn store_privileged(&self, privileged: bool) -> Result<()> {
        write_record(&self.dir, PRIVILEGED_FILE, &privileged)
    }

    fn store_state(&self, state: VolumeState) -> Result<()> {
        write_record(&self.dir, STATE_FILE, &StateRecord { state })
    }

    fn link_parent(&self, parent: &LiveVolume) -> Result<()> {
        symlink(&parent.dir, self.dir.join(PARENT_LINK)).map_err(|e| {
            VolumeError::Metadata(format!("link parent of {}: {}", self.handle, e))
        })
    }

    /// Promote into `live/`, making the volume visible.
    ///
    /// On failure the volume is torn down before the error is returned.
    pub fn initialize(self) -> Result<LiveVolume> {
        let live = self.layout.live_dir.join(&self.handle);
        if fs::symlink_metadata(&live).is_ok() {
            self.rollback("initialize");
            return Err(VolumeError::VolumeExists(self.handle));
        }
        if let Err(e) = fs::rename(&self.dir, &live) {
            self.rollback("initialize");
            return Err(e.into());
        }

        let volume = self.layout.live_volume(&self.handle);
        if let Err(e) = volume.store_state(VolumeState::Active) {
            warn!("volume {} promoted but state not updated: {}", self.handle, e);
        }
        debug!("promoted volume {} to live", self.handle);
        Ok(volume)
    }

    /// Tear the half-built volume down
    pub fn destroy(self) -> Result<()> {
        self.layout.teardown(&self.dir)
    }

    fn rollback(&self, operation: &str) {
        if let Err(e) = self.layout.teardown(&self.dir) {
            error!(
                "rollback of volume {} after failed {} also failed: {}",
                self.handle, operation, e
            );
        }
    }
}

/// A promoted, externally visible volume
#[derive(Clone)]
pub struct LiveVolume {
    handle: String,
    dir: PathBuf,
    layout: Arc<Layout>,
}

impl std::fmt::Debug for LiveVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveVolume")
            .field("handle", &self.handle)
            .field("dir", &self.dir)
            .finish()
    }
}

impl LiveVolume {
    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn data_path(&self) -> PathBuf {
        self.dir.join(DATA_DIR)
    }

    /// Whether the entry is still in the `live/` stage
    pub fn exists(&self) -> bool {
        self.dir.is_dir()
    }

    pub fn load_properties(&self) -> Result<Properties> {
        read_record(&self.dir, PROPERTIES_FILE)
    }

    pub fn store_properties(&self, properties: &Properties) -> Result<()> {
        write_record(&self.dir, PROPERTIES_FILE, properties)
    }

    pub fn load_ttl(&self) -> Result<TtlRecord> {
        read_record(&self.dir, TTL_FILE)
    }

    pub fn store_ttl(&self, ttl: &TtlRecord) -> Result<()> {
        write_record(&self.dir, TTL_FILE, ttl)
    }

    /// Volumes created before the record existed are unprivileged
    pub fn load_privileged(&self) -> Result<bool> {
        Ok(read_optional_record(&self.dir, PRIVILEGED_FILE)?.unwrap_or(false))
    }

    pub fn load_state(&self) -> Result<VolumeState> {
        read_record::<StateRecord>(&self.dir, STATE_FILE).map(|record| record.state)
    }

    fn store_state(&self, state: VolumeState) -> Result<()> {
        write_record(&self.dir, STATE_FILE, &StateRecord { state })
    }

    /// Handle named by the parent link, whether or not that parent is live
    pub fn parent_handle(&self) -> Result<Option<String>> {
        match fs::read_link(self.dir.join(PARENT_LINK)) {
            Ok(target) => Ok(target
                .file_name()
                .and_then(|name| name.to_str())
                .map(str::to_string)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(VolumeError::Metadata(format!(
                "read parent link of {}: {}",
                self.handle, e
            ))),
        }
    }

    /// The parent volume, if there is one and it is still live
    pub fn parent(&self) -> Result<Option<LiveVolume>> {
        match self.parent_handle()? {
            Some(handle) => self.layout.lookup(&handle),
            None => Ok(None),
        }
    }

    /// This volume and its live ancestors, oldest first
    pub fn ancestry(&self) -> Result<Vec<LiveVolume>> {
        let mut chain = vec![self.clone()];
        let mut visited = HashSet::from([self.handle.clone()]);
        let mut current = self.clone();

        while let Some(parent) = current.parent()? {
            if !visited.insert(parent.handle.clone()) {
                return Err(VolumeError::Metadata(format!(
                    "parent links of {} form a cycle at {}",
                    self.handle, parent.handle
                )));
            }
            chain.push(parent.clone());
            current = parent;
        }

        chain.reverse();
        Ok(chain)
    }

    /// Start a copy-on-write child of this volume in the `init/` stage
    pub fn new_subvolume(&self, handle: &str) -> Result<InitVolume> {
        let dir = self.layout.init_entry(handle)?;
        let child = InitVolume {
            handle: handle.to_string(),
            dir,
            layout: Arc::clone(&self.layout),
        };

        let created = self
            .layout
            .driver
            .create_cow_layer(&child.data_path(), &self.data_path())
            .and_then(|()| child.link_parent(self))
            .and_then(|()| child.store_state(VolumeState::Creating));
        if let Err(e) = created {
            child.rollback("new subvolume");
            return Err(e);
        }

        debug!("created volume {} as child of {}", handle, self.handle);
        Ok(child)
    }

    /// Move to `dead/`, release driver storage, remove the entry
    pub fn destroy(self) -> Result<()> {
        let dead = self.layout.dead_dir.join(&self.handle);
        if fs::symlink_metadata(&dead).is_ok() {
            warn!("finishing earlier teardown of {}", self.handle);
            self.layout.teardown(&dead)?;
        }

        fs::rename(&self.dir, &dead)?;
        if let Err(e) = write_record(&dead, STATE_FILE, &StateRecord {
            state: VolumeState::Destroyed,
        }) {
            warn!("volume {} moved to teardown but state not updated: {}", self.handle, e);
        }

        self.layout.teardown(&dead)
    }
}
