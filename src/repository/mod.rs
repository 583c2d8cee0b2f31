//! Volume repository: the operations clients perform on volumes
//!
//! [`VolumeRepository`] composes the filesystem catalog with per-handle
//! locking. It knows nothing about eviction timers; see
//! [`crate::bomberman::EvictingRepository`] for the layer that does.
//!
//! # Examples
//!
//! ```ignore
//! use baggageclaim::repository::{Repository, Strategy, VolumeSpec};
//!
//! let volume = repository.create_volume(
//!     VolumeSpec::new(Strategy::Empty).property("kind", "cache").ttl(Ttl::from_secs(60)),
//! )?;
//! ```

pub mod strategy;

pub use strategy::{Strategy, StrategySpec};

use crate::errors::{Result, VolumeError};
use crate::filesystem::{Filesystem, InitVolume, LiveVolume, TtlRecord};
use crate::locks::{lock_handle, LockManager};
use crate::namespace::{Namespacer, NoopNamespacer};
use crate::utils;
use crate::volume::{Properties, Ttl, Volume, VolumeStats};
use log::{debug, error, info};
use std::sync::Arc;
use uuid::Uuid;

/// Everything needed to create a volume
#[derive(Debug, Clone)]
pub struct VolumeSpec {
    /// Caller-chosen handle; a random one is assigned when absent
    pub handle: Option<String>,
    pub strategy: Strategy,
    pub properties: Properties,
    pub ttl: Ttl,
    /// Skip ownership remapping
    pub privileged: bool,
}

impl VolumeSpec {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            handle: None,
            strategy,
            properties: Properties::new(),
            ttl: Ttl::UNLIMITED,
            privileged: false,
        }
    }

    pub fn handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }

    pub fn property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name, value);
        self
    }

    pub fn properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }
}

/// Volume operations exposed to clients
pub trait Repository: Send + Sync {
    /// Materialize, record and promote a new volume
    fn create_volume(&self, spec: VolumeSpec) -> Result<Volume>;

    /// Live volumes whose properties contain every pair in `query`
    fn list_volumes(&self, query: &Properties) -> Result<Vec<Volume>>;

    fn get_volume(&self, handle: &str) -> Result<Option<Volume>>;

    fn volume_stats(&self, handle: &str) -> Result<VolumeStats>;

    /// Fails with `VolumeNotFound` when the handle is not live
    fn destroy_volume(&self, handle: &str) -> Result<()>;

    fn set_property(&self, handle: &str, name: &str, value: &str) -> Result<()>;

    /// Restart the volume's countdown from now with `ttl`
    fn set_ttl(&self, handle: &str, ttl: Ttl) -> Result<()>;

    /// The live parent of a copy-on-write volume
    fn volume_parent(&self, handle: &str) -> Result<Option<Volume>>;
}

/// Log storage and metadata failures with their context; client errors
/// are the caller's business.
fn failure(operation: &str, handle: &str, err: VolumeError) -> VolumeError {
    if !err.is_client_error() && !err.is_not_found() {
        error!("{} of volume {} failed: {}", operation, handle, err);
    }
    err
}

/// Repository over an on-disk catalog
pub struct VolumeRepository {
    filesystem: Filesystem,
    locks: Arc<dyn LockManager>,
    namespacer: Arc<dyn Namespacer>,
}

impl VolumeRepository {
    pub fn new(filesystem: Filesystem, locks: Arc<dyn LockManager>) -> Self {
        Self {
            filesystem,
            locks,
            namespacer: Arc::new(NoopNamespacer),
        }
    }

    /// Remap ownership of unprivileged volumes with `namespacer`
    pub fn with_namespacer(mut self, namespacer: Arc<dyn Namespacer>) -> Self {
        self.namespacer = namespacer;
        self
    }

    pub fn filesystem(&self) -> &Filesystem {
        &self.filesystem
    }

    fn live(&self, handle: &str) -> Result<LiveVolume> {
        self.filesystem
            .lookup_volume(handle)?
            .ok_or_else(|| VolumeError::VolumeNotFound(handle.to_string()))
    }

    fn hydrate(&self, live: &LiveVolume) -> Result<Volume> {
        let ttl = live.load_ttl()?;
        Ok(Volume {
            handle: live.handle().to_string(),
            path: live.data_path(),
            properties: live.load_properties()?,
            ttl: ttl.ttl,
            expires_at: ttl.expires_at,
            privileged: live.load_privileged()?,
        })
    }

    /// Like `hydrate`, but a volume destroyed underneath us reads as absent
    fn hydrate_if_live(&self, live: &LiveVolume) -> Result<Option<Volume>> {
        match self.hydrate(live) {
            Ok(volume) => Ok(Some(volume)),
            Err(_) if !live.exists() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn populate(&self, init: &InitVolume, spec: &VolumeSpec) -> Result<()> {
        init.store_properties(&spec.properties)?;
        init.store_ttl(&TtlRecord::starting_now(spec.ttl))?;
        init.store_privileged(spec.privileged)?;
        if !spec.privileged {
            self.namespacer.namespace(&init.data_path())?;
        }
        Ok(())
    }

    fn create(&self, handle: &str, spec: &VolumeSpec) -> Result<Volume> {
        let parent = spec.strategy.parent_handle().filter(|p| !p.is_empty());
        if parent == Some(handle) {
            return Err(VolumeError::ParentNotFound(handle.to_string()));
        }

        // Leases are taken in handle order so crossed creations cannot deadlock.
        let (first, second) = match parent {
            Some(parent) if parent < handle => (parent, Some(handle)),
            Some(parent) => (handle, Some(parent)),
            None => (handle, None),
        };
        let _first = lock_handle(self.locks.as_ref(), first);
        let _second = second.map(|h| lock_handle(self.locks.as_ref(), h));

        if self.filesystem.lookup_volume(handle)?.is_some() {
            return Err(VolumeError::VolumeExists(handle.to_string()));
        }

        let init = spec.strategy.materialize(&self.filesystem, handle)?;

        if let Err(e) = self.populate(&init, spec) {
            if let Err(rollback) = init.destroy() {
                error!("rollback of volume {} failed: {}", handle, rollback);
            }
            return Err(e);
        }

        let live = init.initialize()?;
        self.hydrate(&live)
    }
}

impl Repository for VolumeRepository {
    fn create_volume(&self, spec: VolumeSpec) -> Result<Volume> {
        let handle = match &spec.handle {
            Some(handle) => handle.clone(),
            None => Uuid::new_v4().to_string(),
        };
        utils::validate_handle(&handle)?;

        let volume = self
            .create(&handle, &spec)
            .map_err(|e| failure("create", &handle, e))?;
        info!(
            "created volume {} ({}, ttl {})",
            volume.handle, spec.strategy, volume.ttl
        );
        Ok(volume)
    }

    fn list_volumes(&self, query: &Properties) -> Result<Vec<Volume>> {
        let mut volumes = Vec::new();
        for live in self.filesystem.list_volumes()? {
            let Some(volume) = self
                .hydrate_if_live(&live)
                .map_err(|e| failure("list", live.handle(), e))?
            else {
                continue;
            };
            if volume.properties.has_properties(query) {
                volumes.push(volume);
            }
        }
        Ok(volumes)
    }

    fn get_volume(&self, handle: &str) -> Result<Option<Volume>> {
        match self.filesystem.lookup_volume(handle)? {
            Some(live) => self
                .hydrate_if_live(&live)
                .map_err(|e| failure("get", handle, e)),
            None => Ok(None),
        }
    }

    fn volume_stats(&self, handle: &str) -> Result<VolumeStats> {
        let live = self.live(handle)?;
        let size_in_bytes = self
            .filesystem
            .volume_size(&live)
            .map_err(|e| failure("stats", handle, e))?;
        Ok(VolumeStats { size_in_bytes })
    }

    fn destroy_volume(&self, handle: &str) -> Result<()> {
        let _guard = lock_handle(self.locks.as_ref(), handle);
        let live = self.live(handle)?;
        live.destroy().map_err(|e| failure("destroy", handle, e))?;
        info!("destroyed volume {}", handle);
        Ok(())
    }

    fn set_property(&self, handle: &str, name: &str, value: &str) -> Result<()> {
        let _guard = lock_handle(self.locks.as_ref(), handle);
        let live = self.live(handle)?;
        let mut properties = live
            .load_properties()
            .map_err(|e| failure("set property", handle, e))?;
        properties.insert(name, value);
        live.store_properties(&properties)
            .map_err(|e| failure("set property", handle, e))?;
        debug!("set property {}={} on volume {}", name, value, handle);
        Ok(())
    }

    fn set_ttl(&self, handle: &str, ttl: Ttl) -> Result<()> {
        let _guard = lock_handle(self.locks.as_ref(), handle);
        let live = self.live(handle)?;
        live.store_ttl(&TtlRecord::starting_now(ttl))
            .map_err(|e| failure("set ttl", handle, e))?;
        debug!("set ttl of volume {} to {}", handle, ttl);
        Ok(())
    }

    fn volume_parent(&self, handle: &str) -> Result<Option<Volume>> {
        let live = self.live(handle)?;
        match live.parent().map_err(|e| failure("parent", handle, e))? {
            Some(parent) => self
                .hydrate_if_live(&parent)
                .map_err(|e| failure("parent", handle, e)),
            None => Ok(None),
        }
    }
}
