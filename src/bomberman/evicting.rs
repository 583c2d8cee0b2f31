use super::Bomberman;
use crate::errors::{Result, VolumeError};
use crate::repository::{Repository, VolumeSpec};
use crate::volume::{Properties, Ttl, Volume, VolumeStats};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// A repository whose volumes are destroyed when their TTL runs out.
///
/// Timers are kept in step with the wrapped repository: creation arms the
/// new volume and pauses its parent, destruction defuses the volume and
/// lifts its parent's pause, and a TTL change re-arms from the persisted
/// record. Expiry destroys through this repository, so the same bookkeeping
/// applies.
pub struct EvictingRepository<R> {
    inner: R,
    bomberman: Bomberman,
}

impl<R: Repository + 'static> EvictingRepository<R> {
    pub fn new(inner: R) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let this = this.clone();
            let bomberman = Bomberman::new(move |handle| match this.upgrade() {
                Some(repository) => repository.expire(handle),
                None => Ok(()),
            });
            Self { inner, bomberman }
        })
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// Arm timers for volumes that already exist, e.g. after a restart.
    /// Returns how many timers were armed.
    pub fn arm_existing(&self) -> Result<usize> {
        let volumes = self.inner.list_volumes(&Properties::new())?;
        let children = self.child_counts(&volumes)?;

        let mut armed = 0;
        for volume in volumes.iter().filter(|v| !v.ttl.is_unlimited()) {
            let count = children.get(&volume.handle).copied().unwrap_or(0);
            self.bomberman.strap_with_children(volume, count);
            armed += 1;
        }
        info!("armed {} timers for {} existing volumes", armed, volumes.len());
        Ok(armed)
    }

    fn child_counts(&self, volumes: &[Volume]) -> Result<HashMap<String, usize>> {
        let mut counts = HashMap::new();
        for volume in volumes {
            match self.inner.volume_parent(&volume.handle) {
                Ok(Some(parent)) => *counts.entry(parent.handle).or_insert(0) += 1,
                Ok(None) | Err(VolumeError::VolumeNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(counts)
    }

    fn live_children(&self, handle: &str) -> Result<usize> {
        let volumes = self.inner.list_volumes(&Properties::new())?;
        Ok(self
            .child_counts(&volumes)?
            .get(handle)
            .copied()
            .unwrap_or(0))
    }

    /// Re-arm `handle` from its persisted TTL record
    fn rearm(&self, handle: &str) -> Result<()> {
        if let Some(volume) = self.inner.get_volume(handle)? {
            let children = self.live_children(handle)?;
            self.bomberman.strap_with_children(&volume, children);
        }
        Ok(())
    }

    fn expire(&self, handle: &str) -> Result<()> {
        // A pause can be lost to a strap racing a child's creation.
        let children = self.live_children(handle)?;
        if children > 0 {
            debug!(
                "volume {} expired with {} live children, holding it",
                handle, children
            );
            self.rearm(handle)?;
            return Ok(());
        }

        info!("volume {} expired", handle);
        match self.destroy_volume(handle) {
            Err(VolumeError::VolumeNotFound(_)) => Ok(()),
            other => other,
        }
    }
}

impl<R: Repository + 'static> Repository for EvictingRepository<R> {
    fn create_volume(&self, spec: VolumeSpec) -> Result<Volume> {
        let parent = spec
            .strategy
            .parent_handle()
            .filter(|parent| !parent.is_empty())
            .map(str::to_string);
        if let Some(parent) = &parent {
            self.bomberman.pause(parent);
        }

        match self.inner.create_volume(spec) {
            Ok(volume) => {
                self.bomberman.strap(&volume);
                Ok(volume)
            }
            Err(e) => {
                if let Some(parent) = &parent {
                    self.bomberman.unpause(parent);
                }
                Err(e)
            }
        }
    }

    fn list_volumes(&self, query: &Properties) -> Result<Vec<Volume>> {
        self.inner.list_volumes(query)
    }

    fn get_volume(&self, handle: &str) -> Result<Option<Volume>> {
        self.inner.get_volume(handle)
    }

    fn volume_stats(&self, handle: &str) -> Result<VolumeStats> {
        self.inner.volume_stats(handle)
    }

    fn destroy_volume(&self, handle: &str) -> Result<()> {
        let parent = self.inner.volume_parent(handle)?;
        self.bomberman.defuse(handle);

        // The parent's persisted expiry restarts with its timer.
        if let Some(parent) = parent.as_ref().filter(|p| !p.ttl.is_unlimited()) {
            if let Err(e) = self.inner.set_ttl(&parent.handle, parent.ttl) {
                warn!("failed to refresh expiry of parent {}: {}", parent.handle, e);
            }
        }

        if let Err(e) = self.inner.destroy_volume(handle) {
            if let Err(rearm) = self.rearm(handle) {
                warn!("failed to re-arm volume {}: {}", handle, rearm);
            }
            return Err(e);
        }

        if let Some(parent) = parent {
            self.bomberman.unpause(&parent.handle);
        }
        Ok(())
    }

    fn set_property(&self, handle: &str, name: &str, value: &str) -> Result<()> {
        self.inner.set_property(handle, name, value)
    }

    fn set_ttl(&self, handle: &str, ttl: Ttl) -> Result<()> {
        self.bomberman.defuse(handle);
        let result = self.inner.set_ttl(handle, ttl);
        self.rearm(handle)?;
        result
    }

    fn volume_parent(&self, handle: &str) -> Result<Option<Volume>> {
        self.inner.volume_parent(handle)
    }
}
