//! Engine controller: wires storage, locking, eviction and reaping

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::info;

use crate::bomberman::EvictingRepository;
use crate::driver::DriverKind;
use crate::errors::{Result, VolumeError};
use crate::filesystem::{Filesystem, RecoveryReport};
use crate::locks::HandleLocks;
use crate::namespace::{Namespacer, NoopNamespacer};
use crate::reaper::{Reaper, ReaperHandle};
use crate::repository::{Repository, VolumeRepository};
use crate::utils;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Root of the `init/`, `live/` and `dead/` staging directories
    pub volumes_dir: PathBuf,
    /// Storage driver
    pub driver: DriverKind,
    /// Layer and work directories of the overlay driver
    pub overlays_dir: PathBuf,
    /// Time between reaper sweeps; `None` disables the reaper
    pub reap_interval: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            volumes_dir: PathBuf::from("/var/lib/baggageclaim/volumes"),
            driver: DriverKind::Naive,
            overlays_dir: PathBuf::from("/var/lib/baggageclaim/overlays"),
            reap_interval: Some(Duration::from_secs(10)),
        }
    }
}

impl EngineConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.driver.requires_root() {
            utils::require_root(&format!("the {} driver", self.driver))?;
        }

        self.validate_invariants()
    }

    fn validate_invariants(&self) -> Result<()> {
        if self.volumes_dir.as_os_str().is_empty() {
            return Err(VolumeError::InvalidConfig(
                "Volumes directory cannot be empty".to_string(),
            ));
        }

        if self.driver == DriverKind::Overlay && self.overlays_dir.as_os_str().is_empty() {
            return Err(VolumeError::InvalidConfig(
                "Overlay driver needs an overlays directory".to_string(),
            ));
        }

        if self.reap_interval == Some(Duration::ZERO) {
            return Err(VolumeError::InvalidConfig(
                "Reap interval must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder pattern for engine startup
pub struct EngineBuilder {
    config: EngineConfig,
    namespacer: Arc<dyn Namespacer>,
}

impl EngineBuilder {
    /// Create new builder
    pub fn new(volumes_dir: impl AsRef<Path>) -> Self {
        Self {
            config: EngineConfig {
                volumes_dir: volumes_dir.as_ref().to_path_buf(),
                ..Default::default()
            },
            namespacer: Arc::new(NoopNamespacer),
        }
    }

    /// Start from an existing configuration
    pub fn from_config(config: EngineConfig) -> Self {
        Self {
            config,
            namespacer: Arc::new(NoopNamespacer),
        }
    }

    /// Set storage driver
    pub fn driver(mut self, driver: DriverKind) -> Self {
        self.config.driver = driver;
        self
    }

    /// Set storage driver by name
    pub fn driver_str(self, name: &str) -> Result<Self> {
        let driver = name.parse()?;
        Ok(self.driver(driver))
    }

    /// Set overlay layers directory
    pub fn overlays_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.config.overlays_dir = path.as_ref().to_path_buf();
        self
    }

    /// Set reaper interval
    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.config.reap_interval = Some(interval);
        self
    }

    /// Run without the periodic reaper
    pub fn without_reaper(mut self) -> Self {
        self.config.reap_interval = None;
        self
    }

    /// Set ownership remapping for unprivileged volumes
    pub fn namespacer(mut self, namespacer: Arc<dyn Namespacer>) -> Self {
        self.namespacer = namespacer;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Recover existing state and start the engine
    pub fn start(self) -> Result<Engine> {
        self.config.validate()?;
        Engine::launch(self.config, self.namespacer)
    }
}

/// A running volume engine.
///
/// Dropping it stops the reaper and the expiry timers; volumes stay on disk
/// and are picked up again by the next start.
pub struct Engine {
    reaper: Option<ReaperHandle>,
    repository: Arc<EvictingRepository<VolumeRepository>>,
    recovery: RecoveryReport,
    config: EngineConfig,
}

impl Engine {
    /// Validate `config`, recover existing state and start
    pub fn start(config: EngineConfig) -> Result<Self> {
        EngineBuilder::from_config(config).start()
    }

    fn launch(config: EngineConfig, namespacer: Arc<dyn Namespacer>) -> Result<Self> {
        let driver = config.driver.build(&config.overlays_dir)?;
        let filesystem = Filesystem::new(&config.volumes_dir, driver)?;
        let recovery = filesystem.recover()?;

        let volumes = VolumeRepository::new(filesystem, Arc::new(HandleLocks::new()))
            .with_namespacer(namespacer);
        let repository = EvictingRepository::new(volumes);
        repository.arm_existing()?;

        let reaper = config.reap_interval.map(|interval| {
            let target: Arc<dyn Repository> = repository.clone();
            Reaper::new(target).spawn(interval)
        });

        info!(
            "engine started on {} with {} driver ({} volumes)",
            config.volumes_dir.display(),
            config.driver,
            recovery.live_volumes
        );
        Ok(Self {
            reaper,
            repository,
            recovery,
            config,
        })
    }

    /// Volume operations, with expiry timers kept in step
    pub fn repository(&self) -> &Arc<EvictingRepository<VolumeRepository>> {
        &self.repository
    }

    pub fn filesystem(&self) -> &Filesystem {
        self.repository.inner().filesystem()
    }

    /// What startup recovery found
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one reaper sweep now
    pub fn reap(&self) -> Result<usize> {
        let target: Arc<dyn Repository> = self.repository.clone();
        Reaper::new(target).reap()
    }

    /// Stop background threads
    pub fn shutdown(mut self) {
        if let Some(reaper) = self.reaper.take() {
            reaper.stop();
        }
        info!("engine on {} stopped", self.config.volumes_dir.display());
    }
}
