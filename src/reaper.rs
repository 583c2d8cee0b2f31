//! Periodic sweep destroying expired volumes nothing layers on
//!
//! The reaper is the backstop for the per-volume timers: anything a timer
//! missed, for example across a restart, is caught by the next sweep.

use crate::errors::{Result, VolumeError};
use crate::repository::Repository;
use crate::volume::Properties;
use chrono::Utc;
use log::{debug, error, info};
use std::collections::HashSet;
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Sweeps a repository for expired, childless volumes
#[derive(Clone)]
pub struct Reaper {
    repository: Arc<dyn Repository>,
}

impl Reaper {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }

    /// Destroy every volume with a finite TTL that has run out and that no
    /// live volume names as its parent. Returns how many were destroyed.
    ///
    /// Every candidate is attempted; failures are reported together.
    pub fn reap(&self) -> Result<usize> {
        let volumes = self.repository.list_volumes(&Properties::new())?;

        let mut parents = HashSet::new();
        for volume in &volumes {
            match self.repository.volume_parent(&volume.handle) {
                Ok(Some(parent)) => {
                    parents.insert(parent.handle);
                }
                Ok(None) | Err(VolumeError::VolumeNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let now = Utc::now();
        let mut reaped = 0;
        let mut failures = Vec::new();
        for volume in volumes {
            if !volume.is_expired(now) || parents.contains(&volume.handle) {
                continue;
            }
            // A child destroyed since listing refreshes its parent's expiry.
            match self.repository.get_volume(&volume.handle) {
                Ok(Some(current)) if current.is_expired(Utc::now()) => {}
                Ok(_) => continue,
                Err(e) => {
                    failures.push(format!("{}: {}", volume.handle, e));
                    continue;
                }
            }
            match self.repository.destroy_volume(&volume.handle) {
                Ok(()) => {
                    debug!("reaped expired volume {}", volume.handle);
                    reaped += 1;
                }
                // Its timer got there first.
                Err(VolumeError::VolumeNotFound(_)) => {}
                Err(e) => failures.push(format!("{}: {}", volume.handle, e)),
            }
        }

        if failures.is_empty() {
            Ok(reaped)
        } else {
            Err(VolumeError::Reap(failures))
        }
    }

    /// Sweep every `interval` on a background thread
    pub fn spawn(self, interval: Duration) -> ReaperHandle {
        let (stop, stopped) = channel::<()>();
        let worker = thread::spawn(move || loop {
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => match self.reap() {
                    Ok(0) => debug!("reaper sweep found nothing to reap"),
                    Ok(reaped) => info!("reaped {} expired volumes", reaped),
                    Err(e) => error!("reaper sweep failed: {}", e),
                },
                _ => break,
            }
        });

        ReaperHandle {
            stop: Some(stop),
            worker: Some(worker),
        }
    }
}

/// Running reaper thread; stopped and joined on drop
pub struct ReaperHandle {
    stop: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl ReaperHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::NaiveDriver;
    use crate::filesystem::Filesystem;
    use crate::locks::HandleLocks;
    use crate::repository::{Strategy, VolumeRepository, VolumeSpec};
    use crate::test_support::RecordingDriver;
    use crate::volume::Ttl;
    use crate::Driver;
    use std::path::Path;
    use std::time::Instant;
    use tempfile::tempdir;

    fn repository(root: &Path, driver: Arc<dyn Driver>) -> Arc<dyn Repository> {
        let filesystem = Filesystem::new(root, driver).unwrap();
        Arc::new(VolumeRepository::new(filesystem, Arc::new(HandleLocks::new())))
    }

    fn create(repository: &dyn Repository, handle: &str, strategy: Strategy, ttl: u64) {
        repository
            .create_volume(VolumeSpec::new(strategy).handle(handle).ttl(Ttl::from_secs(ttl)))
            .unwrap();
    }

    #[test]
    fn test_unlimited_volumes_are_never_reaped() {
        let temp = tempdir().unwrap();
        let repository = repository(temp.path(), Arc::new(NaiveDriver));
        create(repository.as_ref(), "forever", Strategy::Empty, 0);

        let reaper = Reaper::new(repository.clone());
        thread::sleep(Duration::from_millis(1100));

        assert_eq!(reaper.reap().unwrap(), 0);
        assert!(repository.get_volume("forever").unwrap().is_some());
    }

    #[test]
    fn test_expired_volumes_are_reaped() {
        let temp = tempdir().unwrap();
        let repository = repository(temp.path(), Arc::new(NaiveDriver));
        create(repository.as_ref(), "old", Strategy::Empty, 1);
        create(repository.as_ref(), "fresh", Strategy::Empty, 3600);

        let reaper = Reaper::new(repository.clone());
        assert_eq!(reaper.reap().unwrap(), 0);

        thread::sleep(Duration::from_millis(1100));
        assert_eq!(reaper.reap().unwrap(), 1);
        assert!(repository.get_volume("old").unwrap().is_none());
        assert!(repository.get_volume("fresh").unwrap().is_some());
    }

    #[test]
    fn test_parents_of_live_children_are_kept() {
        let temp = tempdir().unwrap();
        let repository = repository(temp.path(), Arc::new(NaiveDriver));
        create(repository.as_ref(), "parent", Strategy::Empty, 1);
        create(repository.as_ref(), "child", Strategy::cow("parent"), 0);
        let reaper = Reaper::new(repository.clone());

        thread::sleep(Duration::from_millis(1100));
        assert_eq!(reaper.reap().unwrap(), 0);
        assert!(repository.get_volume("parent").unwrap().is_some());

        repository.destroy_volume("child").unwrap();
        assert_eq!(reaper.reap().unwrap(), 1);
        assert!(repository.get_volume("parent").unwrap().is_none());
    }

    #[test]
    fn test_failures_are_aggregated() {
        let temp = tempdir().unwrap();
        let driver = Arc::new(RecordingDriver::default());
        let repository = repository(temp.path(), driver.clone());
        for handle in ["a", "b", "c"] {
            create(repository.as_ref(), handle, Strategy::Empty, 1);
        }
        driver.fail_destroy_of("a");
        driver.fail_destroy_of("b");

        thread::sleep(Duration::from_millis(1100));
        let err = Reaper::new(repository.clone()).reap().unwrap_err();

        match err {
            VolumeError::Reap(failures) => {
                assert_eq!(failures.len(), 2);
                assert!(failures.iter().any(|f| f.starts_with("a: ")));
                assert!(failures.iter().any(|f| f.starts_with("b: ")));
            }
            other => panic!("unexpected error: {}", other),
        }
        // The healthy candidate was still reaped.
        assert!(repository.get_volume("c").unwrap().is_none());
    }

    #[test]
    fn test_spawned_reaper_sweeps_until_stopped() {
        let temp = tempdir().unwrap();
        let repository = repository(temp.path(), Arc::new(NaiveDriver));
        create(repository.as_ref(), "old", Strategy::Empty, 1);

        let handle = Reaper::new(repository.clone()).spawn(Duration::from_millis(100));
        let deadline = Instant::now() + Duration::from_secs(5);
        while repository.get_volume("old").unwrap().is_some() {
            assert!(Instant::now() < deadline, "volume was never reaped");
            thread::sleep(Duration::from_millis(50));
        }

        handle.stop();
        create(repository.as_ref(), "later", Strategy::Empty, 1);
        thread::sleep(Duration::from_millis(1300));
        assert!(repository.get_volume("later").unwrap().is_some());
    }
}
