use super::*;
use crate::driver::NaiveDriver;
use crate::errors::VolumeError;
use crate::filesystem::Filesystem;
use crate::locks::HandleLocks;
use crate::repository::{Repository, Strategy, VolumeRepository, VolumeSpec};
use crate::volume::{Properties, Ttl};
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

const QUIET: Duration = Duration::from_millis(300);

fn recording_bomberman() -> (Bomberman, Receiver<String>) {
    let (tx, rx) = channel();
    let bomberman = Bomberman::new(move |handle| {
        let _ = tx.send(handle.to_string());
        Ok(())
    });
    (bomberman, rx)
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

#[test]
fn test_timer_fires_after_remaining_time() {
    let (bomberman, rx) = recording_bomberman();
    let started = Instant::now();

    bomberman.arm("a", ms(100), ms(1000), 0);

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "a");
    assert!(started.elapsed() >= ms(100));
    // Fired timers are discarded, not rescheduled.
    assert!(rx.recv_timeout(QUIET).is_err());
}

#[test]
fn test_unlimited_volumes_are_never_strapped() {
    let (bomberman, rx) = recording_bomberman();
    let volume = Volume {
        handle: "forever".to_string(),
        path: "/volumes/live/forever/volume".into(),
        properties: Properties::new(),
        ttl: Ttl::UNLIMITED,
        expires_at: Utc::now(),
        privileged: false,
    };

    bomberman.strap(&volume);

    assert!(rx.recv_timeout(QUIET).is_err());
}

#[test]
fn test_paused_timer_never_fires() {
    let (bomberman, rx) = recording_bomberman();

    bomberman.arm("parent", ms(50), ms(200), 0);
    bomberman.pause("parent");

    assert!(rx.recv_timeout(QUIET).is_err());
}

#[test]
fn test_unpause_restarts_full_ttl() {
    let (bomberman, rx) = recording_bomberman();
    bomberman.arm("parent", ms(50), ms(400), 1);
    assert!(rx.recv_timeout(QUIET).is_err());

    let unpaused = Instant::now();
    bomberman.unpause("parent");

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "parent");
    assert!(unpaused.elapsed() >= ms(350));
}

#[test]
fn test_pauses_are_counted() {
    let (bomberman, rx) = recording_bomberman();
    bomberman.arm("parent", ms(50), ms(50), 0);
    bomberman.pause("parent");
    bomberman.pause("parent");

    bomberman.unpause("parent");
    assert!(rx.recv_timeout(QUIET).is_err());

    bomberman.unpause("parent");
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "parent");
}

#[test]
fn test_defuse_cancels_timer() {
    let (bomberman, rx) = recording_bomberman();

    bomberman.arm("a", ms(100), ms(100), 0);
    bomberman.defuse("a");

    assert!(rx.recv_timeout(QUIET).is_err());
}

#[test]
fn test_restrap_replaces_timer() {
    let (bomberman, rx) = recording_bomberman();

    bomberman.arm("a", ms(50), ms(50), 0);
    bomberman.arm("a", Duration::from_secs(60), Duration::from_secs(60), 0);

    assert!(rx.recv_timeout(QUIET).is_err());
}

#[test]
fn test_unknown_handles_are_ignored() {
    let (bomberman, rx) = recording_bomberman();

    bomberman.pause("ghost");
    bomberman.unpause("ghost");
    bomberman.defuse("ghost");
    bomberman.arm("a", ms(20), ms(20), 0);

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "a");
}

#[test]
fn test_unrepresentable_deadlines_never_fire_and_keep_the_worker_alive() {
    let (bomberman, rx) = recording_bomberman();
    let forever = Duration::from_secs(u64::MAX);

    bomberman.arm("huge", forever, forever, 0);
    bomberman.arm("paused", forever, forever, 1);
    bomberman.unpause("paused");
    bomberman.pause("huge");
    bomberman.unpause("huge");
    bomberman.arm("short", ms(50), ms(50), 0);

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "short");
    assert!(rx.recv_timeout(QUIET).is_err());
}

#[test]
fn test_detonation_errors_do_not_stop_timers() {
    let (tx, rx) = channel();
    let bomberman = Bomberman::new(move |handle| {
        let _ = tx.send(handle.to_string());
        if handle == "bad" {
            return Err(VolumeError::StorageDriver("busy".to_string()));
        }
        Ok(())
    });

    bomberman.arm("bad", ms(10), ms(10), 0);
    bomberman.arm("good", ms(100), ms(100), 0);

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "bad");
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "good");
}

#[test]
fn test_drop_stops_pending_timers() {
    let (bomberman, rx) = recording_bomberman();
    bomberman.arm("a", ms(200), ms(200), 0);

    drop(bomberman);

    assert!(rx.recv_timeout(QUIET + ms(200)).is_err());
}

fn evicting_repository(root: &Path) -> Arc<EvictingRepository<VolumeRepository>> {
    let filesystem = Filesystem::new(root, Arc::new(NaiveDriver)).unwrap();
    EvictingRepository::new(VolumeRepository::new(filesystem, Arc::new(HandleLocks::new())))
}

fn wait_until_gone(repository: &dyn Repository, handle: &str, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if repository.get_volume(handle).unwrap().is_none() {
            return true;
        }
        thread::sleep(ms(20));
    }
    false
}

fn setup() -> (TempDir, Arc<EvictingRepository<VolumeRepository>>) {
    let temp = tempdir().unwrap();
    let repository = evicting_repository(&temp.path().join("volumes"));
    (temp, repository)
}

#[test]
fn test_expired_volume_is_destroyed() {
    let (_temp, repository) = setup();
    let volume = repository
        .create_volume(VolumeSpec::new(Strategy::Empty).handle("a").ttl(Ttl::from_secs(1)))
        .unwrap();

    assert!(wait_until_gone(repository.as_ref(), "a", Duration::from_secs(5)));
    assert!(!volume.path.exists());
}

#[test]
fn test_parent_outlives_its_ttl_while_child_lives() {
    let (_temp, repository) = setup();
    repository
        .create_volume(VolumeSpec::new(Strategy::Empty).handle("parent").ttl(Ttl::from_secs(1)))
        .unwrap();
    repository
        .create_volume(VolumeSpec::new(Strategy::cow("parent")).handle("child"))
        .unwrap();

    thread::sleep(ms(1500));
    assert!(repository.get_volume("parent").unwrap().is_some());

    repository.destroy_volume("child").unwrap();
    // Re-armed with its full TTL, not fired on the spot.
    thread::sleep(ms(300));
    assert!(repository.get_volume("parent").unwrap().is_some());
    assert!(wait_until_gone(repository.as_ref(), "parent", Duration::from_secs(5)));
}

#[test]
fn test_destroying_child_refreshes_parent_expiry() {
    let (_temp, repository) = setup();
    let parent = repository
        .create_volume(VolumeSpec::new(Strategy::Empty).handle("parent").ttl(Ttl::from_secs(60)))
        .unwrap();
    repository
        .create_volume(VolumeSpec::new(Strategy::cow("parent")).handle("child"))
        .unwrap();

    thread::sleep(ms(1100));
    repository.destroy_volume("child").unwrap();

    let refreshed = repository.get_volume("parent").unwrap().unwrap();
    assert!(refreshed.expires_at > parent.expires_at);
}

#[test]
fn test_failed_child_creation_unpauses_parent() {
    let (_temp, repository) = setup();
    repository
        .create_volume(VolumeSpec::new(Strategy::Empty).handle("parent").ttl(Ttl::from_secs(1)))
        .unwrap();

    let result = repository.create_volume(VolumeSpec::new(Strategy::cow("parent")).handle("a/b"));

    assert!(matches!(result, Err(VolumeError::InvalidHandle(_))));
    assert!(wait_until_gone(repository.as_ref(), "parent", Duration::from_secs(5)));
}

#[test]
fn test_set_ttl_keeps_parent_paused() {
    let (_temp, repository) = setup();
    repository
        .create_volume(VolumeSpec::new(Strategy::Empty).handle("parent"))
        .unwrap();
    repository
        .create_volume(VolumeSpec::new(Strategy::cow("parent")).handle("child"))
        .unwrap();

    repository.set_ttl("parent", Ttl::from_secs(1)).unwrap();

    thread::sleep(ms(1500));
    assert!(repository.get_volume("parent").unwrap().is_some());
}

#[test]
fn test_set_ttl_rearms_timer() {
    let (_temp, repository) = setup();
    repository
        .create_volume(VolumeSpec::new(Strategy::Empty).handle("a").ttl(Ttl::from_secs(1)))
        .unwrap();

    repository.set_ttl("a", Ttl::UNLIMITED).unwrap();

    thread::sleep(ms(1500));
    assert!(repository.get_volume("a").unwrap().is_some());
}

#[test]
fn test_arm_existing_volumes_after_restart() {
    let temp = tempdir().unwrap();
    let root = temp.path().join("volumes");
    {
        let filesystem = Filesystem::new(&root, Arc::new(NaiveDriver)).unwrap();
        let plain = VolumeRepository::new(filesystem, Arc::new(HandleLocks::new()));
        for (handle, ttl) in [("short", 1), ("parent", 1), ("forever", 0)] {
            plain
                .create_volume(
                    VolumeSpec::new(Strategy::Empty)
                        .handle(handle)
                        .ttl(Ttl::from_secs(ttl)),
                )
                .unwrap();
        }
        plain
            .create_volume(VolumeSpec::new(Strategy::cow("parent")).handle("child"))
            .unwrap();
    }

    let repository = evicting_repository(&root);
    assert_eq!(repository.arm_existing().unwrap(), 2);

    assert!(wait_until_gone(repository.as_ref(), "short", Duration::from_secs(5)));
    assert!(repository.get_volume("parent").unwrap().is_some());
    assert!(repository.get_volume("forever").unwrap().is_some());
    assert_eq!(repository.list_volumes(&Properties::new()).unwrap().len(), 3);
}

#[test]
fn test_huge_ttl_parent_does_not_stop_eviction() {
    let (_temp, repository) = setup();
    repository
        .create_volume(
            VolumeSpec::new(Strategy::Empty)
                .handle("parent")
                .ttl(Ttl::from_secs(u64::MAX)),
        )
        .unwrap();
    repository
        .create_volume(VolumeSpec::new(Strategy::cow("parent")).handle("child"))
        .unwrap();
    repository.destroy_volume("child").unwrap();

    repository
        .create_volume(VolumeSpec::new(Strategy::Empty).handle("short").ttl(Ttl::from_secs(1)))
        .unwrap();

    assert!(wait_until_gone(repository.as_ref(), "short", Duration::from_secs(5)));
    assert!(repository.get_volume("parent").unwrap().is_some());
}

#[test]
fn test_expiry_holds_parent_whose_pause_was_missed() {
    let (_temp, repository) = setup();
    repository
        .create_volume(VolumeSpec::new(Strategy::Empty).handle("parent").ttl(Ttl::from_secs(1)))
        .unwrap();
    // Created underneath the timers, as when the pause loses a race.
    repository
        .inner()
        .create_volume(VolumeSpec::new(Strategy::cow("parent")).handle("child"))
        .unwrap();

    thread::sleep(ms(1500));
    assert!(repository.get_volume("parent").unwrap().is_some());
    assert!(repository.get_volume("child").unwrap().is_some());

    repository.destroy_volume("child").unwrap();
    assert!(wait_until_gone(repository.as_ref(), "parent", Duration::from_secs(5)));
}
