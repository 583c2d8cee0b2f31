//! Eviction scheduler: one expiry timer per volume
//!
//! A single worker thread owns every timer and is driven by commands over
//! an `mpsc` channel. Between commands it sleeps until the nearest deadline
//! with `recv_timeout`, so a timer firing and a command arriving are handled
//! by the same loop and never race each other.
//!
//! Pauses are counted: a parent is paused once per live child and its
//! countdown only restarts, from its full TTL, when the last pause is lifted.

mod evicting;

pub use evicting::EvictingRepository;

use crate::errors::Result;
use crate::volume::Volume;
use chrono::Utc;
use log::{debug, error, trace, warn};
use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Called with the handle of every volume whose timer runs out
pub type Detonator = Box<dyn Fn(&str) -> Result<()> + Send>;

enum Command {
    Strap {
        handle: String,
        remaining: Duration,
        ttl: Duration,
        pauses: usize,
    },
    Pause(String),
    Unpause(String),
    Defuse(String),
    Shutdown,
}

struct Timer {
    /// `None` while paused, or when the deadline lies beyond what `Instant`
    /// can represent
    deadline: Option<Instant>,
    ttl: Duration,
    pauses: usize,
}

/// Handle to the timer thread; dropping it stops the thread
pub struct Bomberman {
    commands: Sender<Command>,
    worker: Option<JoinHandle<()>>,
}

impl Bomberman {
    /// Start the timer thread. `detonate` runs on that thread.
    pub fn new<F>(detonate: F) -> Self
    where
        F: Fn(&str) -> Result<()> + Send + 'static,
    {
        let (commands, receiver) = channel();
        let detonate: Detonator = Box::new(detonate);
        let worker = thread::spawn(move || run(receiver, detonate));
        Self {
            commands,
            worker: Some(worker),
        }
    }

    /// Arm the volume's timer with whatever time it has left. Volumes with
    /// an unlimited TTL are never armed.
    pub fn strap(&self, volume: &Volume) {
        self.strap_with_children(volume, 0);
    }

    /// Arm the volume's timer already paused once per live child
    pub fn strap_with_children(&self, volume: &Volume, children: usize) {
        if volume.ttl.is_unlimited() {
            return;
        }
        self.arm(
            &volume.handle,
            volume.remaining(Utc::now()),
            volume.ttl.duration(),
            children,
        );
    }

    /// Replace any timer for `handle` with one firing after `remaining`;
    /// unpausing restarts it from `ttl`.
    pub fn arm(&self, handle: &str, remaining: Duration, ttl: Duration, pauses: usize) {
        self.send(Command::Strap {
            handle: handle.to_string(),
            remaining,
            ttl,
            pauses,
        });
    }

    pub fn pause(&self, handle: &str) {
        self.send(Command::Pause(handle.to_string()));
    }

    pub fn unpause(&self, handle: &str) {
        self.send(Command::Unpause(handle.to_string()));
    }

    pub fn defuse(&self, handle: &str) {
        self.send(Command::Defuse(handle.to_string()));
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("bomberman thread is gone, dropping timer command");
        }
    }
}

impl Drop for Bomberman {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            // The last owner can go away inside a detonation, on the worker itself.
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

fn run(receiver: Receiver<Command>, detonate: Detonator) {
    let mut timers: HashMap<String, Timer> = HashMap::new();

    loop {
        let next = timers.values().filter_map(|timer| timer.deadline).min();
        let command = match next {
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    detonate_expired(&mut timers, now, &detonate);
                    continue;
                }
                match receiver.recv_timeout(deadline - now) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match receiver.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
        };

        match command {
            Command::Strap {
                handle,
                remaining,
                ttl,
                pauses,
            } => {
                trace!("strapping {} ({:?} left, {} pauses)", handle, remaining, pauses);
                let deadline = if pauses == 0 {
                    deadline_after(remaining)
                } else {
                    None
                };
                timers.insert(
                    handle,
                    Timer {
                        deadline,
                        ttl,
                        pauses,
                    },
                );
            }
            Command::Pause(handle) => {
                if let Some(timer) = timers.get_mut(&handle) {
                    timer.pauses += 1;
                    timer.deadline = None;
                    trace!("paused {} ({} pauses)", handle, timer.pauses);
                }
            }
            Command::Unpause(handle) => {
                if let Some(timer) = timers.get_mut(&handle) {
                    timer.pauses = timer.pauses.saturating_sub(1);
                    if timer.pauses == 0 && timer.deadline.is_none() {
                        timer.deadline = deadline_after(timer.ttl);
                        trace!("unpaused {}", handle);
                    }
                }
            }
            Command::Defuse(handle) => {
                if timers.remove(&handle).is_some() {
                    trace!("defused {}", handle);
                }
            }
            Command::Shutdown => break,
        }
    }

    debug!("bomberman stopped with {} timers armed", timers.len());
}

/// Deadline `after` from now; `None` when it is too far off to represent,
/// which never fires
fn deadline_after(after: Duration) -> Option<Instant> {
    Instant::now().checked_add(after)
}

fn detonate_expired(timers: &mut HashMap<String, Timer>, now: Instant, detonate: &Detonator) {
    let expired: Vec<String> = timers
        .iter()
        .filter(|(_, timer)| timer.deadline.is_some_and(|deadline| deadline <= now))
        .map(|(handle, _)| handle.clone())
        .collect();

    for handle in expired {
        timers.remove(&handle);
        debug!("timer for volume {} expired", handle);
        if let Err(e) = detonate(&handle) {
            error!("failed to destroy expired volume {}: {}", handle, e);
        }
    }
}

#[cfg(test)]
mod tests;
