//! Peer liveness monitoring and stale-resource reclamation
//!
//! A semaphore wait cannot see the death of the process that was supposed to
//! signal it. [`LivenessMonitor`] polls the provider for every registered peer
//! on a fixed interval and, when one is gone, marks its spaces as peer-lost so
//! blocked readers and writers return instead of hanging.

use crate::error::{ShmError, ShmResult};
use crate::header::{HEADER_SIZE, SpaceHeader, validate_memory_alignment};
use crate::provider::NativeProvider;
use crate::space::{Space, remove_space_resources};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

/// A registered peer was found dead
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerLostEvent {
    /// Process id of the dead peer
    pub pid: u32,
    /// Spaces that were invalidated
    pub spaces: Vec<String>,
    /// When the death was detected
    pub timestamp: SystemTime,
}

/// Trait for reacting to peer death
pub trait PeerLostHandler: Send + Sync {
    /// Handle a peer-lost event
    fn on_peer_lost(&self, event: &PeerLostEvent) -> ShmResult<()>;
}

/// Appends each event as a JSON line to a file
pub struct LogFilePeerLostHandler {
    path: PathBuf,
}

impl LogFilePeerLostHandler {
    /// Create new log file handler
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PeerLostHandler for LogFilePeerLostHandler {
    fn on_peer_lost(&self, event: &PeerLostEvent) -> ShmResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(event)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

struct Shared {
    provider: Arc<dyn NativeProvider>,
    peers: Mutex<HashMap<u32, Vec<Weak<Space>>>>,
    handlers: RwLock<Vec<Box<dyn PeerLostHandler>>>,
    stopped: Mutex<bool>,
    wake: Condvar,
    sweeps: AtomicU64,
}

impl Shared {
    fn sweep(&self) -> Vec<PeerLostEvent> {
        let candidates: Vec<u32> = {
            let mut peers = self.peers.lock();
            peers.retain(|_, spaces| {
                spaces.retain(|weak| weak.upgrade().is_some_and(|space| !space.is_closed()));
                !spaces.is_empty()
            });
            peers.keys().copied().collect()
        };

        let mut events = Vec::new();
        for pid in candidates {
            if self.provider.is_process_alive(pid) {
                continue;
            }
            let Some(spaces) = self.peers.lock().remove(&pid) else {
                continue;
            };

            let mut names = Vec::new();
            for space in spaces.iter().filter_map(Weak::upgrade) {
                space.mark_peer_lost(pid);
                names.push(space.name().to_string());
            }
            warn!(pid, spaces = ?names, "Peer process died, spaces invalidated");

            let event = PeerLostEvent {
                pid,
                spaces: names,
                timestamp: SystemTime::now(),
            };
            for handler in self.handlers.read().iter() {
                if let Err(e) = handler.on_peer_lost(&event) {
                    error!(pid, error = %e, "Peer-lost handler failed");
                }
            }
            events.push(event);
        }

        self.sweeps.fetch_add(1, Ordering::Relaxed);
        events
    }
}

/// Background checker of registered peers
pub struct LivenessMonitor {
    shared: Arc<Shared>,
    interval: Duration,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LivenessMonitor {
    /// Start sweeping every `interval` on a background thread.
    pub fn start(provider: Arc<dyn NativeProvider>, interval: Duration) -> ShmResult<Self> {
        if interval.is_zero() {
            return Err(ShmError::invalid("monitor interval must be greater than zero"));
        }

        let shared = Arc::new(Shared {
            provider,
            peers: Mutex::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
            stopped: Mutex::new(false),
            wake: Condvar::new(),
            sweeps: AtomicU64::new(0),
        });

        let worker = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("gridshm-monitor".to_string())
            .spawn(move || {
                let mut stopped = worker.stopped.lock();
                while !*stopped {
                    worker.wake.wait_for(&mut stopped, interval);
                    if *stopped {
                        break;
                    }
                    MutexGuard::unlocked(&mut stopped, || {
                        worker.sweep();
                    });
                }
                debug!("Liveness monitor stopped");
            })?;

        debug!(interval_ms = interval.as_millis() as u64, "Liveness monitor started");
        Ok(Self {
            shared,
            interval,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Track `space` as held on behalf of process `pid`.
    pub fn register(&self, pid: u32, space: &Arc<Space>) {
        self.shared
            .peers
            .lock()
            .entry(pid)
            .or_default()
            .push(Arc::downgrade(space));
        debug!(pid, space = %space.name(), "Registered peer space");
    }

    /// Add a peer-lost handler
    pub fn add_handler(&self, handler: Box<dyn PeerLostHandler>) {
        self.shared.handlers.write().push(handler);
    }

    /// Peers with at least one open space, sorted
    pub fn tracked_peers(&self) -> Vec<u32> {
        let peers = self.shared.peers.lock();
        let mut pids: Vec<u32> = peers
            .iter()
            .filter(|(_, spaces)| spaces.iter().any(|weak| weak.strong_count() > 0))
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort_unstable();
        pids
    }

    /// Run one sweep now and return the peers found dead.
    pub fn check_now(&self) -> Vec<PeerLostEvent> {
        self.shared.sweep()
    }

    /// Completed sweeps, background and manual
    pub fn sweep_count(&self) -> u64 {
        self.shared.sweeps.load(Ordering::Relaxed)
    }

    /// Sweep interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether the background thread is still running
    pub fn is_running(&self) -> bool {
        !*self.shared.stopped.lock()
    }

    /// Stop the background thread and wait for it. Idempotent.
    pub fn stop(&self) {
        *self.shared.stopped.lock() = true;
        self.shared.wake.notify_all();
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!("Liveness monitor thread panicked");
            }
        }
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Remove regions under `prefix` whose creator and attacher are both dead,
/// together with their semaphores. Returns the removed region names.
///
/// Regions that are not yet initialized are left alone.
pub fn reclaim_orphans(provider: &dyn NativeProvider, prefix: &str) -> ShmResult<Vec<String>> {
    let mut removed = Vec::new();

    for name in provider.list_regions(prefix)? {
        let region = match provider.attach_region(&name) {
            Ok(region) => region,
            Err(ShmError::NotFound { .. }) => continue,
            Err(e) => {
                warn!(space = %name, error = %e, "Cannot inspect region");
                continue;
            }
        };
        if region.len() < HEADER_SIZE || validate_memory_alignment(region.as_ptr() as usize).is_err()
        {
            continue;
        }

        // SAFETY: the mapping is aligned, holds a full header and lives until
        // `region` is dropped at the end of this iteration.
        let header = unsafe { SpaceHeader::at(region.as_ptr()) };
        if !header.is_published() {
            debug!(space = %name, "Skipping uninitialized region");
            continue;
        }

        let creator = header.creator_pid;
        let attacher = header.attacher_pid.load(Ordering::SeqCst);
        let alive = provider.is_process_alive(creator)
            || (attacher != 0 && provider.is_process_alive(attacher));
        if alive {
            continue;
        }

        drop(region);
        remove_space_resources(provider, &name)?;
        info!(space = %name, creator, attacher, "Reclaimed orphaned space");
        removed.push(name);
    }

    info!(prefix, reclaimed = removed.len(), "Orphan sweep finished");
    Ok(removed)
}
