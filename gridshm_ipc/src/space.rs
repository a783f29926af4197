//! Unidirectional shared-memory ring buffer
//!
//! A [`Space`] is one region (header + data ring) plus two named semaphores:
//! "data available", slept on by the reader, and "space available", slept on
//! by the writer. The header positions are the authoritative byte counts; the
//! semaphores only carry wake-ups. Before sleeping a side raises its
//! `*_waiting` flag and re-checks the positions, and the other side signals
//! after moving its position whenever it sees that flag, so no wake-up is lost.

use crate::error::{ShmError, ShmResult};
use crate::header::{HEADER_SIZE, SpaceHeader, region_size, validate_capacity, validate_memory_alignment};
use crate::provider::{NamedSemaphore, NativeProvider, SharedRegion, WaitOutcome, validate_name};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Name of the "data available" semaphore of space `name`
pub fn data_semaphore_name(name: &str) -> String {
    format!("{name}_data")
}

/// Name of the "space available" semaphore of space `name`
pub fn space_semaphore_name(name: &str) -> String {
    format!("{name}_space")
}

/// Remove a space's region and both semaphores, logging failures.
pub fn remove_space_resources(provider: &dyn NativeProvider, name: &str) -> ShmResult<()> {
    let mut first_error = None;
    let results = [
        provider.remove_region(name),
        provider.remove_semaphore(&data_semaphore_name(name)),
        provider.remove_semaphore(&space_semaphore_name(name)),
    ];
    for result in results {
        if let Err(e) = result {
            warn!(space = %name, error = %e, "Failed to remove space resource");
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Removes everything registered with it on drop unless disarmed.
struct CreationGuard<'a> {
    provider: &'a dyn NativeProvider,
    region: Option<String>,
    semaphores: Vec<String>,
}

impl<'a> CreationGuard<'a> {
    fn new(provider: &'a dyn NativeProvider) -> Self {
        Self {
            provider,
            region: None,
            semaphores: Vec::new(),
        }
    }

    fn disarm(mut self) {
        self.region = None;
        self.semaphores.clear();
    }
}

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        for sem in self.semaphores.drain(..) {
            let _ = self.provider.remove_semaphore(&sem);
        }
        if let Some(region) = self.region.take() {
            let _ = self.provider.remove_region(&region);
        }
    }
}

/// Single-producer/single-consumer byte ring shared with another process
pub struct Space {
    name: String,
    capacity: usize,
    provider: Arc<dyn NativeProvider>,
    region: Box<dyn SharedRegion>,
    data_available: Box<dyn NamedSemaphore>,
    space_available: Box<dyn NamedSemaphore>,
    released: AtomicBool,
    peer_lost: AtomicBool,
    lost_pid: AtomicU32,
    writer: Mutex<()>,
    reader: Mutex<()>,
}

impl Space {
    /// Create a new space of `capacity` bytes.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for a zero/oversized capacity or a bad name
    /// - `ResourceExhausted` if the region or a semaphore cannot be created;
    ///   anything already created is removed again
    pub fn create(provider: Arc<dyn NativeProvider>, name: &str, capacity: usize) -> ShmResult<Self> {
        validate_capacity(capacity)?;
        validate_name(name)?;

        let data_name = data_semaphore_name(name);
        let space_name = space_semaphore_name(name);
        let mut guard = CreationGuard::new(&*provider);

        let region = provider.create_region(name, region_size(capacity))?;
        guard.region = Some(name.to_string());
        validate_memory_alignment(region.as_ptr() as usize)?;

        // SAFETY: freshly created region of region_size(capacity) bytes that
        // no other process can see until publish().
        let header =
            unsafe { SpaceHeader::initialize(region.as_ptr(), capacity, provider.current_pid()) };

        let data_available = provider.create_semaphore(&data_name, 0)?;
        guard.semaphores.push(data_name);
        let space_available = provider.create_semaphore(&space_name, 0)?;
        guard.semaphores.push(space_name);

        header.publish();
        guard.disarm();

        debug!(space = %name, capacity, "Created space");
        Ok(Self::from_parts(provider, name, capacity, region, data_available, space_available))
    }

    /// Attach to a space created by another process.
    ///
    /// Retries every `retry_interval` while the name does not resolve or the
    /// creator has not finished initializing, up to `timeout`.
    ///
    /// # Errors
    ///
    /// `NotFound` once `timeout` elapses, or right away if the header is
    /// incompatible.
    pub fn attach(
        provider: Arc<dyn NativeProvider>,
        name: &str,
        timeout: Duration,
        retry_interval: Duration,
    ) -> ShmResult<Self> {
        validate_name(name)?;
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(space) = Self::try_attach(&provider, name)? {
                debug!(space = %name, capacity = space.capacity, "Attached space");
                return Ok(space);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ShmError::NotFound {
                    name: name.to_string(),
                });
            }
            std::thread::sleep(retry_interval.min(deadline - now));
        }
    }

    /// One attach attempt; `Ok(None)` means "not there yet".
    fn try_attach(provider: &Arc<dyn NativeProvider>, name: &str) -> ShmResult<Option<Self>> {
        let region = match provider.attach_region(name) {
            Ok(region) => region,
            Err(ShmError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        if region.len() < HEADER_SIZE {
            return Ok(None);
        }
        validate_memory_alignment(region.as_ptr() as usize)?;

        // SAFETY: mapping holds at least HEADER_SIZE aligned bytes and lives
        // as long as `region`.
        let header = unsafe { SpaceHeader::at(region.as_ptr()) };
        if !header.is_published() {
            return Ok(None);
        }
        header.validate(name, region.len())?;
        let capacity = header.capacity as usize;

        let semaphores = provider
            .attach_semaphore(&data_semaphore_name(name))
            .and_then(|data| {
                provider
                    .attach_semaphore(&space_semaphore_name(name))
                    .map(|space| (data, space))
            });
        let (data_available, space_available) = match semaphores {
            Ok(pair) => pair,
            Err(ShmError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        // A count of zero means every handle is gone and removal is under way.
        let joined = header
            .attach_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count > 0).then_some(count + 1)
            });
        if joined.is_err() {
            return Ok(None);
        }
        header
            .attacher_pid
            .store(provider.current_pid(), Ordering::SeqCst);

        Ok(Some(Self::from_parts(
            Arc::clone(provider),
            name,
            capacity,
            region,
            data_available,
            space_available,
        )))
    }

    fn from_parts(
        provider: Arc<dyn NativeProvider>,
        name: &str,
        capacity: usize,
        region: Box<dyn SharedRegion>,
        data_available: Box<dyn NamedSemaphore>,
        space_available: Box<dyn NamedSemaphore>,
    ) -> Self {
        Self {
            name: name.to_string(),
            capacity,
            provider,
            region,
            data_available,
            space_available,
            released: AtomicBool::new(false),
            peer_lost: AtomicBool::new(false),
            lost_pid: AtomicU32::new(0),
            writer: Mutex::new(()),
            reader: Mutex::new(()),
        }
    }

    fn header(&self) -> &SpaceHeader {
        // SAFETY: validated at create/attach; the mapping lives as long as self.
        unsafe { SpaceHeader::at(self.region.as_ptr()) }
    }

    fn data_ptr(&self) -> *mut u8 {
        // SAFETY: the region is at least HEADER_SIZE + capacity bytes long.
        unsafe { self.region.as_ptr().add(HEADER_SIZE) }
    }

    /// Space name (also the region name)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ring capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes written but not yet read
    pub fn available(&self) -> usize {
        self.header().used().min(self.capacity as u64) as usize
    }

    /// Bytes that can be written without blocking
    pub fn free(&self) -> usize {
        self.capacity - self.available()
    }

    /// Unread bytes between two observed positions.
    ///
    /// The peer can store anything into the header, so a distance beyond
    /// `capacity` closes the space instead of driving a copy out of bounds.
    fn unread(&self, write_pos: u64, read_pos: u64) -> ShmResult<u64> {
        let used = write_pos.wrapping_sub(read_pos);
        if used > self.capacity as u64 {
            warn!(space = %self.name, write_pos, read_pos, "Space positions are corrupt, closing");
            self.header().closed.store(1, Ordering::SeqCst);
            self.wake_all();
            return Err(ShmError::ChannelClosed);
        }
        Ok(used)
    }

    /// Whether this space was closed locally, by the peer, or by the monitor
    pub fn is_closed(&self) -> bool {
        self.released.load(Ordering::Acquire) || self.header().is_closed()
    }

    /// Process that created the space
    pub fn creator_pid(&self) -> u32 {
        self.header().creator_pid
    }

    /// Process that attached the space, 0 if none yet
    pub fn attacher_pid(&self) -> u32 {
        self.header().attacher_pid.load(Ordering::SeqCst)
    }

    /// Open handles across both processes
    pub fn attach_count(&self) -> u32 {
        self.header().attach_count.load(Ordering::SeqCst)
    }

    /// Write every byte of `data`, blocking while the ring is full.
    ///
    /// Returns `data.len()`.
    pub fn write(&self, data: &[u8]) -> ShmResult<usize> {
        self.write_inner(data, None, true)
    }

    /// Like [`write`](Self::write) with an overall deadline. On `Timeout` the
    /// bytes copied before the deadline stay in the ring.
    pub fn write_timeout(&self, data: &[u8], timeout: Option<Duration>) -> ShmResult<usize> {
        self.write_inner(data, timeout.map(|t| Instant::now() + t), true)
    }

    /// Copy as many bytes as fit right now, blocking only while the ring is
    /// completely full. Returns the number of bytes copied.
    pub fn write_some(&self, data: &[u8], timeout: Option<Duration>) -> ShmResult<usize> {
        self.write_inner(data, timeout.map(|t| Instant::now() + t), false)
    }

    /// Read at least one byte, blocking while the ring is empty.
    ///
    /// Returns 0 once the peer closed and the ring is drained, and right away
    /// after a local [`close`](Self::close).
    pub fn read(&self, buf: &mut [u8]) -> ShmResult<usize> {
        self.read_inner(buf, None)
    }

    /// Like [`read`](Self::read) with a deadline.
    pub fn read_timeout(&self, buf: &mut [u8], timeout: Option<Duration>) -> ShmResult<usize> {
        self.read_inner(buf, timeout.map(|t| Instant::now() + t))
    }

    fn write_inner(&self, data: &[u8], deadline: Option<Instant>, all: bool) -> ShmResult<usize> {
        let _writer = self.writer.lock();
        let header = self.header();
        let capacity = self.capacity as u64;
        let mut written = 0;

        loop {
            self.check_writable()?;
            if written == data.len() {
                return Ok(written);
            }

            let write_pos = header.write_pos.load();
            let free = capacity - self.unread(write_pos, header.read_pos.load())?;
            if free == 0 {
                if !all && written > 0 {
                    return Ok(written);
                }
                self.park(&*self.space_available, &header.writer_waiting, deadline, || {
                    header.used() < capacity
                })?;
                continue;
            }

            let chunk = (free as usize).min(data.len() - written);
            // SAFETY: [write_pos, write_pos + chunk) is free ring space that
            // only this writer touches until write_pos is advanced.
            unsafe { self.copy_in(write_pos, &data[written..written + chunk]) };
            header.write_pos.store(write_pos + chunk as u64);
            self.wake_if_waiting(&header.reader_waiting, &*self.data_available)?;
            written += chunk;

            if !all {
                return Ok(written);
            }
        }
    }

    fn read_inner(&self, buf: &mut [u8], deadline: Option<Instant>) -> ShmResult<usize> {
        let _reader = self.reader.lock();
        let header = self.header();
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            // Buffered bytes are only drained for a peer close, never after our own.
            if self.released.load(Ordering::Acquire) {
                return Ok(0);
            }
            let read_pos = header.read_pos.load();
            let used = self.unread(header.write_pos.load(), read_pos)?;
            if used > 0 {
                let chunk = (used as usize).min(buf.len());
                // SAFETY: [read_pos, read_pos + chunk) was published by the
                // writer and is not reused until read_pos advances.
                unsafe { self.copy_out(read_pos, &mut buf[..chunk]) };
                header.read_pos.store(read_pos + chunk as u64);
                self.wake_if_waiting(&header.writer_waiting, &*self.space_available)?;
                return Ok(chunk);
            }

            if self.peer_lost.load(Ordering::Acquire) {
                return Err(ShmError::PeerLost {
                    pid: self.lost_pid.load(Ordering::Acquire),
                });
            }
            if self.is_closed() {
                // Bytes written right before the close must still be delivered.
                if header.write_pos.load() != read_pos {
                    continue;
                }
                return Ok(0);
            }

            self.park(&*self.data_available, &header.reader_waiting, deadline, || {
                header.write_pos.load() != read_pos
            })?;
        }
    }

    fn check_writable(&self) -> ShmResult<()> {
        if self.peer_lost.load(Ordering::Acquire) {
            return Err(ShmError::PeerLost {
                pid: self.lost_pid.load(Ordering::Acquire),
            });
        }
        if self.is_closed() {
            return Err(ShmError::ChannelClosed);
        }
        Ok(())
    }

    /// Sleep on `sem` unless `ready` turns true after announcing the wait.
    fn park(
        &self,
        sem: &dyn NamedSemaphore,
        waiting: &AtomicU32,
        deadline: Option<Instant>,
        ready: impl Fn() -> bool,
    ) -> ShmResult<()> {
        waiting.store(1, Ordering::SeqCst);
        if ready() || self.is_closed() || self.peer_lost.load(Ordering::Acquire) {
            waiting.store(0, Ordering::SeqCst);
            return Ok(());
        }

        let timeout = match deadline {
            None => None,
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    waiting.store(0, Ordering::SeqCst);
                    return Err(ShmError::Timeout);
                }
                Some(deadline - now)
            }
        };

        let outcome = sem.wait(timeout);
        waiting.store(0, Ordering::SeqCst);
        match outcome? {
            WaitOutcome::Signaled => Ok(()),
            WaitOutcome::TimedOut => Err(ShmError::Timeout),
        }
    }

    fn wake_if_waiting(&self, waiting: &AtomicU32, sem: &dyn NamedSemaphore) -> ShmResult<()> {
        if waiting.load(Ordering::SeqCst) != 0 {
            sem.signal()?;
        }
        Ok(())
    }

    unsafe fn copy_in(&self, pos: u64, src: &[u8]) {
        let start = (pos % self.capacity as u64) as usize;
        let first = src.len().min(self.capacity - start);
        let data = self.data_ptr();
        // SAFETY: both ranges lie inside the data section (caller checked
        // the free space).
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), data.add(start), first);
            std::ptr::copy_nonoverlapping(src.as_ptr().add(first), data, src.len() - first);
        }
    }

    unsafe fn copy_out(&self, pos: u64, dst: &mut [u8]) {
        let start = (pos % self.capacity as u64) as usize;
        let first = dst.len().min(self.capacity - start);
        let data = self.data_ptr();
        // SAFETY: both ranges lie inside the data section (caller checked
        // the unread bytes).
        unsafe {
            std::ptr::copy_nonoverlapping(data.add(start), dst.as_mut_ptr(), first);
            std::ptr::copy_nonoverlapping(data, dst.as_mut_ptr().add(first), dst.len() - first);
        }
    }

    fn wake_all(&self) {
        for sem in [&self.data_available, &self.space_available] {
            if let Err(e) = sem.signal() {
                warn!(space = %self.name, semaphore = sem.name(), error = %e, "Failed to wake waiter");
            }
        }
    }

    /// Close this handle. Idempotent.
    ///
    /// Sets the shared closed flag, wakes any thread blocked on either
    /// semaphore, and removes the region and semaphores once the last handle
    /// across both processes is closed.
    pub fn close(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let header = self.header();
        header.closed.store(1, Ordering::SeqCst);
        self.wake_all();

        let previous = header.attach_count.fetch_sub(1, Ordering::AcqRel);
        if previous <= 1 {
            let _ = remove_space_resources(&*self.provider, &self.name);
            debug!(space = %self.name, "Closed space and removed its resources");
        } else {
            debug!(space = %self.name, remaining = previous - 1, "Closed space handle");
        }
    }

    /// Treat `pid` as dead: blocked and future calls fail with `PeerLost`
    /// (the reader still drains buffered bytes first) and the shared
    /// resources are removed.
    pub fn mark_peer_lost(&self, pid: u32) {
        self.lost_pid.store(pid, Ordering::Release);
        if self.peer_lost.swap(true, Ordering::AcqRel) {
            return;
        }
        self.header().closed.store(1, Ordering::SeqCst);
        self.wake_all();
        let _ = remove_space_resources(&*self.provider, &self.name);
        warn!(space = %self.name, pid, "Peer lost, space reclaimed");
    }

    /// Whether the monitor declared the peer dead
    pub fn is_peer_lost(&self) -> bool {
        self.peer_lost.load(Ordering::Acquire)
    }
}

impl Drop for Space {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Space")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .field("closed", &self.is_closed())
            .field("peer_lost", &self.is_peer_lost())
            .finish()
    }
}
