//! Space header layout shared by both processes

use crate::error::{ShmError, ShmResult};
use gridshm::consts::{CACHE_LINE_SIZE, PROTOCOL_VERSION, SPACE_MAX_CAPACITY, SPACE_MIN_CAPACITY};
use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Magic number published last when a space is fully initialized
pub const SPACE_MAGIC: u64 = u64::from_le_bytes(*b"GRIDSHM\0");

/// A 64-bit counter on its own cache line
#[repr(C, align(64))]
pub struct PaddedCounter {
    value: AtomicU64,
}

impl PaddedCounter {
    /// Load the counter
    #[inline]
    pub fn load(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Store the counter
    #[inline]
    pub fn store(&self, value: u64) {
        self.value.store(value, Ordering::SeqCst)
    }
}

/// Header at the start of every space region, followed by `capacity` data bytes.
///
/// Positions are monotonically increasing byte counters; the ring index is
/// `position % capacity`. `write_pos - read_pos` is the number of unread bytes
/// and never exceeds `capacity`. Only the writer stores `write_pos`, only the
/// reader stores `read_pos`.
#[repr(C, align(64))]
pub struct SpaceHeader {
    /// `SPACE_MAGIC` once initialization is complete
    pub magic: AtomicU64,
    /// Data section size in bytes
    pub capacity: u64,
    /// Layout/protocol version
    pub version: u32,
    /// Process that created the space
    pub creator_pid: u32,
    /// Process that attached the space (0 until attached)
    pub attacher_pid: AtomicU32,
    /// Open handles across both processes
    pub attach_count: AtomicU32,
    /// Non-zero once either side closed the space
    pub closed: AtomicU32,
    /// Reader announced it is about to sleep on "data available"
    pub reader_waiting: AtomicU32,
    /// Writer announced it is about to sleep on "space available"
    pub writer_waiting: AtomicU32,
    _reserved: [u8; 20],
    /// Total bytes ever written
    pub write_pos: PaddedCounter,
    /// Total bytes ever read
    pub read_pos: PaddedCounter,
}

const_assert_eq!(core::mem::size_of::<PaddedCounter>(), 64);
const_assert_eq!(core::mem::size_of::<SpaceHeader>(), 192);
const_assert_eq!(core::mem::align_of::<SpaceHeader>(), CACHE_LINE_SIZE);

/// Header size in bytes
pub const HEADER_SIZE: usize = core::mem::size_of::<SpaceHeader>();

impl SpaceHeader {
    /// Unpublished header for a new space
    fn new(capacity: usize, creator_pid: u32) -> Self {
        Self {
            magic: AtomicU64::new(0),
            capacity: capacity as u64,
            version: PROTOCOL_VERSION,
            creator_pid,
            attacher_pid: AtomicU32::new(0),
            attach_count: AtomicU32::new(1),
            closed: AtomicU32::new(0),
            reader_waiting: AtomicU32::new(0),
            writer_waiting: AtomicU32::new(0),
            _reserved: [0; 20],
            write_pos: PaddedCounter {
                value: AtomicU64::new(0),
            },
            read_pos: PaddedCounter {
                value: AtomicU64::new(0),
            },
        }
    }

    /// Write an unpublished header at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be valid for `region_size(capacity)` bytes, aligned to
    /// `CACHE_LINE_SIZE`, and not yet visible to any other process.
    pub unsafe fn initialize<'a>(base: *mut u8, capacity: usize, creator_pid: u32) -> &'a Self {
        let header = base as *mut SpaceHeader;
        // SAFETY: guaranteed by the caller.
        unsafe {
            header.write(Self::new(capacity, creator_pid));
            &*header
        }
    }

    /// View the header at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be valid for at least `HEADER_SIZE` bytes, aligned to
    /// `CACHE_LINE_SIZE`, and outlive `'a`.
    pub unsafe fn at<'a>(base: *const u8) -> &'a Self {
        // SAFETY: guaranteed by the caller; every field is valid for any
        // bit pattern, zero included.
        unsafe { &*(base as *const SpaceHeader) }
    }

    /// Make the space visible to attachers
    pub fn publish(&self) {
        self.magic.store(SPACE_MAGIC, Ordering::Release);
    }

    /// Whether initialization has completed
    pub fn is_published(&self) -> bool {
        self.magic.load(Ordering::Acquire) == SPACE_MAGIC
    }

    /// Validate version and capacity of a published header
    pub fn validate(&self, name: &str, region_len: usize) -> ShmResult<()> {
        if self.version != PROTOCOL_VERSION {
            tracing::warn!(
                space = %name,
                found = self.version,
                expected = PROTOCOL_VERSION,
                "Space protocol version mismatch"
            );
            return Err(ShmError::NotFound {
                name: name.to_string(),
            });
        }

        let capacity = usize::try_from(self.capacity).unwrap_or(usize::MAX);
        if validate_capacity(capacity).is_err() || region_len < region_size(capacity) {
            tracing::warn!(space = %name, capacity, region_len, "Space header is corrupt");
            return Err(ShmError::NotFound {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Unread bytes
    pub fn used(&self) -> u64 {
        self.write_pos.load().wrapping_sub(self.read_pos.load())
    }

    /// Whether either side closed the space
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) != 0
    }
}

/// Validate ring-buffer capacity
pub fn validate_capacity(capacity: usize) -> ShmResult<()> {
    if !(SPACE_MIN_CAPACITY..=SPACE_MAX_CAPACITY).contains(&capacity) {
        return Err(ShmError::invalid(format!(
            "capacity {capacity} out of range {SPACE_MIN_CAPACITY}..={SPACE_MAX_CAPACITY}"
        )));
    }
    Ok(())
}

/// Region size needed for a space of `capacity` bytes
pub const fn region_size(capacity: usize) -> usize {
    HEADER_SIZE + capacity
}

/// Validate memory alignment
pub fn validate_memory_alignment(address: usize) -> ShmResult<()> {
    if address % CACHE_LINE_SIZE != 0 {
        return Err(ShmError::invalid(format!(
            "address {address:#x} not aligned to {CACHE_LINE_SIZE}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(64))]
    struct Backing([u8; HEADER_SIZE + 64]);

    #[test]
    fn capacity_validation() {
        assert!(validate_capacity(1).is_ok());
        assert!(validate_capacity(4096).is_ok());
        assert!(matches!(
            validate_capacity(0),
            Err(ShmError::InvalidArgument { .. })
        ));
        assert!(validate_capacity(SPACE_MAX_CAPACITY + 1).is_err());
    }

    #[test]
    fn header_lifecycle() {
        let mut backing = Backing([0; HEADER_SIZE + 64]);
        let base = backing.0.as_mut_ptr();
        assert!(validate_memory_alignment(base as usize).is_ok());

        let zeroed = unsafe { SpaceHeader::at(base) };
        assert!(!zeroed.is_published());

        let header = unsafe { SpaceHeader::initialize(base, 64, 4242) };
        assert!(!header.is_published());
        header.publish();
        assert!(header.is_published());
        assert_eq!(header.creator_pid, 4242);
        assert_eq!(header.attach_count.load(Ordering::SeqCst), 1);
        assert_eq!(header.used(), 0);
        assert!(header.validate("hdr", region_size(64)).is_ok());
        assert!(header.validate("hdr", region_size(63)).is_err());
    }

    #[test]
    fn positions_live_on_separate_lines() {
        let write = core::mem::offset_of!(SpaceHeader, write_pos);
        let read = core::mem::offset_of!(SpaceHeader, read_pos);
        assert_eq!(write % CACHE_LINE_SIZE, 0);
        assert_eq!(read - write, CACHE_LINE_SIZE);
    }
}
