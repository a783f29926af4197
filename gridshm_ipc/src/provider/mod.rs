//! Native primitive capability interface.
//!
//! Everything the transport needs from the operating system goes through
//! [`NativeProvider`]: named shared-memory regions, named counting semaphores
//! and process liveness. The core never touches `/dev/shm`, `sem_open` or
//! `kill` directly, which keeps it testable with [`InMemoryProvider`].

pub mod memory;

use crate::error::ShmResult;
use gridshm::consts::MAX_RESOURCE_NAME_LEN;
use std::time::Duration;

pub use memory::InMemoryProvider;

/// Result of a semaphore wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A permit was consumed
    Signaled,
    /// The deadline elapsed first
    TimedOut,
}

/// A named memory region mapped into this process.
///
/// Dropping the handle unmaps the region; it does not remove the name.
pub trait SharedRegion: Send + Sync {
    /// Region name
    fn name(&self) -> &str;

    /// Mapped length in bytes
    fn len(&self) -> usize;

    /// Whether the mapping is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Base address of the mapping, valid for `len()` bytes while `self` lives.
    ///
    /// The memory is shared with another process: callers must treat it as
    /// raw storage and synchronize through atomics and semaphores.
    fn as_ptr(&self) -> *mut u8;
}

/// A named counting semaphore opened by this process.
pub trait NamedSemaphore: Send + Sync {
    /// Semaphore name
    fn name(&self) -> &str;

    /// Release one permit.
    fn signal(&self) -> ShmResult<()>;

    /// Take one permit, blocking up to `timeout` (`None` waits forever).
    fn wait(&self, timeout: Option<Duration>) -> ShmResult<WaitOutcome>;
}

/// OS primitives consumed by the transport.
pub trait NativeProvider: Send + Sync {
    /// Process id this provider acts on behalf of.
    fn current_pid(&self) -> u32;

    /// Create a zero-filled region. Fails with `ResourceExhausted` if the name
    /// is taken or the OS refuses.
    fn create_region(&self, name: &str, size: usize) -> ShmResult<Box<dyn SharedRegion>>;

    /// Open an existing region. Fails with `NotFound` if the name is unknown.
    fn attach_region(&self, name: &str) -> ShmResult<Box<dyn SharedRegion>>;

    /// Create a semaphore holding `initial` permits.
    fn create_semaphore(&self, name: &str, initial: u32) -> ShmResult<Box<dyn NamedSemaphore>>;

    /// Open an existing semaphore. Fails with `NotFound` if the name is unknown.
    fn attach_semaphore(&self, name: &str) -> ShmResult<Box<dyn NamedSemaphore>>;

    /// Best-effort liveness probe; pids may be reused.
    fn is_process_alive(&self, pid: u32) -> bool;

    /// Remove a region name. Removing an unknown name is not an error.
    fn remove_region(&self, name: &str) -> ShmResult<()>;

    /// Remove a semaphore name. Removing an unknown name is not an error.
    fn remove_semaphore(&self, name: &str) -> ShmResult<()>;

    /// Names of existing regions starting with `prefix`.
    fn list_regions(&self, prefix: &str) -> ShmResult<Vec<String>>;
}

/// Validate a region or semaphore name: 1..=`MAX_RESOURCE_NAME_LEN` chars of `[A-Za-z0-9_]`.
///
/// Names end up as file names under `/dev/shm` and as POSIX semaphore names,
/// so anything that could form a path is refused.
pub fn validate_name(name: &str) -> ShmResult<()> {
    if name.is_empty() || name.len() > MAX_RESOURCE_NAME_LEN {
        return Err(crate::error::ShmError::invalid(format!(
            "name length {} not in 1..={MAX_RESOURCE_NAME_LEN}",
            name.len()
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(crate::error::ShmError::invalid(format!(
            "name {name:?} contains characters outside [A-Za-z0-9_]"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(validate_name("gridshm_42_0_c2s").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("../etc/passwd").is_err());
        assert!(validate_name("with space").is_err());
        assert!(validate_name(&"x".repeat(201)).is_err());
    }
}
