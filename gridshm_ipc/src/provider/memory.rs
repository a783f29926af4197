//! In-process provider backed by heap buffers and condvar semaphores.
//!
//! Several "processes" are simulated by views created with
//! [`InMemoryProvider::for_process`]; all views share one namespace of regions
//! and semaphores. [`InMemoryProvider::kill`] marks a pid dead so liveness
//! handling can be exercised without forking.

use super::{NamedSemaphore, NativeProvider, SharedRegion, WaitOutcome, validate_name};
use crate::error::{ShmError, ShmResult};
use gridshm::consts::CACHE_LINE_SIZE;
use parking_lot::{Condvar, Mutex};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Zeroed, cache-line aligned heap allocation standing in for a mapping.
struct HeapBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the block is plain bytes; concurrent access is coordinated by the
// space protocol exactly as for a real shared mapping.
unsafe impl Send for HeapBlock {}
unsafe impl Sync for HeapBlock {}

impl HeapBlock {
    fn zeroed(name: &str, size: usize) -> ShmResult<Self> {
        let layout = Layout::from_size_align(size.max(1), CACHE_LINE_SIZE).map_err(|e| {
            ShmError::ResourceExhausted {
                name: name.to_string(),
                reason: e.to_string(),
            }
        })?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| ShmError::ResourceExhausted {
            name: name.to_string(),
            reason: format!("allocation of {size} bytes failed"),
        })?;
        Ok(Self { ptr, layout })
    }
}

impl Drop for HeapBlock {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with the same layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

struct MemRegion {
    name: String,
    len: usize,
    block: Arc<HeapBlock>,
}

impl SharedRegion for MemRegion {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.len
    }

    fn as_ptr(&self) -> *mut u8 {
        self.block.ptr.as_ptr()
    }
}

#[derive(Default)]
struct SemState {
    permits: Mutex<u32>,
    cond: Condvar,
}

struct MemSemaphore {
    name: String,
    state: Arc<SemState>,
}

impl NamedSemaphore for MemSemaphore {
    fn name(&self) -> &str {
        &self.name
    }

    fn signal(&self) -> ShmResult<()> {
        let mut permits = self.state.permits.lock();
        *permits = permits.saturating_add(1);
        self.state.cond.notify_one();
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> ShmResult<WaitOutcome> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut permits = self.state.permits.lock();
        while *permits == 0 {
            match deadline {
                None => self.state.cond.wait(&mut permits),
                Some(deadline) => {
                    if self.state.cond.wait_until(&mut permits, deadline).timed_out()
                        && *permits == 0
                    {
                        return Ok(WaitOutcome::TimedOut);
                    }
                }
            }
        }
        *permits -= 1;
        Ok(WaitOutcome::Signaled)
    }
}

#[derive(Default)]
struct Namespace {
    regions: HashMap<String, (usize, Arc<HeapBlock>)>,
    semaphores: HashMap<String, Arc<SemState>>,
    dead: HashSet<u32>,
}

/// Provider for tests and single-process setups.
#[derive(Clone)]
pub struct InMemoryProvider {
    namespace: Arc<Mutex<Namespace>>,
    pid: u32,
}

impl InMemoryProvider {
    /// Fresh namespace, acting as the current process.
    pub fn new() -> Self {
        Self {
            namespace: Arc::new(Mutex::new(Namespace::default())),
            pid: std::process::id(),
        }
    }

    /// A view of the same namespace acting as process `pid`.
    pub fn for_process(&self, pid: u32) -> Self {
        Self {
            namespace: Arc::clone(&self.namespace),
            pid,
        }
    }

    /// Simulate the death of `pid`.
    pub fn kill(&self, pid: u32) {
        self.namespace.lock().dead.insert(pid);
    }

    /// Whether a region name currently exists.
    pub fn has_region(&self, name: &str) -> bool {
        self.namespace.lock().regions.contains_key(name)
    }

    /// Whether a semaphore name currently exists.
    pub fn has_semaphore(&self, name: &str) -> bool {
        self.namespace.lock().semaphores.contains_key(name)
    }

    /// Number of live region names.
    pub fn region_count(&self) -> usize {
        self.namespace.lock().regions.len()
    }

    /// Number of live semaphore names.
    pub fn semaphore_count(&self) -> usize {
        self.namespace.lock().semaphores.len()
    }
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeProvider for InMemoryProvider {
    fn current_pid(&self) -> u32 {
        self.pid
    }

    fn create_region(&self, name: &str, size: usize) -> ShmResult<Box<dyn SharedRegion>> {
        validate_name(name)?;
        let mut ns = self.namespace.lock();
        if ns.regions.contains_key(name) {
            return Err(ShmError::ResourceExhausted {
                name: name.to_string(),
                reason: "region already exists".to_string(),
            });
        }
        let block = Arc::new(HeapBlock::zeroed(name, size)?);
        ns.regions
            .insert(name.to_string(), (size, Arc::clone(&block)));
        Ok(Box::new(MemRegion {
            name: name.to_string(),
            len: size,
            block,
        }))
    }

    fn attach_region(&self, name: &str) -> ShmResult<Box<dyn SharedRegion>> {
        let ns = self.namespace.lock();
        let (len, block) = ns.regions.get(name).ok_or_else(|| ShmError::NotFound {
            name: name.to_string(),
        })?;
        Ok(Box::new(MemRegion {
            name: name.to_string(),
            len: *len,
            block: Arc::clone(block),
        }))
    }

    fn create_semaphore(&self, name: &str, initial: u32) -> ShmResult<Box<dyn NamedSemaphore>> {
        validate_name(name)?;
        let mut ns = self.namespace.lock();
        if ns.semaphores.contains_key(name) {
            return Err(ShmError::ResourceExhausted {
                name: name.to_string(),
                reason: "semaphore already exists".to_string(),
            });
        }
        let state = Arc::new(SemState {
            permits: Mutex::new(initial),
            cond: Condvar::new(),
        });
        ns.semaphores.insert(name.to_string(), Arc::clone(&state));
        Ok(Box::new(MemSemaphore {
            name: name.to_string(),
            state,
        }))
    }

    fn attach_semaphore(&self, name: &str) -> ShmResult<Box<dyn NamedSemaphore>> {
        let ns = self.namespace.lock();
        let state = ns.semaphores.get(name).ok_or_else(|| ShmError::NotFound {
            name: name.to_string(),
        })?;
        Ok(Box::new(MemSemaphore {
            name: name.to_string(),
            state: Arc::clone(state),
        }))
    }

    fn is_process_alive(&self, pid: u32) -> bool {
        !self.namespace.lock().dead.contains(&pid)
    }

    fn remove_region(&self, name: &str) -> ShmResult<()> {
        self.namespace.lock().regions.remove(name);
        Ok(())
    }

    fn remove_semaphore(&self, name: &str) -> ShmResult<()> {
        self.namespace.lock().semaphores.remove(name);
        Ok(())
    }

    fn list_regions(&self, prefix: &str) -> ShmResult<Vec<String>> {
        let mut names: Vec<String> = self
            .namespace
            .lock()
            .regions
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_are_shared_between_views() {
        let a = InMemoryProvider::new();
        let b = a.for_process(4242);

        let created = a.create_region("shared_block", 128).unwrap();
        let attached = b.attach_region("shared_block").unwrap();
        assert_eq!(attached.len(), 128);
        assert_eq!(created.as_ptr(), attached.as_ptr());
        assert_eq!(created.as_ptr() as usize % CACHE_LINE_SIZE, 0);
    }

    #[test]
    fn duplicate_region_is_exhausted() {
        let p = InMemoryProvider::new();
        let _r = p.create_region("dup", 16).unwrap();
        assert!(matches!(
            p.create_region("dup", 16),
            Err(ShmError::ResourceExhausted { .. })
        ));
    }

    #[test]
    fn removed_region_outlives_handles() {
        let p = InMemoryProvider::new();
        let region = p.create_region("unlinked", 8).unwrap();
        p.remove_region("unlinked").unwrap();
        assert!(!p.has_region("unlinked"));
        assert!(matches!(
            p.attach_region("unlinked"),
            Err(ShmError::NotFound { .. })
        ));
        // Still mapped for the existing handle.
        unsafe { region.as_ptr().write(7) };
        assert_eq!(unsafe { region.as_ptr().read() }, 7);
    }

    #[test]
    fn semaphore_counts_and_times_out() {
        let p = InMemoryProvider::new();
        let sem = p.create_semaphore("sem_counts", 2).unwrap();
        assert_eq!(sem.wait(Some(Duration::ZERO)).unwrap(), WaitOutcome::Signaled);
        assert_eq!(sem.wait(None).unwrap(), WaitOutcome::Signaled);
        assert_eq!(
            sem.wait(Some(Duration::from_millis(10))).unwrap(),
            WaitOutcome::TimedOut
        );
        sem.signal().unwrap();
        assert_eq!(sem.wait(None).unwrap(), WaitOutcome::Signaled);
    }

    #[test]
    fn semaphore_wakes_across_threads() {
        let p = InMemoryProvider::new();
        let sem = p.create_semaphore("sem_threads", 0).unwrap();
        let other = p.for_process(99).attach_semaphore("sem_threads").unwrap();

        let waiter = std::thread::spawn(move || other.wait(Some(Duration::from_secs(5))));
        std::thread::sleep(Duration::from_millis(20));
        sem.signal().unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), WaitOutcome::Signaled);
    }

    #[test]
    fn kill_marks_dead() {
        let p = InMemoryProvider::new();
        assert!(p.is_process_alive(31337));
        p.kill(31337);
        assert!(p.for_process(1).is_process_alive(1));
        assert!(!p.is_process_alive(31337));
    }

    #[test]
    fn list_filters_by_prefix() {
        let p = InMemoryProvider::new();
        let _a = p.create_region("grid_b", 1).unwrap();
        let _b = p.create_region("grid_a", 1).unwrap();
        let _c = p.create_region("other", 1).unwrap();
        assert_eq!(p.list_regions("grid_").unwrap(), vec!["grid_a", "grid_b"]);
    }
}
