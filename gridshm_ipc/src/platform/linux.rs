//! Linux provider: `/dev/shm` files mapped with `memmap2`, POSIX named
//! semaphores, and `kill(pid, 0)` liveness probes.

use crate::error::{ShmError, ShmResult};
use crate::provider::{NamedSemaphore, NativeProvider, SharedRegion, WaitOutcome, validate_name};
use memmap2::{MmapMut, MmapOptions};
use nix::unistd::getpid;
use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory backing POSIX shared memory on Linux.
pub const SHM_DIR: &str = "/dev/shm";

/// Provider over the host's POSIX shared memory.
#[derive(Debug, Clone)]
pub struct PosixProvider {
    root: PathBuf,
}

impl PosixProvider {
    /// Provider rooted at `/dev/shm`, failing if the directory is unusable.
    pub fn probe() -> ShmResult<Self> {
        let root = Path::new(SHM_DIR);
        if !root.is_dir() {
            return Err(ShmError::Unsupported {
                reason: format!("{SHM_DIR} is not a directory"),
            });
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn region_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

struct MappedRegion {
    name: String,
    ptr: *mut u8,
    mmap: MmapMut,
}

// SAFETY: the mapping is owned by this handle; the raw pointer only aliases
// it, and concurrent access is coordinated by the space protocol.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    fn new(name: &str, mut mmap: MmapMut) -> Self {
        let ptr = mmap.as_mut_ptr();
        Self {
            name: name.to_string(),
            ptr,
            mmap,
        }
    }
}

impl SharedRegion for MappedRegion {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.mmap.len()
    }

    fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }
}

struct PosixSemaphore {
    name: String,
    sem: *mut libc::sem_t,
}

// SAFETY: sem_post/sem_wait/sem_timedwait are thread-safe.
unsafe impl Send for PosixSemaphore {}
unsafe impl Sync for PosixSemaphore {}

fn sem_name(name: &str) -> ShmResult<CString> {
    CString::new(format!("/{name}")).map_err(|e| ShmError::invalid(e.to_string()))
}

fn deadline_after(timeout: Duration) -> libc::timespec {
    // SAFETY: timespec is plain data; zero is a valid value.
    let mut now: libc::timespec = unsafe { std::mem::zeroed() };
    // SAFETY: valid out pointer.
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };

    let secs = timeout.as_secs().min(i32::MAX as u64) as libc::time_t;
    let nanos = now.tv_nsec as i64 + i64::from(timeout.subsec_nanos());

    let mut deadline: libc::timespec = unsafe { std::mem::zeroed() };
    deadline.tv_sec = now.tv_sec.saturating_add(secs + (nanos / 1_000_000_000) as libc::time_t);
    deadline.tv_nsec = (nanos % 1_000_000_000) as _;
    deadline
}

impl NamedSemaphore for PosixSemaphore {
    fn name(&self) -> &str {
        &self.name
    }

    fn signal(&self) -> ShmResult<()> {
        // SAFETY: sem is a live handle from sem_open.
        if unsafe { libc::sem_post(self.sem) } == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error().into())
        }
    }

    fn wait(&self, timeout: Option<Duration>) -> ShmResult<WaitOutcome> {
        let deadline = timeout.map(deadline_after);
        loop {
            // SAFETY: sem is a live handle; deadline outlives the call.
            let rc = unsafe {
                match &deadline {
                    None => libc::sem_wait(self.sem),
                    Some(ts) => libc::sem_timedwait(self.sem, ts),
                }
            };
            if rc == 0 {
                return Ok(WaitOutcome::Signaled);
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(WaitOutcome::TimedOut),
                _ => return Err(err.into()),
            }
        }
    }
}

impl Drop for PosixSemaphore {
    fn drop(&mut self) {
        // SAFETY: closing our own handle once.
        unsafe { libc::sem_close(self.sem) };
    }
}

impl NativeProvider for PosixProvider {
    fn current_pid(&self) -> u32 {
        get_current_pid()
    }

    fn create_region(&self, name: &str, size: usize) -> ShmResult<Box<dyn SharedRegion>> {
        validate_name(name)?;
        let path = self.region_path(name);
        let exhausted = |reason: String| ShmError::ResourceExhausted {
            name: name.to_string(),
            reason,
        };

        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .mode(0o600) // Owner read/write only
            .open(&path)
            .map_err(|e| exhausted(e.to_string()))?;

        let mapped = file
            .set_len(size as u64)
            .and_then(|_| unsafe { MmapOptions::new().populate().map_mut(&file) });

        match mapped {
            Ok(mmap) => Ok(Box::new(MappedRegion::new(name, mmap))),
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                Err(exhausted(e.to_string()))
            }
        }
    }

    fn attach_region(&self, name: &str) -> ShmResult<Box<dyn SharedRegion>> {
        validate_name(name)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.region_path(name))
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => ShmError::NotFound {
                    name: name.to_string(),
                },
                _ => e.into(),
            })?;

        // SAFETY: the file stays mapped for the lifetime of the handle; other
        // processes modify it only through the space protocol.
        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        Ok(Box::new(MappedRegion::new(name, mmap)))
    }

    fn create_semaphore(&self, name: &str, initial: u32) -> ShmResult<Box<dyn NamedSemaphore>> {
        validate_name(name)?;
        let c_name = sem_name(name)?;
        // SAFETY: valid NUL-terminated name; mode and value passed as c_uint.
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(ShmError::ResourceExhausted {
                name: name.to_string(),
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(Box::new(PosixSemaphore {
            name: name.to_string(),
            sem,
        }))
    }

    fn attach_semaphore(&self, name: &str) -> ShmResult<Box<dyn NamedSemaphore>> {
        validate_name(name)?;
        let c_name = sem_name(name)?;
        // SAFETY: valid NUL-terminated name.
        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            let err = std::io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENOENT) => ShmError::NotFound {
                    name: name.to_string(),
                },
                _ => err.into(),
            });
        }
        Ok(Box::new(PosixSemaphore {
            name: name.to_string(),
            sem,
        }))
    }

    fn is_process_alive(&self, pid: u32) -> bool {
        is_process_alive(pid)
    }

    fn remove_region(&self, name: &str) -> ShmResult<()> {
        validate_name(name)?;
        match std::fs::remove_file(self.region_path(name)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn remove_semaphore(&self, name: &str) -> ShmResult<()> {
        let c_name = sem_name(name)?;
        // SAFETY: valid NUL-terminated name.
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENOENT) => Ok(()),
            _ => Err(err.into()),
        }
    }

    fn list_regions(&self, prefix: &str) -> ShmResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)?.flatten() {
            if let Ok(file_name) = entry.file_name().into_string() {
                if file_name.starts_with(prefix) {
                    names.push(file_name);
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Check if process is alive using kill(pid, 0)
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }

    match kill(Pid::from_raw(raw), None) {
        Ok(_) => true,
        Err(nix::Error::ESRCH) => false, // No such process
        Err(nix::Error::EPERM) => true,  // Exists, but not ours to signal
        Err(_) => false,
    }
}

/// Get current process ID
pub fn get_current_pid() -> u32 {
    getpid().as_raw() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("gridshm_linux_{tag}_{}", std::process::id())
    }

    #[test]
    fn current_process_is_alive() {
        assert!(is_process_alive(get_current_pid()));
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(u32::MAX));
    }

    #[test]
    fn region_create_attach_remove() {
        let provider = PosixProvider::probe().unwrap();
        let name = unique("region");

        let created = provider.create_region(&name, 4096).unwrap();
        assert!(matches!(
            provider.create_region(&name, 4096),
            Err(ShmError::ResourceExhausted { .. })
        ));

        let attached = provider.attach_region(&name).unwrap();
        assert_eq!(attached.len(), 4096);
        unsafe { created.as_ptr().write(0x5A) };
        assert_eq!(unsafe { attached.as_ptr().read() }, 0x5A);

        assert!(provider.list_regions(&name).unwrap().contains(&name));
        provider.remove_region(&name).unwrap();
        provider.remove_region(&name).unwrap();
        assert!(matches!(
            provider.attach_region(&name),
            Err(ShmError::NotFound { .. })
        ));
    }

    #[test]
    fn semaphore_round_trip() {
        let provider = PosixProvider::probe().unwrap();
        let name = unique("sem");
        let _ = provider.remove_semaphore(&name);

        let sem = provider.create_semaphore(&name, 1).unwrap();
        let other = provider.attach_semaphore(&name).unwrap();
        assert_eq!(other.wait(None).unwrap(), WaitOutcome::Signaled);
        assert_eq!(
            other.wait(Some(Duration::from_millis(20))).unwrap(),
            WaitOutcome::TimedOut
        );
        sem.signal().unwrap();
        assert_eq!(
            other.wait(Some(Duration::from_millis(20))).unwrap(),
            WaitOutcome::Signaled
        );

        provider.remove_semaphore(&name).unwrap();
        assert!(matches!(
            provider.attach_semaphore(&name),
            Err(ShmError::NotFound { .. })
        ));
    }
}
