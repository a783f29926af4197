//! Native provider loading and platform detection.
//!
//! [`load`] resolves the provider for the running platform exactly once per
//! process; later calls hand out the same instance.

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "linux")]
pub use linux::{PosixProvider, get_current_pid, is_process_alive};

use crate::error::{ShmError, ShmResult};
use crate::provider::NativeProvider;
use std::sync::{Arc, OnceLock};

static PROVIDER: OnceLock<Arc<dyn NativeProvider>> = OnceLock::new();

/// Operating system name used in platform tags: `linux`, `osx`, or the
/// target OS with non-word characters replaced by `_`.
pub fn os_name() -> String {
    match std::env::consts::OS {
        "linux" => "linux".to_string(),
        "macos" => "osx".to_string(),
        other => other
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect(),
    }
}

/// OS name followed by the pointer width, e.g. `linux64`.
pub fn platform_tag() -> String {
    format!("{}{}", os_name(), usize::BITS)
}

/// Load the native provider for this platform.
///
/// # Errors
///
/// `ShmError::Unsupported` listing every attempt that failed.
pub fn load() -> ShmResult<Arc<dyn NativeProvider>> {
    if let Some(provider) = PROVIDER.get() {
        return Ok(Arc::clone(provider));
    }

    let provider = load_for(&os_name())?;
    Ok(Arc::clone(PROVIDER.get_or_init(|| provider)))
}

fn load_for(os: &str) -> ShmResult<Arc<dyn NativeProvider>> {
    if os.starts_with("win") {
        return Err(ShmError::Unsupported {
            reason: "shared memory IPC should not be used on windows".to_string(),
        });
    }

    let mut errors: Vec<String> = Vec::new();
    if let Some(provider) = probe_native(&mut errors) {
        return Ok(provider);
    }

    errors.push(format!("no native provider for platform {}", platform_tag()));
    Err(ShmError::Unsupported {
        reason: errors.join("; "),
    })
}

#[cfg(target_os = "linux")]
fn probe_native(errors: &mut Vec<String>) -> Option<Arc<dyn NativeProvider>> {
    match PosixProvider::probe() {
        Ok(provider) => {
            tracing::debug!(platform = %platform_tag(), "Loaded POSIX shared memory provider");
            Some(Arc::new(provider))
        }
        Err(e) => {
            errors.push(e.to_string());
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn probe_native(_errors: &mut Vec<String>) -> Option<Arc<dyn NativeProvider>> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_tag_carries_pointer_width() {
        let tag = platform_tag();
        assert!(tag.starts_with(&os_name()));
        assert!(tag.ends_with(&usize::BITS.to_string()));
    }

    #[test]
    fn windows_is_refused() {
        let err = load_for("windows").err().unwrap();
        assert!(matches!(err, ShmError::Unsupported { .. }));
        assert!(err.to_string().contains("windows"));
    }

    #[test]
    fn os_name_has_only_word_characters() {
        assert!(os_name().chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn load_is_idempotent() {
        let first = load().unwrap();
        let second = load().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.current_pid(), std::process::id());
    }
}
