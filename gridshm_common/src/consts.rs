//! Workspace-wide constants for the shared-memory transport.
//!
//! Single source of truth for capacity limits, resource naming and timing
//! defaults. Imported by all crates, no duplication permitted.

/// Smallest accepted ring-buffer capacity in bytes.
///
/// Any non-zero capacity works; one byte is enough to exercise the blocking
/// paths in tests.
pub const SPACE_MIN_CAPACITY: usize = 1;

/// Largest accepted ring-buffer capacity in bytes (1 GiB).
pub const SPACE_MAX_CAPACITY: usize = 1_073_741_824;

/// Default ring-buffer capacity per direction (4 MiB).
///
/// Large enough to amortize semaphore round-trips for bulk transfers.
pub const DEFAULT_SPACE_CAPACITY: usize = 4 * 1024 * 1024;

/// CPU cache line size in bytes. The space header is aligned to it.
pub const CACHE_LINE_SIZE: usize = 64;

/// Default prefix of every region and semaphore name created by the transport.
pub const DEFAULT_NAME_PREFIX: &str = "gridshm";

/// Longest region or semaphore name accepted by the providers.
pub const MAX_RESOURCE_NAME_LEN: usize = 200;

/// Longest configurable name prefix.
///
/// Leaves room for `_<pid>_<sequence>_c2s_space`: a u32 pid (10 digits), a
/// u64 sequence (20 digits) and 12 bytes of separators and suffixes.
pub const MAX_NAME_PREFIX_LEN: usize = MAX_RESOURCE_NAME_LEN - 42;

/// Handshake protocol version. Peers with a different version are rejected.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default time allowed for a complete handshake, in milliseconds.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

/// Default window for attaching a freshly negotiated space, in milliseconds.
pub const DEFAULT_ATTACH_TIMEOUT_MS: u64 = 2_000;

/// Default pause between attach attempts, in milliseconds.
pub const DEFAULT_ATTACH_RETRY_INTERVAL_MS: u64 = 10;

/// Default liveness monitor interval, in milliseconds.
pub const DEFAULT_MONITOR_INTERVAL_MS: u64 = 500;

/// Environment variable overriding the configured capacity.
pub const CAPACITY_ENV_VAR: &str = "GRIDSHM_CAPACITY";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_limits_are_consistent() {
        assert!(SPACE_MIN_CAPACITY > 0);
        assert!(SPACE_MIN_CAPACITY < SPACE_MAX_CAPACITY);
        assert!(DEFAULT_SPACE_CAPACITY >= SPACE_MIN_CAPACITY);
        assert!(DEFAULT_SPACE_CAPACITY <= SPACE_MAX_CAPACITY);
    }

    #[test]
    fn default_capacity_is_a_few_megabytes() {
        assert!(DEFAULT_SPACE_CAPACITY >= 1024 * 1024);
    }

    #[test]
    fn longest_prefix_leaves_room_for_derived_names() {
        let longest = format!(
            "{}_{}_{}_c2s_space",
            "p".repeat(MAX_NAME_PREFIX_LEN),
            u32::MAX,
            u64::MAX
        );
        assert_eq!(longest.len(), MAX_RESOURCE_NAME_LEN);
    }

    #[test]
    fn cache_line_is_power_of_two() {
        assert!(CACHE_LINE_SIZE.is_power_of_two());
    }
}
