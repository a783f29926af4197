//! Prelude module for common re-exports.
//!
//! ```rust
//! use gridshm_common::prelude::*;
//! ```

// ─── Logging ────────────────────────────────────────────────────────
pub use crate::config::LogLevel;

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, SharedConfig};
pub use crate::transport::TransportConfig;

// ─── Constants ──────────────────────────────────────────────────────
pub use crate::consts::{DEFAULT_SPACE_CAPACITY, PROTOCOL_VERSION};
