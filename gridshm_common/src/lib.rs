//! gridshm Common Library
//!
//! Shared constants and configuration loading for the gridshm workspace.
//!
//! # Module Structure
//!
//! - [`consts`] - Space capacity limits, naming and timing defaults
//! - [`config`] - Configuration loading traits and types
//! - [`transport`] - Transport tuning knobs (`TransportConfig`)
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with alias for shorter imports:
//! ```toml
//! [dependencies]
//! gridshm = { package = "gridshm_common", path = "../gridshm_common" }
//! ```
//!
//! Then import:
//! ```rust
//! use gridshm_common::consts::*;
//! use gridshm_common::config::{ConfigLoader, SharedConfig};
//! ```

pub mod config;
pub mod consts;
pub mod prelude;
pub mod transport;
