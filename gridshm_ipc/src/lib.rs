//! # Grid Shared Memory IPC
//!
//! Same-host byte-stream channels between two processes, carried by
//! memory-mapped ring buffers instead of the kernel network stack.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐   side channel (TCP loopback)   ┌──────────────┐
//! │   Client     │ ◄─────── handshake tokens ─────► │   Server     │
//! │              │                                  │              │
//! │  Endpoint    │ ── Space c2s [Header|Ring] ────► │  Endpoint    │
//! │              │ ◄─ Space s2c [Header|Ring] ───── │              │
//! └──────┬───────┘                                  └──────┬───────┘
//!        │                                                 │
//!  LivenessMonitor                                  LivenessMonitor
//!  (polls server pid)                               (polls client pid)
//! ```
//!
//! - [`Space`]: one single-producer/single-consumer ring buffer in a named
//!   region, with two named semaphores as wake-up doorbells.
//! - [`Endpoint`]: two spaces, one per direction.
//! - [`handshake`]: agrees on space names over a loopback TCP connection and
//!   rolls back everything on failure.
//! - [`LivenessMonitor`]: invalidates spaces whose peer process died.
//! - [`NativeProvider`]: the OS capability interface (regions, semaphores,
//!   liveness). [`PosixProvider`](platform::PosixProvider) on Linux,
//!   [`InMemoryProvider`] for tests.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use gridshm::transport::TransportConfig;
//! use gridshm_ipc::Transport;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Transport::native(TransportConfig::default())?;
//! let endpoint = transport.connect("127.0.0.1:7400")?;
//! endpoint.send(b"hello")?;
//!
//! let mut reply = [0u8; 5];
//! let n = endpoint.receive(&mut reply)?;
//! assert!(n > 0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Errors
//!
//! `Timeout` is recoverable; `ChannelClosed` and `PeerLost` are terminal for
//! the endpoint (see [`ShmError::is_terminal`]).

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod endpoint;
pub mod error;
pub mod handshake;
pub mod header;
pub mod monitor;
pub mod platform;
pub mod provider;
pub mod space;
pub mod transport;

pub use endpoint::Endpoint;
pub use error::{ShmError, ShmResult};
pub use handshake::{ClientState, ServerState, Token};
pub use monitor::{
    LivenessMonitor, LogFilePeerLostHandler, PeerLostEvent, PeerLostHandler, reclaim_orphans,
};
pub use provider::{InMemoryProvider, NamedSemaphore, NativeProvider, SharedRegion, WaitOutcome};
pub use space::Space;
pub use transport::{ShmemListener, Transport};

/// Initialize tracing from `RUST_LOG`
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
