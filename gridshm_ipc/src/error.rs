//! Error types for shared-memory transport operations

use thiserror::Error;

/// Errors that can occur while creating, using or tearing down a channel
#[derive(Error, Debug)]
pub enum ShmError {
    /// Bad capacity or resource name
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong
        reason: String,
    },

    /// The OS could not allocate a region or semaphore (limits, name collision)
    #[error("Resource exhausted while allocating {name}: {reason}")]
    ResourceExhausted {
        /// Region or semaphore name
        name: String,
        /// Underlying cause
        reason: String,
    },

    /// Region or semaphore did not resolve within the attach window
    #[error("Shared resource not found: {name}")]
    NotFound {
        /// Region or semaphore name
        name: String,
    },

    /// Connect/accept could not complete
    #[error("Handshake failed: {reason}")]
    HandshakeFailed {
        /// Timeout, rejection or protocol mismatch
        reason: String,
    },

    /// The space was closed locally or by the peer
    #[error("Channel closed")]
    ChannelClosed,

    /// A blocking call exceeded its deadline
    #[error("Operation timed out")]
    Timeout,

    /// The liveness monitor found the peer process dead
    #[error("Peer process {pid} lost")]
    PeerLost {
        /// Process ID of the dead peer
        pid: u32,
    },

    /// The native provider cannot be loaded on this platform
    #[error("Unsupported platform: {reason}")]
    Unsupported {
        /// Why loading failed
        reason: String,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("System call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },

    /// Handshake token (de)serialization error
    #[error("JSON error: {source}")]
    Json {
        /// Source JSON error
        #[from]
        source: serde_json::Error,
    },
}

impl ShmError {
    /// No further read/write can succeed on the endpoint that produced this.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ChannelClosed | Self::PeerLost { .. })
    }

    /// The caller may retry the same call.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub(crate) fn handshake(reason: impl Into<String>) -> Self {
        Self::HandshakeFailed {
            reason: reason.into(),
        }
    }
}

impl From<ShmError> for std::io::Error {
    fn from(err: ShmError) -> Self {
        use std::io::ErrorKind;

        let kind = match &err {
            ShmError::InvalidArgument { .. } => ErrorKind::InvalidInput,
            ShmError::ResourceExhausted { .. } => ErrorKind::OutOfMemory,
            ShmError::NotFound { .. } => ErrorKind::NotFound,
            ShmError::HandshakeFailed { .. } => ErrorKind::ConnectionRefused,
            ShmError::ChannelClosed => ErrorKind::BrokenPipe,
            ShmError::Timeout => ErrorKind::TimedOut,
            ShmError::PeerLost { .. } => ErrorKind::ConnectionAborted,
            ShmError::Unsupported { .. } => ErrorKind::Unsupported,
            ShmError::Io { source } => source.kind(),
            ShmError::Nix { .. } | ShmError::Json { .. } => ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

/// Result type for shared-memory transport operations
pub type ShmResult<T> = Result<T, ShmError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[test]
    fn terminal_and_recoverable_are_disjoint() {
        let cases = [
            ShmError::ChannelClosed,
            ShmError::PeerLost { pid: 7 },
            ShmError::Timeout,
            ShmError::invalid("capacity"),
        ];
        for err in &cases {
            assert!(!(err.is_terminal() && err.is_recoverable()), "{err}");
        }
        assert!(cases[0].is_terminal());
        assert!(cases[1].is_terminal());
        assert!(cases[2].is_recoverable());
        assert!(!cases[3].is_terminal());
    }

    #[test]
    fn io_error_kinds() {
        let closed: std::io::Error = ShmError::ChannelClosed.into();
        assert_eq!(closed.kind(), ErrorKind::BrokenPipe);

        let timeout: std::io::Error = ShmError::Timeout.into();
        assert_eq!(timeout.kind(), ErrorKind::TimedOut);

        let lost: std::io::Error = ShmError::PeerLost { pid: 1 }.into();
        assert_eq!(lost.kind(), ErrorKind::ConnectionAborted);

        let wrapped: std::io::Error = ShmError::from(std::io::Error::from(
            ErrorKind::PermissionDenied,
        ))
        .into();
        assert_eq!(wrapped.kind(), ErrorKind::PermissionDenied);
    }
}
