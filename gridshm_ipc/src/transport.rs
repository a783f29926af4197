//! Listener/connector facade tying handshake, spaces and the monitor together

use crate::endpoint::Endpoint;
use crate::error::{ShmError, ShmResult};
use crate::handshake::{ClientHandshake, ServerHandshake};
use crate::monitor::LivenessMonitor;
use crate::platform;
use crate::provider::NativeProvider;
use gridshm::transport::TransportConfig;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::Arc;
use tracing::info;

fn resolve(addr: impl ToSocketAddrs) -> ShmResult<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| ShmError::invalid("address resolved to nothing"))
}

/// Entry point for opening shared-memory channels
pub struct Transport {
    config: TransportConfig,
    provider: Arc<dyn NativeProvider>,
    monitor: Arc<LivenessMonitor>,
}

impl Transport {
    /// Validate `config` and start the liveness monitor.
    pub fn new(config: TransportConfig, provider: Arc<dyn NativeProvider>) -> ShmResult<Self> {
        config
            .validate()
            .map_err(|e| ShmError::invalid(e.to_string()))?;
        let monitor = Arc::new(LivenessMonitor::start(
            Arc::clone(&provider),
            config.monitor_interval(),
        )?);
        Ok(Self {
            config,
            provider,
            monitor,
        })
    }

    /// [`new`](Self::new) with the platform's native provider.
    pub fn native(config: TransportConfig) -> ShmResult<Self> {
        Self::new(config, platform::load()?)
    }

    /// Active configuration
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Provider used for every space
    pub fn provider(&self) -> &Arc<dyn NativeProvider> {
        &self.provider
    }

    /// Monitor watching every peer of this transport
    pub fn monitor(&self) -> &LivenessMonitor {
        &self.monitor
    }

    /// Bind the side channel on a loopback address.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a non-loopback address, `Io` if binding fails.
    pub fn listen(&self, addr: impl ToSocketAddrs) -> ShmResult<ShmemListener> {
        let addr = resolve(addr)?;
        if !addr.ip().is_loopback() {
            return Err(ShmError::invalid(format!(
                "side channel must bind a loopback address, got {addr}"
            )));
        }
        let listener = TcpListener::bind(addr)?;
        info!(addr = %listener.local_addr()?, "Listening for shared-memory connections");
        Ok(ShmemListener {
            listener,
            config: self.config.clone(),
            provider: Arc::clone(&self.provider),
            monitor: Arc::clone(&self.monitor),
        })
    }

    /// Connect to a [`ShmemListener`] and return the client endpoint.
    pub fn connect(&self, addr: impl ToSocketAddrs) -> ShmResult<Endpoint> {
        let addr = resolve(addr)?;
        let endpoint =
            ClientHandshake::new(Arc::clone(&self.provider), self.config.clone()).connect(addr)?;
        register(&self.monitor, &endpoint);
        Ok(endpoint)
    }
}

fn register(monitor: &LivenessMonitor, endpoint: &Endpoint) {
    monitor.register(endpoint.peer_pid(), endpoint.inbound());
    monitor.register(endpoint.peer_pid(), endpoint.outbound());
}

/// Accepts shared-memory connections on a side-channel socket
pub struct ShmemListener {
    listener: TcpListener,
    config: TransportConfig,
    provider: Arc<dyn NativeProvider>,
    monitor: Arc<LivenessMonitor>,
}

impl ShmemListener {
    /// Bound side-channel address
    pub fn local_addr(&self) -> ShmResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for one client and complete its handshake.
    pub fn accept(&self) -> ShmResult<Endpoint> {
        let endpoint = ServerHandshake::new(Arc::clone(&self.provider), self.config.clone())
            .accept(&self.listener)?;
        register(&self.monitor, &endpoint);
        info!(peer = endpoint.peer_pid(), "Accepted shared-memory connection");
        Ok(endpoint)
    }

    /// Endless iterator over [`accept`](Self::accept) results
    pub fn incoming(&self) -> impl Iterator<Item = ShmResult<Endpoint>> + '_ {
        std::iter::repeat_with(move || self.accept())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::InMemoryProvider;

    #[test]
    fn invalid_config_is_refused() {
        let config = TransportConfig {
            capacity: 0,
            ..TransportConfig::default()
        };
        assert!(matches!(
            Transport::new(config, Arc::new(InMemoryProvider::new())),
            Err(ShmError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn listen_requires_loopback() {
        let transport =
            Transport::new(TransportConfig::default(), Arc::new(InMemoryProvider::new())).unwrap();
        assert!(matches!(
            transport.listen("0.0.0.0:0"),
            Err(ShmError::InvalidArgument { .. })
        ));
        let listener = transport.listen("127.0.0.1:0").unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
