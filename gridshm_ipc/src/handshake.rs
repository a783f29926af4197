//! Connection setup over a loopback side channel
//!
//! Two unrelated processes have no shared naming authority, so the client
//! and server agree on space names over TCP before either opens anything:
//!
//! ```text
//! client                                 server
//!   | -- Request { version, pid, capacity } -->|  create c2s + s2c
//!   | <-- Offer { names, capacity, pid } ------|
//!   |  attach both                             |
//!   | -- Attached { pid } ------------------->|
//! ```
//!
//! Tokens are newline-delimited JSON. Either side answers a failure with
//! `Reject { reason }`. Spaces are owned values, so every exit path that does
//! not hand them to an [`Endpoint`] closes them; the server side removes its
//! regions unless the client confirms the attach in time.

use crate::endpoint::Endpoint;
use crate::error::{ShmError, ShmResult};
use crate::header::validate_capacity;
use crate::provider::NativeProvider;
use crate::space::Space;
use gridshm::consts::PROTOCOL_VERSION;
use gridshm::transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Message exchanged on the side channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Token {
    /// Client asks for a channel
    Request {
        /// Client protocol version
        version: u32,
        /// Client process id
        pid: u32,
        /// Requested capacity per direction, 0 for the server default
        capacity: usize,
    },
    /// Server created both spaces
    Offer {
        /// Server protocol version
        version: u32,
        /// Server process id
        pid: u32,
        /// Space the client writes into
        client_to_server: String,
        /// Space the client reads from
        server_to_client: String,
        /// Capacity of each space
        capacity: usize,
    },
    /// Client attached both spaces
    Attached {
        /// Client process id
        pid: u32,
    },
    /// Either side gives up
    Reject {
        /// Why
        reason: String,
    },
}

/// Client progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Not started
    Idle,
    /// Opening the side channel
    ConnectingSideChannel,
    /// Request written
    SentToken,
    /// Waiting for the offer
    AwaitingAck,
    /// Both spaces attached and confirmed
    Attached,
    /// Gave up
    Failed,
}

/// Server progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Not started
    Idle,
    /// Waiting for a side-channel connection
    ListeningSideChannel,
    /// Request read
    ReceivedToken,
    /// Both spaces created
    RegionsCreated,
    /// Offer written, waiting for the attach confirmation
    SentAck,
    /// Client confirmed
    Attached,
    /// Gave up
    Failed,
}

/// Names of the two spaces of a new channel: `(client_to_server, server_to_client)`
pub fn space_names(prefix: &str, pid: u32, sequence: u64) -> (String, String) {
    (
        format!("{prefix}_{pid}_{sequence}_c2s"),
        format!("{prefix}_{pid}_{sequence}_s2c"),
    )
}

fn side_channel(context: &str, err: io::Error) -> ShmError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            ShmError::handshake(format!("{context}: timed out"))
        }
        _ => ShmError::handshake(format!("{context}: {err}")),
    }
}

/// Newline-delimited JSON framing over a TCP stream
struct SideChannel {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl SideChannel {
    fn new(stream: TcpStream, config: &TransportConfig) -> ShmResult<Self> {
        let timeout = Some(config.handshake_timeout());
        stream
            .set_read_timeout(timeout)
            .and_then(|_| stream.set_write_timeout(timeout))
            .and_then(|_| stream.set_nodelay(true))
            .map_err(|e| side_channel("configuring side channel", e))?;
        let writer = stream
            .try_clone()
            .map_err(|e| side_channel("cloning side channel", e))?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    fn send(&mut self, token: &Token) -> ShmResult<()> {
        let mut line = serde_json::to_vec(token)?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .and_then(|_| self.writer.flush())
            .map_err(|e| side_channel("sending token", e))
    }

    fn receive(&mut self) -> ShmResult<Token> {
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .map_err(|e| side_channel("receiving token", e))?;
        if read == 0 {
            return Err(ShmError::handshake("side channel closed by peer"));
        }
        serde_json::from_str(line.trim_end())
            .map_err(|e| ShmError::handshake(format!("malformed token: {e}")))
    }

    /// Best effort: the peer may already be gone.
    fn reject(&mut self, reason: &str) {
        let _ = self.send(&Token::Reject {
            reason: reason.to_string(),
        });
    }
}

/// Client half of the handshake
pub struct ClientHandshake {
    provider: Arc<dyn NativeProvider>,
    config: TransportConfig,
    state: ClientState,
}

impl ClientHandshake {
    /// New handshake in `Idle`
    pub fn new(provider: Arc<dyn NativeProvider>, config: TransportConfig) -> Self {
        Self {
            provider,
            config,
            state: ClientState::Idle,
        }
    }

    /// Current state
    pub fn state(&self) -> ClientState {
        self.state
    }

    fn advance(&mut self, next: ClientState) {
        debug!(from = ?self.state, to = ?next, "Client handshake");
        self.state = next;
    }

    /// Connect to a listener at `addr` and attach the offered spaces.
    ///
    /// # Errors
    ///
    /// `HandshakeFailed` on timeout, rejection or version mismatch; attach
    /// failures are reported to the server before returning.
    pub fn connect(&mut self, addr: SocketAddr) -> ShmResult<Endpoint> {
        let result = self.run(addr);
        match &result {
            Ok(endpoint) => {
                self.advance(ClientState::Attached);
                debug!(peer = endpoint.peer_pid(), "Client handshake complete");
            }
            Err(e) => {
                self.advance(ClientState::Failed);
                warn!(%addr, error = %e, "Client handshake failed");
            }
        }
        result
    }

    fn run(&mut self, addr: SocketAddr) -> ShmResult<Endpoint> {
        self.advance(ClientState::ConnectingSideChannel);
        let stream = TcpStream::connect_timeout(&addr, self.config.handshake_timeout())
            .map_err(|e| side_channel("connecting side channel", e))?;
        let mut channel = SideChannel::new(stream, &self.config)?;

        let pid = self.provider.current_pid();
        channel.send(&Token::Request {
            version: PROTOCOL_VERSION,
            pid,
            capacity: self.config.capacity,
        })?;
        self.advance(ClientState::SentToken);

        self.advance(ClientState::AwaitingAck);
        let (server_pid, c2s, s2c) = match channel.receive()? {
            Token::Offer {
                version,
                pid,
                client_to_server,
                server_to_client,
                ..
            } => {
                if version != PROTOCOL_VERSION {
                    let reason =
                        format!("server protocol version {version}, expected {PROTOCOL_VERSION}");
                    channel.reject(&reason);
                    return Err(ShmError::handshake(reason));
                }
                (pid, client_to_server, server_to_client)
            }
            Token::Reject { reason } => {
                return Err(ShmError::handshake(format!("rejected by server: {reason}")));
            }
            other => {
                return Err(ShmError::handshake(format!("unexpected token {other:?}")));
            }
        };

        let attach = |name: &str| {
            Space::attach(
                Arc::clone(&self.provider),
                name,
                self.config.attach_timeout(),
                self.config.attach_retry_interval(),
            )
        };
        // Dropping an attached space on the error path detaches it again.
        let spaces = attach(&c2s).and_then(|outbound| attach(&s2c).map(|inbound| (inbound, outbound)));
        let (inbound, outbound) = match spaces {
            Ok(pair) => pair,
            Err(e) => {
                channel.reject(&format!("attach failed: {e}"));
                return Err(ShmError::handshake(format!("attach failed: {e}")));
            }
        };

        channel.send(&Token::Attached { pid })?;
        Ok(Endpoint::new(inbound, outbound, pid, server_pid))
    }
}

/// Server half of the handshake
pub struct ServerHandshake {
    provider: Arc<dyn NativeProvider>,
    config: TransportConfig,
    state: ServerState,
}

impl ServerHandshake {
    /// New handshake in `Idle`
    pub fn new(provider: Arc<dyn NativeProvider>, config: TransportConfig) -> Self {
        Self {
            provider,
            config,
            state: ServerState::Idle,
        }
    }

    /// Current state
    pub fn state(&self) -> ServerState {
        self.state
    }

    fn advance(&mut self, next: ServerState) {
        debug!(from = ?self.state, to = ?next, "Server handshake");
        self.state = next;
    }

    /// Accept one side-channel connection and set up a channel for it.
    ///
    /// # Errors
    ///
    /// `HandshakeFailed` on timeout, rejection or version mismatch, or the
    /// allocation error if a space cannot be created. Nothing stays allocated
    /// on failure.
    pub fn accept(&mut self, listener: &TcpListener) -> ShmResult<Endpoint> {
        self.advance(ServerState::ListeningSideChannel);
        let (stream, peer_addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                self.advance(ServerState::Failed);
                return Err(side_channel("accepting side channel", e));
            }
        };

        let result = self.run(stream);
        match &result {
            Ok(endpoint) => {
                self.advance(ServerState::Attached);
                debug!(%peer_addr, peer = endpoint.peer_pid(), "Server handshake complete");
            }
            Err(e) => {
                self.advance(ServerState::Failed);
                warn!(%peer_addr, error = %e, "Server handshake failed, spaces rolled back");
            }
        }
        result
    }

    fn run(&mut self, stream: TcpStream) -> ShmResult<Endpoint> {
        let mut channel = SideChannel::new(stream, &self.config)?;

        let (client_pid, requested) = match channel.receive()? {
            Token::Request {
                version,
                pid,
                capacity,
            } => {
                if version != PROTOCOL_VERSION {
                    let reason =
                        format!("client protocol version {version}, expected {PROTOCOL_VERSION}");
                    channel.reject(&reason);
                    return Err(ShmError::handshake(reason));
                }
                (pid, capacity)
            }
            other => {
                let reason = format!("unexpected token {other:?}");
                channel.reject(&reason);
                return Err(ShmError::handshake(reason));
            }
        };
        self.advance(ServerState::ReceivedToken);

        let capacity = if requested == 0 {
            self.config.capacity
        } else {
            requested
        };
        if let Err(e) = validate_capacity(capacity) {
            channel.reject(&e.to_string());
            return Err(ShmError::handshake(e.to_string()));
        }

        let pid = self.provider.current_pid();
        let sequence = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let (c2s, s2c) = space_names(&self.config.name_prefix, pid, sequence);
        let spaces = Space::create(Arc::clone(&self.provider), &c2s, capacity).and_then(|inbound| {
            Space::create(Arc::clone(&self.provider), &s2c, capacity).map(|outbound| (inbound, outbound))
        });
        let (inbound, outbound) = match spaces {
            Ok(pair) => pair,
            Err(e) => {
                channel.reject(&format!("cannot allocate spaces: {e}"));
                return Err(e);
            }
        };
        self.advance(ServerState::RegionsCreated);

        channel.send(&Token::Offer {
            version: PROTOCOL_VERSION,
            pid,
            client_to_server: c2s,
            server_to_client: s2c,
            capacity,
        })?;
        self.advance(ServerState::SentAck);

        match channel.receive()? {
            Token::Attached { pid: attached } if attached == client_pid => {
                Ok(Endpoint::new(inbound, outbound, pid, client_pid))
            }
            Token::Attached { pid: attached } => Err(ShmError::handshake(format!(
                "attach confirmed by pid {attached}, expected {client_pid}"
            ))),
            Token::Reject { reason } => {
                Err(ShmError::handshake(format!("rejected by client: {reason}")))
            }
            other => Err(ShmError::handshake(format!("unexpected token {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::InMemoryProvider;
    use gridshm::consts::SPACE_MAX_CAPACITY;
    use std::time::Duration;

    fn config() -> TransportConfig {
        TransportConfig {
            capacity: 256,
            handshake_timeout_ms: 500,
            attach_timeout_ms: 200,
            attach_retry_interval_ms: 1,
            ..TransportConfig::default()
        }
    }

    #[test]
    fn tokens_are_tagged_json() {
        let json = serde_json::to_string(&Token::Attached { pid: 7 }).unwrap();
        assert_eq!(json, r#"{"type":"attached","pid":7}"#);
        let back: Token = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Token::Attached { pid: 7 });
    }

    #[test]
    fn names_carry_pid_and_direction() {
        let (c2s, s2c) = space_names("gridshm", 42, 3);
        assert_eq!(c2s, "gridshm_42_3_c2s");
        assert_eq!(s2c, "gridshm_42_3_s2c");
    }

    #[test]
    fn longest_prefix_yields_valid_names() {
        let prefix = "p".repeat(gridshm::consts::MAX_NAME_PREFIX_LEN);
        let (c2s, s2c) = space_names(&prefix, u32::MAX, u64::MAX);
        for name in [&c2s, &s2c] {
            crate::provider::validate_name(name).unwrap();
            crate::provider::validate_name(&crate::space::space_semaphore_name(name)).unwrap();
            crate::provider::validate_name(&crate::space::data_semaphore_name(name)).unwrap();
        }
    }

    #[test]
    fn full_handshake() {
        let memory = InMemoryProvider::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server_provider: Arc<dyn NativeProvider> = Arc::new(memory.for_process(1000));
        let server = std::thread::spawn(move || {
            let mut handshake = ServerHandshake::new(server_provider, config());
            let endpoint = handshake.accept(&listener);
            (handshake.state(), endpoint)
        });

        let mut client = ClientHandshake::new(Arc::new(memory.for_process(2000)), config());
        let endpoint = client.connect(addr).unwrap();
        assert_eq!(client.state(), ClientState::Attached);

        let (state, server_endpoint) = server.join().unwrap();
        assert_eq!(state, ServerState::Attached);
        let server_endpoint = server_endpoint.unwrap();
        assert_eq!(endpoint.peer_pid(), 1000);
        assert_eq!(server_endpoint.peer_pid(), 2000);
        assert_eq!(memory.region_count(), 2);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let memory = InMemoryProvider::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let provider: Arc<dyn NativeProvider> = Arc::new(memory.clone());
        let server = std::thread::spawn(move || {
            ServerHandshake::new(provider, config()).accept(&listener)
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut channel = SideChannel::new(stream, &config()).unwrap();
        channel
            .send(&Token::Request {
                version: PROTOCOL_VERSION + 1,
                pid: 5,
                capacity: 0,
            })
            .unwrap();
        assert!(matches!(channel.receive().unwrap(), Token::Reject { .. }));
        assert!(matches!(
            server.join().unwrap(),
            Err(ShmError::HandshakeFailed { .. })
        ));
        assert_eq!(memory.region_count(), 0);
    }

    #[test]
    fn silent_client_rolls_back_server() {
        let memory = InMemoryProvider::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let provider: Arc<dyn NativeProvider> = Arc::new(memory.clone());
        let server = std::thread::spawn(move || {
            let mut handshake = ServerHandshake::new(provider, config());
            (handshake.accept(&listener), handshake.state())
        });

        // Ask for a channel, take the offer, never confirm.
        let stream = TcpStream::connect(addr).unwrap();
        let mut channel = SideChannel::new(stream, &config()).unwrap();
        channel
            .send(&Token::Request {
                version: PROTOCOL_VERSION,
                pid: 5,
                capacity: 64,
            })
            .unwrap();
        assert!(matches!(
            channel.receive().unwrap(),
            Token::Offer { capacity: 64, .. }
        ));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(memory.region_count(), 2);

        let (result, state) = server.join().unwrap();
        assert!(matches!(result, Err(ShmError::HandshakeFailed { .. })));
        assert_eq!(state, ServerState::Failed);
        assert_eq!(memory.region_count(), 0);
        assert_eq!(memory.semaphore_count(), 0);
    }

    #[test]
    fn client_fails_without_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = ClientHandshake::new(Arc::new(InMemoryProvider::new()), config());
        assert!(matches!(
            client.connect(addr),
            Err(ShmError::HandshakeFailed { .. })
        ));
        assert_eq!(client.state(), ClientState::Failed);
    }

    #[test]
    fn oversized_capacity_is_rejected() {
        let memory = InMemoryProvider::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let provider: Arc<dyn NativeProvider> = Arc::new(memory.for_process(1000));
        let server = std::thread::spawn(move || {
            let mut handshake = ServerHandshake::new(provider, config());
            (handshake.accept(&listener), handshake.state())
        });

        let greedy = TransportConfig {
            capacity: SPACE_MAX_CAPACITY + 1,
            ..config()
        };
        let mut client = ClientHandshake::new(Arc::new(memory.for_process(2000)), greedy);
        let err = client.connect(addr).unwrap_err();
        assert!(matches!(err, ShmError::HandshakeFailed { ref reason } if reason.contains("rejected by server")));

        let (result, state) = server.join().unwrap();
        assert!(matches!(result, Err(ShmError::HandshakeFailed { .. })));
        assert_eq!(state, ServerState::Failed);
        assert_eq!(memory.region_count(), 0);
        assert_eq!(memory.semaphore_count(), 0);
    }

    #[test]
    fn second_attach_failure_detaches_first_space() {
        let memory = InMemoryProvider::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        // Hand-driven server that offers an s2c space it never created.
        let provider: Arc<dyn NativeProvider> = Arc::new(memory.for_process(1000));
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut channel = SideChannel::new(stream, &config()).unwrap();
            assert!(matches!(channel.receive().unwrap(), Token::Request { .. }));

            let (c2s, s2c) = space_names("halfmade", 1000, 0);
            let inbound = Space::create(provider, &c2s, 64).unwrap();
            channel
                .send(&Token::Offer {
                    version: PROTOCOL_VERSION,
                    pid: 1000,
                    client_to_server: c2s,
                    server_to_client: s2c,
                    capacity: 64,
                })
                .unwrap();
            let answer = channel.receive().unwrap();
            (answer, inbound.attach_count())
        });

        let mut client = ClientHandshake::new(Arc::new(memory.for_process(2000)), config());
        let err = client.connect(addr).unwrap_err();
        assert!(matches!(err, ShmError::HandshakeFailed { ref reason } if reason.contains("attach failed")));
        assert_eq!(client.state(), ClientState::Failed);

        let (answer, attach_count) = server.join().unwrap();
        assert!(matches!(answer, Token::Reject { .. }));
        assert_eq!(attach_count, 1);
        assert_eq!(memory.region_count(), 0);
        assert_eq!(memory.semaphore_count(), 0);
    }

    #[test]
    fn accept_error_is_a_handshake_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();

        let mut server = ServerHandshake::new(Arc::new(InMemoryProvider::new()), config());
        assert!(matches!(
            server.accept(&listener),
            Err(ShmError::HandshakeFailed { .. })
        ));
        assert_eq!(server.state(), ServerState::Failed);
    }
}
