//! Listener/connector round trips through the full handshake

use gridshm::transport::TransportConfig;
use gridshm_ipc::{Endpoint, InMemoryProvider, ShmError, ShmResult, Transport};
use std::io::{Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn config(capacity: usize) -> TransportConfig {
    TransportConfig {
        capacity,
        handshake_timeout_ms: 2000,
        attach_timeout_ms: 500,
        attach_retry_interval_ms: 1,
        monitor_interval_ms: 20,
        ..TransportConfig::default()
    }
}

/// Server transport as pid 1000, client transport as pid 2000, one namespace.
fn transports(capacity: usize) -> ShmResult<(InMemoryProvider, Transport, Transport)> {
    let memory = InMemoryProvider::new();
    let server = Transport::new(config(capacity), Arc::new(memory.for_process(1000)))?;
    let client = Transport::new(config(capacity), Arc::new(memory.for_process(2000)))?;
    Ok((memory, server, client))
}

fn connect_pair(server: &Transport, client: &Transport) -> ShmResult<(Endpoint, Endpoint)> {
    let listener = server.listen("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    thread::scope(|scope| -> ShmResult<(Endpoint, Endpoint)> {
        let accepted = scope.spawn(|| listener.accept());
        let connected = client.connect(addr);
        let accepted = accepted.join().unwrap();
        Ok((connected?, accepted?))
    })
}

#[test]
fn test_handshake_cross_wires_endpoints() -> ShmResult<()> {
    let (memory, server, client) = transports(1024)?;
    let (client_end, server_end) = connect_pair(&server, &client)?;

    assert_eq!(client_end.local_pid(), 2000);
    assert_eq!(client_end.peer_pid(), 1000);
    assert_eq!(server_end.peer_pid(), 2000);
    assert_eq!(memory.region_count(), 2);

    client_end.send(b"request")?;
    let mut buf = [0u8; 16];
    assert_eq!(server_end.receive(&mut buf)?, 7);
    assert_eq!(&buf[..7], b"request");

    server_end.send(b"response")?;
    assert_eq!(client_end.receive(&mut buf)?, 8);
    assert_eq!(&buf[..8], b"response");
    Ok(())
}

#[test]
fn test_both_sides_register_their_peer() -> ShmResult<()> {
    let (_memory, server, client) = transports(256)?;
    let (_client_end, _server_end) = connect_pair(&server, &client)?;
    assert_eq!(server.monitor().tracked_peers(), vec![2000]);
    assert_eq!(client.monitor().tracked_peers(), vec![1000]);
    Ok(())
}

#[test]
fn test_streams_in_both_directions_concurrently() -> ShmResult<()> {
    let (_memory, server, client) = transports(64)?;
    let (client_end, server_end) = connect_pair(&server, &client)?;
    let up: Vec<u8> = (0..20_000u32).map(|i| (i % 253) as u8).collect();
    let down: Vec<u8> = (0..20_000u32).map(|i| (i % 241) as u8).collect();

    let (got_up, got_down) = thread::scope(|scope| {
        let client_send = scope.spawn(|| (&client_end).write_all(&up));
        let server_send = scope.spawn(|| (&server_end).write_all(&down));
        let server_recv = scope.spawn(|| {
            let mut got = vec![0u8; up.len()];
            (&server_end).read_exact(&mut got).map(|_| got)
        });

        let mut got_down = vec![0u8; down.len()];
        (&client_end).read_exact(&mut got_down).unwrap();
        client_send.join().unwrap().unwrap();
        server_send.join().unwrap().unwrap();
        (server_recv.join().unwrap().unwrap(), got_down)
    });

    assert_eq!(got_up, up);
    assert_eq!(got_down, down);
    Ok(())
}

#[test]
fn test_close_is_seen_by_peer() -> ShmResult<()> {
    let (memory, server, client) = transports(128)?;
    let (client_end, server_end) = connect_pair(&server, &client)?;

    client_end.send(b"bye")?;
    client_end.close();
    client_end.close();
    assert!(client_end.is_closed());

    let mut buf = [0u8; 8];
    assert_eq!(server_end.receive(&mut buf)?, 3);
    assert_eq!(server_end.receive(&mut buf)?, 0);
    assert!(matches!(server_end.send(b"late"), Err(ShmError::ChannelClosed)));

    drop(server_end);
    assert_eq!(memory.region_count(), 0);
    assert_eq!(memory.semaphore_count(), 0);
    Ok(())
}

#[test]
fn test_io_errors_carry_kinds() -> ShmResult<()> {
    let (_memory, server, client) = transports(128)?;
    let (client_end, server_end) = connect_pair(&server, &client)?;
    server_end.close();

    let err = (&client_end).write(b"x").unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);

    let mut buf = [0u8; 1];
    assert_eq!((&client_end).read(&mut buf).unwrap(), 0);
    Ok(())
}

#[test]
fn test_receive_timeout_then_data() -> ShmResult<()> {
    let (_memory, server, client) = transports(128)?;
    let (client_end, server_end) = connect_pair(&server, &client)?;

    let mut buf = [0u8; 4];
    let err = client_end
        .receive_timeout(&mut buf, Duration::from_millis(10))
        .unwrap_err();
    assert!(err.is_recoverable());

    server_end.send_timeout(b"late", Duration::from_millis(100))?;
    assert_eq!(client_end.receive_timeout(&mut buf, Duration::from_millis(100))?, 4);
    Ok(())
}

#[test]
fn test_connect_without_listener_fails() -> ShmResult<()> {
    let (_memory, server, client) = transports(128)?;
    let addr = server.listen("127.0.0.1:0")?.local_addr()?;
    // Listener dropped: nothing accepts on addr anymore.
    assert!(matches!(
        client.connect(addr),
        Err(ShmError::HandshakeFailed { .. })
    ));
    Ok(())
}

#[test]
fn test_listener_serves_several_clients() -> ShmResult<()> {
    let (memory, server, client) = transports(128)?;
    let listener = server.listen("127.0.0.1:0")?;
    let addr = listener.local_addr()?;

    thread::scope(|scope| -> ShmResult<()> {
        let acceptor = scope.spawn(|| listener.incoming().take(3).collect::<Vec<_>>());
        let clients: Vec<Endpoint> = (0..3)
            .map(|_| client.connect(addr))
            .collect::<ShmResult<_>>()?;
        let servers = acceptor
            .join()
            .unwrap()
            .into_iter()
            .collect::<ShmResult<Vec<_>>>()?;

        assert_eq!(servers.len(), 3);
        assert_eq!(memory.region_count(), 6);
        drop(clients);
        drop(servers);
        Ok(())
    })?;

    assert_eq!(memory.region_count(), 0);
    Ok(())
}
