//! Duplex byte-stream connection over two spaces

use crate::error::ShmResult;
use crate::space::Space;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Bidirectional channel: bytes sent go to `outbound`, bytes received come
/// from `inbound`.
///
/// `send` and `receive` may run on different threads at the same time. Each
/// direction is single-producer/single-consumer; concurrent senders (or
/// receivers) are serialized.
#[derive(Debug)]
pub struct Endpoint {
    inbound: Arc<Space>,
    outbound: Arc<Space>,
    local_pid: u32,
    peer_pid: u32,
}

impl Endpoint {
    pub(crate) fn new(inbound: Space, outbound: Space, local_pid: u32, peer_pid: u32) -> Self {
        Self {
            inbound: Arc::new(inbound),
            outbound: Arc::new(outbound),
            local_pid,
            peer_pid,
        }
    }

    /// Send every byte of `data`, blocking while the outbound ring is full.
    pub fn send(&self, data: &[u8]) -> ShmResult<usize> {
        self.outbound.write(data)
    }

    /// [`send`](Self::send) with a deadline.
    pub fn send_timeout(&self, data: &[u8], timeout: Duration) -> ShmResult<usize> {
        self.outbound.write_timeout(data, Some(timeout))
    }

    /// Receive at least one byte; 0 means the peer closed and everything
    /// was delivered.
    pub fn receive(&self, buf: &mut [u8]) -> ShmResult<usize> {
        self.inbound.read(buf)
    }

    /// [`receive`](Self::receive) with a deadline.
    pub fn receive_timeout(&self, buf: &mut [u8], timeout: Duration) -> ShmResult<usize> {
        self.inbound.read_timeout(buf, Some(timeout))
    }

    /// Close both directions. Safe to call repeatedly and from any thread;
    /// blocked `send`/`receive` calls return promptly.
    pub fn close(&self) {
        self.outbound.close();
        self.inbound.close();
    }

    /// Whether either direction is closed
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed() || self.inbound.is_closed()
    }

    /// Process id of this side
    pub fn local_pid(&self) -> u32 {
        self.local_pid
    }

    /// Process id of the other side
    pub fn peer_pid(&self) -> u32 {
        self.peer_pid
    }

    /// Space carrying bytes from the peer
    pub fn inbound(&self) -> &Arc<Space> {
        &self.inbound
    }

    /// Space carrying bytes to the peer
    pub fn outbound(&self) -> &Arc<Space> {
        &self.outbound
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}

impl io::Read for &Endpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.receive(buf)?)
    }
}

impl io::Write for &Endpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.outbound.write_some(buf, None)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for Endpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }
}

impl io::Write for Endpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
