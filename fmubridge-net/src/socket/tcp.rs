use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use crate::socket::{read_full, SocketConfig};
use crate::{Error, Result};

const DRAIN_BUF_LEN: usize = 512;

/// Stream binding.
pub struct TcpSocket {
    stream: Option<TcpStream>,
}

impl TcpSocket {
    pub fn new() -> Self {
        Self { stream: None }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn connect(&mut self, addr: SocketAddr, config: &SocketConfig) -> Result<()> {
        let stream = TcpStream::connect(addr).map_err(|e| Error::io("connect failed", e))?;
        stream
            .set_nodelay(config.nodelay)
            .map_err(|e| Error::io("failed setting nodelay", e))?;
        stream
            .set_read_timeout(config.read_timeout)
            .map_err(|e| Error::io("failed setting read timeout", e))?;
        trace!(
            "tcp stream {:?} -> {:?}",
            stream.local_addr().ok(),
            stream.peer_addr().ok()
        );
        self.stream = Some(stream);
        Ok(())
    }

    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        stream
            .write_all(bytes)
            .map_err(|e| Error::io("send failed", e))
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        read_full(stream, buf)
    }

    pub fn wait_for_peer_close(&mut self, timeout: Duration) -> Result<bool> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        if let Err(e) = stream.shutdown(Shutdown::Write) {
            // peer may already be gone
            debug!("shutdown before close failed: {}", e);
        }
        let previous_timeout = stream.read_timeout().ok().flatten();
        let deadline = Instant::now() + timeout;
        let mut scratch = [0; DRAIN_BUF_LEN];
        let closed = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining == Duration::from_secs(0) {
                break false;
            }
            stream
                .set_read_timeout(Some(remaining))
                .map_err(|e| Error::io("failed setting read timeout", e))?;
            match stream.read(&mut scratch) {
                Ok(0) => break true,
                Ok(n) => trace!("discarding {} bytes while waiting for peer close", n),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    break false
                }
                // reset by peer counts as closed
                Err(_) => break true,
            }
        };
        let _ = stream.set_read_timeout(previous_timeout);
        Ok(closed)
    }

    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                trace!("shutdown on close: {}", e);
            }
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.stream
            .as_ref()
            .ok_or(Error::NotConnected)?
            .local_addr()
            .map_err(|e| Error::io("no local address", e))
    }
}
