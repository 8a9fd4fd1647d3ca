use std::io::{self, Read};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::socket::{read_full, SocketConfig};
use crate::{Error, Result};

/// Datagram binding with a fixed destination.
pub struct UdpSocket {
    socket: Option<std::net::UdpSocket>,
}

/// Adapts datagram receives to `Read` so partial reads are reassembled the
/// same way as on streams.
struct DatagramReader<'a>(&'a std::net::UdpSocket);

impl<'a> Read for DatagramReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.recv(buf)
    }
}

impl UdpSocket {
    pub fn new() -> Self {
        Self { socket: None }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    pub fn connect(&mut self, addr: SocketAddr, config: &SocketConfig) -> Result<()> {
        let local: SocketAddr = match addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = std::net::UdpSocket::bind(local).map_err(|e| Error::io("bind failed", e))?;
        socket
            .connect(addr)
            .map_err(|e| Error::io("connect failed", e))?;
        socket
            .set_read_timeout(config.read_timeout)
            .map_err(|e| Error::io("failed setting read timeout", e))?;
        trace!("udp socket {:?} -> {:?}", socket.local_addr().ok(), addr);
        self.socket = Some(socket);
        Ok(())
    }

    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(Error::NotConnected)?;
        let sent = socket.send(bytes).map_err(|e| Error::io("send failed", e))?;
        if sent != bytes.len() {
            return Err(Error::Other(format!(
                "datagram truncated: sent {} of {} bytes",
                sent,
                bytes.len()
            )));
        }
        Ok(())
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let socket = self.socket.as_ref().ok_or(Error::NotConnected)?;
        read_full(&mut DatagramReader(socket), buf)
    }

    pub fn close(&mut self) {
        self.socket = None;
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .as_ref()
            .ok_or(Error::NotConnected)?
            .local_addr()
            .map_err(|e| Error::io("no local address", e))
    }
}
