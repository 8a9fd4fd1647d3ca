//! Byte stream channel to the worker process.
//!
//! [`Socket`] hides the concrete binding (TCP or UDP) behind one blocking
//! interface: open with retries, write a whole buffer, read an exact number
//! of bytes, close. Failed transfers close the channel and leave a
//! description of the failure behind, retrievable with
//! [`Socket::last_error_description`].

use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use fmubridge_core::{RetryPolicy, TransportKind};

use crate::cancel::CancelToken;
use crate::msg::{self, STATUS_WORD_LEN};
use crate::{Error, Result};

mod tcp;
mod udp;

#[derive(Debug, Copy, Clone)]
pub struct SocketConfig {
    /// Read timeout applied to every receive, `None` blocks indefinitely
    pub read_timeout: Option<Duration>,
    /// Disables Nagle's algorithm on stream bindings
    pub nodelay: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            read_timeout: None,
            nodelay: true,
        }
    }
}

/// Main socket abstraction.
pub struct Socket {
    inner: InnerSocket,
    config: SocketConfig,
    host: String,
    port: String,
    last_error: String,
}

/// Wrapper over different socket types by transport.
pub enum InnerSocket {
    Tcp(tcp::TcpSocket),
    Udp(udp::UdpSocket),
}

impl Socket {
    /// Creates a new unconfigured socket using the given transport.
    pub fn new(transport: TransportKind) -> Self {
        Self::new_with_config(transport, SocketConfig::default())
    }

    pub fn new_with_config(transport: TransportKind, config: SocketConfig) -> Self {
        let inner = match transport {
            TransportKind::Tcp => InnerSocket::Tcp(tcp::TcpSocket::new()),
            TransportKind::Udp => InnerSocket::Udp(udp::UdpSocket::new()),
        };
        Self {
            inner,
            config,
            host: String::new(),
            port: String::new(),
            last_error: String::new(),
        }
    }

    pub fn transport(&self) -> TransportKind {
        match &self.inner {
            InnerSocket::Tcp(_) => TransportKind::Tcp,
            InnerSocket::Udp(_) => TransportKind::Udp,
        }
    }

    pub fn config(&self) -> SocketConfig {
        self.config
    }

    /// Sets the remote endpoint used by subsequent opens. Takes effect on
    /// the next (re)connect.
    pub fn configure(&mut self, port: &str, host: &str) {
        self.port = port.to_string();
        self.host = host.to_string();
    }

    /// Remote endpoint as `host:port`.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_connected(&self) -> bool {
        match &self.inner {
            InnerSocket::Tcp(socket) => socket.is_connected(),
            InnerSocket::Udp(socket) => socket.is_connected(),
        }
    }

    /// Description of the most recent failure.
    pub fn last_error_description(&self) -> &str {
        &self.last_error
    }

    /// Connects to the configured endpoint, retrying according to `policy`.
    ///
    /// Every wait between attempts checks `cancel`.
    pub fn open(&mut self, policy: &RetryPolicy, cancel: &CancelToken) -> Result<()> {
        if self.is_connected() {
            self.close();
        }
        let mut attempts = 0;
        loop {
            cancel.check()?;
            match self.try_open() {
                Ok(()) => {
                    info!(
                        "connected to {} over {} after {} failed attempts",
                        self.endpoint(),
                        self.transport(),
                        attempts
                    );
                    return Ok(());
                }
                Err(e) => {
                    attempts += 1;
                    self.record(&e);
                    if !policy.allows_retry(attempts) {
                        warn!("giving up connecting to {}: {}", self.endpoint(), e);
                        return Err(Error::RetriesExhausted {
                            addr: self.endpoint(),
                            attempts,
                        });
                    }
                    debug!(
                        "connecting to {} failed ({}), retrying in {:?}",
                        self.endpoint(),
                        e,
                        policy.delay
                    );
                    cancel.sleep(policy.delay)?;
                }
            }
        }
    }

    /// Single connection attempt, no retries. Failures are recorded.
    pub(crate) fn open_once(&mut self) -> Result<()> {
        if self.is_connected() {
            self.close();
        }
        let result = self.try_open();
        if let Err(e) = &result {
            self.record(e);
        }
        result
    }

    fn try_open(&mut self) -> Result<()> {
        let addr = self.resolve()?;
        let config = self.config;
        match &mut self.inner {
            InnerSocket::Tcp(socket) => socket.connect(addr, &config),
            InnerSocket::Udp(socket) => socket.connect(addr, &config),
        }
    }

    fn resolve(&self) -> Result<SocketAddr> {
        let port = self
            .port
            .trim()
            .parse::<u16>()
            .map_err(|e| Error::ResolveFailed(format!("invalid port `{}`: {}", self.port, e)))?;
        (self.host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| Error::ResolveFailed(format!("{}: {}", self.endpoint(), e)))?
            .next()
            .ok_or_else(|| Error::ResolveFailed(format!("{}: no addresses", self.endpoint())))
    }

    /// Sends the whole buffer. On failure the channel is closed.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let result = match &mut self.inner {
            InnerSocket::Tcp(socket) => socket.send(bytes),
            InnerSocket::Udp(socket) => socket.send(bytes),
        };
        self.check(result)
    }

    /// Fills `buf` completely, looping over partial reads. On failure the
    /// channel is closed.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<usize> {
        let result = match &mut self.inner {
            InnerSocket::Tcp(socket) => socket.recv(buf),
            InnerSocket::Udp(socket) => socket.recv(buf),
        };
        self.check(result)
    }

    /// Reads a single little-endian status word.
    pub fn read_status_word(&mut self) -> Result<i32> {
        let mut buf = [0; STATUS_WORD_LEN];
        self.read_exact(&mut buf)?;
        Ok(msg::decode_status(&buf))
    }

    /// Half-closes the channel and waits up to `timeout` for the peer to
    /// close its side, discarding anything it still sends.
    ///
    /// Returns `false` if the peer kept the connection open. Datagram
    /// bindings have no connection to wait for and return immediately.
    pub fn wait_for_peer_close(&mut self, timeout: Duration) -> Result<bool> {
        match &mut self.inner {
            InnerSocket::Tcp(socket) => socket.wait_for_peer_close(timeout),
            InnerSocket::Udp(_) => Ok(true),
        }
    }

    /// Tears down the connection. Safe to call on a closed socket.
    pub fn close(&mut self) {
        match &mut self.inner {
            InnerSocket::Tcp(socket) => socket.close(),
            InnerSocket::Udp(socket) => socket.close(),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.inner {
            InnerSocket::Tcp(socket) => socket.local_addr(),
            InnerSocket::Udp(socket) => socket.local_addr(),
        }
    }

    fn record(&mut self, e: &Error) {
        self.last_error = format!("Socket Error: {}", e);
    }

    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.record(e);
            warn!("{} ({}), closing channel", self.last_error, self.endpoint());
            self.close();
        }
        result
    }
}

/// Reads from `reader` until `buf` is full.
///
/// A zero-byte read means the peer closed the channel. Interrupted reads are
/// retried.
pub fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(Error::PeerClosed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                return Err(Error::TimedOut)
            }
            Err(e) => return Err(Error::io("receive failed", e)),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    /// Hands out the scripted chunks one read at a time.
    struct Fragmented {
        chunks: VecDeque<io::Result<Vec<u8>>>,
    }

    impl Read for Fragmented {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(Ok(chunk)) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }
    }

    #[test]
    fn partial_reads_are_reassembled() {
        let mut reader = Fragmented {
            chunks: vec![
                Ok(vec![1, 2, 3]),
                Err(io::ErrorKind::Interrupted.into()),
                Ok(vec![4]),
                Ok(vec![5, 6, 7, 8]),
            ]
            .into_iter()
            .collect(),
        };
        let mut buf = [0; 8];
        assert_eq!(read_full(&mut reader, &mut buf).unwrap(), 8);
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn early_eof_is_peer_closed() {
        let mut reader = Fragmented {
            chunks: vec![Ok(vec![1, 2])].into_iter().collect(),
        };
        let mut buf = [0; 4];
        assert!(matches!(
            read_full(&mut reader, &mut buf),
            Err(Error::PeerClosed)
        ));
    }

    #[test]
    fn hard_errors_surface() {
        let mut reader = Fragmented {
            chunks: vec![Err(io::ErrorKind::ConnectionReset.into())]
                .into_iter()
                .collect(),
        };
        let mut buf = [0; 4];
        assert!(matches!(
            read_full(&mut reader, &mut buf),
            Err(Error::Io { .. })
        ));
    }

    #[test]
    fn unconfigured_socket_fails_to_resolve() {
        let mut socket = Socket::new(TransportKind::Tcp);
        socket.configure("not-a-port", "127.0.0.1");
        let policy = RetryPolicy::bounded(1, Duration::from_millis(1));
        let result = socket.open(&policy, &CancelToken::new());
        assert!(matches!(result, Err(Error::RetriesExhausted { attempts: 1, .. })));
        assert!(socket
            .last_error_description()
            .starts_with("Socket Error: failed resolving address"));
    }

    #[test]
    fn cancelled_open_stops() {
        let mut socket = Socket::new(TransportKind::Tcp);
        socket.configure("1", "127.0.0.1");
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            socket.open(&RetryPolicy::default(), &cancel),
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn closed_socket_reports_not_connected() {
        let mut socket = Socket::new(TransportKind::Udp);
        assert!(!socket.is_connected());
        assert!(matches!(socket.write(&[1]), Err(Error::NotConnected)));
        let mut buf = [0; 1];
        assert!(matches!(
            socket.read_exact(&mut buf),
            Err(Error::NotConnected)
        ));
        socket.close();
    }
}
