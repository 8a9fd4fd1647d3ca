//! Stand-in worker for exercising bridges without the real target.
//!
//! Acknowledges every step request, optionally asking for a reset every
//! few steps. With a data port configured it also serves data records from
//! an in-memory map, answering reads of unknown addresses with zeros.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use anyhow::Result;

use fmubridge_net::msg::{self, AckCode, DataRecord, RecordOp, RECORD_HEADER_LEN, SERVER_READY};
use fmubridge_net::socket::read_full;
use fmubridge_net::{CancelToken, Error};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const READ_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct MockConfig {
    pub host: String,
    pub port: u16,
    /// Request a reset on every n-th step
    pub reset_every: Option<u64>,
    pub data_port: Option<u16>,
}

pub struct MockWorker {
    config: MockConfig,
    listener: TcpListener,
    data_listener: Option<TcpListener>,
}

impl MockWorker {
    pub fn bind(config: MockConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port))?;
        let data_listener = match config.data_port {
            Some(port) => Some(TcpListener::bind((config.host.as_str(), port))?),
            None => None,
        };
        Ok(MockWorker {
            config,
            listener,
            data_listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn data_addr(&self) -> Option<SocketAddr> {
        self.data_listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Serves until `cancel` is set. Returns the number of steps taken.
    pub fn run(self, cancel: &CancelToken) -> Result<u64> {
        let data_handle = match self.data_listener {
            Some(listener) => {
                let cancel = cancel.clone();
                Some(thread::spawn(move || serve_memory(listener, &cancel)))
            }
            None => None,
        };

        let mut steps = 0;
        let mut after_reset = false;
        while let Some(mut conn) = accept(&self.listener, cancel)? {
            info!("bridge connected from {:?}", conn.peer_addr().ok());
            if after_reset {
                conn.write_all(&msg::encode_status(SERVER_READY))?;
                after_reset = false;
            }
            while let Some(micros) = read_step(&mut conn, cancel)? {
                steps += 1;
                debug!("step {}: {} us", steps, micros);
                if let Some(n) = self.config.reset_every {
                    if n > 0 && steps % n == 0 {
                        info!("requesting reset after step {}", steps);
                        conn.write_all(&msg::encode_status(AckCode::Reset.into()))?;
                        drain(&mut conn);
                        after_reset = true;
                        break;
                    }
                }
                conn.write_all(&msg::encode_status(AckCode::Ok.into()))?;
            }
        }

        if let Some(handle) = data_handle {
            if handle.join().is_err() {
                warn!("data channel thread panicked");
            }
        }
        Ok(steps)
    }
}

fn accept(listener: &TcpListener, cancel: &CancelToken) -> Result<Option<TcpStream>> {
    listener.set_nonblocking(true)?;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                stream.set_read_timeout(Some(READ_TIMEOUT))?;
                return Ok(Some(stream));
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if cancel.is_cancelled() {
                    return Ok(None);
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Reads the next step request. `None` once the bridge hangs up or the
/// worker is cancelled.
fn read_step(conn: &mut TcpStream, cancel: &CancelToken) -> Result<Option<u64>> {
    let mut buf = [0; msg::STEP_REQUEST_LEN];
    loop {
        match read_full(conn, &mut buf) {
            Ok(_) => return Ok(Some(msg::decode_step(&buf))),
            Err(Error::TimedOut) if !cancel.is_cancelled() => continue,
            Err(Error::TimedOut) | Err(Error::PeerClosed) => return Ok(None),
            Err(e) => {
                warn!("step channel: {}", e);
                return Ok(None);
            }
        }
    }
}

/// Waits for the bridge to close its side, discarding anything it sends.
fn drain(conn: &mut TcpStream) {
    let mut rest = Vec::new();
    if let Err(e) = conn.read_to_end(&mut rest) {
        debug!("draining step channel: {}", e);
    }
}

fn serve_memory(listener: TcpListener, cancel: &CancelToken) {
    let mut memory: HashMap<i64, Vec<u8>> = HashMap::new();
    loop {
        let mut conn = match accept(&listener, cancel) {
            Ok(Some(conn)) => conn,
            Ok(None) => return,
            Err(e) => {
                error!("data channel: {}", e);
                return;
            }
        };
        if let Err(e) = serve_records(&mut conn, &mut memory, cancel) {
            debug!("data channel closed: {}", e);
        }
    }
}

fn serve_records(
    conn: &mut TcpStream,
    memory: &mut HashMap<i64, Vec<u8>>,
    cancel: &CancelToken,
) -> Result<()> {
    let mut header = [0; RECORD_HEADER_LEN];
    loop {
        match read_full(conn, &mut header) {
            Ok(_) => (),
            Err(Error::TimedOut) if !cancel.is_cancelled() => continue,
            Err(e) => return Err(e.into()),
        }
        let record = DataRecord::decode_header(&header)?;
        let mut data = vec![0; record.size as usize];
        match record.op {
            RecordOp::Write => {
                read_full(conn, &mut data)?;
                trace!("write {} bytes at {:#x}", data.len(), record.address);
                memory.insert(record.address, data);
            }
            RecordOp::Read => {
                if let Some(stored) = memory.get(&record.address) {
                    let n = stored.len().min(data.len());
                    data[..n].copy_from_slice(&stored[..n]);
                }
                conn.write_all(&data)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fmubridge_core::{RetryPolicy, TransportKind};
    use fmubridge_net::{BridgeProtocol, BridgeSettings};

    #[test]
    fn survives_periodic_resets() {
        let worker = MockWorker::bind(MockConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            reset_every: Some(3),
            data_port: None,
        })
        .unwrap();
        let port = worker.local_addr().unwrap().port().to_string();
        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();
        let handle = thread::spawn(move || worker.run(&worker_cancel).unwrap());

        let settings = BridgeSettings {
            retry: RetryPolicy::bounded(50, Duration::from_millis(20)),
            peer_close_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let mut bridge =
            BridgeProtocol::new_with_settings(TransportKind::Tcp, settings, CancelToken::new());
        bridge.initialize("127.0.0.1", &port).unwrap();
        for _ in 0..7 {
            assert_eq!(bridge.step(1000).unwrap(), AckCode::Ok);
        }
        bridge.close();
        cancel.cancel();
        assert_eq!(handle.join().unwrap(), 7);
    }
}
