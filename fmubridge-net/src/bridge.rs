//! Step protocol driving the worker one tick at a time.
//!
//! Each step sends the step duration and waits for the worker's
//! acknowledgement. A worker may answer with a reset request instead, after
//! which the bridge drops the connection, waits for the worker to come back
//! and only then reports the step as done.
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Stepping
//!                                   ^            |
//!                                   |       ResetHandshake
//!                                   |            |
//!                                   +------ Reconnecting
//!
//! any state -> Closed
//! ```

use std::fmt;
use std::time::Duration;

use fmubridge_core::{EndpointConfig, RetryPolicy, TransportKind};

use crate::cancel::CancelToken;
use crate::msg::{self, AckCode, SERVER_READY};
use crate::socket::{Socket, SocketConfig};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Connected,
    Stepping,
    ResetHandshake,
    Reconnecting,
    /// Terminal
    Closed,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Protocol behavior settings.
#[derive(Debug, Clone, Copy)]
pub struct BridgeSettings {
    /// Echo the reset code back before closing the connection
    pub acknowledge_reset: bool,
    /// Upper bound on waiting for the worker to close its side after a
    /// reset
    pub peer_close_timeout: Duration,
    /// Applies to the initial connect and to every reconnect attempt
    pub retry: RetryPolicy,
    pub socket: SocketConfig,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            acknowledge_reset: false,
            peer_close_timeout: Duration::from_secs(2),
            retry: RetryPolicy::default(),
            socket: SocketConfig::default(),
        }
    }
}

impl From<&EndpointConfig> for BridgeSettings {
    fn from(config: &EndpointConfig) -> Self {
        Self {
            acknowledge_reset: config.acknowledge_reset,
            peer_close_timeout: config.peer_close_timeout(),
            retry: config.retry.policy(),
            socket: SocketConfig::default(),
        }
    }
}

/// Step channel to a single worker.
pub struct BridgeProtocol {
    socket: Socket,
    state: BridgeState,
    settings: BridgeSettings,
    cancel: CancelToken,
}

impl BridgeProtocol {
    pub fn new(transport: TransportKind) -> Self {
        Self::new_with_settings(transport, BridgeSettings::default(), CancelToken::new())
    }

    pub fn new_with_settings(
        transport: TransportKind,
        settings: BridgeSettings,
        cancel: CancelToken,
    ) -> Self {
        Self {
            socket: Socket::new_with_config(transport, settings.socket),
            state: BridgeState::Disconnected,
            settings,
            cancel,
        }
    }

    /// Creates a bridge for the endpoint, without connecting.
    pub fn from_config(config: &EndpointConfig, cancel: CancelToken) -> Self {
        Self::new_with_settings(config.transport, BridgeSettings::from(config), cancel)
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    pub fn transport(&self) -> &Socket {
        &self.socket
    }

    /// Token aborting blocked connect and reconnect loops.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Connects to the worker at `host:port`.
    pub fn initialize(&mut self, host: &str, port: &str) -> Result<()> {
        match self.state {
            BridgeState::Disconnected => (),
            BridgeState::Closed => return Err(Error::BridgeClosed),
            state => return Err(Error::InvalidState(state.to_string())),
        }
        self.state = BridgeState::Connecting;
        self.socket.configure(port, host);
        match self.socket.open(&self.settings.retry, &self.cancel) {
            Ok(()) => {
                self.state = BridgeState::Connected;
                Ok(())
            }
            Err(e) => {
                error!("failed connecting to worker at {}: {}", self.socket.endpoint(), e);
                self.state = BridgeState::Disconnected;
                Err(e)
            }
        }
    }

    /// Performs a single step of `micros` microseconds.
    ///
    /// A reset requested by the worker is handled before returning, and the
    /// step then counts as successful. An error acknowledgement leaves the
    /// channel open.
    pub fn step(&mut self, micros: u64) -> Result<AckCode> {
        match self.state {
            BridgeState::Connected => (),
            BridgeState::Stepping => return Err(Error::StepInFlight),
            BridgeState::Closed => return Err(Error::BridgeClosed),
            _ => return Err(Error::NotConnected),
        }
        self.state = BridgeState::Stepping;
        trace!("step request: {} us", micros);

        let code = match self.exchange_step(micros) {
            Ok(code) => code,
            Err(e) => {
                error!("step failed: {}", e);
                self.socket.close();
                self.state = BridgeState::Disconnected;
                return Err(e);
            }
        };

        match AckCode::from_raw(code) {
            AckCode::Ok => {
                self.state = BridgeState::Connected;
                Ok(AckCode::Ok)
            }
            AckCode::Error => {
                warn!("worker reported step error (code {})", code);
                self.state = BridgeState::Connected;
                Err(Error::StepFailed(code))
            }
            AckCode::Reset => self.handle_reset(),
        }
    }

    fn exchange_step(&mut self, micros: u64) -> Result<i32> {
        self.socket.write(&msg::encode_step(micros))?;
        self.socket.read_status_word()
    }

    fn handle_reset(&mut self) -> Result<AckCode> {
        self.state = BridgeState::ResetHandshake;
        info!("worker requested reset, reconnecting to {}", self.socket.endpoint());

        if self.settings.acknowledge_reset {
            if let Err(e) = self.socket.write(&msg::encode_status(AckCode::Reset.into())) {
                warn!("failed acknowledging reset: {}", e);
            }
        }
        if self.socket.is_connected() {
            match self.socket.wait_for_peer_close(self.settings.peer_close_timeout) {
                Ok(true) => debug!("worker closed its side"),
                Ok(false) => warn!(
                    "worker didn't close within {:?}, closing anyway",
                    self.settings.peer_close_timeout
                ),
                Err(e) => debug!("waiting for worker close: {}", e),
            }
        }
        self.socket.close();

        self.state = BridgeState::Reconnecting;
        match self.reconnect() {
            Ok(()) => {
                info!("worker ready again");
                self.state = BridgeState::Connected;
                Ok(AckCode::Ok)
            }
            Err(e) => {
                error!("reconnect after reset failed: {}", e);
                self.socket.close();
                self.state = BridgeState::Disconnected;
                Err(e)
            }
        }
    }

    /// Reopens the channel until the worker greets with the ready sentinel.
    ///
    /// Failed connects and wrong greetings draw from the same attempt budget.
    fn reconnect(&mut self) -> Result<()> {
        let retry = self.settings.retry;
        let mut attempts = 0;
        loop {
            self.cancel.check()?;
            let failure = match self.socket.open_once() {
                Ok(()) => match self.socket.read_status_word() {
                    Ok(SERVER_READY) => return Ok(()),
                    Ok(other) => {
                        warn!("expected ready sentinel {}, got {}", SERVER_READY, other);
                        Error::UnexpectedSentinel(other)
                    }
                    Err(e) => {
                        debug!("no ready sentinel: {}", e);
                        e
                    }
                },
                Err(e) => {
                    debug!("reconnecting to {} failed: {}", self.socket.endpoint(), e);
                    e
                }
            };
            self.socket.close();
            attempts += 1;
            if !retry.allows_retry(attempts) {
                warn!("giving up on {} after {} attempts", self.socket.endpoint(), attempts);
                return Err(match failure {
                    Error::UnexpectedSentinel(_) => failure,
                    _ => Error::RetriesExhausted {
                        addr: self.socket.endpoint(),
                        attempts,
                    },
                });
            }
            self.cancel.sleep(retry.delay)?;
        }
    }

    /// Tears the channel down for good.
    pub fn close(&mut self) {
        self.socket.close();
        if self.state != BridgeState::Closed {
            debug!("bridge to {} closed", self.socket.endpoint());
        }
        self.state = BridgeState::Closed;
    }
}
