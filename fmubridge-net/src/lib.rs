//! This library connects an FMI co-simulation bridge to its worker process.
//!
//! The worker is an external program owning the actual model memory. The
//! bridge drives it one step at a time over a byte stream and, optionally,
//! exchanges variable values with it over a second channel.
//!
//! # Channels
//!
//! The *step channel* carries step requests and acknowledgements, see
//! [`BridgeProtocol`]. A worker may ask for a reset while acknowledging a
//! step: the bridge then drops the connection, reconnects and waits for the
//! worker to announce it's ready before reporting the step as done.
//!
//! The *data channel* carries memory reads and writes addressed through the
//! locations resolved by `fmubridge-core`, see [`DataExchange`].
//!
//! Both channels run over the same [`Socket`] abstraction, with TCP and UDP
//! bindings selected from configuration.
//!
//! # Instances
//!
//! [`ModelInstance`] puts it all together: it loads the model, owns the
//! variable registries and both channels, and exposes the lifecycle and
//! typed value access expected by an FMI host.
//!
//! [`BridgeProtocol`]: bridge/struct.BridgeProtocol.html
//! [`DataExchange`]: exchange/struct.DataExchange.html
//! [`Socket`]: socket/struct.Socket.html
//! [`ModelInstance`]: instance/struct.ModelInstance.html

#[macro_use]
extern crate log;

pub mod bridge;
pub mod cancel;
pub mod exchange;
pub mod instance;
pub mod msg;
pub mod socket;

mod error;

pub use bridge::{BridgeProtocol, BridgeSettings, BridgeState};
pub use cancel::CancelToken;
pub use error::{Error, Result};
pub use exchange::DataExchange;
pub use instance::ModelInstance;
pub use msg::AckCode;
pub use socket::{Socket, SocketConfig};
