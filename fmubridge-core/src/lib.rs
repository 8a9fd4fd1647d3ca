//! This library implements the data side of an FMI co-simulation bridge.
//!
//! A bridge exposes the variables of an external worker process to a host
//! simulator. The worker's memory layout is described by address documents
//! (`.adx`), the variables themselves by the model description. This crate
//! provides:
//!
//! - [`AddressResolver`], turning symbolic, possibly array-indexed names
//!   into memory locations,
//! - [`VariableRegistry`], typed storage for variable values keyed by value
//!   reference,
//! - [`ModelDescription`] loading, configuration and instance state
//!   serialization.
//!
//! # Networking
//!
//! This library does not talk to the worker. For the transport and the
//! step protocol see `fmubridge-net`.
//!
//! # Using the library
//!
//! ```ignore
//! use fmubridge_core::AddressResolver;
//! use std::path::Path;
//!
//! let mut resolver = AddressResolver::new();
//! resolver.load_dir(Path::new("resources"))?;
//! let entry = resolver.resolve("signals.speed[3]");
//! ```
//!
//! [`AddressResolver`]: address/struct.AddressResolver.html
//! [`VariableRegistry`]: registry/struct.VariableRegistry.html
//! [`ModelDescription`]: model/struct.ModelDescription.html

#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

// reexports
pub use address::{AddressEntry, AddressResolver};
pub use config::{BridgeConfig, EndpointConfig, RetryPolicy, TransportKind};
pub use error::{Error, Result};
pub use model::{ModelDescription, ModelVariable};
pub use registry::{SlotDecl, VariableRegistry, VariableSlot};
pub use state::ModelState;
pub use var::{Causality, ElementType, Quantization, Value, ValueKind};

pub mod address;
pub mod arraystring;
pub mod config;
pub mod error;
pub mod model;
pub mod registry;
pub mod state;
pub mod util;
pub mod var;

/// Host the worker listens on unless configured otherwise.
pub const LOCAL_HOST: &str = "127.0.0.1";
/// Default port of the step channel.
pub const DEFAULT_TICK_PORT: &str = "5000";
/// Default port of the value exchange channel.
pub const DEFAULT_DATA_PORT: &str = "7000";
/// Directory holding address documents, relative to the model root.
pub const DEFAULT_RESOURCES_DIR: &str = "resources";
