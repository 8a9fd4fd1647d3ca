//! Error types.

use std::io;
use std::num::{ParseFloatError, ParseIntError};
use std::path::PathBuf;

pub type Result<T> = core::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::IoError(e.to_string())
    }
}

/// Crate-wide error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(String),

    #[error("toml deserialization error: {0}")]
    TomlDeserError(#[from] toml::de::Error),

    #[error("failed parsing int: {0}")]
    ParseIntError(#[from] ParseIntError),
    #[error("failed parsing float: {0}")]
    ParseFloatError(#[from] ParseFloatError),

    #[error("address document {}: {reason}", path.display())]
    AddressDocument { path: PathBuf, reason: String },
    #[error("no address documents found in: {}", _0.display())]
    NoAddressDocuments(PathBuf),

    #[error("model description {}: {reason}", path.display())]
    ModelDescription { path: PathBuf, reason: String },

    #[error("slot already declared: reference {reference}, index {index}")]
    DuplicateSlot { reference: u32, index: u32 },
    #[error("slot index out of range: reference {reference}, index {index}")]
    SlotIndexOutOfRange { reference: u32, index: u32 },
    #[error("unknown value reference: {0}")]
    UnknownReference(u32),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("string too long: {len} bytes, capacity is {capacity}")]
    StringTooLong { len: usize, capacity: usize },

    #[error("failed requesting new integer id: no more ids available in the pool?")]
    RequestIdError,

    #[error("invalid model state: {0}")]
    InvalidState(String),

    #[error("other error: {0}")]
    Other(String),
}
