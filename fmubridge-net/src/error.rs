use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

/// Enumeration of errors that may occur during network operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("timed out")]
    TimedOut,
    #[error("socket not connected")]
    NotConnected,
    #[error("failed resolving address: {0}")]
    ResolveFailed(String),
    #[error("gave up connecting to {addr} after {attempts} attempts")]
    RetriesExhausted { addr: String, attempts: u32 },
    #[error("cancelled")]
    Cancelled,

    #[error("step failed, worker answered with code {0}")]
    StepFailed(i32),
    #[error("step already in flight")]
    StepInFlight,
    #[error("bridge closed")]
    BridgeClosed,
    #[error("unexpected status word during reconnect: {0}")]
    UnexpectedSentinel(i32),
    #[error("invalid step size: {0}")]
    InvalidStepSize(f64),
    #[error("operation not allowed in state: {0}")]
    InvalidState(String),
    #[error("malformed record: {0}")]
    MalformedRecord(String),
    #[error("argument count mismatch: {refs} references, {values} values")]
    ArgumentMismatch { refs: usize, values: usize },

    #[error("core error: {0}")]
    CoreError(#[from] fmubridge_core::Error),

    #[error("other: {0}")]
    Other(String),
}

impl Error {
    pub(crate) fn io(context: &str, source: std::io::Error) -> Self {
        Error::Io {
            context: context.to_string(),
            source,
        }
    }

    /// Whether retrying the failed operation could help.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io { .. }
            | Error::PeerClosed
            | Error::TimedOut
            | Error::NotConnected
            | Error::ResolveFailed(_)
            | Error::UnexpectedSentinel(_) => true,
            _ => false,
        }
    }
}
