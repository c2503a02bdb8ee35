//! Error types for the core library.

use std::time::Duration;

use thiserror::Error;

use crate::wire::ErrorStatus;

/// Result type alias for the core library.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building, parsing or validating RPC frames and
/// configuration.
#[derive(Debug, Error)]
pub enum Error {
    /// Frame is truncated, mis-sized or internally inconsistent
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
    /// Frame exceeds the configured maximum message size
    #[error("Message too large: {size} bytes exceeds the limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },
    /// More sidecars than a single transfer can carry
    #[error("Too many sidecars: at most {max} are allowed")]
    TooManySidecars { max: usize },
    /// Sidecar lookup by index failed
    #[error("Sidecar index {index} out of range ({count} sidecars)")]
    SidecarOutOfRange { index: usize, count: usize },
    /// Header encoding or decoding failed
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),
    /// Configuration could not be parsed
    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
    /// Operation not permitted in the object's current state
    #[error("Illegal state: {0}")]
    IllegalState(String),
}

/// Outcome status of a client call that did not finish successfully.
///
/// Cloned into every observer of a finished call (controller, callback),
/// so it only carries owned, cheap-to-copy data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// The client-side deadline passed before a response arrived. The server
    /// may still be executing the call.
    #[error("{method} RPC to {remote} timed out after {timeout:?}")]
    TimedOut {
        method: String,
        remote: String,
        timeout: Duration,
    },
    /// The server answered with an error response.
    #[error("Remote error: {0}")]
    Remote(ErrorStatus),
    /// The server does not support one or more features the call requires.
    #[error("Server does not support required features: {0:?}")]
    FeatureNotSupported(Vec<String>),
    /// The connection failed before or while the call was in flight.
    #[error("Network error: {0}")]
    Network(String),
    /// The call was abandoned locally.
    #[error("Call aborted: {0}")]
    Aborted(String),
    /// The response frame could not be interpreted.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl RpcError {
    /// True if this status is a client-side timeout.
    pub fn is_timed_out(&self) -> bool {
        matches!(self, RpcError::TimedOut { .. })
    }

    /// The remote error payload, if the server produced one.
    pub fn remote_error(&self) -> Option<&ErrorStatus> {
        match self {
            RpcError::Remote(status) => Some(status),
            _ => None,
        }
    }
}
