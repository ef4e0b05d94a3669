/// Error types for the ring engine.
///
/// This module provides the error hierarchy used across the distributed
/// engine: ring placement, vector-clock resolution, the quorum coordinator,
/// gossip, and handoff. All fallible operations return `Result<T, RingError>`.
use thiserror::Error;

/// The main error type for ring engine operations.
#[derive(Error, Debug)]
pub enum RingError {
    /// Key absent at a replica. Folded into the coordinator's `failed` list,
    /// never propagated directly to a client.
    #[error("key not found: {0}")]
    NotFound(String),

    /// Fewer than R/W successes were collected after all N replicas responded.
    #[error("quorum not met: {have}/{need} replicas responded successfully (of {total})")]
    QuorumUnmet {
        have: usize,
        need: usize,
        total: usize,
    },

    /// A peer returned a non-2xx status, or the connection/transport failed.
    #[error("transport error talking to {peer}: {reason}")]
    Transport { peer: String, reason: String },

    /// Malformed `X-VinzClortho-Context` header.
    #[error("invalid causal context: {0}")]
    InvalidContext(String),

    /// Malformed admin request body.
    #[error("invalid operator request: {0}")]
    OperatorError(String),

    /// A name passed to an admin or client call does not resolve to a known node.
    #[error("no such node: {0}")]
    UnknownNode(String),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failure binding or serving the HTTP surface.
    #[error("server error: {0}")]
    Server(String),
}

/// Result type alias for ring engine operations.
pub type RingResult<T> = Result<T, RingError>;
