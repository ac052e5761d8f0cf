//! Crate-wide error taxonomy.
//!
//! Every fallible operation in the network server returns `NetServerError`
//! (or a type convertible into it). The engine's uplink path treats every
//! variant except `InvariantViolation` as log-and-drop; `InvariantViolation`
//! propagates out of the datagram task.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetServerError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("authentication failure: {0}")]
    AuthFailure(String),

    #[error("unknown resource: {0}")]
    UnknownResource(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("policy rejection: {0}")]
    PolicyRejection(String),

    #[error("transient I/O error: {0}")]
    TransientIO(#[from] std::io::Error),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

pub type Result<T> = std::result::Result<T, NetServerError>;
