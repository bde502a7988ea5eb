// Error types for the session runtime.
//
// The I/O loop itself never propagates recoverable errors: decode failures,
// secret mismatches and permission violations are logged and the offending
// message or packet is dropped, so a misbehaving peer cannot stop the loop.
// `SessionError` is what crosses the public API boundary — construction,
// admission, and misuse of the threading modes.

use alderwire_protocol::error::WireError;
use alderwire_protocol::types::ConnectionResponseCode;
use thiserror::Error;

/// Top-level error type of the session runtime.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Socket or filesystem failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire-level encode/decode failure.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// An operation was called in the wrong mode or lifecycle phase (for
    /// example `receive` on a threaded connection).
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The endpoint is not (or no longer) connected.
    #[error("not connected")]
    NotConnected,

    /// The local permission table forbids this call.
    #[error("rpc {rpc_id} not permitted from this endpoint")]
    PermissionDenied { rpc_id: u32 },

    /// No such client in the session.
    #[error("unknown client {0}")]
    UnknownClient(u32),

    /// No such replicated object.
    #[error("unknown object {0}")]
    UnknownObject(u32),

    /// No RPC registered under this id.
    #[error("unknown rpc id {0}")]
    UnknownRpc(u32),

    /// Host migration requested on a non-migratable session.
    #[error("session is not migratable")]
    NotMigratable,

    /// The server answered the admission request with a rejection.
    #[error("admission rejected: {0:?}")]
    Rejected(ConnectionResponseCode),

    /// Every admission attempt timed out without an answer.
    #[error("admission attempts exhausted")]
    AttemptsExhausted,

    /// A configuration value was rejected.
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
