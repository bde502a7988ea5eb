// Error types for the wire protocol layer.
//
// Every decode path returns a structured error instead of panicking, so that
// a malformed packet from a remote peer can never take down an endpoint. The
// session layer decides what to do with each failure (usually: log at warn
// verbosity, drop the offending message, keep draining the packet).

use thiserror::Error;

/// Errors produced while encoding or decoding wire data.
#[derive(Debug, Error)]
pub enum WireError {
    /// Ran out of input bytes mid-value.
    #[error("unexpected end of input: needed {needed} more bytes")]
    UnexpectedEof { needed: usize },

    /// A length prefix pointed past the end of the buffer.
    #[error("length prefix {len} exceeds remaining input {remaining}")]
    BadLengthPrefix { len: usize, remaining: usize },

    /// A bounded container carried more elements than its capacity allows.
    #[error("count {count} exceeds capacity {capacity}")]
    CapacityExceeded { count: usize, capacity: usize },

    /// A wire string was not valid UTF-8.
    #[error("invalid UTF-8 in wire string")]
    InvalidUtf8,

    /// A string exceeded its encodable limit (255 bytes for plain strings,
    /// 64 for app/session identifiers).
    #[error("string of {len} bytes exceeds limit {limit}")]
    StringTooLong { len: usize, limit: usize },

    /// An app/session identifier contained non-ASCII bytes.
    #[error("identifier contains non-ASCII bytes")]
    NonAsciiIdentifier,

    /// An admission response datagram carried an unknown code.
    #[error("unknown connection response code {0}")]
    BadResponseCode(u32),

    /// A packet header could not be parsed.
    #[error("malformed packet header: {0}")]
    BadHeader(&'static str),

    /// A packet's total length field disagreed with the bytes on hand.
    #[error("packet length field {field} exceeds limit {limit}")]
    PacketTooLarge { field: usize, limit: usize },

    /// The compressed message region was malformed.
    #[error("huffman decode error: {0}")]
    Huffman(&'static str),

    /// Two transform steps were registered at the same priority.
    #[error("transform priority {0} already registered")]
    DuplicatePriority(i32),

    /// An RPC argument did not match the declared parameter kind.
    #[error("argument {index} has kind {got}, expected {expected}")]
    ArgKindMismatch {
        index: usize,
        expected: &'static str,
        got: &'static str,
    },

    /// An injection index pointed outside the parameter list.
    #[error("injection index {index} out of bounds for {params} parameters")]
    BadInjectionIndex { index: usize, params: usize },
}

/// Convenience alias used throughout the protocol crate.
pub type Result<T> = std::result::Result<T, WireError>;
