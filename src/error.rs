//! Error types for the TF protocol client.

use crate::codec::CodecError;
use crate::status::Status;
use thiserror::Error;

/// Main error type for all client operations. Protocol-level failures carry
/// the parsed [`Status`] the server (or the connection machinery) produced.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// I/O error on the TCP or UDP socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the socket mid-frame.
    #[error("channel closed")]
    ChannelClosed,

    /// A frame header declared a length we refuse to allocate.
    #[error("claimed length too large: {claimed} bytes (max: {max})")]
    FrameTooLarge { claimed: i64, max: usize },

    /// Malformed frame (negative length header outside a transfer, etc).
    #[error("protocol violation: {0}")]
    BadFrame(String),

    /// Scalar encode/decode failure.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Connection establishment failed; the status says which step.
    #[error("cannot connect to the server: {0}")]
    Connect(Status),

    /// A handshake or command step got a terminal non-OK reply.
    #[error("server rejected request: {0}")]
    Server(Status),

    /// Deadline elapsed on a socket operation.
    #[error("{what} timed out after {ms} ms")]
    Timeout { what: &'static str, ms: u64 },

    /// Session key outside the supported length range.
    #[error("invalid session key length: {0}")]
    InvalidKeyLength(usize),

    /// The supplied PEM public key could not be parsed.
    #[error("bad public key: {0}")]
    PublicKey(String),

    /// RSA-OAEP encryption failure.
    #[error("RSA error: {0}")]
    Rsa(#[from] rsa::Error),

    /// Buffer-size negotiation failed before any data flowed.
    #[error("unusable negotiated buffer size: {0}")]
    BufferSizeMismatch(String),

    /// Unexpected control code where a checkpoint or chunk header was due.
    #[error("unexpected control code {0} during transfer")]
    UnexpectedControl(i64),

    /// Caller-supplied argument outside the command's domain.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
}

pub type Result<T> = std::result::Result<T, ProtoError>;
