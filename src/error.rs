//! Error types for the channel core.

use std::io;
use thiserror::Error;

/// Result type for channel-core operations.
pub type Result<T> = std::result::Result<T, LtsmError>;

/// Errors that can occur in the RFB engine, channel layer and redirectors.
#[derive(Debug, Error)]
pub enum LtsmError {
    /// Peer closed the TCP or Unix socket in an orderly fashion.
    #[error("connection closed by peer")]
    Closed,

    /// I/O error on a socket read or write.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS handshake or record-layer failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Unexpected byte, bad length, unsupported protocol version.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Password or certificate mismatch.
    #[error("authentication failed")]
    AuthFailed,

    /// Partial channel frame; the caller keeps the residue and retries
    /// once more bytes arrive.
    #[error("not enough buffered bytes")]
    Underflow,

    /// Encoder or codec not available in this build.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// Remote PC/SC call failure; carries the exact PC/SC status code.
    #[error("smart card error: 0x{0:08x}")]
    Scard(u32),

    /// Codec or sink rejected an audio frame. The frame is dropped and
    /// the channel stays alive.
    #[error("audio error: {0}")]
    Audio(String),

    /// Encoding pipeline failure.
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl LtsmError {
    /// Maps an I/O error to `Closed` when it represents an orderly peer
    /// close, leaving everything else as `Io`.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe => LtsmError::Closed,
            _ => LtsmError::Io(err),
        }
    }

    /// True for errors that terminate the session (everything except the
    /// recoverable `Underflow` and frame-local `Audio` kinds).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, LtsmError::Underflow | LtsmError::Audio(_))
    }
}
