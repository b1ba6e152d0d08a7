//! Crate-wide error type.

use thiserror::Error;

/// Result type alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the transport, its connection manager, and its proxy.
#[derive(Error, Debug)]
pub enum Error {
    /// A frame could not be written to the attached sink.
    #[error("sink write failed: {0}")]
    SinkWrite(String),

    /// The connection was closed and can no longer accept operations.
    #[error("connection closed")]
    ConnectionClosed,

    /// A POST body or SSE frame could not be decoded as the configured codec.
    #[error("codec error: {0}")]
    Codec(String),

    /// The client observed an `event: control` frame carrying an unrecognized
    /// directive. Per spec this is a hard error — a protocol version mismatch.
    #[error("unknown control directive: {0}")]
    UnknownControl(String),

    /// An outgoing client message could not be encoded in the configured codec.
    #[error("message not encodable: {0}")]
    UnencodableOutbound(String),

    /// The underlying HTTP client/server reported a transport-level failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid or unreachable URL.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    /// Low-level IO error (e.g. writing a frame to a hijacked body sender).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Other, unclassified errors — mirrors the teacher convention of a
    /// catch-all variant for error sources outside this crate's taxonomy.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Build a [`Error::SinkWrite`] from a displayable cause.
    pub fn sink_write(cause: impl std::fmt::Display) -> Self {
        Self::SinkWrite(cause.to_string())
    }

    /// Build a [`Error::Codec`] from a displayable cause.
    pub fn codec(cause: impl std::fmt::Display) -> Self {
        Self::Codec(cause.to_string())
    }
}
