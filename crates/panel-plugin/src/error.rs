//! Error types for the plugin runtime.

use std::path::PathBuf;

/// Errors raised by a transport while reading or writing envelopes.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A complete inbound frame did not decode into an envelope. The frame
    /// was consumed, so the stream is still in sync.
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("frame of {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("peer is gone")]
    PeerGone,
}

impl TransportError {
    /// Whether the reader can carry on with the next frame.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransportError::Malformed(_))
    }
}

/// Errors surfaced by the plugin runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The registration exchange did not complete.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The transport failed after the connection was established.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The connection closed before a reply arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// An outbound call was attempted before the connection opened.
    #[error("not connected to panel")]
    NotConnected,

    /// A blocking call was made from a thread driving async tasks that
    /// cannot be blocked.
    #[error("blocking panel call from an async context, use the async call instead")]
    BlockingInAsync,

    /// The panel answered an outbound call with an error.
    #[error("panel returned error: {0}")]
    Host(String),

    /// The panel answered an outbound call with the wrong payload kind.
    #[error("unexpected reply payload: {0}")]
    UnexpectedReply(&'static str),

    /// Reading or writing the config file failed.
    #[error("config I/O error at {}: {source}", path.display())]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config document could not be encoded or decoded.
    #[error("config format error at {}: {source}", path.display())]
    ConfigFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
