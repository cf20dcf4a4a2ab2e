//! Error types shared by the server and client roles.

use std::io;
use std::net::SocketAddr;
use std::str::Utf8Error;
use thiserror::Error;

/// Inbound framing failures. Both are fatal to the owning connection.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Unterminated input grew past the configured line limit.
    #[error("line exceeds {limit} bytes without a line feed")]
    TooLarge { limit: usize },

    /// A complete line was not valid UTF-8.
    #[error("line is not valid UTF-8: {0}")]
    Decode(#[from] Utf8Error),
}

/// Listener startup failures.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid listen address '{addr}': {source}")]
    InvalidAddress {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Client-side connection failures.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("connection error: {0}")]
    Transport(#[from] io::Error),

    #[error("protocol violation from server: {0}")]
    Frame(#[from] FrameError),
}

/// Why a server session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// The peer sent `quit` and received the farewell line.
    Quit,
    /// The peer closed its side of the connection.
    PeerClosed,
    /// The server is shutting down.
    Shutdown,
    /// The peer violated the line protocol.
    Protocol(FrameError),
    /// Reading from or writing to the socket failed.
    Transport(io::Error),
}

impl SessionEnd {
    /// Whether this ending was requested by one of the two parties rather
    /// than caused by a failure.
    pub fn is_graceful(&self) -> bool {
        matches!(self, SessionEnd::Quit | SessionEnd::PeerClosed | SessionEnd::Shutdown)
    }
}

impl std::fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEnd::Quit => write!(f, "quit"),
            SessionEnd::PeerClosed => write!(f, "peer closed"),
            SessionEnd::Shutdown => write!(f, "server shutdown"),
            SessionEnd::Protocol(e) => write!(f, "protocol error: {e}"),
            SessionEnd::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}
