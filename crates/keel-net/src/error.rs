//! Connection error types.

use std::io;
use std::net::SocketAddr;

use keel_core::{ArenaError, PoolExhausted};
use keel_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised by the connection layer and the control client.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Read, write or accept failed on an established socket.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Accepting or setting up one incoming connection failed. The
    /// listener itself is unaffected.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// A server setup step (create, bind, listen) failed. The socket has
    /// already been closed.
    #[error("{step} failed on {addr}: {source}")]
    Setup {
        step: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Connecting to a server failed for good, either on a fatal error or
    /// after the retry budget ran out.
    #[error("connect to {addr} failed after {attempts} attempt(s): {source}")]
    Connect {
        addr: SocketAddr,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    /// The peer sent something the codec rejected.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The peer closed the connection.
    #[error("peer disconnected")]
    Disconnected,

    /// No free buffer page. Retry later or shed the request.
    #[error("backpressure: {0}")]
    Backpressure(#[from] PoolExhausted),

    /// The connection was closed locally; no further I/O is attempted.
    #[error("connection closed")]
    Closed,

    /// The peer answered a well-formed request with `error <message>`.
    #[error("remote error: {0}")]
    Remote(String),

    /// A payload was rejected locally before anything was sent.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The session arena couldn't hold the request.
    #[error("arena: {0}")]
    Arena(#[from] ArenaError),

    /// No complete reply arrived in time.
    #[error("timed out waiting for peer")]
    Timeout,
}

impl ConnectionError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ConnectionError::Backpressure(_) => true,
            ConnectionError::Io(e) => is_transient_io(e),
            _ => false,
        }
    }

    /// Whether the session survives this error. Only `error <msg>` replies
    /// and requests refused before sending leave the protocol in a known
    /// state.
    pub fn keeps_session(&self) -> bool {
        matches!(
            self,
            ConnectionError::Remote(_) | ConnectionError::InvalidPayload(_)
        )
    }
}

/// Accept errors that concern only the connection being accepted.
pub(crate) fn is_peer_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
    )
}

/// Connect-step errors worth another attempt.
pub(crate) fn is_transient_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionRefused
    )
}
