//! Protocol error types.
//!
//! Every variant is fatal to the session that produced it: the codec has
//! no self-delimiting recovery point, so a violation is never resynced.

use thiserror::Error;

use crate::session::SessionState;

/// Errors raised while validating or parsing control protocol lines.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The line didn't carry the literal the reader required.
    #[error("expected '{expected}', got '{got}'")]
    UnexpectedLiteral { expected: String, got: String },

    /// An integer argument was empty, had non-digit bytes, or overflowed.
    #[error("invalid integer encoding")]
    InvalidInteger,

    /// Too few (or too many) positional arguments after the literal.
    #[error("expected {expected} arguments, got {got}")]
    WrongArgumentCount { expected: usize, got: usize },

    /// Arguments weren't separated by a single space, or the last one
    /// wasn't terminated by the line end.
    #[error("invalid argument separator")]
    InvalidSeparator,

    /// The line didn't start with any known directive literal.
    #[error("unknown directive '{0}'")]
    UnknownDirective(String),

    /// A role token in `identify` that names no node role.
    #[error("unknown node role '{0}'")]
    UnknownRole(String),

    /// A line didn't fit in the receive region of the connection's page.
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    /// The lines following an `update config` added up to more than the
    /// receiver accepts.
    #[error("payload exceeds {0} bytes")]
    PayloadTooLarge(usize),

    /// A text argument wasn't valid UTF-8.
    #[error("invalid utf-8 in line")]
    InvalidUtf8,

    /// The session state machine was driven along an illegal edge.
    #[error("invalid session transition from {from} to {to}")]
    InvalidTransition { from: SessionState, to: SessionState },
}

/// Maximum bytes of offending input echoed back in an error message.
const MAX_ECHO: usize = 64;

/// Renders raw line bytes for an error message, truncated and lossy.
pub(crate) fn echo(line: &[u8]) -> String {
    let cut = &line[..line.len().min(MAX_ECHO)];
    String::from_utf8_lossy(cut).into_owned()
}
