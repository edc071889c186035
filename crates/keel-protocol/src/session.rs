//! Control session states.
//!
//! ```text
//! CONNECTING -> ESTABLISHED -> AWAIT_COMMAND -> DISPATCHING
//!     -> { RESPONDING_SINGLE | RESPONDING_STREAM } -> AWAIT_COMMAND
//! ```
//!
//! Any state may move to `CLOSED`, which is terminal. Both ends of a
//! connection track their position with a [`StateMachine`]: the server
//! while it serves a command, the client while it waits on a reply.

use std::fmt;

use crate::error::ProtocolError;

/// Where a session is in its command cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Established,
    AwaitCommand,
    Dispatching,
    RespondingSingle,
    RespondingStream,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "CONNECTING",
            SessionState::Established => "ESTABLISHED",
            SessionState::AwaitCommand => "AWAIT_COMMAND",
            SessionState::Dispatching => "DISPATCHING",
            SessionState::RespondingSingle => "RESPONDING_SINGLE",
            SessionState::RespondingStream => "RESPONDING_STREAM",
            SessionState::Closed => "CLOSED",
        }
    }

    fn can_move_to(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Connecting, Established)
                | (Established, AwaitCommand)
                | (AwaitCommand, Dispatching)
                | (Dispatching, RespondingSingle)
                | (Dispatching, RespondingStream)
                | (RespondingSingle, AwaitCommand)
                | (RespondingStream, AwaitCommand)
        ) || (self != Closed && to == Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Number of past states kept for diagnostics.
const HISTORY_LEN: usize = 32;

/// Validated state tracker with a short history of visited states.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: SessionState,
    history: Vec<SessionState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Starts in `CONNECTING`.
    pub fn new() -> Self {
        Self {
            state: SessionState::Connecting,
            history: vec![SessionState::Connecting],
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// States visited so far, oldest first, current last.
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    /// Moves to `to`, rejecting edges the state diagram doesn't have.
    pub fn transition(&mut self, to: SessionState) -> Result<(), ProtocolError> {
        if !self.state.can_move_to(to) {
            return Err(ProtocolError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        if self.history.len() == HISTORY_LEN {
            self.history.remove(0);
        }
        self.history.push(to);
        Ok(())
    }

    /// Moves to `CLOSED`. A no-op when already closed.
    pub fn close(&mut self) {
        if !self.is_closed() {
            // every open state has an edge to CLOSED
            let _ = self.transition(SessionState::Closed);
        }
    }
}
