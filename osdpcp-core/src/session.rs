//! Per-PD link session
//!
//! A session tracks the command sequence number shared by the CP and one PD:
//! - 0 is only ever sent right after a reset and asks the PD to resync
//! - after that the number cycles 1, 2, 3, 1, ...
//! - it only advances once a reply has been accepted, so a retry reuses it

use crate::constants::ctrl;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Next command goes out with sequence 0
    Reset,

    /// At least one exchange has completed since the last reset
    Synchronized,
}

/// Sequence number tracker for one PD
#[derive(Debug, Clone)]
pub struct Session {
    sequence: u8,
    state: SessionState,
}

impl Session {
    /// Create a session that starts with sequence 0
    pub fn new() -> Self {
        Self {
            sequence: 0,
            state: SessionState::Reset,
        }
    }

    /// Get current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Sequence number for the next command (or the retry of the current one)
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Check if the reply's sequence number echoes the command's
    pub fn accepts(&self, reply_sequence: u8) -> bool {
        reply_sequence & ctrl::SEQUENCE_MASK == self.sequence
    }

    /// Move on after a completed exchange
    ///
    /// Sequence 0 is skipped when wrapping.
    pub fn advance(&mut self) {
        self.sequence = match self.sequence {
            3 => 1,
            n => n + 1,
        };
        self.state = SessionState::Synchronized;
    }

    /// Force the next command back to sequence 0
    pub fn reset(&mut self) {
        self.sequence = 0;
        self.state = SessionState::Reset;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
