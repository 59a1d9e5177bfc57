//! Error types for osdpcp-core

/// Result type alias for frame operations
pub type Result<T> = std::result::Result<T, FrameError>;

/// Frame encoding/decoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Not enough bytes yet to hold the frame announced by the header
    #[error("Incomplete frame: expected {expected} bytes, have {actual}")]
    Incomplete { expected: usize, actual: usize },

    /// Structurally invalid frame
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// CRC/checksum verification failed
    #[error("Checksum mismatch: expected 0x{expected:04X}, received 0x{received:04X}")]
    ChecksumMismatch { expected: u16, received: u16 },

    /// MAC verification failed on a secure frame
    #[error("Frame authentication failed")]
    AuthFailed,

    /// Reply came from another address than the one polled
    #[error("Unexpected reply address: expected {expected}, got {actual}")]
    AddressMismatch { expected: u8, actual: u8 },

    /// Reply sequence number does not echo the command
    #[error("Sequence mismatch: expected {expected}, got {actual}")]
    SequenceMismatch { expected: u8, actual: u8 },

    /// Unknown command or reply code
    #[error("Unknown code 0x{0:02X}")]
    UnknownCode(u8),

    /// Payload does not fit the frame
    #[error("Payload too large: {size} bytes (max: {max} bytes)")]
    PayloadTooLarge { size: usize, max: usize },
}

impl FrameError {
    /// Check if more input may complete the frame
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::Incomplete { .. })
    }

    /// Check if the error must be treated as a security failure
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::AuthFailed)
    }
}

/// Secure channel errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScError {
    /// PD never completed the handshake
    #[error("Secure channel handshake timed out")]
    HandshakeTimeout,

    /// Cryptogram or MAC did not verify
    #[error("Secure channel authentication failed: {0}")]
    AuthFailed(&'static str),

    /// Handshake message arrived out of order
    #[error("Invalid secure channel state: {0}")]
    InvalidState(&'static str),

    /// Decrypted payload is not padded correctly
    #[error("Invalid secure payload padding")]
    BadPadding,
}

impl From<ScError> for FrameError {
    fn from(_: ScError) -> Self {
        FrameError::AuthFailed
    }
}
