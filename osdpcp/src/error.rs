//! High-level error types

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Frame error: {0}")]
    Frame(#[from] osdpcp_core::FrameError),

    #[error("Transport error: {0}")]
    Transport(#[from] osdpcp_transport::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] osdpcp_types::ConfigError),

    #[error("PD {0} already has a command pending")]
    Busy(u8),

    #[error("No PD registered at address {0}")]
    UnknownAddress(u8),

    #[error("PD handle does not belong to this control panel")]
    InvalidHandle,

    #[error("Command {0} is issued by the control panel itself")]
    ReservedCommand(&'static str),

    #[error("PD {0} has no active secure channel")]
    SecureChannelRequired(u8),

    #[error("PD {0} has no file operations registered")]
    FileOpsMissing(u8),

    #[error("File operation failed: {0}")]
    FileOps(#[from] std::io::Error),

    #[error("Control panel is not running")]
    NotRunning,

    #[error("Control panel is already running")]
    AlreadyRunning,

    #[error("Tick task did not stop within {0:?}")]
    StopTimeout(std::time::Duration),
}

impl Error {
    /// Check if retrying the same call later can succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Busy(_) | Self::SecureChannelRequired(_) | Self::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors() {
        assert!(Error::Busy(1).is_recoverable());
        assert!(Error::SecureChannelRequired(1).is_recoverable());
        assert!(!Error::UnknownAddress(5).is_recoverable());
        assert!(!Error::InvalidHandle.is_recoverable());
    }

    #[test]
    fn test_config_error_conversion() {
        let err: Error = osdpcp_types::ConfigError::DuplicateAddress(3).into();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains('3'));
    }
}
