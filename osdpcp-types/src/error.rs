pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration errors, reported synchronously at registration time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Address {0} is already registered")]
    DuplicateAddress(u8),

    #[error("Invalid PD address {0} (valid range 0-126)")]
    InvalidAddress(u8),

    #[error("Invalid key length: expected 16 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Invalid baud rate {0}")]
    InvalidBaudRate(u32),

    #[error("Validation error: {0}")]
    Validation(String),
}
