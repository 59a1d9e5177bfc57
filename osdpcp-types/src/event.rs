//! Events surfaced to the application

use std::fmt;

use bytes::Bytes;

/// Card data encoding reported with a card read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardFormat {
    /// Raw bits, format unspecified
    RawUnspecified,
    /// Raw Wiegand bits
    RawWiegand,
    /// Card number as ASCII characters (osdp_FMT)
    Ascii,
    Unknown(u8),
}

impl From<u8> for CardFormat {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::RawUnspecified,
            1 => Self::RawWiegand,
            other => Self::Unknown(other),
        }
    }
}

/// NAK reason codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakCode {
    None,
    MessageCheck,
    CommandLength,
    UnknownCommand,
    SequenceNumber,
    UnsupportedSecurityBlock,
    EncryptionRequired,
    BioTypeNotSupported,
    BioFormatNotSupported,
    UnableToProcess,
    Other(u8),
}

impl NakCode {
    /// NAKs after which the engine must resynchronise the sequence number
    pub fn is_sequence_error(self) -> bool {
        matches!(self, Self::SequenceNumber)
    }

    /// NAKs that point at a missing or broken secure channel
    pub fn is_security_error(self) -> bool {
        matches!(self, Self::UnsupportedSecurityBlock | Self::EncryptionRequired)
    }
}

impl From<u8> for NakCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::None,
            0x01 => Self::MessageCheck,
            0x02 => Self::CommandLength,
            0x03 => Self::UnknownCommand,
            0x04 => Self::SequenceNumber,
            0x05 => Self::UnsupportedSecurityBlock,
            0x06 => Self::EncryptionRequired,
            0x07 => Self::BioTypeNotSupported,
            0x08 => Self::BioFormatNotSupported,
            0x09 => Self::UnableToProcess,
            other => Self::Other(other),
        }
    }
}

impl From<NakCode> for u8 {
    fn from(code: NakCode) -> u8 {
        match code {
            NakCode::None => 0x00,
            NakCode::MessageCheck => 0x01,
            NakCode::CommandLength => 0x02,
            NakCode::UnknownCommand => 0x03,
            NakCode::SequenceNumber => 0x04,
            NakCode::UnsupportedSecurityBlock => 0x05,
            NakCode::EncryptionRequired => 0x06,
            NakCode::BioTypeNotSupported => 0x07,
            NakCode::BioFormatNotSupported => 0x08,
            NakCode::UnableToProcess => 0x09,
            NakCode::Other(other) => other,
        }
    }
}

impl fmt::Display for NakCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::None => "no error",
            Self::MessageCheck => "message check character(s) error",
            Self::CommandLength => "command length error",
            Self::UnknownCommand => "unknown command code",
            Self::SequenceNumber => "unexpected sequence number",
            Self::UnsupportedSecurityBlock => "unsupported security block",
            Self::EncryptionRequired => "encrypted communication required",
            Self::BioTypeNotSupported => "biometric type not supported",
            Self::BioFormatNotSupported => "biometric format not supported",
            Self::UnableToProcess => "unable to process command record",
            Self::Other(code) => return write!(f, "reserved NAK code 0x{:02X}", code),
        };
        f.write_str(text)
    }
}

/// Progress of an outgoing file transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileTxState {
    InProgress,
    Done,
    Aborted,
}

/// File-transfer progress snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTxStatus {
    pub file_id: u8,
    pub offset: u32,
    pub size: u32,
    pub state: FileTxState,
    /// Last status detail reported by the PD (osdp_FTSTAT)
    pub status_code: i16,
}

impl FileTxStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self.state, FileTxState::InProgress)
    }
}

/// Event delivered to the application together with the PD address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Card presented at a reader
    CardRead {
        reader: u8,
        format: CardFormat,
        /// Number of valid bits in `data` (raw formats) or byte count (ASCII)
        length: u16,
        data: Bytes,
    },

    /// Keys pressed on a reader keypad
    KeypadInput { reader: u8, keys: Bytes },

    /// Tamper state changed
    Tamper { active: bool },

    /// Power state changed
    PowerReport { failure: bool },

    /// File transfer made progress, finished or failed
    FileTransferStatus(FileTxStatus),

    /// Secure channel handshake or MAC verification failed
    SecureChannelLost,

    /// PD stopped answering and was taken offline
    Offline,

    /// PD rejected an application command
    CommandNak { command_id: u8, code: NakCode },

    /// Manufacturer specific reply
    Custom { vendor_code: u32, data: Bytes },
}

impl Event {
    /// Short name for log output
    pub fn name(&self) -> &'static str {
        match self {
            Self::CardRead { .. } => "card_read",
            Self::KeypadInput { .. } => "keypad_input",
            Self::Tamper { .. } => "tamper",
            Self::PowerReport { .. } => "power_report",
            Self::FileTransferStatus(_) => "file_transfer_status",
            Self::SecureChannelLost => "secure_channel_lost",
            Self::Offline => "offline",
            Self::CommandNak { .. } => "command_nak",
            Self::Custom { .. } => "custom",
        }
    }
}
