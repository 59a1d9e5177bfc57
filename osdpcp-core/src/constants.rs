//! Protocol constants

use std::time::Duration;

/// Start of message marker
pub const SOM: u8 = 0x53;

/// Line idle / mark byte that may precede SOM
pub const MARK: u8 = 0xFF;

/// Reply bit in the address byte
pub const ADDR_REPLY_FLAG: u8 = 0x80;

/// Broadcast address
pub const BROADCAST_ADDRESS: u8 = 0x7F;

/// Control byte layout
pub mod ctrl {
    pub const SEQUENCE_MASK: u8 = 0x03;
    /// 1 = CRC-16, 0 = 8-bit checksum
    pub const CRC: u8 = 0x04;
    /// Security control block present
    pub const SCB: u8 = 0x08;
}

/// Length of the MAC carried on secure frames
pub const MAC_LEN: usize = 4;

/// Default time to wait for a PD reply
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(200);

/// Consecutive failed exchanges tolerated before a PD goes offline
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Back-off before a failed secure channel handshake is attempted again
pub const DEFAULT_SC_RETRY_INTERVAL: Duration = Duration::from_secs(600);

/// Default file-transfer fragment size
pub const DEFAULT_FILE_FRAGMENT_SIZE: usize = 128;

/// Largest frame accepted from the wire
pub const MAX_FRAME_SIZE: usize = 1024;

/// Default SCBK (SCBK-D) used by PDs in install mode
pub const SCBK_DEFAULT: [u8; 16] = [
    0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3A, 0x3B, 0x3C, 0x3D, 0x3E,
    0x3F,
];

/// Security control block types
pub mod scs {
    /// CP -> PD osdp_CHLNG
    pub const SCS_11: u8 = 0x11;
    /// PD -> CP osdp_CCRYPT
    pub const SCS_12: u8 = 0x12;
    /// CP -> PD osdp_SCRYPT
    pub const SCS_13: u8 = 0x13;
    /// PD -> CP osdp_RMAC_I
    pub const SCS_14: u8 = 0x14;
    /// CP -> PD, MAC only
    pub const SCS_15: u8 = 0x15;
    /// PD -> CP, MAC only
    pub const SCS_16: u8 = 0x16;
    /// CP -> PD, MAC and encrypted data
    pub const SCS_17: u8 = 0x17;
    /// PD -> CP, MAC and encrypted data
    pub const SCS_18: u8 = 0x18;
}

/// Command codes (CP -> PD)
pub mod cmd {
    pub const POLL: u8 = 0x60;
    pub const ID: u8 = 0x61;
    pub const CAP: u8 = 0x62;
    pub const LSTAT: u8 = 0x64;
    pub const ISTAT: u8 = 0x65;
    pub const OSTAT: u8 = 0x66;
    pub const RSTAT: u8 = 0x67;
    pub const OUT: u8 = 0x68;
    pub const LED: u8 = 0x69;
    pub const BUZ: u8 = 0x6A;
    pub const TEXT: u8 = 0x6B;
    pub const COMSET: u8 = 0x6E;
    pub const KEYSET: u8 = 0x75;
    pub const CHLNG: u8 = 0x76;
    pub const SCRYPT: u8 = 0x77;
    pub const FILETRANSFER: u8 = 0x7C;
    pub const MFG: u8 = 0x80;
}

/// Reply codes (PD -> CP)
pub mod reply {
    pub const ACK: u8 = 0x40;
    pub const NAK: u8 = 0x41;
    pub const PDID: u8 = 0x45;
    pub const PDCAP: u8 = 0x46;
    pub const LSTATR: u8 = 0x48;
    pub const ISTATR: u8 = 0x49;
    pub const OSTATR: u8 = 0x4A;
    pub const RSTATR: u8 = 0x4B;
    pub const RAW: u8 = 0x50;
    pub const FMT: u8 = 0x51;
    pub const KEYPAD: u8 = 0x53;
    pub const COM: u8 = 0x54;
    pub const CCRYPT: u8 = 0x76;
    pub const RMAC_I: u8 = 0x78;
    pub const BUSY: u8 = 0x79;
    pub const FTSTAT: u8 = 0x7A;
    pub const MFGREP: u8 = 0x90;
    pub const XRD: u8 = 0xB1;

    // Defined but not handled by the control panel
    pub const PRES: u8 = 0x52;
    pub const SCREP: u8 = 0x55;
    pub const SPER: u8 = 0x56;
    pub const BIOREADR: u8 = 0x57;
    pub const BIOMATCHR: u8 = 0x58;

    /// Withdrawn from the protocol
    pub fn is_deprecated(code: u8) -> bool {
        matches!(code, PRES | SCREP | SPER)
    }
}
