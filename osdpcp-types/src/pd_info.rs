//! Peripheral device configuration and learned device properties

use std::fmt;

use bitflags::bitflags;

use crate::error::{ConfigError, Result};

/// Highest unicast PD address. 0x7F is reserved for broadcast.
pub const MAX_PD_ADDRESS: u8 = 126;

/// Baud rates an OSDP PD is allowed to run at.
pub const SUPPORTED_BAUD_RATES: [u32; 6] = [9600, 19200, 38400, 57600, 115200, 230400];

bitflags! {
    /// Per-PD behaviour flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PdFlags: u32 {
        /// Refuse to exchange application commands outside a secure channel.
        const ENFORCE_SECURE = 1 << 0;

        /// PD is still keyed with SCBK-D; handshake with the default key.
        const INSTALL_MODE = 1 << 1;
    }
}

/// Static configuration of a peripheral device
///
/// Immutable once handed to the control panel.
#[derive(Clone, PartialEq, Eq)]
pub struct PdInfo {
    /// Bus address (0-126)
    pub address: u8,

    /// Line speed
    pub baud_rate: u32,

    /// Behaviour flags
    pub flags: PdFlags,

    /// Secure channel base key (SCBK)
    pub scbk: Option<[u8; 16]>,

    /// Display name used in logs
    pub name: Option<String>,
}

impl PdInfo {
    /// Start building a PD description
    pub fn builder() -> PdInfoBuilder {
        PdInfoBuilder::default()
    }

    /// Whether this PD is expected to run a secure channel
    /// (given whether the control panel has a master key).
    pub fn wants_secure_channel(&self, has_master_key: bool) -> bool {
        self.scbk.is_some() || has_master_key || self.flags.contains(PdFlags::INSTALL_MODE)
    }

    /// Name for log output
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{}@{}", name, self.address),
            None => format!("PD@{}", self.address),
        }
    }
}

// Keys stay out of debug output
impl fmt::Debug for PdInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PdInfo")
            .field("address", &self.address)
            .field("baud_rate", &self.baud_rate)
            .field("flags", &self.flags)
            .field("scbk", &self.scbk.map(|_| "<redacted>"))
            .field("name", &self.name)
            .finish()
    }
}

/// Builder for [`PdInfo`]
///
/// # Examples
///
/// ```
/// use osdpcp_types::{PdFlags, PdInfo};
///
/// let info = PdInfo::builder()
///     .address(101)
///     .baud_rate(115200)
///     .flag(PdFlags::ENFORCE_SECURE)
///     .secure_channel_key(&[0x42; 16])
///     .unwrap()
///     .build()
///     .unwrap();
///
/// assert_eq!(info.address, 101);
/// assert!(info.scbk.is_some());
/// ```
#[derive(Debug, Clone)]
pub struct PdInfoBuilder {
    address: u8,
    baud_rate: u32,
    flags: PdFlags,
    scbk: Option<[u8; 16]>,
    name: Option<String>,
}

impl Default for PdInfoBuilder {
    fn default() -> Self {
        Self {
            address: 0,
            baud_rate: 9600,
            flags: PdFlags::empty(),
            scbk: None,
            name: None,
        }
    }
}

impl PdInfoBuilder {
    pub fn address(mut self, address: u8) -> Self {
        self.address = address;
        self
    }

    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn flag(mut self, flag: PdFlags) -> Self {
        self.flags |= flag;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the secure channel base key
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidKeyLength`] unless the key is 16 bytes.
    pub fn secure_channel_key(mut self, key: &[u8]) -> Result<Self> {
        let key: [u8; 16] = key
            .try_into()
            .map_err(|_| ConfigError::InvalidKeyLength(key.len()))?;
        self.scbk = Some(key);
        Ok(self)
    }

    /// Validate and build
    ///
    /// # Errors
    ///
    /// Returns an error if the address or baud rate is out of range.
    pub fn build(self) -> Result<PdInfo> {
        if self.address > MAX_PD_ADDRESS {
            return Err(ConfigError::InvalidAddress(self.address));
        }
        if !SUPPORTED_BAUD_RATES.contains(&self.baud_rate) {
            return Err(ConfigError::InvalidBaudRate(self.baud_rate));
        }

        Ok(PdInfo {
            address: self.address,
            baud_rate: self.baud_rate,
            flags: self.flags,
            scbk: self.scbk,
            name: self.name,
        })
    }
}

/// Identity reported by a PD (osdp_PDID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PdId {
    /// IEEE OUI, 24 bits
    pub vendor_code: u32,
    pub model: u8,
    pub version: u8,
    pub serial_number: u32,
    /// major.minor.build packed as 0x00MMmmbb
    pub firmware_version: u32,
}

impl fmt::Display for PdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PdId[vendor: {:06X}, model: {}, SN: {:08X}, FW: {}.{}.{}]",
            self.vendor_code,
            self.model,
            self.serial_number,
            (self.firmware_version >> 16) & 0xFF,
            (self.firmware_version >> 8) & 0xFF,
            self.firmware_version & 0xFF,
        )
    }
}

/// One capability triple reported in osdp_PDCAP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdCapability {
    pub function_code: u8,
    pub compliance_level: u8,
    pub num_items: u8,
}
