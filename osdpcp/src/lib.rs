//! # osdpcp
//!
//! OSDP control panel: drives access-control peripherals (card readers,
//! keypads, I/O modules) over a shared half-duplex channel.
//!
//! ## Features
//!
//! - Frame codec with CRC-16 and the OSDP secure channel (AES-128)
//! - One exchange on the bus at a time, round-robin over all PDs
//! - Retries, offline detection and sequence resynchronisation
//! - File transfer driven by application supplied [`FileOps`]
//! - [`PollingControlPanel`] to run the engine from a tokio task
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use osdpcp::{ControlPanel, PdInfo, PollingControlPanel};
//! use osdpcp_transport::UdpChannel;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut channel = UdpChannel::new("192.168.1.50", 4001);
//!     channel.connect().await?;
//!
//!     let mut cp = ControlPanel::new(Box::new(channel));
//!     cp.register(
//!         PdInfo::builder()
//!             .address(1)
//!             .secure_channel_key(&[0x42; 16])?
//!             .build()?,
//!     )?;
//!
//!     let mut pcp = PollingControlPanel::new(cp);
//!     pcp.start()?;
//!     pcp.sc_wait(1, Duration::from_secs(5)).await?;
//!
//!     while let Some(event) = pcp.next_event().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod cp;
pub mod error;
pub mod file;
mod pd;
pub mod runner;

// Re-exports
pub use cp::{ControlPanel, CpConfig, PdHandle};
pub use error::{Error, Result};
pub use file::FileOps;
pub use runner::{PdEvent, PollingControlPanel};

// Re-export types
pub use osdpcp_core::{
    Command, Crypto, Reply,
    command::{
        BuzzerControl, ComSet, Custom, FileTransfer, KeyEnroll, LedControl, LedParams,
        OutputControl, TextOutput,
    },
};
pub use osdpcp_types::{
    CardFormat, Event, FileTxState, FileTxStatus, NakCode, PdCapability, PdFlags, PdId, PdInfo,
};
