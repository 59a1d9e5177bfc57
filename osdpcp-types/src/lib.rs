//! Type definitions for osdpcp

pub mod error;
pub mod event;
pub mod pd_info;

pub use error::{ConfigError, Result};
pub use event::{CardFormat, Event, FileTxState, FileTxStatus, NakCode};
pub use pd_info::{PdCapability, PdFlags, PdId, PdInfo, PdInfoBuilder};
