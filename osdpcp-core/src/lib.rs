//! # osdpcp-core
//!
//! Core OSDP protocol implementation for the control panel side.
//!
//! This crate provides the low-level protocol primitives:
//! - Packet structure and encoding/decoding
//! - CRC-16 and checksum calculation
//! - Command and reply definitions
//! - Secure channel handshake, MAC and encryption
//! - Per-PD sequence tracking

pub mod checksum;
pub mod codec;
pub mod command;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod packet;
pub mod reply;
pub mod secure;
pub mod session;

pub use codec::{FrameReader, decode_reply, encode_command};
pub use command::Command;
pub use crypto::{AesCrypto, Crypto};
pub use error::{FrameError, Result, ScError};
pub use packet::{Packet, SecurityBlock};
pub use reply::Reply;
pub use secure::{Role, ScKey, SecureChannel, SessionKeys};
pub use session::Session;

/// OSDP protocol version implemented
pub const PROTOCOL_VERSION: &str = "2.2";
