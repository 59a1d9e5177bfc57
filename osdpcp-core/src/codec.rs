//! Command encoding, reply decoding and frame reassembly
//!
//! These functions sit between the typed [`Command`]/[`Reply`] values and
//! the wire. They apply the secure channel and check that a reply belongs
//! to the exchange in flight.

use bytes::{BufMut, BytesMut};
use tracing::{trace, warn};

use crate::{
    Command, Packet, Reply,
    crypto::Crypto,
    error::{FrameError, Result},
    packet::skip_to_som,
    secure::SecureChannel,
    session::Session,
};

/// Encode a command for `address` using the session's current sequence
///
/// Handshake commands get their security block from the channel; all other
/// commands are MACed (and encrypted when they carry data) once the channel
/// is active.
pub fn encode_command(
    address: u8,
    command: &Command,
    session: &Session,
    sc: &mut SecureChannel,
    crypto: &dyn Crypto,
) -> Result<BytesMut> {
    let mut packet = Packet::command(address, session.sequence(), command.id(), command.encode_data());
    if command.is_handshake() {
        packet = packet.with_security(sc.handshake_block(command.id()));
    }

    let encoded = sc.seal(crypto, packet)?;
    trace!(address, command = command.name(), frame = %hex::encode(&encoded), "Encoded command");
    Ok(encoded)
}

/// Check and decode a reply frame for the exchange in flight
///
/// # Errors
///
/// - [`FrameError::AddressMismatch`] / [`FrameError::SequenceMismatch`] if
///   the frame belongs to another exchange
/// - [`FrameError::AuthFailed`] if the secure channel rejects it
/// - decode errors from [`Reply::decode`]
pub fn decode_reply(
    packet: Packet,
    expected_address: u8,
    session: &Session,
    sc: &mut SecureChannel,
    crypto: &dyn Crypto,
) -> Result<Reply> {
    if !packet.is_reply {
        return Err(FrameError::Malformed("command frame on the reply path".into()));
    }
    if packet.address != expected_address {
        return Err(FrameError::AddressMismatch {
            expected: expected_address,
            actual: packet.address,
        });
    }
    if !session.accepts(packet.sequence) {
        return Err(FrameError::SequenceMismatch {
            expected: session.sequence(),
            actual: packet.sequence,
        });
    }

    let packet = sc.open(crypto, packet).map_err(|e| {
        warn!(address = expected_address, error = %e, "Reply rejected by secure channel");
        FrameError::from(e)
    })?;

    Reply::decode(packet.id, &packet.data)
}

/// Accumulates bytes from the transport and splits them into frames
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Number of buffered bytes
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drop everything buffered
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Pull the next complete frame
    ///
    /// Returns `None` while the buffered bytes do not yet hold a frame.
    /// A corrupt frame is consumed and returned as an error so the caller
    /// can count it; leading noise is skipped silently.
    pub fn next_packet(&mut self) -> Option<Result<Packet>> {
        let skipped = skip_to_som(&mut self.buf);
        if skipped > 0 {
            trace!(skipped, "Skipped bytes before SOM");
        }
        if self.buf.is_empty() {
            return None;
        }

        match Packet::decode(&self.buf) {
            Ok((packet, consumed)) => {
                let _ = self.buf.split_to(consumed);
                Some(Ok(packet))
            }
            Err(e) if e.is_incomplete() => None,
            Err(e) => {
                // Resync on the next SOM
                let _ = self.buf.split_to(1);
                Some(Err(e))
            }
        }
    }
}
