//! OSDP packet structure and encoding/decoding

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::{
    checksum,
    constants::{ADDR_REPLY_FLAG, MAC_LEN, MAX_FRAME_SIZE, SOM, ctrl, scs},
    error::{FrameError, Result},
};

/// Security control block carried between CTRL and the command/reply code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityBlock {
    /// SCS type (0x11-0x18)
    pub kind: u8,

    /// Type specific data (excludes the length and type bytes)
    pub data: Bytes,
}

impl SecurityBlock {
    pub fn new(kind: u8, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    /// Bytes this block occupies on the wire
    pub fn wire_len(&self) -> usize {
        2 + self.data.len()
    }

    /// Frames with this block carry a MAC before the CRC
    pub fn has_mac(&self) -> bool {
        (scs::SCS_15..=scs::SCS_18).contains(&self.kind)
    }

    /// Frames with this block carry encrypted data
    pub fn has_encrypted_data(&self) -> bool {
        matches!(self.kind, scs::SCS_17 | scs::SCS_18)
    }
}

/// OSDP protocol packet
///
/// # Packet Structure
///
/// ```text
/// ┌─────┬──────┬─────────┬──────┬───────┬──────┬─────────┬─────────┬─────────────┐
/// │ SOM │ ADDR │   LEN   │ CTRL │ [SCB] │  ID  │  DATA   │ [MAC]   │ CRC / CKSUM │
/// │ 0x53│  1   │ 2 (LE)  │  1   │ 2 + n │  1   │    N    │   4     │   2 (LE)/1  │
/// └─────┴──────┴─────────┴──────┴───────┴──────┴─────────┴─────────┴─────────────┘
/// ```
///
/// LEN counts the whole frame, SOM to check characters inclusive.
///
/// # Examples
///
/// ```
/// use osdpcp_core::Packet;
///
/// let packet = Packet::command(0x01, 0, 0x60, Vec::new());
/// let encoded = packet.encode().unwrap();
///
/// let (decoded, consumed) = Packet::decode(&encoded).unwrap();
/// assert_eq!(consumed, encoded.len());
/// assert_eq!(packet.id, decoded.id);
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    /// 7-bit PD address
    pub address: u8,

    /// Set on PD -> CP frames
    pub is_reply: bool,

    /// Sequence number (0-3)
    pub sequence: u8,

    /// CRC-16 (true) or 8-bit checksum (false)
    pub use_crc: bool,

    /// Optional security control block
    pub security: Option<SecurityBlock>,

    /// Command or reply code
    pub id: u8,

    /// Command or reply data
    pub data: Bytes,

    /// MAC (first four bytes) on secure frames
    pub mac: Option<[u8; MAC_LEN]>,

    /// Bytes covered by the MAC (SOM up to the end of DATA), set on decode
    mac_input: Bytes,
}

impl Packet {
    /// SOM + ADDR + LEN + CTRL
    pub const HEADER_SIZE: usize = 5;

    /// Create a CP -> PD packet
    pub fn command(address: u8, sequence: u8, id: u8, data: impl Into<Bytes>) -> Self {
        Self {
            address: address & !ADDR_REPLY_FLAG,
            is_reply: false,
            sequence: sequence & ctrl::SEQUENCE_MASK,
            use_crc: true,
            security: None,
            id,
            data: data.into(),
            mac: None,
            mac_input: Bytes::new(),
        }
    }

    /// Create a PD -> CP packet
    pub fn reply(address: u8, sequence: u8, id: u8, data: impl Into<Bytes>) -> Self {
        Self {
            is_reply: true,
            ..Self::command(address, sequence, id, data)
        }
    }

    /// Attach a security control block
    pub fn with_security(mut self, block: SecurityBlock) -> Self {
        self.security = Some(block);
        self
    }

    /// Use the legacy 8-bit checksum instead of CRC-16
    pub fn with_checksum(mut self) -> Self {
        self.use_crc = false;
        self
    }

    fn needs_mac(&self) -> bool {
        self.security.as_ref().is_some_and(SecurityBlock::has_mac)
    }

    fn check_len(&self) -> usize {
        if self.use_crc { 2 } else { 1 }
    }

    /// Get total encoded frame size
    pub fn size(&self) -> usize {
        Self::HEADER_SIZE
            + self.security.as_ref().map_or(0, SecurityBlock::wire_len)
            + 1
            + self.data.len()
            + if self.needs_mac() { MAC_LEN } else { 0 }
            + self.check_len()
    }

    fn control_byte(&self) -> u8 {
        let mut byte = self.sequence & ctrl::SEQUENCE_MASK;
        if self.use_crc {
            byte |= ctrl::CRC;
        }
        if self.security.is_some() {
            byte |= ctrl::SCB;
        }
        byte
    }

    /// Encode packet to bytes
    ///
    /// Secure frames must already carry their MAC; use
    /// [`Packet::encode_with_mac`] to compute it during encoding.
    pub fn encode(&self) -> Result<BytesMut> {
        if self.needs_mac() && self.mac.is_none() {
            return Err(FrameError::Malformed("secure frame without MAC".into()));
        }
        let mac = self.mac.unwrap_or_default();
        self.encode_with_mac(|_| mac)
    }

    /// Encode packet, computing the MAC over the header and data
    ///
    /// `compute_mac` receives everything from SOM to the end of DATA, with
    /// the final frame length already in place. It is not called for frames
    /// without a MAC.
    pub fn encode_with_mac<F>(&self, compute_mac: F) -> Result<BytesMut>
    where
        F: FnOnce(&[u8]) -> [u8; MAC_LEN],
    {
        let total_size = self.size();
        if total_size > MAX_FRAME_SIZE {
            return Err(FrameError::PayloadTooLarge {
                size: total_size,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(total_size);

        let addr = if self.is_reply {
            self.address | ADDR_REPLY_FLAG
        } else {
            self.address
        };
        buf.put_u8(SOM);
        buf.put_u8(addr);
        buf.put_u16_le(total_size as u16);
        buf.put_u8(self.control_byte());

        if let Some(block) = &self.security {
            buf.put_u8(block.wire_len() as u8);
            buf.put_u8(block.kind);
            buf.put_slice(&block.data);
        }

        buf.put_u8(self.id);
        buf.put_slice(&self.data);

        if self.needs_mac() {
            let mac = compute_mac(&buf);
            buf.put_slice(&mac);
        }

        if self.use_crc {
            let crc = checksum::crc16(&buf);
            buf.put_u16_le(crc);
        } else {
            let cksum = checksum::checksum8(&buf);
            buf.put_u8(cksum);
        }

        Ok(buf)
    }

    /// Decode one packet from the start of `buf`
    ///
    /// Returns the packet and the number of bytes it occupied. Trailing bytes
    /// are left for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Buffer does not yet hold the whole frame ([`FrameError::Incomplete`])
    /// - SOM, length or security block are invalid
    /// - Check characters do not verify
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(FrameError::Incomplete {
                expected: Self::HEADER_SIZE,
                actual: buf.len(),
            });
        }

        let mut header = &buf[..Self::HEADER_SIZE];
        let som = header.get_u8();
        if som != SOM {
            return Err(FrameError::Malformed(format!("bad SOM 0x{:02X}", som)));
        }
        let addr = header.get_u8();
        let len = header.get_u16_le() as usize;
        let control = header.get_u8();

        let use_crc = control & ctrl::CRC != 0;
        let check_len = if use_crc { 2 } else { 1 };

        if len < Self::HEADER_SIZE + 1 + check_len || len > MAX_FRAME_SIZE {
            return Err(FrameError::Malformed(format!("bad length {}", len)));
        }
        if buf.len() < len {
            return Err(FrameError::Incomplete {
                expected: len,
                actual: buf.len(),
            });
        }

        let frame = &buf[..len];
        let body_end = len - check_len;

        if use_crc {
            let received = u16::from_le_bytes([frame[body_end], frame[body_end + 1]]);
            let expected = checksum::crc16(&frame[..body_end]);
            if expected != received {
                return Err(FrameError::ChecksumMismatch { expected, received });
            }
        } else {
            let received = frame[body_end];
            let expected = checksum::checksum8(&frame[..body_end]);
            if expected != received {
                return Err(FrameError::ChecksumMismatch {
                    expected: expected as u16,
                    received: received as u16,
                });
            }
        }

        let mut pos = Self::HEADER_SIZE;

        let security = if control & ctrl::SCB != 0 {
            let scb_len = frame[pos] as usize;
            if scb_len < 2 || pos + scb_len >= body_end {
                return Err(FrameError::Malformed(format!("bad SCB length {}", scb_len)));
            }
            let block = SecurityBlock::new(
                frame[pos + 1],
                Bytes::copy_from_slice(&frame[pos + 2..pos + scb_len]),
            );
            pos += scb_len;
            Some(block)
        } else {
            None
        };

        let mac_len = if security.as_ref().is_some_and(SecurityBlock::has_mac) {
            MAC_LEN
        } else {
            0
        };
        let data_end = body_end
            .checked_sub(mac_len)
            .filter(|end| *end > pos)
            .ok_or_else(|| FrameError::Malformed("frame too short for MAC".into()))?;

        let id = frame[pos];
        let data = Bytes::copy_from_slice(&frame[pos + 1..data_end]);

        let mac = if mac_len > 0 {
            let mut mac = [0u8; MAC_LEN];
            mac.copy_from_slice(&frame[data_end..body_end]);
            Some(mac)
        } else {
            None
        };

        let packet = Self {
            address: addr & !ADDR_REPLY_FLAG,
            is_reply: addr & ADDR_REPLY_FLAG != 0,
            sequence: control & ctrl::SEQUENCE_MASK,
            use_crc,
            security,
            id,
            data,
            mac,
            mac_input: Bytes::copy_from_slice(&frame[..data_end]),
        };

        Ok((packet, len))
    }

    /// Bytes covered by the MAC (empty for packets not produced by `decode`)
    pub fn mac_input(&self) -> &[u8] {
        &self.mac_input
    }

    /// Check if the packet travels inside a secure session (SCS_15..SCS_18)
    pub fn is_secure(&self) -> bool {
        self.needs_mac()
    }
}

/// Drop bytes in front of the next SOM (mark bytes, line noise)
///
/// Returns the number of bytes discarded.
pub fn skip_to_som(buf: &mut BytesMut) -> usize {
    let skip = buf.iter().position(|&b| b == SOM).unwrap_or(buf.len());
    buf.advance(skip);
    skip
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("address", &self.address)
            .field("is_reply", &self.is_reply)
            .field("sequence", &self.sequence)
            .field("scs", &self.security.as_ref().map(|b| format!("0x{:02X}", b.kind)))
            .field("id", &format!("0x{:02X}", self.id))
            .field("data_len", &self.data.len())
            .finish()
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Packet[0x{:02X}](addr={}, seq={}, len={}{})",
            self.id,
            self.address,
            self.sequence,
            self.data.len(),
            if self.is_secure() { ", secure" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{MARK, cmd, reply};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_poll_wire_format() {
        let packet = Packet::command(0x01, 1, cmd::POLL, Vec::new());
        let encoded = packet.encode().unwrap();

        assert_eq!(encoded.len(), 8);
        assert_eq!(&encoded[..6], &[0x53, 0x01, 0x08, 0x00, 0x05, 0x60]);
        let crc = checksum::crc16(&encoded[..6]);
        assert_eq!(&encoded[6..], &crc.to_le_bytes());
    }

    #[test]
    fn test_packet_encode_decode() {
        let original = Packet::reply(0x05, 2, reply::LSTATR, vec![0x01, 0x00]);

        let encoded = original.encode().unwrap();
        let (decoded, consumed) = Packet::decode(&encoded).unwrap();

        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.address, 0x05);
        assert!(decoded.is_reply);
        assert_eq!(decoded.sequence, 2);
        assert_eq!(decoded.id, reply::LSTATR);
        assert_eq!(decoded.data, original.data);
    }

    #[test]
    fn test_checksum_mode_roundtrip() {
        let original = Packet::command(0x02, 3, cmd::ID, vec![0x00]).with_checksum();
        let encoded = original.encode().unwrap();

        assert_eq!(encoded.len(), 8);
        let (decoded, _) = Packet::decode(&encoded).unwrap();
        assert!(!decoded.use_crc);
        assert_eq!(decoded.data.as_ref(), &[0x00]);
    }

    #[test]
    fn test_crc_verification() {
        let packet = Packet::command(0x01, 0, cmd::POLL, Vec::new());
        let mut encoded = packet.encode().unwrap();

        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;

        let result = Packet::decode(&encoded);
        assert!(matches!(result, Err(FrameError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_bad_som() {
        let result = Packet::decode(&[0x54, 0x01, 0x08, 0x00, 0x04, 0x60, 0x00, 0x00]);
        assert!(matches!(result, Err(FrameError::Malformed(_))));
    }

    #[test]
    fn test_incomplete_frame() {
        let packet = Packet::command(0x01, 0, cmd::POLL, Vec::new());
        let encoded = packet.encode().unwrap();

        let result = Packet::decode(&encoded[..encoded.len() - 1]);
        assert!(matches!(
            result,
            Err(FrameError::Incomplete { expected: 8, actual: 7 })
        ));
        assert!(Packet::decode(&encoded[..3]).unwrap_err().is_incomplete());
    }

    #[test]
    fn test_length_too_small() {
        let result = Packet::decode(&[0x53, 0x01, 0x03, 0x00, 0x04, 0x60, 0x00, 0x00]);
        assert!(matches!(result, Err(FrameError::Malformed(_))));
    }

    #[test]
    fn test_trailing_bytes_left_alone() {
        let first = Packet::reply(0x01, 1, reply::ACK, Vec::new()).encode().unwrap();
        let second = Packet::reply(0x02, 1, reply::ACK, Vec::new()).encode().unwrap();

        let mut stream = BytesMut::new();
        stream.put_slice(&first);
        stream.put_slice(&second);

        let (decoded, consumed) = Packet::decode(&stream).unwrap();
        assert_eq!(decoded.address, 0x01);
        assert_eq!(consumed, first.len());

        let (decoded, _) = Packet::decode(&stream[consumed..]).unwrap();
        assert_eq!(decoded.address, 0x02);
    }

    #[test]
    fn test_secure_frame_layout() {
        let packet = Packet::command(0x01, 1, cmd::POLL, Vec::new())
            .with_security(SecurityBlock::new(scs::SCS_15, Vec::new()));

        assert!(packet.encode().is_err());

        let mut seen = Vec::new();
        let encoded = packet
            .encode_with_mac(|input| {
                seen = input.to_vec();
                [0xA1, 0xA2, 0xA3, 0xA4]
            })
            .unwrap();

        // 5 header + 2 SCB + 1 id + 4 MAC + 2 CRC
        assert_eq!(encoded.len(), 14);
        assert_eq!(seen.len(), 8);
        assert_eq!(u16::from_le_bytes([seen[2], seen[3]]), 14);

        let (decoded, _) = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded.mac, Some([0xA1, 0xA2, 0xA3, 0xA4]));
        assert_eq!(decoded.mac_input(), seen.as_slice());
        assert!(decoded.is_secure());
    }

    #[test]
    fn test_handshake_block_has_no_mac() {
        let packet = Packet::command(0x01, 0, cmd::CHLNG, vec![0u8; 8])
            .with_security(SecurityBlock::new(scs::SCS_11, vec![0x01]));
        let encoded = packet.encode().unwrap();

        let (decoded, _) = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded.security, Some(SecurityBlock::new(scs::SCS_11, vec![0x01])));
        assert_eq!(decoded.mac, None);
        assert_eq!(decoded.data.len(), 8);
    }

    #[test]
    fn test_skip_to_som() {
        let mut buf = BytesMut::from(&[MARK, MARK, 0x00, SOM, 0x01][..]);
        assert_eq!(skip_to_som(&mut buf), 3);
        assert_eq!(buf[0], SOM);

        let mut noise = BytesMut::from(&[0x01, 0x02][..]);
        assert_eq!(skip_to_som(&mut noise), 2);
        assert!(noise.is_empty());
    }

    #[test]
    fn test_payload_too_large() {
        let packet = Packet::command(0x01, 0, cmd::MFG, vec![0u8; MAX_FRAME_SIZE]);
        assert!(matches!(
            packet.encode(),
            Err(FrameError::PayloadTooLarge { .. })
        ));
    }
}
