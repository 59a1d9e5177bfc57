//! OSDP command definitions (CP -> PD)

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    constants::cmd,
    error::{FrameError, Result},
};

/// osdp_OUT record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputControl {
    pub output_no: u8,
    pub control_code: u8,
    /// Timer in 100 ms units
    pub timer_count: u16,
}

/// One half (temporary or permanent) of an LED command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedParams {
    pub control_code: u8,
    pub on_count: u8,
    pub off_count: u8,
    pub on_color: u8,
    pub off_color: u8,
    /// Temporary settings only, 100 ms units
    pub timer_count: u16,
}

/// osdp_LED record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedControl {
    pub reader: u8,
    pub led_number: u8,
    pub temporary: LedParams,
    pub permanent: LedParams,
}

/// osdp_BUZ record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuzzerControl {
    pub reader: u8,
    pub control_code: u8,
    pub on_count: u8,
    pub off_count: u8,
    pub rep_count: u8,
}

/// osdp_TEXT record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextOutput {
    pub reader: u8,
    pub control_code: u8,
    pub temp_time: u8,
    pub offset_row: u8,
    pub offset_col: u8,
    pub text: Bytes,
}

/// osdp_COMSET record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComSet {
    pub address: u8,
    pub baud_rate: u32,
}

/// osdp_KEYSET record
#[derive(Clone, PartialEq, Eq)]
pub struct KeyEnroll {
    /// 0x01 = secure channel base key
    pub key_type: u8,
    pub key: [u8; 16],
}

/// osdp_FILETRANSFER fragment
///
/// An application submits [`FileTransfer::request`] to start a transfer;
/// the control panel fills in size, offset and data from the registered
/// file operations as the transfer proceeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransfer {
    pub file_type: u8,
    pub total_size: u32,
    pub offset: u32,
    pub data: Bytes,
}

impl FileTransfer {
    /// Start request for the file identified by `file_type`
    pub fn request(file_type: u8) -> Self {
        Self {
            file_type,
            total_size: 0,
            offset: 0,
            data: Bytes::new(),
        }
    }
}

/// osdp_MFG record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Custom {
    /// IEEE OUI, 24 bits
    pub vendor_code: u32,
    pub data: Bytes,
}

/// Protocol commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Poll,
    IdReport,
    CapReport,
    LocalStatus,
    InputStatus,
    OutputStatus,
    ReaderStatus,
    OutputControl(OutputControl),
    LedControl(LedControl),
    BuzzerControl(BuzzerControl),
    TextOutput(TextOutput),
    ComSet(ComSet),
    KeyEnroll(KeyEnroll),
    /// osdp_CHLNG carrying RND.A
    ChallengeSetup { rnd_a: [u8; 8] },
    /// osdp_SCRYPT carrying the server cryptogram
    ServerCryptogram { cryptogram: [u8; 16] },
    FileTransfer(FileTransfer),
    Custom(Custom),
}

impl Command {
    /// Command code
    pub fn id(&self) -> u8 {
        match self {
            Self::Poll => cmd::POLL,
            Self::IdReport => cmd::ID,
            Self::CapReport => cmd::CAP,
            Self::LocalStatus => cmd::LSTAT,
            Self::InputStatus => cmd::ISTAT,
            Self::OutputStatus => cmd::OSTAT,
            Self::ReaderStatus => cmd::RSTAT,
            Self::OutputControl(_) => cmd::OUT,
            Self::LedControl(_) => cmd::LED,
            Self::BuzzerControl(_) => cmd::BUZ,
            Self::TextOutput(_) => cmd::TEXT,
            Self::ComSet(_) => cmd::COMSET,
            Self::KeyEnroll(_) => cmd::KEYSET,
            Self::ChallengeSetup { .. } => cmd::CHLNG,
            Self::ServerCryptogram { .. } => cmd::SCRYPT,
            Self::FileTransfer(_) => cmd::FILETRANSFER,
            Self::Custom(_) => cmd::MFG,
        }
    }

    /// Get command name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Poll => "osdp_POLL",
            Self::IdReport => "osdp_ID",
            Self::CapReport => "osdp_CAP",
            Self::LocalStatus => "osdp_LSTAT",
            Self::InputStatus => "osdp_ISTAT",
            Self::OutputStatus => "osdp_OSTAT",
            Self::ReaderStatus => "osdp_RSTAT",
            Self::OutputControl(_) => "osdp_OUT",
            Self::LedControl(_) => "osdp_LED",
            Self::BuzzerControl(_) => "osdp_BUZ",
            Self::TextOutput(_) => "osdp_TEXT",
            Self::ComSet(_) => "osdp_COMSET",
            Self::KeyEnroll(_) => "osdp_KEYSET",
            Self::ChallengeSetup { .. } => "osdp_CHLNG",
            Self::ServerCryptogram { .. } => "osdp_SCRYPT",
            Self::FileTransfer(_) => "osdp_FILETRANSFER",
            Self::Custom(_) => "osdp_MFG",
        }
    }

    /// Secure channel handshake commands, issued by the control panel itself
    pub fn is_handshake(&self) -> bool {
        matches!(self, Self::ChallengeSetup { .. } | Self::ServerCryptogram { .. })
    }

    /// Encode the command data (everything after the command code)
    pub fn encode_data(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            Self::Poll
            | Self::LocalStatus
            | Self::InputStatus
            | Self::OutputStatus
            | Self::ReaderStatus => {}
            Self::IdReport | Self::CapReport => buf.put_u8(0x00),
            Self::OutputControl(c) => {
                buf.put_u8(c.output_no);
                buf.put_u8(c.control_code);
                buf.put_u16_le(c.timer_count);
            }
            Self::LedControl(c) => {
                buf.put_u8(c.reader);
                buf.put_u8(c.led_number);
                put_led_params(&mut buf, &c.temporary);
                buf.put_u16_le(c.temporary.timer_count);
                put_led_params(&mut buf, &c.permanent);
            }
            Self::BuzzerControl(c) => {
                buf.put_u8(c.reader);
                buf.put_u8(c.control_code);
                buf.put_u8(c.on_count);
                buf.put_u8(c.off_count);
                buf.put_u8(c.rep_count);
            }
            Self::TextOutput(c) => {
                buf.put_u8(c.reader);
                buf.put_u8(c.control_code);
                buf.put_u8(c.temp_time);
                buf.put_u8(c.offset_row);
                buf.put_u8(c.offset_col);
                buf.put_u8(c.text.len() as u8);
                buf.put_slice(&c.text);
            }
            Self::ComSet(c) => {
                buf.put_u8(c.address);
                buf.put_u32_le(c.baud_rate);
            }
            Self::KeyEnroll(c) => {
                buf.put_u8(c.key_type);
                buf.put_u8(c.key.len() as u8);
                buf.put_slice(&c.key);
            }
            Self::ChallengeSetup { rnd_a } => buf.put_slice(rnd_a),
            Self::ServerCryptogram { cryptogram } => buf.put_slice(cryptogram),
            Self::FileTransfer(c) => {
                buf.put_u8(c.file_type);
                buf.put_u32_le(c.total_size);
                buf.put_u32_le(c.offset);
                buf.put_u16_le(c.data.len() as u16);
                buf.put_slice(&c.data);
            }
            Self::Custom(c) => {
                put_vendor_code(&mut buf, c.vendor_code);
                buf.put_slice(&c.data);
            }
        }

        buf.freeze()
    }

    /// Decode a command from its code and data
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::UnknownCode`] for unsupported codes and
    /// [`FrameError::Malformed`] when the data length does not match.
    pub fn decode(id: u8, data: &[u8]) -> Result<Self> {
        let command = match id {
            cmd::POLL => Self::Poll,
            cmd::ID => Self::IdReport,
            cmd::CAP => Self::CapReport,
            cmd::LSTAT => Self::LocalStatus,
            cmd::ISTAT => Self::InputStatus,
            cmd::OSTAT => Self::OutputStatus,
            cmd::RSTAT => Self::ReaderStatus,
            cmd::OUT => {
                expect_len(id, data, 4)?;
                Self::OutputControl(OutputControl {
                    output_no: data[0],
                    control_code: data[1],
                    timer_count: LittleEndian::read_u16(&data[2..4]),
                })
            }
            cmd::LED => {
                expect_len(id, data, 14)?;
                let mut temporary = led_params(&data[2..7]);
                temporary.timer_count = LittleEndian::read_u16(&data[7..9]);
                Self::LedControl(LedControl {
                    reader: data[0],
                    led_number: data[1],
                    temporary,
                    permanent: led_params(&data[9..14]),
                })
            }
            cmd::BUZ => {
                expect_len(id, data, 5)?;
                Self::BuzzerControl(BuzzerControl {
                    reader: data[0],
                    control_code: data[1],
                    on_count: data[2],
                    off_count: data[3],
                    rep_count: data[4],
                })
            }
            cmd::TEXT => {
                expect_min_len(id, data, 6)?;
                let len = data[5] as usize;
                expect_len(id, data, 6 + len)?;
                Self::TextOutput(TextOutput {
                    reader: data[0],
                    control_code: data[1],
                    temp_time: data[2],
                    offset_row: data[3],
                    offset_col: data[4],
                    text: Bytes::copy_from_slice(&data[6..]),
                })
            }
            cmd::COMSET => {
                expect_len(id, data, 5)?;
                Self::ComSet(ComSet {
                    address: data[0],
                    baud_rate: LittleEndian::read_u32(&data[1..5]),
                })
            }
            cmd::KEYSET => {
                expect_len(id, data, 18)?;
                if data[1] != 16 {
                    return Err(FrameError::Malformed(format!("key length {}", data[1])));
                }
                let mut key = [0u8; 16];
                key.copy_from_slice(&data[2..18]);
                Self::KeyEnroll(KeyEnroll {
                    key_type: data[0],
                    key,
                })
            }
            cmd::CHLNG => {
                expect_len(id, data, 8)?;
                let mut rnd_a = [0u8; 8];
                rnd_a.copy_from_slice(data);
                Self::ChallengeSetup { rnd_a }
            }
            cmd::SCRYPT => {
                expect_len(id, data, 16)?;
                let mut cryptogram = [0u8; 16];
                cryptogram.copy_from_slice(data);
                Self::ServerCryptogram { cryptogram }
            }
            cmd::FILETRANSFER => {
                expect_min_len(id, data, 11)?;
                let fragment_len = LittleEndian::read_u16(&data[9..11]) as usize;
                expect_len(id, data, 11 + fragment_len)?;
                Self::FileTransfer(FileTransfer {
                    file_type: data[0],
                    total_size: LittleEndian::read_u32(&data[1..5]),
                    offset: LittleEndian::read_u32(&data[5..9]),
                    data: Bytes::copy_from_slice(&data[11..]),
                })
            }
            cmd::MFG => {
                expect_min_len(id, data, 3)?;
                Self::Custom(Custom {
                    vendor_code: LittleEndian::read_u24(&data[0..3]),
                    data: Bytes::copy_from_slice(&data[3..]),
                })
            }
            other => return Err(FrameError::UnknownCode(other)),
        };

        Ok(command)
    }
}

fn put_led_params(buf: &mut BytesMut, params: &LedParams) {
    buf.put_u8(params.control_code);
    buf.put_u8(params.on_count);
    buf.put_u8(params.off_count);
    buf.put_u8(params.on_color);
    buf.put_u8(params.off_color);
}

fn led_params(data: &[u8]) -> LedParams {
    LedParams {
        control_code: data[0],
        on_count: data[1],
        off_count: data[2],
        on_color: data[3],
        off_color: data[4],
        timer_count: 0,
    }
}

pub(crate) fn put_vendor_code(buf: &mut BytesMut, vendor_code: u32) {
    let mut raw = [0u8; 3];
    LittleEndian::write_u24(&mut raw, vendor_code & 0x00FF_FFFF);
    buf.put_slice(&raw);
}

pub(crate) fn expect_len(id: u8, data: &[u8], len: usize) -> Result<()> {
    if data.len() != len {
        return Err(FrameError::Malformed(format!(
            "code 0x{:02X}: expected {} data bytes, got {}",
            id,
            len,
            data.len()
        )));
    }
    Ok(())
}

pub(crate) fn expect_min_len(id: u8, data: &[u8], len: usize) -> Result<()> {
    if data.len() < len {
        return Err(FrameError::Malformed(format!(
            "code 0x{:02X}: expected at least {} data bytes, got {}",
            id,
            len,
            data.len()
        )));
    }
    Ok(())
}

// Keys stay out of debug output
impl fmt::Debug for KeyEnroll {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyEnroll")
            .field("key_type", &self.key_type)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:02X})", self.name(), self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Packet;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_led_wire_layout() {
        let command = Command::LedControl(LedControl {
            reader: 0,
            led_number: 1,
            temporary: LedParams {
                control_code: 2,
                on_count: 3,
                off_count: 4,
                on_color: 5,
                off_color: 6,
                timer_count: 0x0807,
            },
            permanent: LedParams {
                control_code: 9,
                on_count: 10,
                off_count: 11,
                on_color: 12,
                off_color: 13,
                timer_count: 0,
            },
        });

        let data = command.encode_data();
        assert_eq!(data.as_ref(), &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13]);
        assert_eq!(Command::decode(cmd::LED, &data).unwrap(), command);
    }

    #[test]
    fn test_id_and_cap_carry_reply_type() {
        assert_eq!(Command::IdReport.encode_data().as_ref(), &[0x00]);
        assert_eq!(Command::CapReport.encode_data().as_ref(), &[0x00]);
        assert!(Command::Poll.encode_data().is_empty());
    }

    #[test]
    fn test_comset_little_endian() {
        let command = Command::ComSet(ComSet {
            address: 3,
            baud_rate: 115200,
        });
        assert_eq!(command.encode_data().as_ref(), &[3, 0x00, 0xC2, 0x01, 0x00]);
    }

    #[test]
    fn test_custom_vendor_code() {
        let command = Command::Custom(Custom {
            vendor_code: 0x0A0B0C,
            data: Bytes::from_static(&[0xEE]),
        });
        assert_eq!(command.encode_data().as_ref(), &[0x0C, 0x0B, 0x0A, 0xEE]);
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        let result = Command::decode(cmd::BUZ, &[0, 1, 2]);
        assert!(matches!(result, Err(FrameError::Malformed(_))));
    }

    #[test]
    fn test_unknown_command() {
        let result = Command::decode(0x01, &[]);
        assert_eq!(result, Err(FrameError::UnknownCode(0x01)));
    }

    #[test]
    fn test_key_debug_redacted() {
        let command = Command::KeyEnroll(KeyEnroll {
            key_type: 1,
            key: [0x77; 16],
        });
        assert!(!format!("{:?}", command).contains("119"));
    }

    fn any_command() -> impl Strategy<Value = Command> {
        prop_oneof![
            Just(Command::Poll),
            Just(Command::IdReport),
            Just(Command::LocalStatus),
            (any::<u8>(), any::<u8>(), any::<u16>()).prop_map(|(o, c, t)| {
                Command::OutputControl(OutputControl {
                    output_no: o,
                    control_code: c,
                    timer_count: t,
                })
            }),
            (any::<[u8; 5]>()).prop_map(|b| {
                Command::BuzzerControl(BuzzerControl {
                    reader: b[0],
                    control_code: b[1],
                    on_count: b[2],
                    off_count: b[3],
                    rep_count: b[4],
                })
            }),
            proptest::collection::vec(any::<u8>(), 0..32).prop_map(|text| {
                Command::TextOutput(TextOutput {
                    reader: 0,
                    control_code: 1,
                    temp_time: 0,
                    offset_row: 1,
                    offset_col: 1,
                    text: text.into(),
                })
            }),
            (any::<u8>(), any::<u32>(), any::<u32>(), proptest::collection::vec(any::<u8>(), 0..128))
                .prop_map(|(t, size, offset, data)| {
                    Command::FileTransfer(FileTransfer {
                        file_type: t,
                        total_size: size,
                        offset,
                        data: data.into(),
                    })
                }),
            (0u32..0x0100_0000, proptest::collection::vec(any::<u8>(), 0..64)).prop_map(
                |(vendor_code, data)| Command::Custom(Custom {
                    vendor_code,
                    data: data.into(),
                })
            ),
        ]
    }

    proptest! {
        /// Any command survives framing and parsing unchanged.
        #[test]
        fn prop_command_frame_roundtrip(
            address in 0u8..=126,
            sequence in 0u8..4,
            command in any_command(),
        ) {
            let packet = Packet::command(address, sequence, command.id(), command.encode_data());
            let encoded = packet.encode().unwrap();

            let (decoded, consumed) = Packet::decode(&encoded).unwrap();
            prop_assert_eq!(consumed, encoded.len());
            prop_assert_eq!(decoded.address, address);
            prop_assert_eq!(decoded.sequence, sequence);
            prop_assert_eq!(Command::decode(decoded.id, &decoded.data).unwrap(), command);
        }
    }
}
