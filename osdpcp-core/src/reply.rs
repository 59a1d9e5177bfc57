//! OSDP reply definitions (PD -> CP)

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use osdpcp_types::{CardFormat, NakCode, PdCapability, PdId};

use crate::{
    command::{expect_len, expect_min_len, put_vendor_code},
    constants::reply,
    error::{FrameError, Result},
};

/// osdp_FTSTAT record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTransferStatus {
    /// Bit field of PD requested actions
    pub action: u8,
    /// Milliseconds the CP should wait before the next fragment
    pub delay_ms: u16,
    /// 0 = ok, 1 = processed, 2 = rebooting, 3 = finishing, negative = error
    pub status: i16,
    /// Largest fragment the PD wants, 0 = no preference
    pub update_msg_max: u16,
}

impl FileTransferStatus {
    pub const OK: i16 = 0;
    pub const PROCESSED: i16 = 1;
    pub const REBOOTING: i16 = 2;
    pub const FINISHING: i16 = 3;
    pub const ABORT: i16 = -1;

    pub fn is_error(&self) -> bool {
        self.status < 0
    }
}

/// Protocol replies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Nak(NakCode),
    PdId(PdId),
    PdCap(Vec<PdCapability>),
    LocalStatus { tamper: bool, power: bool },
    InputStatus(Vec<bool>),
    OutputStatus(Vec<bool>),
    /// Per reader tamper status
    ReaderStatus(Vec<u8>),
    Com { address: u8, baud_rate: u32 },
    RawCard {
        reader: u8,
        format: CardFormat,
        bit_count: u16,
        data: Bytes,
    },
    FormattedCard {
        reader: u8,
        direction: u8,
        data: Bytes,
    },
    Keypad { reader: u8, keys: Bytes },
    /// osdp_CCRYPT
    ClientCryptogram {
        client_uid: [u8; 8],
        rnd_b: [u8; 8],
        cryptogram: [u8; 16],
    },
    /// osdp_RMAC_I
    InitialRmac([u8; 16]),
    Busy,
    FileTransferStatus(FileTransferStatus),
    Custom { vendor_code: u32, data: Bytes },
    /// Well-formed reply the control panel does not interpret
    Unsupported { code: u8, data: Bytes },
}

impl Reply {
    /// Reply code
    pub fn id(&self) -> u8 {
        match self {
            Self::Ack => reply::ACK,
            Self::Nak(_) => reply::NAK,
            Self::PdId(_) => reply::PDID,
            Self::PdCap(_) => reply::PDCAP,
            Self::LocalStatus { .. } => reply::LSTATR,
            Self::InputStatus(_) => reply::ISTATR,
            Self::OutputStatus(_) => reply::OSTATR,
            Self::ReaderStatus(_) => reply::RSTATR,
            Self::Com { .. } => reply::COM,
            Self::RawCard { .. } => reply::RAW,
            Self::FormattedCard { .. } => reply::FMT,
            Self::Keypad { .. } => reply::KEYPAD,
            Self::ClientCryptogram { .. } => reply::CCRYPT,
            Self::InitialRmac(_) => reply::RMAC_I,
            Self::Busy => reply::BUSY,
            Self::FileTransferStatus(_) => reply::FTSTAT,
            Self::Custom { .. } => reply::MFGREP,
            Self::Unsupported { code, .. } => *code,
        }
    }

    /// Get reply name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ack => "osdp_ACK",
            Self::Nak(_) => "osdp_NAK",
            Self::PdId(_) => "osdp_PDID",
            Self::PdCap(_) => "osdp_PDCAP",
            Self::LocalStatus { .. } => "osdp_LSTATR",
            Self::InputStatus(_) => "osdp_ISTATR",
            Self::OutputStatus(_) => "osdp_OSTATR",
            Self::ReaderStatus(_) => "osdp_RSTATR",
            Self::Com { .. } => "osdp_COM",
            Self::RawCard { .. } => "osdp_RAW",
            Self::FormattedCard { .. } => "osdp_FMT",
            Self::Keypad { .. } => "osdp_KEYPAD",
            Self::ClientCryptogram { .. } => "osdp_CCRYPT",
            Self::InitialRmac(_) => "osdp_RMAC_I",
            Self::Busy => "osdp_BUSY",
            Self::FileTransferStatus(_) => "osdp_FTSTAT",
            Self::Custom { .. } => "osdp_MFGREP",
            Self::Unsupported { code, .. } => match *code {
                reply::XRD => "osdp_XRD",
                reply::PRES => "osdp_PRES",
                reply::SCREP => "osdp_SCREP",
                reply::SPER => "osdp_SPER",
                reply::BIOREADR => "osdp_BIOREADR",
                reply::BIOMATCHR => "osdp_BIOMATCHR",
                _ => "unsupported",
            },
        }
    }

    /// Encode the reply data (everything after the reply code)
    pub fn encode_data(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            Self::Ack | Self::Busy => {}
            Self::Nak(code) => buf.put_u8((*code).into()),
            Self::PdId(id) => {
                put_vendor_code(&mut buf, id.vendor_code);
                buf.put_u8(id.model);
                buf.put_u8(id.version);
                buf.put_u32_le(id.serial_number);
                // Firmware version is major, minor, build
                buf.put_u8((id.firmware_version >> 16) as u8);
                buf.put_u8((id.firmware_version >> 8) as u8);
                buf.put_u8(id.firmware_version as u8);
            }
            Self::PdCap(caps) => {
                for cap in caps {
                    buf.put_u8(cap.function_code);
                    buf.put_u8(cap.compliance_level);
                    buf.put_u8(cap.num_items);
                }
            }
            Self::LocalStatus { tamper, power } => {
                buf.put_u8(*tamper as u8);
                buf.put_u8(*power as u8);
            }
            Self::InputStatus(states) | Self::OutputStatus(states) => {
                for state in states {
                    buf.put_u8(*state as u8);
                }
            }
            Self::ReaderStatus(states) => buf.put_slice(states),
            Self::Com { address, baud_rate } => {
                buf.put_u8(*address);
                buf.put_u32_le(*baud_rate);
            }
            Self::RawCard {
                reader,
                format,
                bit_count,
                data,
            } => {
                buf.put_u8(*reader);
                buf.put_u8(card_format_code(*format));
                buf.put_u16_le(*bit_count);
                buf.put_slice(data);
            }
            Self::FormattedCard {
                reader,
                direction,
                data,
            } => {
                buf.put_u8(*reader);
                buf.put_u8(*direction);
                buf.put_u8(data.len() as u8);
                buf.put_slice(data);
            }
            Self::Keypad { reader, keys } => {
                buf.put_u8(*reader);
                buf.put_u8(keys.len() as u8);
                buf.put_slice(keys);
            }
            Self::ClientCryptogram {
                client_uid,
                rnd_b,
                cryptogram,
            } => {
                buf.put_slice(client_uid);
                buf.put_slice(rnd_b);
                buf.put_slice(cryptogram);
            }
            Self::InitialRmac(rmac) => buf.put_slice(rmac),
            Self::FileTransferStatus(status) => {
                buf.put_u8(status.action);
                buf.put_u16_le(status.delay_ms);
                buf.put_i16_le(status.status);
                buf.put_u16_le(status.update_msg_max);
            }
            Self::Custom { vendor_code, data } => {
                put_vendor_code(&mut buf, *vendor_code);
                buf.put_slice(data);
            }
            Self::Unsupported { data, .. } => buf.put_slice(data),
        }

        buf.freeze()
    }

    /// Decode a reply from its code and data
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Malformed`] when the data does not fit the
    /// reply. Codes without a decoder come back as [`Reply::Unsupported`].
    pub fn decode(id: u8, data: &[u8]) -> Result<Self> {
        let decoded = match id {
            reply::ACK => Self::Ack,
            reply::BUSY => Self::Busy,
            reply::NAK => {
                expect_min_len(id, data, 1)?;
                Self::Nak(NakCode::from(data[0]))
            }
            reply::PDID => {
                expect_len(id, data, 12)?;
                Self::PdId(PdId {
                    vendor_code: LittleEndian::read_u24(&data[0..3]),
                    model: data[3],
                    version: data[4],
                    serial_number: LittleEndian::read_u32(&data[5..9]),
                    firmware_version: (data[9] as u32) << 16
                        | (data[10] as u32) << 8
                        | data[11] as u32,
                })
            }
            reply::PDCAP => {
                if data.len() % 3 != 0 {
                    return Err(FrameError::Malformed(format!(
                        "PDCAP length {} is not a multiple of 3",
                        data.len()
                    )));
                }
                Self::PdCap(
                    data.chunks_exact(3)
                        .map(|c| PdCapability {
                            function_code: c[0],
                            compliance_level: c[1],
                            num_items: c[2],
                        })
                        .collect(),
                )
            }
            reply::LSTATR => {
                expect_len(id, data, 2)?;
                Self::LocalStatus {
                    tamper: data[0] != 0,
                    power: data[1] != 0,
                }
            }
            reply::ISTATR => Self::InputStatus(data.iter().map(|&b| b != 0).collect()),
            reply::OSTATR => Self::OutputStatus(data.iter().map(|&b| b != 0).collect()),
            reply::RSTATR => Self::ReaderStatus(data.to_vec()),
            reply::COM => {
                expect_len(id, data, 5)?;
                Self::Com {
                    address: data[0],
                    baud_rate: LittleEndian::read_u32(&data[1..5]),
                }
            }
            reply::RAW => {
                expect_min_len(id, data, 4)?;
                Self::RawCard {
                    reader: data[0],
                    format: CardFormat::from(data[1]),
                    bit_count: LittleEndian::read_u16(&data[2..4]),
                    data: Bytes::copy_from_slice(&data[4..]),
                }
            }
            reply::FMT => {
                expect_min_len(id, data, 3)?;
                expect_len(id, data, 3 + data[2] as usize)?;
                Self::FormattedCard {
                    reader: data[0],
                    direction: data[1],
                    data: Bytes::copy_from_slice(&data[3..]),
                }
            }
            reply::KEYPAD => {
                expect_min_len(id, data, 2)?;
                expect_len(id, data, 2 + data[1] as usize)?;
                Self::Keypad {
                    reader: data[0],
                    keys: Bytes::copy_from_slice(&data[2..]),
                }
            }
            reply::CCRYPT => {
                expect_len(id, data, 32)?;
                let mut client_uid = [0u8; 8];
                let mut rnd_b = [0u8; 8];
                let mut cryptogram = [0u8; 16];
                client_uid.copy_from_slice(&data[0..8]);
                rnd_b.copy_from_slice(&data[8..16]);
                cryptogram.copy_from_slice(&data[16..32]);
                Self::ClientCryptogram {
                    client_uid,
                    rnd_b,
                    cryptogram,
                }
            }
            reply::RMAC_I => {
                expect_len(id, data, 16)?;
                let mut rmac = [0u8; 16];
                rmac.copy_from_slice(data);
                Self::InitialRmac(rmac)
            }
            reply::FTSTAT => {
                expect_len(id, data, 7)?;
                Self::FileTransferStatus(FileTransferStatus {
                    action: data[0],
                    delay_ms: LittleEndian::read_u16(&data[1..3]),
                    status: LittleEndian::read_i16(&data[3..5]),
                    update_msg_max: LittleEndian::read_u16(&data[5..7]),
                })
            }
            reply::MFGREP => {
                expect_min_len(id, data, 3)?;
                Self::Custom {
                    vendor_code: LittleEndian::read_u24(&data[0..3]),
                    data: Bytes::copy_from_slice(&data[3..]),
                }
            }
            other => Self::Unsupported {
                code: other,
                data: Bytes::copy_from_slice(data),
            },
        };

        Ok(decoded)
    }
}

fn card_format_code(format: CardFormat) -> u8 {
    match format {
        CardFormat::RawUnspecified => 0,
        CardFormat::RawWiegand => 1,
        CardFormat::Ascii => 0x02,
        CardFormat::Unknown(code) => code,
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:02X})", self.name(), self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn roundtrip(original: Reply) {
        let data = original.encode_data();
        assert_eq!(Reply::decode(original.id(), &data).unwrap(), original);
    }

    #[test]
    fn test_pdid_layout() {
        let data = [
            0x0C, 0x0B, 0x0A, // vendor
            0x01, 0x02, // model, version
            0xEF, 0xBE, 0xAD, 0xDE, // serial
            0x01, 0x02, 0x03, // firmware
        ];
        let decoded = Reply::decode(reply::PDID, &data).unwrap();

        assert_eq!(
            decoded,
            Reply::PdId(PdId {
                vendor_code: 0x0A0B0C,
                model: 1,
                version: 2,
                serial_number: 0xDEADBEEF,
                firmware_version: 0x010203,
            })
        );
        assert_eq!(decoded.encode_data().as_ref(), &data);
    }

    #[test]
    fn test_pdcap_length_check() {
        assert!(Reply::decode(reply::PDCAP, &[1, 2]).is_err());
        roundtrip(Reply::PdCap(vec![
            PdCapability {
                function_code: 1,
                compliance_level: 2,
                num_items: 1,
            },
            PdCapability {
                function_code: 9,
                compliance_level: 1,
                num_items: 0,
            },
        ]));
    }

    #[test]
    fn test_card_reads() {
        roundtrip(Reply::RawCard {
            reader: 0,
            format: CardFormat::RawWiegand,
            bit_count: 26,
            data: Bytes::from_static(&[0x01, 0x02, 0x03, 0x40]),
        });
        roundtrip(Reply::FormattedCard {
            reader: 0,
            direction: 0,
            data: Bytes::from_static(b"123456"),
        });
    }

    #[test]
    fn test_keypad_length_check() {
        assert!(Reply::decode(reply::KEYPAD, &[0, 3, b'1']).is_err());
        roundtrip(Reply::Keypad {
            reader: 0,
            keys: Bytes::from_static(b"1234#"),
        });
    }

    #[test]
    fn test_ftstat_negative_status() {
        let status = FileTransferStatus {
            action: 0,
            delay_ms: 10,
            status: FileTransferStatus::ABORT,
            update_msg_max: 0,
        };
        assert!(status.is_error());
        roundtrip(Reply::FileTransferStatus(status));
    }

    #[test]
    fn test_nak_code() {
        let decoded = Reply::decode(reply::NAK, &[0x04]).unwrap();
        assert_eq!(decoded, Reply::Nak(NakCode::SequenceNumber));
    }

    #[test]
    fn test_unknown_reply() {
        let decoded = Reply::decode(0x7E, &[0x01, 0x02]).unwrap();
        assert_eq!(
            decoded,
            Reply::Unsupported {
                code: 0x7E,
                data: Bytes::from_static(&[0x01, 0x02]),
            }
        );
        assert_eq!(decoded.id(), 0x7E);
        assert_eq!(decoded.name(), "unsupported");
    }

    #[test]
    fn test_deprecated_reply_names() {
        let decoded = Reply::decode(reply::SCREP, &[]).unwrap();
        assert_eq!(decoded.name(), "osdp_SCREP");
        assert!(reply::is_deprecated(decoded.id()));
        assert!(!reply::is_deprecated(reply::XRD));
    }
}
