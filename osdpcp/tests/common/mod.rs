//! Simulated OSDP bus with peripheral devices that answer synchronously

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use osdpcp::{Command, ControlPanel, CpConfig, Event, PdId, PdInfo, Reply};
use osdpcp_core::{
    AesCrypto, FrameReader, Packet, Role, SecureChannel,
    checksum::crc16,
    constants::{SCBK_DEFAULT, reply},
};
use osdpcp_transport::{Channel, Result as TransportResult};
use osdpcp_types::{CardFormat, NakCode, PdCapability};
use parking_lot::Mutex;

pub const CLIENT_UID: [u8; 8] = [0xA1, 0xB2, 0xC3, 0xD4, 0x01, 0x02, 0x03, 0x04];

/// Frame as seen on the wire from the control panel
#[derive(Debug, Clone)]
pub struct Seen {
    pub address: u8,
    pub sequence: u8,
    pub command: Option<Command>,
    pub secure: bool,
}

pub struct SimPd {
    pub address: u8,
    pub scbk: Option<[u8; 16]>,
    pub silent: bool,
    pub busy_replies: u32,
    pub corrupt_ccrypt: bool,
    pub nak_next: Option<NakCode>,
    /// Answer the next command with this reply code and no data
    pub raw_reply: Option<u8>,
    /// Flip a MAC byte in the next secured reply
    pub corrupt_reply_mac: bool,
    pub pending_card: Option<Bytes>,
    pub file: Vec<u8>,
    pub received: Vec<Command>,
    sc: SecureChannel,
    crypto: AesCrypto,
}

impl SimPd {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            scbk: None,
            silent: false,
            busy_replies: 0,
            corrupt_ccrypt: false,
            nak_next: None,
            raw_reply: None,
            corrupt_reply_mac: false,
            pending_card: None,
            file: Vec::new(),
            received: Vec::new(),
            sc: SecureChannel::new(Role::PeripheralDevice),
            crypto: AesCrypto,
        }
    }

    pub fn with_scbk(mut self, scbk: [u8; 16]) -> Self {
        self.scbk = Some(scbk);
        self
    }

    pub fn sc_active(&self) -> bool {
        self.sc.is_active()
    }

    fn handle(&mut self, packet: Packet) -> Option<BytesMut> {
        if self.silent {
            return None;
        }
        let sequence = packet.sequence;
        let scb_flag = packet
            .security
            .as_ref()
            .and_then(|b| b.data.first().copied())
            .unwrap_or(0x01);

        let packet = match self.sc.open(&self.crypto, packet) {
            Ok(packet) => packet,
            Err(_) => {
                self.sc.reset();
                return self.respond(sequence, Reply::Nak(NakCode::EncryptionRequired));
            }
        };
        let command = Command::decode(packet.id, &packet.data).ok()?;
        self.received.push(command.clone());

        if self.busy_replies > 0 {
            self.busy_replies -= 1;
            return self.respond(sequence, Reply::Busy);
        }
        if let Some(code) = self.nak_next.take() {
            return self.respond(sequence, Reply::Nak(code));
        }
        if let Some(code) = self.raw_reply.take() {
            return self.respond(
                sequence,
                Reply::Unsupported {
                    code,
                    data: Bytes::new(),
                },
            );
        }

        let reply = match command {
            Command::Poll => match self.pending_card.take() {
                Some(data) => Reply::RawCard {
                    reader: 0,
                    format: CardFormat::RawWiegand,
                    bit_count: 26,
                    data,
                },
                None => Reply::Ack,
            },
            Command::IdReport => Reply::PdId(PdId {
                vendor_code: 0x00A1B2,
                model: 3,
                version: 1,
                serial_number: 0x1000 + self.address as u32,
                firmware_version: 0x010200,
            }),
            Command::CapReport => Reply::PdCap(vec![PdCapability {
                function_code: 4,
                compliance_level: 1,
                num_items: 1,
            }]),
            Command::ChallengeSetup { rnd_a } => {
                let scbk = match (scb_flag, self.scbk) {
                    (0x00, _) => SCBK_DEFAULT,
                    (_, Some(scbk)) => scbk,
                    (_, None) => return self.respond(sequence, Reply::Nak(NakCode::UnknownCommand)),
                };
                let (rnd_b, mut cryptogram) =
                    self.sc
                        .respond_challenge(&mut self.crypto, &scbk, &CLIENT_UID, &rnd_a, scb_flag);
                if self.corrupt_ccrypt {
                    cryptogram[0] ^= 0xFF;
                }
                return self.respond_handshake(
                    sequence,
                    reply::CCRYPT,
                    Reply::ClientCryptogram {
                        client_uid: CLIENT_UID,
                        rnd_b,
                        cryptogram,
                    },
                );
            }
            Command::ServerCryptogram { cryptogram } => {
                match self.sc.on_server_cryptogram(&self.crypto, &cryptogram) {
                    Ok(rmac) => {
                        return self.respond_handshake(sequence, reply::RMAC_I, Reply::InitialRmac(rmac));
                    }
                    Err(_) => Reply::Nak(NakCode::EncryptionRequired),
                }
            }
            Command::KeyEnroll(enroll) => {
                self.scbk = Some(enroll.key);
                Reply::Ack
            }
            Command::FileTransfer(fragment) => {
                let offset = fragment.offset as usize;
                if self.file.len() < offset + fragment.data.len() {
                    self.file.resize(offset + fragment.data.len(), 0);
                }
                self.file[offset..offset + fragment.data.len()].copy_from_slice(&fragment.data);
                Reply::Ack
            }
            _ => Reply::Ack,
        };

        self.respond(sequence, reply)
    }

    fn respond(&mut self, sequence: u8, reply: Reply) -> Option<BytesMut> {
        let packet = Packet::reply(self.address, sequence, reply.id(), reply.encode_data());
        let mut frame = self.sc.seal(&self.crypto, packet).ok()?;

        if self.corrupt_reply_mac && self.sc.is_active() {
            self.corrupt_reply_mac = false;
            // Last MAC byte sits right before the CRC; keep the CRC valid
            let body_end = frame.len() - 2;
            frame[body_end - 1] ^= 0xFF;
            let crc = crc16(&frame[..body_end]);
            frame[body_end..].copy_from_slice(&crc.to_le_bytes());
        }
        Some(frame)
    }

    fn respond_handshake(&mut self, sequence: u8, id: u8, reply: Reply) -> Option<BytesMut> {
        let packet = Packet::reply(self.address, sequence, id, reply.encode_data())
            .with_security(self.sc.handshake_block(id));
        self.sc.seal(&self.crypto, packet).ok()
    }
}

#[derive(Default)]
pub struct BusState {
    pub pds: Vec<SimPd>,
    pub seen: Vec<Seen>,
    /// Writes that arrived while a reply was still unread
    pub overlapping_writes: usize,
    inbound: FrameReader,
    outbound: BytesMut,
}

impl BusState {
    pub fn pd(&mut self, address: u8) -> &mut SimPd {
        self.pds
            .iter_mut()
            .find(|pd| pd.address == address)
            .expect("simulated PD")
    }

    pub fn frames_to(&self, address: u8) -> usize {
        self.seen.iter().filter(|s| s.address == address).count()
    }
}

/// Channel end the control panel owns
#[derive(Clone)]
pub struct SimBus {
    pub state: Arc<Mutex<BusState>>,
}

impl SimBus {
    pub fn new(pds: Vec<SimPd>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                pds,
                ..Default::default()
            })),
        }
    }
}

impl Channel for SimBus {
    fn read(&mut self, buf: &mut [u8]) -> TransportResult<usize> {
        let mut state = self.state.lock();
        let n = buf.len().min(state.outbound.len());
        buf[..n].copy_from_slice(&state.outbound.split_to(n));
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> TransportResult<usize> {
        let mut state = self.state.lock();
        let state = &mut *state;
        if !state.outbound.is_empty() {
            state.overlapping_writes += 1;
        }

        state.inbound.extend(buf);
        while let Some(Ok(packet)) = state.inbound.next_packet() {
            state.seen.push(Seen {
                address: packet.address,
                sequence: packet.sequence,
                command: Command::decode(packet.id, &packet.data).ok(),
                secure: packet.is_secure(),
            });
            let address = packet.address;
            if let Some(pd) = state.pds.iter_mut().find(|pd| pd.address == address) {
                if let Some(frame) = pd.handle(packet) {
                    state.outbound.extend_from_slice(&frame);
                }
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> TransportResult<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "sim".into()
    }
}

pub type Events = Arc<Mutex<Vec<(u8, Event)>>>;

/// Control panel on a simulated bus, with a manual clock
pub struct Harness {
    pub cp: ControlPanel,
    pub bus: SimBus,
    pub events: Events,
    pub now: Instant,
}

pub const STEP: Duration = Duration::from_millis(10);

pub fn test_config() -> CpConfig {
    CpConfig::default()
        .with_response_timeout(Duration::from_millis(50))
        .with_max_retries(3)
        .with_sc_retry_interval(Duration::from_secs(60))
}

impl Harness {
    pub fn new(pds: Vec<SimPd>, infos: Vec<PdInfo>) -> Self {
        Self::with_config(pds, infos, test_config())
    }

    pub fn with_config(pds: Vec<SimPd>, infos: Vec<PdInfo>, config: CpConfig) -> Self {
        let bus = SimBus::new(pds);
        let mut cp = ControlPanel::with_config(Box::new(bus.clone()), config);
        for info in infos {
            cp.register(info).expect("register PD");
        }

        let events: Events = Arc::default();
        let sink = Arc::clone(&events);
        cp.register_event_callback(move |address, event| sink.lock().push((address, event)));

        Self {
            cp,
            bus,
            events,
            now: Instant::now(),
        }
    }

    pub fn tick(&mut self) {
        self.now += STEP;
        self.cp.tick_at(self.now);
    }

    pub fn run(&mut self, ticks: usize) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    /// Tick until `done` holds, giving up after `max_ticks`
    pub fn run_until(&mut self, max_ticks: usize, mut done: impl FnMut(&mut Self) -> bool) -> bool {
        for _ in 0..max_ticks {
            if done(self) {
                return true;
            }
            self.tick();
        }
        done(self)
    }

    pub fn take_events(&self) -> Vec<(u8, Event)> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn has_event(&self, address: u8, event: &Event) -> bool {
        self.events
            .lock()
            .iter()
            .any(|(a, e)| *a == address && e == event)
    }
}

pub fn plain_pd(address: u8) -> PdInfo {
    PdInfo::builder().address(address).build().expect("PD info")
}

pub fn secure_pd(address: u8, scbk: [u8; 16]) -> PdInfo {
    PdInfo::builder()
        .address(address)
        .secure_channel_key(&scbk)
        .expect("key")
        .build()
        .expect("PD info")
}
