//! Per-PD state owned by the control panel

use std::time::Instant;

use bytes::Bytes;
use osdpcp_core::{Command, Reply, Role, ScKey, SecureChannel, Session, constants::reply::is_deprecated};
use osdpcp_types::{
    CardFormat, Event, FileTxStatus, NakCode, PdCapability, PdFlags, PdId, PdInfo,
};
use tracing::{debug, info, warn};

use crate::file::{FileOps, FileTx};

/// Why an exchange was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// Sequence 0 poll to a PD not (yet) online
    FirstContact,
    /// Secure channel handshake step
    Handshake,
    /// Command submitted through `send_command`
    Application,
    /// File-transfer fragment
    FileTransfer,
    /// osdp_ID / osdp_CAP after coming online
    Discovery,
    Poll,
}

/// Exchange in flight
#[derive(Debug)]
pub(crate) struct InFlight {
    pub command: Command,
    pub origin: Origin,
    /// Encoded frame, resent verbatim on retry
    pub frame: Bytes,
    /// The PD's reply moved the MAC chain; encode again before resending
    pub rebuild: bool,
    /// `None` once a retry is due on the next tick
    pub deadline: Option<Instant>,
}

/// Reachability of a PD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Link {
    /// Never answered since registration or the last reset
    Unknown,
    Online,
    Offline { since: Instant },
}

pub(crate) struct PdState {
    pub info: PdInfo,
    pub link: Link,
    pub session: Session,
    pub sc: SecureChannel,
    /// Key used for the next handshake (replaced by osdp_KEYSET)
    pub scbk: Option<[u8; 16]>,
    pub install_mode: bool,
    /// Earliest time a new handshake may start, `None` when due now
    pub sc_not_before: Option<Instant>,
    /// Second handshake step, ready to go out
    pub handshake_next: Option<Command>,
    pub retries: u32,
    pub in_flight: Option<InFlight>,
    pub pending: Option<Command>,
    pub file_tx: Option<FileTx>,
    pub file_ops: Option<Box<dyn FileOps>>,
    pub file_status: Option<FileTxStatus>,
    pub id: Option<PdId>,
    pub id_done: bool,
    pub capabilities: Vec<PdCapability>,
    pub cap_done: bool,
    pub tamper: bool,
    pub power_failure: bool,
    pub inputs: Vec<bool>,
    pub outputs: Vec<bool>,
    pub readers: Vec<u8>,
    pub last_nak: Option<NakCode>,
}

impl PdState {
    pub fn new(info: PdInfo) -> Self {
        Self {
            scbk: info.scbk,
            install_mode: info.flags.contains(PdFlags::INSTALL_MODE),
            info,
            link: Link::Unknown,
            session: Session::new(),
            sc: SecureChannel::new(Role::ControlPanel),
            sc_not_before: None,
            handshake_next: None,
            retries: 0,
            in_flight: None,
            pending: None,
            file_tx: None,
            file_ops: None,
            file_status: None,
            id: None,
            id_done: false,
            capabilities: Vec::new(),
            cap_done: false,
            tamper: false,
            power_failure: false,
            inputs: Vec::new(),
            outputs: Vec::new(),
            readers: Vec::new(),
            last_nak: None,
        }
    }

    pub fn address(&self) -> u8 {
        self.info.address
    }

    pub fn is_online(&self) -> bool {
        self.link == Link::Online
    }

    pub fn is_offline(&self) -> bool {
        matches!(self.link, Link::Offline { .. })
    }

    /// Key to run the handshake with, if this PD uses a secure channel
    pub fn sc_key(&self, master_key: Option<[u8; 16]>) -> Option<ScKey> {
        if self.install_mode {
            Some(ScKey::Default)
        } else if let Some(scbk) = self.scbk {
            Some(ScKey::Scbk(scbk))
        } else {
            master_key.map(ScKey::Master)
        }
    }

    /// Application traffic must wait for an active secure channel
    pub fn requires_sc(&self, master_key: Option<[u8; 16]>) -> bool {
        self.sc_key(master_key).is_some() || self.info.flags.contains(PdFlags::ENFORCE_SECURE)
    }

    pub fn sc_due(&self, now: Instant) -> bool {
        !self.sc.is_active()
            && !self.sc.is_handshaking()
            && self.sc_not_before.is_none_or(|t| now >= t)
    }

    /// An application command is queued or on the wire
    pub fn has_app_command(&self) -> bool {
        self.pending.is_some()
            || self
                .in_flight
                .as_ref()
                .is_some_and(|f| f.origin == Origin::Application)
    }

    /// Back to the state right after registration, keeping learned identity
    pub fn resync(&mut self) {
        self.link = Link::Unknown;
        self.session.reset();
        self.sc.reset();
        self.sc_not_before = None;
        self.handshake_next = None;
        self.retries = 0;
        self.in_flight = None;
    }

    /// Apply a reply that carries data for the application or the PD record
    pub fn apply_reply(&mut self, reply: Reply, events: &mut Vec<Event>) {
        match reply {
            Reply::Ack | Reply::Busy | Reply::Nak(_) => {}
            Reply::PdId(id) => {
                info!(pd = %self.info.label(), "{}", id);
                self.id = Some(id);
            }
            Reply::PdCap(caps) => {
                debug!(pd = %self.info.label(), count = caps.len(), "Capabilities reported");
                self.capabilities = caps;
            }
            Reply::LocalStatus { tamper, power } => {
                if tamper != self.tamper {
                    self.tamper = tamper;
                    events.push(Event::Tamper { active: tamper });
                }
                if power != self.power_failure {
                    self.power_failure = power;
                    events.push(Event::PowerReport { failure: power });
                }
            }
            Reply::InputStatus(inputs) => self.inputs = inputs,
            Reply::OutputStatus(outputs) => self.outputs = outputs,
            Reply::ReaderStatus(readers) => self.readers = readers,
            Reply::Com { address, baud_rate } => {
                info!(
                    pd = %self.info.label(),
                    address, baud_rate, "PD reported new communication settings"
                );
            }
            Reply::RawCard {
                reader,
                format,
                bit_count,
                data,
            } => events.push(Event::CardRead {
                reader,
                format,
                length: bit_count,
                data,
            }),
            Reply::FormattedCard { reader, data, .. } => events.push(Event::CardRead {
                reader,
                format: CardFormat::Ascii,
                length: data.len() as u16,
                data,
            }),
            Reply::Keypad { reader, keys } => events.push(Event::KeypadInput { reader, keys }),
            Reply::Custom { vendor_code, data } => {
                events.push(Event::Custom { vendor_code, data })
            }
            Reply::Unsupported { code, .. } => {
                if is_deprecated(code) {
                    warn!(pd = %self.info.label(), code, "Deprecated reply ignored");
                } else {
                    warn!(pd = %self.info.label(), code, "Unsupported reply ignored");
                }
            }
            other @ (Reply::ClientCryptogram { .. }
            | Reply::InitialRmac(_)
            | Reply::FileTransferStatus(_)) => {
                warn!(pd = %self.info.label(), reply = other.name(), "Unsolicited reply ignored");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pd() -> PdState {
        PdState::new(PdInfo::builder().address(1).build().unwrap())
    }

    #[test]
    fn test_local_status_events_on_change_only() {
        let mut pd = pd();
        let mut events = Vec::new();

        pd.apply_reply(Reply::LocalStatus { tamper: false, power: false }, &mut events);
        assert!(events.is_empty());

        pd.apply_reply(Reply::LocalStatus { tamper: true, power: false }, &mut events);
        pd.apply_reply(Reply::LocalStatus { tamper: true, power: false }, &mut events);
        pd.apply_reply(Reply::LocalStatus { tamper: false, power: true }, &mut events);

        assert_eq!(
            events,
            vec![
                Event::Tamper { active: true },
                Event::Tamper { active: false },
                Event::PowerReport { failure: true },
            ]
        );
    }

    #[test]
    fn test_card_replies_become_card_events() {
        let mut pd = pd();
        let mut events = Vec::new();

        pd.apply_reply(
            Reply::RawCard {
                reader: 0,
                format: CardFormat::RawWiegand,
                bit_count: 26,
                data: Bytes::from_static(&[0x01, 0x02, 0x03, 0x40]),
            },
            &mut events,
        );
        pd.apply_reply(
            Reply::FormattedCard {
                reader: 1,
                direction: 0,
                data: Bytes::from_static(b"1234"),
            },
            &mut events,
        );

        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Event::CardRead { length: 26, .. }));
        assert!(matches!(
            events[1],
            Event::CardRead { reader: 1, format: CardFormat::Ascii, length: 4, .. }
        ));
    }

    #[test]
    fn test_sc_key_selection() {
        let mut pd = pd();
        assert_eq!(pd.sc_key(None), None);
        assert!(!pd.requires_sc(None));
        assert_eq!(pd.sc_key(Some([7; 16])), Some(ScKey::Master([7; 16])));

        pd.scbk = Some([1; 16]);
        assert_eq!(pd.sc_key(Some([7; 16])), Some(ScKey::Scbk([1; 16])));

        pd.install_mode = true;
        assert_eq!(pd.sc_key(None), Some(ScKey::Default));
    }

    #[test]
    fn test_identity_stored() {
        let mut pd = pd();
        let id = PdId {
            vendor_code: 0x0A0B0C,
            model: 1,
            version: 2,
            serial_number: 0xDEADBEEF,
            firmware_version: 0x010203,
        };
        pd.apply_reply(Reply::PdId(id), &mut Vec::new());
        assert_eq!(pd.id, Some(id));
    }
}
