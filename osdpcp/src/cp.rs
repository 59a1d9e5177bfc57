//! Control panel engine
//!
//! One [`ControlPanel`] drives every PD on one channel. It is not
//! thread-safe and never blocks: all progress happens inside [`ControlPanel::tick`],
//! which the host calls periodically (see [`crate::PollingControlPanel`] for a
//! ready-made driver).
//!
//! Each tick either services the single exchange in flight (read, time
//! out, retransmit) or starts a new one for the next PD in round-robin
//! order. Within a PD the work is prioritised as first contact, secure
//! channel handshake, application command, file transfer, identity
//! discovery and finally a plain poll.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use osdpcp_core::{
    AesCrypto, Command, Crypto, FrameError, FrameReader, Reply, ScError,
    constants::{DEFAULT_MAX_RETRIES, DEFAULT_RESPONSE_TIMEOUT, DEFAULT_SC_RETRY_INTERVAL},
    decode_reply, encode_command,
};
use osdpcp_transport::Channel;
use osdpcp_types::{
    ConfigError, Event, FileTxState, FileTxStatus, NakCode, PdCapability, PdId, PdInfo,
    pd_info::MAX_PD_ADDRESS,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    error::{Error, Result},
    file::{FileOps, FileTx},
    pd::{InFlight, Link, Origin, PdState},
};

static NEXT_CP_ID: AtomicU64 = AtomicU64::new(1);

/// Size of a single channel read
const READ_CHUNK: usize = 512;

/// Engine settings
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use osdpcp::CpConfig;
///
/// let config = CpConfig::default()
///     .with_response_timeout(Duration::from_millis(300))
///     .with_max_retries(5);
/// assert_eq!(config.max_retries, 5);
/// ```
#[derive(Clone)]
pub struct CpConfig {
    /// Time a PD gets to start answering
    pub response_timeout: Duration,
    /// Failed attempts tolerated before a PD is taken offline
    pub max_retries: u32,
    /// Back-off after a secure channel failure
    pub sc_retry_interval: Duration,
    /// Automatically try offline PDs again after this long
    pub offline_retry_interval: Option<Duration>,
    /// Master key used to derive the SCBK of PDs without their own key
    pub master_key: Option<[u8; 16]>,
}

impl Default for CpConfig {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            sc_retry_interval: DEFAULT_SC_RETRY_INTERVAL,
            offline_retry_interval: None,
            master_key: None,
        }
    }
}

impl CpConfig {
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_sc_retry_interval(mut self, interval: Duration) -> Self {
        self.sc_retry_interval = interval;
        self
    }

    pub fn with_offline_retry_interval(mut self, interval: Duration) -> Self {
        self.offline_retry_interval = Some(interval);
        self
    }

    pub fn with_master_key(mut self, key: [u8; 16]) -> Self {
        self.master_key = Some(key);
        self
    }
}

impl std::fmt::Debug for CpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpConfig")
            .field("response_timeout", &self.response_timeout)
            .field("max_retries", &self.max_retries)
            .field("sc_retry_interval", &self.sc_retry_interval)
            .field("offline_retry_interval", &self.offline_retry_interval)
            .field("master_key", &self.master_key.map(|_| "<redacted>"))
            .finish()
    }
}

/// Opaque reference to a registered PD
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PdHandle {
    cp: u64,
    index: usize,
    address: u8,
}

impl PdHandle {
    /// Bus address of the PD
    pub fn address(&self) -> u8 {
        self.address
    }
}

type EventCallback = Box<dyn FnMut(u8, Event) + Send>;

/// OSDP control panel
///
/// # Examples
///
/// ```no_run
/// use osdpcp::{ControlPanel, PdInfo};
/// use osdpcp_transport::TcpChannel;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let mut channel = TcpChannel::new("192.168.1.50", 4001);
///     channel.connect().await?;
///
///     let mut cp = ControlPanel::new(Box::new(channel));
///     let reader = cp.register(PdInfo::builder().address(1).build()?)?;
///     cp.register_event_callback(|address, event| println!("PD {}: {:?}", address, event));
///
///     loop {
///         cp.tick();
///         if cp.is_online(reader) {
///             break;
///         }
///         tokio::time::sleep(std::time::Duration::from_millis(20)).await;
///     }
///     cp.teardown();
///     Ok(())
/// }
/// ```
pub struct ControlPanel {
    id: u64,
    channel: Box<dyn Channel>,
    crypto: Box<dyn Crypto>,
    config: CpConfig,
    pds: Vec<PdState>,
    reader: FrameReader,
    /// PD whose exchange is in flight
    active: Option<usize>,
    /// Round-robin position
    cursor: usize,
    callback: Option<EventCallback>,
    events: Vec<(u8, Event)>,
}

impl ControlPanel {
    /// Create a control panel with default settings
    pub fn new(channel: Box<dyn Channel>) -> Self {
        Self::with_config(channel, CpConfig::default())
    }

    pub fn with_config(channel: Box<dyn Channel>, config: CpConfig) -> Self {
        let id = NEXT_CP_ID.fetch_add(1, Ordering::Relaxed);
        debug!(id, channel = %channel.describe(), ?config, "Control panel created");

        Self {
            id,
            channel,
            crypto: Box::new(AesCrypto),
            config,
            pds: Vec::new(),
            reader: FrameReader::new(),
            active: None,
            cursor: 0,
            callback: None,
            events: Vec::new(),
        }
    }

    /// Replace the AES/random provider
    pub fn with_crypto(mut self, crypto: Box<dyn Crypto>) -> Self {
        self.crypto = crypto;
        self
    }

    /// Derive the SCBK of PDs without their own key from `key`
    pub fn with_master_key(mut self, key: [u8; 16]) -> Self {
        self.config.master_key = Some(key);
        self
    }

    pub fn config(&self) -> &CpConfig {
        &self.config
    }

    /// Add a PD
    ///
    /// # Errors
    ///
    /// [`ConfigError::DuplicateAddress`] if a PD already uses the address,
    /// [`ConfigError::InvalidAddress`] for the broadcast address or above.
    pub fn register(&mut self, info: PdInfo) -> Result<PdHandle> {
        if info.address > MAX_PD_ADDRESS {
            return Err(ConfigError::InvalidAddress(info.address).into());
        }
        if self.pds.iter().any(|pd| pd.address() == info.address) {
            return Err(ConfigError::DuplicateAddress(info.address).into());
        }

        let handle = PdHandle {
            cp: self.id,
            index: self.pds.len(),
            address: info.address,
        };
        info!(pd = %info.label(), "PD registered");
        self.pds.push(PdState::new(info));

        Ok(handle)
    }

    /// Look up the handle of the PD at `address`
    pub fn pd(&self, address: u8) -> Result<PdHandle> {
        self.pds
            .iter()
            .position(|pd| pd.address() == address)
            .map(|index| PdHandle {
                cp: self.id,
                index,
                address,
            })
            .ok_or(Error::UnknownAddress(address))
    }

    /// Handles of all registered PDs, in registration order
    pub fn handles(&self) -> Vec<PdHandle> {
        self.pds
            .iter()
            .enumerate()
            .map(|(index, pd)| PdHandle {
                cp: self.id,
                index,
                address: pd.address(),
            })
            .collect()
    }

    pub fn pd_count(&self) -> usize {
        self.pds.len()
    }

    fn index(&self, handle: PdHandle) -> Result<usize> {
        if handle.cp != self.id || handle.index >= self.pds.len() {
            return Err(Error::InvalidHandle);
        }
        Ok(handle.index)
    }

    fn state(&self, handle: PdHandle) -> Option<&PdState> {
        self.index(handle).ok().map(|i| &self.pds[i])
    }

    /// Queue an application command for a PD
    ///
    /// The command goes out on a later tick. Only one application command
    /// may be outstanding per PD.
    ///
    /// # Errors
    ///
    /// - [`Error::Busy`] if the PD still has a command outstanding
    /// - [`Error::ReservedCommand`] for secure channel handshake commands
    /// - [`Error::SecureChannelRequired`] for `KeyEnroll` without an active
    ///   secure channel
    /// - [`Error::FileOpsMissing`] / [`Error::FileOps`] when a file transfer
    ///   cannot be started
    pub fn send_command(&mut self, handle: PdHandle, command: Command) -> Result<()> {
        let index = self.index(handle)?;
        if command.is_handshake() {
            return Err(Error::ReservedCommand(command.name()));
        }

        let pd = &mut self.pds[index];
        let address = pd.address();

        if let Command::FileTransfer(request) = &command {
            if pd.file_tx.is_some() {
                return Err(Error::Busy(address));
            }
            let ops = pd.file_ops.as_mut().ok_or(Error::FileOpsMissing(address))?;
            let tx = FileTx::start(ops.as_mut(), request.file_type)?;
            pd.file_status = Some(tx.status(FileTxState::InProgress));
            pd.file_tx = Some(tx);
            info!(pd = %pd.info.label(), file_id = request.file_type, "File transfer queued");
            return Ok(());
        }

        if pd.has_app_command() {
            return Err(Error::Busy(address));
        }
        let master_key = self.config.master_key;
        if pd.requires_sc(master_key) && pd.sc_key(master_key).is_none() {
            // Secure channel enforced but no key to set one up with
            return Err(Error::SecureChannelRequired(address));
        }
        if matches!(command, Command::KeyEnroll(_)) && !pd.sc.is_active() {
            return Err(Error::SecureChannelRequired(address));
        }

        debug!(pd = %pd.info.label(), command = command.name(), "Command queued");
        pd.pending = Some(command);
        Ok(())
    }

    /// Attach file operations used by file transfers to this PD
    pub fn register_file_ops(&mut self, handle: PdHandle, ops: Box<dyn FileOps>) -> Result<()> {
        let index = self.index(handle)?;
        self.pds[index].file_ops = Some(ops);
        Ok(())
    }

    /// Receive events from all PDs
    ///
    /// The callback runs inside `tick` and must not call back into the
    /// control panel.
    pub fn register_event_callback<F>(&mut self, callback: F)
    where
        F: FnMut(u8, Event) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
    }

    pub fn is_online(&self, handle: PdHandle) -> bool {
        self.state(handle).is_some_and(PdState::is_online)
    }

    pub fn sc_active(&self, handle: PdHandle) -> bool {
        self.state(handle).is_some_and(|pd| pd.sc.is_active())
    }

    /// Bit `i` set when the `i`-th registered PD has an active secure channel
    pub fn sc_status_mask(&self) -> u128 {
        self.mask(|pd| pd.sc.is_active())
    }

    /// Bit `i` set when the `i`-th registered PD is online
    pub fn online_mask(&self) -> u128 {
        self.mask(PdState::is_online)
    }

    fn mask(&self, f: impl Fn(&PdState) -> bool) -> u128 {
        self.pds
            .iter()
            .enumerate()
            .filter(|(_, pd)| f(pd))
            .fold(0u128, |mask, (i, _)| mask | 1u128 << i)
    }

    pub fn pd_id(&self, handle: PdHandle) -> Option<PdId> {
        self.state(handle).and_then(|pd| pd.id)
    }

    pub fn capabilities(&self, handle: PdHandle) -> &[PdCapability] {
        self.state(handle)
            .map(|pd| pd.capabilities.as_slice())
            .unwrap_or_default()
    }

    pub fn last_nak(&self, handle: PdHandle) -> Option<NakCode> {
        self.state(handle).and_then(|pd| pd.last_nak)
    }

    /// Progress of the current (or last) file transfer
    pub fn file_tx_status(&self, handle: PdHandle) -> Option<FileTxStatus> {
        self.state(handle).and_then(|pd| pd.file_status)
    }

    /// Bring a PD back into the polling rotation and resynchronise it
    pub fn reset_pd(&mut self, handle: PdHandle) -> Result<()> {
        let index = self.index(handle)?;
        if self.active == Some(index) {
            self.active = None;
            self.reader.clear();
        }
        let pd = &mut self.pds[index];
        info!(pd = %pd.info.label(), "PD reset");
        pd.resync();
        Ok(())
    }

    /// Release all PDs and wipe their keys
    pub fn teardown(mut self) {
        for pd in &mut self.pds {
            pd.sc.reset();
            if let (Some(tx), Some(ops)) = (pd.file_tx.take(), pd.file_ops.as_mut()) {
                ops.close(tx.file_id());
            }
        }
        info!(id = self.id, pds = self.pds.len(), "Control panel torn down");
    }

    /// Advance the engine by one step
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    /// [`ControlPanel::tick`] with an explicit clock
    pub fn tick_at(&mut self, now: Instant) {
        match self.active {
            Some(index) => self.service(index, now),
            None => {
                if let Some(index) = self.select(now) {
                    self.start_exchange(index, now);
                }
            }
        }
        self.dispatch_events();
    }

    fn dispatch_events(&mut self) {
        if self.events.is_empty() {
            return;
        }
        let events = std::mem::take(&mut self.events);
        match self.callback.as_mut() {
            Some(callback) => {
                for (address, event) in events {
                    callback(address, event);
                }
            }
            None => debug!(dropped = events.len(), "No event callback registered"),
        }
    }

    fn emit(&mut self, index: usize, event: Event) {
        let address = self.pds[index].address();
        debug!(address, event = event.name(), "Event");
        self.events.push((address, event));
    }

    /// Pick the PD for the next exchange
    fn select(&mut self, now: Instant) -> Option<usize> {
        let count = self.pds.len();
        if count == 0 {
            return None;
        }

        if let Some(interval) = self.config.offline_retry_interval {
            for pd in &mut self.pds {
                if let Link::Offline { since } = pd.link {
                    if now.saturating_duration_since(since) >= interval {
                        info!(pd = %pd.info.label(), "Retrying offline PD");
                        pd.resync();
                    }
                }
            }
        }

        let order = (0..count).map(|k| (self.cursor + k) % count);
        let eligible: Vec<usize> = order.filter(|&i| !self.pds[i].is_offline()).collect();

        let chosen = eligible
            .iter()
            .copied()
            .find(|&i| self.pds[i].pending.is_some() || self.pds[i].handshake_next.is_some())
            .or_else(|| eligible.first().copied())?;

        self.cursor = (chosen + 1) % count;
        Some(chosen)
    }

    /// Decide what the PD gets next
    fn next_command(&mut self, index: usize, now: Instant) -> (Command, Origin) {
        let master_key = self.config.master_key;
        let pd = &mut self.pds[index];

        if !pd.is_online() {
            pd.session.reset();
            return (Command::Poll, Origin::FirstContact);
        }

        if let Some(command) = pd.handshake_next.take() {
            return (command, Origin::Handshake);
        }
        if let Some(key) = pd.sc_key(master_key).filter(|_| pd.sc_due(now)) {
            debug!(pd = %pd.info.label(), "Starting secure channel handshake");
            pd.session.reset();
            pd.sc_not_before = None;
            let command = pd.sc.begin(self.crypto.as_mut(), key);
            return (command, Origin::Handshake);
        }

        let sc_ready = !pd.requires_sc(master_key) || pd.sc.is_active();

        if pd.pending.is_some() {
            if sc_ready {
                if let Some(command) = pd.pending.take() {
                    return (command, Origin::Application);
                }
            } else if pd.sc_not_before.is_some_and(|t| now < t) {
                // Backing off after a failed handshake
                if let Some(command) = pd.pending.take() {
                    warn!(
                        pd = %pd.info.label(),
                        command = command.name(),
                        "Secure channel unavailable, dropping command"
                    );
                }
            }
        }

        let fragment = match (pd.file_tx.as_mut(), pd.file_ops.as_mut()) {
            (Some(tx), Some(ops)) if sc_ready && tx.is_ready(now) => {
                Some(tx.next_fragment(ops.as_mut()))
            }
            _ => None,
        };
        match fragment {
            Some(Ok(fragment)) => (Command::FileTransfer(fragment), Origin::FileTransfer),
            Some(Err(e)) => {
                error!(pd = %pd.info.label(), error = %e, "File read failed");
                self.finish_file_tx(index, FileTxState::Aborted);
                discovery_or_poll(&mut self.pds[index])
            }
            None => discovery_or_poll(pd),
        }
    }

    fn start_exchange(&mut self, index: usize, now: Instant) {
        let (command, origin) = self.next_command(index, now);
        let pd = &mut self.pds[index];

        let frame = match encode_command(
            pd.address(),
            &command,
            &pd.session,
            &mut pd.sc,
            self.crypto.as_ref(),
        ) {
            Ok(frame) => frame.freeze(),
            Err(e) => {
                error!(pd = %pd.info.label(), command = command.name(), error = %e, "Cannot encode command");
                if origin == Origin::FileTransfer {
                    self.finish_file_tx(index, FileTxState::Aborted);
                }
                return;
            }
        };

        trace!(pd = %pd.info.label(), command = command.name(), seq = pd.session.sequence(), "Exchange started");
        pd.in_flight = Some(InFlight {
            command,
            origin,
            frame,
            rebuild: false,
            deadline: None,
        });

        self.active = Some(index);
        self.reader.clear();
        self.transmit(index, now);
        if self.active == Some(index) {
            self.poll_reply(index, now);
        }
    }

    /// Put the frame of the exchange in flight on the wire
    fn transmit(&mut self, index: usize, now: Instant) {
        let timeout = self.config.response_timeout;
        let Some(in_flight) = self.pds[index].in_flight.as_mut() else {
            return;
        };

        let expected = in_flight.frame.len();
        let result = self
            .channel
            .write(&in_flight.frame)
            .and_then(|written| self.channel.flush().map(|()| written));
        in_flight.deadline = Some(now + timeout);

        match result {
            Ok(written) if written == expected => {}
            Ok(written) => {
                // The PD drops the partial frame when the resend's SOM arrives
                self.fail(index, &format!("short write: {} of {} bytes", written, expected), now);
            }
            Err(e) => self.fail(index, &format!("write failed: {}", e), now),
        }
    }

    /// Encode the command in flight again against the current MAC chain
    ///
    /// Returns false when the exchange had to be abandoned.
    fn rebuild_frame(&mut self, index: usize) -> bool {
        let pd = &mut self.pds[index];
        let address = pd.address();
        let Some(in_flight) = pd.in_flight.as_mut() else {
            return false;
        };
        if !in_flight.rebuild {
            return true;
        }

        match encode_command(
            address,
            &in_flight.command,
            &pd.session,
            &mut pd.sc,
            self.crypto.as_ref(),
        ) {
            Ok(frame) => {
                in_flight.frame = frame.freeze();
                in_flight.rebuild = false;
                true
            }
            Err(e) => {
                error!(pd = %pd.info.label(), command = in_flight.command.name(), error = %e, "Cannot encode command");
                let origin = in_flight.origin;
                self.end_exchange(index);
                if origin == Origin::FileTransfer {
                    self.finish_file_tx(index, FileTxState::Aborted);
                }
                false
            }
        }
    }

    fn service(&mut self, index: usize, now: Instant) {
        let resend = self.pds[index]
            .in_flight
            .as_ref()
            .is_some_and(|f| f.deadline.is_none());

        if resend {
            self.reader.clear();
            if !self.rebuild_frame(index) {
                return;
            }
            self.transmit(index, now);
        }
        if self.active == Some(index) {
            self.poll_reply(index, now);
        }
    }

    fn poll_reply(&mut self, index: usize, now: Instant) {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.channel.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.reader.extend(&buf[..n]),
                Err(e) => {
                    self.fail(index, &format!("read failed: {}", e), now);
                    return;
                }
            }
        }

        while let Some(result) = self.reader.next_packet() {
            let packet = match result {
                Ok(packet) if !packet.is_reply => {
                    // Our own frame echoed back on a two-wire bus
                    continue;
                }
                Ok(packet) => packet,
                Err(e) => {
                    self.fail(index, &e.to_string(), now);
                    return;
                }
            };

            let pd = &mut self.pds[index];
            match decode_reply(packet, pd.address(), &pd.session, &mut pd.sc, self.crypto.as_ref()) {
                Ok(reply) => {
                    trace!(pd = %pd.info.label(), reply = %reply, "Reply received");
                    self.on_reply(index, reply, now);
                }
                Err(FrameError::AuthFailed) => {
                    self.secure_channel_lost(index, now, "reply MAC did not verify");
                    self.end_exchange(index);
                }
                Err(e @ (FrameError::AddressMismatch { .. } | FrameError::SequenceMismatch { .. })) => {
                    self.fail(index, &e.to_string(), now);
                }
                Err(e) => {
                    // Rejected after the secure channel accepted the frame
                    self.fail_and_rebuild(index, &e.to_string(), now);
                }
            }
            return;
        }

        let expired = self.pds[index]
            .in_flight
            .as_ref()
            .and_then(|f| f.deadline)
            .is_some_and(|deadline| now >= deadline);
        if expired {
            self.fail(index, "response timeout", now);
        }
    }

    /// Count a failed attempt; resend next tick or take the PD offline
    fn fail(&mut self, index: usize, reason: &str, now: Instant) {
        self.reader.clear();
        let max_retries = self.config.max_retries;
        let pd = &mut self.pds[index];
        pd.retries += 1;

        if pd.retries > max_retries {
            self.go_offline(index, now);
            return;
        }

        warn!(pd = %pd.info.label(), attempt = pd.retries, reason, "Exchange failed, retrying");
        if let Some(in_flight) = pd.in_flight.as_mut() {
            in_flight.deadline = None;
        }
    }

    /// Like [`Self::fail`], for replies that already advanced the MAC chain
    fn fail_and_rebuild(&mut self, index: usize, reason: &str, now: Instant) {
        self.fail(index, reason, now);
        if let Some(in_flight) = self.pds[index].in_flight.as_mut() {
            in_flight.rebuild = true;
        }
    }

    fn go_offline(&mut self, index: usize, now: Instant) {
        let pd = &mut self.pds[index];
        let in_flight = pd.in_flight.take();

        match in_flight.as_ref().map(|f| f.origin) {
            Some(Origin::Handshake) => {
                warn!(pd = %pd.info.label(), error = %ScError::HandshakeTimeout, "Secure channel setup failed");
            }
            Some(Origin::Application) => {
                if let Some(f) = &in_flight {
                    warn!(pd = %pd.info.label(), command = f.command.name(), "Command dropped");
                }
            }
            _ => {}
        }

        if pd.link != Link::Unknown || pd.id_done {
            warn!(pd = %pd.info.label(), "PD went offline");
        } else {
            debug!(pd = %pd.info.label(), "PD not answering");
        }

        pd.resync();
        pd.link = Link::Offline { since: now };
        pd.pending = None;

        if self.pds[index].file_tx.is_some() {
            self.finish_file_tx(index, FileTxState::Aborted);
        }
        self.active = None;
        self.emit(index, Event::Offline);
    }

    fn end_exchange(&mut self, index: usize) {
        self.pds[index].in_flight = None;
        self.pds[index].retries = 0;
        if self.active == Some(index) {
            self.active = None;
        }
    }

    fn secure_channel_lost(&mut self, index: usize, now: Instant, reason: &str) {
        let interval = self.config.sc_retry_interval;
        let pd = &mut self.pds[index];
        warn!(pd = %pd.info.label(), reason, "Secure channel lost");

        pd.sc.reset();
        pd.handshake_next = None;
        pd.sc_not_before = Some(now + interval);
        pd.session.reset();

        self.emit(index, Event::SecureChannelLost);
    }

    fn on_reply(&mut self, index: usize, reply: Reply, now: Instant) {
        if reply == Reply::Busy {
            self.fail_and_rebuild(index, "PD busy", now);
            return;
        }

        let Some(in_flight) = self.pds[index].in_flight.take() else {
            return;
        };
        self.end_exchange(index);

        let pd = &mut self.pds[index];
        pd.session.advance();
        if !pd.is_online() {
            info!(pd = %pd.info.label(), "PD online");
            pd.link = Link::Online;
        }

        if let Reply::Nak(code) = reply {
            self.on_nak(index, &in_flight, code, now);
            return;
        }

        match in_flight.origin {
            Origin::Handshake => self.on_handshake_reply(index, reply, now),
            Origin::FileTransfer => {
                let status = match &reply {
                    Reply::FileTransferStatus(status) => Some(*status),
                    Reply::Ack => None,
                    other => {
                        warn!(reply = other.name(), "Unexpected file transfer reply");
                        None
                    }
                };
                self.on_file_status(index, status.as_ref(), now);
            }
            Origin::Discovery => {
                let pd = &mut self.pds[index];
                match in_flight.command {
                    Command::IdReport => pd.id_done = true,
                    _ => pd.cap_done = true,
                }
                self.apply(index, reply);
            }
            Origin::Application => {
                if let (Command::KeyEnroll(enroll), Reply::Ack) = (&in_flight.command, &reply) {
                    let pd = &mut self.pds[index];
                    info!(pd = %pd.info.label(), "New secure channel key installed");
                    pd.scbk = Some(enroll.key);
                    pd.install_mode = false;
                    pd.sc.reset();
                    pd.sc_not_before = None;
                }
                self.apply(index, reply);
            }
            Origin::FirstContact | Origin::Poll => self.apply(index, reply),
        }
    }

    fn apply(&mut self, index: usize, reply: Reply) {
        let mut events = Vec::new();
        self.pds[index].apply_reply(reply, &mut events);
        for event in events {
            self.emit(index, event);
        }
    }

    fn on_nak(&mut self, index: usize, in_flight: &InFlight, code: NakCode, now: Instant) {
        let master_key = self.config.master_key;
        let interval = self.config.sc_retry_interval;
        let pd = &mut self.pds[index];
        warn!(
            pd = %pd.info.label(),
            command = in_flight.command.name(),
            %code,
            "Command rejected"
        );
        pd.last_nak = Some(code);

        if code.is_sequence_error() {
            pd.session.reset();
        }

        match in_flight.origin {
            Origin::Handshake => {
                pd.sc.reset();
                pd.sc_not_before = Some(now + interval);
            }
            Origin::Discovery => match in_flight.command {
                Command::IdReport => pd.id_done = true,
                _ => pd.cap_done = true,
            },
            _ => {}
        }

        if code.is_security_error()
            && in_flight.origin != Origin::Handshake
            && pd.sc_key(master_key).is_some()
        {
            debug!(pd = %pd.info.label(), "Scheduling secure channel setup");
            pd.sc.reset();
            pd.sc_not_before = None;
        }

        if in_flight.origin == Origin::FileTransfer {
            self.finish_file_tx(index, FileTxState::Aborted);
        }

        self.emit(
            index,
            Event::CommandNak {
                command_id: in_flight.command.id(),
                code,
            },
        );
    }

    fn on_handshake_reply(&mut self, index: usize, reply: Reply, now: Instant) {
        let pd = &mut self.pds[index];
        let crypto = self.crypto.as_ref();

        let result = match reply {
            Reply::ClientCryptogram {
                client_uid,
                rnd_b,
                cryptogram,
            } => pd
                .sc
                .on_client_cryptogram(crypto, &client_uid, &rnd_b, &cryptogram)
                .map(|server| {
                    pd.handshake_next = Some(Command::ServerCryptogram { cryptogram: server });
                }),
            Reply::InitialRmac(rmac) => pd.sc.on_initial_rmac(crypto, &rmac).map(|()| {
                info!(pd = %pd.info.label(), "Secure channel established");
                pd.sc_not_before = None;
            }),
            other => {
                warn!(pd = %pd.info.label(), reply = other.name(), "Unexpected handshake reply");
                Err(ScError::InvalidState("unexpected handshake reply"))
            }
        };

        if let Err(e) = result {
            self.secure_channel_lost(index, now, &e.to_string());
        }
    }

    fn on_file_status(
        &mut self,
        index: usize,
        status: Option<&osdpcp_core::reply::FileTransferStatus>,
        now: Instant,
    ) {
        let pd = &mut self.pds[index];
        let Some(tx) = pd.file_tx.as_mut() else {
            return;
        };

        match tx.on_status(status, now) {
            FileTxState::InProgress => {
                let snapshot = tx.status(FileTxState::InProgress);
                pd.file_status = Some(snapshot);
                if let Some(ops) = pd.file_ops.as_mut() {
                    ops.progress(&snapshot);
                }
                self.emit(index, Event::FileTransferStatus(snapshot));
            }
            finished => self.finish_file_tx(index, finished),
        }
    }

    fn finish_file_tx(&mut self, index: usize, state: FileTxState) {
        let pd = &mut self.pds[index];
        let Some(mut tx) = pd.file_tx.take() else {
            return;
        };

        let snapshot = match state {
            FileTxState::Aborted => tx.abort(),
            other => tx.status(other),
        };
        if let Some(ops) = pd.file_ops.as_mut() {
            ops.progress(&snapshot);
            ops.close(tx.file_id());
        }
        pd.file_status = Some(snapshot);

        info!(pd = %pd.info.label(), file_id = snapshot.file_id, state = ?state, "File transfer finished");
        self.emit(index, Event::FileTransferStatus(snapshot));
    }
}

fn discovery_or_poll(pd: &mut PdState) -> (Command, Origin) {
    if !pd.id_done {
        (Command::IdReport, Origin::Discovery)
    } else if !pd.cap_done {
        (Command::CapReport, Origin::Discovery)
    } else {
        (Command::Poll, Origin::Poll)
    }
}

impl std::fmt::Debug for ControlPanel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPanel")
            .field("id", &self.id)
            .field("channel", &self.channel.describe())
            .field("pds", &self.pds.len())
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osdpcp_transport::Result as TransportResult;
    use pretty_assertions::assert_eq;

    struct NullChannel;

    impl Channel for NullChannel {
        fn read(&mut self, _buf: &mut [u8]) -> TransportResult<usize> {
            Ok(0)
        }

        fn write(&mut self, buf: &[u8]) -> TransportResult<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> TransportResult<()> {
            Ok(())
        }

        fn describe(&self) -> String {
            "null".into()
        }
    }

    fn pd_info(address: u8) -> PdInfo {
        PdInfo::builder().address(address).build().unwrap()
    }

    #[test]
    fn test_config_debug_redacts_master_key() {
        let config = CpConfig::default().with_master_key([0xAB; 16]);
        let printed = format!("{:?}", config);
        assert!(printed.contains("redacted"));
        assert!(!printed.contains("171"));
    }

    #[test]
    fn test_handle_from_other_control_panel() {
        let mut a = ControlPanel::new(Box::new(NullChannel));
        let mut b = ControlPanel::new(Box::new(NullChannel));
        let handle = a.register(pd_info(1)).unwrap();
        b.register(pd_info(1)).unwrap();

        assert!(matches!(b.send_command(handle, Command::Poll), Err(Error::InvalidHandle)));
        assert!(!b.is_online(handle));
        assert!(b.capabilities(handle).is_empty());
    }

    #[test]
    fn test_round_robin_prefers_pending_command() {
        let mut cp = ControlPanel::new(Box::new(NullChannel));
        for address in [1, 2, 3] {
            cp.register(pd_info(address)).unwrap();
        }
        let now = Instant::now();

        assert_eq!(cp.select(now), Some(0));
        assert_eq!(cp.select(now), Some(1));

        cp.pds[0].pending = Some(Command::LocalStatus);
        assert_eq!(cp.select(now), Some(0));
        cp.pds[0].pending = None;
        assert_eq!(cp.select(now), Some(1));
    }

    #[test]
    fn test_offline_pds_not_selected() {
        let mut cp = ControlPanel::new(Box::new(NullChannel));
        cp.register(pd_info(1)).unwrap();
        cp.register(pd_info(2)).unwrap();
        let now = Instant::now();
        cp.pds[1].link = Link::Offline { since: now };

        for _ in 0..3 {
            assert_eq!(cp.select(now), Some(0));
        }
        cp.pds[0].link = Link::Offline { since: now };
        assert_eq!(cp.select(now), None);
    }

    #[test]
    fn test_empty_control_panel_tick_is_noop() {
        let mut cp = ControlPanel::new(Box::new(NullChannel));
        cp.tick();
        assert_eq!(cp.pd_count(), 0);
        assert_eq!(cp.online_mask(), 0);
    }
}
