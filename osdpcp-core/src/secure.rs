//! OSDP secure channel
//!
//! A secure channel runs per PD and is established in two exchanges:
//! - CP sends osdp_CHLNG with RND.A, PD answers osdp_CCRYPT with its
//!   cUID, RND.B and the client cryptogram
//! - CP sends osdp_SCRYPT with the server cryptogram, PD answers
//!   osdp_RMAC_I with the initial reply MAC
//!
//! After that every frame carries a 4-byte MAC and data is AES-CBC encrypted.
//! MACs are chained: each side uses the last MAC it received as the IV for
//! the next frame it sends, and the complement of that MAC as the IV for
//! data encryption.

use std::fmt;

use bytes::{Bytes, BytesMut};
use subtle::ConstantTimeEq;
use tracing::{debug, trace};

use crate::{
    Command, Packet,
    constants::{MAC_LEN, SCBK_DEFAULT, cmd, reply, scs},
    crypto::Crypto,
    error::{FrameError, ScError},
    packet::SecurityBlock,
};

const BLOCK: usize = 16;

/// Key the handshake starts from
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ScKey {
    /// Per-PD secure channel base key
    Scbk([u8; 16]),
    /// CP master key; the SCBK is derived from the PD's cUID
    Master([u8; 16]),
    /// Well-known SCBK-D for PDs in install mode
    Default,
}

impl ScKey {
    /// SCB data byte announcing which key is in use
    fn scb_flag(&self) -> u8 {
        match self {
            Self::Default => 0x00,
            _ => 0x01,
        }
    }

    fn resolve(&self, crypto: &dyn Crypto, client_uid: &[u8; 8]) -> [u8; 16] {
        match self {
            Self::Scbk(key) => *key,
            Self::Master(master) => derive_scbk(crypto, master, client_uid),
            Self::Default => SCBK_DEFAULT,
        }
    }
}

impl fmt::Debug for ScKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scbk(_) => f.write_str("Scbk(<redacted>)"),
            Self::Master(_) => f.write_str("Master(<redacted>)"),
            Self::Default => f.write_str("Default"),
        }
    }
}

/// Derive a PD's SCBK from the CP master key and the PD's cUID
pub fn derive_scbk(crypto: &dyn Crypto, master_key: &[u8; 16], client_uid: &[u8; 8]) -> [u8; 16] {
    let mut block = [0u8; BLOCK];
    for (i, b) in client_uid.iter().enumerate() {
        block[i] = *b;
        block[i + 8] = !*b;
    }
    crypto.aes_encrypt(master_key, &mut block);
    block
}

/// Ephemeral session keys (S-ENC, S-MAC1, S-MAC2)
///
/// Zeroed when dropped.
pub struct SessionKeys {
    s_enc: [u8; 16],
    s_mac1: [u8; 16],
    s_mac2: [u8; 16],
}

impl SessionKeys {
    /// Derive session keys from the SCBK and the CP's challenge
    pub fn derive(crypto: &dyn Crypto, scbk: &[u8; 16], rnd_a: &[u8; 8]) -> Self {
        let derive_one = |kind: u8| {
            let mut block = [0u8; BLOCK];
            block[0] = 0x01;
            block[1] = kind;
            block[2..8].copy_from_slice(&rnd_a[..6]);
            crypto.aes_encrypt(scbk, &mut block);
            block
        };

        Self {
            s_enc: derive_one(0x82),
            s_mac1: derive_one(0x01),
            s_mac2: derive_one(0x02),
        }
    }

    /// Client cryptogram: AES(S-ENC, RND.A || RND.B)
    pub fn client_cryptogram(&self, crypto: &dyn Crypto, rnd_a: &[u8; 8], rnd_b: &[u8; 8]) -> [u8; 16] {
        self.cryptogram(crypto, rnd_a, rnd_b)
    }

    /// Server cryptogram: AES(S-ENC, RND.B || RND.A)
    pub fn server_cryptogram(&self, crypto: &dyn Crypto, rnd_a: &[u8; 8], rnd_b: &[u8; 8]) -> [u8; 16] {
        self.cryptogram(crypto, rnd_b, rnd_a)
    }

    fn cryptogram(&self, crypto: &dyn Crypto, first: &[u8; 8], second: &[u8; 8]) -> [u8; 16] {
        let mut block = [0u8; BLOCK];
        block[..8].copy_from_slice(first);
        block[8..].copy_from_slice(second);
        crypto.aes_encrypt(&self.s_enc, &mut block);
        block
    }

    /// Initial R-MAC: AES(S-MAC2, AES(S-MAC1, server cryptogram))
    pub fn initial_rmac(&self, crypto: &dyn Crypto, server_cryptogram: &[u8; 16]) -> [u8; 16] {
        let mut block = *server_cryptogram;
        crypto.aes_encrypt(&self.s_mac1, &mut block);
        crypto.aes_encrypt(&self.s_mac2, &mut block);
        block
    }

    /// CBC-MAC over `data`: S-MAC1 for all but the last block, S-MAC2 for
    /// the last. Data not on a block boundary is padded with 0x80 0x00...
    pub fn mac(&self, crypto: &dyn Crypto, iv: &[u8; 16], data: &[u8]) -> [u8; 16] {
        let mut padded = data.to_vec();
        if padded.is_empty() || padded.len() % BLOCK != 0 {
            padded.push(0x80);
            padded.resize(padded.len().div_ceil(BLOCK) * BLOCK, 0x00);
        }

        let mut chain = *iv;
        let last = padded.len() / BLOCK - 1;
        for (i, chunk) in padded.chunks_exact(BLOCK).enumerate() {
            for (c, b) in chain.iter_mut().zip(chunk) {
                *c ^= b;
            }
            let key = if i == last { &self.s_mac2 } else { &self.s_mac1 };
            crypto.aes_encrypt(key, &mut chain);
        }
        chain
    }

    /// AES-CBC encrypt with S-ENC, 0x80 padding always applied
    pub fn encrypt(&self, crypto: &dyn Crypto, iv: &[u8; 16], payload: &[u8]) -> Bytes {
        let mut out = payload.to_vec();
        out.push(0x80);
        out.resize(out.len().div_ceil(BLOCK) * BLOCK, 0x00);

        let mut chain = *iv;
        for chunk in out.chunks_exact_mut(BLOCK) {
            for (c, b) in chain.iter_mut().zip(chunk.iter()) {
                *c ^= b;
            }
            crypto.aes_encrypt(&self.s_enc, &mut chain);
            chunk.copy_from_slice(&chain);
        }
        Bytes::from(out)
    }

    /// AES-CBC decrypt with S-ENC and strip the padding
    ///
    /// # Errors
    ///
    /// Returns [`ScError::BadPadding`] if the ciphertext is not a whole
    /// number of blocks or the padding marker is missing.
    pub fn decrypt(&self, crypto: &dyn Crypto, iv: &[u8; 16], payload: &[u8]) -> Result<Bytes, ScError> {
        if payload.is_empty() || payload.len() % BLOCK != 0 {
            return Err(ScError::BadPadding);
        }

        let mut out = Vec::with_capacity(payload.len());
        let mut chain = *iv;
        for chunk in payload.chunks_exact(BLOCK) {
            let mut block = [0u8; BLOCK];
            block.copy_from_slice(chunk);
            crypto.aes_decrypt(&self.s_enc, &mut block);
            for (b, c) in block.iter_mut().zip(chain.iter()) {
                *b ^= c;
            }
            out.extend_from_slice(&block);
            chain.copy_from_slice(chunk);
        }

        let end = out
            .iter()
            .rposition(|&b| b != 0x00)
            .filter(|&pos| out[pos] == 0x80)
            .ok_or(ScError::BadPadding)?;
        out.truncate(end);
        Ok(Bytes::from(out))
    }
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.s_enc.fill(0);
        self.s_mac1.fill(0);
        self.s_mac2.fill(0);
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKeys(<redacted>)")
    }
}

/// Which end of the link this channel runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    ControlPanel,
    PeripheralDevice,
}

#[derive(Debug)]
enum ScState {
    Idle,
    /// CP: osdp_CHLNG sent
    ChallengeSent { key: ScKey, rnd_a: [u8; 8] },
    /// CP: osdp_SCRYPT sent. PD: osdp_CCRYPT sent.
    CryptogramSent {
        keys: SessionKeys,
        rnd_a: [u8; 8],
        rnd_b: [u8; 8],
        scb_flag: u8,
    },
    Active { keys: SessionKeys },
}

/// Per-PD secure channel context
#[derive(Debug)]
pub struct SecureChannel {
    role: Role,
    state: ScState,
    /// Last full MAC this side sent
    tx_mac: [u8; 16],
    /// Last full MAC this side received
    rx_mac: [u8; 16],
}

impl SecureChannel {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: ScState::Idle,
            tx_mac: [0; 16],
            rx_mac: [0; 16],
        }
    }

    /// Check if the session is established
    pub fn is_active(&self) -> bool {
        matches!(self.state, ScState::Active { .. })
    }

    /// Check if a handshake is under way
    pub fn is_handshaking(&self) -> bool {
        matches!(
            self.state,
            ScState::ChallengeSent { .. } | ScState::CryptogramSent { .. }
        )
    }

    /// Drop the session and wipe its keys
    pub fn reset(&mut self) {
        if !matches!(self.state, ScState::Idle) {
            debug!(role = ?self.role, "Secure channel reset");
        }
        self.state = ScState::Idle;
        self.tx_mac = [0; 16];
        self.rx_mac = [0; 16];
    }

    /// CP: start a handshake, returning the osdp_CHLNG command
    pub fn begin(&mut self, crypto: &mut dyn Crypto, key: ScKey) -> Command {
        self.reset();

        let mut rnd_a = [0u8; 8];
        crypto.random_bytes(&mut rnd_a);

        self.state = ScState::ChallengeSent { key, rnd_a };
        Command::ChallengeSetup { rnd_a }
    }

    /// Security block for an outgoing handshake command
    pub fn handshake_block(&self, id: u8) -> SecurityBlock {
        let flag = match &self.state {
            ScState::ChallengeSent { key, .. } => key.scb_flag(),
            ScState::CryptogramSent { scb_flag, .. } => *scb_flag,
            _ => 0x01,
        };
        let kind = match (self.role, id) {
            (Role::ControlPanel, cmd::CHLNG) => scs::SCS_11,
            (Role::ControlPanel, _) => scs::SCS_13,
            (Role::PeripheralDevice, reply::CCRYPT) => scs::SCS_12,
            (Role::PeripheralDevice, _) => scs::SCS_14,
        };
        SecurityBlock::new(kind, vec![flag])
    }

    /// CP: verify osdp_CCRYPT and return the server cryptogram for osdp_SCRYPT
    ///
    /// # Errors
    ///
    /// [`ScError::AuthFailed`] if the client cryptogram does not verify,
    /// [`ScError::InvalidState`] if no challenge is outstanding.
    pub fn on_client_cryptogram(
        &mut self,
        crypto: &dyn Crypto,
        client_uid: &[u8; 8],
        rnd_b: &[u8; 8],
        cryptogram: &[u8; 16],
    ) -> Result<[u8; 16], ScError> {
        let ScState::ChallengeSent { key, rnd_a } = &self.state else {
            return Err(ScError::InvalidState("osdp_CCRYPT without a challenge"));
        };
        let (key, rnd_a) = (*key, *rnd_a);

        let scbk = key.resolve(crypto, client_uid);
        let keys = SessionKeys::derive(crypto, &scbk, &rnd_a);

        let expected = keys.client_cryptogram(crypto, &rnd_a, rnd_b);
        if !bool::from(expected[..].ct_eq(&cryptogram[..])) {
            self.reset();
            return Err(ScError::AuthFailed("client cryptogram mismatch"));
        }

        let server = keys.server_cryptogram(crypto, &rnd_a, rnd_b);
        trace!(client_uid = %hex::encode(client_uid), "Client cryptogram verified");

        self.state = ScState::CryptogramSent {
            keys,
            rnd_a,
            rnd_b: *rnd_b,
            scb_flag: key.scb_flag(),
        };
        Ok(server)
    }

    /// CP: verify osdp_RMAC_I and activate the session
    ///
    /// # Errors
    ///
    /// [`ScError::AuthFailed`] if the initial R-MAC does not verify.
    pub fn on_initial_rmac(&mut self, crypto: &dyn Crypto, rmac: &[u8; 16]) -> Result<(), ScError> {
        let state = std::mem::replace(&mut self.state, ScState::Idle);
        let ScState::CryptogramSent {
            keys, rnd_a, rnd_b, ..
        } = state
        else {
            return Err(ScError::InvalidState("osdp_RMAC_I without a server cryptogram"));
        };

        let server = keys.server_cryptogram(crypto, &rnd_a, &rnd_b);
        let expected = keys.initial_rmac(crypto, &server);
        if !bool::from(expected[..].ct_eq(&rmac[..])) {
            self.reset();
            return Err(ScError::AuthFailed("initial R-MAC mismatch"));
        }

        self.rx_mac = *rmac;
        self.tx_mac = [0; 16];
        self.state = ScState::Active { keys };
        debug!("Secure channel active");
        Ok(())
    }

    /// PD: answer osdp_CHLNG, returning the client cryptogram data
    pub fn respond_challenge(
        &mut self,
        crypto: &mut dyn Crypto,
        scbk: &[u8; 16],
        client_uid: &[u8; 8],
        rnd_a: &[u8; 8],
        scb_flag: u8,
    ) -> ([u8; 8], [u8; 16]) {
        self.reset();

        let mut rnd_b = [0u8; 8];
        crypto.random_bytes(&mut rnd_b);
        let keys = SessionKeys::derive(crypto, scbk, rnd_a);
        let cryptogram = keys.client_cryptogram(crypto, rnd_a, &rnd_b);

        self.state = ScState::CryptogramSent {
            keys,
            rnd_a: *rnd_a,
            rnd_b,
            scb_flag,
        };
        (rnd_b, cryptogram)
    }

    /// PD: verify osdp_SCRYPT, activate the session and return R-MAC_I
    ///
    /// # Errors
    ///
    /// [`ScError::AuthFailed`] if the server cryptogram does not verify.
    pub fn on_server_cryptogram(
        &mut self,
        crypto: &dyn Crypto,
        cryptogram: &[u8; 16],
    ) -> Result<[u8; 16], ScError> {
        let state = std::mem::replace(&mut self.state, ScState::Idle);
        let ScState::CryptogramSent {
            keys, rnd_a, rnd_b, ..
        } = state
        else {
            return Err(ScError::InvalidState("osdp_SCRYPT without a challenge"));
        };

        let expected = keys.server_cryptogram(crypto, &rnd_a, &rnd_b);
        if !bool::from(expected[..].ct_eq(&cryptogram[..])) {
            self.reset();
            return Err(ScError::AuthFailed("server cryptogram mismatch"));
        }

        let rmac = keys.initial_rmac(crypto, cryptogram);
        self.tx_mac = rmac;
        self.rx_mac = [0; 16];
        self.state = ScState::Active { keys };
        Ok(rmac)
    }

    /// Encode an outgoing packet, securing it when the session is active
    ///
    /// Handshake packets (which already carry their SCB) and packets sent
    /// before the session is up are encoded as they are.
    pub fn seal(&mut self, crypto: &dyn Crypto, mut packet: Packet) -> Result<BytesMut, FrameError> {
        let ScState::Active { keys } = &self.state else {
            return packet.encode();
        };
        if packet.security.is_some() {
            return packet.encode();
        }

        let with_data = !packet.data.is_empty();
        let kind = match (self.role, with_data) {
            (Role::ControlPanel, false) => scs::SCS_15,
            (Role::ControlPanel, true) => scs::SCS_17,
            (Role::PeripheralDevice, false) => scs::SCS_16,
            (Role::PeripheralDevice, true) => scs::SCS_18,
        };

        if with_data {
            packet.data = keys.encrypt(crypto, &complement(&self.rx_mac), &packet.data);
        }
        packet.security = Some(SecurityBlock::new(kind, Bytes::new()));

        let iv = self.rx_mac;
        let mut full_mac = [0u8; 16];
        let encoded = packet.encode_with_mac(|input| {
            full_mac = keys.mac(crypto, &iv, input);
            truncate_mac(&full_mac)
        })?;
        self.tx_mac = full_mac;

        Ok(encoded)
    }

    /// Verify and decrypt an incoming packet
    ///
    /// # Errors
    ///
    /// [`ScError::AuthFailed`] when the MAC does not verify or an unsecured
    /// packet arrives inside an active session; [`ScError::BadPadding`] when
    /// the data does not decrypt cleanly.
    pub fn open(&mut self, crypto: &dyn Crypto, mut packet: Packet) -> Result<Packet, ScError> {
        let is_handshake = packet
            .security
            .as_ref()
            .is_some_and(|b| (scs::SCS_11..=scs::SCS_14).contains(&b.kind));

        let ScState::Active { keys } = &self.state else {
            if packet.is_secure() {
                return Err(ScError::InvalidState("secure packet without a session"));
            }
            return Ok(packet);
        };

        if is_handshake {
            return Ok(packet);
        }
        if !packet.is_secure() {
            return Err(ScError::AuthFailed("unsecured packet inside a session"));
        }

        let expected = keys.mac(crypto, &self.tx_mac, packet.mac_input());
        let received = packet.mac.unwrap_or_default();
        if !bool::from(truncate_mac(&expected)[..].ct_eq(&received[..])) {
            return Err(ScError::AuthFailed("MAC mismatch"));
        }

        if packet.security.as_ref().is_some_and(SecurityBlock::has_encrypted_data) {
            packet.data = keys.decrypt(crypto, &complement(&self.tx_mac), &packet.data)?;
        }
        self.rx_mac = expected;

        Ok(packet)
    }
}

fn complement(mac: &[u8; 16]) -> [u8; 16] {
    let mut iv = *mac;
    for b in iv.iter_mut() {
        *b = !*b;
    }
    iv
}

fn truncate_mac(mac: &[u8; 16]) -> [u8; MAC_LEN] {
    let mut short = [0u8; MAC_LEN];
    short.copy_from_slice(&mac[..MAC_LEN]);
    short
}
