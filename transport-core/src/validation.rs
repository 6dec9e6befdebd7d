/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::address::Address;
use crate::error::InvalidFormatError;
use crate::identity::{PeerIdentity, PEER_IDENTITY_SIZE};
use crate::plugin::{Overlay, PluginEnvironment, PluginTable, SessionInfo};
use crate::tokenizer::frame_message;
use crate::util::buffer::Buffer;
use crate::util::ms_monotonic;

/// Message type of an address validation challenge.
pub const MESSAGE_TYPE_PING: u16 = 0x0010;

/// Message type of an address validation response.
pub const MESSAGE_TYPE_PONG: u16 = 0x0011;

/// Sentinel for "this address is never to be challenged again".
pub const BLOCK_FOREVER: i64 = i64::MAX;

const PURPOSE_PING: u8 = 1;
const PURPOSE_PONG: u8 = 2;

const CODEC_CAPACITY: usize = 1024;

/// Tunables of the validation subsystem. Defaults match production use.
#[derive(Clone, Copy)]
pub struct ValidationSettings {
    /// How long a successful PONG vouches for an address.
    pub validity_horizon_ms: i64,
    /// Minimum spacing between challenges to the same (peer, address).
    pub revalidation_delay_ms: i64,
    /// Entries untouched for this long are evicted by `service`.
    pub eviction_horizon_ms: i64,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            validity_horizon_ms: 12 * 3600 * 1000,
            revalidation_delay_ms: 5 * 60 * 1000,
            eviction_horizon_ms: 6 * 3600 * 1000,
        }
    }
}

/// State of one (peer, address) pair under validation.
struct ValidationEntry {
    nonce: u32,
    /// Absolute tick until which the address counts as validated; 0 = never.
    validated_until: i64,
    /// No new challenge is issued before this tick.
    block_until: i64,
    /// Tick the outstanding challenge left, 0 if none is outstanding.
    ping_sent_at: i64,
    /// Last observed round trip in milliseconds, -1 if never measured.
    latency_ms: i64,
    /// Last tick anything touched this entry; drives eviction.
    last_activity: i64,
    /// Set by the active-use hint; biases re-measurement.
    active: bool,
}

/// A PING on the wire: challenge nonce, the identity the sender believes it
/// is talking to, the address being validated, and a signature.
pub struct PingMessage {
    pub nonce: u32,
    pub target: PeerIdentity,
    pub address: Address,
    pub signature: Vec<u8>,
}

/// A PONG on the wire: the echoed nonce, the address the responder observed
/// the exchange on, and a signature by the responder.
pub struct PongMessage {
    pub nonce: u32,
    pub observed: Address,
    pub signature: Vec<u8>,
}

fn signed_payload(purpose: u8, nonce: u32, target: &PeerIdentity, address: &Address) -> Vec<u8> {
    let mut b: Buffer<CODEC_CAPACITY> = Buffer::new();
    let _ = b.append_u8(purpose);
    let _ = b.append_u32(nonce);
    let _ = b.append_bytes_fixed(target.as_bytes());
    let _ = address.marshal(&mut b);
    b.as_bytes().to_vec()
}

fn marshal_challenge(nonce: u32, target: &PeerIdentity, address: &Address, signature: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut b: Buffer<CODEC_CAPACITY> = Buffer::new();
    b.append_u32(nonce)?;
    b.append_bytes_fixed(target.as_bytes())?;
    address.marshal(&mut b)?;
    b.append_u16(signature.len() as u16)?;
    b.append_bytes(signature)?;
    Ok(b.as_bytes().to_vec())
}

fn unmarshal_challenge(payload: &[u8]) -> Result<(u32, PeerIdentity, Address, Vec<u8>), InvalidFormatError> {
    let b: Buffer<CODEC_CAPACITY> = Buffer::from_bytes(payload).map_err(|_| InvalidFormatError)?;
    let mut cursor = 0;
    let nonce = b.read_u32(&mut cursor).map_err(|_| InvalidFormatError)?;
    let target = PeerIdentity(*b.read_bytes_fixed::<PEER_IDENTITY_SIZE>(&mut cursor).map_err(|_| InvalidFormatError)?);
    let address = Address::unmarshal(&b, &mut cursor).map_err(|_| InvalidFormatError)?;
    let sig_len = b.read_u16(&mut cursor).map_err(|_| InvalidFormatError)? as usize;
    let signature = b.read_bytes(sig_len, &mut cursor).map_err(|_| InvalidFormatError)?.to_vec();
    Ok((nonce, target, address, signature))
}

impl PingMessage {
    pub fn to_payload(&self) -> std::io::Result<Vec<u8>> {
        marshal_challenge(self.nonce, &self.target, &self.address, self.signature.as_slice())
    }

    pub fn from_payload(payload: &[u8]) -> Result<PingMessage, InvalidFormatError> {
        let (nonce, target, address, signature) = unmarshal_challenge(payload)?;
        Ok(PingMessage { nonce, target, address, signature })
    }
}

impl PongMessage {
    pub fn to_payload(&self, responder: &PeerIdentity) -> std::io::Result<Vec<u8>> {
        marshal_challenge(self.nonce, responder, &self.observed, self.signature.as_slice())
    }

    pub fn from_payload(payload: &[u8]) -> Result<(PongMessage, PeerIdentity), InvalidFormatError> {
        let (nonce, responder, observed, signature) = unmarshal_challenge(payload)?;
        Ok((PongMessage { nonce, observed, signature }, responder))
    }
}

/// Read-only record of which addresses are currently vouched for per peer.
#[derive(Default)]
pub struct AddressBook {
    map: DashMap<PeerIdentity, Vec<(Address, i64)>>,
}

impl AddressBook {
    fn record(&self, peer: PeerIdentity, address: Address, valid_until: i64) {
        let mut list = self.map.entry(peer).or_default();
        if let Some(existing) = list.iter_mut().find(|(a, _)| *a == address) {
            existing.1 = existing.1.max(valid_until);
        } else {
            list.push((address, valid_until));
        }
    }

    fn expire(&self, now: i64) {
        self.map.retain(|_, list| {
            list.retain(|(_, until)| *until > now);
            !list.is_empty()
        });
    }

    /// Snapshot of a peer's currently valid addresses with their windows.
    pub fn addresses_of(&self, peer: &PeerIdentity) -> Vec<(Address, i64)> {
        self.map.get(peer).map(|l| l.value().clone()).unwrap_or_default()
    }

    /// Visit every (peer, address, valid-until) triple.
    pub fn for_each<F: FnMut(&PeerIdentity, &Address, i64)>(&self, mut f: F) {
        for entry in self.map.iter() {
            for (a, until) in entry.value().iter() {
                f(entry.key(), a, *until);
            }
        }
    }
}

/// The PING/PONG challenge-response engine binding plugin-reported addresses
/// back to peer identities, layered above any bearer via the plugin table.
pub struct AddressValidator<O: Overlay> {
    env: PluginEnvironment<O>,
    plugins: Arc<PluginTable>,
    settings: ValidationSettings,
    entries: Mutex<HashMap<(PeerIdentity, Address), ValidationEntry>>,
    book: AddressBook,
}

impl<O: Overlay> AddressValidator<O> {
    pub fn new(env: PluginEnvironment<O>, plugins: Arc<PluginTable>, settings: ValidationSettings) -> Self {
        Self {
            env,
            plugins,
            settings,
            entries: Mutex::new(HashMap::new()),
            book: AddressBook::default(),
        }
    }

    #[inline(always)]
    pub fn address_book(&self) -> &AddressBook {
        &self.book
    }

    /// True while the validity window of a prior PONG covers `now`.
    pub fn is_validated(&self, peer: &PeerIdentity, address: &Address, now: i64) -> bool {
        self.entries
            .lock()
            .get(&(*peer, address.clone()))
            .map_or(false, |e| e.validated_until > now)
    }

    /// Last observed round-trip latency in milliseconds, if any.
    pub fn latency(&self, peer: &PeerIdentity, address: &Address) -> Option<i64> {
        self.entries
            .lock()
            .get(&(*peer, address.clone()))
            .and_then(|e| if e.latency_ms >= 0 { Some(e.latency_ms) } else { None })
    }

    /// The overlay reports that an address is currently carrying traffic,
    /// which biases validation towards re-measuring its latency.
    pub fn mark_active(&self, peer: &PeerIdentity, address: &Address) {
        let now = ms_monotonic();
        let mut entries = self.entries.lock();
        if let Some(e) = entries.get_mut(&(*peer, address.clone())) {
            e.active = true;
            e.last_activity = now;
        }
    }

    /// Challenge an address claimed by or for `peer`.
    ///
    /// Rate controlled: while a challenge is outstanding or the backoff
    /// window is open nothing is sent. Addresses of bearers this node does
    /// not carry are blocked forever.
    pub fn start(&self, peer: &PeerIdentity, address: &Address) {
        let now = ms_monotonic();
        let key = (*peer, address.clone());
        let mut entries = self.entries.lock();
        let e = entries.entry(key).or_insert_with(|| ValidationEntry {
            nonce: 0,
            validated_until: 0,
            block_until: 0,
            ping_sent_at: 0,
            latency_ms: -1,
            last_activity: now,
            active: false,
        });
        e.last_activity = now;
        if e.block_until > now {
            return;
        }
        if !self.plugins.is_supported(address) {
            e.block_until = BLOCK_FOREVER;
            return;
        }
        e.nonce = loop {
            let n: u32 = rand::random();
            if n != 0 {
                break n;
            }
        };
        e.ping_sent_at = now;
        e.block_until = now + self.settings.revalidation_delay_ms;
        let ping = PingMessage {
            nonce: e.nonce,
            target: *peer,
            address: address.clone(),
            signature: self.env.signer.sign(signed_payload(PURPOSE_PING, e.nonce, peer, address).as_slice()),
        };
        drop(entries);

        if let Ok(payload) = ping.to_payload() {
            if let Some(plugin) = self.plugins.get_for_address(address) {
                if let Some(session) = plugin.get_session(peer, address) {
                    let framed = frame_message(MESSAGE_TYPE_PING, payload.as_slice());
                    let _ = plugin.send(&session, framed.as_slice(), now + self.settings.revalidation_delay_ms, None);
                    self.env.stats.update("# validation challenges sent", 1);
                }
            }
        }
    }

    /// Handle a PING delivered by any bearer; replies with a PONG over the
    /// session the challenge arrived on.
    pub fn handle_ping(&self, session: &Arc<dyn SessionInfo>, payload: &[u8]) {
        let ping = match PingMessage::from_payload(payload) {
            Ok(p) => p,
            Err(_) => {
                self.env.stats.update("# malformed validation messages", 1);
                return;
            }
        };
        if ping.target != self.env.my_identity {
            // Someone is validating an address that does not belong to us.
            self.env.stats.update("# validation challenges for other targets", 1);
            return;
        }
        let observed = session.address();
        let nonce = ping.nonce;
        let pong = PongMessage {
            nonce,
            observed: observed.clone(),
            signature: self
                .env
                .signer
                .sign(signed_payload(PURPOSE_PONG, nonce, &self.env.my_identity, &observed).as_slice()),
        };
        if let Ok(payload) = pong.to_payload(&self.env.my_identity) {
            if let Some(plugin) = self.plugins.get_for_address(&observed) {
                let framed = frame_message(MESSAGE_TYPE_PONG, payload.as_slice());
                let _ = plugin.send(session, framed.as_slice(), ms_monotonic() + self.settings.revalidation_delay_ms, None);
                self.env.stats.update("# validation responses sent", 1);
            }
        }
    }

    /// Handle a PONG; on nonce match and good signature the challenged
    /// address becomes validated and its latency is recorded.
    pub fn handle_pong(&self, sender: &PeerIdentity, payload: &[u8]) {
        let (pong, responder) = match PongMessage::from_payload(payload) {
            Ok(p) => p,
            Err(_) => {
                self.env.stats.update("# malformed validation messages", 1);
                return;
            }
        };
        if responder != *sender {
            self.env.stats.update("# validation responses with wrong responder", 1);
            return;
        }
        let now = ms_monotonic();
        let mut entries = self.entries.lock();
        let matched = entries.iter_mut().find(|((peer, _), e)| peer == sender && e.ping_sent_at != 0 && e.nonce == pong.nonce);
        if let Some(((_, address), e)) = matched {
            let signed = signed_payload(PURPOSE_PONG, pong.nonce, sender, &pong.observed);
            if !self.env.signer.verify(sender, signed.as_slice(), pong.signature.as_slice()) {
                self.env.stats.update("# validation responses with bad signature", 1);
                return;
            }
            e.validated_until = now + self.settings.validity_horizon_ms;
            e.latency_ms = now - e.ping_sent_at;
            e.ping_sent_at = 0;
            e.last_activity = now;
            let address = address.clone();
            let until = e.validated_until;
            drop(entries);
            debug!(peer = %sender.to_short_string(), address = %address, "address validated");
            self.book.record(*sender, address, until);
            self.env.stats.update("# addresses validated", 1);
        } else {
            self.env.stats.update("# validation responses with unknown nonce", 1);
        }
    }

    /// Periodic maintenance: evict stale entries, expire the address book,
    /// and refresh soon-to-expire addresses that are in active use.
    pub fn service(&self) {
        let now = ms_monotonic();
        let mut refresh = Vec::new();
        {
            let mut entries = self.entries.lock();
            entries.retain(|_, e| (now - e.last_activity) < self.settings.eviction_horizon_ms || e.block_until == BLOCK_FOREVER);
            for ((peer, address), e) in entries.iter_mut() {
                let expiring = e.validated_until != 0 && (e.validated_until - now) < (self.settings.validity_horizon_ms / 2);
                if e.active && expiring && e.block_until <= now && e.ping_sent_at == 0 {
                    e.active = false;
                    refresh.push((*peer, address.clone()));
                }
            }
        }
        self.book.expire(now);
        for (peer, address) in refresh {
            self.start(&peer, &address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{NetworkScope, OriginHint, XuAddress, PLUGIN_NAME_XU};
    use crate::plugin::{
        MemoryStatistics, Plugin, PrettyPrintSink, SendContinuation, SessionMonitor, SignatureProvider, StatisticsSink,
    };
    use std::any::Any;
    use std::str::FromStr;

    struct NullOverlay;

    impl Overlay for NullOverlay {
        fn receive(&self, _address: &Address, _session: &Arc<dyn SessionInfo>, _message_type: u16, _payload: &[u8]) -> i64 {
            0
        }
        fn session_start(&self, _address: &Address, _session: &Arc<dyn SessionInfo>, _scope: NetworkScope) {}
        fn session_end(&self, _address: &Address, _session: &Arc<dyn SessionInfo>) {}
        fn notify_address(&self, _added: bool, _address: &Address) {}
    }

    /// Toy signer: signature is the payload XORed with the low identity byte.
    struct XorSigner(PeerIdentity);

    impl SignatureProvider for XorSigner {
        fn sign(&self, data: &[u8]) -> Vec<u8> {
            data.iter().map(|b| b ^ self.0 .0[0]).collect()
        }
        fn verify(&self, signer: &PeerIdentity, data: &[u8], signature: &[u8]) -> bool {
            signature.len() == data.len() && data.iter().zip(signature).all(|(d, s)| (d ^ signer.0[0]) == *s)
        }
    }

    struct CaptureSession {
        peer: PeerIdentity,
        address: Address,
    }

    impl SessionInfo for CaptureSession {
        fn peer(&self) -> PeerIdentity {
            self.peer
        }
        fn address(&self) -> Address {
            self.address.clone()
        }
        fn scope(&self) -> NetworkScope {
            NetworkScope::Lan
        }
        fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    /// Test bearer that records every send instead of transmitting.
    struct CapturePlugin {
        peer: PeerIdentity,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl Plugin for CapturePlugin {
        type Session = CaptureSession;

        fn name(&self) -> &'static str {
            PLUGIN_NAME_XU
        }
        fn send(&self, _session: &Arc<CaptureSession>, payload: &[u8], _deadline: i64, cont: Option<SendContinuation>) -> isize {
            self.sent.lock().push(payload.to_vec());
            if let Some(cont) = cont {
                cont(&self.peer, crate::plugin::SendStatus::Ok, payload.len(), payload.len());
            }
            payload.len() as isize
        }
        fn get_session(&self, peer: &PeerIdentity, address: &Address) -> Option<Arc<CaptureSession>> {
            Some(Arc::new(CaptureSession { peer: *peer, address: address.clone() }))
        }
        fn disconnect_peer(&self, _peer: &PeerIdentity) {}
        fn disconnect_session(&self, _session: &Arc<CaptureSession>) {}
        fn check_address(&self, bytes: &[u8]) -> bool {
            XuAddress::from_bytes(bytes).is_some()
        }
        fn address_to_string(&self, bytes: &[u8]) -> Option<String> {
            XuAddress::from_bytes(bytes).map(|a| format!("{}.{}", PLUGIN_NAME_XU, a))
        }
        fn string_to_address(&self, s: &str) -> Result<Address, InvalidFormatError> {
            Address::from_str(s)
        }
        fn address_pretty_printer(&self, _bytes: &[u8], _numeric: bool, _deadline: i64, mut sink: PrettyPrintSink) {
            sink(None, crate::plugin::SendStatus::Ok);
        }
        fn get_network(&self, _session: &CaptureSession) -> NetworkScope {
            NetworkScope::Lan
        }
        fn get_network_for_address(&self, _address: &Address) -> NetworkScope {
            NetworkScope::Lan
        }
        fn update_session_timeout(&self, _session: &CaptureSession) {}
        fn setup_monitor(&self, _monitor: SessionMonitor) {}
    }

    fn identity(fill: u8) -> PeerIdentity {
        PeerIdentity([fill; PEER_IDENTITY_SIZE])
    }

    fn validator_pair() -> (Arc<AddressValidator<NullOverlay>>, Arc<AddressValidator<NullOverlay>>, Arc<CapturePlugin>, Arc<CapturePlugin>) {
        let (id_a, id_b) = (identity(0xaa), identity(0xbb));
        let plugin_a = Arc::new(CapturePlugin { peer: id_b, sent: Mutex::new(Vec::new()) });
        let plugin_b = Arc::new(CapturePlugin { peer: id_a, sent: Mutex::new(Vec::new()) });
        let mut table_a = PluginTable::new();
        table_a.register(plugin_a.clone());
        let mut table_b = PluginTable::new();
        table_b.register(plugin_b.clone());
        let mk_env = |id: PeerIdentity| PluginEnvironment {
            my_identity: id,
            overlay: Arc::new(NullOverlay),
            stats: Arc::new(MemoryStatistics::new()) as Arc<dyn StatisticsSink>,
            signer: Arc::new(XorSigner(id)),
        };
        let a = Arc::new(AddressValidator::new(mk_env(id_a), Arc::new(table_a), ValidationSettings::default()));
        let b = Arc::new(AddressValidator::new(mk_env(id_b), Arc::new(table_b), ValidationSettings::default()));
        (a, b, plugin_a, plugin_b)
    }

    fn strip_frame(framed: &[u8]) -> (u16, Vec<u8>) {
        (
            u16::from_be_bytes(framed[2..4].try_into().unwrap()),
            framed[crate::tokenizer::MESSAGE_HEADER_SIZE..].to_vec(),
        )
    }

    #[test]
    fn ping_payload_round_trip() {
        let ping = PingMessage {
            nonce: 0x01020304,
            target: identity(7),
            address: Address::from_str("xu.0.10.0.0.9:3333").unwrap(),
            signature: vec![1, 2, 3],
        };
        let back = PingMessage::from_payload(ping.to_payload().unwrap().as_slice()).unwrap();
        assert_eq!(back.nonce, ping.nonce);
        assert_eq!(back.target, ping.target);
        assert_eq!(back.address, ping.address);
        assert_eq!(back.signature, ping.signature);
        assert!(PingMessage::from_payload(&[1, 2, 3]).is_err());
    }

    #[test]
    fn challenge_response_validates_address() {
        let (a, b, plugin_a, plugin_b) = validator_pair();
        let (id_a, id_b) = (identity(0xaa), identity(0xbb));
        let addr_b = Address::from_str("xu.0.10.0.0.2:4000").unwrap();

        a.start(&id_b, &addr_b);
        let framed = plugin_a.sent.lock().pop().expect("challenge sent");
        let (msg_type, ping_payload) = strip_frame(framed.as_slice());
        assert_eq!(msg_type, MESSAGE_TYPE_PING);

        // B receives the PING on the session A appears on from B's side.
        let addr_a_as_seen_by_b = Address::from_str("xu.0.10.0.0.2:4000").unwrap().with_origin(OriginHint::Inbound);
        let session: Arc<dyn SessionInfo> =
            Arc::new(CaptureSession { peer: id_a, address: addr_a_as_seen_by_b });
        b.handle_ping(&session, ping_payload.as_slice());
        let framed = plugin_b.sent.lock().pop().expect("response sent");
        let (msg_type, pong_payload) = strip_frame(framed.as_slice());
        assert_eq!(msg_type, MESSAGE_TYPE_PONG);

        assert!(!a.is_validated(&id_b, &addr_b, ms_monotonic()));
        a.handle_pong(&id_b, pong_payload.as_slice());
        assert!(a.is_validated(&id_b, &addr_b, ms_monotonic()));
        assert!(a.latency(&id_b, &addr_b).is_some());
        assert_eq!(a.address_book().addresses_of(&id_b).len(), 1);
    }

    #[test]
    fn pong_with_wrong_nonce_ignored() {
        let (a, b, plugin_a, plugin_b) = validator_pair();
        let (id_a, id_b) = (identity(0xaa), identity(0xbb));
        let addr_b = Address::from_str("xu.0.10.0.0.2:4000").unwrap();

        a.start(&id_b, &addr_b);
        let framed = plugin_a.sent.lock().pop().unwrap();
        let (_, mut ping_payload) = strip_frame(framed.as_slice());
        // Corrupt the nonce before B ever sees it.
        ping_payload[0] ^= 0xff;
        let session: Arc<dyn SessionInfo> = Arc::new(CaptureSession { peer: id_a, address: addr_b.clone() });
        b.handle_ping(&session, ping_payload.as_slice());
        let framed = plugin_b.sent.lock().pop().unwrap();
        let (_, pong_payload) = strip_frame(framed.as_slice());
        a.handle_pong(&id_b, pong_payload.as_slice());
        assert!(!a.is_validated(&id_b, &addr_b, ms_monotonic()));
    }

    #[test]
    fn ping_for_other_target_unanswered() {
        let (_, b, _, plugin_b) = validator_pair();
        let id_a = identity(0xaa);
        let addr = Address::from_str("xu.0.10.0.0.2:4000").unwrap();
        let ping = PingMessage {
            nonce: 99,
            target: identity(0xcc), // not B
            address: addr.clone(),
            signature: Vec::new(),
        };
        let session: Arc<dyn SessionInfo> = Arc::new(CaptureSession { peer: id_a, address: addr });
        b.handle_ping(&session, ping.to_payload().unwrap().as_slice());
        assert!(plugin_b.sent.lock().is_empty());
    }

    #[test]
    fn revalidation_is_rate_controlled() {
        let (a, _, plugin_a, _) = validator_pair();
        let id_b = identity(0xbb);
        let addr_b = Address::from_str("xu.0.10.0.0.2:4000").unwrap();
        a.start(&id_b, &addr_b);
        a.start(&id_b, &addr_b);
        a.start(&id_b, &addr_b);
        assert_eq!(plugin_a.sent.lock().len(), 1);
    }

    #[test]
    fn unsupported_plugin_blocked_forever() {
        let (a, _, plugin_a, _) = validator_pair();
        let id_b = identity(0xbb);
        let addr = Address::new("carrier-pigeon", vec![1, 2, 3], OriginHint::None);
        a.start(&id_b, &addr);
        assert!(plugin_a.sent.lock().is_empty());
        // Even after service passes the entry stays blocked.
        a.service();
        a.start(&id_b, &addr);
        assert!(plugin_a.sent.lock().is_empty());
    }
}
