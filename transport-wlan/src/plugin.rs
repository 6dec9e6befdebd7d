/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::str::FromStr;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use transport_core::address::{Address, MacAddress, NetworkScope, OriginHint, WlanAddress, PLUGIN_NAME_WLAN, WLAN_ADDRESS_SIZE};
use transport_core::error::InvalidFormatError;
use transport_core::identity::{PeerIdentity, PEER_IDENTITY_SIZE};
use transport_core::plugin::{
    Overlay, Plugin, PluginEnvironment, PrettyPrintSink, SendContinuation, SendStatus, SessionInfo, SessionMonitor,
    SessionState, MAX_MESSAGE_SIZE,
};
use transport_core::tokenizer::StreamTokenizer;
use transport_core::util::throttle::Throttle;
use transport_core::util::{duration_from_ticks, ms_monotonic};

use crate::fragment::FragmentEngine;
use crate::link::WlanLink;
use crate::protocol::{
    build_ack, frame_type, parse_ack, parse_data_frame, parse_fragment, WLAN_HEADER_SIZE, MESSAGE_TYPE_WLAN_ACK,
    MESSAGE_TYPE_WLAN_DATA, MESSAGE_TYPE_WLAN_FRAGMENT,
};
use crate::reassembly::ReassemblyBuffer;
use crate::session::{PendingMessage, WlanSession};

/// How often the reassembly buffer sheds stale partial messages.
const REASSEMBLY_SWEEP_INTERVAL: i64 = 5000;

/// The 802.11 bearer.
///
/// Messages that fit the link MTU go out whole; larger ones pass through
/// the fragmentation engine with selective ACK. The radio itself sits
/// behind the [`WlanLink`] seam; inbound frames enter through
/// [`WlanPlugin::handle_link_frame`].
pub struct WlanPlugin<O: Overlay> {
    me: Weak<WlanPlugin<O>>,
    env: PluginEnvironment<O>,
    link: Arc<dyn WlanLink>,
    engine: FragmentEngine,
    reassembly: ReassemblyBuffer,
    sessions: DashMap<PeerIdentity, Vec<Arc<WlanSession>>>,
    monitors: Mutex<Vec<SessionMonitor>>,
    /// Wakes the driver whenever the engine gains work.
    kick: Arc<tokio::sync::Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    reassembly_sweep: Throttle,
}

impl<O: Overlay> WlanPlugin<O> {
    pub fn new(env: PluginEnvironment<O>, link: Arc<dyn WlanLink>) -> Arc<Self> {
        let kick = Arc::new(tokio::sync::Notify::new());
        let stats = env.stats.clone();
        let plugin = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            env,
            link,
            engine: FragmentEngine::new(stats),
            reassembly: ReassemblyBuffer::new(),
            sessions: DashMap::new(),
            monitors: Mutex::new(Vec::new()),
            kick: kick.clone(),
            tasks: Mutex::new(Vec::new()),
            reassembly_sweep: Throttle::new(REASSEMBLY_SWEEP_INTERVAL),
        });
        plugin
            .tasks
            .lock()
            .push(tokio::spawn(Self::driver(Arc::downgrade(&plugin), kick)));
        debug!(mac = %plugin.link.local_mac(), "wlan bearer up");
        plugin
    }

    /// This station's own bearer address.
    pub fn local_address(&self) -> Address {
        WlanAddress::new(self.link.local_mac()).to_address(OriginHint::None)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.iter().map(|e| e.value().len()).sum()
    }

    /// Graceful teardown mirroring the datagram bearer's.
    pub fn shutdown(&self) {
        let mut all = Vec::new();
        for entry in self.sessions.iter() {
            all.extend(entry.value().iter().cloned());
        }
        for session in all {
            self.disconnect_session_inner(&session);
        }
        for t in self.tasks.lock().drain(..) {
            t.abort();
        }
    }

    /// The engine's clock: sleeps until its next deadline or until kicked,
    /// then pumps. All retransmission pacing happens here.
    async fn driver(plugin: Weak<Self>, kick: Arc<tokio::sync::Notify>) {
        loop {
            let wake_at = match plugin.upgrade() {
                Some(p) => p.engine.next_event_at(),
                None => return,
            };
            match wake_at {
                None => kick.notified().await,
                Some(t) => {
                    let now = ms_monotonic();
                    if t > now {
                        tokio::select! {
                            _ = kick.notified() => {}
                            _ = tokio::time::sleep(duration_from_ticks(t - now)) => {}
                        }
                    }
                }
            }
            match plugin.upgrade() {
                Some(p) => p.pump_now(),
                None => return,
            }
        }
    }

    fn pump_now(&self) {
        let now = ms_monotonic();
        self.engine.pump(now, &*self.link);
        if self.reassembly_sweep.admit(now) {
            self.reassembly.service(now);
        }
    }

    /// Entry point for every frame the radio hands us.
    pub fn handle_link_frame(&self, source: &MacAddress, frame: &[u8]) {
        self.env.stats.update("# WLAN bytes received", frame.len() as i64);
        match frame_type(frame) {
            Some(MESSAGE_TYPE_WLAN_DATA) => self.handle_data_frame(source, frame),
            Some(MESSAGE_TYPE_WLAN_FRAGMENT) => self.handle_fragment(source, frame),
            Some(MESSAGE_TYPE_WLAN_ACK) => self.handle_ack_frame(frame),
            _ => {
                self.env.stats.update("# WLAN frames dropped (malformed)", 1);
            }
        }
    }

    fn handle_fragment(&self, source: &MacAddress, frame: &[u8]) {
        let fragment = match parse_fragment(frame) {
            Some(f) => f,
            None => {
                // Bad length or failed CRC-16; silence per the error policy.
                self.env.stats.update("# WLAN frames dropped (malformed)", 1);
                return;
            }
        };
        // Every valid fragment is acknowledged, duplicates included, so a
        // retransmission whose first ACK was lost gets re-ACKed.
        let _ = self.link.transmit(source, build_ack(fragment.message_id, fragment.fragment_index).as_slice());
        self.env.stats.update("# WLAN acks sent", 1);

        let now = ms_monotonic();
        if let Some(assembled) =
            self.reassembly
                .add_fragment(*source, fragment.message_id, fragment.fragment_index, fragment.slice, now)
        {
            self.env.stats.update("# WLAN messages reassembled", 1);
            self.handle_data_frame(source, assembled.as_slice());
        }
    }

    fn handle_ack_frame(&self, frame: &[u8]) {
        let (message_id, fragment_index) = match parse_ack(frame) {
            Some(a) => a,
            None => {
                self.env.stats.update("# WLAN frames dropped (malformed)", 1);
                return;
            }
        };
        if self.engine.handle_ack(message_id, fragment_index, ms_monotonic()) {
            // A slot freed; admission may have work.
            self.kick.notify_one();
        }
    }

    fn handle_data_frame(&self, source: &MacAddress, frame: &[u8]) {
        let data = match parse_data_frame(frame) {
            Some(d) => d,
            None => {
                self.env.stats.update("# WLAN frames dropped (malformed)", 1);
                return;
            }
        };
        if data.target != self.env.my_identity {
            // The medium is shared; frames for other stations pass by.
            self.env.stats.update("# WLAN frames for other targets", 1);
            return;
        }

        let now = ms_monotonic();
        let session = match self.find_or_create_inbound(data.sender, source, now) {
            Some(session) => session,
            None => return,
        };
        if session.is_tombstoned() {
            // The session_start upcall tore it right back down.
            return;
        }
        session.record_activity(now);

        let address = session.address();
        let dyn_session: Arc<dyn SessionInfo> = session.clone();
        // One data frame carries whole framed messages only, so a throwaway
        // tokenizer per frame is enough; leftovers mean truncation.
        let mut tokenizer = StreamTokenizer::new();
        let framing = tokenizer.push(data.payload, |msg_type, payload| {
            self.env.stats.update("# WLAN messages received", 1);
            let _ = self.env.overlay.receive(&address, &dyn_session, msg_type, payload);
        });
        if framing.is_err() || tokenizer.pending() != 0 {
            self.env.stats.update("# WLAN frames dropped (malformed)", 1);
        }
    }

    fn find_or_create_inbound(&self, peer: PeerIdentity, source: &MacAddress, now: i64) -> Option<Arc<WlanSession>> {
        if source.is_multicast() || source.is_broadcast() {
            return None;
        }
        if let Some(list) = self.sessions.get(&peer) {
            if let Some(existing) = list.iter().find(|s| s.mac() == source) {
                return Some(existing.clone());
            }
        }

        let address = WlanAddress::new(*source).to_address(OriginHint::Inbound);
        let session = Arc::new(WlanSession::new(peer, address.clone(), *source, now));
        let raced = {
            let mut entry = self.sessions.entry(peer).or_default();
            if let Some(existing) = entry.iter().find(|s| s.mac() == source) {
                Some(existing.clone())
            } else {
                entry.push(session.clone());
                None
            }
        };
        if let Some(existing) = raced {
            return Some(existing);
        }

        self.spawn_timeout_task(&session);
        self.env.stats.update("# WLAN sessions active", 1);
        self.emit_monitor_event(&session, SessionState::Init);
        self.emit_monitor_event(&session, SessionState::Up);
        let dyn_session: Arc<dyn SessionInfo> = session.clone();
        self.env.overlay.session_start(&address, &dyn_session, session.scope());
        Some(session)
    }

    fn spawn_timeout_task(&self, session: &Arc<WlanSession>) {
        let plugin = self.me.clone();
        let session_for_task = session.clone();
        let handle = tokio::spawn(async move {
            loop {
                let now = ms_monotonic();
                let deadline = session_for_task.deadline();
                if now < deadline {
                    tokio::time::sleep(duration_from_ticks(deadline - now)).await;
                } else {
                    break;
                }
            }
            if let Some(plugin) = plugin.upgrade() {
                plugin.expire_session(&session_for_task);
            }
        });
        *session.timeout_task.lock() = Some(handle);
    }

    fn expire_session(&self, session: &Arc<WlanSession>) {
        if !session.tombstone() {
            return;
        }
        debug!(peer = %session.peer().to_short_string(), "wlan session idle timeout");
        self.env.stats.update("# WLAN sessions timed out", 1);
        self.teardown_session(session);
    }

    /// Continuations first, then the `session_end` upcall: the engine drop
    /// flushes any pending continuation with `SysErr` before the overlay
    /// hears the session is gone.
    fn teardown_session(&self, session: &Arc<WlanSession>) {
        self.engine.drop_session(session);
        let peer = session.peer();
        if let Some(mut list) = self.sessions.get_mut(&peer) {
            list.retain(|s| !Arc::ptr_eq(s, session));
            let empty = list.is_empty();
            drop(list);
            if empty {
                self.sessions.remove_if(&peer, |_, l| l.is_empty());
            }
        }
        self.emit_monitor_event(session, SessionState::Done);
        let address = session.address();
        let dyn_session: Arc<dyn SessionInfo> = session.clone();
        self.env.overlay.session_end(&address, &dyn_session);
        self.env.stats.update("# WLAN sessions active", -1);
        self.kick.notify_one();
    }

    fn disconnect_session_inner(&self, session: &Arc<WlanSession>) {
        if !session.tombstone() {
            return;
        }
        session.abort_timeout_task();
        self.teardown_session(session);
    }

    fn emit_monitor_event(&self, session: &Arc<WlanSession>, state: SessionState) {
        let monitors = self.monitors.lock().clone();
        if monitors.is_empty() {
            return;
        }
        let peer = session.peer();
        let address = session.address();
        for m in monitors.iter() {
            m(Some((&peer, &address, state)));
        }
    }

    fn fail_send(cont: Option<SendContinuation>, peer: &PeerIdentity, payload_len: usize) -> isize {
        if let Some(cont) = cont {
            cont(peer, SendStatus::SysErr, payload_len, 0);
        }
        -1
    }
}

impl<O: Overlay> Plugin for WlanPlugin<O> {
    type Session = WlanSession;

    fn name(&self) -> &'static str {
        PLUGIN_NAME_WLAN
    }

    fn send(&self, session: &Arc<WlanSession>, payload: &[u8], deadline: i64, cont: Option<SendContinuation>) -> isize {
        let peer = session.peer();
        if payload.is_empty() || payload.len() >= MAX_MESSAGE_SIZE {
            return Self::fail_send(cont, &peer, payload.len());
        }
        if WLAN_HEADER_SIZE + PEER_IDENTITY_SIZE + payload.len() > u16::MAX as usize {
            return Self::fail_send(cont, &peer, payload.len());
        }
        if session.is_tombstoned() {
            return Self::fail_send(cont, &peer, payload.len());
        }

        let frame = crate::protocol::build_data_frame(&self.env.my_identity, &peer, payload);
        let estimate = frame.len() + crate::protocol::LINK_OVERHEAD;
        let message = PendingMessage { frame, payload_len: payload.len(), deadline, cont };
        match self.engine.submit(session, message) {
            Ok(()) => {
                self.kick.notify_one();
                estimate as isize
            }
            Err(mut message) => {
                // The session already has a message waiting its turn.
                self.env.stats.update("# WLAN sends refused (session busy)", 1);
                let cont = message.cont.take();
                Self::fail_send(cont, &peer, message.payload_len)
            }
        }
    }

    fn get_session(&self, peer: &PeerIdentity, address: &Address) -> Option<Arc<WlanSession>> {
        if address.plugin() != PLUGIN_NAME_WLAN {
            return None;
        }
        let mac = MacAddress::from_bytes(address.bytes())?;
        if mac.is_multicast() || mac.is_broadcast() {
            return None;
        }

        if let Some(list) = self.sessions.get(peer) {
            if let Some(existing) = list.iter().find(|s| s.mac() == &mac) {
                return Some(existing.clone());
            }
        }

        let session = Arc::new(WlanSession::new(*peer, address.clone(), mac, ms_monotonic()));
        let raced = {
            let mut entry = self.sessions.entry(*peer).or_default();
            if let Some(existing) = entry.iter().find(|s| s.mac() == &mac) {
                Some(existing.clone())
            } else {
                entry.push(session.clone());
                None
            }
        };
        if let Some(existing) = raced {
            return Some(existing);
        }

        self.spawn_timeout_task(&session);
        self.env.stats.update("# WLAN sessions active", 1);
        self.emit_monitor_event(&session, SessionState::Init);
        self.emit_monitor_event(&session, SessionState::Up);
        Some(session)
    }

    fn disconnect_peer(&self, peer: &PeerIdentity) {
        let all = self.sessions.get(peer).map(|l| l.value().clone()).unwrap_or_default();
        for session in all {
            self.disconnect_session_inner(&session);
        }
    }

    fn disconnect_session(&self, session: &Arc<WlanSession>) {
        self.disconnect_session_inner(session);
    }

    fn check_address(&self, bytes: &[u8]) -> bool {
        match MacAddress::from_bytes(bytes) {
            // Group addresses are not a station we could be.
            Some(mac) => !mac.is_multicast() && !mac.is_broadcast() && mac == self.link.local_mac(),
            None => false,
        }
    }

    fn address_to_string(&self, bytes: &[u8]) -> Option<String> {
        if bytes.len() != WLAN_ADDRESS_SIZE {
            return None;
        }
        MacAddress::from_bytes(bytes).map(|mac| format!("{}.0.{}", PLUGIN_NAME_WLAN, mac))
    }

    fn string_to_address(&self, s: &str) -> Result<Address, InvalidFormatError> {
        let address = Address::from_str(s)?;
        if address.plugin() == PLUGIN_NAME_WLAN {
            Ok(address)
        } else {
            Err(InvalidFormatError)
        }
    }

    fn address_pretty_printer(&self, bytes: &[u8], _numeric: bool, _deadline: i64, mut sink: PrettyPrintSink) {
        // MACs have no DNS story; numeric and resolved forms coincide.
        match self.address_to_string(bytes) {
            Some(s) => {
                sink(Some(s.as_str()), SendStatus::Ok);
                sink(None, SendStatus::Ok);
            }
            None => sink(None, SendStatus::SysErr),
        }
    }

    fn get_network(&self, session: &WlanSession) -> NetworkScope {
        session.scope()
    }

    fn get_network_for_address(&self, address: &Address) -> NetworkScope {
        if address.plugin() == PLUGIN_NAME_WLAN && address.bytes().len() == WLAN_ADDRESS_SIZE {
            NetworkScope::Lan
        } else {
            NetworkScope::Unspecified
        }
    }

    fn update_session_timeout(&self, session: &WlanSession) {
        session.record_activity(ms_monotonic());
    }

    fn setup_monitor(&self, monitor: SessionMonitor) {
        let mut snapshot = Vec::new();
        for entry in self.sessions.iter() {
            snapshot.extend(entry.value().iter().cloned());
        }
        for session in snapshot.iter() {
            let peer = session.peer();
            let address = session.address();
            monitor(Some((&peer, &address, SessionState::Init)));
            monitor(Some((&peer, &address, SessionState::Up)));
        }
        monitor(None);
        self.monitors.lock().push(monitor);
    }
}

impl<O: Overlay> Drop for WlanPlugin<O> {
    fn drop(&mut self) {
        for t in self.tasks.lock().drain(..) {
            t.abort();
        }
    }
}
