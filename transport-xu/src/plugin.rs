/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use transport_core::address::{Address, NetworkScope, OriginHint, XuAddress, PLUGIN_NAME_XU};
use transport_core::error::{InvalidFormatError, InvalidParameterError};
use transport_core::identity::PeerIdentity;
use transport_core::plugin::{
    Overlay, Plugin, PluginEnvironment, PrettyPrintSink, Resolver, SendContinuation, SendStatus, SessionInfo,
    SessionMonitor, SessionState, MAX_MESSAGE_SIZE,
};
use transport_core::tokenizer::StreamTokenizer;
use transport_core::util::throttle::Throttle;
use transport_core::util::{duration_from_ticks, ms_monotonic};

use crate::nat::{NatEvent, NatMapper};
use crate::protocol::{build_datagram, classify, Classified, DATAGRAM_SIZE_MAX, UDP_IPV4_OVERHEAD, UDP_IPV6_OVERHEAD};
use crate::session::XuSession;
use crate::settings::XuSettings;
use crate::sys::udp::{bind_sockets, BoundSockets};

/// Minimum spacing of "network unreachable" warnings in the log.
const UNREACHABLE_WARN_INTERVAL: i64 = 5000;

/// The datagram bearer.
///
/// One instance owns one IPv4 and optionally one IPv6 socket, a sessions
/// multimap keyed by peer identity, and the background tasks servicing
/// them. Everything the overlay is allowed to do to it goes through the
/// [`Plugin`] capability set.
pub struct XuPlugin<O: Overlay> {
    me: Weak<XuPlugin<O>>,
    env: PluginEnvironment<O>,
    settings: XuSettings,
    sockets: BoundSockets,
    nat: Arc<dyn NatMapper>,
    resolver: Option<Arc<dyn Resolver>>,
    /// Multimap: several sessions per peer, distinguished by remote address.
    sessions: DashMap<PeerIdentity, Vec<Arc<XuSession>>>,
    monitors: Mutex<Vec<SessionMonitor>>,
    /// Read loops, the NAT event pump, and in-flight pretty printer tasks.
    /// All are aborted when the plugin goes away.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    unreachable_warning: Throttle,
}

impl<O: Overlay> XuPlugin<O> {
    /// Bind sockets, register with the NAT mapper, and start the read
    /// loops. A configuration or bind failure means there is no bearer.
    pub fn new(
        env: PluginEnvironment<O>,
        settings: XuSettings,
        nat: Arc<dyn NatMapper>,
        resolver: Option<Arc<dyn Resolver>>,
    ) -> Result<Arc<Self>, InvalidParameterError> {
        settings.validate()?;
        let sockets = bind_sockets(&settings).map_err(|e| {
            warn!(error = %e, "datagram bearer init failed");
            InvalidParameterError("unable to bind datagram sockets")
        })?;

        let plugin = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            env,
            settings,
            sockets,
            nat,
            resolver,
            sessions: DashMap::new(),
            monitors: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            unreachable_warning: Throttle::new(UNREACHABLE_WARN_INTERVAL),
        });

        let nat_events = plugin.nat.register(plugin.sockets.local_addrs().as_slice());
        let mut tasks = plugin.tasks.lock();
        tasks.push(tokio::spawn(Self::nat_pump(Arc::downgrade(&plugin), nat_events)));
        if let Some(s) = plugin.sockets.v4.clone() {
            tasks.push(tokio::spawn(Self::read_loop(Arc::downgrade(&plugin), s)));
        }
        if let Some(s) = plugin.sockets.v6.clone() {
            tasks.push(tokio::spawn(Self::read_loop(Arc::downgrade(&plugin), s)));
        }
        drop(tasks);

        debug!(port = plugin.sockets.port, "datagram bearer up");
        Ok(plugin)
    }

    /// The port the bearer actually bound (useful with ephemeral config).
    #[inline(always)]
    pub fn bound_port(&self) -> u16 {
        self.sockets.port
    }

    /// Number of live sessions across all peers.
    pub fn session_count(&self) -> usize {
        self.sessions.iter().map(|e| e.value().len()).sum()
    }

    /// Graceful teardown: every session is disconnected (continuations and
    /// `session_end` upcalls fire in order), then background tasks stop and
    /// the NAT registration is dropped.
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
        self.nat.unregister();
    }

    async fn read_loop(plugin: Weak<Self>, socket: Arc<tokio::net::UdpSocket>) {
        let mut buf = vec![0u8; DATAGRAM_SIZE_MAX];
        loop {
            match socket.recv_from(buf.as_mut_slice()).await {
                Ok((len, from)) => {
                    let advisory_delay = match plugin.upgrade() {
                        Some(plugin) => plugin.process_datagram(&from, &buf[0..len]),
                        None => return,
                    };
                    // The overlay can ask us to pace inbound reads.
                    if advisory_delay > 0 {
                        tokio::time::sleep(duration_from_ticks(advisory_delay)).await;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "datagram receive error");
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
            }
        }
    }

    async fn nat_pump(plugin: Weak<Self>, mut events: tokio::sync::mpsc::UnboundedReceiver<NatEvent>) {
        while let Some(ev) = events.recv().await {
            match plugin.upgrade() {
                Some(plugin) => plugin.handle_nat_event(ev),
                None => return,
            }
        }
    }

    fn handle_nat_event(&self, ev: NatEvent) {
        if ev.class.is_internal() {
            return;
        }
        let mut addr = ev.addr;
        if addr.port() == self.sockets.port {
            addr.set_port(self.settings.advertised_port_or(self.sockets.port));
        }
        let xu = XuAddress::from_socket_addr(&addr, self.settings.my_options);
        self.env.overlay.notify_address(ev.added, &xu.to_address(OriginHint::None));
    }

    /// Handle one received datagram; returns the advisory inbound delay.
    fn process_datagram(&self, from: &SocketAddr, data: &[u8]) -> i64 {
        self.env.stats.update("# bytes received via XU", data.len() as i64);

        if self.nat.consume_stun(from, data) {
            self.env.stats.update("# STUN datagrams absorbed", 1);
            return 0;
        }

        let envelope = match classify(data) {
            Classified::Message(envelope) => envelope,
            Classified::Malformed => {
                self.env.stats.update("# XU datagrams dropped (malformed)", 1);
                return 0;
            }
        };

        let now = ms_monotonic();
        let session = match self.find_or_create_inbound(envelope.sender, from, now) {
            Some(session) => session,
            None => return 0,
        };
        if session.is_tombstoned() {
            // The session_start upcall tore it right back down.
            return 0;
        }
        session.record_activity(now);

        let address = session.address();
        let dyn_session: Arc<dyn SessionInfo> = session.clone();
        let mut advisory_delay = 0i64;
        let framing = {
            let mut tokenizer = session.tokenizer.lock();
            tokenizer.push(envelope.body, |msg_type, payload| {
                self.env.stats.update("# XU messages received", 1);
                let d = self.env.overlay.receive(&address, &dyn_session, msg_type, payload);
                advisory_delay = advisory_delay.max(d);
            })
        };
        if framing.is_err() {
            // The rest of this datagram is garbage; the next one starts a
            // clean stream. Sessions survive malformed input.
            self.env.stats.update("# XU streams with framing errors", 1);
            *session.tokenizer.lock() = StreamTokenizer::new();
        }
        session.set_flow_delay_to_peer(advisory_delay);
        advisory_delay
    }

    fn lookup_by_remote(&self, peer: &PeerIdentity, remote: &SocketAddr) -> Option<Arc<XuSession>> {
        self.sessions
            .get(peer)
            .and_then(|list| list.iter().find(|s| s.remote() == remote).cloned())
    }

    /// Inbound-path session resolution: reuse the session for this
    /// `(peer, remote)` or create one and announce it with `session_start`.
    fn find_or_create_inbound(&self, peer: PeerIdentity, from: &SocketAddr, now: i64) -> Option<Arc<XuSession>> {
        if from.port() == 0 {
            return None;
        }
        if let Some(existing) = self.lookup_by_remote(&peer, from) {
            return Some(existing);
        }

        let xu = XuAddress::from_socket_addr(from, 0);
        let address = xu.to_address(OriginHint::Inbound);
        let session = Arc::new(XuSession::new(peer, address.clone(), *from, xu.scope(), now));
        let raced = {
            let mut entry = self.sessions.entry(peer).or_default();
            if let Some(existing) = entry.iter().find(|s| s.remote() == from) {
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
        self.env.stats.update("# XU sessions active", 1);
        self.emit_monitor_event(&session, SessionState::Init);
        self.emit_monitor_event(&session, SessionState::Up);
        let dyn_session: Arc<dyn SessionInfo> = session.clone();
        self.env.overlay.session_start(&address, &dyn_session, session.scope());
        Some(session)
    }

    fn spawn_timeout_task(&self, session: &Arc<XuSession>) {
        let plugin = self.me.clone();
        let session_for_task = session.clone();
        let handle = tokio::spawn(async move {
            // If traffic moved the deadline while we slept, sleep again for
            // the remainder; the expiry action runs at most once.
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

    /// Idle expiry, called from the session's own timeout task.
    fn expire_session(&self, session: &Arc<XuSession>) {
        if !session.tombstone() {
            return;
        }
        debug!(peer = %session.peer().to_short_string(), "session idle timeout");
        self.env.stats.update("# XU sessions timed out", 1);
        self.teardown_session(session);
    }

    /// Common tail of every disconnect path. The caller won the tombstone;
    /// after the map removal no new work can reference the session, and the
    /// allocation lives on until the last in-flight borrow drops.
    fn teardown_session(&self, session: &Arc<XuSession>) {
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
        self.env.stats.update("# XU sessions active", -1);
    }

    fn disconnect_session_inner(&self, session: &Arc<XuSession>) {
        if !session.tombstone() {
            return;
        }
        session.abort_timeout_task();
        self.teardown_session(session);
    }

    fn emit_monitor_event(&self, session: &Arc<XuSession>, state: SessionState) {
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

impl<O: Overlay> Plugin for XuPlugin<O> {
    type Session = XuSession;

    fn name(&self) -> &'static str {
        PLUGIN_NAME_XU
    }

    fn send(&self, session: &Arc<XuSession>, payload: &[u8], _deadline: i64, cont: Option<SendContinuation>) -> isize {
        let peer = session.peer();
        if payload.is_empty() || payload.len() >= MAX_MESSAGE_SIZE {
            return Self::fail_send(cont, &peer, payload.len());
        }
        if session.is_tombstoned() {
            return Self::fail_send(cont, &peer, payload.len());
        }
        let remote = *session.remote();
        let socket = match self.sockets.for_remote(&remote) {
            Some(socket) => socket,
            None => return Self::fail_send(cont, &peer, payload.len()),
        };

        let datagram = build_datagram(&self.env.my_identity, payload);
        let overhead = if remote.is_ipv4() { UDP_IPV4_OVERHEAD } else { UDP_IPV6_OVERHEAD };
        let wire_bytes = datagram.len() + overhead;

        match socket.try_send_to(datagram.as_slice(), remote) {
            Ok(_) => {
                let now = ms_monotonic();
                session.note_transmit(now);
                session.record_activity(now);
                // A successful send re-opens the warning latch so a fresh
                // outage is reported promptly.
                self.unreachable_warning.reset();
                self.env.stats.update("# bytes sent via XU", datagram.len() as i64);
                self.env.stats.update("# XU messages sent", 1);
                if let Some(cont) = cont {
                    cont(&peer, SendStatus::Ok, payload.len(), wire_bytes);
                }
                wire_bytes as isize
            }
            Err(e) => {
                // Transient I/O failure: the session stays up, the overlay
                // just hears SYSERR for this one message.
                self.env.stats.update("# XU send failures", 1);
                let transient_net = matches!(e.raw_os_error(), Some(libc::ENETUNREACH) | Some(libc::ENETDOWN));
                if transient_net && self.unreachable_warning.admit(ms_monotonic()) {
                    warn!(remote = %remote, error = %e, "network unreachable, retaining session");
                } else {
                    debug!(remote = %remote, error = %e, "datagram send failed");
                }
                Self::fail_send(cont, &peer, payload.len())
            }
        }
    }

    fn get_session(&self, peer: &PeerIdentity, address: &Address) -> Option<Arc<XuSession>> {
        if address.plugin() != PLUGIN_NAME_XU {
            return None;
        }
        let xu = XuAddress::from_bytes(address.bytes())?;
        if xu.port() == 0 {
            return None;
        }
        let remote = xu.socket_addr();
        self.sockets.for_remote(&remote)?;

        if let Some(list) = self.sessions.get(peer) {
            if let Some(existing) = list.iter().find(|s| s.address() == *address) {
                return Some(existing.clone());
            }
        }

        let session = Arc::new(XuSession::new(*peer, address.clone(), remote, xu.scope(), ms_monotonic()));
        let raced = {
            let mut entry = self.sessions.entry(*peer).or_default();
            if let Some(existing) = entry.iter().find(|s| s.address() == *address) {
                Some(existing.clone())
            } else {
                entry.push(session.clone());
                None
            }
        };
        if let Some(existing) = raced {
            return Some(existing);
        }

        // Outbound creation is silent towards the overlay; only monitors
        // hear about it.
        self.spawn_timeout_task(&session);
        self.env.stats.update("# XU sessions active", 1);
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

    fn disconnect_session(&self, session: &Arc<XuSession>) {
        self.disconnect_session_inner(session);
    }

    fn check_address(&self, bytes: &[u8]) -> bool {
        match XuAddress::from_bytes(bytes) {
            Some(xu) => xu.port() != 0 && self.nat.is_host_address(&xu.socket_addr()),
            None => false,
        }
    }

    fn address_to_string(&self, bytes: &[u8]) -> Option<String> {
        XuAddress::from_bytes(bytes).map(|xu| format!("{}.{}", PLUGIN_NAME_XU, xu))
    }

    fn string_to_address(&self, s: &str) -> Result<Address, InvalidFormatError> {
        let address = Address::from_str(s)?;
        if address.plugin() == PLUGIN_NAME_XU {
            Ok(address)
        } else {
            Err(InvalidFormatError)
        }
    }

    fn address_pretty_printer(&self, bytes: &[u8], numeric: bool, deadline: i64, mut sink: PrettyPrintSink) {
        let xu = match XuAddress::from_bytes(bytes) {
            Some(xu) => xu,
            None => {
                sink(None, SendStatus::SysErr);
                return;
            }
        };
        let resolver = if numeric { None } else { self.resolver.clone() };
        match resolver {
            None => {
                sink(Some(format!("{}.{}", PLUGIN_NAME_XU, xu).as_str()), SendStatus::Ok);
                sink(None, SendStatus::Ok);
            }
            Some(resolver) => {
                // Reverse DNS happens off the caller's task; the sink hears
                // the terminal call once the lookup finishes or the
                // deadline cuts it off.
                let handle = tokio::spawn(async move {
                    let budget = duration_from_ticks(deadline - ms_monotonic());
                    let name = tokio::time::timeout(budget, resolver.reverse_lookup(xu.ip())).await.ok().flatten();
                    let printed = match name {
                        Some(host) => format!("{}.{}.{}:{}", PLUGIN_NAME_XU, xu.options(), host, xu.port()),
                        None => format!("{}.{}", PLUGIN_NAME_XU, xu),
                    };
                    sink(Some(printed.as_str()), SendStatus::Ok);
                    sink(None, SendStatus::Ok);
                });
                self.tasks.lock().push(handle);
            }
        }
    }

    fn get_network(&self, session: &XuSession) -> NetworkScope {
        session.scope()
    }

    fn get_network_for_address(&self, address: &Address) -> NetworkScope {
        if address.plugin() != PLUGIN_NAME_XU {
            return NetworkScope::Unspecified;
        }
        XuAddress::from_bytes(address.bytes()).map_or(NetworkScope::Unspecified, |xu| xu.scope())
    }

    fn update_session_timeout(&self, session: &XuSession) {
        session.record_activity(ms_monotonic());
    }

    fn setup_monitor(&self, monitor: SessionMonitor) {
        // Replay the current session set before hooking up live events.
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

impl<O: Overlay> Drop for XuPlugin<O> {
    fn drop(&mut self) {
        for t in self.tasks.lock().drain(..) {
            t.abort();
        }
        self.nat.unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::LocalNatMapper;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use transport_core::identity::PEER_IDENTITY_SIZE;
    use transport_core::plugin::{MemoryStatistics, SignatureProvider, StatisticsSink};
    use transport_core::tokenizer::frame_message;

    const TEST_MSG_TYPE: u16 = 0x0042;

    #[derive(Debug)]
    enum Event {
        Start(Address),
        End(Address),
        Receive(PeerIdentity, u16, Vec<u8>),
        Notify(bool, Address),
    }

    struct RecordingOverlay {
        tx: mpsc::UnboundedSender<Event>,
    }

    impl Overlay for RecordingOverlay {
        fn receive(&self, _address: &Address, session: &Arc<dyn SessionInfo>, message_type: u16, payload: &[u8]) -> i64 {
            let _ = self.tx.send(Event::Receive(session.peer(), message_type, payload.to_vec()));
            0
        }
        fn session_start(&self, address: &Address, _session: &Arc<dyn SessionInfo>, _scope: NetworkScope) {
            let _ = self.tx.send(Event::Start(address.clone()));
        }
        fn session_end(&self, address: &Address, _session: &Arc<dyn SessionInfo>) {
            let _ = self.tx.send(Event::End(address.clone()));
        }
        fn notify_address(&self, added: bool, address: &Address) {
            let _ = self.tx.send(Event::Notify(added, address.clone()));
        }
    }

    struct NullSigner;

    impl SignatureProvider for NullSigner {
        fn sign(&self, _data: &[u8]) -> Vec<u8> {
            Vec::new()
        }
        fn verify(&self, _signer: &PeerIdentity, _data: &[u8], _signature: &[u8]) -> bool {
            true
        }
    }

    struct Node {
        plugin: Arc<XuPlugin<RecordingOverlay>>,
        events: mpsc::UnboundedReceiver<Event>,
        stats: Arc<MemoryStatistics>,
        identity: PeerIdentity,
    }

    fn node(fill: u8) -> Node {
        let identity = PeerIdentity([fill; PEER_IDENTITY_SIZE]);
        let (tx, events) = mpsc::unbounded_channel();
        let stats = Arc::new(MemoryStatistics::new());
        let env = PluginEnvironment {
            my_identity: identity,
            overlay: Arc::new(RecordingOverlay { tx }),
            stats: stats.clone() as Arc<dyn StatisticsSink>,
            signer: Arc::new(NullSigner),
        };
        let settings = XuSettings { bind_to: Some(Ipv4Addr::LOCALHOST), disable_v6: true, ..Default::default() };
        let plugin = XuPlugin::new(env, settings, Arc::new(LocalNatMapper::new()), None).unwrap();
        Node { plugin, events, stats, identity }
    }

    fn address_of(n: &Node) -> Address {
        XuAddress::V4 { options: 0, ip: Ipv4Addr::LOCALHOST, port: n.plugin.bound_port() }.to_address(OriginHint::None)
    }

    async fn next_event(n: &mut Node) -> Event {
        tokio::time::timeout(Duration::from_secs(5), n.events.recv()).await.expect("event timeout").expect("channel open")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn echo_over_datagram() {
        let a = node(0xaa);
        let mut b = node(0xbb);

        let payload: Vec<u8> = (0..100u8).collect();
        let framed = frame_message(TEST_MSG_TYPE, payload.as_slice());

        let session = a.plugin.get_session(&b.identity, &address_of(&b)).unwrap();
        let (cont_tx, mut cont_rx) = mpsc::unbounded_channel();
        let target = b.identity;
        let estimate = a.plugin.send(
            &session,
            framed.as_slice(),
            ms_monotonic() + 1000,
            Some(Box::new(move |peer, status, sent, wire| {
                assert_eq!(*peer, target);
                let _ = cont_tx.send((status, sent, wire));
            })),
        );
        assert!(estimate >= (100 + 40) as isize);

        let (status, sent, wire) = cont_rx.recv().await.unwrap();
        assert_eq!(status, SendStatus::Ok);
        assert_eq!(sent, framed.len());
        assert!(wire >= 100 + 40);

        // B sees the session come up, then the exact bytes with A's identity.
        match next_event(&mut b).await {
            Event::Start(addr) => assert_eq!(addr.plugin(), PLUGIN_NAME_XU),
            other => panic!("expected session start, got {:?}", other),
        }
        match next_event(&mut b).await {
            Event::Receive(sender, msg_type, body) => {
                assert_eq!(sender, a.identity);
                assert_eq!(msg_type, TEST_MSG_TYPE);
                assert_eq!(body, payload);
            }
            other => panic!("expected receive, got {:?}", other),
        }
        assert_eq!(b.plugin.session_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_datagram_counted_without_upcall() {
        let mut b = node(0xbb);
        let raw = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();

        // Declared size (2 bytes in) disagrees with the real length.
        let mut bogus = build_datagram(&PeerIdentity([1; PEER_IDENTITY_SIZE]), &[1, 2, 3]);
        bogus.pop();
        raw.send_to(bogus.as_slice(), (Ipv4Addr::LOCALHOST, b.plugin.bound_port())).unwrap();

        let mut seen = 0;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            seen = b.stats.get("# XU datagrams dropped (malformed)");
            if seen > 0 {
                break;
            }
        }
        assert_eq!(seen, 1);
        assert_eq!(b.plugin.session_count(), 0);
        assert!(b.events.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stun_datagrams_go_to_the_nat_module() {
        let mut b = node(0xbb);
        let raw = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();

        let mut stun = vec![0u8; 20];
        stun[1] = 0x01;
        stun[4..8].copy_from_slice(&crate::nat::STUN_MAGIC_COOKIE.to_be_bytes());
        raw.send_to(stun.as_slice(), (Ipv4Addr::LOCALHOST, b.plugin.bound_port())).unwrap();

        let mut absorbed = 0;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            absorbed = b.stats.get("# STUN datagrams absorbed");
            if absorbed > 0 {
                break;
            }
        }
        assert_eq!(absorbed, 1);
        assert!(b.events.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disconnect_fires_session_end_once() {
        let mut a = node(0xaa);
        let b = node(0xbb);

        let session = a.plugin.get_session(&b.identity, &address_of(&b)).unwrap();
        assert_eq!(a.plugin.session_count(), 1);

        a.plugin.disconnect_peer(&b.identity);
        a.plugin.disconnect_peer(&b.identity); // idempotent
        a.plugin.disconnect_session(&session); // also idempotent

        match next_event(&mut a).await {
            Event::End(_) => {}
            other => panic!("expected session end, got {:?}", other),
        }
        assert!(a.events.try_recv().is_err());
        assert_eq!(a.plugin.session_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn get_session_rejects_bad_addresses() {
        let a = node(0xaa);
        let peer = PeerIdentity([9; PEER_IDENTITY_SIZE]);

        let port_zero = XuAddress::V4 { options: 0, ip: Ipv4Addr::LOCALHOST, port: 0 }.to_address(OriginHint::None);
        assert!(a.plugin.get_session(&peer, &port_zero).is_none());

        let foreign = Address::new("wlan", vec![0; 6], OriginHint::None);
        assert!(a.plugin.get_session(&peer, &foreign).is_none());

        let truncated = Address::new(PLUGIN_NAME_XU, vec![0; 7], OriginHint::None);
        assert!(a.plugin.get_session(&peer, &truncated).is_none());

        // IPv6 remote with the v6 socket disabled.
        let v6 = Address::from_str("xu.0.[::1]:4040").unwrap();
        assert!(a.plugin.get_session(&peer, &v6).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn get_session_deduplicates_full_tuple() {
        let a = node(0xaa);
        let b = node(0xbb);
        let addr = address_of(&b);

        let s1 = a.plugin.get_session(&b.identity, &addr).unwrap();
        let s2 = a.plugin.get_session(&b.identity, &addr).unwrap();
        assert!(Arc::ptr_eq(&s1, &s2));
        assert_eq!(a.plugin.session_count(), 1);

        // Same endpoint but different options is a different address.
        let other = XuAddress::V4 { options: 1, ip: Ipv4Addr::LOCALHOST, port: b.plugin.bound_port() }
            .to_address(OriginHint::None);
        let s3 = a.plugin.get_session(&b.identity, &other).unwrap();
        assert!(!Arc::ptr_eq(&s1, &s3));
        assert_eq!(a.plugin.session_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn monitor_replays_then_reports() {
        let a = node(0xaa);
        let b = node(0xbb);
        let _session = a.plugin.get_session(&b.identity, &address_of(&b)).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        a.plugin.setup_monitor(Arc::new(move |ev| {
            let _ = tx.send(ev.map(|(p, _, s)| (*p, s)));
        }));

        assert_eq!(rx.recv().await.unwrap(), Some((b.identity, SessionState::Init)));
        assert_eq!(rx.recv().await.unwrap(), Some((b.identity, SessionState::Up)));
        assert_eq!(rx.recv().await.unwrap(), None);

        a.plugin.disconnect_peer(&b.identity);
        assert_eq!(rx.recv().await.unwrap(), Some((b.identity, SessionState::Done)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn expiry_removes_session_and_notifies() {
        let mut a = node(0xaa);
        let b = node(0xbb);
        let session = a.plugin.get_session(&b.identity, &address_of(&b)).unwrap();

        // Drive the expiry action directly instead of waiting a minute.
        a.plugin.expire_session(&session);
        match next_event(&mut a).await {
            Event::End(_) => {}
            other => panic!("expected session end, got {:?}", other),
        }
        assert_eq!(a.plugin.session_count(), 0);
        assert_eq!(a.stats.get("# XU sessions timed out"), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn address_helpers_round_trip() {
        let a = node(0xaa);
        let addr = Address::from_str("xu.0.127.0.0.1:2086").unwrap();
        assert_eq!(a.plugin.address_to_string(addr.bytes()).unwrap(), "xu.0.127.0.0.1:2086");
        assert_eq!(a.plugin.string_to_address("xu.0.127.0.0.1:2086").unwrap(), addr);
        assert!(a.plugin.string_to_address("wlan.0.aa:bb:cc:dd:ee:ff").is_err());
        assert!(a.plugin.address_to_string(&[1, 2, 3]).is_none());

        // check_address accepts only addresses that map onto this host.
        let own = XuAddress::V4 { options: 0, ip: Ipv4Addr::LOCALHOST, port: a.plugin.bound_port() };
        assert!(a.plugin.check_address(own.to_bytes().as_slice()));
        let not_ours = XuAddress::V4 { options: 0, ip: Ipv4Addr::LOCALHOST, port: 1 };
        assert!(!a.plugin.check_address(not_ours.to_bytes().as_slice()));
    }
}
