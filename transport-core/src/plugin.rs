/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::any::Any;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::address::{Address, NetworkScope};
use crate::error::InvalidFormatError;
use crate::identity::PeerIdentity;

/// Idle timeout after which a bearer session with no traffic is torn down.
pub const IDLE_CONNECTION_TIMEOUT_MS: i64 = 60_000;

/// How many keepalive periods the idle timeout divides into.
pub const KEEPALIVE_FACTOR: u32 = 15;

/// Hard upper bound on the payload accepted by `send`.
pub const MAX_MESSAGE_SIZE: usize = 65_535;

/// Final status handed to continuations and pretty-printer sinks.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SendStatus {
    Ok,
    SysErr,
}

/// Continuation invoked exactly once when a send reaches its terminal state.
///
/// Arguments: target peer, status, payload bytes handed to `send`, and the
/// physical bytes that hit (or would have hit) the wire including bearer
/// overhead.
pub type SendContinuation = Box<dyn FnOnce(&PeerIdentity, SendStatus, usize, usize) + Send>;

/// Observable lifecycle states reported to session monitors.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SessionState {
    Init,
    Up,
    Down,
    Done,
}

/// Callback registered via `setup_monitor`.
///
/// On registration every current session is replayed as `Init` then `Up`,
/// followed by one call with `None` to mark the end of the initial sync.
/// Afterwards each state change is reported as it happens.
pub type SessionMonitor = Arc<dyn Fn(Option<(&PeerIdentity, &Address, SessionState)>) + Send + Sync>;

/// Sink for the streaming address pretty-printer: zero or more strings, then
/// exactly one terminal call with `None` and the overall status.
pub type PrettyPrintSink = Box<dyn FnMut(Option<&str>, SendStatus) + Send>;

/// What a bearer session looks like from outside its owning plugin.
pub trait SessionInfo: Send + Sync + 'static {
    fn peer(&self) -> PeerIdentity;
    fn address(&self) -> Address;
    fn scope(&self) -> NetworkScope;
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// The overlay connectivity service as seen from a plugin: the four upcalls.
///
/// All upcalls happen on the task that entered the plugin (read handler,
/// timer, or `send` path); a plugin never re-enters itself synchronously
/// from inside one. Upcalls may call back into the plugin.
pub trait Overlay: Sync + Send + 'static {
    /// Deliver one whole message from a peer. The return value is an
    /// advisory inbound flow delay in milliseconds (0 = no throttling).
    fn receive(&self, address: &Address, session: &Arc<dyn SessionInfo>, message_type: u16, payload: &[u8]) -> i64;

    /// A session to a peer came up (inbound sessions only; outbound session
    /// creation via `get_session` is silent).
    fn session_start(&self, address: &Address, session: &Arc<dyn SessionInfo>, scope: NetworkScope);

    /// A session ended. Always preceded by `SysErr` continuations for any
    /// sends still pending on it.
    fn session_end(&self, address: &Address, session: &Arc<dyn SessionInfo>);

    /// A plugin address of this host became valid (`true`) or was withdrawn.
    fn notify_address(&self, added: bool, address: &Address);
}

/// Counter sink for operational statistics.
pub trait StatisticsSink: Send + Sync {
    fn update(&self, metric: &'static str, delta: i64);
    fn set(&self, metric: &'static str, value: u64);
}

/// Statistics sink that discards everything.
pub struct NullStatistics;

impl StatisticsSink for NullStatistics {
    fn update(&self, _metric: &'static str, _delta: i64) {}
    fn set(&self, _metric: &'static str, _value: u64) {}
}

/// In-memory statistics, mainly for tests and introspection endpoints.
#[derive(Default)]
pub struct MemoryStatistics {
    counters: parking_lot::Mutex<HashMap<&'static str, i64>>,
}

impl MemoryStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, metric: &'static str) -> i64 {
        self.counters.lock().get(metric).copied().unwrap_or(0)
    }
}

impl StatisticsSink for MemoryStatistics {
    fn update(&self, metric: &'static str, delta: i64) {
        *self.counters.lock().entry(metric).or_insert(0) += delta;
    }

    fn set(&self, metric: &'static str, value: u64) {
        self.counters.lock().insert(metric, value as i64);
    }
}

/// Seam to the external cryptographic identity layer.
///
/// Signing and verification are opaque here; the validation module only
/// needs "sign these bytes" and "did this peer sign these bytes".
pub trait SignatureProvider: Send + Sync {
    fn sign(&self, data: &[u8]) -> Vec<u8>;
    fn verify(&self, signer: &PeerIdentity, data: &[u8], signature: &[u8]) -> bool;
}

/// Seam to the external DNS resolver used by `address_pretty_printer` when
/// numeric output was not requested.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn reverse_lookup(&self, ip: IpAddr) -> Option<String>;
}

/// Everything the overlay hands a plugin at construction.
pub struct PluginEnvironment<O: Overlay> {
    /// This node's own identity.
    pub my_identity: PeerIdentity,
    pub overlay: Arc<O>,
    pub stats: Arc<dyn StatisticsSink>,
    pub signer: Arc<dyn SignatureProvider>,
}

impl<O: Overlay> Clone for PluginEnvironment<O> {
    fn clone(&self) -> Self {
        Self {
            my_identity: self.my_identity,
            overlay: self.overlay.clone(),
            stats: self.stats.clone(),
            signer: self.signer.clone(),
        }
    }
}

/// The capability set every bearer exposes to the overlay.
///
/// A plugin instance is one bearer; the overlay invokes these operations
/// polymorphically and treats sessions as opaque handles.
pub trait Plugin: Send + Sync + 'static {
    type Session: SessionInfo;

    /// The short name addresses of this bearer are tagged with.
    fn name(&self) -> &'static str;

    /// Queue `payload` for transmission on `session`.
    ///
    /// The continuation is invoked exactly once: synchronously for bearers
    /// without an internal queue, later for queueing bearers. Returns an
    /// estimate of the physical bytes this transmission costs, or -1 on a
    /// hard address format error (in which case the continuation still
    /// fires, with `SysErr`).
    fn send(&self, session: &Arc<Self::Session>, payload: &[u8], deadline: i64, cont: Option<SendContinuation>) -> isize;

    /// Find or create a session to `peer` at `address`. `None` if the
    /// address is malformed or carries the port-zero "unmapped" sentinel.
    /// Creation through this path is silent (no `session_start` upcall).
    fn get_session(&self, peer: &PeerIdentity, address: &Address) -> Option<Arc<Self::Session>>;

    /// Tear down every session to a peer. Pending continuations fire with
    /// `SysErr` before any `session_end` upcall.
    fn disconnect_peer(&self, peer: &PeerIdentity);

    /// Tear down a single session; idempotent.
    fn disconnect_session(&self, session: &Arc<Self::Session>);

    /// True if the bytes are a plausible address of this bearer that maps
    /// to this host (the NAT table is consulted where applicable).
    fn check_address(&self, bytes: &[u8]) -> bool;

    /// Human-readable form of bearer address bytes, or `None` if malformed.
    fn address_to_string(&self, bytes: &[u8]) -> Option<String>;

    /// Parse the canonical string form back into a full address.
    fn string_to_address(&self, s: &str) -> Result<Address, InvalidFormatError>;

    /// Stream zero or more human-readable strings for an address to `sink`,
    /// terminated by a `None` call carrying the overall status. With
    /// `numeric` false a reverse DNS lookup may be performed before the
    /// deadline.
    fn address_pretty_printer(&self, bytes: &[u8], numeric: bool, deadline: i64, sink: PrettyPrintSink);

    fn query_keepalive_factor(&self) -> u32 {
        KEEPALIVE_FACTOR
    }

    fn get_network(&self, session: &Self::Session) -> NetworkScope;

    fn get_network_for_address(&self, address: &Address) -> NetworkScope;

    /// Slide the session's idle deadline to now + idle timeout.
    fn update_session_timeout(&self, session: &Self::Session);

    /// Register a monitor; current sessions are replayed before new events.
    fn setup_monitor(&self, monitor: SessionMonitor);
}

/// Object-safe form of [`Plugin`] with the session type erased, so the
/// overlay can hold heterogeneous bearers in one table.
pub trait ErasedPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn send(&self, session: &Arc<dyn SessionInfo>, payload: &[u8], deadline: i64, cont: Option<SendContinuation>) -> isize;
    fn get_session(&self, peer: &PeerIdentity, address: &Address) -> Option<Arc<dyn SessionInfo>>;
    fn disconnect_peer(&self, peer: &PeerIdentity);
    fn disconnect_session(&self, session: &Arc<dyn SessionInfo>);
    fn check_address(&self, bytes: &[u8]) -> bool;
    fn address_to_string(&self, bytes: &[u8]) -> Option<String>;
    fn string_to_address(&self, s: &str) -> Result<Address, InvalidFormatError>;
    fn address_pretty_printer(&self, bytes: &[u8], numeric: bool, deadline: i64, sink: PrettyPrintSink);
    fn query_keepalive_factor(&self) -> u32;
    fn get_network(&self, session: &Arc<dyn SessionInfo>) -> NetworkScope;
    fn get_network_for_address(&self, address: &Address) -> NetworkScope;
    fn update_session_timeout(&self, session: &Arc<dyn SessionInfo>);
    fn setup_monitor(&self, monitor: SessionMonitor);
}

impl<P: Plugin> ErasedPlugin for P {
    fn name(&self) -> &'static str {
        Plugin::name(self)
    }

    fn send(&self, session: &Arc<dyn SessionInfo>, payload: &[u8], deadline: i64, cont: Option<SendContinuation>) -> isize {
        match session.clone().as_any_arc().downcast::<P::Session>() {
            Ok(s) => Plugin::send(self, &s, payload, deadline, cont),
            Err(_) => {
                // Caller handed a session belonging to a different bearer.
                if let Some(cont) = cont {
                    cont(&session.peer(), SendStatus::SysErr, payload.len(), 0);
                }
                -1
            }
        }
    }

    fn get_session(&self, peer: &PeerIdentity, address: &Address) -> Option<Arc<dyn SessionInfo>> {
        Plugin::get_session(self, peer, address).map(|s| s as Arc<dyn SessionInfo>)
    }

    fn disconnect_peer(&self, peer: &PeerIdentity) {
        Plugin::disconnect_peer(self, peer)
    }

    fn disconnect_session(&self, session: &Arc<dyn SessionInfo>) {
        if let Ok(s) = session.clone().as_any_arc().downcast::<P::Session>() {
            Plugin::disconnect_session(self, &s)
        }
    }

    fn check_address(&self, bytes: &[u8]) -> bool {
        Plugin::check_address(self, bytes)
    }

    fn address_to_string(&self, bytes: &[u8]) -> Option<String> {
        Plugin::address_to_string(self, bytes)
    }

    fn string_to_address(&self, s: &str) -> Result<Address, InvalidFormatError> {
        Plugin::string_to_address(self, s)
    }

    fn address_pretty_printer(&self, bytes: &[u8], numeric: bool, deadline: i64, sink: PrettyPrintSink) {
        Plugin::address_pretty_printer(self, bytes, numeric, deadline, sink)
    }

    fn query_keepalive_factor(&self) -> u32 {
        Plugin::query_keepalive_factor(self)
    }

    fn get_network(&self, session: &Arc<dyn SessionInfo>) -> NetworkScope {
        match session.clone().as_any_arc().downcast::<P::Session>() {
            Ok(s) => Plugin::get_network(self, &s),
            Err(_) => NetworkScope::Unspecified,
        }
    }

    fn get_network_for_address(&self, address: &Address) -> NetworkScope {
        Plugin::get_network_for_address(self, address)
    }

    fn update_session_timeout(&self, session: &Arc<dyn SessionInfo>) {
        if let Ok(s) = session.clone().as_any_arc().downcast::<P::Session>() {
            Plugin::update_session_timeout(self, &s)
        }
    }

    fn setup_monitor(&self, monitor: SessionMonitor) {
        Plugin::setup_monitor(self, monitor)
    }
}

/// The table of loaded bearers, keyed by plugin name.
///
/// This is what the overlay's connectivity service holds; address routing
/// goes through the plugin name tag on each [`Address`].
#[derive(Default)]
pub struct PluginTable {
    plugins: HashMap<&'static str, Arc<dyn ErasedPlugin>>,
}

impl PluginTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn ErasedPlugin>) {
        self.plugins.insert(plugin.name(), plugin);
    }

    #[inline(always)]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ErasedPlugin>> {
        self.plugins.get(name)
    }

    #[inline(always)]
    pub fn get_for_address(&self, address: &Address) -> Option<&Arc<dyn ErasedPlugin>> {
        self.plugins.get(address.plugin())
    }

    #[inline(always)]
    pub fn is_supported(&self, address: &Address) -> bool {
        self.plugins.contains_key(address.plugin())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ErasedPlugin>> {
        self.plugins.values()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
