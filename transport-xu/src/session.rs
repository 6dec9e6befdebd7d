/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use transport_core::address::{Address, NetworkScope};
use transport_core::identity::PeerIdentity;
use transport_core::plugin::{SessionInfo, IDLE_CONNECTION_TIMEOUT_MS};
use transport_core::tokenizer::StreamTokenizer;

/// State for communicating with one `(peer, address)` tuple over the
/// datagram bearer.
///
/// A session is shared between the sessions map, the read loop, its timeout
/// task, and any overlay stack frame currently delivering one of its
/// messages. Once tombstoned it is gone from the map but the allocation
/// survives until the last holder lets go; no upcall refers to it after the
/// tombstone is set.
pub struct XuSession {
    peer: PeerIdentity,
    address: Address,
    remote: SocketAddr,
    scope: NetworkScope,
    last_transmit: AtomicI64,
    deadline: AtomicI64,
    /// Advisory pacing hint we owe the peer (driven by the overlay's
    /// receive upcall return value).
    flow_delay_to_peer: AtomicI64,
    /// Advisory pacing hint last heard from the peer.
    flow_delay_from_peer: AtomicI64,
    pending_destroy: AtomicBool,
    pub(crate) tokenizer: Mutex<StreamTokenizer>,
    pub(crate) timeout_task: Mutex<Option<JoinHandle<()>>>,
}

impl XuSession {
    pub fn new(peer: PeerIdentity, address: Address, remote: SocketAddr, scope: NetworkScope, now: i64) -> Self {
        Self {
            peer,
            address,
            remote,
            scope,
            last_transmit: AtomicI64::new(0),
            deadline: AtomicI64::new(now + IDLE_CONNECTION_TIMEOUT_MS),
            flow_delay_to_peer: AtomicI64::new(0),
            flow_delay_from_peer: AtomicI64::new(0),
            pending_destroy: AtomicBool::new(false),
            tokenizer: Mutex::new(StreamTokenizer::new()),
            timeout_task: Mutex::new(None),
        }
    }

    #[inline(always)]
    pub fn remote(&self) -> &SocketAddr {
        &self.remote
    }

    #[inline(always)]
    pub fn deadline(&self) -> i64 {
        self.deadline.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn last_transmit(&self) -> i64 {
        self.last_transmit.load(Ordering::Relaxed)
    }

    /// Any traffic, in or out, slides the idle deadline forward. The
    /// deadline never moves backwards.
    #[inline(always)]
    pub fn record_activity(&self, now: i64) {
        self.deadline.fetch_max(now + IDLE_CONNECTION_TIMEOUT_MS, Ordering::Relaxed);
    }

    /// Advance the last transmit time; monotone even if the caller's clock
    /// reads earlier than a previous observation.
    #[inline(always)]
    pub fn note_transmit(&self, now: i64) {
        self.last_transmit.fetch_max(now, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn flow_delay_to_peer(&self) -> i64 {
        self.flow_delay_to_peer.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_flow_delay_to_peer(&self, delay_ms: i64) {
        self.flow_delay_to_peer.store(delay_ms.max(0), Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn flow_delay_from_peer(&self) -> i64 {
        self.flow_delay_from_peer.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_flow_delay_from_peer(&self, delay_ms: i64) {
        self.flow_delay_from_peer.store(delay_ms.max(0), Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn is_tombstoned(&self) -> bool {
        self.pending_destroy.load(Ordering::Acquire)
    }

    /// Mark the session as being destroyed. Returns true exactly once; all
    /// later calls see the tombstone and do nothing.
    #[inline(always)]
    pub fn tombstone(&self) -> bool {
        !self.pending_destroy.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn abort_timeout_task(&self) {
        if let Some(t) = self.timeout_task.lock().take() {
            t.abort();
        }
    }
}

impl SessionInfo for XuSession {
    fn peer(&self) -> PeerIdentity {
        self.peer
    }

    fn address(&self) -> Address {
        self.address.clone()
    }

    fn scope(&self) -> NetworkScope {
        self.scope
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl Drop for XuSession {
    fn drop(&mut self) {
        if let Some(t) = self.timeout_task.lock().take() {
            t.abort();
        }
    }
}
