/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use transport_core::address::{Address, MacAddress, NetworkScope};
use transport_core::identity::PeerIdentity;
use transport_core::plugin::{SendContinuation, SessionInfo, IDLE_CONNECTION_TIMEOUT_MS};

/// An overlay message accepted by `send` but not yet admitted to the
/// fragmentation stage. At most one exists per session.
pub struct PendingMessage {
    /// The fully serialized data frame.
    pub frame: Vec<u8>,
    /// Payload length as handed to `send`, for continuation reporting.
    pub payload_len: usize,
    /// Past this tick the message is dead and its continuation fires
    /// `SysErr` instead of being admitted.
    pub deadline: i64,
    pub cont: Option<SendContinuation>,
}

impl std::fmt::Debug for PendingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingMessage")
            .field("frame", &self.frame)
            .field("payload_len", &self.payload_len)
            .field("deadline", &self.deadline)
            .field("cont", &self.cont.as_ref().map(|_| "<continuation>"))
            .finish()
    }
}

/// State for communicating with one `(peer, station MAC)` over 802.11.
pub struct WlanSession {
    peer: PeerIdentity,
    address: Address,
    mac: MacAddress,
    last_transmit: AtomicI64,
    deadline: AtomicI64,
    pending_destroy: AtomicBool,
    /// The one message waiting for fragmentation admission, if any.
    pub(crate) pending: Mutex<Option<PendingMessage>>,
    /// True while a `FragmentMessage` of this session is in flight.
    pub(crate) has_fragment: AtomicBool,
    pub(crate) timeout_task: Mutex<Option<JoinHandle<()>>>,
}

impl WlanSession {
    pub fn new(peer: PeerIdentity, address: Address, mac: MacAddress, now: i64) -> Self {
        Self {
            peer,
            address,
            mac,
            last_transmit: AtomicI64::new(0),
            deadline: AtomicI64::new(now + IDLE_CONNECTION_TIMEOUT_MS),
            pending_destroy: AtomicBool::new(false),
            pending: Mutex::new(None),
            has_fragment: AtomicBool::new(false),
            timeout_task: Mutex::new(None),
        }
    }

    #[inline(always)]
    pub fn mac(&self) -> &MacAddress {
        &self.mac
    }

    #[inline(always)]
    pub fn deadline(&self) -> i64 {
        self.deadline.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn last_transmit(&self) -> i64 {
        self.last_transmit.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn record_activity(&self, now: i64) {
        self.deadline.fetch_max(now + IDLE_CONNECTION_TIMEOUT_MS, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn note_transmit(&self, now: i64) {
        self.last_transmit.fetch_max(now, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn has_fragment(&self) -> bool {
        self.has_fragment.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn is_tombstoned(&self) -> bool {
        self.pending_destroy.load(Ordering::Acquire)
    }

    /// Returns true exactly once.
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

impl SessionInfo for WlanSession {
    fn peer(&self) -> PeerIdentity {
        self.peer
    }

    fn address(&self) -> Address {
        self.address.clone()
    }

    fn scope(&self) -> NetworkScope {
        // Direct radio contact is by definition link local.
        NetworkScope::Lan
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl Drop for WlanSession {
    fn drop(&mut self) {
        if let Some(t) = self.timeout_task.lock().take() {
            t.abort();
        }
    }
}
