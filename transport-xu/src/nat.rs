/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::net::SocketAddr;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use transport_core::address::{scope_of_ip, NetworkScope};

/// STUN magic cookie (RFC 5389), network byte order on the wire.
pub const STUN_MAGIC_COOKIE: u32 = 0x2112_a442;

const STUN_HEADER_SIZE: usize = 20;

/// Coarse class attached to every NAT mapping event.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AddressClass {
    Loopback,
    LanPrivate,
    Lan,
    Global,
}

impl AddressClass {
    /// Classes that never leave the host's own broadcast domain are not
    /// worth advertising to the overlay.
    #[inline(always)]
    pub fn is_internal(&self) -> bool {
        matches!(self, AddressClass::Loopback | AddressClass::Lan | AddressClass::LanPrivate)
    }
}

/// One address mapping change reported by the NAT layer.
#[derive(Clone, Debug)]
pub struct NatEvent {
    pub added: bool,
    pub addr: SocketAddr,
    pub class: AddressClass,
}

/// The external NAT traversal service, as the bearer consumes it.
///
/// Registration reports the locally bound sockets and opens the event
/// stream; afterwards the mapper pushes add/remove events for the public
/// addresses it discovers. The same sockets double as the STUN side
/// channel, so the read loop offers every datagram to `consume_stun`
/// before attempting to parse it as bearer traffic.
pub trait NatMapper: Send + Sync + 'static {
    fn register(&self, local: &[SocketAddr]) -> mpsc::UnboundedReceiver<NatEvent>;
    fn unregister(&self);

    /// True if this sockaddr is an address of this host according to the
    /// current mapping table. Consulted by `check_address`.
    fn is_host_address(&self, addr: &SocketAddr) -> bool;

    /// Inspect a raw datagram; if it is STUN it is consumed here and the
    /// bearer never sees it.
    fn consume_stun(&self, from: &SocketAddr, datagram: &[u8]) -> bool;
}

/// True if the datagram is plausibly a STUN message: two clear top bits,
/// the magic cookie in place, and an attribute length matching the size.
pub fn looks_like_stun(datagram: &[u8]) -> bool {
    datagram.len() >= STUN_HEADER_SIZE
        && (datagram[0] & 0xc0) == 0
        && u32::from_be_bytes(datagram[4..8].try_into().unwrap()) == STUN_MAGIC_COOKIE
        && u16::from_be_bytes(datagram[2..4].try_into().unwrap()) as usize == datagram.len() - STUN_HEADER_SIZE
}

/// NAT mapper for hosts without NAT assistance: reports the bound sockets
/// themselves as the host's addresses and consumes STUN without acting on
/// it. Real traversal (uPnP, external STUN servers) plugs in behind the
/// same trait.
#[derive(Default)]
pub struct LocalNatMapper {
    registered: Mutex<Vec<SocketAddr>>,
}

impl LocalNatMapper {
    pub fn new() -> Self {
        Self::default()
    }

    fn classify(addr: &SocketAddr) -> AddressClass {
        match scope_of_ip(&addr.ip()) {
            NetworkScope::Loopback => AddressClass::Loopback,
            NetworkScope::Lan => AddressClass::LanPrivate,
            NetworkScope::Unspecified | NetworkScope::Wan => AddressClass::Global,
        }
    }
}

impl NatMapper for LocalNatMapper {
    fn register(&self, local: &[SocketAddr]) -> mpsc::UnboundedReceiver<NatEvent> {
        *self.registered.lock() = local.to_vec();
        let (tx, rx) = mpsc::unbounded_channel();
        for addr in local {
            let _ = tx.send(NatEvent { added: true, addr: *addr, class: Self::classify(addr) });
        }
        rx
    }

    fn unregister(&self) {
        self.registered.lock().clear();
    }

    fn is_host_address(&self, addr: &SocketAddr) -> bool {
        let registered = self.registered.lock();
        registered.iter().any(|r| {
            r.port() == addr.port() && (r.ip() == addr.ip() || r.ip().is_unspecified())
        })
    }

    fn consume_stun(&self, _from: &SocketAddr, datagram: &[u8]) -> bool {
        looks_like_stun(datagram)
    }
}
