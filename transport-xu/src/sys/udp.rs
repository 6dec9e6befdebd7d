/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::settings::XuSettings;

/// Lowest port drawn when an ephemeral port was requested.
pub const EPHEMERAL_PORT_MIN: u16 = 32000;

/// Number of random draws before giving up on an ephemeral bind.
pub const EPHEMERAL_BIND_ATTEMPTS: usize = 10;

/// The bearer's bound datagram sockets: one IPv4 and, unless disabled, one
/// IPv6, both on the same port.
pub struct BoundSockets {
    pub v4: Option<Arc<tokio::net::UdpSocket>>,
    pub v6: Option<Arc<tokio::net::UdpSocket>>,
    pub port: u16,
}

impl BoundSockets {
    #[inline(always)]
    pub fn for_remote(&self, remote: &SocketAddr) -> Option<&Arc<tokio::net::UdpSocket>> {
        match remote {
            SocketAddr::V4(_) => self.v4.as_ref(),
            SocketAddr::V6(_) => self.v6.as_ref(),
        }
    }

    /// Local addresses to register with the NAT mapper.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        let mut v = Vec::with_capacity(2);
        if let Some(s) = self.v4.as_ref() {
            if let Ok(a) = s.local_addr() {
                v.push(a);
            }
        }
        if let Some(s) = self.v6.as_ref() {
            if let Ok(a) = s.local_addr() {
                v.push(a);
            }
        }
        v
    }
}

fn bind_udp(addr: SocketAddr) -> std::io::Result<tokio::net::UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let s = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    s.set_nonblocking(true)?;
    if addr.is_ipv6() {
        // Dual stack is two sockets here, so the v6 one is v6 only.
        s.set_only_v6(true)?;
    }
    // Ask for large kernel buffers, backing off if the system refuses.
    let mut sz = 1048576;
    while sz >= 65536 {
        if s.set_recv_buffer_size(sz).is_ok() {
            break;
        }
        sz -= 65536;
    }
    let mut sz = 1048576;
    while sz >= 65536 {
        if s.set_send_buffer_size(sz).is_ok() {
            break;
        }
        sz -= 65536;
    }
    s.bind(&addr.into())?;
    tokio::net::UdpSocket::from_std(s.into())
}

fn bind_pair(settings: &XuSettings, port: u16) -> std::io::Result<BoundSockets> {
    let v4_addr = SocketAddr::new(IpAddr::V4(settings.bind_to.unwrap_or(Ipv4Addr::UNSPECIFIED)), port);
    let v4 = bind_udp(v4_addr)?;
    let bound_port = v4.local_addr()?.port();
    let v6 = if settings.disable_v6 {
        None
    } else {
        let v6_addr = SocketAddr::new(IpAddr::V6(settings.bind_to6.unwrap_or(Ipv6Addr::UNSPECIFIED)), bound_port);
        Some(Arc::new(bind_udp(v6_addr)?))
    };
    Ok(BoundSockets { v4: Some(Arc::new(v4)), v6, port: bound_port })
}

/// Bind the bearer's sockets per configuration.
///
/// A configured port of zero draws random ports in the ephemeral range and
/// retries a bounded number of times; a nonzero port binds exactly once and
/// any failure is final.
pub fn bind_sockets(settings: &XuSettings) -> std::io::Result<BoundSockets> {
    if settings.port != 0 {
        return bind_pair(settings, settings.port);
    }
    let mut last_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "no usable ephemeral port");
    for _ in 0..EPHEMERAL_BIND_ATTEMPTS {
        let port: u16 = rand::thread_rng().gen_range(EPHEMERAL_PORT_MIN..=u16::MAX);
        match bind_pair(settings, port) {
            Ok(b) => {
                debug!(port = b.port, "bound ephemeral datagram port");
                return Ok(b);
            }
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ephemeral_bind_lands_in_range() {
        let settings = XuSettings { bind_to: Some(Ipv4Addr::LOCALHOST), disable_v6: true, ..Default::default() };
        let b = bind_sockets(&settings).unwrap();
        assert!(b.port >= EPHEMERAL_PORT_MIN);
        assert!(b.v4.is_some());
        assert!(b.v6.is_none());
    }

    #[tokio::test]
    async fn fixed_port_conflict_fails_hard() {
        let settings = XuSettings { bind_to: Some(Ipv4Addr::LOCALHOST), disable_v6: true, ..Default::default() };
        let first = bind_sockets(&settings).unwrap();
        let settings = XuSettings { port: first.port, ..settings };
        assert!(bind_sockets(&settings).is_err());
    }

    #[tokio::test]
    async fn dual_stack_same_port() {
        let settings = XuSettings {
            bind_to: Some(Ipv4Addr::LOCALHOST),
            bind_to6: Some(Ipv6Addr::LOCALHOST),
            ..Default::default()
        };
        if let Ok(b) = bind_sockets(&settings) {
            let v4 = b.v4.as_ref().unwrap().local_addr().unwrap();
            let v6 = b.v6.as_ref().unwrap().local_addr().unwrap();
            assert_eq!(v4.port(), v6.port());
        }
    }
}
