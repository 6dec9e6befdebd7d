/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use transport_core::error::InvalidParameterError;

/// Configuration of the datagram bearer.
///
/// Mirrors the configuration keys `transport-xu.PORT`,
/// `transport-xu.ADVERTISED_PORT`, `transport-xu.BINDTO`,
/// `transport-xu.BINDTO6` and `nat.DISABLEV6`; how the file they live in is
/// parsed is someone else's problem.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XuSettings {
    /// UDP port to bind; 0 draws an ephemeral port.
    pub port: u16,
    /// Port advertised to peers when it differs from the bound one
    /// (port-forwarded NATs). Defaults to the bound port.
    pub advertised_port: Option<u16>,
    /// IPv4 bind address; unspecified binds the wildcard.
    pub bind_to: Option<Ipv4Addr>,
    /// IPv6 bind address; unspecified binds the wildcard.
    pub bind_to6: Option<Ipv6Addr>,
    /// Disable the IPv6 socket entirely.
    pub disable_v6: bool,
    /// Opaque option bits advertised in this host's own addresses.
    pub my_options: u32,
}

impl Default for XuSettings {
    fn default() -> Self {
        Self {
            port: 0,
            advertised_port: None,
            bind_to: None,
            bind_to6: None,
            disable_v6: false,
            my_options: 0,
        }
    }
}

impl XuSettings {
    /// Reject combinations that cannot be satisfied. Called at plugin init;
    /// failure means the bearer is treated as absent.
    pub fn validate(&self) -> Result<(), InvalidParameterError> {
        if self.disable_v6 && self.bind_to6.is_some() {
            return Err(InvalidParameterError("BINDTO6 given but IPv6 is disabled"));
        }
        if self.advertised_port == Some(0) {
            return Err(InvalidParameterError("ADVERTISED_PORT must not be zero"));
        }
        Ok(())
    }

    #[inline(always)]
    pub fn advertised_port_or(&self, bound: u16) -> u16 {
        self.advertised_port.unwrap_or(bound)
    }
}
