/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The datagram bearer ("XU"): lossy UDP-like transport behind the uniform
//! plugin capability set. Sessions are keyed by `(peer, remote address)`,
//! datagrams share their sockets with a STUN side channel, and public
//! address discovery arrives from an external NAT mapper.

pub mod nat;
pub mod plugin;
pub mod protocol;
pub mod session;
pub mod settings;
pub mod sys;

pub use nat::{AddressClass, LocalNatMapper, NatEvent, NatMapper};
pub use plugin::XuPlugin;
pub use session::XuSession;
pub use settings::XuSettings;
