/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The 802.11 bearer: overlay messages over raw radio frames behind the
//! uniform plugin capability set. Messages above the link MTU pass through
//! a fragmentation stage with selective per-fragment acknowledgment,
//! bounded in-flight admission, and fair scheduling across sessions; the
//! receive side reassembles and delivers each message exactly once.

pub mod crc;
pub mod fragment;
pub mod link;
pub mod plugin;
pub mod protocol;
pub mod reassembly;
pub mod session;

pub use fragment::{FragmentEngine, FRAGMENT_QUEUE_SIZE, FRAGMENT_TIMEOUT_MS};
pub use link::{ChannelLink, WlanLink};
pub use plugin::WlanPlugin;
pub use reassembly::ReassemblyBuffer;
pub use session::WlanSession;
