/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Core of the pluggable peer-to-peer transport layer: the capability
//! contract every bearer plugin implements, the opaque peer identity and
//! address model, the shared stream tokenizer, and PING/PONG address
//! validation. Concrete bearers live in sibling crates.

pub mod address;
pub mod error;
pub mod identity;
pub mod plugin;
pub mod tokenizer;
pub mod util;
pub mod validation;

pub use address::{Address, MacAddress, NetworkScope, OriginHint, WlanAddress, XuAddress};
pub use identity::{PeerIdentity, PEER_IDENTITY_SIZE};
pub use plugin::{
    ErasedPlugin, Overlay, Plugin, PluginEnvironment, PluginTable, PrettyPrintSink, Resolver, SendContinuation,
    SendStatus, SessionInfo, SessionMonitor, SessionState, SignatureProvider, StatisticsSink,
};
pub use tokenizer::{frame_message, StreamTokenizer};
pub use validation::{AddressBook, AddressValidator, ValidationSettings};
