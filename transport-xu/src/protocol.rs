/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use transport_core::identity::{PeerIdentity, PEER_IDENTITY_SIZE};
use transport_core::tokenizer::MESSAGE_HEADER_SIZE;

/// Message type of a datagram carrying tokenized overlay messages.
pub const MESSAGE_TYPE_XU: u16 = 0x0044;

/// Largest datagram we will send or accept.
pub const DATAGRAM_SIZE_MAX: usize = 65_536;

/// Fixed prefix of every outgoing datagram:
/// `size:u16 | type:u16 | reserved:u32 | sender: PeerIdentity`.
pub const ENVELOPE_SIZE: usize = MESSAGE_HEADER_SIZE + 4 + PEER_IDENTITY_SIZE;

/// Rough IP+UDP header cost added to every IPv4 datagram.
pub const UDP_IPV4_OVERHEAD: usize = 28;

/// Rough IP+UDP header cost added to every IPv6 datagram.
pub const UDP_IPV6_OVERHEAD: usize = 48;

/// Parsed view of an inbound datagram after envelope classification.
pub struct Envelope<'a> {
    pub sender: PeerIdentity,
    pub body: &'a [u8],
}

/// Assemble the full wire datagram for a payload of framed messages.
///
/// Callers guarantee `payload` is small enough; the assembled size always
/// fits the u16 size field because payloads are capped well below it.
pub fn build_datagram(sender: &PeerIdentity, payload: &[u8]) -> Vec<u8> {
    let total = ENVELOPE_SIZE + payload.len();
    debug_assert!(total <= u16::MAX as usize);
    let mut v = Vec::with_capacity(total);
    v.extend_from_slice(&(total as u16).to_be_bytes());
    v.extend_from_slice(&MESSAGE_TYPE_XU.to_be_bytes());
    v.extend_from_slice(&0u32.to_be_bytes());
    v.extend_from_slice(sender.as_bytes());
    v.extend_from_slice(payload);
    v
}

/// Classification of one received datagram.
pub enum Classified<'a> {
    /// A well-formed bearer datagram.
    Message(Envelope<'a>),
    /// Declared size does not match the received length, the type is not
    /// ours, the reserved field is dirty, or the envelope is truncated.
    Malformed,
}

/// Classify a received datagram against the envelope rules.
///
/// STUN traffic never reaches this point; the socket read loop hands those
/// to the NAT module first.
pub fn classify(data: &[u8]) -> Classified {
    if data.len() < ENVELOPE_SIZE {
        return Classified::Malformed;
    }
    let size = u16::from_be_bytes(data[0..2].try_into().unwrap()) as usize;
    if size != data.len() {
        return Classified::Malformed;
    }
    let msg_type = u16::from_be_bytes(data[2..4].try_into().unwrap());
    if msg_type != MESSAGE_TYPE_XU {
        return Classified::Malformed;
    }
    let reserved = u32::from_be_bytes(data[4..8].try_into().unwrap());
    if reserved != 0 {
        return Classified::Malformed;
    }
    let sender = PeerIdentity(data[8..8 + PEER_IDENTITY_SIZE].try_into().unwrap());
    Classified::Message(Envelope { sender, body: &data[ENVELOPE_SIZE..] })
}
