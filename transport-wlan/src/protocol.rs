/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use transport_core::identity::{PeerIdentity, PEER_IDENTITY_SIZE};

use crate::crc::{crc16_ccitt, crc32};

/// An application data frame, possibly the product of reassembly.
pub const MESSAGE_TYPE_WLAN_DATA: u16 = 0x0050;

/// One slice of a data frame too large for the link MTU.
pub const MESSAGE_TYPE_WLAN_FRAGMENT: u16 = 0x0051;

/// Selective acknowledgment of one fragment.
pub const MESSAGE_TYPE_WLAN_ACK: u16 = 0x0052;

/// Link MTU, inclusive of all framing this module adds.
pub const WLAN_MTU: usize = 3000;

/// Per-frame cost of the 802.11 LLC/SNAP encapsulation the link driver
/// prepends below us; it comes out of the MTU budget.
pub const LINK_OVERHEAD: usize = 18;

/// `size:u16 | type:u16 | crc:u32 | target: PeerIdentity`.
pub const WLAN_HEADER_SIZE: usize = 8 + PEER_IDENTITY_SIZE;

/// `size:u16 | type:u16 | message_id:u32 | fragment_index:u16 | fragment_crc:u16`.
pub const FRAGMENT_HEADER_SIZE: usize = 12;

/// `size:u16 | type:u16 | message_id:u32 | fragment_index:u16`.
pub const ACK_SIZE: usize = 10;

/// Payload bytes carried by each fragment except possibly the last.
pub const FRAGMENT_SLICE_SIZE: usize = WLAN_MTU - FRAGMENT_HEADER_SIZE - LINK_OVERHEAD;

/// Largest data frame body that still travels unfragmented.
pub const UNFRAGMENTED_BODY_MAX: usize = WLAN_MTU - WLAN_HEADER_SIZE - LINK_OVERHEAD;

/// Number of fragments a serialized data frame of `len` bytes needs.
#[inline(always)]
pub fn fragment_count(len: usize) -> usize {
    (len + FRAGMENT_SLICE_SIZE - 1) / FRAGMENT_SLICE_SIZE
}

/// Build a data frame: wlan header, then the sender identity, then the
/// caller's (already framed) message bytes. The CRC-32 covers everything
/// after the header.
pub fn build_data_frame(sender: &PeerIdentity, target: &PeerIdentity, payload: &[u8]) -> Vec<u8> {
    let body_len = PEER_IDENTITY_SIZE + payload.len();
    let total = WLAN_HEADER_SIZE + body_len;
    debug_assert!(total <= u16::MAX as usize);
    let mut v = Vec::with_capacity(total);
    v.extend_from_slice(&(total as u16).to_be_bytes());
    v.extend_from_slice(&MESSAGE_TYPE_WLAN_DATA.to_be_bytes());
    v.extend_from_slice(&[0u8; 4]); // crc back-filled below
    v.extend_from_slice(target.as_bytes());
    v.extend_from_slice(sender.as_bytes());
    v.extend_from_slice(payload);
    let crc = crc32(&v[WLAN_HEADER_SIZE..]);
    v[4..8].copy_from_slice(&crc.to_be_bytes());
    v
}

/// Parsed view of a verified data frame.
pub struct DataFrame<'a> {
    pub target: PeerIdentity,
    pub sender: PeerIdentity,
    pub payload: &'a [u8],
}

/// Parse and verify a data frame; `None` covers every malformed shape:
/// bad length, wrong type, or CRC mismatch. All drops are silent.
pub fn parse_data_frame(frame: &[u8]) -> Option<DataFrame> {
    if frame.len() < WLAN_HEADER_SIZE + PEER_IDENTITY_SIZE {
        return None;
    }
    let size = u16::from_be_bytes(frame[0..2].try_into().unwrap()) as usize;
    let msg_type = u16::from_be_bytes(frame[2..4].try_into().unwrap());
    if size != frame.len() || msg_type != MESSAGE_TYPE_WLAN_DATA {
        return None;
    }
    let stored_crc = u32::from_be_bytes(frame[4..8].try_into().unwrap());
    if crc32(&frame[WLAN_HEADER_SIZE..]) != stored_crc {
        return None;
    }
    let target = PeerIdentity(frame[8..8 + PEER_IDENTITY_SIZE].try_into().unwrap());
    let sender_at = WLAN_HEADER_SIZE;
    let sender = PeerIdentity(frame[sender_at..sender_at + PEER_IDENTITY_SIZE].try_into().unwrap());
    Some(DataFrame { target, sender, payload: &frame[sender_at + PEER_IDENTITY_SIZE..] })
}

/// Build one fragment carrying `slice` of a larger data frame. The CRC-16
/// covers only the slice.
pub fn build_fragment(message_id: u32, fragment_index: u16, slice: &[u8]) -> Vec<u8> {
    let total = FRAGMENT_HEADER_SIZE + slice.len();
    debug_assert!(slice.len() <= FRAGMENT_SLICE_SIZE);
    let mut v = Vec::with_capacity(total);
    v.extend_from_slice(&(total as u16).to_be_bytes());
    v.extend_from_slice(&MESSAGE_TYPE_WLAN_FRAGMENT.to_be_bytes());
    v.extend_from_slice(&message_id.to_be_bytes());
    v.extend_from_slice(&fragment_index.to_be_bytes());
    v.extend_from_slice(&crc16_ccitt(slice).to_be_bytes());
    v.extend_from_slice(slice);
    v
}

/// Parsed view of a verified fragment.
pub struct Fragment<'a> {
    pub message_id: u32,
    pub fragment_index: u16,
    pub slice: &'a [u8],
}

pub fn parse_fragment(frame: &[u8]) -> Option<Fragment> {
    if frame.len() < FRAGMENT_HEADER_SIZE {
        return None;
    }
    let size = u16::from_be_bytes(frame[0..2].try_into().unwrap()) as usize;
    let msg_type = u16::from_be_bytes(frame[2..4].try_into().unwrap());
    if size != frame.len() || msg_type != MESSAGE_TYPE_WLAN_FRAGMENT {
        return None;
    }
    let message_id = u32::from_be_bytes(frame[4..8].try_into().unwrap());
    let fragment_index = u16::from_be_bytes(frame[8..10].try_into().unwrap());
    let stored_crc = u16::from_be_bytes(frame[10..12].try_into().unwrap());
    let slice = &frame[FRAGMENT_HEADER_SIZE..];
    if crc16_ccitt(slice) != stored_crc {
        return None;
    }
    Some(Fragment { message_id, fragment_index, slice })
}

pub fn build_ack(message_id: u32, fragment_index: u16) -> Vec<u8> {
    let mut v = Vec::with_capacity(ACK_SIZE);
    v.extend_from_slice(&(ACK_SIZE as u16).to_be_bytes());
    v.extend_from_slice(&MESSAGE_TYPE_WLAN_ACK.to_be_bytes());
    v.extend_from_slice(&message_id.to_be_bytes());
    v.extend_from_slice(&fragment_index.to_be_bytes());
    v
}

pub fn parse_ack(frame: &[u8]) -> Option<(u32, u16)> {
    if frame.len() != ACK_SIZE {
        return None;
    }
    let size = u16::from_be_bytes(frame[0..2].try_into().unwrap()) as usize;
    let msg_type = u16::from_be_bytes(frame[2..4].try_into().unwrap());
    if size != frame.len() || msg_type != MESSAGE_TYPE_WLAN_ACK {
        return None;
    }
    Some((
        u32::from_be_bytes(frame[4..8].try_into().unwrap()),
        u16::from_be_bytes(frame[8..10].try_into().unwrap()),
    ))
}

/// The outer type tag of any link frame, used to dispatch on receive.
pub fn frame_type(frame: &[u8]) -> Option<u16> {
    if frame.len() >= 4 {
        Some(u16::from_be_bytes(frame[2..4].try_into().unwrap()))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(fill: u8) -> PeerIdentity {
        PeerIdentity([fill; PEER_IDENTITY_SIZE])
    }

    #[test]
    fn data_frame_round_trip() {
        let frame = build_data_frame(&identity(1), &identity(2), &[5, 6, 7]);
        let parsed = parse_data_frame(frame.as_slice()).unwrap();
        assert_eq!(parsed.sender, identity(1));
        assert_eq!(parsed.target, identity(2));
        assert_eq!(parsed.payload, &[5, 6, 7]);
    }

    #[test]
    fn corrupted_data_frame_dropped() {
        let mut frame = build_data_frame(&identity(1), &identity(2), &[5, 6, 7]);
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert!(parse_data_frame(frame.as_slice()).is_none());
    }

    #[test]
    fn fragment_round_trip_and_crc() {
        let slice = [9u8; 100];
        let frame = build_fragment(0xdeadbeef, 2, &slice);
        let parsed = parse_fragment(frame.as_slice()).unwrap();
        assert_eq!(parsed.message_id, 0xdeadbeef);
        assert_eq!(parsed.fragment_index, 2);
        assert_eq!(parsed.slice, &slice);

        let mut bad = build_fragment(1, 0, &slice);
        bad[FRAGMENT_HEADER_SIZE] ^= 0xff;
        assert!(parse_fragment(bad.as_slice()).is_none());
    }

    #[test]
    fn ack_round_trip() {
        let frame = build_ack(77, 3);
        assert_eq!(parse_ack(frame.as_slice()).unwrap(), (77, 3));
        assert_eq!(frame_type(frame.as_slice()).unwrap(), MESSAGE_TYPE_WLAN_ACK);
        assert!(parse_ack(&frame[0..8]).is_none());
    }

    #[test]
    fn slice_budget_matches_mtu() {
        assert_eq!(FRAGMENT_SLICE_SIZE, 2970);
        // A fully loaded fragment plus link encapsulation exactly fills
        // the MTU.
        let frame = build_fragment(1, 0, &[0u8; FRAGMENT_SLICE_SIZE]);
        assert_eq!(frame.len() + LINK_OVERHEAD, WLAN_MTU);
    }

    #[test]
    fn fragment_count_for_typical_message() {
        // 7500 byte application payload becomes a data frame slightly
        // larger; it still slices into three fragments.
        assert_eq!(fragment_count(7500), 3);
        assert_eq!(fragment_count(FRAGMENT_SLICE_SIZE), 1);
        assert_eq!(fragment_count(FRAGMENT_SLICE_SIZE + 1), 2);
    }
}
