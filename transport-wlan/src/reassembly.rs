/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use transport_core::address::MacAddress;

use crate::protocol::{fragment_count, FRAGMENT_SLICE_SIZE};

/// Partial messages older than this are discarded.
pub const REASSEMBLY_EXPIRATION_MS: i64 = 30_000;

/// Cap on concurrently reassembling messages per source station, to bound
/// memory against hostile senders.
const MAX_PARTIALS_PER_SOURCE: usize = 16;

struct Partial {
    slices: BTreeMap<u16, Vec<u8>>,
    /// Total serialized frame length, learned from fragment 0's size field.
    total_len: Option<usize>,
    ts: i64,
}

impl Partial {
    fn is_complete(&self) -> bool {
        match self.total_len {
            Some(total) => {
                let needed = fragment_count(total);
                self.slices.len() == needed && self.slices.values().map(|s| s.len()).sum::<usize>() == total
            }
            None => false,
        }
    }

    fn assemble(mut self) -> Vec<u8> {
        let total = self.total_len.unwrap_or(0);
        let mut frame = Vec::with_capacity(total);
        for (_, mut slice) in std::mem::take(&mut self.slices) {
            frame.append(&mut slice);
        }
        frame
    }
}

/// Receive-side fragment accumulator keyed by `(source station, message id)`.
///
/// Slices collect until every index of the original frame is present, then
/// the whole frame pops out exactly once. Duplicates are ignored; partial
/// state expires on a timer and is bounded per source.
#[derive(Default)]
pub struct ReassemblyBuffer {
    partials: Mutex<HashMap<(MacAddress, u32), Partial>>,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one verified fragment slice. Returns the reassembled frame when
    /// this slice completes it.
    pub fn add_fragment(&self, source: MacAddress, message_id: u32, index: u16, slice: &[u8], now: i64) -> Option<Vec<u8>> {
        let mut partials = self.partials.lock();

        // Bound state per station: when a source floods us with partial
        // messages, drop its oldest third.
        let from_source = partials.keys().filter(|(mac, _)| *mac == source).count();
        if from_source > MAX_PARTIALS_PER_SOURCE {
            let mut oldest: Vec<(i64, (MacAddress, u32))> = partials
                .iter()
                .filter(|((mac, _), _)| *mac == source)
                .map(|(k, p)| (p.ts, *k))
                .collect();
            oldest.sort_unstable_by(|a, b| a.0.cmp(&b.0));
            for (_, k) in oldest.iter().take(from_source / 3) {
                partials.remove(k);
            }
        }

        let partial = partials.entry((source, message_id)).or_insert_with(|| Partial {
            slices: BTreeMap::new(),
            total_len: None,
            ts: now,
        });

        if partial.slices.contains_key(&index) {
            return None;
        }
        if index == 0 {
            if slice.len() >= 2 {
                partial.total_len = Some(u16::from_be_bytes(slice[0..2].try_into().unwrap()) as usize);
            } else {
                return None;
            }
        }
        if let Some(total) = partial.total_len {
            // Index must fall inside the frame, and every slice except the
            // last must be full sized.
            let needed = fragment_count(total);
            if (index as usize) >= needed {
                return None;
            }
            let expected = if (index as usize) == needed - 1 { total - (needed - 1) * FRAGMENT_SLICE_SIZE } else { FRAGMENT_SLICE_SIZE };
            if slice.len() != expected {
                return None;
            }
        } else if slice.len() != FRAGMENT_SLICE_SIZE {
            // Before fragment 0 arrives only full slices are plausible.
            return None;
        }

        partial.slices.insert(index, slice.to_vec());
        if partial.is_complete() {
            partials.remove(&(source, message_id)).map(Partial::assemble)
        } else {
            None
        }
    }

    /// Drop partial messages that have been sitting too long.
    pub fn service(&self, now: i64) {
        self.partials.lock().retain(|_, p| (now - p.ts) < REASSEMBLY_EXPIRATION_MS);
    }

    pub fn len(&self) -> usize {
        self.partials.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.partials.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(n: u8) -> MacAddress {
        MacAddress([2, 0, 0, 0, 0, n])
    }

    /// A fake serialized frame: size field up front, then filler.
    fn frame(total: usize) -> Vec<u8> {
        let mut f = vec![0x55u8; total];
        f[0..2].copy_from_slice(&(total as u16).to_be_bytes());
        f
    }

    fn slices(frame: &[u8]) -> Vec<&[u8]> {
        frame.chunks(FRAGMENT_SLICE_SIZE).collect()
    }

    #[test]
    fn in_order_reassembly() {
        let r = ReassemblyBuffer::new();
        let f = frame(7572);
        let parts = slices(f.as_slice());
        assert_eq!(parts.len(), 3);
        assert!(r.add_fragment(mac(1), 7, 0, parts[0], 0).is_none());
        assert!(r.add_fragment(mac(1), 7, 1, parts[1], 0).is_none());
        let out = r.add_fragment(mac(1), 7, 2, parts[2], 0).unwrap();
        assert_eq!(out, f);
        assert!(r.is_empty());
    }

    #[test]
    fn out_of_order_and_duplicates() {
        let r = ReassemblyBuffer::new();
        let f = frame(7572);
        let parts = slices(f.as_slice());
        assert!(r.add_fragment(mac(1), 7, 2, parts[2], 0).is_none());
        assert!(r.add_fragment(mac(1), 7, 2, parts[2], 0).is_none());
        assert!(r.add_fragment(mac(1), 7, 0, parts[0], 0).is_none());
        assert!(r.add_fragment(mac(1), 7, 0, parts[0], 0).is_none());
        let out = r.add_fragment(mac(1), 7, 1, parts[1], 0).unwrap();
        assert_eq!(out, f);
    }

    #[test]
    fn streams_with_same_id_from_different_sources_stay_apart() {
        let r = ReassemblyBuffer::new();
        let f = frame(7572);
        let parts = slices(f.as_slice());
        assert!(r.add_fragment(mac(1), 7, 0, parts[0], 0).is_none());
        assert!(r.add_fragment(mac(2), 7, 1, parts[1], 0).is_none());
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn wrong_size_slices_rejected() {
        let r = ReassemblyBuffer::new();
        let f = frame(7572);
        let parts = slices(f.as_slice());
        // A truncated middle slice never pollutes the buffer.
        assert!(r.add_fragment(mac(1), 7, 0, parts[0], 0).is_none());
        assert!(r.add_fragment(mac(1), 7, 1, &parts[1][0..100], 0).is_none());
        assert!(r.add_fragment(mac(1), 7, 1, parts[1], 0).is_none());
        assert!(r.add_fragment(mac(1), 7, 2, parts[2], 0).is_some());
    }

    #[test]
    fn index_beyond_frame_rejected() {
        let r = ReassemblyBuffer::new();
        let f = frame(7572);
        let parts = slices(f.as_slice());
        assert!(r.add_fragment(mac(1), 7, 0, parts[0], 0).is_none());
        assert!(r.add_fragment(mac(1), 7, 9, parts[1], 0).is_none());
    }

    #[test]
    fn stale_partials_expire() {
        let r = ReassemblyBuffer::new();
        let f = frame(7572);
        let parts = slices(f.as_slice());
        assert!(r.add_fragment(mac(1), 7, 0, parts[0], 0).is_none());
        r.service(REASSEMBLY_EXPIRATION_MS);
        assert!(r.is_empty());
    }
}
