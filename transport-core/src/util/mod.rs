/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod buffer;
pub mod throttle;

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

lazy_static::lazy_static! {
    static ref MONOTONIC_BASE: Instant = Instant::now();
}

/// Monotonic time in milliseconds since an arbitrary process-local epoch.
///
/// All deadlines and intervals in this crate family are carried as these
/// i64 millisecond ticks. They never go backwards.
#[inline(always)]
pub fn ms_monotonic() -> i64 {
    Instant::now().duration_since(*MONOTONIC_BASE).as_millis() as i64
}

/// Wall clock time in milliseconds since the Unix epoch.
#[inline(always)]
pub fn ms_since_epoch() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis() as i64)
}

#[inline(always)]
pub fn duration_from_ticks(ticks: i64) -> Duration {
    Duration::from_millis(ticks.max(0) as u64)
}

const HEX_CHARS: [u8; 16] = *b"0123456789abcdef";

/// Encode a byte slice as lowercase hex.
pub fn to_hex(b: &[u8]) -> String {
    let mut s = String::with_capacity(b.len() * 2);
    for x in b.iter() {
        s.push(HEX_CHARS[(x >> 4) as usize] as char);
        s.push(HEX_CHARS[(x & 0x0f) as usize] as char);
    }
    s
}

/// Decode lowercase or uppercase hex into bytes, ignoring nothing.
pub fn from_hex(s: &str) -> Option<Vec<u8>> {
    if (s.len() & 1) != 0 {
        return None;
    }
    let mut v = Vec::with_capacity(s.len() / 2);
    let b = s.as_bytes();
    let mut i = 0;
    while i < b.len() {
        let hi = (b[i] as char).to_digit(16)?;
        let lo = (b[i + 1] as char).to_digit(16)?;
        v.push(((hi << 4) | lo) as u8);
        i += 2;
    }
    Some(v)
}
