/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::sync::atomic::{AtomicI64, Ordering};

/// Admission latch for work that repeats but must not run more than once
/// per interval: throttled warning output, periodic sweeps.
///
/// Holds the monotonic tick at which admission next opens. The first call
/// is always admitted; claiming the slot goes through a compare-exchange,
/// so when several tasks race on the same tick exactly one wins the
/// interval.
pub struct Throttle {
    interval_ms: i64,
    next_open: AtomicI64,
}

impl Throttle {
    pub const fn new(interval_ms: i64) -> Self {
        Self { interval_ms, next_open: AtomicI64::new(i64::MIN) }
    }

    /// Try to claim this interval's slot at tick `now`.
    pub fn admit(&self, now: i64) -> bool {
        let open = self.next_open.load(Ordering::Acquire);
        if now < open {
            return false;
        }
        self.next_open
            .compare_exchange(open, now.saturating_add(self.interval_ms), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Re-open immediately. Called when the throttled condition clears, so
    /// its next occurrence is reported without waiting out the interval.
    pub fn reset(&self) {
        self.next_open.store(i64::MIN, Ordering::Release);
    }
}
