//! Reconciliation of the wrapping hardware timer with a monotonic extended
//! time base.
//!
//! The radio timer is a free-running 32-bit counter that wraps silently.
//! [`TimeBase::check_wrap`] must be called periodically while the radio is
//! powered, at an interval well below the wrap period, so that every wrap is
//! observed. Hardware-captured timestamps are then widened with
//! [`TimeBase::reconcile`], which disambiguates "stamped just before the
//! wrap" from "stamped just after" through a guard window.
//!
//! Known limitation: reconciling a stamp captured before a radio power cycle
//! yields a stale result. `check_wrap` is a no-op while unpowered, so the
//! wrap counter simply stops tracking; callers must not hold timestamps
//! across a power cycle.

use crate::types::{ExtTicks, RawTicks};

/// Counter range, one full wrap period in ticks.
pub const RANGE: ExtTicks = 1 << 32;
/// Raw values at or above this are "in the top quarter of the range".
const TOP_QUARTER: RawTicks = 0xC000_0000;

pub struct TimeBase {
    last_sample: RawTicks,
    wrap_count: u32,
    /// Extended time at which the last wrap was detected.
    last_wrap_at: ExtTicks,
    /// Width of the post-wrap correction window, in ticks.
    guard: ExtTicks,
    /// Backwards jitter tolerated before a smaller sample counts as a wrap.
    debounce: RawTicks,
    initialized: bool,
}

impl TimeBase {
    pub const fn new(guard: ExtTicks, debounce: RawTicks) -> Self {
        Self {
            last_sample: 0,
            wrap_count: 0,
            last_wrap_at: 0,
            guard,
            debounce,
            initialized: false,
        }
    }

    /// Feed a fresh counter sample. Call with `powered = false` turns this
    /// into a no-op; sampling an unpowered radio timer reads garbage.
    pub fn check_wrap(&mut self, sample: RawTicks, powered: bool) {
        if !powered {
            return;
        }
        if !self.initialized {
            self.initialized = true;
            self.last_sample = sample;
            return;
        }
        if sample < self.last_sample.saturating_sub(self.debounce) {
            self.wrap_count = self.wrap_count.wrapping_add(1);
            self.last_wrap_at = (self.wrap_count as ExtTicks) * RANGE + sample as ExtTicks;
            debug!("timer wrap {}, at {}", self.wrap_count, self.last_wrap_at);
        }
        self.last_sample = sample;
    }

    /// Extended value of a current counter read. Tolerates one not-yet-fed
    /// wrap between `check_wrap` calls.
    pub fn extended_now(&self, sample: RawTicks) -> ExtTicks {
        let mut wraps = self.wrap_count as ExtTicks;
        if sample < self.last_sample.saturating_sub(self.debounce) {
            wraps += 1;
        }
        wraps * RANGE + sample as ExtTicks
    }

    /// Widen a hardware-captured timestamp taken at an earlier, unspecified
    /// time. `now` is a current raw counter read.
    ///
    /// A stamp in the top quarter of the range while we are still inside the
    /// guard window after a wrap was almost certainly captured before that
    /// wrap, so one wrap period is subtracted.
    pub fn reconcile(&self, stamp: RawTicks, now: RawTicks) -> ExtTicks {
        let mut wraps = self.wrap_count as ExtTicks;
        if stamp >= TOP_QUARTER
            && self.wrap_count > 0
            && self.extended_now(now) < self.last_wrap_at + self.guard
        {
            wraps -= 1;
        }
        wraps * RANGE + stamp as ExtTicks
    }
}
