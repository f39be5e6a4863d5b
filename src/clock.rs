//! Monotonic microsecond clock.
//!
//! All scheduling math in the crate is done in microseconds since a
//! process-global epoch taken at first use. Milliseconds appear only at the
//! event-loop timer boundary.

use std::time::Instant;

use once_cell::sync::Lazy;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Microseconds since the process epoch.
#[inline]
pub fn time_us() -> u64 {
    EPOCH.elapsed().as_micros() as u64
}
