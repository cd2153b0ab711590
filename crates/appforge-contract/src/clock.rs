//! Monotonic event clock.
//!
//! Event ordering within a session relies on non-decreasing timestamps from
//! a single producer. The wall clock can step backwards (NTP); this guard
//! never does.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LAST: AtomicU64 = AtomicU64::new(0);

/// Current Unix time in seconds as `f64`, strictly increasing within this
/// process. When the wall clock has not advanced past the previous reading,
/// the next representable float above it is used, so a resume watermark of
/// "last seen timestamp" never straddles two events.
pub fn monotonic_now() -> f64 {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);

    let mut prev = LAST.load(Ordering::Acquire);
    loop {
        let prev_val = f64::from_bits(prev);
        let candidate = if wall > prev_val {
            wall
        } else {
            // Next float above prev_val; bit increment is exact for
            // positive finite values.
            f64::from_bits(prev + 1)
        };
        match LAST.compare_exchange_weak(
            prev,
            candidate.to_bits(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return candidate,
            Err(actual) => prev = actual,
        }
    }
}
