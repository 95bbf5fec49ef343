//! Epoch calibrator (C10)
//!
//! Produces a (monotonic-clock → Unix-epoch) offset so absolute
//! timestamps can be embedded in per-sample labels even though `now_us`
//! itself is process-relative monotonic time, not wall-clock time.

use crate::clock::now_us;
use std::time::{SystemTime, UNIX_EPOCH};

fn system_epoch_us() -> i64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_micros() as i64)
    .unwrap_or(0)
}

/// Branchless midpoint of two timestamps taken around an epoch read,
/// robust to `a`/`b` differing by an odd number of microseconds.
fn midpoint(a: i64, b: i64) -> i64 {
  a + ((b - a) >> 1)
}

/// Samples up to 20 (a, epoch, b) triples and keeps the one with the
/// smallest `b - a` uncertainty window, returning `epoch - midpoint(a, b)`
/// as the offset to add to any `now_us()` reading to get epoch
/// microseconds. Breaks early if a triple with zero uncertainty is found.
pub fn v8_to_epoch_offset() -> i64 {
  let mut best_offset = 0i64;
  let mut best_uncertainty = i64::MAX;

  for _ in 0..20 {
    let a = now_us();
    let e = system_epoch_us();
    let b = now_us();
    let uncertainty = b - a;

    if uncertainty < best_uncertainty {
      best_uncertainty = uncertainty;
      best_offset = e - midpoint(a, b);
    }

    if b == a {
      break;
    }
  }

  best_offset
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn offset_converts_now_us_close_to_wall_clock() {
    let offset = v8_to_epoch_offset();
    let epoch_estimate = now_us() + offset;
    let actual = system_epoch_us();
    assert!((epoch_estimate - actual).abs() < 50_000, "offset drifted too far");
  }

  #[test]
  fn midpoint_is_branchless_and_correct() {
    assert_eq!(midpoint(10, 20), 15);
    assert_eq!(midpoint(10, 11), 10);
    assert_eq!(midpoint(-10, 10), 0);
  }
}
