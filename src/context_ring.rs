//! Context ring (C3)
//!
//! A preallocated, fixed-capacity FIFO appended to only from the SIGPROF
//! handler and drained only outside any signal context. Capacity is sized
//! once at profiler construction (`ceil(2 * duration / interval)`) so the
//! signal path never reallocates; a push past capacity is dropped and
//! counted rather than blocking or growing.

use crate::context::Context;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One signal-captured (context, timing) record. Immutable after insert.
#[derive(Debug, Clone)]
pub struct ContextRecord {
  pub context: Option<Context>,
  pub t_from: i64,
  pub t_to: i64,
  pub cpu_time: Option<i64>,
  pub async_id: Option<f64>,
}

/// Sizes the ring to comfortably hold twice the expected sample count, so
/// a profile running somewhat long or a reconciler needing slack for
/// reordering never starves for slots.
pub fn ring_capacity(duration_us: i64, interval_us: i64) -> usize {
  if interval_us <= 0 {
    return 1;
  }
  let samples = (2 * duration_us + interval_us - 1) / interval_us;
  samples.max(1) as usize
}

pub struct ContextRing {
  capacity: usize,
  // parking_lot's mutex never touches the OS in the uncontended case and
  // carries no poisoning state to unwrap, which matters on the signal
  // path: push is try_lock and drops the record on contention, matching
  // the "allocation is not permitted on this path" rule — try_lock plus a
  // fixed-size append never allocates and never sleeps.
  buf: Mutex<Vec<ContextRecord>>,
  overflow: AtomicUsize,
}

impl ContextRing {
  pub fn new(capacity: usize) -> Self {
    Self {
      capacity,
      buf: Mutex::new(Vec::with_capacity(capacity)),
      overflow: AtomicUsize::new(0),
    }
  }

  /// Signal-handler-only. Never allocates: the backing `Vec` was already
  /// reserved to `capacity` at construction, so a push within capacity is
  /// a plain write to existing storage.
  pub fn push(&self, record: ContextRecord) {
    match self.buf.try_lock() {
      Some(mut buf) => {
        if buf.len() < self.capacity {
          buf.push(record);
        } else {
          self.overflow.fetch_add(1, Ordering::Relaxed);
        }
      }
      None => {
        // The only other accessor, `drain`, only runs once the engine has
        // forced the collection mode to `NoCollect` and waited for the
        // handler to observe it, so real contention here should never
        // happen; if it does, count it the same as an overflow rather than
        // blocking the signal path.
        self.overflow.fetch_add(1, Ordering::Relaxed);
      }
    }
  }

  /// Swaps the backing vector with a fresh, same-capacity one. Must only be
  /// called outside any signal context (i.e. after the collection mode has
  /// been forced to `NoCollect` and the ordering barrier in `wall::stop`
  /// has elapsed).
  pub fn drain(&self) -> Vec<ContextRecord> {
    let mut buf = self.buf.lock();
    std::mem::replace(&mut buf, Vec::with_capacity(self.capacity))
  }

  pub fn overflow_count(&self) -> usize {
    self.overflow.load(Ordering::Relaxed)
  }

  /// Non-draining peek at the current record count, for live `state()`
  /// introspection. Takes the same lock as `push`, so calling this from a
  /// signal handler is not safe; owning-thread callers only.
  pub fn len(&self) -> usize {
    self.buf.lock().len()
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(t: i64) -> ContextRecord {
    ContextRecord {
      context: None,
      t_from: t,
      t_to: t + 1,
      cpu_time: None,
      async_id: None,
    }
  }

  #[test]
  fn capacity_rounds_up() {
    assert_eq!(ring_capacity(1000, 1000), 2);
    assert_eq!(ring_capacity(500_000, 1000), 1000);
    assert_eq!(ring_capacity(1_500, 1000), 3);
  }

  #[test]
  fn push_past_capacity_increments_overflow() {
    let ring = ContextRing::new(2);
    ring.push(record(0));
    ring.push(record(1));
    ring.push(record(2));
    assert_eq!(ring.overflow_count(), 1);
    let drained = ring.drain();
    assert_eq!(drained.len(), 2);
  }

  #[test]
  fn drain_resets_ring_for_reuse() {
    let ring = ContextRing::new(4);
    ring.push(record(0));
    let first = ring.drain();
    assert_eq!(first.len(), 1);
    assert!(ring.drain().is_empty());
    ring.push(record(1));
    assert_eq!(ring.drain().len(), 1);
  }
}
