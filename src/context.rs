//! Context cell (C2)
//!
//! A single-writer / signal-reader lock-free holder of "the application
//! context associated with any stack sample taken now". Updating a
//! reference-counted handle is not atomic by itself, so a reader snapshot
//! mid-update could observe a torn or freed value. The double-buffer plus
//! atomic index makes the update indivisible for readers without locks:
//! the writer always targets the *non-current* slot, then flips the index
//! with a release store; a signal-handler reader loads the index with
//! acquire semantics and only ever touches the slot it names.

use std::cell::UnsafeCell;
use std::sync::atomic::{compiler_fence, AtomicUsize, Ordering};
use std::sync::Arc;

/// A field in a context label set. Mirrors the pprof label encoding rules
/// in the serializer: strings become `str` fields, numbers become `num`
/// fields, anything else is dropped at serialization time.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextField {
  Str(String),
  Num(f64),
}

/// Opaque, cheaply-clonable application context. Carried through a context
/// record from signal-handler capture to pprof label emission.
#[derive(Debug, Default)]
pub struct ContextValue {
  pub fields: Vec<(String, ContextField)>,
}

impl ContextValue {
  pub fn new(fields: Vec<(String, ContextField)>) -> Self {
    Self { fields }
  }
}

pub type Context = Arc<ContextValue>;

struct Holder(UnsafeCell<Option<Context>>);

// SAFETY: access to a `Holder` is only ever through `ContextCell`, which
// restricts writers to the owning thread and readers to that same thread's
// signal handlers; see the module invariant above.
unsafe impl Sync for Holder {}

impl Holder {
  const fn empty() -> Self {
    Holder(UnsafeCell::new(None))
  }
}

pub struct ContextCell {
  slots: [Holder; 2],
  cur: AtomicUsize,
}

impl Default for ContextCell {
  fn default() -> Self {
    Self::new()
  }
}

impl ContextCell {
  pub const fn new() -> Self {
    Self {
      slots: [Holder::empty(), Holder::empty()],
      cur: AtomicUsize::new(0),
    }
  }

  /// Async-signal-safe, wait-free read of the current context. Cloning the
  /// `Arc` is a single atomic increment — no allocation, no blocking — so
  /// it is safe to call from within the SIGPROF handler.
  pub fn get(&self) -> Option<Context> {
    let idx = self.cur.load(Ordering::Acquire);
    // Guards against the compiler reordering this load ahead of the
    // dereference below; the index load above already provides the
    // cross-thread acquire/release pairing with `set`.
    compiler_fence(Ordering::Acquire);
    let slot = unsafe { &*self.slots[idx].0.get() };
    slot.clone()
  }

  /// Writer-only: called from the owning thread, never from a signal
  /// handler. Writes into the slot `cur` does *not* currently name, then
  /// publishes it with a release store. The handler can interleave at any
  /// point in between and will observe either the value in effect before
  /// this call or the value in effect after it, never a partial write.
  pub fn set(&self, value: Option<Context>) {
    let cur = self.cur.load(Ordering::Relaxed);
    let next = 1 - cur;
    unsafe {
      *self.slots[next].0.get() = value;
    }
    compiler_fence(Ordering::Release);
    self.cur.store(next, Ordering::Release);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicBool;
  use std::sync::Barrier;
  use std::thread;

  fn ctx(label: &str) -> Context {
    Arc::new(ContextValue::new(vec![(
      "label".to_string(),
      ContextField::Str(label.to_string()),
    )]))
  }

  #[test]
  fn get_returns_none_initially() {
    let cell = ContextCell::new();
    assert!(cell.get().is_none());
  }

  #[test]
  fn set_then_get_round_trips() {
    let cell = ContextCell::new();
    cell.set(Some(ctx("a")));
    let got = cell.get().unwrap();
    assert_eq!(got.fields[0].0, "label");
  }

  #[test]
  fn alternating_writes_never_observed_torn() {
    // Single-threaded stand-in for the signal-handler interleaving: every
    // read must see a fully-formed value from *some* write, never a mix.
    let cell = ContextCell::new();
    for i in 0..1000 {
      let label = if i % 2 == 0 { "a" } else { "b" };
      cell.set(Some(ctx(label)));
      let got = cell.get().unwrap();
      assert!(got.fields[0].1 == ContextField::Str("a".to_string()) || got.fields[0].1 == ContextField::Str("b".to_string()));
    }
  }

  #[test]
  fn concurrent_writer_and_reader_observe_only_valid_values() {
    let cell = Arc::new(ContextCell::new());
    let stop = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(2));

    let writer_cell = cell.clone();
    let writer_stop = stop.clone();
    let writer_barrier = barrier.clone();
    let writer = thread::spawn(move || {
      writer_barrier.wait();
      let mut i = 0u64;
      while !writer_stop.load(Ordering::Relaxed) {
        let label = if i % 2 == 0 { "a" } else { "b" };
        writer_cell.set(Some(ctx(label)));
        i += 1;
      }
    });

    let reader_cell = cell.clone();
    let reader_barrier = barrier.clone();
    let reader = thread::spawn(move || {
      reader_barrier.wait();
      for _ in 0..200_000 {
        if let Some(v) = reader_cell.get() {
          match &v.fields[0].1 {
            ContextField::Str(s) => assert!(s == "a" || s == "b"),
            _ => panic!("unexpected field kind"),
          }
        }
      }
    });

    reader.join().unwrap();
    stop.store(true, Ordering::Relaxed);
    writer.join().unwrap();
  }
}
