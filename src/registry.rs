//! Profiler registry (C5) and worker CPU accountant (C11)
//!
//! Signal-safe lookup map from thread to profiler instance, published via
//! RCU-style pointer swap so a reader never observes a partially-mutated
//! map. `add`/`remove` serialize against each other under a writer mutex;
//! `get` is wait-free (bounded-retry) and safe to call from a signal
//! handler.

use crate::context::ContextCell;
use crate::context_ring::ContextRing;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicU64, Ordering};

static GLOBAL_REGISTRY: Lazy<ProfilerRegistry> = Lazy::new(ProfilerRegistry::new);

/// The process-wide registry the signal dispatcher (unix) and the wall
/// engine both reach for. Kept here rather than in `signal` so non-unix
/// builds — which never install a SIGPROF action but still need a home for
/// `ProfilerEntry`/worker-CPU bookkeeping — can use it too.
pub fn global_registry() -> &'static ProfilerRegistry {
  &GLOBAL_REGISTRY
}

/// Identifies "the current thread" the way the registry keys profilers.
/// Stable for the thread's lifetime; on unix this must be safe to read from
/// a signal handler running on that same thread.
#[cfg(unix)]
pub fn current_thread_key() -> u64 {
  unsafe { libc::pthread_self() as u64 }
}

#[cfg(windows)]
pub fn current_thread_key() -> u64 {
  unsafe { winapi::um::processthreadsapi::GetCurrentThreadId() as u64 }
}

#[cfg(not(any(unix, windows)))]
pub fn current_thread_key() -> u64 {
  use std::cell::Cell;
  thread_local!(static KEY: Cell<u64> = Cell::new(0));
  static NEXT: AtomicU64 = AtomicU64::new(1);
  KEY.with(|k| {
    if k.get() == 0 {
      k.set(NEXT.fetch_add(1, Ordering::Relaxed));
    }
    k.get()
  })
}

/// Single-byte-sized collection mode, read from the SIGPROF handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectionMode {
  NoCollect = 0,
  PassThrough = 1,
  CollectContexts = 2,
}

impl CollectionMode {
  fn from_u8(v: u8) -> Self {
    match v {
      0 => CollectionMode::NoCollect,
      1 => CollectionMode::PassThrough,
      _ => CollectionMode::CollectContexts,
    }
  }
}

/// Atomic storage for `CollectionMode`.
pub struct AtomicCollectionMode(std::sync::atomic::AtomicU8);

impl AtomicCollectionMode {
  pub fn new(mode: CollectionMode) -> Self {
    Self(std::sync::atomic::AtomicU8::new(mode as u8))
  }

  pub fn load(&self) -> CollectionMode {
    CollectionMode::from_u8(self.0.load(Ordering::Acquire))
  }

  pub fn store(&self, mode: CollectionMode) {
    self.0.store(mode as u8, Ordering::Release);
  }
}

/// Everything the SIGPROF handler needs from a registered profiler. Every
/// method here must be callable from an async-signal-safe context: no
/// allocation, no blocking, no reentrant locking.
pub trait SignalTarget: Send + Sync {
  fn collection_mode(&self) -> CollectionMode;
  fn bump_no_collect_call_count(&self);
  /// Bumped once per signal delivery that actually appends a context
  /// record (i.e. while `CollectContexts`). Distinct from the context
  /// ring's own length: it is not reset by the "swap the ring aside" step
  /// that clears the ring. It *is* zeroed by `start_internal`, including
  /// on a restart — callers that report a finishing round's count (e.g.
  /// `stop`) must snapshot it before that call.
  fn bump_sample_count(&self);
  fn collect_cpu_time(&self) -> bool;
  fn context_cell(&self) -> &ContextCell;
  fn context_ring(&self) -> &ContextRing;
  fn current_async_id(&self) -> Option<f64>;
}

type Map = HashMap<u64, ProfilerEntry>;

struct ProfilerEntry {
  profiler: std::sync::Arc<dyn SignalTarget>,
  is_main_thread: bool,
  #[cfg(unix)]
  owner_thread: libc::pthread_t,
  start_thread_cpu_ns: i64,
}

/// Per-isolate/thread profiler lookup, plus the accumulator the worker CPU
/// accountant (C11) reads from.
pub struct ProfilerRegistry {
  published: AtomicPtr<Map>,
  writer_mutex: Mutex<()>,
  terminated_worker_cpu_ns: AtomicI64,
  terminated_count: AtomicU64,
}

impl Default for ProfilerRegistry {
  fn default() -> Self {
    Self::new()
  }
}

impl ProfilerRegistry {
  pub fn new() -> Self {
    let initial: Box<Map> = Box::new(HashMap::new());
    Self {
      published: AtomicPtr::new(Box::into_raw(initial)),
      writer_mutex: Mutex::new(()),
      terminated_worker_cpu_ns: AtomicI64::new(0),
      terminated_count: AtomicU64::new(0),
    }
  }

  /// Wait-free, async-signal-safe lookup. On the rare occasion a writer or
  /// another reader holds the map at the exact instant this is called, a
  /// bounded number of retries is attempted; if none succeed this returns
  /// `None` rather than spin indefinitely inside a signal handler (the
  /// expected reader frequency is about one per sampling interval per
  /// thread, so sustained contention should not occur in practice).
  pub fn get(&self, thread_id: u64) -> Option<std::sync::Arc<dyn SignalTarget>> {
    for _ in 0..4 {
      let ptr = self.published.swap(ptr::null_mut(), Ordering::AcqRel);
      if ptr.is_null() {
        continue;
      }
      let map = unsafe { &*ptr };
      let result = map.get(&thread_id).map(|e| e.profiler.clone());
      self.published.store(ptr, Ordering::Release);
      return result;
    }
    None
  }

  fn with_writer_lock<R>(&self, f: impl FnOnce(&mut Map) -> R) -> R {
    let _guard = self.writer_mutex.lock();
    let old_ptr = loop {
      let p = self.published.swap(ptr::null_mut(), Ordering::AcqRel);
      if !p.is_null() {
        break p;
      }
      std::hint::spin_loop();
    };
    let mut new_map: Box<Map> = Box::new(unsafe { (*old_ptr).clone_shallow() });
    let result = f(&mut new_map);
    let new_ptr = Box::into_raw(new_map);
    self.published.store(new_ptr, Ordering::Release);
    // Safe to free now: readers that grabbed `old_ptr` already finished and
    // restored it before this writer's swap could have succeeded (the
    // swap above only returns non-null once no reader holds it).
    drop(unsafe { Box::from_raw(old_ptr) });
    result
  }

  #[cfg_attr(not(unix), allow(unused_variables))]
  pub fn add(
    &self,
    thread_id: u64,
    profiler: std::sync::Arc<dyn SignalTarget>,
    is_main_thread: bool,
    start_thread_cpu_ns: i64,
  ) {
    self.with_writer_lock(|map| {
      map.insert(
        thread_id,
        ProfilerEntry {
          profiler,
          is_main_thread,
          #[cfg(unix)]
          owner_thread: unsafe { libc::pthread_self() },
          start_thread_cpu_ns,
        },
      );
    });
  }

  /// Removes a profiler, accumulating its final CPU delta into the worker
  /// accountant if it was not the main thread.
  pub fn remove(&self, thread_id: u64, final_thread_cpu_ns: i64) {
    self.with_writer_lock(|map| {
      if let Some(entry) = map.remove(&thread_id) {
        if !entry.is_main_thread {
          let delta = (final_thread_cpu_ns - entry.start_thread_cpu_ns).max(0);
          self.terminated_worker_cpu_ns.fetch_add(delta, Ordering::Relaxed);
          self.terminated_count.fetch_add(1, Ordering::Relaxed);
        }
      }
    });
  }

  pub fn thread_count(&self) -> usize {
    let ptr = loop {
      let p = self.published.swap(ptr::null_mut(), Ordering::AcqRel);
      if !p.is_null() {
        break p;
      }
      std::hint::spin_loop();
    };
    let len = unsafe { (*ptr).len() };
    self.published.store(ptr, Ordering::Release);
    len
  }

  /// Worker CPU accountant (C11): sums terminated-worker CPU with a fresh
  /// snapshot of every still-running worker's thread CPU, then resets the
  /// terminated accumulator to zero. Must be called under the registry's
  /// own writer serialization so the snapshot and reset are consistent.
  pub fn gather_total_worker_cpu_and_reset(&self) -> i64 {
    self.with_writer_lock(|map| {
      let mut total = self.terminated_worker_cpu_ns.swap(0, Ordering::Relaxed);
      self.terminated_count.store(0, Ordering::Relaxed);
      for entry in map.values() {
        if entry.is_main_thread {
          continue;
        }
        let now = owner_thread_cpu_ns(entry);
        total += (now - entry.start_thread_cpu_ns).max(0);
      }
      total
    })
  }
}

#[cfg(unix)]
fn owner_thread_cpu_ns(entry: &ProfilerEntry) -> i64 {
  unsafe {
    let mut clock_id: libc::clockid_t = 0;
    let rc = libc::pthread_getcpuclockid(entry.owner_thread, &mut clock_id);
    if rc != 0 {
      return entry.start_thread_cpu_ns;
    }
    let mut ts: libc::timespec = std::mem::zeroed();
    if libc::clock_gettime(clock_id, &mut ts) != 0 {
      return entry.start_thread_cpu_ns;
    }
    ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
  }
}

#[cfg(not(unix))]
fn owner_thread_cpu_ns(entry: &ProfilerEntry) -> i64 {
  entry.start_thread_cpu_ns
}

trait ShallowClone {
  fn clone_shallow(&self) -> Self;
}

impl ShallowClone for Map {
  fn clone_shallow(&self) -> Self {
    let mut out = HashMap::with_capacity(self.len());
    for (k, v) in self.iter() {
      out.insert(
        *k,
        ProfilerEntry {
          profiler: v.profiler.clone(),
          is_main_thread: v.is_main_thread,
          #[cfg(unix)]
          owner_thread: v.owner_thread,
          start_thread_cpu_ns: v.start_thread_cpu_ns,
        },
      );
    }
    out
  }
}

impl Drop for ProfilerRegistry {
  fn drop(&mut self) {
    let ptr = self.published.swap(ptr::null_mut(), Ordering::AcqRel);
    if !ptr.is_null() {
      drop(unsafe { Box::from_raw(ptr) });
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::context::ContextCell;
  use crate::context_ring::ContextRing;
  use std::sync::Arc;

  struct FakeTarget {
    mode: AtomicCollectionMode,
    cell: ContextCell,
    ring: ContextRing,
    no_collect_calls: AtomicU64,
    sample_count: AtomicU64,
  }

  impl SignalTarget for FakeTarget {
    fn collection_mode(&self) -> CollectionMode {
      self.mode.load()
    }
    fn bump_no_collect_call_count(&self) {
      self.no_collect_calls.fetch_add(1, Ordering::Relaxed);
    }
    fn bump_sample_count(&self) {
      self.sample_count.fetch_add(1, Ordering::Relaxed);
    }
    fn collect_cpu_time(&self) -> bool {
      false
    }
    fn context_cell(&self) -> &ContextCell {
      &self.cell
    }
    fn context_ring(&self) -> &ContextRing {
      &self.ring
    }
    fn current_async_id(&self) -> Option<f64> {
      None
    }
  }

  fn fake() -> Arc<dyn SignalTarget> {
    Arc::new(FakeTarget {
      mode: AtomicCollectionMode::new(CollectionMode::CollectContexts),
      cell: ContextCell::new(),
      ring: ContextRing::new(8),
      no_collect_calls: AtomicU64::new(0),
      sample_count: AtomicU64::new(0),
    })
  }

  #[test]
  fn add_then_get_resolves() {
    let reg = ProfilerRegistry::new();
    reg.add(1, fake(), true, 0);
    assert!(reg.get(1).is_some());
    assert!(reg.get(2).is_none());
  }

  #[test]
  fn remove_accumulates_worker_cpu_for_non_main_threads() {
    let reg = ProfilerRegistry::new();
    reg.add(7, fake(), false, 1_000);
    reg.remove(7, 5_000);
    assert_eq!(reg.gather_total_worker_cpu_and_reset(), 4_000);
    // Resets after read.
    assert_eq!(reg.gather_total_worker_cpu_and_reset(), 0);
  }

  #[test]
  fn remove_ignores_main_thread_cpu() {
    let reg = ProfilerRegistry::new();
    reg.add(1, fake(), true, 1_000);
    reg.remove(1, 9_000);
    assert_eq!(reg.gather_total_worker_cpu_and_reset(), 0);
  }

  #[test]
  fn publication_is_monotone_under_concurrent_readers() {
    let reg = Arc::new(ProfilerRegistry::new());
    reg.add(1, fake(), true, 0);
    let mut handles = vec![];
    for _ in 0..8 {
      let reg = reg.clone();
      handles.push(std::thread::spawn(move || {
        for _ in 0..1000 {
          let _ = reg.get(1);
        }
      }));
    }
    for h in handles {
      h.join().unwrap();
    }
    assert_eq!(reg.thread_count(), 1);
  }
}
