//! Wall engine (C6)
//!
//! The hard core: drives the host's CPU profiler through a rotating-title
//! start/stop protocol, bridges it to the signal dispatcher (C4) for
//! context collection, and reconciles (C7) the two into a pprof-ready tree.

pub mod reconciler;

use crate::clock;
use crate::context::{Context, ContextCell};
use crate::context_ring::{ring_capacity, ContextRing};
use crate::error::{ProfilerError, ProfilerResult};
use crate::host::CpuProfilerHost;
use crate::platform;
use crate::registry::{AtomicCollectionMode, CollectionMode, SignalTarget};
use crate::signal;
use reconciler::ReconciledNode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fixed at construction; rejected combinations are caught by [`validate`]
/// before a `WallProfiler` is ever created.
#[derive(Debug, Clone)]
pub struct WallProfilerConfig {
  pub interval_us: u64,
  pub duration_us: u64,
  pub include_lines: bool,
  pub with_contexts: bool,
  pub workaround_v8_bug: bool,
  pub collect_cpu_time: bool,
  pub is_main_thread: bool,
}

impl WallProfilerConfig {
  fn validate(&self) -> ProfilerResult<()> {
    if self.collect_cpu_time && !self.with_contexts {
      return Err(ProfilerError::IncompatibleConfig("cpu_without_contexts"));
    }
    if self.include_lines && self.with_contexts {
      return Err(ProfilerError::IncompatibleConfig("lines_with_contexts"));
    }
    if self.with_contexts && !platform::supports_sigprof() {
      return Err(ProfilerError::IncompatibleConfig("contexts_unsupported_on_platform"));
    }
    if self.workaround_v8_bug && !platform::supports_sigprof() {
      return Err(ProfilerError::IncompatibleConfig("contexts_unsupported_on_platform"));
    }
    Ok(())
  }
}

/// Snapshot returned by `stop()`, ready to be handed to the pprof
/// serializer. `stuck_level` is also mirrored onto the profiler itself
/// (`last_stuck_level()`) so a caller that discards the profile can still
/// observe it, per the supplemented-feature note in the expanded spec.
#[derive(Debug)]
pub struct TimeProfile {
  pub root: ReconciledNode,
  pub interval_ns: i64,
  pub duration_ns: i64,
  pub has_cpu_time: bool,
  pub non_js_cpu_ns: Option<i64>,
  pub stuck_level: u8,
  pub sample_count: u64,
  pub overflow_count: u64,
}

/// Live introspection surface for `wall.get_state`.
#[derive(Debug, Clone, Copy)]
pub struct WallProfilerState {
  pub sample_count: u64,
  pub overflow_count: u64,
}

#[derive(Default)]
struct EngineState {
  running: bool,
  profile_idx: u32,
  current_title: String,
  start_thread_cpu_ns: i64,
  start_process_cpu_ns: i64,
  last_stuck_level: u8,
}

struct Inner {
  config: WallProfilerConfig,
  host: Arc<dyn CpuProfilerHost>,
  mode: AtomicCollectionMode,
  cell: ContextCell,
  ring: ContextRing,
  no_collect_calls: AtomicU64,
  sample_count: AtomicU64,
  state: Mutex<EngineState>,
}

impl SignalTarget for Inner {
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
    self.config.collect_cpu_time
  }
  fn context_cell(&self) -> &ContextCell {
    &self.cell
  }
  fn context_ring(&self) -> &ContextRing {
    &self.ring
  }
  fn current_async_id(&self) -> Option<f64> {
    self.host.current_async_id()
  }
}

/// Busy-waits for `now_us()` to advance by at least one tick, the
/// timestamp-ordering barrier §5 calls out: not a general wait primitive,
/// just enough to guarantee no subsequently-appended record can carry a
/// timestamp predating a just-published mode change.
fn wait_for_clock_tick() {
  let t0 = clock::now_us();
  while clock::now_us() == t0 {
    std::hint::spin_loop();
  }
}

/// Cheaply-clonable handle to a wall profiler. Internally an `Arc` so the
/// same instance can be registered into the signal-handler registry
/// (`Arc<dyn SignalTarget>`) while callers hold their own handle.
#[derive(Clone)]
pub struct WallProfiler(Arc<Inner>);

impl WallProfiler {
  pub fn new(config: WallProfilerConfig, host: Arc<dyn CpuProfilerHost>) -> ProfilerResult<Self> {
    config.validate()?;
    let capacity = ring_capacity(config.duration_us as i64, config.interval_us as i64);
    let inner = Arc::new(Inner {
      config,
      host,
      mode: AtomicCollectionMode::new(CollectionMode::NoCollect),
      cell: ContextCell::new(),
      ring: ContextRing::new(capacity),
      no_collect_calls: AtomicU64::new(0),
      sample_count: AtomicU64::new(0),
      state: Mutex::new(EngineState::default()),
    });
    Ok(Self(inner))
  }

  #[tracing::instrument(skip(self), fields(interval_us = self.0.config.interval_us))]
  pub fn start(&self) -> ProfilerResult<()> {
    let mut state = self.0.state.lock().unwrap();
    if state.running {
      return Err(ProfilerError::AlreadyStarted);
    }
    state.profile_idx = 0;
    self.start_internal(&mut state)?;

    let mode = if self.0.config.with_contexts {
      CollectionMode::CollectContexts
    } else if self.0.config.workaround_v8_bug {
      CollectionMode::PassThrough
    } else {
      CollectionMode::NoCollect
    };
    self.0.mode.store(mode);
    state.running = true;
    log::info!(
      "wall profiler started: interval_us={} with_contexts={} workaround_v8_bug={}",
      self.0.config.interval_us,
      self.0.config.with_contexts,
      self.0.config.workaround_v8_bug
    );
    Ok(())
  }

  /// §4.6 `start_internal`: opens a fresh host profiling round under a
  /// rotating title, and — if signal delivery is needed — installs the
  /// dispatcher and resets the per-round counters (`no_collect_calls`,
  /// `sample_count`). On the restart path this happens *before* the
  /// finishing round's profile is built, so callers that need that
  /// round's `sample_count` must snapshot it beforehand (`stop` does).
  fn start_internal(&self, state: &mut EngineState) -> ProfilerResult<()> {
    let title = format!("pprof-{}", state.profile_idx % 2);
    self.0.host.start_profiling(&title, self.0.config.include_lines)?;
    state.current_title = title;

    if self.0.config.with_contexts || self.0.config.workaround_v8_bug {
      signal::increase_use()?;
      self.0.no_collect_calls.store(0, Ordering::SeqCst);
      self.0.sample_count.store(0, Ordering::SeqCst);
      let start_cpu = clock::thread_cpu_ns().unwrap_or(0);
      signal::global_registry().add(signal::current_thread_key(), self.0.clone(), self.0.config.is_main_thread, start_cpu);
    }

    if self.0.config.collect_cpu_time {
      state.start_thread_cpu_ns = clock::thread_cpu_ns().unwrap_or(0);
      state.start_process_cpu_ns = clock::process_cpu_ns();
    }

    // Stuck-loop detection is only meaningful when the workaround protocol
    // isn't already handling it via waitForSignal sequencing.
    if !self.0.config.workaround_v8_bug {
      self.0.host.collect_sample();
      self.0.host.collect_sample();
    }

    state.profile_idx += 1;
    Ok(())
  }

  pub fn set_context(&self, ctx: Option<Context>) {
    self.0.cell.set(ctx);
  }

  pub fn get_context(&self) -> Option<Context> {
    self.0.cell.get()
  }

  pub fn state(&self) -> WallProfilerState {
    WallProfilerState {
      sample_count: self.0.ring.len() as u64,
      overflow_count: self.0.ring.overflow_count() as u64,
    }
  }

  pub fn last_stuck_level(&self) -> u8 {
    self.0.state.lock().unwrap().last_stuck_level
  }

  /// `waitForSignal(target)`: returns immediately if already observed,
  /// otherwise sleeps up to `2 * interval_us`, polling the counter the
  /// signal handler bumps in `NoCollect` mode.
  fn wait_for_signal(&self, target: u64) -> bool {
    if self.0.no_collect_calls.load(Ordering::SeqCst) >= target {
      return true;
    }
    let deadline = std::time::Instant::now() + Duration::from_micros(2 * self.0.config.interval_us);
    while std::time::Instant::now() < deadline {
      if self.0.no_collect_calls.load(Ordering::SeqCst) >= target {
        return true;
      }
      std::thread::sleep(Duration::from_micros(self.0.config.interval_us.min(500)));
    }
    self.0.no_collect_calls.load(Ordering::SeqCst) >= target
  }

  #[tracing::instrument(skip(self))]
  pub fn stop(&self, restart: bool) -> ProfilerResult<TimeProfile> {
    let mut state = self.0.state.lock().unwrap();
    if !state.running {
      return Err(ProfilerError::NotStarted);
    }
    let old_title = state.current_title.clone();
    let uses_signal = self.0.config.with_contexts || self.0.config.workaround_v8_bug;

    // Step 1: force NoCollect and wait out any in-flight tick before the
    // ring is considered quiescent.
    let mut deferred_workaround_reactivation = false;
    if restart && self.0.config.workaround_v8_bug {
      self.0.mode.store(CollectionMode::NoCollect);
      let target = self.0.no_collect_calls.load(Ordering::SeqCst) + 1;
      if !self.wait_for_signal(target) {
        log::warn!("waitForSignal timed out waiting for in-flight SIGPROF to drain");
      }
      deferred_workaround_reactivation = true;
    } else if self.0.config.with_contexts {
      self.0.mode.store(CollectionMode::NoCollect);
      wait_for_clock_tick();
    }

    // Snapshot the finishing round's sample count now: on the restart path
    // `start_internal` below zeroes it for the round it opens, and this
    // report is for the round that is ending, not the one being opened.
    let sample_count = self.0.sample_count.load(Ordering::SeqCst);

    // Step 2: reopen a fresh round before tearing down the old one, so the
    // host never observes a gap with no active profiler.
    if restart {
      self.start_internal(&mut state)?;
    }
    let call_count = self.0.no_collect_calls.load(Ordering::SeqCst);

    // Step 3.
    if uses_signal {
      signal::decrease_use();
    }

    // Step 4.
    let host_profile = self.0.host.stop_profiling(&old_title);

    // Step 5.
    let records = self.0.ring.drain();
    let overflow_count = self.0.ring.overflow_count() as u64;

    // Step 6.
    let stuck_level = reconciler::detect_stuck_level(&host_profile, sample_count);
    state.last_stuck_level = stuck_level;
    if stuck_level > 0 {
      log::warn!("stuck event loop detected at level {stuck_level}");
    }

    // Step 7: reactivate collection now unless still in workaround mode
    // (handled after step 10/11 below).
    if restart && self.0.config.with_contexts && !self.0.config.workaround_v8_bug {
      wait_for_clock_tick();
      self.0.mode.store(CollectionMode::CollectContexts);
    }

    // Step 8: non-JS CPU accounting, main thread only.
    let non_js_cpu_ns = if self.0.config.is_main_thread && self.0.config.collect_cpu_time {
      let process_delta = clock::process_cpu_ns() - state.start_process_cpu_ns;
      let worker_delta = signal::global_registry().gather_total_worker_cpu_and_reset();
      Some((process_delta - worker_delta).max(0))
    } else {
      None
    };

    // Step 9: reconcile.
    let root = reconciler::reconcile(&host_profile, &records, self.0.config.collect_cpu_time);

    let profile = TimeProfile {
      root,
      interval_ns: self.0.config.interval_us as i64 * 1000,
      duration_ns: (host_profile.end_time_us - host_profile.start_time_us) * 1000,
      has_cpu_time: self.0.config.collect_cpu_time,
      non_js_cpu_ns,
      stuck_level,
      sample_count,
      overflow_count,
    };

    // Step 11: finish workaround reactivation now that the profile is
    // serialized-ready.
    if deferred_workaround_reactivation {
      self.wait_for_signal(call_count + 1);
      let mode = if self.0.config.with_contexts {
        CollectionMode::CollectContexts
      } else {
        CollectionMode::PassThrough
      };
      self.0.mode.store(mode);
    }

    // Step 12: tear down entirely if this was a true stop.
    if !restart {
      if uses_signal {
        signal::global_registry().remove(signal::current_thread_key(), clock::thread_cpu_ns().unwrap_or(0));
      }
      state.running = false;
      log::info!("wall profiler stopped: sample_count={sample_count} overflow_count={overflow_count}");
    }

    Ok(profile)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::host::{CpuProfileNode, HostCpuProfile, HostFrame};
  use serial_test::serial;
  use std::sync::Mutex as StdMutex;

  struct FakeHost {
    profile: StdMutex<HostCpuProfile>,
  }

  fn leaf_frame(name: &str) -> HostFrame {
    HostFrame {
      function_name: name.to_string(),
      script_name: Some("app.js".to_string()),
      script_id: 1,
      line_number: 1,
      column_number: 1,
    }
  }

  fn fake_profile() -> HostCpuProfile {
    HostCpuProfile {
      root: CpuProfileNode {
        id: 0,
        frame: leaf_frame("(root)"),
        hit_count: 0,
        children: vec![CpuProfileNode {
          id: 1,
          frame: leaf_frame("doWork"),
          hit_count: 3,
          children: vec![],
        }],
      },
      sample_node_ids: vec![0, 1, 1, 1],
      timestamps: vec![0, 10, 20, 30],
      start_time_us: 0,
      end_time_us: 30,
    }
  }

  impl CpuProfilerHost for FakeHost {
    fn start_profiling(&self, _title: &str, _include_line_numbers: bool) -> ProfilerResult<()> {
      Ok(())
    }
    fn stop_profiling(&self, _title: &str) -> HostCpuProfile {
      self.profile.lock().unwrap().clone()
    }
    fn collect_sample(&self) {}
    fn current_async_id(&self) -> Option<f64> {
      None
    }
  }

  fn config(with_contexts: bool) -> WallProfilerConfig {
    WallProfilerConfig {
      interval_us: 1000,
      duration_us: 10_000,
      include_lines: false,
      with_contexts,
      workaround_v8_bug: false,
      collect_cpu_time: false,
      is_main_thread: true,
    }
  }

  #[test]
  fn rejects_cpu_time_without_contexts() {
    let mut c = config(false);
    c.collect_cpu_time = true;
    let host = Arc::new(FakeHost { profile: StdMutex::new(fake_profile()) });
    let err = WallProfiler::new(c, host).unwrap_err();
    assert!(matches!(err, ProfilerError::IncompatibleConfig("cpu_without_contexts")));
  }

  #[test]
  fn rejects_lines_with_contexts() {
    let mut c = config(true);
    c.include_lines = true;
    let host = Arc::new(FakeHost { profile: StdMutex::new(fake_profile()) });
    let err = WallProfiler::new(c, host).unwrap_err();
    assert!(matches!(err, ProfilerError::IncompatibleConfig("lines_with_contexts")));
  }

  #[test]
  #[serial]
  fn start_without_contexts_then_stop_returns_profile_without_signal_use() {
    let host = Arc::new(FakeHost { profile: StdMutex::new(fake_profile()) });
    let profiler = WallProfiler::new(config(false), host).unwrap();
    profiler.start().unwrap();
    let profile = profiler.stop(false).unwrap();
    assert_eq!(profile.root.children[0].residual_hits, 3);
  }

  #[test]
  #[serial]
  fn double_start_errors() {
    let host = Arc::new(FakeHost { profile: StdMutex::new(fake_profile()) });
    let profiler = WallProfiler::new(config(false), host).unwrap();
    profiler.start().unwrap();
    assert!(matches!(profiler.start().unwrap_err(), ProfilerError::AlreadyStarted));
    profiler.stop(false).unwrap();
  }

  #[test]
  #[serial]
  fn stop_without_start_errors() {
    let host = Arc::new(FakeHost { profile: StdMutex::new(fake_profile()) });
    let profiler = WallProfiler::new(config(false), host).unwrap();
    assert!(matches!(profiler.stop(false).unwrap_err(), ProfilerError::NotStarted));
  }

  #[test]
  #[serial]
  fn set_and_get_context_round_trip() {
    let host = Arc::new(FakeHost { profile: StdMutex::new(fake_profile()) });
    let profiler = WallProfiler::new(config(false), host).unwrap();
    assert!(profiler.get_context().is_none());
    let ctx = Arc::new(crate::context::ContextValue::new(vec![]));
    profiler.set_context(Some(ctx));
    assert!(profiler.get_context().is_some());
  }
}
