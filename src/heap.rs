//! Heap engine (C8)
//!
//! Installs a near-heap-limit reaction, snapshots the host's allocation
//! tree when it fires, and routes the snapshot to zero or more sinks: a
//! stderr collapsed-stack dump, a detached exporter subprocess, and/or a
//! user callback dispatched back onto the managed thread.

use crate::error::{ProfilerError, ProfilerResult};
use crate::host::{AllocationNode, HeapProfilerHost};
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Default additional heap room granted per near-heap-limit reaction, to
/// let the callback/export path make progress before the next GC.
const DEFAULT_EXTENSION_BYTES: u64 = 16 * 1024 * 1024;

/// How a user callback (if any) is dispatched back to the managed thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackMode {
  None,
  Async,
  Interrupt,
  AsyncAndInterrupt,
}

impl CallbackMode {
  fn wants_async(self) -> bool {
    matches!(self, CallbackMode::Async | CallbackMode::AsyncAndInterrupt)
  }
  fn wants_interrupt(self) -> bool {
    matches!(self, CallbackMode::Interrupt | CallbackMode::AsyncAndInterrupt)
  }
}

/// §4.8 heap-reaction configuration, immutable between `monitor_oom` and
/// `stop`.
#[derive(Clone)]
pub struct OomMonitorConfig {
  pub extension_size_bytes: u64,
  pub max_extensions: u32,
  pub dump_to_stderr: bool,
  pub export_command: Vec<String>,
  pub callback_mode: CallbackMode,
  pub is_main_thread: bool,
}

impl Default for OomMonitorConfig {
  fn default() -> Self {
    Self {
      extension_size_bytes: DEFAULT_EXTENSION_BYTES,
      max_extensions: 1,
      dump_to_stderr: false,
      export_command: Vec::new(),
      callback_mode: CallbackMode::None,
      is_main_thread: true,
    }
  }
}

/// Allocation JSON shape shipped to an exporter (§6.4).
#[derive(Serialize)]
struct AllocationJson {
  name: String,
  #[serde(rename = "scriptName")]
  script_name: String,
  #[serde(rename = "scriptId")]
  script_id: i32,
  #[serde(rename = "lineNumber")]
  line_number: i32,
  #[serde(rename = "columnNumber")]
  column_number: i32,
  children: Vec<AllocationJson>,
  allocations: Vec<AllocationBucketJson>,
}

#[derive(Serialize)]
struct AllocationBucketJson {
  #[serde(rename = "sizeBytes")]
  size_bytes: u64,
  count: u64,
}

fn to_json(node: &AllocationNode) -> AllocationJson {
  AllocationJson {
    name: node.name.clone(),
    script_name: node.script_name.clone(),
    script_id: node.script_id,
    line_number: node.line_number,
    column_number: node.column_number,
    children: node.children.iter().map(to_json).collect(),
    allocations: node
      .allocations
      .iter()
      .map(|a| AllocationBucketJson { size_bytes: a.size, count: a.count })
      .collect(),
  }
}

/// Writes a node's allocation buckets as a collapsed-stack line per leaf
/// path, the format `pprof`'s own text dumper and most flamegraph tools
/// consume directly.
fn dump_collapsed_stack(node: &AllocationNode, stack: &mut Vec<String>, out: &mut String) {
  stack.push(if node.name.is_empty() { "(anonymous)".to_string() } else { node.name.clone() });
  for alloc in &node.allocations {
    out.push_str(&stack.join(";"));
    out.push(' ');
    out.push_str(&(alloc.count * alloc.size).to_string());
    out.push('\n');
  }
  for child in &node.children {
    dump_collapsed_stack(child, stack, out);
  }
  stack.pop();
}

struct State {
  config: OomMonitorConfig,
  extensions_used: AtomicU32,
  inside_callback: AtomicBool,
  last_snapshot: Mutex<Option<AllocationNode>>,
}

/// Owns the near-heap-limit reaction. One instance per isolate; installed
/// via `monitor_oom`, removed via `stop`.
pub struct HeapProfiler {
  host: Arc<dyn HeapProfilerHost>,
  interval_bytes: u64,
  stack_depth: u32,
  sampling_active: AtomicBool,
  oom: Mutex<Option<Arc<State>>>,
  exporter_running: AtomicU32,
}

impl HeapProfiler {
  pub fn new(interval_bytes: u64, stack_depth: u32, host: Arc<dyn HeapProfilerHost>) -> ProfilerResult<Self> {
    host.start_sampling(interval_bytes, stack_depth);
    log::info!("heap profiler started: interval_bytes={interval_bytes} stack_depth={stack_depth}");
    Ok(Self {
      host,
      interval_bytes,
      stack_depth,
      sampling_active: AtomicBool::new(true),
      oom: Mutex::new(None),
      exporter_running: AtomicU32::new(0),
    })
  }

  pub fn stop(&self) {
    if self.sampling_active.swap(false, Ordering::SeqCst) {
      self.host.stop_sampling();
      log::info!("heap profiler stopped");
    }
    let mut oom = self.oom.lock().unwrap();
    if oom.take().is_some() {
      self.host.remove_near_heap_limit_callback();
    }
  }

  /// §4.8 `monitor_oom`: installs the near-heap-limit reaction.
  pub fn monitor_oom(&self, config: OomMonitorConfig, initial_limit: u64) {
    let state = Arc::new(State {
      config,
      extensions_used: AtomicU32::new(0),
      inside_callback: AtomicBool::new(false),
      last_snapshot: Mutex::new(None),
    });
    *self.oom.lock().unwrap() = Some(state);
    self.host.add_near_heap_limit_callback(initial_limit);
  }

  /// `heap::profile`: returns the current allocation tree from the host,
  /// optionally filtered by `ignore_path` at serialization time (the
  /// filter itself lives in the pprof serializer; this just exposes the
  /// raw tree).
  pub fn profile(&self) -> AllocationNode {
    self.host.get_allocation_profile()
  }

  pub fn interval_bytes(&self) -> u64 {
    self.interval_bytes
  }

  pub fn stack_depth(&self) -> u32 {
    self.stack_depth
  }

  /// The near-heap-limit reaction callback, steps numbered to match §4.8.
  /// Called by the embedding's N-API glue from within the managed
  /// runtime's allocator path; not signal-safe, but must return quickly.
  pub fn on_near_heap_limit(&self, current_limit: u64, default_extension: u64) -> u64 {
    let oom_guard = self.oom.lock().unwrap();
    let state = match oom_guard.as_ref() {
      Some(s) => s.clone(),
      None => return current_limit + default_extension,
    };
    drop(oom_guard);

    // 1. Reentrancy guard.
    if state.inside_callback.swap(true, Ordering::AcqRel) {
      return current_limit + default_extension;
    }
    let _reset = ResetOnDrop(&state.inside_callback);

    // 3. Enumerate heap-object statistics and emit them to stderr,
    // unconditionally (distinct from the `dump_to_stderr`-gated collapsed
    // stack in step 5).
    let stats = self.host.heap_statistics();
    eprintln!(
      "near-heap-limit: used={} total={} limit={} malloced={} native_contexts={} detached_contexts={}",
      stats.used_heap_size,
      stats.total_heap_size,
      stats.heap_size_limit,
      stats.malloced_memory,
      stats.number_of_native_contexts,
      stats.number_of_detached_contexts
    );

    // 4. Snapshot the allocation tree.
    let snapshot = self.host.get_allocation_profile();
    log::warn!("near-heap-limit reached at {current_limit} bytes, snapshotting allocation tree");

    // 5. Optional stderr dump.
    if state.config.dump_to_stderr {
      let mut out = String::new();
      dump_collapsed_stack(&snapshot, &mut Vec::new(), &mut out);
      eprint!("{out}");
    }

    // 6. Optional export subprocess.
    if !state.config.export_command.is_empty() {
      self.spawn_exporter(&state.config.export_command, &snapshot);
    }

    // 7. Dispatch or discard for the user callback.
    *state.last_snapshot.lock().unwrap() = Some(snapshot);
    if state.config.callback_mode != CallbackMode::None {
      if state.config.callback_mode.wants_interrupt() {
        self.host.request_interrupt();
      }
      if state.config.callback_mode.wants_async() {
        self.host.post_to_event_loop();
      }
    } else {
      *state.last_snapshot.lock().unwrap() = None;
    }

    // 8. Non-main-thread isolates hand off to the host's own termination
    // path instead of trying to keep running.
    if !state.config.is_main_thread {
      self.host.remove_near_heap_limit_callback();
      self.host.low_memory_notification();
      return current_limit + 16 * 1024 * 1024 + 1;
    }

    // 9. Main thread: extend while at or under budget (the call that
    // reaches `max_extensions` still gets its extension), then uninstall
    // so the host stops invoking a callback that can no longer help.
    let used = state.extensions_used.fetch_add(1, Ordering::AcqRel) + 1;
    if used >= state.config.max_extensions {
      self.host.remove_near_heap_limit_callback();
    }
    if used <= state.config.max_extensions {
      current_limit + state.config.extension_size_bytes
    } else {
      current_limit
    }
  }

  /// Takes the snapshot queued for a user callback, if any, clearing it.
  /// Called once the host actually runs the dispatched callback.
  pub fn take_pending_snapshot(&self) -> Option<AllocationNode> {
    let oom = self.oom.lock().unwrap();
    oom.as_ref().and_then(|s| s.last_snapshot.lock().unwrap().take())
  }

  /// §4.8.1 allocation export: fresh event loop, temp file, spawned
  /// detached subprocess with a 5-second kill timer, JSON payload written
  /// to the temp file, the path appended as the last argv entry.
  fn spawn_exporter(&self, argv: &[String], snapshot: &AllocationNode) {
    if argv.is_empty() {
      return;
    }
    let json = to_json(snapshot);
    let payload = match serde_json::to_string(&json) {
      Ok(p) => p,
      Err(e) => {
        log::error!("failed to serialize allocation snapshot: {e}");
        return;
      }
    };
    let program = argv[0].clone();
    let args: Vec<String> = argv[1..].to_vec();

    self.exporter_running.fetch_add(1, Ordering::Relaxed);
    let running = {
      // A fresh dedicated runtime per export call matches §4.8.1's "create
      // a fresh event loop"; the thread running it is detached from the
      // managed thread so the 5s kill timer bounds it independently.
      std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
          Ok(rt) => rt,
          Err(e) => {
            log::error!("failed to start exporter event loop: {e}");
            return;
          }
        };
        rt.block_on(run_export(program, args, payload));
      })
    };
    drop(running);
  }
}

async fn run_export(program: String, args: Vec<String>, payload: String) {
  let file = match tempfile::Builder::new().prefix("xprofiler-heap-").suffix(".json").tempfile() {
    Ok(f) => f,
    Err(e) => {
      log::error!("{}", ProfilerError::ExporterSpawnFailed(e));
      return;
    }
  };
  let path: PathBuf = file.path().to_path_buf();
  {
    let mut handle = match tokio::fs::File::create(&path).await {
      Ok(h) => h,
      Err(e) => {
        log::error!("{}", ProfilerError::ExporterSpawnFailed(e));
        return;
      }
    };
    if let Err(e) = handle.write_all(payload.as_bytes()).await {
      log::error!("{}", ProfilerError::ExporterSpawnFailed(e));
      return;
    }
  }

  let mut command = Command::new(&program);
  command.args(&args).arg(&path).stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
  // Detach the exporter into its own process group so it outlives a
  // crashing host; `setsid` takes it out of our session entirely.
  #[cfg(unix)]
  unsafe {
    use std::os::unix::process::CommandExt;
    command.as_std_mut().pre_exec(|| {
      libc::setsid();
      Ok(())
    });
  }

  let spawned = command.spawn();
  match spawned {
    Ok(mut child) => {
      let result = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
      match result {
        Ok(Ok(_status)) => {}
        Ok(Err(e)) => log::error!("{}", ProfilerError::ExporterSpawnFailed(e)),
        Err(_) => {
          log::error!("{}", ProfilerError::ExporterTimedOut);
          let _ = child.start_kill();
        }
      }
    }
    Err(e) => log::error!("{}", ProfilerError::ExporterSpawnFailed(e)),
  }

  let _ = tokio::fs::remove_file(&path).await;
  drop(file);
}

struct ResetOnDrop<'a>(&'a AtomicBool);
impl Drop for ResetOnDrop<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::host::Allocation;
  use std::sync::atomic::AtomicUsize;

  struct FakeHeapHost {
    sampling: AtomicBool,
    callback_installed: AtomicBool,
    interrupts: AtomicUsize,
    event_loop_posts: AtomicUsize,
    low_memory_notifications: AtomicUsize,
  }

  impl FakeHeapHost {
    fn new() -> Self {
      Self {
        sampling: AtomicBool::new(false),
        callback_installed: AtomicBool::new(false),
        interrupts: AtomicUsize::new(0),
        event_loop_posts: AtomicUsize::new(0),
        low_memory_notifications: AtomicUsize::new(0),
      }
    }
  }

  impl HeapProfilerHost for FakeHeapHost {
    fn start_sampling(&self, _interval_bytes: u64, _stack_depth: u32) {
      self.sampling.store(true, Ordering::SeqCst);
    }
    fn stop_sampling(&self) {
      self.sampling.store(false, Ordering::SeqCst);
    }
    fn get_allocation_profile(&self) -> AllocationNode {
      AllocationNode {
        name: "(root)".to_string(),
        script_name: String::new(),
        script_id: 0,
        line_number: 0,
        column_number: 0,
        allocations: vec![],
        children: vec![AllocationNode {
          name: "(external)".to_string(),
          script_name: String::new(),
          script_id: 0,
          line_number: 0,
          column_number: 0,
          allocations: vec![Allocation { count: 1, size: 1_048_576 }],
          children: vec![],
        }],
      }
    }
    fn heap_statistics(&self) -> crate::host::HeapStatistics {
      crate::host::HeapStatistics::default()
    }
    fn add_near_heap_limit_callback(&self, _initial_limit: u64) {
      self.callback_installed.store(true, Ordering::SeqCst);
    }
    fn remove_near_heap_limit_callback(&self) {
      self.callback_installed.store(false, Ordering::SeqCst);
    }
    fn request_interrupt(&self) {
      self.interrupts.fetch_add(1, Ordering::SeqCst);
    }
    fn post_to_event_loop(&self) {
      self.event_loop_posts.fetch_add(1, Ordering::SeqCst);
    }
    fn low_memory_notification(&self) {
      self.low_memory_notifications.fetch_add(1, Ordering::SeqCst);
    }
  }

  #[test]
  fn start_sampling_activates_host() {
    let host = Arc::new(FakeHeapHost::new());
    let profiler = HeapProfiler::new(512 * 1024, 16, host.clone()).unwrap();
    assert!(host.sampling.load(Ordering::SeqCst));
    profiler.stop();
    assert!(!host.sampling.load(Ordering::SeqCst));
  }

  #[test]
  fn reaction_extends_limit_on_main_thread_under_budget() {
    let host = Arc::new(FakeHeapHost::new());
    let profiler = HeapProfiler::new(512 * 1024, 16, host.clone()).unwrap();
    let mut config = OomMonitorConfig::default();
    config.max_extensions = 3;
    config.extension_size_bytes = 1024;
    profiler.monitor_oom(config, 100_000);

    let new_limit = profiler.on_near_heap_limit(100_000, 2048);
    assert_eq!(new_limit, 101_024);
  }

  #[test]
  fn reaction_uninstalls_after_max_extensions() {
    let host = Arc::new(FakeHeapHost::new());
    let profiler = HeapProfiler::new(512 * 1024, 16, host.clone()).unwrap();
    let mut config = OomMonitorConfig::default();
    config.max_extensions = 1;
    config.extension_size_bytes = 1024;
    profiler.monitor_oom(config, 100_000);

    // The call that reaches `max_extensions` still grants its extension;
    // the callback is uninstalled so a second call can never happen.
    let new_limit = profiler.on_near_heap_limit(100_000, 2048);
    assert_eq!(new_limit, 101_024);
    assert!(!host.callback_installed.load(Ordering::SeqCst));
  }

  #[test]
  fn reentrant_call_returns_default_extension_without_snapshotting() {
    let host = Arc::new(FakeHeapHost::new());
    let profiler = HeapProfiler::new(512 * 1024, 16, host.clone()).unwrap();
    profiler.monitor_oom(OomMonitorConfig::default(), 100_000);
    {
      let oom = profiler.oom.lock().unwrap();
      oom.as_ref().unwrap().inside_callback.store(true, Ordering::SeqCst);
    }
    let new_limit = profiler.on_near_heap_limit(100_000, 555);
    assert_eq!(new_limit, 100_555);
  }

  #[test]
  fn non_main_thread_hands_off_to_host_termination() {
    let host = Arc::new(FakeHeapHost::new());
    let profiler = HeapProfiler::new(512 * 1024, 16, host.clone()).unwrap();
    let mut config = OomMonitorConfig::default();
    config.is_main_thread = false;
    profiler.monitor_oom(config, 100_000);

    let new_limit = profiler.on_near_heap_limit(100_000, 0);
    assert_eq!(new_limit, 100_000 + 16 * 1024 * 1024 + 1);
    assert_eq!(host.low_memory_notifications.load(Ordering::SeqCst), 1);
    assert!(!host.callback_installed.load(Ordering::SeqCst));
  }

  #[test]
  fn interrupt_mode_requests_interrupt_on_reaction() {
    let host = Arc::new(FakeHeapHost::new());
    let profiler = HeapProfiler::new(512 * 1024, 16, host.clone()).unwrap();
    let mut config = OomMonitorConfig::default();
    config.callback_mode = CallbackMode::Interrupt;
    profiler.monitor_oom(config, 100_000);

    profiler.on_near_heap_limit(100_000, 2048);
    assert_eq!(host.interrupts.load(Ordering::SeqCst), 1);
    assert!(profiler.take_pending_snapshot().is_some());
  }

  #[test]
  fn external_allocation_json_round_trips_count_and_size() {
    let node = AllocationNode {
      name: "(external)".to_string(),
      script_name: String::new(),
      script_id: 0,
      line_number: 0,
      column_number: 0,
      allocations: vec![Allocation { count: 1, size: 1_048_576 }],
      children: vec![],
    };
    let json = to_json(&node);
    let encoded = serde_json::to_string(&json).unwrap();
    assert!(encoded.contains("1048576"));
    assert!(!encoded.ends_with('\n'));
  }

  #[test]
  fn collapsed_stack_dump_includes_leaf_path() {
    let mut root = AllocationNode {
      name: "(root)".to_string(),
      ..Default::default()
    };
    root.children.push(AllocationNode {
      name: "leaf".to_string(),
      allocations: vec![Allocation { count: 2, size: 10 }],
      ..Default::default()
    });
    let mut out = String::new();
    dump_collapsed_stack(&root, &mut Vec::new(), &mut out);
    assert_eq!(out, "(root);leaf 20\n");
  }
}
