//! N-API surface for the heap engine: `heapProfilerStart`, `heapProfilerStop`,
//! `heapProfilerProfile`, `heapMonitorOom`.

use crate::bindings::host_bridge::NativeHeapProfilerHost;
use crate::bindings::{next_handle, to_napi_err, PROFILES};
use crate::heap::{CallbackMode, HeapProfiler, OomMonitorConfig};
use dashmap::DashMap;
use napi_derive::napi;
use once_cell::sync::Lazy;
use std::sync::Arc;

static HEAP_PROFILERS: Lazy<DashMap<u32, Arc<HeapProfiler>>> = Lazy::new(DashMap::new);

#[napi(object)]
pub struct JsOomMonitorConfig {
  pub extension_size_bytes: i64,
  pub max_extensions: u32,
  pub dump_to_stderr: bool,
  pub export_command: Vec<String>,
  /// One of "none", "async", "interrupt", "both".
  pub callback_mode: String,
  pub is_main_thread: bool,
}

fn callback_mode_from_str(s: &str) -> CallbackMode {
  match s {
    "async" => CallbackMode::Async,
    "interrupt" => CallbackMode::Interrupt,
    "both" => CallbackMode::AsyncAndInterrupt,
    _ => CallbackMode::None,
  }
}

#[napi(js_name = "heapProfilerStart")]
pub fn heap_profiler_start(interval_bytes: i64, stack_depth: u32) -> napi::Result<u32> {
  let host = Arc::new(NativeHeapProfilerHost::new());
  let profiler = HeapProfiler::new(interval_bytes.max(1) as u64, stack_depth, host).map_err(to_napi_err)?;
  let handle = next_handle();
  HEAP_PROFILERS.insert(handle, Arc::new(profiler));
  Ok(handle)
}

#[napi(js_name = "heapProfilerStop")]
pub fn heap_profiler_stop(handle: u32) -> napi::Result<()> {
  let profiler = HEAP_PROFILERS.get(&handle).ok_or_else(|| napi::Error::from_reason("unknown heap profiler handle"))?;
  profiler.stop();
  Ok(())
}

#[napi(js_name = "heapProfilerProfile")]
pub fn heap_profiler_profile(handle: u32, ignore_path: Option<String>) -> napi::Result<u32> {
  let profiler = HEAP_PROFILERS.get(&handle).ok_or_else(|| napi::Error::from_reason("unknown heap profiler handle"))?;
  let tree = profiler.profile();
  let proto = crate::pprof::serialize_heap(&tree, profiler.interval_bytes(), ignore_path.as_deref(), None);
  let profile_handle = next_handle();
  PROFILES.insert(profile_handle, proto);
  Ok(profile_handle)
}

#[napi(js_name = "heapMonitorOom")]
pub fn heap_monitor_oom(handle: u32, config: JsOomMonitorConfig, initial_limit: i64) -> napi::Result<()> {
  let profiler = HEAP_PROFILERS.get(&handle).ok_or_else(|| napi::Error::from_reason("unknown heap profiler handle"))?;
  let config = OomMonitorConfig {
    extension_size_bytes: config.extension_size_bytes.max(0) as u64,
    max_extensions: config.max_extensions.max(1),
    dump_to_stderr: config.dump_to_stderr,
    export_command: config.export_command,
    callback_mode: callback_mode_from_str(&config.callback_mode),
    is_main_thread: config.is_main_thread,
  };
  profiler.monitor_oom(config, initial_limit.max(0) as u64);
  Ok(())
}
