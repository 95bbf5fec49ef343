//! Runnable demo: drives a `WallProfiler` against a fake `CpuProfilerHost`
//! for half a second, alternating a context label on the main thread, then
//! prints the gzip-compressed pprof byte count. Mirrors the way the
//! teacher crate ships runnable examples alongside its monitors.
//!
//! Run with: `cargo run --example wall_profile_demo`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use xprofiler_rs::context::{ContextField, ContextValue};
use xprofiler_rs::error::ProfilerError;
use xprofiler_rs::host::{CpuProfileNode, CpuProfilerHost, HostCpuProfile, HostFrame};
use xprofiler_rs::pprof::{encode, serialize_wall, WallSerializeOptions};
use xprofiler_rs::wall::{WallProfiler, WallProfilerConfig};

struct DemoHost {
  profile: Mutex<HostCpuProfile>,
}

impl CpuProfilerHost for DemoHost {
  fn start_profiling(&self, _title: &str, _include_line_numbers: bool) -> Result<(), ProfilerError> {
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

fn demo_profile() -> HostCpuProfile {
  let leaf = CpuProfileNode {
    id: 1,
    frame: HostFrame {
      function_name: "doWork".to_string(),
      script_name: Some("app.js".to_string()),
      script_id: 1,
      line_number: 42,
      column_number: 3,
    },
    hit_count: 500,
    children: vec![],
  };
  HostCpuProfile {
    root: CpuProfileNode {
      id: 0,
      frame: HostFrame {
        function_name: "(root)".to_string(),
        script_name: None,
        script_id: 0,
        line_number: 0,
        column_number: 0,
      },
      hit_count: 0,
      children: vec![leaf],
    },
    sample_node_ids: vec![],
    timestamps: vec![],
    start_time_us: 0,
    end_time_us: 500_000,
  }
}

fn main() {
  env_logger::init();

  let host = Arc::new(DemoHost { profile: Mutex::new(demo_profile()) });
  let config = WallProfilerConfig {
    interval_us: 1_000,
    duration_us: 500_000,
    include_lines: false,
    with_contexts: true,
    workaround_v8_bug: false,
    collect_cpu_time: false,
    is_main_thread: true,
  };
  let profiler = WallProfiler::new(config, host).expect("valid config");
  profiler.start().expect("start");

  let stop = Arc::new(AtomicBool::new(false));
  let bg_stop = stop.clone();
  let bg_profiler = profiler.clone();
  let toggler = thread::spawn(move || {
    let mut toggle = false;
    while !bg_stop.load(Ordering::Relaxed) {
      let label = if toggle { "request-a" } else { "request-b" };
      bg_profiler.set_context(Some(Arc::new(ContextValue::new(vec![(
        "endpoint".to_string(),
        ContextField::Str(label.to_string()),
      )]))));
      toggle = !toggle;
      thread::sleep(Duration::from_millis(10));
    }
  });

  thread::sleep(Duration::from_millis(500));
  stop.store(true, Ordering::Relaxed);
  toggler.join().unwrap();

  let profile = profiler.stop(false).expect("stop");
  println!(
    "sample_count={} overflow_count={} stuck_level={}",
    profile.sample_count, profile.overflow_count, profile.stuck_level
  );

  let opts = WallSerializeOptions {
    interval_ns: profile.interval_ns,
    duration_ns: profile.duration_ns,
    has_cpu_time: profile.has_cpu_time,
    non_js_cpu_ns: profile.non_js_cpu_ns,
    total_hit_count: 500,
    source_mapper: None,
  };
  let proto = serialize_wall(&profile.root, &opts);
  let bytes = encode(&proto, 0);
  println!("pprof gzip bytes: {}", bytes.len());
}
