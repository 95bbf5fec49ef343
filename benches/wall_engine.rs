//! Benchmarks for the hot paths on the signal-adjacent side of the wall
//! engine: context cell get/set, ring push, and pprof encode. These are
//! the operations whose cost is paid once per sampling interval (or once
//! per profile for encode), so regressions here show up directly as
//! profiler overhead in the profiled process.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use xprofiler_rs::context::{ContextCell, ContextField, ContextValue};
use xprofiler_rs::context_ring::{ContextRecord, ContextRing};
use xprofiler_rs::pprof::{encode, serialize_wall, WallSerializeOptions};
use xprofiler_rs::wall::reconciler::ReconciledNode;
use xprofiler_rs::host::HostFrame;

fn ctx(label: &str) -> Arc<ContextValue> {
  Arc::new(ContextValue::new(vec![("label".to_string(), ContextField::Str(label.to_string()))]))
}

fn bench_context_cell(c: &mut Criterion) {
  let mut group = c.benchmark_group("context_cell");

  group.bench_function("set", |b| {
    let cell = ContextCell::new();
    let a = ctx("a");
    let other = ctx("b");
    let mut toggle = false;
    b.iter(|| {
      cell.set(Some(if toggle { a.clone() } else { other.clone() }));
      toggle = !toggle;
    });
  });

  group.bench_function("get", |b| {
    let cell = ContextCell::new();
    cell.set(Some(ctx("a")));
    b.iter(|| black_box(cell.get()));
  });

  group.finish();
}

fn record(t: i64) -> ContextRecord {
  ContextRecord {
    context: Some(ctx("a")),
    t_from: t,
    t_to: t + 1,
    cpu_time: Some(t * 1000),
    async_id: None,
  }
}

fn bench_context_ring(c: &mut Criterion) {
  let mut group = c.benchmark_group("context_ring");

  group.bench_function("push", |b| {
    let ring = ContextRing::new(4096);
    let mut i = 0i64;
    b.iter(|| {
      ring.push(record(i));
      i += 1;
      if ring.len() >= 4096 {
        ring.drain();
      }
    });
  });

  group.finish();
}

fn frame(name: &str, line: i32) -> HostFrame {
  HostFrame {
    function_name: name.to_string(),
    script_name: Some("app.js".to_string()),
    script_id: 1,
    line_number: line,
    column_number: 1,
  }
}

fn leaf(name: &str, line: i32, hits: u32) -> ReconciledNode {
  ReconciledNode {
    frame: frame(name, line),
    is_idle: false,
    is_program: false,
    is_gc: false,
    residual_hits: hits,
    attached: vec![],
    children: vec![],
  }
}

/// A moderately wide, two-level tree: representative of a real wall
/// profile's leaf diversity without paying for a deep synthetic fixture.
fn sample_tree(width: usize) -> ReconciledNode {
  let mut root = leaf("(root)", 0, 0);
  for i in 0..width {
    root.children.push(leaf(&format!("fn_{i}"), i as i32, 3));
  }
  root
}

fn bench_pprof_encode(c: &mut Criterion) {
  let mut group = c.benchmark_group("pprof_encode");
  let root = sample_tree(200);
  let opts = WallSerializeOptions {
    interval_ns: 1_000_000,
    duration_ns: 500_000_000,
    has_cpu_time: false,
    non_js_cpu_ns: None,
    total_hit_count: 600,
    source_mapper: None,
  };
  let profile = serialize_wall(&root, &opts);

  group.bench_function("serialize_wall_200_leaves", |b| {
    b.iter(|| black_box(serialize_wall(&root, &opts)));
  });

  group.bench_function("encode_gzip", |b| {
    b.iter(|| black_box(encode(&profile, 0)));
  });

  group.finish();
}

criterion_group!(benches, bench_context_cell, bench_context_ring, bench_pprof_encode);
criterion_main!(benches);
