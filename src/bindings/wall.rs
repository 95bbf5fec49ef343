//! N-API surface for the wall engine: `wallProfilerNew`, `wallProfilerStart`,
//! `wallProfilerStop`, `wallProfilerSetContext`, `wallProfilerGetContext`,
//! `wallProfilerState`.

use crate::bindings::host_bridge::NativeCpuProfilerHost;
use crate::bindings::{next_handle, to_napi_err, PROFILES};
use crate::context::{ContextField, ContextValue};
use crate::pprof::WallSerializeOptions;
use crate::wall::{WallProfiler, WallProfilerConfig};
use dashmap::DashMap;
use napi_derive::napi;
use once_cell::sync::Lazy;
use std::sync::Arc;

static WALL_PROFILERS: Lazy<DashMap<u32, WallProfiler>> = Lazy::new(DashMap::new);

#[napi(object)]
pub struct JsWallProfilerConfig {
  pub interval_us: i64,
  pub duration_us: i64,
  pub include_lines: bool,
  pub with_contexts: bool,
  pub workaround_v8_bug: bool,
  pub collect_cpu_time: bool,
  pub is_main_thread: bool,
}

#[napi(object)]
pub struct JsContextField {
  pub key: String,
  pub str_value: Option<String>,
  pub num_value: Option<f64>,
}

#[napi(object)]
pub struct JsWallProfilerState {
  pub sample_count: i64,
  pub overflow_count: i64,
}

fn to_context(fields: Option<Vec<JsContextField>>) -> Option<crate::context::Context> {
  let fields = fields?;
  let converted = fields
    .into_iter()
    .map(|f| {
      let value = match (f.str_value, f.num_value) {
        (Some(s), _) => ContextField::Str(s),
        (None, Some(n)) => ContextField::Num(n),
        (None, None) => ContextField::Str(String::new()),
      };
      (f.key, value)
    })
    .collect();
  Some(Arc::new(ContextValue::new(converted)))
}

fn from_context(ctx: Option<crate::context::Context>) -> Option<Vec<JsContextField>> {
  let ctx = ctx?;
  Some(
    ctx
      .fields
      .iter()
      .map(|(key, field)| match field {
        ContextField::Str(s) => JsContextField { key: key.clone(), str_value: Some(s.clone()), num_value: None },
        ContextField::Num(n) => JsContextField { key: key.clone(), str_value: None, num_value: Some(*n) },
      })
      .collect(),
  )
}

#[napi(js_name = "wallProfilerNew")]
pub fn wall_profiler_new(config: JsWallProfilerConfig) -> napi::Result<u32> {
  let config = WallProfilerConfig {
    interval_us: config.interval_us.max(0) as u64,
    duration_us: config.duration_us.max(0) as u64,
    include_lines: config.include_lines,
    with_contexts: config.with_contexts,
    workaround_v8_bug: config.workaround_v8_bug,
    collect_cpu_time: config.collect_cpu_time,
    is_main_thread: config.is_main_thread,
  };
  let host = Arc::new(NativeCpuProfilerHost::new());
  let profiler = WallProfiler::new(config, host).map_err(to_napi_err)?;
  let handle = next_handle();
  WALL_PROFILERS.insert(handle, profiler);
  Ok(handle)
}

#[napi(js_name = "wallProfilerStart")]
pub fn wall_profiler_start(handle: u32) -> napi::Result<()> {
  let profiler = WALL_PROFILERS.get(&handle).ok_or_else(|| napi::Error::from_reason("unknown wall profiler handle"))?;
  profiler.start().map_err(to_napi_err)
}

#[napi(js_name = "wallProfilerStop")]
pub fn wall_profiler_stop(handle: u32, restart: bool) -> napi::Result<u32> {
  let profiler = WALL_PROFILERS.get(&handle).ok_or_else(|| napi::Error::from_reason("unknown wall profiler handle"))?;
  let time_profile = profiler.stop(restart).map_err(to_napi_err)?;

  let total_hit_count = count_hits(&time_profile.root);
  let opts = WallSerializeOptions {
    interval_ns: time_profile.interval_ns,
    duration_ns: time_profile.duration_ns,
    has_cpu_time: time_profile.has_cpu_time,
    non_js_cpu_ns: time_profile.non_js_cpu_ns,
    total_hit_count,
    source_mapper: None,
  };
  let proto = crate::pprof::serialize_wall(&time_profile.root, &opts);
  let profile_handle = next_handle();
  PROFILES.insert(profile_handle, proto);
  Ok(profile_handle)
}

fn count_hits(node: &crate::wall::reconciler::ReconciledNode) -> u64 {
  let mut total = node.residual_hits as u64 + node.attached.len() as u64;
  for child in &node.children {
    total += count_hits(child);
  }
  total
}

#[napi(js_name = "wallProfilerSetContext")]
pub fn wall_profiler_set_context(handle: u32, fields: Option<Vec<JsContextField>>) -> napi::Result<()> {
  let profiler = WALL_PROFILERS.get(&handle).ok_or_else(|| napi::Error::from_reason("unknown wall profiler handle"))?;
  profiler.set_context(to_context(fields));
  Ok(())
}

#[napi(js_name = "wallProfilerGetContext")]
pub fn wall_profiler_get_context(handle: u32) -> napi::Result<Option<Vec<JsContextField>>> {
  let profiler = WALL_PROFILERS.get(&handle).ok_or_else(|| napi::Error::from_reason("unknown wall profiler handle"))?;
  Ok(from_context(profiler.get_context()))
}

#[napi(js_name = "wallProfilerState")]
pub fn wall_profiler_state(handle: u32) -> napi::Result<JsWallProfilerState> {
  let profiler = WALL_PROFILERS.get(&handle).ok_or_else(|| napi::Error::from_reason("unknown wall profiler handle"))?;
  let state = profiler.state();
  Ok(JsWallProfilerState {
    sample_count: state.sample_count as i64,
    overflow_count: state.overflow_count as i64,
  })
}
