//! N-API surface (§6.2)
//!
//! Thin `#[napi]` wrappers around the core `wall`/`heap`/`pprof` modules.
//! JS callers address profiler and profile instances by an opaque `u32`
//! handle rather than holding a native object directly, since a wall
//! profile has to survive independently of the `WallProfiler` that
//! produced it (the same profiler restarts into a new round immediately
//! on `stop(true)`).

pub mod heap;
mod host_bridge;
pub mod pprof;
pub mod wall;

use crate::error::ProfilerError;
use crate::pprof::ProfileProto;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_HANDLE: AtomicU32 = AtomicU32::new(1);
static PROFILES: Lazy<DashMap<u32, ProfileProto>> = Lazy::new(DashMap::new);

fn next_handle() -> u32 {
  NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)
}

fn to_napi_err(err: ProfilerError) -> napi::Error {
  napi::Error::from_reason(err.to_string())
}

/// Initializes the ambient logging stack once per process. Safe to call
/// more than once; only the first call takes effect.
#[napi_derive::napi(js_name = "initLogging")]
pub fn init_logging() {
  let _ = env_logger::try_init();
}

/// Drops a previously produced pprof profile once the caller has encoded
/// (or discarded) it, so long-running addon processes don't leak handles.
#[napi_derive::napi(js_name = "disposeProfile")]
pub fn dispose_profile(profile_handle: u32) {
  PROFILES.remove(&profile_handle);
}

include!(concat!(env!("OUT_DIR"), "/build_info.rs"));

/// Package version, as embedded at build time.
#[napi_derive::napi(js_name = "getVersion")]
pub fn get_version() -> String {
  VERSION.to_string()
}

/// Build metadata (version/target/profile/commit/branch), for diagnostics
/// bundled alongside an uploaded profile.
#[napi_derive::napi(object)]
pub struct JsBuildInfo {
  pub version: String,
  pub target: String,
  pub profile: String,
  pub commit_hash: String,
  pub branch: String,
}

#[napi_derive::napi(js_name = "getBuildInfo")]
pub fn get_build_info() -> JsBuildInfo {
  let info = BuildInfo::new();
  JsBuildInfo {
    version: info.version.to_string(),
    target: info.target.to_string(),
    profile: info.profile.to_string(),
    commit_hash: info.commit_hash.to_string(),
    branch: info.branch.to_string(),
  }
}
