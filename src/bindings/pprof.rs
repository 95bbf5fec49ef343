//! N-API surface for pprof encoding: `encodeSync`, `encode`.

use crate::bindings::PROFILES;
use napi::bindgen_prelude::Buffer;
use napi_derive::napi;
use std::time::{SystemTime, UNIX_EPOCH};

fn now_nanos() -> i64 {
  SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as i64).unwrap_or(0)
}

#[napi(js_name = "encodeSync")]
pub fn encode_sync(profile_handle: u32) -> napi::Result<Buffer> {
  let proto = PROFILES
    .get(&profile_handle)
    .ok_or_else(|| napi::Error::from_reason("unknown profile handle"))?
    .clone();
  let bytes = crate::pprof::encode(&proto, now_nanos());
  Ok(bytes.into())
}

#[napi(js_name = "encode")]
pub async fn encode(profile_handle: u32) -> napi::Result<Buffer> {
  let proto = PROFILES
    .get(&profile_handle)
    .ok_or_else(|| napi::Error::from_reason("unknown profile handle"))?
    .clone();
  let join = crate::pprof::encode_async(proto, now_nanos());
  let bytes = join.await.map_err(|e| napi::Error::from_reason(format!("encode task panicked: {e}")))?;
  Ok(bytes.into())
}
