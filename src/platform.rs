//! Platform capability detection.
//!
//! The wall engine needs one fact from the host OS: can it deliver
//! `SIGPROF` to a specific thread. Everything else the profiler does is
//! expressed against the `host`/`clock` abstractions instead of raw
//! platform queries, so this module stays intentionally narrow.

/// Whether this platform can deliver `SIGPROF` to a specific thread, which
/// the wall engine's context reconciliation depends on entirely.
pub fn supports_sigprof() -> bool {
  #[cfg(unix)]
  {
    true
  }
  #[cfg(not(unix))]
  {
    false
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn matches_target_family() {
    assert_eq!(supports_sigprof(), cfg!(unix));
  }
}
