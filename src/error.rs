//! Error handling for xprofiler-rs
//!
//! `ProfilerError` is the taxonomy the wall and heap engines actually return
//! to callers (lifecycle misuse, incompatible configuration, host-runtime
//! conflicts). `XProfilerError` wraps it together with the ambient-plumbing
//! failures (I/O, platform detection, logging) so the rest of the crate has
//! a single error type to propagate with `?`.

use std::fmt;
use thiserror::Error;

/// Errors the wall/heap profiler core can report to a caller.
///
/// Signal-handler-internal anomalies (ring overflow, stuck-loop detection)
/// are deliberately not variants here: the spec treats them as counters /
/// return-value metadata, not raised errors, because they must never be
/// surfaced across an async-signal boundary.
#[derive(Debug, Error)]
pub enum ProfilerError {
  #[error("profiler already started")]
  AlreadyStarted,

  #[error("profiler not started")]
  NotStarted,

  #[error("incompatible configuration: {0}")]
  IncompatibleConfig(&'static str),

  #[error("another CPU profiler is already active on this isolate")]
  AnotherProfilerActive,

  #[error("failed to spawn allocation exporter: {0}")]
  ExporterSpawnFailed(#[source] std::io::Error),

  #[error("allocation exporter timed out")]
  ExporterTimedOut,

  #[error("failed to install SIGPROF handler: {0}")]
  SignalInstallFailed(#[source] std::io::Error),
}

pub type ProfilerResult<T> = Result<T, ProfilerError>;

/// I/O error kinds, kept distinct from `std::io::ErrorKind` so ambient
/// errors can be matched on without depending on unstable io::ErrorKind
/// variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoErrorKind {
  NotFound,
  PermissionDenied,
  TimedOut,
  InvalidInput,
  InvalidData,
  Other,
}

impl From<std::io::ErrorKind> for IoErrorKind {
  fn from(kind: std::io::ErrorKind) -> Self {
    match kind {
      std::io::ErrorKind::NotFound => IoErrorKind::NotFound,
      std::io::ErrorKind::PermissionDenied => IoErrorKind::PermissionDenied,
      std::io::ErrorKind::TimedOut => IoErrorKind::TimedOut,
      std::io::ErrorKind::InvalidInput => IoErrorKind::InvalidInput,
      std::io::ErrorKind::InvalidData => IoErrorKind::InvalidData,
      _ => IoErrorKind::Other,
    }
  }
}

impl fmt::Display for IoErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:?}", self)
  }
}

/// Top-level error type threading the profiler core and its surrounding
/// ambient plumbing (config/log/platform failures) through one enum.
#[derive(Debug, Error)]
pub enum XProfilerError {
  #[error(transparent)]
  Profiler(#[from] ProfilerError),

  #[error("I/O error ({kind}){}: {message}", path.as_deref().map(|p| format!(" [{p}]")).unwrap_or_default())]
  Io {
    message: String,
    path: Option<String>,
    kind: IoErrorKind,
  },

  #[error("platform error ({platform}): {message}")]
  Platform { message: String, platform: String },

  #[error("logger error: {message}")]
  Logger { message: String },

  #[error("{0}")]
  Generic(String),
}

pub type XProfilerResult<T> = Result<T, XProfilerError>;

impl From<std::io::Error> for XProfilerError {
  fn from(err: std::io::Error) -> Self {
    XProfilerError::Io {
      kind: err.kind().into(),
      message: err.to_string(),
      path: None,
    }
  }
}

impl From<&str> for XProfilerError {
  fn from(message: &str) -> Self {
    XProfilerError::Generic(message.to_string())
  }
}

impl From<String> for XProfilerError {
  fn from(message: String) -> Self {
    XProfilerError::Generic(message)
  }
}

/// Platform-specific error helpers, used where the ambient code surfaces a
/// raw errno/Windows error code rather than a `std::io::Error`.
pub mod platform {
  use super::*;

  #[cfg(unix)]
  pub fn errno_to_error(errno: i32, syscall: Option<&str>) -> XProfilerError {
    let message = nix::errno::Errno::from_raw(errno).to_string();
    XProfilerError::Platform {
      message: match syscall {
        Some(s) => format!("{message} (syscall: {s})"),
        None => message,
      },
      platform: "unix".to_string(),
    }
  }

  #[cfg(windows)]
  pub fn win_error_to_error(error_code: u32, operation: Option<&str>) -> XProfilerError {
    XProfilerError::Platform {
      message: match operation {
        Some(op) => format!("windows error {error_code} (operation: {op})"),
        None => format!("windows error {error_code}"),
      },
      platform: "windows".to_string(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn profiler_error_display() {
    let err = ProfilerError::IncompatibleConfig("cpu_without_contexts");
    assert!(err.to_string().contains("cpu_without_contexts"));
  }

  #[test]
  fn io_error_conversion_preserves_kind() {
    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
    let wrapped: XProfilerError = io_err.into();
    match wrapped {
      XProfilerError::Io { kind, .. } => assert_eq!(kind, IoErrorKind::NotFound),
      _ => panic!("expected Io variant"),
    }
  }

  #[test]
  fn profiler_error_wraps_through_from() {
    let err: XProfilerError = ProfilerError::AlreadyStarted.into();
    assert!(matches!(err, XProfilerError::Profiler(ProfilerError::AlreadyStarted)));
  }
}
