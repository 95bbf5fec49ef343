//! Monotonic clock & CPU clocks (C1)
//!
//! `now_us()` must be comparable to the timestamps the host runtime stamps
//! on its own CPU-profiler samples — on every platform we target that means
//! a monotonic clock, not wall-clock `SystemTime`, so `Instant`-relative
//! microseconds anchored to process start.

use once_cell::sync::Lazy;
use std::time::Instant;

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic microsecond timestamp, comparable across calls and to the
/// host runtime's own sample timestamps (same underlying clock source:
/// `CLOCK_MONOTONIC` on unix, `QueryPerformanceCounter` on windows, both of
/// which `std::time::Instant` is built on).
pub fn now_us() -> i64 {
  PROCESS_START.elapsed().as_micros() as i64
}

/// Thread CPU time in nanoseconds, or `None` on platforms without a
/// thread-CPU counter. The caller (wall engine) fixes this choice at
/// profiler construction and never falls back mid-profile, so a sample
/// value vector's shape never changes within one profile.
#[cfg(target_os = "linux")]
pub fn thread_cpu_ns() -> Option<i64> {
  let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
  let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
  if rc != 0 {
    return None;
  }
  Some(ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64)
}

#[cfg(target_os = "macos")]
pub fn thread_cpu_ns() -> Option<i64> {
  use std::convert::TryInto;
  unsafe {
    let mut info: libc::thread_basic_info = std::mem::zeroed();
    let mut count = (std::mem::size_of::<libc::thread_basic_info>()
      / std::mem::size_of::<libc::integer_t>()) as libc::mach_msg_type_number_t;
    let kr = libc::thread_info(
      libc::mach_thread_self(),
      libc::THREAD_BASIC_INFO,
      &mut info as *mut _ as libc::thread_info_t,
      &mut count,
    );
    if kr != libc::KERN_SUCCESS {
      return None;
    }
    let user_us = info.user_time.seconds as i64 * 1_000_000 + info.user_time.microseconds as i64;
    let sys_us = info.system_time.seconds as i64 * 1_000_000 + info.system_time.microseconds as i64;
    ((user_us + sys_us) * 1000).try_into().ok()
  }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn thread_cpu_ns() -> Option<i64> {
  None
}

/// Process CPU time in nanoseconds (user + system), non-decreasing.
#[cfg(unix)]
pub fn process_cpu_ns() -> i64 {
  let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
  let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
  if rc != 0 {
    return 0;
  }
  let to_ns = |tv: libc::timeval| tv.tv_sec as i64 * 1_000_000_000 + tv.tv_usec as i64 * 1000;
  to_ns(usage.ru_utime) + to_ns(usage.ru_stime)
}

#[cfg(windows)]
pub fn process_cpu_ns() -> i64 {
  use winapi::shared::minwindef::FILETIME;
  use winapi::um::processthreadsapi::{GetCurrentProcess, GetProcessTimes};

  let filetime_to_ns = |ft: FILETIME| -> i64 {
    (((ft.dwHighDateTime as u64) << 32 | ft.dwLowDateTime as u64) * 100) as i64
  };

  unsafe {
    let mut creation = std::mem::zeroed();
    let mut exit = std::mem::zeroed();
    let mut kernel = std::mem::zeroed();
    let mut user = std::mem::zeroed();
    let ok = GetProcessTimes(
      GetCurrentProcess(),
      &mut creation,
      &mut exit,
      &mut kernel,
      &mut user,
    );
    if ok == 0 {
      return 0;
    }
    filetime_to_ns(kernel) + filetime_to_ns(user)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn now_us_is_monotonic() {
    let a = now_us();
    std::thread::sleep(std::time::Duration::from_micros(50));
    let b = now_us();
    assert!(b >= a);
  }

  #[test]
  fn process_cpu_ns_is_nonzero_after_work() {
    let mut x = 0u64;
    for i in 0..5_000_000u64 {
      x = x.wrapping_add(i);
    }
    std::hint::black_box(x);
    assert!(process_cpu_ns() >= 0);
  }
}
