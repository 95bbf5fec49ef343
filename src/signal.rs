//! Signal dispatcher (C4)
//!
//! Process-wide SIGPROF action, chained to whatever was previously
//! installed (in production, the host runtime's own SIGPROF-based
//! sampler). `increase_use`/`decrease_use` implement a refcounted
//! install/teardown protocol: every `increase_use` reinstalls our handler
//! — even if the count was already nonzero — because some other actor may
//! have reinstalled its own handler over ours since the last call; the
//! handler's own identity is never captured as "prior" so this can never
//! chain to itself.
//!
//! Everything below `handle_sigprof` runs in an async-signal-safe context:
//! no allocation, no blocking, no reentrant locking.
//!
//! SIGPROF is POSIX-only. `WallProfilerConfig::validate` already rejects
//! any configuration that would reach this module on a platform without
//! it (`platform::supports_sigprof`), but `wall`'s call sites still need
//! to type-check on every target, so non-unix gets a stub with the same
//! public API that simply refuses to install.

#[cfg(unix)]
mod imp {
  use crate::context_ring::ContextRecord;
  use crate::error::ProfilerError;
  use crate::registry::CollectionMode;
  pub use crate::registry::{current_thread_key, global_registry};
  use std::os::raw::c_int;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;

  static USE_COUNT: AtomicUsize = AtomicUsize::new(0);
  static INSTALL_MUTEX: Mutex<()> = Mutex::new(());

  /// 0 = no prior handler (SIG_DFL/SIG_IGN), 1 = simple `fn(c_int)`,
  /// 2 = `SA_SIGINFO` `fn(c_int, *mut siginfo_t, *mut c_void)`.
  static PRIOR_KIND: AtomicUsize = AtomicUsize::new(0);
  static PRIOR_FN: AtomicUsize = AtomicUsize::new(0);

  /// Installs (or reinstalls) the process-wide SIGPROF action and bumps the
  /// use count. Called once per wall profiler `start`/restart that needs
  /// signal delivery (`with_contexts || workaround_v8_bug`).
  pub fn increase_use() -> Result<(), ProfilerError> {
    let _guard = INSTALL_MUTEX.lock().unwrap();
    USE_COUNT.fetch_add(1, Ordering::SeqCst);
    install()
  }

  /// Decrements the use count, restoring the saved prior action once it
  /// reaches zero.
  pub fn decrease_use() {
    let _guard = INSTALL_MUTEX.lock().unwrap();
    let prev = USE_COUNT.fetch_sub(1, Ordering::SeqCst);
    if prev == 1 {
      restore();
    }
  }

  fn install() -> Result<(), ProfilerError> {
    unsafe {
      let mut new_action: libc::sigaction = std::mem::zeroed();
      new_action.sa_sigaction = handle_sigprof as usize;
      new_action.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO | libc::SA_ONSTACK;
      libc::sigemptyset(&mut new_action.sa_mask);

      let mut old_action: libc::sigaction = std::mem::zeroed();
      let rc = libc::sigaction(libc::SIGPROF, &new_action, &mut old_action);
      if rc != 0 {
        return Err(ProfilerError::SignalInstallFailed(std::io::Error::last_os_error()));
      }

      if old_action.sa_sigaction != handle_sigprof as usize {
        store_prior(&old_action);
      }
    }
    Ok(())
  }

  fn restore() {
    unsafe {
      let kind = PRIOR_KIND.load(Ordering::Acquire);
      let mut action: libc::sigaction = std::mem::zeroed();
      match kind {
        0 => {
          action.sa_sigaction = libc::SIG_DFL;
        }
        1 | 2 => {
          action.sa_sigaction = PRIOR_FN.load(Ordering::Acquire);
          if kind == 2 {
            action.sa_flags = libc::SA_SIGINFO;
          }
        }
        _ => unreachable!(),
      }
      libc::sigemptyset(&mut action.sa_mask);
      libc::sigaction(libc::SIGPROF, &action, std::ptr::null_mut());
    }
    PRIOR_KIND.store(0, Ordering::Release);
    PRIOR_FN.store(0, Ordering::Release);
  }

  unsafe fn store_prior(old: &libc::sigaction) {
    let handler = old.sa_sigaction;
    if handler == libc::SIG_DFL || handler == libc::SIG_IGN {
      PRIOR_KIND.store(0, Ordering::Release);
      PRIOR_FN.store(0, Ordering::Release);
    } else if old.sa_flags & libc::SA_SIGINFO != 0 {
      PRIOR_FN.store(handler, Ordering::Release);
      PRIOR_KIND.store(2, Ordering::Release);
    } else {
      PRIOR_FN.store(handler, Ordering::Release);
      PRIOR_KIND.store(1, Ordering::Release);
    }
  }

  fn forward(signum: c_int, info: *mut libc::siginfo_t, ctx: *mut std::os::raw::c_void) {
    let fn_ptr = PRIOR_FN.load(Ordering::Acquire);
    if fn_ptr == 0 {
      return;
    }
    match PRIOR_KIND.load(Ordering::Acquire) {
      1 => {
        let f: extern "C" fn(c_int) = unsafe { std::mem::transmute(fn_ptr) };
        f(signum);
      }
      2 => {
        let f: extern "C" fn(c_int, *mut libc::siginfo_t, *mut std::os::raw::c_void) =
          unsafe { std::mem::transmute(fn_ptr) };
        f(signum, info, ctx);
      }
      _ => {}
    }
  }

  /// The SIGPROF handler body. Steps numbered to match §4.4 of the design.
  extern "C" fn handle_sigprof(signum: c_int, info: *mut libc::siginfo_t, ctx: *mut std::os::raw::c_void) {
    // 1. Load the prior handler atomically; a null prior means forwarding
    // below could never reach a real handler, so there would be no host
    // tick for any context record this invocation appended. Bail out.
    if PRIOR_FN.load(Ordering::Acquire) == 0 {
      return;
    }

    // 2. Look up the profiler bound to this thread.
    let profiler = match global_registry().get(current_thread_key()) {
      Some(p) => p,
      None => {
        forward(signum, info, ctx);
        return;
      }
    };

    // 3. Branch on collection mode.
    match profiler.collection_mode() {
      CollectionMode::NoCollect => {
        profiler.bump_no_collect_call_count();
        return;
      }
      CollectionMode::PassThrough => {
        forward(signum, info, ctx);
        return;
      }
      CollectionMode::CollectContexts => {}
    }

    // 4. Optionally sample CPU time.
    let cpu_time = if profiler.collect_cpu_time() {
      crate::clock::thread_cpu_ns()
    } else {
      None
    };

    // 5. Bracket the host-runtime tick with monotonic timestamps.
    let t_from = crate::clock::now_us();
    forward(signum, info, ctx);
    let t_to = crate::clock::now_us();

    // 6. Interrupt-safe async-task id query.
    let async_id = profiler.current_async_id();

    // 7. Append to the ring.
    profiler.context_ring().push(ContextRecord {
      context: profiler.context_cell().get(),
      t_from,
      t_to,
      cpu_time,
      async_id,
    });
    profiler.bump_sample_count();
  }

  #[cfg(test)]
  mod tests {
    use super::*;
    use crate::context::ContextCell;
    use crate::context_ring::ContextRing;
    use crate::registry::{AtomicCollectionMode, SignalTarget};
    use serial_test::serial;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    struct TestTarget {
      mode: AtomicCollectionMode,
      cell: ContextCell,
      ring: ContextRing,
      no_collect_calls: AtomicU64,
      sample_count: AtomicU64,
    }

    impl SignalTarget for TestTarget {
      fn collection_mode(&self) -> CollectionMode {
        self.mode.load()
      }
      fn bump_no_collect_call_count(&self) {
        self.no_collect_calls.fetch_add(1, Ordering::Relaxed);
      }
      fn bump_sample_count(&self) {
        self.sample_count.fetch_add(1, Ordering::Relaxed);
      }
      fn collect_cpu_time(&self) -> bool {
        false
      }
      fn context_cell(&self) -> &ContextCell {
        &self.cell
      }
      fn context_ring(&self) -> &ContextRing {
        &self.ring
      }
      fn current_async_id(&self) -> Option<f64> {
        None
      }
    }

    static SAW_TICK: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn fake_host_sampler(_signum: c_int, _info: *mut libc::siginfo_t, _ctx: *mut std::os::raw::c_void) {
      SAW_TICK.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    #[serial]
    fn handler_chains_to_prior_and_appends_ring_record() {
      SAW_TICK.store(0, Ordering::SeqCst);

      // Simulate the host runtime's own SIGPROF-based sampler being
      // installed first, the way V8's CpuProfiler would be.
      unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = fake_host_sampler as usize;
        action.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGPROF, &action, std::ptr::null_mut());
      }

      increase_use().unwrap();

      let target: Arc<dyn SignalTarget> = Arc::new(TestTarget {
        mode: AtomicCollectionMode::new(CollectionMode::CollectContexts),
        cell: ContextCell::new(),
        ring: ContextRing::new(16),
        no_collect_calls: AtomicU64::new(0),
        sample_count: AtomicU64::new(0),
      });
      global_registry().add(current_thread_key(), target.clone(), true, 0);

      unsafe {
        libc::raise(libc::SIGPROF);
      }

      assert_eq!(SAW_TICK.load(Ordering::SeqCst), 1);
      let ring = target.context_ring();
      assert_eq!(ring.drain().len(), 1);

      global_registry().remove(current_thread_key(), 0);
      decrease_use();
    }

    #[test]
    #[serial]
    fn no_collect_mode_counts_without_forwarding() {
      SAW_TICK.store(0, Ordering::SeqCst);
      unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = fake_host_sampler as usize;
        action.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGPROF, &action, std::ptr::null_mut());
      }
      increase_use().unwrap();

      let target = Arc::new(TestTarget {
        mode: AtomicCollectionMode::new(CollectionMode::NoCollect),
        cell: ContextCell::new(),
        ring: ContextRing::new(16),
        no_collect_calls: AtomicU64::new(0),
        sample_count: AtomicU64::new(0),
      });
      global_registry().add(current_thread_key(), target.clone() as Arc<dyn SignalTarget>, true, 0);

      unsafe {
        libc::raise(libc::SIGPROF);
      }

      assert_eq!(SAW_TICK.load(Ordering::SeqCst), 0);
      assert_eq!(target.no_collect_calls.load(Ordering::SeqCst), 1);

      global_registry().remove(current_thread_key(), 0);
      decrease_use();
    }
  }
}

#[cfg(not(unix))]
mod imp {
  use crate::error::ProfilerError;
  pub use crate::registry::{current_thread_key, global_registry};

  pub fn increase_use() -> Result<(), ProfilerError> {
    Err(ProfilerError::IncompatibleConfig("signal_unsupported_on_platform"))
  }

  pub fn decrease_use() {}
}

pub use imp::*;
