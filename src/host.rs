//! Host-runtime collaborator interfaces
//!
//! The wall and heap engines sit on top of primitives the spec treats as
//! external collaborators: the host's own CPU/heap profiler, its
//! interrupt mechanism, and its async-task identifier. These are modeled
//! as narrow traits so the hard concurrency/reconciliation/serialization
//! logic is host-agnostic and testable without linking V8; a real N-API
//! binding implements `CpuProfilerHost`/`HeapProfilerHost` against the
//! embedding engine.

use crate::error::ProfilerError;

/// A single stack frame as reported by the host's CPU profiler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostFrame {
  pub function_name: String,
  /// `None` for anonymous/native frames.
  pub script_name: Option<String>,
  pub script_id: i32,
  pub line_number: i32,
  pub column_number: i32,
}

/// One node of the host's call tree. `hit_count` is the number of tick
/// samples that landed exactly on this node (not descendants).
#[derive(Debug, Clone)]
pub struct CpuProfileNode {
  pub id: u32,
  pub frame: HostFrame,
  pub hit_count: u32,
  pub children: Vec<CpuProfileNode>,
}

impl CpuProfileNode {
  pub fn is_idle(&self) -> bool {
    self.frame.function_name == "(idle)"
  }

  pub fn is_program(&self) -> bool {
    self.frame.function_name == "(program)"
  }

  pub fn is_gc(&self) -> bool {
    self.frame.function_name == "(garbage collector)"
  }
}

/// A host-produced CPU profile: a call tree plus the leaf node id visited
/// by each sample, in sample order, alongside that sample's timestamp.
/// Treated read-only by the core (§3 "Sample (host-produced)").
#[derive(Debug, Clone)]
pub struct HostCpuProfile {
  pub root: CpuProfileNode,
  /// `node_id_at(i)` is the node reached by sample `i`.
  pub sample_node_ids: Vec<u32>,
  /// `ts(i)`, in the same microsecond clock as `clock::now_us`.
  pub timestamps: Vec<i64>,
  pub start_time_us: i64,
  pub end_time_us: i64,
}

/// One allocation bucket recorded at a tree node.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
  pub count: u64,
  pub size: u64,
}

/// A node of the host's allocation tree (§3 "Allocation Node").
#[derive(Debug, Clone, Default)]
pub struct AllocationNode {
  pub name: String,
  pub script_name: String,
  pub script_id: i32,
  pub line_number: i32,
  pub column_number: i32,
  pub allocations: Vec<Allocation>,
  pub children: Vec<AllocationNode>,
}

/// The host's own sampling CPU profiler (§2 OUT OF SCOPE: "assumed to
/// provide StartProfiling/StopProfiling, CollectSample").
///
/// `collect_sample` and `current_async_id` may be called from within the
/// SIGPROF handler and must be implemented in an async-signal-safe way by
/// any real binding (the host runtime exposes them precisely because they
/// are interrupt-safe).
pub trait CpuProfilerHost: Send + Sync {
  /// Starts (or rotates) the host profiler under `title`. Host runtimes
  /// reuse titles because they are not released until the profiler object
  /// is disposed (§4.6 start_internal).
  fn start_profiling(
    &self,
    title: &str,
    include_line_numbers: bool,
  ) -> Result<(), ProfilerError>;

  /// Stops the profiler started under `title` and takes ownership of the
  /// resulting sample tree.
  fn stop_profiling(&self, title: &str) -> HostCpuProfile;

  /// Forces a non-tick sample, used by the V8-bug workaround to probe
  /// whether the host's sample processor is alive. Async-signal-safe is
  /// not required here — called only from the owning thread at start.
  fn collect_sample(&self);

  /// Async-signal-safe, interrupt-safe query for the currently executing
  /// async task id, if any.
  fn current_async_id(&self) -> Option<f64>;
}

/// Heap-object statistics as the host's `GetHeapStatistics` reports them
/// (§4.8 step 3: enumerated and emitted to stderr on every near-heap-limit
/// reaction, independent of `dump_to_stderr`).
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStatistics {
  pub total_heap_size: u64,
  pub total_heap_size_executable: u64,
  pub total_physical_size: u64,
  pub total_available_size: u64,
  pub used_heap_size: u64,
  pub heap_size_limit: u64,
  pub malloced_memory: u64,
  pub peak_malloced_memory: u64,
  pub does_zap_garbage: bool,
  pub number_of_native_contexts: u32,
  pub number_of_detached_contexts: u32,
}

/// The host's near-heap-limit / allocation-profile primitives (§2 OUT OF
/// SCOPE: "AddNearHeapLimitCallback, GetAllocationProfile").
pub trait HeapProfilerHost: Send + Sync {
  fn start_sampling(&self, interval_bytes: u64, stack_depth: u32);
  fn stop_sampling(&self);
  fn get_allocation_profile(&self) -> AllocationNode;

  /// Enumerates heap-object statistics, called unconditionally at the top
  /// of the near-heap-limit reaction (§4.8 step 3).
  fn heap_statistics(&self) -> HeapStatistics;

  /// Installs the near-heap-limit reaction. The host calls back with
  /// `(current_limit, initial_limit)` and expects a new limit in return.
  fn add_near_heap_limit_callback(&self, initial_limit: u64);
  fn remove_near_heap_limit_callback(&self);

  /// Requests the host run a closure on the managed thread via its
  /// interrupt mechanism (used for `Interrupt` callback mode).
  fn request_interrupt(&self);
  /// Posts a wakeup to the host's event loop (used for `Async` mode).
  fn post_to_event_loop(&self);
  /// Triggers the host's own out-of-memory termination path.
  fn low_memory_notification(&self);
}
