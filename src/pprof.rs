//! pprof serializer (C9)
//!
//! Builds a string-interned, location/function-deduplicated pprof protobuf
//! profile from a reconciled wall-engine tree or a heap allocation tree,
//! then gzips it for upload. The wire types mirror `perftools.profiles.Profile`
//! field-for-field; they are hand-derived with `prost::Message` rather than
//! generated from a checked-in `.proto` file, since nothing else in the
//! crate needs a protobuf compiler on the build path.

use crate::context::ContextField;
use crate::host::AllocationNode;
use crate::wall::reconciler::ReconciledNode;
use prost::Message;
use std::collections::HashMap;
use std::io::Write;

/// `perftools.profiles.ValueType`.
#[derive(Clone, PartialEq, Message)]
pub struct ValueType {
  #[prost(int64, tag = "1")]
  pub r#type: i64,
  #[prost(int64, tag = "2")]
  pub unit: i64,
}

/// `perftools.profiles.Label`.
#[derive(Clone, PartialEq, Message)]
pub struct Label {
  #[prost(int64, tag = "1")]
  pub key: i64,
  #[prost(int64, tag = "2")]
  pub str: i64,
  #[prost(int64, tag = "3")]
  pub num: i64,
  #[prost(int64, tag = "4")]
  pub num_unit: i64,
}

/// `perftools.profiles.Sample`.
#[derive(Clone, PartialEq, Message)]
pub struct Sample {
  #[prost(uint64, repeated, tag = "1")]
  pub location_id: Vec<u64>,
  #[prost(int64, repeated, tag = "2")]
  pub value: Vec<i64>,
  #[prost(message, repeated, tag = "3")]
  pub label: Vec<Label>,
}

/// `perftools.profiles.Line`.
#[derive(Clone, PartialEq, Message)]
pub struct Line {
  #[prost(uint64, tag = "1")]
  pub function_id: u64,
  #[prost(int64, tag = "2")]
  pub line: i64,
}

/// `perftools.profiles.Location`.
#[derive(Clone, PartialEq, Message)]
pub struct Location {
  #[prost(uint64, tag = "1")]
  pub id: u64,
  #[prost(uint64, tag = "2")]
  pub mapping_id: u64,
  #[prost(uint64, tag = "3")]
  pub address: u64,
  #[prost(message, repeated, tag = "4")]
  pub line: Vec<Line>,
}

/// `perftools.profiles.Function`.
#[derive(Clone, PartialEq, Message)]
pub struct Function {
  #[prost(uint64, tag = "1")]
  pub id: u64,
  #[prost(int64, tag = "2")]
  pub name: i64,
  #[prost(int64, tag = "3")]
  pub system_name: i64,
  #[prost(int64, tag = "4")]
  pub filename: i64,
  #[prost(int64, tag = "5")]
  pub start_line: i64,
}

/// `perftools.profiles.Profile`, the top-level message.
#[derive(Clone, PartialEq, Message)]
pub struct ProfileProto {
  #[prost(message, repeated, tag = "1")]
  pub sample_type: Vec<ValueType>,
  #[prost(message, repeated, tag = "2")]
  pub sample: Vec<Sample>,
  #[prost(message, repeated, tag = "4")]
  pub location: Vec<Location>,
  #[prost(message, repeated, tag = "5")]
  pub function: Vec<Function>,
  #[prost(string, repeated, tag = "6")]
  pub string_table: Vec<String>,
  #[prost(int64, tag = "10")]
  pub time_nanos: i64,
  #[prost(int64, tag = "11")]
  pub duration_nanos: i64,
  #[prost(message, optional, tag = "12")]
  pub period_type: Option<ValueType>,
  #[prost(int64, tag = "13")]
  pub period: i64,
}

/// Optional source-map transform applied to a generated-code frame before
/// dedup, per §4.9's "Optional source-mapper hook".
pub trait SourceMapper {
  fn map(&self, script_id: i32, name: &str, line: i32, column: i32) -> Option<(String, String, i32, i32)>;
}

/// Interns strings into a pprof string table; index 0 is always `""`.
struct StringTable {
  strings: Vec<String>,
  index: HashMap<String, i64>,
}

impl StringTable {
  fn new() -> Self {
    Self {
      strings: vec![String::new()],
      index: HashMap::new(),
    }
  }

  fn intern(&mut self, s: &str) -> i64 {
    if s.is_empty() {
      return 0;
    }
    if let Some(&id) = self.index.get(s) {
      return id;
    }
    let id = self.strings.len() as i64;
    self.strings.push(s.to_string());
    self.index.insert(s.to_string(), id);
    id
  }
}

/// Dedup key for a `Function`: a frame resolves to the same function id
/// when its script and (name, or synthetic line:column when anonymous)
/// match. Anonymous frames at different sites stay distinct, per §4.9.
#[derive(Hash, PartialEq, Eq, Clone)]
struct FunctionKey {
  script_id: i32,
  name_or_site: String,
}

/// Dedup key for a `Location`: `(script_id, line, column, name)`.
#[derive(Hash, PartialEq, Eq, Clone)]
struct LocationKey {
  script_id: i32,
  line: i32,
  column: i32,
  name: String,
}

struct Builder {
  strings: StringTable,
  functions: HashMap<FunctionKey, u64>,
  function_list: Vec<Function>,
  locations: HashMap<LocationKey, u64>,
  location_list: Vec<Location>,
}

impl Builder {
  fn new() -> Self {
    Self {
      strings: StringTable::new(),
      functions: HashMap::new(),
      function_list: Vec::new(),
      locations: HashMap::new(),
      location_list: Vec::new(),
    }
  }

  fn anonymous_name(line: i32, column: i32, has_line: bool, has_column: bool) -> String {
    if has_line && has_column {
      format!("(anonymous:L{line}:C{column})")
    } else if has_line {
      format!("(anonymous:L{line})")
    } else {
      "(anonymous)".to_string()
    }
  }

  /// Resolves `(file, name, line, column)` for a frame, applying the
  /// caller's source mapper (if any) to generated-code frames first.
  fn resolve_frame(
    &mut self,
    mapper: Option<&dyn SourceMapper>,
    script_id: i32,
    mut file: String,
    mut name: String,
    mut line: i32,
    mut column: i32,
  ) -> (String, String, i32, i32) {
    if let Some(mapper) = mapper {
      if let Some((mfile, mname, mline, mcolumn)) = mapper.map(script_id, &name, line, column) {
        file = mfile;
        name = mname;
        line = mline;
        column = mcolumn;
      }
    }
    if let Some(stripped) = file.strip_prefix("file://") {
      file = stripped.to_string();
    }
    if name.is_empty() {
      name = Self::anonymous_name(line, column, line > 0, column > 0);
    }
    (file, name, line, column)
  }

  fn intern_function(&mut self, script_id: i32, file: &str, name: &str, line: i32, is_anonymous: bool) -> u64 {
    let name_or_site = if is_anonymous {
      format!("@{line}")
    } else {
      name.to_string()
    };
    let key = FunctionKey { script_id, name_or_site };
    if let Some(&id) = self.functions.get(&key) {
      return id;
    }
    let id = self.function_list.len() as u64 + 1;
    let name_id = self.strings.intern(name);
    let file_id = self.strings.intern(file);
    self.function_list.push(Function {
      id,
      name: name_id,
      system_name: name_id,
      filename: file_id,
      start_line: line as i64,
    });
    self.functions.insert(key, id);
    id
  }

  fn intern_location(&mut self, script_id: i32, file: &str, name: &str, line: i32, column: i32, is_anonymous: bool) -> u64 {
    let key = LocationKey {
      script_id,
      line,
      column,
      name: if is_anonymous { String::new() } else { name.to_string() },
    };
    if let Some(&id) = self.locations.get(&key) {
      return id;
    }
    let function_id = self.intern_function(script_id, file, name, line, is_anonymous);
    let id = self.location_list.len() as u64 + 1;
    self.location_list.push(Location {
      id,
      mapping_id: 0,
      address: 0,
      line: vec![Line { function_id, line: line as i64 }],
    });
    self.locations.insert(key, id);
    id
  }
}

/// Builds the labels a pprof sample carries for one attached context,
/// dropping fields that are neither a string nor a number per §4.9's
/// label-encoding rule.
fn context_labels(strings: &mut StringTable, fields: &[(String, ContextField)]) -> Vec<Label> {
  fields
    .iter()
    .map(|(k, v)| {
      let key = strings.intern(k);
      match v {
        ContextField::Str(s) => Label {
          key,
          str: strings.intern(s),
          num: 0,
          num_unit: 0,
        },
        ContextField::Num(n) => Label {
          key,
          str: 0,
          num: *n as i64,
          num_unit: 0,
        },
      }
    })
    .collect()
}

/// Wall-profile-specific inputs not carried on `ReconciledNode` itself.
pub struct WallSerializeOptions<'a> {
  pub interval_ns: i64,
  pub duration_ns: i64,
  pub has_cpu_time: bool,
  pub non_js_cpu_ns: Option<i64>,
  pub total_hit_count: u64,
  pub source_mapper: Option<&'a dyn SourceMapper>,
}

/// §4.9 wall serialization: walks a reconciled tree, emitting one sample
/// per attached context plus a residual sample for unattached hits, and
/// grafts the synthetic `Node.js` / `Garbage Collection` / `Non JS threads
/// activity` nodes.
pub fn serialize_wall(root: &ReconciledNode, opts: &WallSerializeOptions) -> ProfileProto {
  let mut b = Builder::new();
  let mut samples = Vec::new();

  let sample_label = b.strings.intern("sample");
  let count_label = b.strings.intern("count");
  let wall_label = b.strings.intern("wall");
  let nanoseconds_label = b.strings.intern("nanoseconds");
  let cpu_label = b.strings.intern("cpu");

  let mut sample_type = vec![
    ValueType { r#type: sample_label, unit: count_label },
    ValueType { r#type: wall_label, unit: nanoseconds_label },
  ];
  if opts.has_cpu_time {
    sample_type.push(ValueType { r#type: cpu_label, unit: nanoseconds_label });
  }

  let period = if opts.total_hit_count > 0 {
    (opts.duration_ns / opts.total_hit_count as i64).clamp(opts.interval_ns, 2 * opts.interval_ns)
  } else {
    opts.interval_ns
  };

  let mut gc_node: Option<&ReconciledNode> = None;
  walk_wall_node(root, &[], &mut b, &mut samples, opts, &mut gc_node);

  // Synthetic "Node.js" root wrapping GC and non-JS-CPU pseudo-children.
  let nodejs_loc = b.intern_location(0, "", "Node.js", 0, 0, false);
  if let Some(gc) = gc_node {
    let gc_loc = b.intern_location(0, "", "Garbage Collection", 0, 0, false);
    let hits = gc.residual_hits as i64 + gc.attached.len() as i64;
    if hits > 0 {
      let mut value = vec![hits, hits * opts.interval_ns];
      if opts.has_cpu_time {
        value.push(0);
      }
      samples.push(Sample {
        location_id: vec![gc_loc, nodejs_loc],
        value,
        label: vec![],
      });
    }
  }
  if let (true, Some(non_js)) = (opts.has_cpu_time, opts.non_js_cpu_ns) {
    let non_js_loc = b.intern_location(0, "", "Non JS threads activity", 0, 0, false);
    samples.push(Sample {
      location_id: vec![non_js_loc, nodejs_loc],
      value: vec![0, 0, non_js],
      label: vec![],
    });
  }

  ProfileProto {
    sample_type,
    sample: samples,
    location: b.location_list,
    function: b.function_list,
    string_table: b.strings.strings,
    time_nanos: 0,
    duration_nanos: opts.duration_ns,
    period_type: Some(ValueType { r#type: wall_label, unit: nanoseconds_label }),
    period,
  }
}

fn walk_wall_node<'a>(
  node: &'a ReconciledNode,
  parent_locations: &[u64],
  b: &mut Builder,
  samples: &mut Vec<Sample>,
  opts: &WallSerializeOptions,
  gc_node: &mut Option<&'a ReconciledNode>,
) {
  if node.is_idle || node.is_program {
    // Pseudo-nodes are dropped entirely: not emitted as their own
    // location, and their children still walk with the same ancestry.
    for child in &node.children {
      walk_wall_node(child, parent_locations, b, samples, opts, gc_node);
    }
    return;
  }
  if node.is_gc {
    *gc_node = Some(node);
    return;
  }

  let (file, name, line, column) = b.resolve_frame(
    opts.source_mapper,
    node.frame.script_id,
    node.frame.script_name.clone().unwrap_or_default(),
    node.frame.function_name.clone(),
    node.frame.line_number,
    node.frame.column_number,
  );
  let is_anonymous = node.frame.function_name.is_empty();
  let loc = b.intern_location(node.frame.script_id, &file, &name, line, column, is_anonymous);

  let mut locations = Vec::with_capacity(parent_locations.len() + 1);
  locations.push(loc);
  locations.extend_from_slice(parent_locations);

  for attached in &node.attached {
    let label = attached
      .context
      .as_ref()
      .map(|c| context_labels(&mut b.strings, &c.fields))
      .unwrap_or_default();
    let mut value = vec![1, opts.interval_ns];
    if opts.has_cpu_time {
      value.push(attached.cpu_delta.unwrap_or(0));
    }
    samples.push(Sample {
      location_id: locations.clone(),
      value,
      label,
    });
  }

  if node.residual_hits > 0 {
    let hits = node.residual_hits as i64;
    let mut value = vec![hits, hits * opts.interval_ns];
    if opts.has_cpu_time {
      value.push(0);
    }
    samples.push(Sample {
      location_id: locations.clone(),
      value,
      label: vec![],
    });
  }

  for child in &node.children {
    walk_wall_node(child, &locations, b, samples, opts, gc_node);
  }
}

/// §4.9 heap serialization: one sample per allocation bucket on a node.
pub fn serialize_heap(root: &AllocationNode, interval_bytes: u64, ignore_path: Option<&str>, source_mapper: Option<&dyn SourceMapper>) -> ProfileProto {
  let mut b = Builder::new();
  let mut samples = Vec::new();

  let objects_label = b.strings.intern("objects");
  let count_label = b.strings.intern("count");
  let space_label = b.strings.intern("space");
  let bytes_label = b.strings.intern("bytes");

  walk_heap_node(root, &[], &mut b, &mut samples, ignore_path, source_mapper);

  ProfileProto {
    sample_type: vec![
      ValueType { r#type: objects_label, unit: count_label },
      ValueType { r#type: space_label, unit: bytes_label },
    ],
    sample: samples,
    location: b.location_list,
    function: b.function_list,
    string_table: b.strings.strings,
    time_nanos: 0,
    duration_nanos: 0,
    period_type: Some(ValueType { r#type: space_label, unit: bytes_label }),
    period: interval_bytes as i64,
  }
}

fn walk_heap_node(
  node: &AllocationNode,
  parent_locations: &[u64],
  b: &mut Builder,
  samples: &mut Vec<Sample>,
  ignore_path: Option<&str>,
  source_mapper: Option<&dyn SourceMapper>,
) {
  if let Some(ignore) = ignore_path {
    if !node.script_name.is_empty() && node.script_name.contains(ignore) {
      return;
    }
  }

  let (file, name, line, column) = b.resolve_frame(
    source_mapper,
    node.script_id,
    node.script_name.clone(),
    node.name.clone(),
    node.line_number,
    node.column_number,
  );
  let is_anonymous = node.name.is_empty();
  let loc = b.intern_location(node.script_id, &file, &name, line, column, is_anonymous);

  let mut locations = Vec::with_capacity(parent_locations.len() + 1);
  locations.push(loc);
  locations.extend_from_slice(parent_locations);

  for alloc in &node.allocations {
    samples.push(Sample {
      location_id: locations.clone(),
      value: vec![alloc.count as i64, (alloc.count * alloc.size) as i64],
      label: vec![],
    });
  }

  for child in &node.children {
    walk_heap_node(child, &locations, b, samples, ignore_path, source_mapper);
  }
}

/// Synchronous gzip encode of a built profile. `time_nanos` is stamped
/// here (at encode time, not build time) so serializing the same
/// `TimeProfile`/`AllocationNode` twice is otherwise byte-identical per
/// the idempotence property in §8.
pub fn encode(profile: &ProfileProto, time_nanos: i64) -> Vec<u8> {
  let mut stamped = profile.clone();
  stamped.time_nanos = time_nanos;
  let bytes = stamped.encode_to_vec();
  let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
  encoder.write_all(&bytes).expect("in-memory gzip write cannot fail");
  encoder.finish().expect("in-memory gzip finish cannot fail")
}

/// Async variant: runs the (CPU-bound, potentially large) encode on a
/// blocking-pool thread rather than the async runtime's worker threads.
pub fn encode_async(profile: ProfileProto, time_nanos: i64) -> tokio::task::JoinHandle<Vec<u8>> {
  tokio::task::spawn_blocking(move || encode(&profile, time_nanos))
}
