//! Sample reconciler (C7)
//!
//! Matches host CPU-profiler samples to context-ring records by timestamp,
//! tolerating a 2-deep reordering window, and folds the result into a tree
//! the pprof serializer can walk directly.

use crate::context::Context;
use crate::context_ring::ContextRecord;
use crate::host::{CpuProfileNode, HostCpuProfile, HostFrame};
use std::collections::HashMap;

/// A context record matched to a host sample that landed on a given node.
#[derive(Debug, Clone)]
pub struct AttachedContext {
  pub context: Option<Context>,
  /// `None` when CPU-time collection is off, or when this match landed on
  /// an idle/program pseudo-node (which never threads through `last_cpu`).
  pub cpu_delta: Option<i64>,
}

/// The host's call tree, annotated with reconciled context attachments and
/// the per-node hit count left unattached ("residual" — either because
/// contexts are disabled or because the matching policy left some samples
/// without a record).
#[derive(Debug, Clone)]
pub struct ReconciledNode {
  pub frame: HostFrame,
  pub is_idle: bool,
  pub is_program: bool,
  pub is_gc: bool,
  pub residual_hits: u32,
  pub attached: Vec<AttachedContext>,
  pub children: Vec<ReconciledNode>,
}

/// Matches §4.7's offset-cycling out-of-order policy: at most two
/// consecutive samples are assumed swapped, so a freshly detected swap at
/// index `i` is corrected by processing `i+1` in `i`'s slot and owing a
/// compensating `-1` at `i+1` (processing `i` there instead), then the
/// cycle returns to `0` until the next detection.
struct DeltaCycle {
  pending: Option<i64>,
}

impl DeltaCycle {
  fn new() -> Self {
    Self { pending: None }
  }

  /// Called once per outer-loop index. `swapped` is whether `ts(i+1) <
  /// ts(i)` was freshly observed at this index; it is ignored if a
  /// compensating delta from the previous index is still owed.
  fn next(&mut self, swapped: bool) -> i64 {
    if let Some(d) = self.pending.take() {
      return d;
    }
    if swapped {
      self.pending = Some(-1);
      1
    } else {
      0
    }
  }
}

fn index_pseudo_nodes(node: &CpuProfileNode, out: &mut HashMap<u32, bool>) {
  out.insert(node.id, node.is_idle() || node.is_program());
  for child in &node.children {
    index_pseudo_nodes(child, out);
  }
}

/// Reconciles host samples against drained context records, returning the
/// node-id → attachments map the tree walk in [`build_reconciled_tree`]
/// consumes.
fn match_samples(
  profile: &HostCpuProfile,
  records: &[ContextRecord],
  collect_cpu_time: bool,
) -> HashMap<u32, Vec<AttachedContext>> {
  let mut attachments: HashMap<u32, Vec<AttachedContext>> = HashMap::new();
  let n = profile.sample_node_ids.len();
  if n <= 1 {
    return attachments;
  }

  let mut pseudo = HashMap::new();
  index_pseudo_nodes(&profile.root, &mut pseudo);

  let mut cycle = DeltaCycle::new();
  let mut ridx = 0usize;
  let mut last_cpu: Option<i64> = None;

  // S[0] is the non-tick startup sample; the host still counts it in the
  // node's own hit_count, but it never participates in matching.
  let mut i = 1usize;
  while i < n {
    let swapped = i + 1 < n && profile.timestamps[i + 1] < profile.timestamps[i];
    let delta = cycle.next(swapped);
    let eff = i as i64 + delta;
    if eff < 0 || eff as usize >= n {
      i += 1;
      continue;
    }
    let eff = eff as usize;
    let ts = profile.timestamps[eff];
    let node_id = profile.sample_node_ids[eff];

    while ridx < records.len() && records[ridx].t_to < ts {
      ridx += 1;
    }

    if ridx < records.len() && records[ridx].t_from <= ts {
      let record = &records[ridx];
      let is_pseudo = pseudo.get(&node_id).copied().unwrap_or(false);
      let cpu_delta = if collect_cpu_time && !is_pseudo {
        let delta = record.cpu_time.and_then(|c| last_cpu.map(|l| c - l));
        if let Some(c) = record.cpu_time {
          last_cpu = Some(c);
        }
        delta
      } else {
        None
      };
      attachments.entry(node_id).or_default().push(AttachedContext {
        context: record.context.clone(),
        cpu_delta,
      });
      ridx += 1;
    }
    // Else: the closest record is still too new for this sample (`t_from >
    // ts`); leave it in place for the next iteration, per §4.7.

    i += 1;
  }

  attachments
}

fn build_reconciled_tree(node: &CpuProfileNode, attachments: &HashMap<u32, Vec<AttachedContext>>) -> ReconciledNode {
  let attached = attachments.get(&node.id).cloned().unwrap_or_default();
  let residual_hits = node.hit_count.saturating_sub(attached.len() as u32);
  ReconciledNode {
    frame: node.frame.clone(),
    is_idle: node.is_idle(),
    is_program: node.is_program(),
    is_gc: node.is_gc(),
    residual_hits,
    attached,
    children: node
      .children
      .iter()
      .map(|c| build_reconciled_tree(c, attachments))
      .collect(),
  }
}

/// Entry point: reconcile a host profile's samples against the context
/// records drained for the same run, producing an annotated tree.
pub fn reconcile(profile: &HostCpuProfile, records: &[ContextRecord], collect_cpu_time: bool) -> ReconciledNode {
  let attachments = match_samples(profile, records, collect_cpu_time);
  build_reconciled_tree(&profile.root, &attachments)
}

/// §7 stuck-event-loop detection, computed from the just-stopped host
/// profile and the reconciler's own `sample_count`.
pub fn detect_stuck_level(profile: &HostCpuProfile, sample_count: u64) -> u8 {
  let mut total_hits = 0u64;
  let mut no_hit_leaf = false;
  fn walk(node: &CpuProfileNode, total_hits: &mut u64, no_hit_leaf: &mut bool) {
    *total_hits += node.hit_count as u64;
    if node.children.is_empty() && node.hit_count == 0 {
      *no_hit_leaf = true;
    }
    for child in &node.children {
      walk(child, total_hits, no_hit_leaf);
    }
  }
  walk(&profile.root, &mut total_hits, &mut no_hit_leaf);

  if total_hits == 0 {
    2
  } else if sample_count == total_hits && !no_hit_leaf {
    1
  } else {
    0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::context::{ContextField, ContextValue};
  use std::sync::Arc;

  fn frame(name: &str) -> HostFrame {
    HostFrame {
      function_name: name.to_string(),
      script_name: Some("app.js".to_string()),
      script_id: 1,
      line_number: 1,
      column_number: 1,
    }
  }

  fn leaf(id: u32, name: &str, hits: u32) -> CpuProfileNode {
    CpuProfileNode {
      id,
      frame: frame(name),
      hit_count: hits,
      children: vec![],
    }
  }

  fn record(t_from: i64, t_to: i64) -> ContextRecord {
    ContextRecord {
      context: Some(Arc::new(ContextValue::new(vec![]))),
      t_from,
      t_to,
      cpu_time: None,
      async_id: None,
    }
  }

  fn labeled_record(t_from: i64, t_to: i64, label: &str) -> ContextRecord {
    ContextRecord {
      context: Some(Arc::new(ContextValue::new(vec![("label".to_string(), ContextField::Str(label.to_string()))]))),
      t_from,
      t_to,
      cpu_time: None,
      async_id: None,
    }
  }

  fn label_of(attached: &AttachedContext) -> &str {
    match &attached.context.as_ref().unwrap().fields[0].1 {
      ContextField::Str(s) => s.as_str(),
      _ => panic!("expected string label"),
    }
  }

  #[test]
  fn out_of_order_pair_reorders_via_delta_cycle() {
    // ts = [10, 30, 20, 40] -> effective processing order [10, 20, 30, 40]
    // per the literal scenario in the testable-properties section. Each
    // record is tagged with a distinct label so the resulting per-node
    // attachment reveals which record actually matched which sample.
    let root = CpuProfileNode {
      id: 0,
      frame: frame("(root)"),
      hit_count: 0,
      children: vec![leaf(1, "a", 1), leaf(2, "b", 1), leaf(3, "c", 1), leaf(4, "d", 1)],
    };
    let profile = HostCpuProfile {
      root,
      sample_node_ids: vec![0, 2, 3, 1, 4],
      timestamps: vec![0, 10, 30, 20, 40],
      start_time_us: 0,
      end_time_us: 40,
    };
    let records = vec![
      labeled_record(0, 15, "r0"),
      labeled_record(15, 25, "r1"),
      labeled_record(25, 35, "r2"),
      labeled_record(35, 45, "r3"),
    ];
    let attachments = match_samples(&profile, &records, false);

    // Node 2 (ts=10) keeps its natural match; node 1 (ts=20, physically
    // after node 3 in the array) must win r1, which only node 3's
    // un-reordered slot (ts=30) would otherwise have consumed.
    assert_eq!(label_of(&attachments[&2][0]), "r0");
    assert_eq!(label_of(&attachments[&1][0]), "r1");
    assert_eq!(label_of(&attachments[&3][0]), "r2");
    assert_eq!(label_of(&attachments[&4][0]), "r3");
    assert_eq!(attachments.values().map(|v| v.len()).sum::<usize>(), records.len());
  }

  #[test]
  fn skips_startup_sample() {
    let root = CpuProfileNode {
      id: 0,
      frame: frame("(root)"),
      hit_count: 1,
      children: vec![leaf(1, "a", 1)],
    };
    let profile = HostCpuProfile {
      root,
      sample_node_ids: vec![0, 1],
      timestamps: vec![-5, 10],
      start_time_us: 0,
      end_time_us: 10,
    };
    let records = vec![record(5, 15)];
    let attachments = match_samples(&profile, &records, false);
    assert_eq!(attachments.get(&1).map(|v| v.len()), Some(1));
    assert!(!attachments.contains_key(&0));
  }

  #[test]
  fn cpu_delta_threads_across_matches_skipping_pseudo_nodes() {
    let root = CpuProfileNode {
      id: 0,
      frame: frame("(root)"),
      hit_count: 0,
      children: vec![
        CpuProfileNode {
          id: 1,
          frame: frame("(idle)"),
          hit_count: 1,
          children: vec![],
        },
        leaf(2, "a", 2),
      ],
    };
    let profile = HostCpuProfile {
      root,
      sample_node_ids: vec![0, 1, 2, 2],
      timestamps: vec![0, 10, 20, 30],
      start_time_us: 0,
      end_time_us: 30,
    };
    let mut records = vec![record(5, 15), record(15, 25), record(25, 35)];
    records[0].cpu_time = Some(1_000);
    records[1].cpu_time = Some(2_000);
    records[2].cpu_time = Some(5_000);
    let attachments = match_samples(&profile, &records, true);

    let idle_attached = &attachments[&1];
    assert_eq!(idle_attached[0].cpu_delta, None);

    let a_attached = &attachments[&2];
    assert_eq!(a_attached[0].cpu_delta, None); // first real match, no prior cpu
    assert_eq!(a_attached[1].cpu_delta, Some(3_000)); // 5000 - 2000, idle skipped
  }

  #[test]
  fn stuck_level_two_when_no_hits() {
    let root = leaf(0, "(root)", 0);
    let profile = HostCpuProfile {
      root,
      sample_node_ids: vec![],
      timestamps: vec![],
      start_time_us: 0,
      end_time_us: 0,
    };
    assert_eq!(detect_stuck_level(&profile, 0), 2);
  }

  #[test]
  fn stuck_level_one_when_sample_count_matches_total_hits() {
    let root = CpuProfileNode {
      id: 0,
      frame: frame("(root)"),
      hit_count: 0,
      children: vec![leaf(1, "a", 5)],
    };
    let profile = HostCpuProfile {
      root,
      sample_node_ids: vec![],
      timestamps: vec![],
      start_time_us: 0,
      end_time_us: 0,
    };
    assert_eq!(detect_stuck_level(&profile, 5), 1);
  }

  #[test]
  fn stuck_level_zero_on_healthy_profile() {
    let root = CpuProfileNode {
      id: 0,
      frame: frame("(root)"),
      hit_count: 0,
      children: vec![leaf(1, "a", 5)],
    };
    let profile = HostCpuProfile {
      root,
      sample_node_ids: vec![],
      timestamps: vec![],
      start_time_us: 0,
      end_time_us: 0,
    };
    assert_eq!(detect_stuck_level(&profile, 7), 0);
  }
}
