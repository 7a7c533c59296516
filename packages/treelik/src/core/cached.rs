use crate::core::buffers::{NodeBuffers, SlotSelector};
use crate::core::kernels::{self, Identity, KernelShape};
use crate::core::{expand_leaf_partials, CoreDimensions, LikelihoodCore};
use log::trace;
use std::collections::HashMap;
use std::mem::take;
use strum_macros::Display;

const EMPTY: usize = usize::MAX;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum OperationKind {
  StatesStates,
  StatesPartials,
  PartialsPartials,
}

/// Deferred computation of one node. A child holding states always comes first.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CoreOperation {
  pub child1: usize,
  pub child2: usize,
  pub node: usize,
  pub kind: OperationKind,
}

/// Distinct `(child1 value, child2 value)` pairs of a node across patterns.
///
/// A leaf with states contributes its state, with every unknown state collapsed into `state_count`. A leaf with
/// partials contributes the pattern index. An internal node contributes its own distinct row.
#[derive(Clone, Debug, Default)]
struct CacheMap {
  /// Distinct row of every pattern. Empty when all patterns are distinct, then pattern `k` is row `k`.
  index: Vec<usize>,
  lhs: Vec<usize>,
  rhs: Vec<usize>,
  /// Children the `lhs` and `rhs` rows refer to, in that order
  children: (usize, usize),
  valid: bool,
}

impl CacheMap {
  #[inline]
  fn distinct(&self) -> usize {
    self.lhs.len()
  }

  #[inline]
  fn row(&self, pattern: usize) -> usize {
    if self.index.is_empty() {
      pattern
    } else {
      self.index[pattern]
    }
  }
}

#[derive(Copy, Clone)]
enum ChildValues<'a> {
  States(&'a [usize]),
  Patterns,
  Rows(&'a [usize]),
}

impl ChildValues<'_> {
  #[inline]
  fn get(&self, pattern: usize) -> usize {
    match self {
      ChildValues::States(states) => states[pattern],
      ChildValues::Patterns => pattern,
      ChildValues::Rows(rows) => rows[pattern],
    }
  }
}

/// Pruning that computes each distinct child-value pair of a node once.
///
/// Nodes deep in the tree see few distinct pairs when leaf columns repeat, and since the parent's pairs are built
/// from the children's distinct rows, the savings compose towards the root. Index maps are built eagerly during the
/// traversal while the arithmetic is queued and executed by `flush`.
#[derive(Clone, Debug)]
pub struct CachedCore {
  dims: CoreDimensions,
  states: Vec<Option<Vec<usize>>>,
  partials: NodeBuffers<f64>,
  matrices: NodeBuffers<f64>,
  scaling_factors: NodeBuffers<f64>,
  partials_slots: SlotSelector,
  matrices_slots: SlotSelector,
  maps: Vec<[CacheMap; 2]>,
  map_slots: SlotSelector,
  changed: Vec<bool>,
  operations: Vec<CoreOperation>,
  probe: Vec<usize>,
  max_probe_table: usize,
  use_scaling: bool,
  scaling_threshold: f64,
}

impl CachedCore {
  /// Index maps with more than `max_probe_table` possible pairs use a hash map instead of a flat probe table
  pub fn new(dims: CoreDimensions, max_probe_table: usize) -> Self {
    dims.validate();

    let mut partials = NodeBuffers::new("Partials", dims.node_count);
    let mut matrices = NodeBuffers::new("Matrix", dims.node_count);
    let mut scaling_factors = NodeBuffers::new("Scaling", dims.node_count);
    for node in 0..dims.node_count {
      matrices.allocate(node, dims.matrix_size());
      if node >= dims.tip_count {
        partials.allocate(node, dims.partials_size());
        scaling_factors.allocate(node, dims.pattern_count);
      }
    }

    Self {
      dims,
      states: vec![None; dims.node_count],
      partials,
      matrices,
      scaling_factors,
      partials_slots: SlotSelector::new(dims.node_count),
      matrices_slots: SlotSelector::new(dims.node_count),
      maps: vec![[CacheMap::default(), CacheMap::default()]; dims.node_count],
      map_slots: SlotSelector::new(dims.node_count),
      changed: vec![false; dims.node_count],
      operations: vec![],
      probe: vec![],
      max_probe_table,
      use_scaling: false,
      scaling_threshold: f64::MAX,
    }
  }

  /// Number of distinct rows computed for a node. Leaves report the pattern count.
  pub fn distinct_count(&self, node: usize) -> usize {
    if node < self.dims.tip_count {
      self.dims.pattern_count
    } else {
      self.current_map(node).distinct()
    }
  }

  /// Queued operations, in execution order
  pub fn pending_operations(&self) -> &[CoreOperation] {
    &self.operations
  }

  #[inline]
  fn current_map(&self, node: usize) -> &CacheMap {
    &self.maps[node][self.map_slots.current(node)]
  }

  fn shape(&self, n_rows: usize) -> KernelShape {
    KernelShape {
      n_states: self.dims.state_count,
      n_categories: self.dims.category_count,
      n_rows,
      stride: self.dims.pattern_count,
    }
  }

  fn values(&self, node: usize) -> (ChildValues<'_>, usize) {
    if let Some(states) = &self.states[node] {
      (ChildValues::States(states), self.dims.state_count + 1)
    } else if node < self.dims.tip_count {
      assert!(self.partials.is_allocated(node), "Node {node} has neither states nor partials");
      (ChildValues::Patterns, self.dims.pattern_count)
    } else {
      let map = self.current_map(node);
      assert!(map.valid, "Index map of node {node} is used before it was built");
      if map.index.is_empty() {
        (ChildValues::Patterns, self.dims.pattern_count)
      } else {
        (ChildValues::Rows(&map.index), map.distinct())
      }
    }
  }

  fn build_map(&mut self, child1: usize, child2: usize, node: usize) {
    let slot = self.map_slots.current(node);
    let mut map = take(&mut self.maps[node][slot]);
    let mut probe = take(&mut self.probe);

    let (values1, n1) = self.values(child1);
    let (values2, n2) = self.values(child2);
    fill_map(
      &mut map,
      values1,
      values2,
      n2,
      self.dims.pattern_count,
      (n1 * n2 <= self.max_probe_table).then_some((&mut probe, n1 * n2)),
    );

    trace!(
      "Node {node}: {} distinct of {} patterns ({} x {} possible pairs)",
      map.distinct(),
      self.dims.pattern_count,
      n1,
      n2
    );

    map.children = (child1, child2);
    self.probe = probe;
    self.maps[node][slot] = map;
  }

  fn partials_of(&self, node: usize) -> &[f64] {
    self.partials.get(node, self.partials_slots.current(node))
  }

  fn matrix(&self, node: usize) -> &[f64] {
    self.matrices.get(node, self.matrices_slots.current(node))
  }

  fn execute(&mut self, op: &CoreOperation) {
    let slot = self.partials_slots.current(op.node);
    let mut out = self.partials.take(op.node, slot);

    let map = &self.maps[op.node][self.map_slots.current(op.node)];
    let shape = self.shape(map.distinct());
    let (lhs, rhs) = (map.lhs.as_slice(), map.rhs.as_slice());
    match op.kind {
      OperationKind::StatesStates => {
        kernels::states_states(&shape, lhs, self.matrix(op.child1), rhs, self.matrix(op.child2), &mut out);
      }
      OperationKind::StatesPartials => {
        kernels::states_partials(
          &shape,
          lhs,
          self.matrix(op.child1),
          self.partials_of(op.child2),
          rhs,
          self.matrix(op.child2),
          &mut out,
        );
      }
      OperationKind::PartialsPartials => {
        kernels::partials_partials(
          &shape,
          self.partials_of(op.child1),
          lhs,
          self.matrix(op.child1),
          self.partials_of(op.child2),
          rhs,
          self.matrix(op.child2),
          &mut out,
        );
      }
    }

    if self.use_scaling {
      let factors = self.scaling_factors.get_mut(op.node, slot);
      kernels::scale_partials(&shape, self.scaling_threshold, &mut out, factors);
    }

    self.partials.put(op.node, slot, out);
  }

  fn assert_flushed(&self) {
    assert!(
      self.operations.is_empty(),
      "Partials are read while {} operations are still pending. Call flush() first.",
      self.operations.len()
    );
  }
}

/// Assigns distinct rows to `(value1, value2)` pairs in order of first appearance. With a probe table, only the
/// entries touched by this call are reset afterwards.
fn fill_map(
  map: &mut CacheMap,
  values1: ChildValues,
  values2: ChildValues,
  n2: usize,
  pattern_count: usize,
  probe: Option<(&mut Vec<usize>, usize)>,
) {
  map.index.clear();
  map.lhs.clear();
  map.rhs.clear();

  match probe {
    Some((probe, table_size)) => {
      if probe.len() < table_size {
        probe.resize(table_size, EMPTY);
      }
      for k in 0..pattern_count {
        let (a, b) = (values1.get(k), values2.get(k));
        let key = a * n2 + b;
        if probe[key] == EMPTY {
          probe[key] = map.lhs.len();
          map.lhs.push(a);
          map.rhs.push(b);
        }
        map.index.push(probe[key]);
      }
      for (a, b) in map.lhs.iter().zip(&map.rhs) {
        probe[a * n2 + b] = EMPTY;
      }
    }
    None => {
      let mut seen = HashMap::<(usize, usize), usize>::new();
      for k in 0..pattern_count {
        let (a, b) = (values1.get(k), values2.get(k));
        let row = *seen.entry((a, b)).or_insert_with(|| {
          map.lhs.push(a);
          map.rhs.push(b);
          map.lhs.len() - 1
        });
        map.index.push(row);
      }
    }
  }

  // Rows are assigned in order of first appearance, so all-distinct means row k is pattern k
  if map.distinct() == pattern_count {
    map.index.clear();
  }
  map.valid = true;
}

impl LikelihoodCore for CachedCore {
  fn dimensions(&self) -> CoreDimensions {
    self.dims
  }

  fn set_node_states(&mut self, node: usize, states: &[usize]) {
    assert!(
      node < self.dims.tip_count,
      "States can only be set on leaves, but node {node} is internal"
    );
    assert_eq!(
      states.len(),
      self.dims.pattern_count,
      "States of node {node} must have one entry per pattern"
    );
    let unknown = self.dims.state_count;
    self.states[node] = Some(states.iter().map(|&s| s.min(unknown)).collect());
    self.changed[node] = true;
  }

  fn get_node_states(&self, node: usize) -> Option<&[usize]> {
    self.states[node].as_deref()
  }

  fn set_node_partials(&mut self, node: usize, partials: &[f64]) {
    assert!(
      node < self.dims.tip_count,
      "Partials can only be set on leaves when caching, but node {node} is internal"
    );
    let partials = expand_leaf_partials(&self.dims, node, partials);
    if !self.partials.is_allocated(node) {
      self.partials.allocate(node, self.dims.partials_size());
    }
    self.states[node] = None;
    self.partials.write(node, self.partials_slots.current(node), &partials);
    self.changed[node] = true;
  }

  fn get_node_partials(&self, node: usize, out: &mut [f64]) {
    self.assert_flushed();
    let partials = self.partials_of(node);
    if node < self.dims.tip_count {
      out.copy_from_slice(partials);
      return;
    }

    let ns = self.dims.state_count;
    let n_patterns = self.dims.pattern_count;
    let map = self.current_map(node);
    for c in 0..self.dims.category_count {
      for k in 0..n_patterns {
        let src = (c * n_patterns + map.row(k)) * ns;
        let dst = (c * n_patterns + k) * ns;
        out[dst..dst + ns].copy_from_slice(&partials[src..src + ns]);
      }
    }
  }

  fn set_node_matrix_for_update(&mut self, node: usize) {
    self.matrices_slots.flip(node);
  }

  fn set_node_matrix(&mut self, node: usize, category: usize, matrix: &[f64]) {
    let size = self.dims.state_count * self.dims.state_count;
    assert_eq!(matrix.len(), size, "Matrix of node {node} must have {size} entries");
    let slot = self.matrices_slots.current(node);
    self.matrices.get_mut(node, slot)[category * size..(category + 1) * size].copy_from_slice(matrix);
  }

  fn set_node_partials_for_update(&mut self, node: usize) {
    self.partials_slots.flip(node);
  }

  /// Moves the node to a fresh map slot, keeping the stored map intact
  fn set_node_states_for_update(&mut self, node: usize) {
    self.map_slots.flip(node);
    self.maps[node][self.map_slots.current(node)].valid = false;
  }

  fn calculate_partials(&mut self, child1: usize, child2: usize, node: usize) {
    let (child1, child2, kind) = match (self.states[child1].is_some(), self.states[child2].is_some()) {
      (true, true) => (child1, child2, OperationKind::StatesStates),
      (true, false) => (child1, child2, OperationKind::StatesPartials),
      (false, true) => (child2, child1, OperationKind::StatesPartials),
      (false, false) => (child1, child2, OperationKind::PartialsPartials),
    };

    let children_changed = self.changed[child1] || self.changed[child2];
    let map = self.current_map(node);
    let valid = map.valid;
    let swapped = map.children != (child1, child2);
    if !valid || swapped || children_changed {
      if valid {
        self.set_node_states_for_update(node);
      }
      self.build_map(child1, child2, node);
      self.changed[node] = true;
    }

    self.operations.push(CoreOperation {
      child1,
      child2,
      node,
      kind,
    });
  }

  fn flush(&mut self) {
    let operations = take(&mut self.operations);
    trace!("Executing {} queued operations", operations.len());
    for op in &operations {
      self.execute(op);
    }
    self.operations = operations;
    self.operations.clear();
    self.changed.fill(false);
  }

  fn integrate_partials(&self, node: usize, proportions: &[f64], out: &mut [f64]) {
    self.assert_flushed();
    let shape = self.shape(self.dims.pattern_count);
    let partials = self.partials_of(node);
    if node < self.dims.tip_count {
      kernels::integrate_partials(&shape, partials, Identity, proportions, out);
      return;
    }
    let map = self.current_map(node);
    if map.index.is_empty() {
      kernels::integrate_partials(&shape, partials, Identity, proportions, out);
    } else {
      kernels::integrate_partials(&shape, partials, map.index.as_slice(), proportions, out);
    }
  }

  fn set_use_scaling(&mut self, use_scaling: bool) {
    self.use_scaling = use_scaling;
  }

  fn use_scaling(&self) -> bool {
    self.use_scaling
  }

  fn set_scaling_threshold(&mut self, threshold: f64) {
    self.scaling_threshold = threshold;
  }

  fn log_scaling_factor(&self, pattern: usize) -> f64 {
    if !self.use_scaling {
      return 0.0;
    }
    (self.dims.tip_count..self.dims.node_count)
      .map(|node| {
        let row = self.current_map(node).row(pattern);
        self.scaling_factors.get(node, self.partials_slots.current(node))[row]
      })
      .sum()
  }

  fn store_state(&mut self) {
    self.partials_slots.store();
    self.matrices_slots.store();
    self.map_slots.store();
  }

  fn restore_state(&mut self) {
    self.partials_slots.restore();
    self.matrices_slots.restore();
    self.map_slots.restore();
    self.operations.clear();
    self.changed.fill(false);
  }

  fn unstore_state(&mut self) {
    self.partials_slots.unstore();
    self.matrices_slots.unstore();
    self.map_slots.unstore();
    self.operations.clear();
    self.changed.fill(false);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::assert_bits_eq;
  use crate::core::reference::ReferenceCore;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  const M2: [f64; 4] = [0.8, 0.2, 0.3, 0.7];
  const M2_ALT: [f64; 4] = [0.6, 0.4, 0.1, 0.9];

  // ((0,1)4,(2,3)5)6 over 4 binary patterns. Node 4 sees 2 distinct pairs, nodes 5 and 6 see 3.
  fn dims() -> CoreDimensions {
    CoreDimensions {
      node_count: 7,
      tip_count: 4,
      pattern_count: 4,
      category_count: 1,
      state_count: 2,
    }
  }

  const STATES: [[usize; 4]; 4] = [[0, 0, 1, 0], [0, 0, 1, 0], [1, 1, 0, 9], [1, 1, 0, 0]];

  fn set_states(core: &mut dyn LikelihoodCore) {
    for (leaf, states) in STATES.iter().enumerate() {
      core.set_node_states(leaf, states);
    }
  }

  fn run(core: &mut dyn LikelihoodCore, matrix: &[f64]) -> Vec<f64> {
    for node in 0..6 {
      core.set_node_matrix_for_update(node);
      core.set_node_matrix(node, 0, matrix);
    }
    for (c1, c2, node) in [(0, 1, 4), (2, 3, 5), (4, 5, 6)] {
      core.set_node_partials_for_update(node);
      core.set_node_states_for_update(node);
      core.calculate_partials(c1, c2, node);
    }
    core.flush();
    root_log_likelihoods(core)
  }

  fn root_log_likelihoods(core: &dyn LikelihoodCore) -> Vec<f64> {
    let mut root = vec![0.0; 8];
    core.integrate_partials(6, &[1.0], &mut root);
    let mut out = vec![0.0; 4];
    core.calculate_log_likelihoods(&root, &[0.6, 0.4], &mut out);
    out
  }

  #[rstest]
  #[case(1 << 20)]
  #[case(0)]
  fn matches_reference_exactly(#[case] max_probe_table: usize) {
    let mut reference = ReferenceCore::new(dims());
    set_states(&mut reference);
    let expected = run(&mut reference, &M2);

    let mut cached = CachedCore::new(dims(), max_probe_table);
    set_states(&mut cached);
    let actual = run(&mut cached, &M2);
    assert_bits_eq!(actual, expected);

    assert_eq!(cached.distinct_count(4), 2);
    assert_eq!(cached.distinct_count(5), 3);
    assert_eq!(cached.distinct_count(6), 3);
  }

  #[rstest]
  fn matches_reference_with_scaling() {
    let mut reference = ReferenceCore::new(dims());
    let mut cached = CachedCore::new(dims(), 1 << 20);
    for core in [&mut reference as &mut dyn LikelihoodCore, &mut cached] {
      core.set_use_scaling(true);
      core.set_scaling_threshold(f64::MAX);
      set_states(core);
    }
    let expected = run(&mut reference, &M2);
    let actual = run(&mut cached, &M2);
    assert_bits_eq!(actual, expected);
  }

  #[rstest]
  fn expands_compact_partials() {
    let mut reference = ReferenceCore::new(dims());
    let mut cached = CachedCore::new(dims(), 1 << 20);
    set_states(&mut reference);
    set_states(&mut cached);
    run(&mut reference, &M2);
    run(&mut cached, &M2);
    for node in 4..7 {
      let mut expected = vec![0.0; 8];
      reference.get_node_partials(node, &mut expected);
      let mut actual = vec![0.0; 8];
      cached.get_node_partials(node, &mut actual);
      assert_bits_eq!(actual, expected);
    }
  }

  #[rstest]
  fn unknown_states_collapse() {
    let mut cached = CachedCore::new(dims(), 1 << 20);
    cached.set_node_states(3, &[0, 5, 2, 9]);
    assert_eq!(cached.get_node_states(3), Some([0, 2, 2, 2].as_slice()));
  }

  #[rstest]
  fn all_distinct_patterns_bypass_index() {
    let mut cached = CachedCore::new(dims(), 1 << 20);
    for leaf in 0..4 {
      cached.set_node_states(leaf, &[0, 1, 0, 1]);
    }
    cached.set_node_states(0, &[0, 0, 1, 1]);
    cached.calculate_partials(0, 1, 4);
    assert_eq!(cached.distinct_count(4), 4);
    assert!(cached.current_map(4).index.is_empty());
  }

  #[rstest]
  fn queues_operations_until_flush() {
    let mut cached = CachedCore::new(dims(), 1 << 20);
    set_states(&mut cached);
    cached.set_node_partials_for_update(4);
    cached.calculate_partials(0, 1, 4);
    cached.set_node_partials_for_update(5);
    cached.calculate_partials(2, 3, 5);
    cached.set_node_partials_for_update(6);
    cached.calculate_partials(5, 4, 6);
    assert_eq!(
      cached.pending_operations(),
      &[
        CoreOperation {
          child1: 0,
          child2: 1,
          node: 4,
          kind: OperationKind::StatesStates,
        },
        CoreOperation {
          child1: 2,
          child2: 3,
          node: 5,
          kind: OperationKind::StatesStates,
        },
        CoreOperation {
          child1: 5,
          child2: 4,
          node: 6,
          kind: OperationKind::PartialsPartials,
        },
      ]
    );
    cached.flush();
    assert!(cached.pending_operations().is_empty());
  }

  #[rstest]
  #[should_panic(expected = "still pending")]
  fn reading_before_flush_panics() {
    let mut cached = CachedCore::new(dims(), 1 << 20);
    set_states(&mut cached);
    cached.calculate_partials(0, 1, 4);
    let mut out = vec![0.0; 8];
    cached.get_node_partials(4, &mut out);
  }

  #[rstest]
  fn restore_brings_back_stored_maps() {
    let mut cached = CachedCore::new(dims(), 1 << 20);
    set_states(&mut cached);
    let before = run(&mut cached, &M2);
    cached.store_state();

    let changed = run(&mut cached, &M2_ALT);
    assert!(changed != before);

    cached.restore_state();
    assert_bits_eq!(root_log_likelihoods(&cached), before);
    assert_eq!(cached.distinct_count(4), 2);
  }
}
