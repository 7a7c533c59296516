use crate::core::buffers::{NodeBuffers, SlotSelector};
use crate::core::kernels::{self, Identity, KernelShape};
use crate::core::{expand_leaf_partials, ChildData, CoreDimensions, LikelihoodCore};

/// Straightforward pruning over every pattern of every node
#[derive(Clone, Debug)]
pub struct ReferenceCore {
  dims: CoreDimensions,
  states: Vec<Option<Vec<usize>>>,
  partials: NodeBuffers<f64>,
  matrices: NodeBuffers<f64>,
  scaling_factors: NodeBuffers<f64>,
  partials_slots: SlotSelector,
  matrices_slots: SlotSelector,
  use_scaling: bool,
  scaling_threshold: f64,
}

impl ReferenceCore {
  pub fn new(dims: CoreDimensions) -> Self {
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
      use_scaling: false,
      scaling_threshold: f64::MAX,
    }
  }

  fn shape(&self) -> KernelShape {
    KernelShape {
      n_states: self.dims.state_count,
      n_categories: self.dims.category_count,
      n_rows: self.dims.pattern_count,
      stride: self.dims.pattern_count,
    }
  }

  fn child_data(&self, node: usize) -> ChildData<'_> {
    if let Some(states) = &self.states[node] {
      ChildData::States(states)
    } else if self.partials.is_allocated(node) {
      ChildData::Partials(self.partials.get(node, self.partials_slots.current(node)))
    } else {
      panic!("Node {node} has neither states nor partials")
    }
  }

  fn matrix(&self, node: usize) -> &[f64] {
    self.matrices.get(node, self.matrices_slots.current(node))
  }
}

impl LikelihoodCore for ReferenceCore {
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
    self.states[node] = Some(states.to_vec());
  }

  fn get_node_states(&self, node: usize) -> Option<&[usize]> {
    self.states[node].as_deref()
  }

  fn set_node_partials(&mut self, node: usize, partials: &[f64]) {
    let partials = expand_leaf_partials(&self.dims, node, partials);
    if !self.partials.is_allocated(node) {
      self.partials.allocate(node, self.dims.partials_size());
    }
    self.states[node] = None;
    self.partials.write(node, self.partials_slots.current(node), &partials);
  }

  fn get_node_partials(&self, node: usize, out: &mut [f64]) {
    out.copy_from_slice(self.partials.get(node, self.partials_slots.current(node)));
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

  fn calculate_partials(&mut self, child1: usize, child2: usize, node: usize) {
    let shape = self.shape();
    let slot = self.partials_slots.current(node);
    let mut out = self.partials.take(node, slot);

    match (self.child_data(child1), self.child_data(child2)) {
      (ChildData::States(s1), ChildData::States(s2)) => {
        kernels::states_states(&shape, s1, self.matrix(child1), s2, self.matrix(child2), &mut out);
      }
      (ChildData::States(s1), ChildData::Partials(p2)) => {
        kernels::states_partials(&shape, s1, self.matrix(child1), p2, Identity, self.matrix(child2), &mut out);
      }
      (ChildData::Partials(p1), ChildData::States(s2)) => {
        kernels::states_partials(&shape, s2, self.matrix(child2), p1, Identity, self.matrix(child1), &mut out);
      }
      (ChildData::Partials(p1), ChildData::Partials(p2)) => {
        kernels::partials_partials(
          &shape,
          p1,
          Identity,
          self.matrix(child1),
          p2,
          Identity,
          self.matrix(child2),
          &mut out,
        );
      }
    }

    if self.use_scaling {
      let factors = self.scaling_factors.get_mut(node, slot);
      kernels::scale_partials(&shape, self.scaling_threshold, &mut out, factors);
    }

    self.partials.put(node, slot, out);
  }

  fn integrate_partials(&self, node: usize, proportions: &[f64], out: &mut [f64]) {
    let partials = self.partials.get(node, self.partials_slots.current(node));
    kernels::integrate_partials(&self.shape(), partials, Identity, proportions, out);
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
      .map(|node| self.scaling_factors.get(node, self.partials_slots.current(node))[pattern])
      .sum()
  }

  fn store_state(&mut self) {
    self.partials_slots.store();
    self.matrices_slots.store();
  }

  fn restore_state(&mut self) {
    self.partials_slots.restore();
    self.matrices_slots.restore();
  }

  fn unstore_state(&mut self) {
    self.partials_slots.unstore();
    self.matrices_slots.unstore();
  }
}
