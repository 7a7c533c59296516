//! Partial likelihood store and pruning engines.
//!
//! Every per-node resource (partials, matrices, scaling factors) has two slots. Marking a node for update flips its
//! current slot, so that the previously accepted values stay intact as the stored slot until the next `store`.

pub mod buffers;
pub mod cached;
pub mod kernels;
pub mod reference;

use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreDimensions {
  pub node_count: usize,
  /// Leaves occupy node indices `[0, tip_count)`
  pub tip_count: usize,
  pub pattern_count: usize,
  pub category_count: usize,
  pub state_count: usize,
}

impl CoreDimensions {
  #[inline]
  pub const fn matrix_size(&self) -> usize {
    self.category_count * self.state_count * self.state_count
  }

  #[inline]
  pub const fn partials_size(&self) -> usize {
    self.category_count * self.pattern_count * self.state_count
  }

  pub fn validate(&self) {
    assert!(
      self.tip_count >= 2 && self.node_count == 2 * self.tip_count - 1,
      "A binary rooted tree with {} tips must have {} nodes, but {} were given",
      self.tip_count,
      (2 * self.tip_count).saturating_sub(1),
      self.node_count
    );
    assert!(self.pattern_count > 0, "Likelihood core requires at least one pattern");
    assert!(self.category_count > 0, "Likelihood core requires at least one rate category");
    assert!(self.state_count >= 2, "Likelihood core requires at least 2 states");
  }
}

/// Storage and arithmetic of the pruning algorithm, driven node by node by a traversal.
///
/// Misuse (wrong buffer sizes, reading buffers that were never filled) is a contract violation and panics.
pub trait LikelihoodCore: Send {
  fn dimensions(&self) -> CoreDimensions;

  /// Leaf data as one state code per pattern. Codes at or above the state count are unknown.
  fn set_node_states(&mut self, node: usize, states: &[usize]);

  fn get_node_states(&self, node: usize) -> Option<&[usize]>;

  /// Leaf data as partials. Accepts either one block of `pattern_count * state_count` values, which is repeated for
  /// every category, or the full `partials_size()` values.
  fn set_node_partials(&mut self, node: usize, partials: &[f64]);

  /// Full current partials of a node, `partials_size()` values
  fn get_node_partials(&self, node: usize, out: &mut [f64]);

  /// Flips the current matrix slot of a node before its matrices are rewritten
  fn set_node_matrix_for_update(&mut self, node: usize);

  /// Writes the `state_count²` matrix of one category into the current matrix slot
  fn set_node_matrix(&mut self, node: usize, category: usize, matrix: &[f64]);

  /// Flips the current partials slot of a node before its partials are recomputed
  fn set_node_partials_for_update(&mut self, node: usize);

  /// Invalidates any per-node mapping derived from the shape of the subtree
  fn set_node_states_for_update(&mut self, _node: usize) {}

  /// Computes the partials of `node` from its two children
  fn calculate_partials(&mut self, child1: usize, child2: usize, node: usize);

  /// Completes any deferred work. Partials must not be read before a flush.
  fn flush(&mut self) {}

  /// Category-weighted sum of the partials of `node`, `pattern_count * state_count` values
  fn integrate_partials(&self, node: usize, proportions: &[f64], out: &mut [f64]);

  /// Per-pattern log-likelihoods from integrated root partials, including accumulated scaling corrections
  fn calculate_log_likelihoods(&self, root_partials: &[f64], frequencies: &[f64], out: &mut [f64]) {
    let dims = self.dimensions();
    kernels::root_log_likelihoods(dims.state_count, root_partials, frequencies, out);
    if self.use_scaling() {
      for (pattern, log_l) in out.iter_mut().enumerate() {
        *log_l += self.log_scaling_factor(pattern);
      }
    }
  }

  fn set_use_scaling(&mut self, use_scaling: bool);

  fn use_scaling(&self) -> bool;

  /// Rows whose largest entry is below the threshold are rescaled. `f64::MAX` rescales every row.
  fn set_scaling_threshold(&mut self, threshold: f64);

  /// Sum over all nodes of the log scaling factors of a pattern. Zero while scaling is off.
  fn log_scaling_factor(&self, pattern: usize) -> f64;

  fn store_state(&mut self);

  fn restore_state(&mut self);

  /// Resets current slots to the stored ones without swapping
  fn unstore_state(&mut self);
}

/// Where a child's values come from when computing its parent
pub(crate) enum ChildData<'a> {
  States(&'a [usize]),
  Partials(&'a [f64]),
}

/// Expands a single-category block to all categories, or checks the full size
pub(crate) fn expand_leaf_partials(dims: &CoreDimensions, node: usize, partials: &[f64]) -> Vec<f64> {
  let block = dims.pattern_count * dims.state_count;
  if partials.len() == block {
    partials.repeat(dims.category_count)
  } else {
    assert_eq!(
      partials.len(),
      dims.partials_size(),
      "Partials of node {node} must have {block} or {} values, but {} were given",
      dims.partials_size(),
      partials.len()
    );
    partials.to_vec()
  }
}
