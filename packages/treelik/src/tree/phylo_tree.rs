use crate::make_error;
use crate::tree::dirtiness::Dirtiness;
use crate::tree::{post_order, TreeInterface};
use eyre::Report;
use itertools::Itertools;
use std::mem::swap;

/// Binary rooted tree stored as flat per-node arrays.
///
/// Carries per-node dirtiness flags and one level of branch length undo, mirroring what a sampler's tree does
/// between proposal and accept/reject.
#[derive(Clone, Debug)]
pub struct PhyloTree {
  taxa: Vec<String>,
  parents: Vec<Option<usize>>,
  children: Vec<Option<(usize, usize)>>,
  branch_lengths: Vec<f64>,
  stored_branch_lengths: Vec<f64>,
  heights: Vec<f64>,
  dirtiness: Vec<Dirtiness>,
  root: usize,
}

impl PhyloTree {
  /// Builds a tree from a parent index per node. Leaves must occupy indices `[0, taxa.len())`.
  pub fn from_parents(taxa: Vec<String>, parents: &[Option<usize>], branch_lengths: &[f64]) -> Result<Self, Report> {
    let node_count = parents.len();
    let leaf_count = taxa.len();

    if branch_lengths.len() != node_count {
      return make_error!(
        "When building tree: expected {node_count} branch lengths (one per node), but found {}",
        branch_lengths.len()
      );
    }

    if leaf_count < 2 || node_count != 2 * leaf_count - 1 {
      return make_error!(
        "When building tree: a binary rooted tree with {leaf_count} leaves must have {} nodes, but found {node_count}",
        (2 * leaf_count).saturating_sub(1)
      );
    }

    if let Some((node, length)) = branch_lengths.iter().find_position(|length| !length.is_finite() || **length < 0.0) {
      return make_error!("When building tree: branch length of node {node} is invalid: {length}");
    }

    let roots = parents.iter().positions(Option::is_none).collect_vec();
    let root = match roots.as_slice() {
      [root] => *root,
      [] => return make_error!("When building tree: no root found"),
      _ => return make_error!("When building tree: expected exactly one root, but found {}", roots.iter().join(", ")),
    };

    let mut child_lists = vec![vec![]; node_count];
    for (node, parent) in parents.iter().enumerate() {
      if let Some(parent) = *parent {
        if parent >= node_count || parent == node {
          return make_error!("When building tree: node {node} has invalid parent {parent}");
        }
        child_lists[parent].push(node);
      }
    }

    let mut children = vec![None; node_count];
    for (node, list) in child_lists.iter().enumerate() {
      match (node < leaf_count, list.as_slice()) {
        (true, []) => {}
        (false, [a, b]) => children[node] = Some((*a, *b)),
        (true, _) => return make_error!("When building tree: leaf {node} ('{}') has children", taxa[node]),
        (false, _) => {
          return make_error!(
            "When building tree: internal node {node} must have exactly 2 children, but found {}",
            list.len()
          )
        }
      }
    }

    let tree = Self {
      taxa,
      parents: parents.to_vec(),
      children,
      branch_lengths: branch_lengths.to_vec(),
      stored_branch_lengths: branch_lengths.to_vec(),
      heights: vec![0.0; node_count],
      dirtiness: vec![Dirtiness::Filthy; node_count],
      root,
    };

    if tree.post_order().len() != node_count {
      return make_error!("When building tree: not all nodes are reachable from the root {root}");
    }

    let mut tree = tree;
    tree.update_heights();
    Ok(tree)
  }

  pub fn taxa(&self) -> &[String] {
    &self.taxa
  }

  /// Nodes in post-order: children before parents, root last
  pub fn post_order(&self) -> Vec<usize> {
    let mut order = Vec::with_capacity(self.parents.len());
    post_order(self, &mut order);
    order
  }

  /// Nodes on the path from the given node up to and including the root
  pub fn path_to_root(&self, node: usize) -> Vec<usize> {
    let mut path = vec![node];
    let mut current = node;
    while let Some(parent) = self.parents[current] {
      path.push(parent);
      current = parent;
    }
    path
  }

  pub fn set_branch_length(&mut self, node: usize, length: f64) {
    assert!(
      length.is_finite() && length >= 0.0,
      "Branch length must be finite and non-negative, but got {length} for node {node}"
    );
    self.branch_lengths[node] = length;
    self.dirtiness[node] |= Dirtiness::Dirty;
    self.update_heights();
  }

  /// Exchanges left and right child. The likelihood is invariant, but any per-node index mapping is not.
  pub fn swap_children(&mut self, node: usize) {
    if let Some((a, b)) = self.children[node] {
      self.children[node] = Some((b, a));
      self.dirtiness[node] |= Dirtiness::Filthy;
    }
  }

  pub fn mark_filthy(&mut self, node: usize) {
    self.dirtiness[node] = Dirtiness::Filthy;
  }

  pub fn mark_all(&mut self, dirtiness: Dirtiness) {
    self.dirtiness.fill(dirtiness);
  }

  /// Marks every node clean, typically after a likelihood evaluation has consumed the flags
  pub fn set_clean(&mut self) {
    self.mark_all(Dirtiness::Clean);
  }

  pub fn store(&mut self) {
    self.stored_branch_lengths.copy_from_slice(&self.branch_lengths);
  }

  /// Returns branch lengths to the last stored state. All nodes become clean, because the stored state is exactly
  /// what the likelihood engines hold in their stored buffers.
  pub fn restore(&mut self) {
    swap(&mut self.branch_lengths, &mut self.stored_branch_lengths);
    self.stored_branch_lengths.copy_from_slice(&self.branch_lengths);
    self.update_heights();
    self.set_clean();
  }

  fn update_heights(&mut self) {
    let mut depths = vec![0.0; self.parents.len()];
    for node in self.post_order().into_iter().rev() {
      if let Some(parent) = self.parents[node] {
        depths[node] = depths[parent] + self.branch_lengths[node];
      }
    }
    let max_depth = depths.iter().copied().fold(0.0, f64::max);
    for (height, depth) in self.heights.iter_mut().zip(depths) {
      *height = max_depth - depth;
    }
  }
}

impl TreeInterface for PhyloTree {
  #[inline]
  fn node_count(&self) -> usize {
    self.parents.len()
  }

  #[inline]
  fn leaf_count(&self) -> usize {
    self.taxa.len()
  }

  #[inline]
  fn root(&self) -> usize {
    self.root
  }

  #[inline]
  fn children(&self, node: usize) -> Option<(usize, usize)> {
    self.children[node]
  }

  #[inline]
  fn parent(&self, node: usize) -> Option<usize> {
    self.parents[node]
  }

  #[inline]
  fn branch_length(&self, node: usize) -> f64 {
    if node == self.root {
      0.0
    } else {
      self.branch_lengths[node]
    }
  }

  #[inline]
  fn height(&self, node: usize) -> f64 {
    self.heights[node]
  }

  #[inline]
  fn dirtiness(&self, node: usize) -> Dirtiness {
    self.dirtiness[node]
  }
}
