pub mod dirtiness;
pub mod phylo_tree;

use crate::tree::dirtiness::Dirtiness;

/// Read-only view of a binary rooted tree, as consumed by the likelihood engines.
///
/// Leaves occupy node indices `[0, leaf_count)`, internal nodes the remainder.
pub trait TreeInterface: Send + Sync {
  fn node_count(&self) -> usize;

  fn leaf_count(&self) -> usize;

  fn root(&self) -> usize;

  /// Both children of an internal node, `None` for a leaf
  fn children(&self, node: usize) -> Option<(usize, usize)>;

  fn parent(&self, node: usize) -> Option<usize>;

  /// Length of the branch above the node. Zero for the root.
  fn branch_length(&self, node: usize) -> f64;

  fn height(&self, node: usize) -> f64;

  fn dirtiness(&self, node: usize) -> Dirtiness;

  #[inline]
  fn is_leaf(&self, node: usize) -> bool {
    node < self.leaf_count()
  }

  #[inline]
  fn is_root(&self, node: usize) -> bool {
    node == self.root()
  }

  #[inline]
  fn internal_node_count(&self) -> usize {
    self.node_count() - self.leaf_count()
  }
}

/// Writes nodes in post-order into `order`: children before parents, left before right, root last.
///
/// Stops early if more nodes are visited than the tree has, which only happens when the child links contain a cycle.
pub fn post_order(tree: &(impl TreeInterface + ?Sized), order: &mut Vec<usize>) {
  order.clear();
  let mut stack = vec![(tree.root(), false)];
  while let Some((node, expanded)) = stack.pop() {
    if order.len() > tree.node_count() {
      break;
    }
    match (expanded, tree.children(node)) {
      (false, Some((left, right))) => {
        stack.push((node, true));
        stack.push((right, false));
        stack.push((left, false));
      }
      _ => order.push(node),
    }
  }
}
