use crate::io::fs::read_file_to_string;
use crate::make_error;
use crate::tree::phylo_tree::PhyloTree;
use bio::io::newick;
use bio_types::phylogeny::Tree;
use eyre::{Report, WrapErr};
use itertools::Itertools;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

pub fn read_nwk(reader: impl Read) -> Result<Tree, Report> {
  let mut nwk_tree = newick::read(reader)?;

  nwk_tree.g.node_weights_mut().for_each(|weight| {
    if weight == "N/A" {
      *weight = "".to_owned();
    }
  });

  Ok(nwk_tree)
}

pub fn read_nwk_tree_file(nwk_file_path: impl AsRef<Path>, taxa: Option<&[String]>) -> Result<PhyloTree, Report> {
  let nwk_file_path = nwk_file_path.as_ref();
  let nwk_str = read_file_to_string(nwk_file_path)?;
  read_nwk_tree_str(&nwk_str, taxa).wrap_err_with(|| format!("When parsing Newick file {nwk_file_path:#?}"))
}

/// Parses a Newick string into a binary rooted tree.
///
/// When `taxa` is given, leaf `i` of the resulting tree is the leaf named `taxa[i]`, so that leaf indices line up
/// with alignment rows. Otherwise leaves are numbered in the order they appear in the string. Internal nodes follow
/// the leaves in post-order, so the root is always the last node.
pub fn read_nwk_tree_str(nwk: &str, taxa: Option<&[String]>) -> Result<PhyloTree, Report> {
  let nwk_tree = read_nwk(nwk.as_bytes())?;
  phylo_tree_from_nwk(&nwk_tree, taxa)
}

pub fn phylo_tree_from_nwk(nwk_tree: &Tree, taxa: Option<&[String]>) -> Result<PhyloTree, Report> {
  let g = &nwk_tree.g;
  let n_nodes = g.node_count();

  let mut children = vec![vec![]; n_nodes];
  let mut lengths = vec![0.0; n_nodes];
  let mut has_parent = vec![false; n_nodes];
  for nwk_edge in g.raw_edges() {
    let source: usize = nwk_edge.source().index();
    let target: usize = nwk_edge.target().index();
    children[source].push(target);
    lengths[target] = branch_length(nwk_edge.weight);
    has_parent[target] = true;
  }

  let roots = has_parent.iter().positions(|has| !has).collect_vec();
  let nwk_root = match roots.as_slice() {
    [root] => *root,
    _ => return make_error!("When reading Newick tree: expected exactly one root, but found {}", roots.len()),
  };

  // Walk in post-order, collecting leaves in order of appearance and internal nodes children-first
  let mut leaves = vec![];
  let mut internals = vec![];
  let mut stack = vec![(nwk_root, false)];
  while let Some((node, expanded)) = stack.pop() {
    let node_children = &children[node];
    if node_children.is_empty() {
      leaves.push(node);
    } else if expanded {
      internals.push(node);
    } else {
      if node_children.len() != 2 {
        return make_error!(
          "When reading Newick tree: only binary trees are supported, but node '{}' has {} children",
          g.raw_nodes()[node].weight,
          node_children.len()
        );
      }
      stack.push((node, true));
      stack.extend(node_children.iter().rev().map(|&child| (child, false)));
    }
  }

  let leaf_names = leaves.iter().map(|&leaf| g.raw_nodes()[leaf].weight.clone()).collect_vec();
  if let Some(name) = leaf_names.iter().find(|name| name.is_empty()) {
    return make_error!("When reading Newick tree: all leaves must be named, but found leaf '{name}'");
  }
  if let Some(name) = leaf_names.iter().duplicates().next() {
    return make_error!("When reading Newick tree: leaf names must be unique, but '{name}' appears more than once");
  }

  let (taxa, leaf_order): (Vec<String>, Vec<usize>) = match taxa {
    None => (leaf_names.clone(), (0..leaves.len()).collect()),
    Some(taxa) => {
      if taxa.len() != leaf_names.len() {
        return make_error!(
          "When reading Newick tree: expected {} taxa, but the tree has {} leaves",
          taxa.len(),
          leaf_names.len()
        );
      }
      let positions: HashMap<&str, usize> = taxa.iter().enumerate().map(|(i, name)| (name.as_str(), i)).collect();
      let leaf_order = leaf_names
        .iter()
        .map(|name| match positions.get(name.as_str()) {
          Some(&i) => Ok(i),
          None => make_error!("When reading Newick tree: leaf '{name}' is not among the taxa"),
        })
        .collect::<Result<Vec<usize>, Report>>()?;
      (taxa.to_vec(), leaf_order)
    }
  };

  let n_leaves = leaves.len();
  let mut index_map = vec![0; n_nodes];
  for (&nwk_leaf, &index) in leaves.iter().zip(&leaf_order) {
    index_map[nwk_leaf] = index;
  }
  for (k, &nwk_internal) in internals.iter().enumerate() {
    index_map[nwk_internal] = n_leaves + k;
  }

  let mut parents = vec![None; n_nodes];
  let mut branch_lengths = vec![0.0; n_nodes];
  for (nwk_node, node_children) in children.iter().enumerate() {
    for &child in node_children {
      parents[index_map[child]] = Some(index_map[nwk_node]);
      branch_lengths[index_map[child]] = lengths[child];
    }
  }

  PhyloTree::from_parents(taxa, &parents, &branch_lengths)
}

/// `bio` keeps edge lengths as `f32`. Reparsing the shortest decimal of that `f32` recovers the written length when it
/// has at most 7 significant digits. Longer lengths are limited to `f32` precision.
fn branch_length(weight: f32) -> f64 {
  weight.to_string().parse().unwrap_or(f64::from(weight))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tree::TreeInterface;
  use approx::assert_abs_diff_eq;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  #[rstest]
  fn reads_leaves_in_order_of_appearance() -> Result<(), Report> {
    let tree = read_nwk_tree_str("((A:0.1,B:0.2):0.3,(C:0.4,D:0.5):0.6);", None)?;
    assert_eq!(tree.taxa(), &["A", "B", "C", "D"]);
    assert_eq!(tree.root(), 6);
    assert_eq!(tree.children(4), Some((0, 1)));
    assert_eq!(tree.children(5), Some((2, 3)));
    assert_eq!(tree.children(6), Some((4, 5)));
    assert_abs_diff_eq!(tree.branch_length(3), 0.5, epsilon = 1e-6);
    assert_abs_diff_eq!(tree.branch_length(5), 0.6, epsilon = 1e-6);
    Ok(())
  }

  #[rstest]
  fn maps_leaves_to_given_taxa() -> Result<(), Report> {
    let taxa = ["D", "C", "B", "A"].map(String::from);
    let tree = read_nwk_tree_str("((A:0.1,B:0.2):0.3,(C:0.4,D:0.5):0.6);", Some(&taxa))?;
    assert_eq!(tree.children(4), Some((3, 2)));
    assert_abs_diff_eq!(tree.branch_length(0), 0.5, epsilon = 1e-6);
    Ok(())
  }

  #[rstest]
  #[case("0.1", 0.1)]
  #[case("0.3", 0.3)]
  #[case("1.5e-3", 0.0015)]
  #[case("12.25", 12.25)]
  fn keeps_short_branch_lengths_exact(#[case] written: &str, #[case] expected: f64) -> Result<(), Report> {
    let tree = read_nwk_tree_str(&format!("(A:{written},B:1);"), None)?;
    assert_eq!(tree.branch_length(0).to_bits(), expected.to_bits());
    Ok(())
  }

  #[rstest]
  fn rejects_unknown_taxon() {
    let taxa = ["A", "B", "X"].map(String::from);
    assert!(read_nwk_tree_str("((A:1,B:1):1,C:1);", Some(&taxa)).is_err());
  }

  #[rstest]
  fn rejects_polytomy() {
    assert!(read_nwk_tree_str("(A:1,B:1,C:1);", None).is_err());
  }
}
