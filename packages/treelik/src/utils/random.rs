use crate::alignment::data_type::DataType;
use crate::alignment::patterns::Patterns;
use crate::make_internal_report;
use crate::tree::phylo_tree::PhyloTree;
use eyre::Report;
use itertools::Itertools;
use rand::{seq::IteratorRandom, Rng, SeedableRng};
use rand_isaac::Isaac64Rng;

pub fn get_random_number_generator(seed: Option<u64>) -> (impl Rng + Send + Sync + Clone) {
  match seed {
    None => Isaac64Rng::from_entropy(),
    Some(seed) => Isaac64Rng::seed_from_u64(seed),
  }
}

pub fn random_choice_maybe<T>(iter: impl IntoIterator<Item = T>, rng: &mut impl Rng) -> Option<T> {
  iter.into_iter().choose(rng)
}

pub fn random_choice<T>(iter: impl IntoIterator<Item = T>, rng: &mut impl Rng) -> Result<T, Report> {
  random_choice_maybe(iter, rng)
    .ok_or_else(|| make_internal_report!("random_choice: expected at least one item, but none found"))
}

pub fn random_remove<T>(v: &mut Vec<T>, rng: &mut impl Rng) -> T {
  let index: usize = rng.gen_range(0..v.len());
  v.remove(index)
}

/// Taxon names `t0`, `t1`, ...
pub fn taxon_names(n: usize) -> Vec<String> {
  (0..n).map(|i| format!("t{i}")).collect_vec()
}

/// Random binary tree over `n_taxa` leaves, built by repeatedly joining two random subtrees. Branch lengths are
/// uniform in `(0, 2 * mean_branch_length)`.
pub fn random_tree(n_taxa: usize, mean_branch_length: f64, rng: &mut impl Rng) -> Result<PhyloTree, Report> {
  let node_count = (2 * n_taxa).saturating_sub(1);
  let mut parents = vec![None; node_count];
  let mut branch_lengths = vec![0.0; node_count];

  let mut roots = (0..n_taxa).collect_vec();
  for node in n_taxa..node_count {
    for _ in 0..2 {
      let child = random_remove(&mut roots, rng);
      parents[child] = Some(node);
      branch_lengths[child] = rng.gen_range(0.0..2.0 * mean_branch_length);
    }
    roots.push(node);
  }

  PhyloTree::from_parents(taxon_names(n_taxa), &parents, &branch_lengths)
}

/// Random alignment over `n_taxa` taxa. Each character is unknown with probability `missing`, otherwise a uniformly
/// chosen state.
pub fn random_patterns(
  data_type: DataType,
  n_taxa: usize,
  n_sites: usize,
  missing: f64,
  rng: &mut impl Rng,
) -> Result<Patterns, Report> {
  let n_states = data_type.state_count();
  let mut states = Vec::with_capacity(n_taxa);
  for _ in 0..n_taxa {
    let mut row = Vec::with_capacity(n_sites);
    for _ in 0..n_sites {
      let state = if rng.gen_bool(missing) {
        n_states
      } else {
        random_choice(0..n_states, rng)?
      };
      row.push(state);
    }
    states.push(row);
  }
  Patterns::from_states(data_type, taxon_names(n_taxa), &states)
}
