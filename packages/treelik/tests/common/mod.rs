#![allow(dead_code)]

use ctor::ctor;
use eyre::Report;
use lazy_static::lazy_static;
use treelik::alignment::data_type::DataType;
use treelik::alignment::patterns::Patterns;
use treelik::likelihood::config::{EngineKind, LikelihoodConfig, RescalingPolicy};
use treelik::tree::phylo_tree::PhyloTree;
use treelik::utils::global_init::global_init;
use treelik::utils::random::{get_random_number_generator, random_patterns, random_tree};

#[ctor]
fn init() {
  global_init();
}

pub fn config(engine: EngineKind, scaling: RescalingPolicy) -> LikelihoodConfig {
  LikelihoodConfig {
    threads: 1,
    engine,
    scaling,
    ..LikelihoodConfig::default()
  }
}

/// Seeded random tree and nucleotide alignment with some missing data
pub fn random_problem(seed: u64, n_taxa: usize, n_sites: usize) -> Result<(PhyloTree, Patterns), Report> {
  let mut rng = get_random_number_generator(Some(seed));
  let tree = random_tree(n_taxa, 0.1, &mut rng)?;
  let patterns = random_patterns(DataType::Nucleotide, n_taxa, n_sites, 0.05, &mut rng)?;
  Ok((tree, patterns))
}

lazy_static! {
  static ref UNDERFLOWING: (PhyloTree, Patterns) = {
    let mut rng = get_random_number_generator(Some(1234));
    let tree = random_tree(600, 2.0, &mut rng).unwrap();
    let patterns = random_patterns(DataType::Nucleotide, 600, 12, 0.0, &mut rng).unwrap();
    (tree, patterns)
  };
}

/// Many taxa on long branches: every pattern's likelihood is far below the smallest positive double
pub fn underflowing_problem() -> Result<(PhyloTree, Patterns), Report> {
  Ok(UNDERFLOWING.clone())
}
