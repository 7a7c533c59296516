use ctor::ctor;
use eyre::Report;
use log::{info, LevelFilter};
use treelik::alignment::data_type::DataType;
use treelik::likelihood::config::{EngineKind, LikelihoodConfig};
use treelik::likelihood::{create_likelihood, ModelContext};
use treelik::models::site_model::SiteRates;
use treelik::models::substitution::{Hky, HkyParams};
use treelik::utils::global_init::{global_init, setup_logger};
use treelik::utils::random::{get_random_number_generator, random_patterns, random_tree};

#[ctor]
fn init() {
  global_init();
}

/// Evaluates one random problem with every engine. Takes an optional path to a JSON configuration.
fn main() -> Result<(), Report> {
  setup_logger(LevelFilter::Info);

  let config = match std::env::args().nth(1) {
    Some(path) => LikelihoodConfig::from_json_file(path)?,
    None => LikelihoodConfig::default(),
  };

  let mut rng = get_random_number_generator(Some(42));
  let tree = random_tree(100, 0.05, &mut rng)?;
  let patterns = random_patterns(DataType::Nucleotide, 100, 5_000, 0.01, &mut rng)?;
  let site = SiteRates::equal_proportions(vec![0.3, 0.8, 1.2, 1.7])?;
  let hky = Hky::new(HkyParams::default())?;
  let ctx = ModelContext::new(&tree, &site, &hky);

  for engine in [EngineKind::Reference, EngineKind::Cached, EngineKind::Accelerated] {
    let config = LikelihoodConfig { engine, ..config.clone() };
    let mut likelihood = create_likelihood(&config, &patterns, &ctx)?;
    let log_p = likelihood.calculate_log_p(&ctx)?;
    info!("{engine}: log-likelihood {log_p:.6} over {} patterns", patterns.pattern_count());
  }

  Ok(())
}
