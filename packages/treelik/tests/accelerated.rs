mod common;

use approx::assert_relative_eq;
use common::{config, random_problem};
use eyre::Report;
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::sync::Arc;
use treelik::accel::beagle_likelihood::BeagleTreeLikelihood;
use treelik::accel::cpu::CpuBackend;
use treelik::accel::instance::{Capability, ResourceDetails};
use treelik::likelihood::config::{EngineKind, LikelihoodConfig, RescalingPolicy};
use treelik::likelihood::tree_likelihood::TreeLikelihood;
use treelik::likelihood::{create_likelihood, create_likelihood_with_backend, LikelihoodCalculator, ModelContext};
use treelik::models::branch_rates::StrictClock;
use treelik::models::site_model::SiteRates;
use treelik::models::substitution::{F81Params, Hky, HkyParams, F81};

#[rstest]
#[case(31, RescalingPolicy::Dynamic, false)]
#[case(32, RescalingPolicy::Always, false)]
#[case(33, RescalingPolicy::Always, true)]
fn accelerated_engine_agrees_with_reference(
  #[case] seed: u64,
  #[case] scaling: RescalingPolicy,
  #[case] use_ambiguities: bool,
) -> Result<(), Report> {
  let (tree, patterns) = random_problem(seed, 30, 250)?;
  let site = SiteRates::new(vec![0.1, 0.8, 2.1], vec![0.2, 0.5, 0.3])?;
  let hky = Hky::new(HkyParams {
    kappa: 6.0,
    pi: vec![0.1, 0.4, 0.3, 0.2],
  })?;
  let clock = StrictClock::new(1.7)?;
  let ctx = ModelContext::new(&tree, &site, &hky).with_branch_rates(&clock);

  let reference_config = LikelihoodConfig {
    use_ambiguities,
    ..config(EngineKind::Reference, scaling)
  };
  let accelerated_config = LikelihoodConfig {
    engine: EngineKind::Accelerated,
    ..reference_config.clone()
  };

  let mut reference = TreeLikelihood::new(&reference_config, patterns.clone(), &ctx)?;
  let mut accelerated = BeagleTreeLikelihood::new(&accelerated_config, patterns, &ctx, &CpuBackend::default())?;

  assert_relative_eq!(
    accelerated.calculate_log_p(&ctx)?,
    reference.calculate_log_p(&ctx)?,
    max_relative = 1e-9
  );
  Ok(())
}

#[rstest]
fn accelerated_engine_tracks_tree_changes() -> Result<(), Report> {
  let (mut tree, patterns) = random_problem(41, 18, 120)?;
  let site = SiteRates::equal_proportions(vec![0.5, 1.5])?;
  let f81 = F81::new(F81Params {
    pi: vec![0.4, 0.1, 0.1, 0.4],
  })?;

  let mut accelerated = {
    let ctx = ModelContext::new(&tree, &site, &f81);
    create_likelihood(&config(EngineKind::Accelerated, RescalingPolicy::Always), &patterns, &ctx)?
  };

  for (step, node) in [3, 20, 9, 27].into_iter().enumerate() {
    let ctx = ModelContext::new(&tree, &site, &f81);
    let log_p = accelerated.calculate_log_p(&ctx)?;
    let mut fresh = TreeLikelihood::new(&config(EngineKind::Reference, RescalingPolicy::None), patterns.clone(), &ctx)?;
    assert_relative_eq!(log_p, fresh.calculate_log_p(&ctx)?, max_relative = 1e-9);

    tree.set_clean();
    if step % 2 == 0 {
      accelerated.store();
      tree.store();
    }
    tree.set_branch_length(node, 0.05 * (step + 1) as f64);
  }
  Ok(())
}

#[rstest]
fn falls_back_to_reference_engine_without_suitable_resource() -> Result<(), Report> {
  let (tree, patterns) = random_problem(51, 10, 80)?;
  let site = SiteRates::homogeneous();
  let hky = Hky::new(HkyParams::default())?;
  let ctx = ModelContext::new(&tree, &site, &hky);

  // The only resource lacks the scaling support the dynamic policy needs
  let backend = CpuBackend::with_resources(vec![ResourceDetails {
    number: 0,
    name: "limited".to_owned(),
    description: "no scaling".to_owned(),
    capabilities: vec![Capability::DoublePrecision, Capability::TipStates],
  }]);

  let mut fallback = create_likelihood_with_backend(
    &config(EngineKind::Accelerated, RescalingPolicy::Dynamic),
    &patterns,
    &ctx,
    Arc::new(backend),
  )?;
  let mut reference = TreeLikelihood::new(&config(EngineKind::Reference, RescalingPolicy::Dynamic), patterns, &ctx)?;

  assert_eq!(fallback.calculate_log_p(&ctx)?.to_bits(), reference.calculate_log_p(&ctx)?.to_bits());
  Ok(())
}
