pub mod config;
pub mod scaling;
pub mod threaded;
pub mod tree_likelihood;

use crate::accel::beagle_likelihood::BeagleTreeLikelihood;
use crate::accel::cpu::CpuBackend;
use crate::accel::instance::AccelerationBackend;
use crate::alignment::patterns::Patterns;
use crate::likelihood::config::{EngineKind, LikelihoodConfig};
use crate::likelihood::threaded::ThreadedTreeLikelihood;
use crate::likelihood::tree_likelihood::TreeLikelihood;
use crate::models::branch_rates::BranchRateModel;
use crate::models::site_model::SiteModel;
use crate::models::substitution::SubstitutionModel;
use crate::tree::TreeInterface;
use eyre::Report;
use log::{info, warn};
use std::sync::Arc;

/// Tree and models a likelihood is evaluated against. Read-only for the duration of a call.
#[derive(Copy, Clone)]
pub struct ModelContext<'a> {
  pub tree: &'a dyn TreeInterface,
  pub site_model: &'a dyn SiteModel,
  pub substitution_model: &'a dyn SubstitutionModel,
  pub branch_rate_model: Option<&'a dyn BranchRateModel>,
}

impl<'a> ModelContext<'a> {
  pub fn new(
    tree: &'a dyn TreeInterface,
    site_model: &'a dyn SiteModel,
    substitution_model: &'a dyn SubstitutionModel,
  ) -> Self {
    Self {
      tree,
      site_model,
      substitution_model,
      branch_rate_model: None,
    }
  }

  #[must_use]
  pub fn with_branch_rates(self, branch_rate_model: &'a dyn BranchRateModel) -> Self {
    Self {
      branch_rate_model: Some(branch_rate_model),
      ..self
    }
  }
}

/// The operations a sampler needs from a likelihood: evaluate, and one level of undo.
pub trait LikelihoodCalculator: Send {
  /// Log-likelihood of the patterns for the current tree and models, recomputing only what the tree's dirtiness
  /// flags and changed branch times require
  fn calculate_log_p(&mut self, ctx: &ModelContext) -> Result<f64, Report>;

  /// Result of the last call
  fn log_p(&self) -> f64;

  /// Per-pattern log-likelihoods of the last call, without ascertainment correction
  fn pattern_log_likelihoods(&self) -> Vec<f64>;

  /// Forces a full recomputation on the next call, for example after a model parameter changed
  fn make_dirty(&mut self);

  /// Marks the current state as accepted
  fn store(&mut self);

  /// Returns to the last accepted state
  fn restore(&mut self);
}

/// Creates the likelihood described by the configuration, using the built-in CPU backend for acceleration
pub fn create_likelihood(
  config: &LikelihoodConfig,
  patterns: &Patterns,
  ctx: &ModelContext,
) -> Result<Box<dyn LikelihoodCalculator>, Report> {
  create_likelihood_with_backend(config, patterns, ctx, Arc::new(CpuBackend::default()))
}

/// Creates a partitioned likelihood when more than one thread is configured and the patterns allow splitting, and a
/// single engine otherwise
pub fn create_likelihood_with_backend(
  config: &LikelihoodConfig,
  patterns: &Patterns,
  ctx: &ModelContext,
  backend: Arc<dyn AccelerationBackend>,
) -> Result<Box<dyn LikelihoodCalculator>, Report> {
  config.validate()?;
  if config.threads > 1 && patterns.pattern_count() > 1 {
    Ok(Box::new(ThreadedTreeLikelihood::new(config, patterns, ctx, backend)?))
  } else {
    create_single_likelihood(config, patterns, ctx, backend.as_ref())
  }
}

/// Creates one engine over all given patterns. An accelerated engine falls back to the reference engine when the
/// backend has no suitable resource or fails to create an instance.
pub fn create_single_likelihood(
  config: &LikelihoodConfig,
  patterns: &Patterns,
  ctx: &ModelContext,
  backend: &dyn AccelerationBackend,
) -> Result<Box<dyn LikelihoodCalculator>, Report> {
  match config.engine {
    EngineKind::Reference | EngineKind::Cached => {
      info!("Using {} likelihood engine for {} patterns", config.engine, patterns.pattern_count());
      Ok(Box::new(TreeLikelihood::new(config, patterns.clone(), ctx)?))
    }
    EngineKind::Accelerated => match BeagleTreeLikelihood::new(config, patterns.clone(), ctx, backend) {
      Ok(likelihood) => Ok(Box::new(likelihood)),
      Err(report) => {
        warn!("Acceleration is unavailable, falling back to the reference likelihood engine: {report:#}");
        let config = LikelihoodConfig {
          engine: EngineKind::Reference,
          ..config.clone()
        };
        Ok(Box::new(TreeLikelihood::new(&config, patterns.clone(), ctx)?))
      }
    },
  }
}
