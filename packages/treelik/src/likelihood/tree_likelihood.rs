use crate::alignment::patterns::Patterns;
use crate::core::cached::CachedCore;
use crate::core::reference::ReferenceCore;
use crate::core::{CoreDimensions, LikelihoodCore};
use crate::likelihood::config::{EngineKind, LikelihoodConfig};
use crate::likelihood::scaling::{is_unstable, ScalingController, ScalingLevel};
use crate::likelihood::{LikelihoodCalculator, ModelContext};
use crate::make_error;
use crate::tree::dirtiness::Dirtiness;
use crate::tree::post_order;
use eyre::Report;
use log::{debug, trace};
use std::mem::swap;

/// Checks that the context matches the dimensions an engine was built for. A mismatch is a contract violation.
pub(crate) fn assert_context_matches(dims: &CoreDimensions, ctx: &ModelContext) {
  assert_eq!(
    ctx.tree.node_count(),
    dims.node_count,
    "Tree has {} nodes, but the likelihood was built for {}",
    ctx.tree.node_count(),
    dims.node_count
  );
  assert_eq!(
    ctx.site_model.category_count(),
    dims.category_count,
    "Site model has {} rate categories, but the likelihood was built for {}",
    ctx.site_model.category_count(),
    dims.category_count
  );
  assert_eq!(
    ctx.substitution_model.state_count(),
    dims.state_count,
    "Substitution model has {} states, but the patterns have {}",
    ctx.substitution_model.state_count(),
    dims.state_count
  );
  assert!(
    ctx.site_model.integrate_across_categories() || dims.category_count == 1,
    "Assigning rate categories per site is not supported, categories must be integrated over"
  );
}

/// Dimensions for a likelihood over the given patterns, checked against the context
pub(crate) fn dimensions_for(patterns: &Patterns, ctx: &ModelContext) -> Result<CoreDimensions, Report> {
  let tree = ctx.tree;
  if tree.leaf_count() != patterns.taxon_count() {
    return make_error!(
      "Tree has {} leaves, but the alignment has {} taxa",
      tree.leaf_count(),
      patterns.taxon_count()
    );
  }
  if ctx.substitution_model.state_count() != patterns.state_count() {
    return make_error!(
      "Substitution model has {} states, but the alignment has {}",
      ctx.substitution_model.state_count(),
      patterns.state_count()
    );
  }
  if !ctx.site_model.integrate_across_categories() && ctx.site_model.category_count() > 1 {
    return make_error!("Assigning rate categories per site is not supported, categories must be integrated over");
  }
  Ok(CoreDimensions {
    node_count: tree.node_count(),
    tip_count: tree.leaf_count(),
    pattern_count: patterns.pattern_count(),
    category_count: ctx.site_model.category_count(),
    state_count: patterns.state_count(),
  })
}

/// Weighted sum of pattern log-likelihoods, skipping patterns without weight, with the ascertainment correction
/// applied when some patterns are excluded from observation
pub(crate) fn sum_log_likelihoods(patterns: &Patterns, pattern_log_likelihoods: &[f64]) -> f64 {
  let mut log_p = 0.0;
  for (&weight, &log_l) in patterns.weights().iter().zip(pattern_log_likelihoods) {
    if weight != 0.0 {
      log_p += weight * log_l;
    }
  }

  if patterns.is_ascertained() {
    let excluded: f64 = patterns
      .excluded_patterns()
      .iter()
      .map(|&k| pattern_log_likelihoods[k].exp())
      .sum();
    log_p -= patterns.total_weight() * (1.0 - excluded).ln();
  }

  log_p
}

/// Drives a likelihood core through the tree, recomputing only what changed since the last call.
///
/// Leaf `i` of the tree holds the data of taxon `i` of the patterns.
pub struct TreeLikelihood {
  patterns: Patterns,
  core: Box<dyn LikelihoodCore>,
  dims: CoreDimensions,
  scaling: ScalingController,
  stored_level: ScalingLevel,
  has_dirt: Dirtiness,
  has_observations: bool,

  branch_times: Vec<f64>,
  stored_branch_times: Vec<f64>,
  updates: Vec<Dirtiness>,
  order: Vec<usize>,
  matrix: Vec<f64>,
  root_partials: Vec<f64>,

  pattern_log_likelihoods: Vec<f64>,
  stored_pattern_log_likelihoods: Vec<f64>,
  log_p: f64,
  stored_log_p: f64,
}

impl TreeLikelihood {
  /// Builds the core selected by `config.engine`. The accelerated engine is created through the factory instead.
  pub fn new(config: &LikelihoodConfig, patterns: Patterns, ctx: &ModelContext) -> Result<Self, Report> {
    let dims = dimensions_for(&patterns, ctx)?;
    let core: Box<dyn LikelihoodCore> = match config.engine {
      EngineKind::Cached => Box::new(CachedCore::new(dims, config.max_probe_table)),
      EngineKind::Reference | EngineKind::Accelerated => Box::new(ReferenceCore::new(dims)),
    };
    Self::with_core(config, patterns, ctx, core)
  }

  pub fn with_core(
    config: &LikelihoodConfig,
    patterns: Patterns,
    ctx: &ModelContext,
    mut core: Box<dyn LikelihoodCore>,
  ) -> Result<Self, Report> {
    let dims = dimensions_for(&patterns, ctx)?;
    if core.dimensions() != dims {
      return make_error!(
        "Likelihood core has dimensions {:?}, but the tree and alignment require {dims:?}",
        core.dimensions()
      );
    }

    for leaf in 0..dims.tip_count {
      if config.use_ambiguities {
        core.set_node_partials(leaf, &patterns.leaf_partials(leaf));
      } else {
        core.set_node_states(leaf, &patterns.leaf_states(leaf));
      }
    }

    let scaling = ScalingController::new(config.scaling, config.scaling_thresholds, config.relax_window);
    scaling.apply(core.as_mut());

    debug!(
      "Likelihood over {} patterns, {} nodes, {} categories, {} states, scaling '{}'",
      dims.pattern_count,
      dims.node_count,
      dims.category_count,
      dims.state_count,
      config.scaling
    );

    Ok(Self {
      has_observations: patterns.has_observations(),
      patterns,
      core,
      dims,
      stored_level: scaling.level(),
      scaling,
      has_dirt: Dirtiness::Filthy,
      branch_times: vec![f64::NAN; dims.node_count],
      stored_branch_times: vec![f64::NAN; dims.node_count],
      updates: vec![Dirtiness::Clean; dims.node_count],
      order: Vec::with_capacity(dims.node_count),
      matrix: vec![0.0; dims.state_count * dims.state_count],
      root_partials: vec![0.0; dims.pattern_count * dims.state_count],
      pattern_log_likelihoods: vec![0.0; dims.pattern_count],
      stored_pattern_log_likelihoods: vec![0.0; dims.pattern_count],
      log_p: f64::NAN,
      stored_log_p: f64::NAN,
    })
  }

  pub fn core(&self) -> &dyn LikelihoodCore {
    self.core.as_ref()
  }

  pub fn patterns(&self) -> &Patterns {
    &self.patterns
  }

  pub fn scaling_level(&self) -> ScalingLevel {
    self.scaling.level()
  }

  /// Visits the tree in post-order. A node's transition matrices are recomputed when it is flagged or its branch time
  /// changed, its partials when either child reports an update or the node itself is filthy. Returns whether the root
  /// was recomputed.
  fn traverse(&mut self, ctx: &ModelContext) -> bool {
    let tree = ctx.tree;
    let rates = ctx.site_model.category_rates();
    post_order(tree, &mut self.order);

    let mut n_matrices = 0;
    let mut n_partials = 0;
    for i in 0..self.order.len() {
      let node = self.order[i];
      let mut update = tree.dirtiness(node) | self.has_dirt;

      if !tree.is_root(node) {
        let branch_rate = ctx.branch_rate_model.map_or(1.0, |model| model.branch_rate(tree, node));
        let branch_time = tree.branch_length(node) * branch_rate;
        assert!(
          branch_time.is_finite() && branch_time >= 0.0,
          "Branch time of node {node} must be finite and non-negative, but got {branch_time}"
        );

        if !update.is_clean() || branch_time != self.branch_times[node] {
          self.branch_times[node] = branch_time;
          self.core.set_node_matrix_for_update(node);
          for (category, rate) in rates.iter().enumerate() {
            ctx
              .substitution_model
              .transition_probabilities(rate * branch_time, &mut self.matrix);
            self.core.set_node_matrix(node, category, &self.matrix);
          }
          update |= Dirtiness::Dirty;
          n_matrices += 1;
        }
      }

      if let Some((child1, child2)) = tree.children(node) {
        let (update1, update2) = (self.updates[child1], self.updates[child2]);
        if !update1.is_clean() || !update2.is_clean() || update >= Dirtiness::Filthy {
          update |= update1 | update2;
          self.core.set_node_partials_for_update(node);
          if update >= Dirtiness::Filthy {
            self.core.set_node_states_for_update(node);
          }
          self.core.calculate_partials(child1, child2, node);
          n_partials += 1;
        }
      }

      self.updates[node] = update;
    }

    trace!("Traversal updated {n_matrices} matrices and {n_partials} partials");
    let root = tree.root();
    !self.updates[root].is_clean()
  }

  /// One traversal followed by root integration when the root changed, and the weighted sum
  fn evaluate(&mut self, ctx: &ModelContext) -> f64 {
    let root_updated = self.traverse(ctx);
    self.core.flush();
    self.has_dirt = Dirtiness::Clean;

    if root_updated {
      let root = ctx.tree.root();
      self
        .core
        .integrate_partials(root, ctx.site_model.category_proportions(), &mut self.root_partials);
      self.core.calculate_log_likelihoods(
        &self.root_partials,
        ctx.substitution_model.frequencies(),
        &mut self.pattern_log_likelihoods,
      );
    }

    sum_log_likelihoods(&self.patterns, &self.pattern_log_likelihoods)
  }

  /// Discards this call's work and recomputes everything at the controller's current level
  fn recompute_all(&mut self, ctx: &ModelContext) -> f64 {
    self.scaling.apply(self.core.as_mut());
    self.core.unstore_state();
    self.has_dirt = Dirtiness::Filthy;
    self.evaluate(ctx)
  }
}

impl LikelihoodCalculator for TreeLikelihood {
  fn calculate_log_p(&mut self, ctx: &ModelContext) -> Result<f64, Report> {
    assert_context_matches(&self.dims, ctx);

    let mut log_p = self.evaluate(ctx);

    if is_unstable(log_p, self.has_observations) {
      if self.scaling.escalate() {
        log_p = self.recompute_all(ctx);
      }
      if is_unstable(log_p, self.has_observations) {
        debug!("Log-likelihood is {log_p} at scaling level {}, reporting -inf", self.scaling.level());
        log_p = f64::NEG_INFINITY;
      }
    } else if self.scaling.record_stable() {
      self.scaling.relax();
      log_p = self.recompute_all(ctx);
      if is_unstable(log_p, self.has_observations) {
        self.scaling.revert_relax();
        self.scaling.apply(self.core.as_mut());
        self.has_dirt = Dirtiness::Filthy;
        log_p = f64::NEG_INFINITY;
      }
    }

    self.log_p = log_p;
    Ok(log_p)
  }

  fn log_p(&self) -> f64 {
    self.log_p
  }

  fn pattern_log_likelihoods(&self) -> Vec<f64> {
    self.pattern_log_likelihoods.clone()
  }

  fn make_dirty(&mut self) {
    self.has_dirt = Dirtiness::Filthy;
  }

  fn store(&mut self) {
    self.core.store_state();
    self.stored_branch_times.copy_from_slice(&self.branch_times);
    self.stored_pattern_log_likelihoods.copy_from_slice(&self.pattern_log_likelihoods);
    self.stored_log_p = self.log_p;
    self.stored_level = self.scaling.level();
  }

  fn restore(&mut self) {
    self.core.restore_state();
    swap(&mut self.branch_times, &mut self.stored_branch_times);
    swap(&mut self.pattern_log_likelihoods, &mut self.stored_pattern_log_likelihoods);
    swap(&mut self.log_p, &mut self.stored_log_p);
    if self.stored_level != self.scaling.level() {
      self.scaling.set_level(self.stored_level);
      self.scaling.apply(self.core.as_mut());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::alignment::data_type::DataType;
  use crate::io::nwk::read_nwk_tree_str;
  use crate::likelihood::config::RescalingPolicy;
  use crate::models::branch_rates::PerBranchRates;
  use crate::models::site_model::SiteRates;
  use crate::models::substitution::{Jc69, Jc69Params};
  use crate::tree::phylo_tree::PhyloTree;
  use crate::tree::TreeInterface;
  use approx::assert_abs_diff_eq;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  fn taxa(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("t{i}")).collect()
  }

  fn config(engine: EngineKind, scaling: RescalingPolicy) -> LikelihoodConfig {
    LikelihoodConfig {
      threads: 1,
      engine,
      scaling,
      ..LikelihoodConfig::default()
    }
  }

  // Two taxa at distance d under binary Jukes-Cantor: P(same) = 0.5 (1 + exp(-2d)), with frequencies 0.5
  #[rstest]
  fn cherry_matches_closed_form() -> Result<(), Report> {
    let tree = PhyloTree::from_parents(taxa(2), &[Some(2), Some(2), None], &[0.3, 0.2])?;
    let patterns = Patterns::from_sequences(DataType::Binary, taxa(2), &["0011", "0101"])?;
    let site = SiteRates::homogeneous();
    let jc = Jc69::new(Jc69Params { n_states: 2 })?;
    let ctx = ModelContext::new(&tree, &site, &jc);

    let mut likelihood = TreeLikelihood::new(&config(EngineKind::Reference, RescalingPolicy::None), patterns, &ctx)?;
    let log_p = likelihood.calculate_log_p(&ctx)?;

    let e = (-2.0 * 0.5_f64).exp();
    let same = 0.5 * 0.5 * (1.0 + e);
    let different = 0.5 * 0.5 * (1.0 - e);
    assert_abs_diff_eq!(log_p, 2.0 * same.ln() + 2.0 * different.ln(), epsilon = 1e-12);
    Ok(())
  }

  #[rstest]
  fn branch_rate_change_is_detected() -> Result<(), Report> {
    let mut tree = read_nwk_tree_str("((t0:0.1,t1:0.2):0.3,(t2:0.1,t3:0.4):0.2);", Some(&taxa(4)))?;
    let patterns = Patterns::from_sequences(DataType::Nucleotide, taxa(4), &["ACGTA", "ACGTT", "AGGTA", "CCGTA"])?;
    let site = SiteRates::homogeneous();
    let jc = Jc69::new(Jc69Params::default())?;
    let mut rates = PerBranchRates::uniform(tree.node_count());

    let mut likelihood = {
      let ctx = ModelContext::new(&tree, &site, &jc).with_branch_rates(&rates);
      TreeLikelihood::new(&config(EngineKind::Cached, RescalingPolicy::Dynamic), patterns.clone(), &ctx)?
    };
    let before = {
      let ctx = ModelContext::new(&tree, &site, &jc).with_branch_rates(&rates);
      likelihood.calculate_log_p(&ctx)?
    };
    tree.set_clean();

    rates.set_rate(2, 3.0);
    let ctx = ModelContext::new(&tree, &site, &jc).with_branch_rates(&rates);
    let after = likelihood.calculate_log_p(&ctx)?;
    assert!(after != before);

    let mut fresh = TreeLikelihood::new(&config(EngineKind::Reference, RescalingPolicy::Dynamic), patterns, &ctx)?;
    assert_abs_diff_eq!(after, fresh.calculate_log_p(&ctx)?, epsilon = 1e-10);
    Ok(())
  }

  #[rstest]
  fn ascertainment_conditions_on_variable_sites() -> Result<(), Report> {
    let tree = PhyloTree::from_parents(taxa(2), &[Some(2), Some(2), None], &[0.25, 0.25])?;
    let patterns =
      Patterns::from_sequences(DataType::Binary, taxa(2), &["0101", "1001"])?.with_ascertainment(2..4)?;
    let site = SiteRates::homogeneous();
    let jc = Jc69::new(Jc69Params { n_states: 2 })?;
    let ctx = ModelContext::new(&tree, &site, &jc);

    let mut likelihood = TreeLikelihood::new(&config(EngineKind::Reference, RescalingPolicy::None), patterns, &ctx)?;
    let log_p = likelihood.calculate_log_p(&ctx)?;

    // Both remaining sites differ, each conditioned on not being constant
    let e = (-1.0_f64).exp();
    let different = 0.25 * (1.0 - e);
    let constant = 0.5 * (1.0 + e);
    assert_abs_diff_eq!(log_p, 2.0 * (different.ln() - (1.0 - constant).ln()), epsilon = 1e-12);
    assert_eq!(likelihood.pattern_log_likelihoods().len(), 4);
    Ok(())
  }

  #[rstest]
  fn missing_data_gives_zero_without_rescaling() -> Result<(), Report> {
    let tree = PhyloTree::from_parents(taxa(2), &[Some(2), Some(2), None], &[0.25, 0.25])?;
    let patterns = Patterns::from_sequences(DataType::Nucleotide, taxa(2), &["N-", "??"])?;
    let site = SiteRates::homogeneous();
    let jc = Jc69::new(Jc69Params::default())?;
    let ctx = ModelContext::new(&tree, &site, &jc);

    let mut likelihood = TreeLikelihood::new(&config(EngineKind::Cached, RescalingPolicy::Dynamic), patterns, &ctx)?;
    assert_eq!(likelihood.calculate_log_p(&ctx)?, 0.0);
    assert_eq!(likelihood.scaling_level(), ScalingLevel::Unscaled);
    Ok(())
  }

  #[rstest]
  fn rejects_mismatched_taxa() -> Result<(), Report> {
    let tree = PhyloTree::from_parents(taxa(2), &[Some(2), Some(2), None], &[0.25, 0.25])?;
    let patterns = Patterns::from_sequences(DataType::Nucleotide, taxa(3), &["A", "C", "G"])?;
    let site = SiteRates::homogeneous();
    let jc = Jc69::new(Jc69Params::default())?;
    let ctx = ModelContext::new(&tree, &site, &jc);
    assert!(TreeLikelihood::new(&LikelihoodConfig::default(), patterns, &ctx).is_err());
    Ok(())
  }
}
