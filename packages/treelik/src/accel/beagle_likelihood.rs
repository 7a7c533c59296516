use crate::accel::buffer_helper::BufferIndexHelper;
use crate::accel::instance::{AccelerationBackend, AccelerationInstance, Capability, InstanceRequest, Operation};
use crate::alignment::patterns::Patterns;
use crate::core::CoreDimensions;
use crate::likelihood::config::{LikelihoodConfig, RescalingPolicy};
use crate::likelihood::scaling::is_unstable;
use crate::likelihood::tree_likelihood::{assert_context_matches, dimensions_for, sum_log_likelihoods};
use crate::likelihood::{LikelihoodCalculator, ModelContext};
use crate::tree::dirtiness::Dirtiness;
use crate::tree::post_order;
use eyre::{Report, WrapErr};
use itertools::Itertools;
use log::{debug, info, trace, warn};
use std::mem::swap;

/// Likelihood evaluated by an acceleration instance.
///
/// Each call walks the tree like the traversal controller, but instead of computing partials it pushes changed
/// transition matrices and collects one batch of operations over double-buffered buffer indices. Every index is
/// flipped at most once per call, so that a retry with scaling switched on overwrites this call's buffers in place
/// and never touches the stored ones.
pub struct BeagleTreeLikelihood {
  patterns: Patterns,
  dims: CoreDimensions,
  instance: Box<dyn AccelerationInstance>,
  policy: RescalingPolicy,
  rescale_frequency: usize,
  has_observations: bool,
  has_dirt: Dirtiness,

  partials_buffers: BufferIndexHelper,
  matrix_buffers: BufferIndexHelper,
  scale_buffers: Option<BufferIndexHelper>,
  flipped_partials: Vec<bool>,
  flipped_matrices: Vec<bool>,
  flipped_scales: Vec<bool>,

  use_scale_factors: bool,
  stored_use_scale_factors: bool,
  recompute_scale_factors: bool,
  rescale_count: usize,

  branch_times: Vec<f64>,
  stored_branch_times: Vec<f64>,
  updates: Vec<Dirtiness>,
  order: Vec<usize>,
  operations: Vec<Operation>,
  matrix: Vec<f64>,
  category_matrices: Vec<f64>,

  pattern_log_likelihoods: Vec<f64>,
  stored_pattern_log_likelihoods: Vec<f64>,
  log_p: f64,
  stored_log_p: f64,
}

impl BeagleTreeLikelihood {
  /// Creates an instance on the first suitable resource of the backend and loads the leaf data into it. Fails when
  /// no resource is suitable, so that the caller can fall back to another engine.
  pub fn new(
    config: &LikelihoodConfig,
    patterns: Patterns,
    ctx: &ModelContext,
    backend: &dyn AccelerationBackend,
  ) -> Result<Self, Report> {
    let dims = dimensions_for(&patterns, ctx)?;
    let internal_count = dims.node_count - dims.tip_count;

    let partials_buffers = BufferIndexHelper::new(dims.node_count, dims.tip_count);
    let matrix_buffers = BufferIndexHelper::new(dims.node_count, 0);
    let scale_buffers =
      (config.scaling != RescalingPolicy::None).then(|| BufferIndexHelper::new(internal_count + 1, 0));

    let mut required = vec![Capability::DoublePrecision];
    if config.scaling != RescalingPolicy::None {
      required.push(Capability::Scaling);
    }
    if ctx.substitution_model.can_return_complex_diagonalization() {
      required.push(Capability::ComplexEigen);
    }
    if !config.use_ambiguities {
      required.push(Capability::TipStates);
    }

    let request = InstanceRequest {
      tip_count: dims.tip_count,
      partials_buffer_count: partials_buffers.buffer_count(),
      compact_buffer_count: if config.use_ambiguities { 0 } else { dims.tip_count },
      state_count: dims.state_count,
      pattern_count: dims.pattern_count,
      eigen_buffer_count: 1,
      matrix_buffer_count: matrix_buffers.buffer_count(),
      category_count: dims.category_count,
      scale_buffer_count: scale_buffers.as_ref().map_or(0, BufferIndexHelper::buffer_count),
      required,
    };

    let mut instance = backend
      .create_instance(&request, &config.resource_order)
      .wrap_err_with(|| {
        format!(
          "When creating acceleration instance (available resources: {})",
          backend.resources().iter().join(", ")
        )
      })?;
    info!(
      "Accelerated likelihood over {} patterns using {}",
      dims.pattern_count,
      instance.details()
    );

    for tip in 0..dims.tip_count {
      if config.use_ambiguities {
        instance.set_tip_partials(tip, &patterns.leaf_partials(tip))?;
      } else {
        instance.set_tip_states(tip, &patterns.leaf_states(tip))?;
      }
    }
    instance.set_pattern_weights(patterns.weights())?;

    let use_scale_factors = config.scaling == RescalingPolicy::Always;
    let scale_count = internal_count + 1;
    let matrix_size = dims.matrix_size();
    Ok(Self {
      has_observations: patterns.has_observations(),
      patterns,
      dims,
      instance,
      policy: config.scaling,
      rescale_frequency: config.rescale_frequency.max(1),
      has_dirt: Dirtiness::Filthy,
      partials_buffers,
      matrix_buffers,
      scale_buffers,
      flipped_partials: vec![false; dims.node_count],
      flipped_matrices: vec![false; dims.node_count],
      flipped_scales: vec![false; scale_count],
      use_scale_factors,
      stored_use_scale_factors: use_scale_factors,
      recompute_scale_factors: use_scale_factors,
      rescale_count: 0,
      branch_times: vec![f64::NAN; dims.node_count],
      stored_branch_times: vec![f64::NAN; dims.node_count],
      updates: vec![Dirtiness::Clean; dims.node_count],
      order: Vec::with_capacity(dims.node_count),
      operations: Vec::with_capacity(internal_count),
      matrix: vec![0.0; dims.state_count * dims.state_count],
      category_matrices: vec![0.0; matrix_size],
      pattern_log_likelihoods: vec![0.0; dims.pattern_count],
      stored_pattern_log_likelihoods: vec![0.0; dims.pattern_count],
      log_p: f64::NAN,
      stored_log_p: f64::NAN,
    })
  }

  pub fn uses_scale_factors(&self) -> bool {
    self.use_scale_factors
  }

  /// Index of an internal node's scale buffer. The cumulative buffer comes after all nodes.
  fn scale_index(&self, node: usize) -> usize {
    node - self.dims.tip_count
  }

  fn cumulative_scale_index(&self) -> usize {
    self.dims.node_count - self.dims.tip_count
  }

  fn flip_partials_once(&mut self, node: usize) {
    if !self.flipped_partials[node] {
      self.partials_buffers.flip(node);
      self.flipped_partials[node] = true;
    }
  }

  fn flip_matrix_once(&mut self, node: usize) {
    if !self.flipped_matrices[node] {
      self.matrix_buffers.flip(node);
      self.flipped_matrices[node] = true;
    }
  }

  /// Flips a scale buffer once per call and returns its buffer index
  fn flip_scale_once(&mut self, index: usize) -> Option<usize> {
    let helper = self.scale_buffers.as_mut()?;
    if !self.flipped_scales[index] {
      helper.flip(index);
      self.flipped_scales[index] = true;
    }
    Some(helper.offset_index(index))
  }

  fn current_scale(&self, index: usize) -> Option<usize> {
    self.scale_buffers.as_ref().map(|helper| helper.offset_index(index))
  }

  /// Scale buffers an operation on `node` writes and reads
  fn operation_scales(&mut self, node: usize) -> (Option<usize>, Option<usize>) {
    if !self.use_scale_factors {
      return (None, None);
    }
    let index = self.scale_index(node);
    if self.recompute_scale_factors {
      (self.flip_scale_once(index), None)
    } else {
      (None, self.current_scale(index))
    }
  }

  /// Pushes changed matrices and collects operations for every node whose partials need updating. Returns whether
  /// the root was updated.
  fn traverse(&mut self, ctx: &ModelContext) -> Result<bool, Report> {
    let tree = ctx.tree;
    let rates = ctx.site_model.category_rates();
    let size = self.dims.state_count * self.dims.state_count;
    post_order(tree, &mut self.order);
    self.operations.clear();

    let mut n_matrices = 0;
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
          self.flip_matrix_once(node);
          for (category, rate) in rates.iter().enumerate() {
            ctx
              .substitution_model
              .transition_probabilities(rate * branch_time, &mut self.matrix);
            self.category_matrices[category * size..(category + 1) * size].copy_from_slice(&self.matrix);
          }
          self
            .instance
            .set_transition_matrix(self.matrix_buffers.offset_index(node), &self.category_matrices)
            .wrap_err_with(|| format!("When setting transition matrices of node {node}"))?;
          update |= Dirtiness::Dirty;
          n_matrices += 1;
        }
      }

      if let Some((child1, child2)) = tree.children(node) {
        let (update1, update2) = (self.updates[child1], self.updates[child2]);
        if !update1.is_clean() || !update2.is_clean() {
          update |= update1 | update2;
          self.flip_partials_once(node);
          let (write_scale, read_scale) = self.operation_scales(node);
          self.operations.push(Operation {
            destination: self.partials_buffers.offset_index(node),
            write_scale,
            read_scale,
            child1: self.partials_buffers.offset_index(child1),
            matrix1: self.matrix_buffers.offset_index(child1),
            child2: self.partials_buffers.offset_index(child2),
            matrix2: self.matrix_buffers.offset_index(child2),
          });
        }
      }

      self.updates[node] = update;
    }

    trace!(
      "Accelerated traversal pushed {n_matrices} matrices and {} operations",
      self.operations.len()
    );
    Ok(!self.updates[tree.root()].is_clean())
  }

  fn evaluate(&mut self, ctx: &ModelContext) -> Result<f64, Report> {
    let root_updated = self.traverse(ctx)?;
    self
      .instance
      .update_partials(&self.operations)
      .wrap_err("When updating partials")?;
    self.has_dirt = Dirtiness::Clean;

    if root_updated {
      let cumulative = if self.use_scale_factors {
        let index = self.cumulative_scale_index();
        if self.recompute_scale_factors {
          let cumulative = self.flip_scale_once(index);
          let node_scales = (self.dims.tip_count..self.dims.node_count)
            .filter_map(|node| self.current_scale(self.scale_index(node)))
            .collect::<Vec<_>>();
          if let Some(cumulative) = cumulative {
            self.instance.reset_scale_factors(cumulative)?;
            self.instance.accumulate_scale_factors(&node_scales, cumulative)?;
          }
          cumulative
        } else {
          self.current_scale(index)
        }
      } else {
        None
      };

      self
        .instance
        .set_category_weights(ctx.site_model.category_proportions())?;
      self
        .instance
        .set_state_frequencies(ctx.substitution_model.frequencies())?;
      let root = self.partials_buffers.offset_index(ctx.tree.root());
      self
        .instance
        .calculate_root_log_likelihoods(root, cumulative)
        .wrap_err("When calculating root log-likelihoods")?;
      self.instance.site_log_likelihoods(&mut self.pattern_log_likelihoods)?;
    }

    Ok(sum_log_likelihoods(&self.patterns, &self.pattern_log_likelihoods))
  }

  /// Decides whether this call writes new scale factors or reads the existing ones
  fn plan_rescaling(&mut self) {
    self.recompute_scale_factors = match self.policy {
      RescalingPolicy::None => false,
      RescalingPolicy::Always | RescalingPolicy::Auto => self.use_scale_factors,
      RescalingPolicy::Dynamic => {
        if self.use_scale_factors {
          self.rescale_count += 1;
          if self.rescale_count >= self.rescale_frequency {
            self.rescale_count = 0;
            true
          } else {
            false
          }
        } else {
          false
        }
      }
    };
  }
}

impl LikelihoodCalculator for BeagleTreeLikelihood {
  fn calculate_log_p(&mut self, ctx: &ModelContext) -> Result<f64, Report> {
    assert_context_matches(&self.dims, ctx);
    self.flipped_partials.fill(false);
    self.flipped_matrices.fill(false);
    self.flipped_scales.fill(false);
    self.plan_rescaling();

    let mut log_p = self.evaluate(ctx)?;

    let can_retry = matches!(self.policy, RescalingPolicy::Dynamic | RescalingPolicy::Auto)
      && !(self.use_scale_factors && self.recompute_scale_factors);
    if can_retry && is_unstable(log_p, self.has_observations) {
      if !self.use_scale_factors {
        warn!("Numerical instability in accelerated likelihood: switching on scale factors");
      }
      self.use_scale_factors = true;
      self.recompute_scale_factors = true;
      self.rescale_count = 0;
      self.has_dirt = Dirtiness::Filthy;
      log_p = self.evaluate(ctx)?;
    }

    if is_unstable(log_p, self.has_observations) {
      debug!("Accelerated log-likelihood is {log_p}, reporting -inf");
      log_p = f64::NEG_INFINITY;
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
    self.partials_buffers.store();
    self.matrix_buffers.store();
    if let Some(helper) = &mut self.scale_buffers {
      helper.store();
    }
    self.stored_use_scale_factors = self.use_scale_factors;
    self.stored_branch_times.copy_from_slice(&self.branch_times);
    self.stored_pattern_log_likelihoods.copy_from_slice(&self.pattern_log_likelihoods);
    self.stored_log_p = self.log_p;
  }

  fn restore(&mut self) {
    self.partials_buffers.restore();
    self.matrix_buffers.restore();
    if let Some(helper) = &mut self.scale_buffers {
      helper.restore();
    }
    self.use_scale_factors = self.stored_use_scale_factors;
    swap(&mut self.branch_times, &mut self.stored_branch_times);
    swap(&mut self.pattern_log_likelihoods, &mut self.stored_pattern_log_likelihoods);
    swap(&mut self.log_p, &mut self.stored_log_p);
  }
}
