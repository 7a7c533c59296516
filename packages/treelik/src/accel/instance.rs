use eyre::Report;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use strum_macros::Display as StrumDisplay;

/// What a resource can do, or what an instance needs
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, StrumDisplay)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
  DoublePrecision,
  ComplexEigen,
  Scaling,
  TipStates,
}

/// A device a backend can run instances on
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDetails {
  pub number: usize,
  pub name: String,
  pub description: String,
  pub capabilities: Vec<Capability>,
}

impl ResourceDetails {
  pub fn supports(&self, required: &[Capability]) -> bool {
    required.iter().all(|capability| self.capabilities.contains(capability))
  }
}

impl Display for ResourceDetails {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "#{} {} ({})", self.number, self.name, self.description)
  }
}

/// Buffer counts and dimensions of a new instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRequest {
  pub tip_count: usize,
  pub partials_buffer_count: usize,
  /// Number of tips whose data is given as states. These occupy buffers `[0, compact_buffer_count)`.
  pub compact_buffer_count: usize,
  pub state_count: usize,
  pub pattern_count: usize,
  /// Number of eigen decompositions. Matrices are always pushed precomputed, but the count is part of the request.
  pub eigen_buffer_count: usize,
  pub matrix_buffer_count: usize,
  pub category_count: usize,
  pub scale_buffer_count: usize,
  pub required: Vec<Capability>,
}

/// Details of a created instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDetails {
  pub resource: ResourceDetails,
  pub implementation: String,
}

impl Display for InstanceDetails {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} on resource {}", self.implementation, self.resource)
  }
}

/// One pruning step: `destination` from two (partials, matrix) pairs.
///
/// With `write_scale`, the destination is rescaled and its factors written to that scale buffer. With `read_scale`,
/// the destination is divided by factors previously written to that buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Operation {
  pub destination: usize,
  pub write_scale: Option<usize>,
  pub read_scale: Option<usize>,
  pub child1: usize,
  pub matrix1: usize,
  pub child2: usize,
  pub matrix2: usize,
}

/// A source of instances, typically one per library installation
pub trait AccelerationBackend: Send + Sync {
  fn resources(&self) -> Vec<ResourceDetails>;

  /// Creates an instance on the first resource in `resource_order` that supports the request, or on the first
  /// supporting resource when the order is empty
  fn create_instance(
    &self,
    request: &InstanceRequest,
    resource_order: &[usize],
  ) -> Result<Box<dyn AccelerationInstance>, Report>;
}

/// Buffers and batched arithmetic of one likelihood on one resource.
///
/// Partials buffers are laid out like the engines' partials: category, then pattern, then state. Matrices are
/// row-major per category. Scale buffers hold one factor per pattern.
pub trait AccelerationInstance: Send {
  fn details(&self) -> &InstanceDetails;

  fn set_tip_states(&mut self, tip: usize, states: &[usize]) -> Result<(), Report>;

  /// `pattern_count * state_count` values, used for every category
  fn set_tip_partials(&mut self, tip: usize, partials: &[f64]) -> Result<(), Report>;

  fn set_pattern_weights(&mut self, weights: &[f64]) -> Result<(), Report>;

  fn set_state_frequencies(&mut self, frequencies: &[f64]) -> Result<(), Report>;

  fn set_category_weights(&mut self, weights: &[f64]) -> Result<(), Report>;

  /// `category_count * state_count²` values
  fn set_transition_matrix(&mut self, matrix: usize, values: &[f64]) -> Result<(), Report>;

  /// Executes the operations in order
  fn update_partials(&mut self, operations: &[Operation]) -> Result<(), Report>;

  fn reset_scale_factors(&mut self, cumulative: usize) -> Result<(), Report>;

  /// Adds the logs of the factors in `scale_buffers` into the `cumulative` buffer
  fn accumulate_scale_factors(&mut self, scale_buffers: &[usize], cumulative: usize) -> Result<(), Report>;

  /// Integrates the root buffer across categories and returns the weighted sum of pattern log-likelihoods, with the
  /// log factors of `cumulative` added per pattern when given
  fn calculate_root_log_likelihoods(&mut self, root: usize, cumulative: Option<usize>) -> Result<f64, Report>;

  /// Per-pattern log-likelihoods of the last root calculation
  fn site_log_likelihoods(&self, out: &mut [f64]) -> Result<(), Report>;
}
