use crate::accel::instance::{
  AccelerationBackend, AccelerationInstance, Capability, InstanceDetails, InstanceRequest, Operation, ResourceDetails,
};
use crate::core::kernels::{self, Identity, KernelShape};
use crate::make_error;
use eyre::Report;
use log::info;

/// In-process backend with a single resource, executing operations with the engines' kernels
#[derive(Clone, Debug)]
pub struct CpuBackend {
  resources: Vec<ResourceDetails>,
}

impl Default for CpuBackend {
  fn default() -> Self {
    Self::with_resources(vec![ResourceDetails {
      number: 0,
      name: "CPU".to_owned(),
      description: format!("{} logical cores", num_cpus::get()),
      capabilities: vec![
        Capability::DoublePrecision,
        Capability::Scaling,
        Capability::TipStates,
      ],
    }])
  }
}

impl CpuBackend {
  /// Backend advertising the given resources, all served by the same CPU implementation
  pub fn with_resources(resources: Vec<ResourceDetails>) -> Self {
    Self { resources }
  }

  fn select(&self, required: &[Capability], resource_order: &[usize]) -> Option<&ResourceDetails> {
    if resource_order.is_empty() {
      self.resources.iter().find(|resource| resource.supports(required))
    } else {
      resource_order.iter().find_map(|&number| {
        self
          .resources
          .iter()
          .find(|resource| resource.number == number && resource.supports(required))
      })
    }
  }
}

impl AccelerationBackend for CpuBackend {
  fn resources(&self) -> Vec<ResourceDetails> {
    self.resources.clone()
  }

  fn create_instance(
    &self,
    request: &InstanceRequest,
    resource_order: &[usize],
  ) -> Result<Box<dyn AccelerationInstance>, Report> {
    let Some(resource) = self.select(&request.required, resource_order) else {
      let required = request.required.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
      return make_error!(
        "No resource supports the required capabilities [{required}] (resource order: {resource_order:?})"
      );
    };
    let instance = CpuInstance::new(request, resource.clone())?;
    info!("Created likelihood instance: {}", instance.details());
    Ok(Box::new(instance))
  }
}

/// Buffers of one instance held in host memory.
///
/// Scale buffers written by an operation hold the raw per-pattern factors. Cumulative buffers hold sums of their
/// logs.
pub struct CpuInstance {
  details: InstanceDetails,
  request: InstanceRequest,
  tip_states: Vec<Option<Vec<usize>>>,
  partials: Vec<Option<Vec<f64>>>,
  matrices: Vec<Option<Vec<f64>>>,
  scale_buffers: Vec<Vec<f64>>,
  pattern_weights: Vec<f64>,
  frequencies: Option<Vec<f64>>,
  category_weights: Option<Vec<f64>>,
  root_partials: Vec<f64>,
  site_log_likelihoods: Vec<f64>,
}

impl CpuInstance {
  pub fn new(request: &InstanceRequest, resource: ResourceDetails) -> Result<Self, Report> {
    if request.state_count < 2 || request.pattern_count == 0 || request.category_count == 0 {
      return make_error!(
        "Instance needs at least 2 states, one pattern and one category, but {} states, {} patterns and {} categories were requested",
        request.state_count,
        request.pattern_count,
        request.category_count
      );
    }
    if request.compact_buffer_count > request.tip_count || request.tip_count > request.partials_buffer_count {
      return make_error!(
        "Inconsistent buffer counts: {} compact buffers, {} tips, {} partials buffers",
        request.compact_buffer_count,
        request.tip_count,
        request.partials_buffer_count
      );
    }

    Ok(Self {
      details: InstanceDetails {
        resource,
        implementation: "CPU-double".to_owned(),
      },
      request: request.clone(),
      tip_states: vec![None; request.compact_buffer_count],
      partials: vec![None; request.partials_buffer_count],
      matrices: vec![None; request.matrix_buffer_count],
      scale_buffers: vec![vec![0.0; request.pattern_count]; request.scale_buffer_count],
      pattern_weights: vec![1.0; request.pattern_count],
      frequencies: None,
      category_weights: None,
      root_partials: vec![0.0; request.pattern_count * request.state_count],
      site_log_likelihoods: vec![0.0; request.pattern_count],
    })
  }

  fn shape(&self) -> KernelShape {
    KernelShape {
      n_states: self.request.state_count,
      n_categories: self.request.category_count,
      n_rows: self.request.pattern_count,
      stride: self.request.pattern_count,
    }
  }

  fn partials_size(&self) -> usize {
    self.request.category_count * self.request.pattern_count * self.request.state_count
  }

  fn check_index(&self, kind: &str, index: usize, count: usize) -> Result<(), Report> {
    if index >= count {
      return make_error!("{kind} buffer {index} is out of range, the instance has {count}");
    }
    Ok(())
  }

  fn check_len(kind: &str, actual: usize, expected: usize) -> Result<(), Report> {
    if actual != expected {
      return make_error!("{kind} must have {expected} values, but {actual} were given");
    }
    Ok(())
  }

  fn matrix(&self, index: usize) -> Result<&[f64], Report> {
    self.check_index("Matrix", index, self.matrices.len())?;
    match &self.matrices[index] {
      Some(matrix) => Ok(matrix),
      None => make_error!("Matrix buffer {index} is used before it was set"),
    }
  }

  fn tip_states(&self, buffer: usize) -> Option<&[usize]> {
    self.tip_states.get(buffer).and_then(Option::as_deref)
  }

  fn partials(&self, buffer: usize) -> Result<&[f64], Report> {
    self.check_index("Partials", buffer, self.partials.len())?;
    match &self.partials[buffer] {
      Some(partials) => Ok(partials),
      None => make_error!("Partials buffer {buffer} is used before it was computed"),
    }
  }

  fn execute(&mut self, op: &Operation) -> Result<(), Report> {
    self.check_index("Partials", op.destination, self.partials.len())?;
    if op.destination < self.request.tip_count {
      return make_error!("Operation writes into tip buffer {}", op.destination);
    }
    if op.destination == op.child1 || op.destination == op.child2 {
      return make_error!("Operation reads from its own destination buffer {}", op.destination);
    }

    let shape = self.shape();
    let size = self.partials_size();
    let mut out = self.partials[op.destination].take().unwrap_or_else(|| vec![0.0; size]);

    let m1 = self.matrix(op.matrix1)?;
    let m2 = self.matrix(op.matrix2)?;
    match (self.tip_states(op.child1), self.tip_states(op.child2)) {
      (Some(s1), Some(s2)) => kernels::states_states(&shape, s1, m1, s2, m2, &mut out),
      (Some(s1), None) => kernels::states_partials(&shape, s1, m1, self.partials(op.child2)?, Identity, m2, &mut out),
      (None, Some(s2)) => kernels::states_partials(&shape, s2, m2, self.partials(op.child1)?, Identity, m1, &mut out),
      (None, None) => kernels::partials_partials(
        &shape,
        self.partials(op.child1)?,
        Identity,
        m1,
        self.partials(op.child2)?,
        Identity,
        m2,
        &mut out,
      ),
    }

    if let Some(scale) = op.write_scale {
      self.check_index("Scale", scale, self.scale_buffers.len())?;
      rescale(&shape, &mut out, &mut self.scale_buffers[scale]);
    } else if let Some(scale) = op.read_scale {
      self.check_index("Scale", scale, self.scale_buffers.len())?;
      apply_scale(&shape, &mut out, &self.scale_buffers[scale]);
    }

    self.partials[op.destination] = Some(out);
    Ok(())
  }
}

/// Divides each pattern by its largest entry and records that entry, or 1 when the pattern is all zero
fn rescale(shape: &KernelShape, partials: &mut [f64], factors: &mut [f64]) {
  let ns = shape.n_states;
  for (pattern, factor) in factors.iter_mut().enumerate().take(shape.n_rows) {
    let mut max = 0.0_f64;
    for c in 0..shape.n_categories {
      let start = (c * shape.stride + pattern) * ns;
      for &p in &partials[start..start + ns] {
        max = max.max(p);
      }
    }
    *factor = if max > 0.0 { max } else { 1.0 };
  }
  apply_scale(shape, partials, factors);
}

fn apply_scale(shape: &KernelShape, partials: &mut [f64], factors: &[f64]) {
  let ns = shape.n_states;
  for c in 0..shape.n_categories {
    for (pattern, &factor) in factors.iter().enumerate().take(shape.n_rows) {
      let start = (c * shape.stride + pattern) * ns;
      for p in &mut partials[start..start + ns] {
        *p /= factor;
      }
    }
  }
}

impl AccelerationInstance for CpuInstance {
  fn details(&self) -> &InstanceDetails {
    &self.details
  }

  fn set_tip_states(&mut self, tip: usize, states: &[usize]) -> Result<(), Report> {
    self.check_index("Compact tip", tip, self.tip_states.len())?;
    Self::check_len("Tip states", states.len(), self.request.pattern_count)?;
    self.tip_states[tip] = Some(states.to_vec());
    Ok(())
  }

  fn set_tip_partials(&mut self, tip: usize, partials: &[f64]) -> Result<(), Report> {
    self.check_index("Tip", tip, self.request.tip_count)?;
    Self::check_len(
      "Tip partials",
      partials.len(),
      self.request.pattern_count * self.request.state_count,
    )?;
    self.partials[tip] = Some(partials.repeat(self.request.category_count));
    if let Some(states) = self.tip_states.get_mut(tip) {
      *states = None;
    }
    Ok(())
  }

  fn set_pattern_weights(&mut self, weights: &[f64]) -> Result<(), Report> {
    Self::check_len("Pattern weights", weights.len(), self.request.pattern_count)?;
    self.pattern_weights.copy_from_slice(weights);
    Ok(())
  }

  fn set_state_frequencies(&mut self, frequencies: &[f64]) -> Result<(), Report> {
    Self::check_len("State frequencies", frequencies.len(), self.request.state_count)?;
    self.frequencies = Some(frequencies.to_vec());
    Ok(())
  }

  fn set_category_weights(&mut self, weights: &[f64]) -> Result<(), Report> {
    Self::check_len("Category weights", weights.len(), self.request.category_count)?;
    self.category_weights = Some(weights.to_vec());
    Ok(())
  }

  fn set_transition_matrix(&mut self, matrix: usize, values: &[f64]) -> Result<(), Report> {
    self.check_index("Matrix", matrix, self.matrices.len())?;
    let n_states = self.request.state_count;
    Self::check_len(
      "Transition matrix",
      values.len(),
      self.request.category_count * n_states * n_states,
    )?;
    self.matrices[matrix] = Some(values.to_vec());
    Ok(())
  }

  fn update_partials(&mut self, operations: &[Operation]) -> Result<(), Report> {
    for op in operations {
      self.execute(op)?;
    }
    Ok(())
  }

  fn reset_scale_factors(&mut self, cumulative: usize) -> Result<(), Report> {
    self.check_index("Scale", cumulative, self.scale_buffers.len())?;
    self.scale_buffers[cumulative].fill(0.0);
    Ok(())
  }

  fn accumulate_scale_factors(&mut self, scale_buffers: &[usize], cumulative: usize) -> Result<(), Report> {
    self.check_index("Scale", cumulative, self.scale_buffers.len())?;
    let mut sum = std::mem::take(&mut self.scale_buffers[cumulative]);
    for &buffer in scale_buffers {
      self.check_index("Scale", buffer, self.scale_buffers.len())?;
      if buffer == cumulative {
        return make_error!("Scale buffer {buffer} cannot be accumulated into itself");
      }
      for (s, factor) in sum.iter_mut().zip(&self.scale_buffers[buffer]) {
        *s += factor.ln();
      }
    }
    self.scale_buffers[cumulative] = sum;
    Ok(())
  }

  fn calculate_root_log_likelihoods(&mut self, root: usize, cumulative: Option<usize>) -> Result<f64, Report> {
    let shape = self.shape();
    self.partials(root)?;
    if let Some(cumulative) = cumulative {
      self.check_index("Scale", cumulative, self.scale_buffers.len())?;
    }

    let Self {
      partials,
      frequencies,
      category_weights,
      scale_buffers,
      pattern_weights,
      root_partials,
      site_log_likelihoods,
      ..
    } = self;
    let Some(frequencies) = frequencies else {
      return make_error!("State frequencies must be set before calculating root log-likelihoods");
    };
    let Some(category_weights) = category_weights else {
      return make_error!("Category weights must be set before calculating root log-likelihoods");
    };

    if let Some(root_buffer) = &partials[root] {
      kernels::integrate_partials(&shape, root_buffer, Identity, category_weights, root_partials);
    }
    kernels::root_log_likelihoods(shape.n_states, root_partials, frequencies, site_log_likelihoods);

    if let Some(cumulative) = cumulative {
      for (log_l, log_factor) in site_log_likelihoods.iter_mut().zip(&scale_buffers[cumulative]) {
        *log_l += log_factor;
      }
    }

    Ok(
      site_log_likelihoods
        .iter()
        .zip(pattern_weights.iter())
        .filter(|(_, &weight)| weight != 0.0)
        .map(|(log_l, weight)| log_l * weight)
        .sum(),
    )
  }

  fn site_log_likelihoods(&self, out: &mut [f64]) -> Result<(), Report> {
    Self::check_len("Site log-likelihood output", out.len(), self.request.pattern_count)?;
    out.copy_from_slice(&self.site_log_likelihoods);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::utils::error::report_to_string;
  use approx::assert_abs_diff_eq;
  use pretty_assertions::assert_eq;
  use rstest::{fixture, rstest};

  const M1: [f64; 4] = [0.9, 0.1, 0.1, 0.9];
  const M2: [f64; 4] = [0.8, 0.2, 0.2, 0.8];

  fn request(required: Vec<Capability>) -> InstanceRequest {
    InstanceRequest {
      tip_count: 2,
      partials_buffer_count: 3,
      compact_buffer_count: 2,
      state_count: 2,
      pattern_count: 2,
      eigen_buffer_count: 1,
      matrix_buffer_count: 2,
      category_count: 1,
      scale_buffer_count: 2,
      required,
    }
  }

  fn cherry_op(write_scale: Option<usize>, read_scale: Option<usize>) -> Operation {
    Operation {
      destination: 2,
      write_scale,
      read_scale,
      child1: 0,
      matrix1: 0,
      child2: 1,
      matrix2: 1,
    }
  }

  #[fixture]
  fn cherry() -> Box<dyn AccelerationInstance> {
    let mut instance = CpuBackend::default()
      .create_instance(&request(vec![Capability::TipStates]), &[])
      .unwrap();
    instance.set_tip_states(0, &[0, 1]).unwrap();
    instance.set_tip_states(1, &[0, 0]).unwrap();
    instance.set_transition_matrix(0, &M1).unwrap();
    instance.set_transition_matrix(1, &M2).unwrap();
    instance.set_pattern_weights(&[2.0, 1.0]).unwrap();
    instance.set_state_frequencies(&[0.5, 0.5]).unwrap();
    instance.set_category_weights(&[1.0]).unwrap();
    instance
  }

  // Root partials are [0.72, 0.02] and [0.08, 0.18]
  #[rstest]
  fn computes_cherry(mut cherry: Box<dyn AccelerationInstance>) -> Result<(), Report> {
    cherry.update_partials(&[cherry_op(None, None)])?;
    let log_l = cherry.calculate_root_log_likelihoods(2, None)?;
    assert_abs_diff_eq!(log_l, 2.0 * 0.37_f64.ln() + 0.13_f64.ln(), epsilon = 1e-12);

    let mut sites = vec![0.0; 2];
    cherry.site_log_likelihoods(&mut sites)?;
    assert_abs_diff_eq!(sites[1], 0.13_f64.ln(), epsilon = 1e-12);
    Ok(())
  }

  #[rstest]
  fn scale_factors_are_transparent(mut cherry: Box<dyn AccelerationInstance>) -> Result<(), Report> {
    cherry.update_partials(&[cherry_op(Some(0), None)])?;
    cherry.reset_scale_factors(1)?;
    cherry.accumulate_scale_factors(&[0], 1)?;
    let scaled = cherry.calculate_root_log_likelihoods(2, Some(1))?;
    assert_abs_diff_eq!(scaled, 2.0 * 0.37_f64.ln() + 0.13_f64.ln(), epsilon = 1e-12);

    cherry.update_partials(&[cherry_op(None, Some(0))])?;
    let reread = cherry.calculate_root_log_likelihoods(2, Some(1))?;
    assert_eq!(reread.to_bits(), scaled.to_bits());
    Ok(())
  }

  #[rstest]
  fn rejects_unset_matrix() {
    let mut instance = CpuBackend::default().create_instance(&request(vec![]), &[]).unwrap();
    instance.set_tip_states(0, &[0, 1]).unwrap();
    instance.set_tip_states(1, &[0, 0]).unwrap();
    let report = instance.update_partials(&[cherry_op(None, None)]).unwrap_err();
    assert_eq!(report_to_string(&report), "Matrix buffer 0 is used before it was set");
  }

  #[rstest]
  fn rejects_root_without_frequencies() {
    let mut instance = CpuBackend::default().create_instance(&request(vec![]), &[]).unwrap();
    instance.set_tip_states(0, &[0, 1]).unwrap();
    instance.set_tip_states(1, &[0, 0]).unwrap();
    instance.set_transition_matrix(0, &M1).unwrap();
    instance.set_transition_matrix(1, &M2).unwrap();
    instance.update_partials(&[cherry_op(None, None)]).unwrap();
    assert!(instance.calculate_root_log_likelihoods(2, None).is_err());
  }

  #[rstest]
  fn fails_without_matching_resource() {
    let result = CpuBackend::default().create_instance(&request(vec![Capability::ComplexEigen]), &[]);
    assert!(result.is_err());
  }

  #[rstest]
  fn follows_resource_order() -> Result<(), Report> {
    let resource = |number: usize, capabilities: Vec<Capability>| ResourceDetails {
      number,
      name: format!("device-{number}"),
      description: String::new(),
      capabilities,
    };
    let backend = CpuBackend::with_resources(vec![
      resource(0, vec![Capability::DoublePrecision]),
      resource(1, vec![Capability::DoublePrecision, Capability::ComplexEigen]),
      resource(2, vec![Capability::DoublePrecision]),
    ]);

    let request = request(vec![Capability::DoublePrecision]);
    assert_eq!(backend.create_instance(&request, &[])?.details().resource.number, 0);
    assert_eq!(backend.create_instance(&request, &[2, 1])?.details().resource.number, 2);
    assert!(backend.create_instance(&request, &[5]).is_err());
    Ok(())
  }
}
