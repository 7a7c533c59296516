use crate::make_error;
use eyre::Report;
use itertools::Itertools;
use ndarray::Array2;
use smart_default::SmartDefault;

/// Produces transition probability matrices for a branch.
///
/// Matrices are flat and row-major: entry `i * n + j` is the probability of ending in state `j` given state `i` at
/// the parent end of the branch. Distances are in expected substitutions per site.
pub trait SubstitutionModel: Send + Sync {
  fn state_count(&self) -> usize;

  /// Equilibrium state frequencies, summing to 1
  fn frequencies(&self) -> &[f64];

  fn transition_probabilities(&self, distance: f64, out: &mut [f64]);

  /// Whether the rate matrix may have complex eigenvalues. Acceleration backends use a different code path for those.
  fn can_return_complex_diagonalization(&self) -> bool {
    false
  }

  fn transition_matrix(&self, distance: f64) -> Array2<f64> {
    let n = self.state_count();
    let mut out = vec![0.0; n * n];
    self.transition_probabilities(distance, &mut out);
    Array2::from_shape_vec((n, n), out).unwrap_or_else(|_| unreachable!("matrix buffer has n * n entries"))
  }
}

fn check_frequencies(pi: &[f64], n_states: usize) -> Result<Vec<f64>, Report> {
  if pi.len() != n_states {
    return make_error!("Expected {n_states} equilibrium frequencies, but found {}", pi.len());
  }
  if pi.iter().any(|p| !p.is_finite() || *p <= 0.0) {
    return make_error!("Equilibrium frequencies must be positive and finite, but found: {}", pi.iter().join(", "));
  }
  let sum: f64 = pi.iter().sum();
  Ok(pi.iter().map(|p| p / sum).collect_vec())
}

fn check_distance(distance: f64) {
  assert!(
    distance.is_finite() && distance >= 0.0,
    "Branch distance must be finite and non-negative, but got {distance}"
  );
}

#[derive(Copy, Clone, Debug, SmartDefault)]
pub struct Jc69Params {
  #[default = 4]
  pub n_states: usize,
}

/// Jukes-Cantor 1969 model, generalized to `n` states (Mk model).
///
/// Equal frequencies and equal exchange rates between all states.
///
/// See: Jukes and Cantor (1969). Evolution of Protein Molecules. New York: Academic Press. pp. 21–132
#[derive(Clone, Debug)]
pub struct Jc69 {
  n_states: usize,
  pi: Vec<f64>,
}

impl Jc69 {
  pub fn new(Jc69Params { n_states }: Jc69Params) -> Result<Self, Report> {
    if n_states < 2 {
      return make_error!("Jukes-Cantor model requires at least 2 states, but got {n_states}");
    }
    Ok(Self {
      n_states,
      pi: vec![1.0 / n_states as f64; n_states],
    })
  }
}

impl SubstitutionModel for Jc69 {
  fn state_count(&self) -> usize {
    self.n_states
  }

  fn frequencies(&self) -> &[f64] {
    &self.pi
  }

  fn transition_probabilities(&self, distance: f64, out: &mut [f64]) {
    check_distance(distance);
    let n = self.n_states as f64;
    let e = (-n / (n - 1.0) * distance).exp();
    let same = 1.0 / n + (n - 1.0) / n * e;
    let different = (1.0 - e) / n;
    for (i, row) in out.chunks_exact_mut(self.n_states).enumerate() {
      row.fill(different);
      row[i] = same;
    }
  }
}

#[derive(Clone, Debug, SmartDefault)]
pub struct F81Params {
  #[default(vec![0.25; 4])]
  pub pi: Vec<f64>,
}

/// Felsenstein 1981 model: equal exchange rates, arbitrary equilibrium frequencies.
///
/// See: Felsenstein (1981). Evolutionary trees from DNA sequences: a maximum likelihood approach. J Mol Evol 17:368–376
#[derive(Clone, Debug)]
pub struct F81 {
  pi: Vec<f64>,
  beta: f64,
}

impl F81 {
  pub fn new(F81Params { pi }: F81Params) -> Result<Self, Report> {
    if pi.len() < 2 {
      return make_error!("F81 model requires at least 2 states, but got {}", pi.len());
    }
    let pi = check_frequencies(&pi, pi.len())?;
    let beta = 1.0 / (1.0 - pi.iter().map(|p| p * p).sum::<f64>());
    Ok(Self { pi, beta })
  }
}

impl SubstitutionModel for F81 {
  fn state_count(&self) -> usize {
    self.pi.len()
  }

  fn frequencies(&self) -> &[f64] {
    &self.pi
  }

  fn transition_probabilities(&self, distance: f64, out: &mut [f64]) {
    check_distance(distance);
    let e = (-self.beta * distance).exp();
    for (i, row) in out.chunks_exact_mut(self.pi.len()).enumerate() {
      for (j, p) in row.iter_mut().enumerate() {
        *p = self.pi[j] * (1.0 - e);
      }
      row[i] += e;
    }
  }
}

#[derive(Clone, Debug, SmartDefault)]
pub struct HkyParams {
  /// Ratio of transition to transversion rates
  #[default = 2.0]
  pub kappa: f64,

  /// Frequencies of A, C, G, T
  #[default(vec![0.25; 4])]
  pub pi: Vec<f64>,
}

/// Hasegawa-Kishino-Yano 1985 model. With uniform frequencies this is the Kimura 1980 model.
///
/// See: Hasegawa, Kishino and Yano (1985). Dating of the human-ape splitting by a molecular clock of mitochondrial
/// DNA. J Mol Evol 22:160–174
#[derive(Clone, Debug)]
pub struct Hky {
  kappa: f64,
  pi: Vec<f64>,
  beta: f64,
}

const fn is_purine(state: usize) -> bool {
  state == 0 || state == 2
}

impl Hky {
  pub fn new(HkyParams { kappa, pi }: HkyParams) -> Result<Self, Report> {
    if !kappa.is_finite() || kappa <= 0.0 {
      return make_error!("HKY model requires a positive kappa, but got {kappa}");
    }
    let pi = check_frequencies(&pi, 4)?;
    let pi_r = pi[0] + pi[2];
    let pi_y = pi[1] + pi[3];
    let beta = 1.0 / (2.0 * pi_r * pi_y + 2.0 * kappa * (pi[0] * pi[2] + pi[1] * pi[3]));
    Ok(Self { kappa, pi, beta })
  }

  pub const fn kappa(&self) -> f64 {
    self.kappa
  }
}

impl SubstitutionModel for Hky {
  fn state_count(&self) -> usize {
    4
  }

  fn frequencies(&self) -> &[f64] {
    &self.pi
  }

  fn transition_probabilities(&self, distance: f64, out: &mut [f64]) {
    check_distance(distance);
    let pi = &self.pi;
    let pi_r = pi[0] + pi[2];
    let pi_y = pi[1] + pi[3];
    let e1 = (-self.beta * distance).exp();
    for (i, row) in out.chunks_exact_mut(4).enumerate() {
      for (j, p) in row.iter_mut().enumerate() {
        *p = if is_purine(i) != is_purine(j) {
          pi[j] * (1.0 - e1)
        } else {
          let class = if is_purine(j) { pi_r } else { pi_y };
          let e2 = (-self.beta * distance * (1.0 + class * (self.kappa - 1.0))).exp();
          let shared = pi[j] + pi[j] * (1.0 / class - 1.0) * e1;
          if i == j {
            shared + (class - pi[j]) / class * e2
          } else {
            shared - pi[j] / class * e2
          }
        };
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::{assert_abs_diff_eq, assert_ulps_eq};
  use ndarray::{array, Axis};
  use rstest::rstest;

  fn assert_stochastic(model: &dyn SubstitutionModel, distance: f64) {
    let m = model.transition_matrix(distance);
    for row in m.axis_iter(Axis(0)) {
      assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
      assert!(row.iter().all(|p| *p >= 0.0));
    }
  }

  #[rstest]
  #[case(0.0)]
  #[case(0.1)]
  #[case(2.5)]
  #[case(1e3)]
  fn rows_are_stochastic(#[case] distance: f64) -> Result<(), Report> {
    assert_stochastic(&Jc69::new(Jc69Params::default())?, distance);
    assert_stochastic(&Jc69::new(Jc69Params { n_states: 7 })?, distance);
    assert_stochastic(&F81::new(F81Params { pi: vec![0.1, 0.2, 0.3, 0.4] })?, distance);
    assert_stochastic(
      &Hky::new(HkyParams {
        kappa: 4.0,
        pi: vec![0.1, 0.2, 0.3, 0.4],
      })?,
      distance,
    );
    Ok(())
  }

  #[rstest]
  fn zero_distance_is_identity() -> Result<(), Report> {
    let hky = Hky::new(HkyParams::default())?;
    assert_abs_diff_eq!(hky.transition_matrix(0.0), Array2::<f64>::eye(4), epsilon = 1e-15);
    Ok(())
  }

  #[rstest]
  fn long_distance_reaches_equilibrium() -> Result<(), Report> {
    let f81 = F81::new(F81Params { pi: vec![0.1, 0.2, 0.3, 0.4] })?;
    let m = f81.transition_matrix(1e3);
    assert_abs_diff_eq!(m.row(2), array![0.1, 0.2, 0.3, 0.4], epsilon = 1e-12);
    Ok(())
  }

  #[rstest]
  fn binary_jukes_cantor() -> Result<(), Report> {
    let jc = Jc69::new(Jc69Params { n_states: 2 })?;
    let m = jc.transition_matrix(0.5);
    let e = (-1.0_f64).exp();
    assert_ulps_eq!(m[[0, 0]], 0.5 + 0.5 * e);
    assert_abs_diff_eq!(m[[0, 1]], 0.5 - 0.5 * e, epsilon = 1e-15);
    Ok(())
  }

  #[rstest]
  fn hky_with_unit_kappa_is_f81() -> Result<(), Report> {
    let pi = vec![0.1, 0.2, 0.3, 0.4];
    let hky = Hky::new(HkyParams { kappa: 1.0, pi: pi.clone() })?;
    let f81 = F81::new(F81Params { pi })?;
    assert_abs_diff_eq!(hky.transition_matrix(0.3), f81.transition_matrix(0.3), epsilon = 1e-14);
    Ok(())
  }

  #[rstest]
  fn rejects_bad_parameters() {
    assert!(Jc69::new(Jc69Params { n_states: 1 }).is_err());
    assert!(F81::new(F81Params { pi: vec![0.5, 0.0] }).is_err());
    assert!(Hky::new(HkyParams { kappa: -1.0, ..HkyParams::default() }).is_err());
  }
}
