//! Pruning kernels shared by every engine.
//!
//! Partials are laid out category-major, then row, then state: entry `(c * stride + row) * n_states + i`. A row is a
//! site pattern for full buffers, or a distinct child-value pair for compact ones. Matrices are laid out per
//! category, row-major, with entry `c * n_states² + i * n_states + j` the probability of child state `j` given parent
//! state `i`. Child states at or above `n_states` are unknown and contribute a factor of 1.
//!
//! Each kernel is instantiated for 4 states at compile time, with a runtime state count for everything else.

/// Maps an output row to the row of an input buffer
pub trait RowIndex: Copy {
  fn row(&self, r: usize) -> usize;
}

/// Output row `r` reads input row `r`
#[derive(Copy, Clone, Debug)]
pub struct Identity;

impl RowIndex for Identity {
  #[inline(always)]
  fn row(&self, r: usize) -> usize {
    r
  }
}

impl RowIndex for &[usize] {
  #[inline(always)]
  fn row(&self, r: usize) -> usize {
    self[r]
  }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KernelShape {
  pub n_states: usize,
  pub n_categories: usize,
  /// Rows to compute in the output
  pub n_rows: usize,
  /// Rows per category in every partials buffer
  pub stride: usize,
}

impl KernelShape {
  #[inline(always)]
  const fn states<const N: usize>(&self) -> usize {
    if N == 0 {
      self.n_states
    } else {
      N
    }
  }

  #[inline(always)]
  const fn offset(&self, ns: usize, c: usize, row: usize) -> usize {
    (c * self.stride + row) * ns
  }
}

#[inline(always)]
fn lookup(m_row: &[f64], state: usize) -> f64 {
  if state < m_row.len() {
    m_row[state]
  } else {
    1.0
  }
}

#[inline(always)]
fn dot(ns: usize, m_row: &[f64], p: &[f64]) -> f64 {
  let (m_row, p) = (&m_row[..ns], &p[..ns]);
  let mut sum = 0.0;
  for j in 0..ns {
    sum += m_row[j] * p[j];
  }
  sum
}

/// Both children are leaves with observed states: `states1[r]` and `states2[r]` for every output row
pub fn states_states(shape: &KernelShape, states1: &[usize], m1: &[f64], states2: &[usize], m2: &[f64], out: &mut [f64]) {
  match shape.n_states {
    4 => states_states_impl::<4>(shape, states1, m1, states2, m2, out),
    _ => states_states_impl::<0>(shape, states1, m1, states2, m2, out),
  }
}

#[inline(always)]
fn states_states_impl<const N: usize>(
  shape: &KernelShape,
  states1: &[usize],
  m1: &[f64],
  states2: &[usize],
  m2: &[f64],
  out: &mut [f64],
) {
  let ns = shape.states::<N>();
  for c in 0..shape.n_categories {
    let m1 = &m1[c * ns * ns..(c + 1) * ns * ns];
    let m2 = &m2[c * ns * ns..(c + 1) * ns * ns];
    for r in 0..shape.n_rows {
      let (s1, s2) = (states1[r], states2[r]);
      let o = &mut out[shape.offset(ns, c, r)..][..ns];
      for i in 0..ns {
        let row1 = &m1[i * ns..(i + 1) * ns];
        let row2 = &m2[i * ns..(i + 1) * ns];
        o[i] = lookup(row1, s1) * lookup(row2, s2);
      }
    }
  }
}

/// First child is a leaf with observed states, second child has partials
pub fn states_partials<R: RowIndex>(
  shape: &KernelShape,
  states1: &[usize],
  m1: &[f64],
  partials2: &[f64],
  rows2: R,
  m2: &[f64],
  out: &mut [f64],
) {
  match shape.n_states {
    4 => states_partials_impl::<4, R>(shape, states1, m1, partials2, rows2, m2, out),
    _ => states_partials_impl::<0, R>(shape, states1, m1, partials2, rows2, m2, out),
  }
}

#[inline(always)]
fn states_partials_impl<const N: usize, R: RowIndex>(
  shape: &KernelShape,
  states1: &[usize],
  m1: &[f64],
  partials2: &[f64],
  rows2: R,
  m2: &[f64],
  out: &mut [f64],
) {
  let ns = shape.states::<N>();
  for c in 0..shape.n_categories {
    let m1 = &m1[c * ns * ns..(c + 1) * ns * ns];
    let m2 = &m2[c * ns * ns..(c + 1) * ns * ns];
    for r in 0..shape.n_rows {
      let s1 = states1[r];
      let p2 = &partials2[shape.offset(ns, c, rows2.row(r))..][..ns];
      let o = &mut out[shape.offset(ns, c, r)..][..ns];
      for i in 0..ns {
        let row1 = &m1[i * ns..(i + 1) * ns];
        let row2 = &m2[i * ns..(i + 1) * ns];
        o[i] = lookup(row1, s1) * dot(ns, row2, p2);
      }
    }
  }
}

/// Both children have partials
#[allow(clippy::too_many_arguments)]
pub fn partials_partials<R1: RowIndex, R2: RowIndex>(
  shape: &KernelShape,
  partials1: &[f64],
  rows1: R1,
  m1: &[f64],
  partials2: &[f64],
  rows2: R2,
  m2: &[f64],
  out: &mut [f64],
) {
  match shape.n_states {
    4 => partials_partials_impl::<4, R1, R2>(shape, partials1, rows1, m1, partials2, rows2, m2, out),
    _ => partials_partials_impl::<0, R1, R2>(shape, partials1, rows1, m1, partials2, rows2, m2, out),
  }
}

#[allow(clippy::too_many_arguments)]
#[inline(always)]
fn partials_partials_impl<const N: usize, R1: RowIndex, R2: RowIndex>(
  shape: &KernelShape,
  partials1: &[f64],
  rows1: R1,
  m1: &[f64],
  partials2: &[f64],
  rows2: R2,
  m2: &[f64],
  out: &mut [f64],
) {
  let ns = shape.states::<N>();
  for c in 0..shape.n_categories {
    let m1 = &m1[c * ns * ns..(c + 1) * ns * ns];
    let m2 = &m2[c * ns * ns..(c + 1) * ns * ns];
    for r in 0..shape.n_rows {
      let p1 = &partials1[shape.offset(ns, c, rows1.row(r))..][..ns];
      let p2 = &partials2[shape.offset(ns, c, rows2.row(r))..][..ns];
      let o = &mut out[shape.offset(ns, c, r)..][..ns];
      for i in 0..ns {
        let row1 = &m1[i * ns..(i + 1) * ns];
        let row2 = &m2[i * ns..(i + 1) * ns];
        o[i] = dot(ns, row1, p1) * dot(ns, row2, p2);
      }
    }
  }
}

/// Rescales every output row whose largest entry across categories and states is below `threshold`, dividing the
/// row by that maximum and writing its log into `log_factors[row]`. Other rows get a log factor of 0.
pub fn scale_partials(shape: &KernelShape, threshold: f64, partials: &mut [f64], log_factors: &mut [f64]) {
  let ns = shape.n_states;
  for r in 0..shape.n_rows {
    let mut max = 0.0_f64;
    for c in 0..shape.n_categories {
      for &p in &partials[shape.offset(ns, c, r)..][..ns] {
        max = max.max(p);
      }
    }

    if max > 0.0 && max < threshold {
      for c in 0..shape.n_categories {
        for p in &mut partials[shape.offset(ns, c, r)..][..ns] {
          *p /= max;
        }
      }
      log_factors[r] = max.ln();
    } else {
      log_factors[r] = 0.0;
    }
  }
}

/// Mixes categories with the given proportions into one row of `n_states` entries per output row
pub fn integrate_partials<R: RowIndex>(
  shape: &KernelShape,
  partials: &[f64],
  rows: R,
  proportions: &[f64],
  out: &mut [f64],
) {
  let ns = shape.n_states;
  for r in 0..shape.n_rows {
    let o = &mut out[r * ns..(r + 1) * ns];
    let p = &partials[shape.offset(ns, 0, rows.row(r))..][..ns];
    for i in 0..ns {
      o[i] = p[i] * proportions[0];
    }
  }
  for c in 1..shape.n_categories {
    for r in 0..shape.n_rows {
      let o = &mut out[r * ns..(r + 1) * ns];
      let p = &partials[shape.offset(ns, c, rows.row(r))..][..ns];
      for i in 0..ns {
        o[i] += p[i] * proportions[c];
      }
    }
  }
}

/// Log of the frequency-weighted sum of root partials, one value per pattern, without scaling corrections
pub fn root_log_likelihoods(n_states: usize, root_partials: &[f64], frequencies: &[f64], out: &mut [f64]) {
  for (o, p) in out.iter_mut().zip(root_partials.chunks_exact(n_states)) {
    let sum: f64 = p.iter().zip(frequencies).map(|(p, f)| p * f).sum();
    *o = sum.ln();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_ulps_eq;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  // Binary model with P(same) = 0.9
  const M2: [f64; 4] = [0.9, 0.1, 0.1, 0.9];

  fn shape(n_states: usize, n_rows: usize) -> KernelShape {
    KernelShape {
      n_states,
      n_categories: 1,
      n_rows,
      stride: n_rows,
    }
  }

  #[rstest]
  fn states_states_multiplies_matrix_entries() {
    let mut out = vec![0.0; 6];
    states_states(&shape(2, 3), &[0, 1, 2], &M2, &[0, 0, 2], &M2, &mut out);
    assert_eq!(out, vec![0.9 * 0.9, 0.1 * 0.1, 0.1 * 0.9, 0.9 * 0.1, 1.0, 1.0]);
  }

  #[rstest]
  fn states_partials_matches_states_states_for_indicator_partials() {
    let mut expected = vec![0.0; 4];
    states_states(&shape(2, 2), &[0, 1], &M2, &[1, 2], &M2, &mut expected);

    let mut out = vec![0.0; 4];
    let partials2 = [0.0, 1.0, 1.0, 1.0];
    states_partials(&shape(2, 2), &[0, 1], &M2, &partials2, Identity, &M2, &mut out);

    for (a, b) in out.iter().zip(&expected) {
      assert_ulps_eq!(a, b);
    }
  }

  #[rstest]
  fn partials_partials_follows_row_index() {
    let partials = [1.0, 0.0, 0.0, 1.0, 0.5, 0.5];
    let rows: &[usize] = &[1, 1, 0];
    let mut out = vec![0.0; 6];
    partials_partials(&shape(2, 3), &partials, rows, &M2, &partials, Identity, &M2, &mut out);
    assert_ulps_eq!(out[0], 0.1 * 0.9);
    assert_ulps_eq!(out[1], 0.9 * 0.1);
    assert_ulps_eq!(out[2], 0.1 * 0.1);
    assert_ulps_eq!(out[3], 0.9 * 0.9);
    assert_ulps_eq!(out[4], 0.9 * 0.5);
    assert_ulps_eq!(out[5], 0.1 * 0.5);
  }

  #[rstest]
  fn four_state_kernel_matches_generic_kernel() {
    let m: Vec<f64> = (0..16).map(|x| (x as f64 + 1.0) / 40.0).collect();
    let p: Vec<f64> = (0..8).map(|x| (x as f64 + 0.5) / 8.0).collect();
    let s = shape(4, 2);

    let mut fast = vec![0.0; 8];
    partials_partials_impl::<4, Identity, Identity>(&s, &p, Identity, &m, &p, Identity, &m, &mut fast);
    let mut generic = vec![0.0; 8];
    partials_partials_impl::<0, Identity, Identity>(&s, &p, Identity, &m, &p, Identity, &m, &mut generic);

    assert_eq!(fast, generic);
  }

  #[rstest]
  fn rescales_small_rows_only() {
    let mut partials = vec![1e-120, 4e-120, 0.5, 0.25];
    let mut log_factors = vec![f64::NAN; 2];
    scale_partials(&shape(2, 2), 1e-100, &mut partials, &mut log_factors);
    assert_ulps_eq!(partials[0], 0.25);
    assert_ulps_eq!(partials[1], 1.0);
    assert_ulps_eq!(log_factors[0], 4e-120_f64.ln());
    assert_eq!(&partials[2..], &[0.5, 0.25]);
    assert_eq!(log_factors[1], 0.0);
  }

  #[rstest]
  fn integrates_categories() {
    let s = KernelShape {
      n_states: 2,
      n_categories: 2,
      n_rows: 1,
      stride: 1,
    };
    let partials = [0.2, 0.4, 0.6, 0.8];
    let mut out = vec![0.0; 2];
    integrate_partials(&s, &partials, Identity, &[0.25, 0.75], &mut out);
    assert_ulps_eq!(out[0], 0.2 * 0.25 + 0.6 * 0.75);
    assert_ulps_eq!(out[1], 0.4 * 0.25 + 0.8 * 0.75);
  }

  #[rstest]
  fn computes_root_log_likelihoods() {
    let mut out = vec![0.0; 2];
    root_log_likelihoods(2, &[0.5, 0.5, 1.0, 0.0], &[0.5, 0.5], &mut out);
    assert_ulps_eq!(out[0], 0.5_f64.ln());
    assert_ulps_eq!(out[1], 0.5_f64.ln());
  }
}
