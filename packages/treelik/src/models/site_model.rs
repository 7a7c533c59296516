use crate::make_error;
use eyre::Report;
use itertools::Itertools;

/// Among-site rate heterogeneity: a finite mixture of rate categories
pub trait SiteModel: Send + Sync {
  fn category_count(&self) -> usize;

  fn category_rates(&self) -> &[f64];

  /// Mixture weights, summing to 1
  fn category_proportions(&self) -> &[f64];

  /// Whether pattern likelihoods integrate over categories. Assigning categories per site is not supported by the
  /// engines.
  fn integrate_across_categories(&self) -> bool {
    true
  }
}

#[derive(Clone, Debug)]
pub struct SiteRates {
  rates: Vec<f64>,
  proportions: Vec<f64>,
}

impl SiteRates {
  /// Proportions are normalized to sum to 1
  pub fn new(rates: Vec<f64>, proportions: Vec<f64>) -> Result<Self, Report> {
    if rates.is_empty() {
      return make_error!("Site model requires at least one rate category");
    }
    if rates.len() != proportions.len() {
      return make_error!(
        "Site model has {} category rates but {} category proportions",
        rates.len(),
        proportions.len()
      );
    }
    if rates.iter().any(|r| !r.is_finite() || *r < 0.0) {
      return make_error!("Category rates must be finite and non-negative, but got: {}", rates.iter().join(", "));
    }
    if proportions.iter().any(|p| !p.is_finite() || *p < 0.0) {
      return make_error!(
        "Category proportions must be finite and non-negative, but got: {}",
        proportions.iter().join(", ")
      );
    }
    let total: f64 = proportions.iter().sum();
    if total <= 0.0 {
      return make_error!("Category proportions must not all be zero");
    }
    let proportions = proportions.into_iter().map(|p| p / total).collect_vec();
    Ok(Self { rates, proportions })
  }

  /// Single category with unit rate
  pub fn homogeneous() -> Self {
    Self {
      rates: vec![1.0],
      proportions: vec![1.0],
    }
  }

  /// Equiprobable categories with the given rates
  pub fn equal_proportions(rates: Vec<f64>) -> Result<Self, Report> {
    let n = rates.len();
    Self::new(rates, vec![1.0; n])
  }
}

impl SiteModel for SiteRates {
  fn category_count(&self) -> usize {
    self.rates.len()
  }

  fn category_rates(&self) -> &[f64] {
    &self.rates
  }

  fn category_proportions(&self) -> &[f64] {
    &self.proportions
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_ulps_eq;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  #[rstest]
  fn normalizes_proportions() -> Result<(), Report> {
    let model = SiteRates::new(vec![0.5, 1.5], vec![1.0, 3.0])?;
    assert_eq!(model.category_count(), 2);
    assert_ulps_eq!(model.category_proportions()[0], 0.25);
    assert_ulps_eq!(model.category_proportions()[1], 0.75);
    Ok(())
  }

  #[rstest]
  #[case(vec![], vec![])]
  #[case(vec![1.0], vec![0.5, 0.5])]
  #[case(vec![-1.0], vec![1.0])]
  #[case(vec![1.0, 2.0], vec![0.0, 0.0])]
  fn rejects_invalid_categories(#[case] rates: Vec<f64>, #[case] proportions: Vec<f64>) {
    assert!(SiteRates::new(rates, proportions).is_err());
  }
}
