use crate::make_error;
use crate::tree::TreeInterface;
use eyre::Report;

/// Per-branch multiplier converting branch lengths into branch times
pub trait BranchRateModel: Send + Sync {
  fn branch_rate(&self, tree: &dyn TreeInterface, node: usize) -> f64;
}

#[derive(Copy, Clone, Debug)]
pub struct StrictClock {
  rate: f64,
}

impl StrictClock {
  pub fn new(rate: f64) -> Result<Self, Report> {
    if !rate.is_finite() || rate < 0.0 {
      return make_error!("Clock rate must be finite and non-negative, but got {rate}");
    }
    Ok(Self { rate })
  }
}

impl BranchRateModel for StrictClock {
  fn branch_rate(&self, _: &dyn TreeInterface, _: usize) -> f64 {
    self.rate
  }
}

/// Independent rate for every branch, indexed by the node below the branch
#[derive(Clone, Debug)]
pub struct PerBranchRates {
  rates: Vec<f64>,
}

impl PerBranchRates {
  pub fn new(rates: Vec<f64>) -> Result<Self, Report> {
    if let Some(rate) = rates.iter().find(|r| !r.is_finite() || **r < 0.0) {
      return make_error!("Branch rates must be finite and non-negative, but got {rate}");
    }
    Ok(Self { rates })
  }

  pub fn uniform(node_count: usize) -> Self {
    Self {
      rates: vec![1.0; node_count],
    }
  }

  pub fn set_rate(&mut self, node: usize, rate: f64) {
    assert!(
      rate.is_finite() && rate >= 0.0,
      "Branch rate must be finite and non-negative, but got {rate} for node {node}"
    );
    self.rates[node] = rate;
  }
}

impl BranchRateModel for PerBranchRates {
  fn branch_rate(&self, tree: &dyn TreeInterface, node: usize) -> f64 {
    assert_eq!(
      self.rates.len(),
      tree.node_count(),
      "Branch rate model has {} rates, but the tree has {} nodes",
      self.rates.len(),
      tree.node_count()
    );
    self.rates[node]
  }
}
