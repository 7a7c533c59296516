use crate::core::LikelihoodCore;
use crate::likelihood::config::{RescalingPolicy, ScalingThresholds};
use log::{info, warn};
use strum_macros::Display;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ScalingLevel {
  Unscaled,
  ScaledLow,
  ScaledHigh,
}

impl ScalingLevel {
  pub const fn up(self) -> Option<Self> {
    match self {
      ScalingLevel::Unscaled => Some(ScalingLevel::ScaledLow),
      ScalingLevel::ScaledLow => Some(ScalingLevel::ScaledHigh),
      ScalingLevel::ScaledHigh => None,
    }
  }

  pub const fn down(self) -> Option<Self> {
    match self {
      ScalingLevel::Unscaled => None,
      ScalingLevel::ScaledLow => Some(ScalingLevel::Unscaled),
      ScalingLevel::ScaledHigh => Some(ScalingLevel::ScaledLow),
    }
  }
}

/// Whether a total log-likelihood signals numerical trouble rather than an improbable state.
///
/// Positive values and NaN are impossible for a probability. Exactly zero is only possible when no leaf observes
/// anything.
pub fn is_unstable(log_p: f64, has_observations: bool) -> bool {
  !log_p.is_finite() || log_p > 0.0 || (log_p == 0.0 && has_observations)
}

/// Scaling level of one engine and the rules for moving between levels.
///
/// Escalation happens at most once per call, after which a still unstable result is reported as negative infinity.
/// Under the dynamic policy, a window of stable calls triggers one attempt at the next cheaper level, and the window
/// doubles each time such an attempt turns out unstable.
#[derive(Clone, Debug)]
pub struct ScalingController {
  policy: RescalingPolicy,
  thresholds: ScalingThresholds,
  level: ScalingLevel,
  relax_window: usize,
  stable_calls: usize,
}

impl ScalingController {
  pub fn new(policy: RescalingPolicy, thresholds: ScalingThresholds, relax_window: usize) -> Self {
    let level = match policy {
      RescalingPolicy::Always => ScalingLevel::ScaledHigh,
      RescalingPolicy::None | RescalingPolicy::Dynamic | RescalingPolicy::Auto => ScalingLevel::Unscaled,
    };
    Self {
      policy,
      thresholds,
      level,
      relax_window: relax_window.max(1),
      stable_calls: 0,
    }
  }

  #[inline]
  pub const fn level(&self) -> ScalingLevel {
    self.level
  }

  #[inline]
  pub const fn policy(&self) -> RescalingPolicy {
    self.policy
  }

  pub fn threshold(&self) -> f64 {
    match self.level {
      ScalingLevel::Unscaled | ScalingLevel::ScaledHigh => self.thresholds.high,
      ScalingLevel::ScaledLow => self.thresholds.low,
    }
  }

  /// Configures the core for the current level
  pub fn apply(&self, core: &mut dyn LikelihoodCore) {
    core.set_use_scaling(self.level != ScalingLevel::Unscaled);
    core.set_scaling_threshold(self.threshold());
  }

  /// Moves one level up if the policy allows it. Returns whether the level changed.
  pub fn escalate(&mut self) -> bool {
    if !matches!(self.policy, RescalingPolicy::Dynamic | RescalingPolicy::Auto) {
      return false;
    }
    match self.level.up() {
      Some(level) => {
        warn!("Numerical instability in likelihood: increasing scaling from {} to {level}", self.level);
        self.level = level;
        self.stable_calls = 0;
        true
      }
      None => false,
    }
  }

  /// Counts a stable call. Returns whether it is time to try a cheaper level.
  pub fn record_stable(&mut self) -> bool {
    if self.policy != RescalingPolicy::Dynamic || self.level == ScalingLevel::Unscaled {
      return false;
    }
    self.stable_calls += 1;
    self.stable_calls >= self.relax_window
  }

  /// Moves one level down
  pub fn relax(&mut self) {
    if let Some(level) = self.level.down() {
      info!("Likelihood stable for {} calls: relaxing scaling from {} to {level}", self.stable_calls, self.level);
      self.level = level;
    }
    self.stable_calls = 0;
  }

  /// Undoes a relaxation that turned out unstable and waits twice as long before the next attempt
  pub fn revert_relax(&mut self) {
    if let Some(level) = self.level.up() {
      warn!("Relaxed scaling is unstable: returning from {} to {level}", self.level);
      self.level = level;
    }
    self.relax_window = self.relax_window.saturating_mul(2);
    self.stable_calls = 0;
  }

  /// Sets the level directly, used when an engine returns to a stored state computed at another level
  pub fn set_level(&mut self, level: ScalingLevel) {
    self.level = level;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  fn controller(policy: RescalingPolicy, relax_window: usize) -> ScalingController {
    ScalingController::new(policy, ScalingThresholds::default(), relax_window)
  }

  #[rstest]
  #[case(f64::NEG_INFINITY, true, true)]
  #[case(f64::NAN, true, true)]
  #[case(0.5, true, true)]
  #[case(0.0, true, true)]
  #[case(0.0, false, false)]
  #[case(-12.5, true, false)]
  fn detects_instability(#[case] log_p: f64, #[case] has_observations: bool, #[case] expected: bool) {
    assert_eq!(is_unstable(log_p, has_observations), expected);
  }

  #[rstest]
  fn dynamic_escalates_and_relaxes() {
    let mut scaling = controller(RescalingPolicy::Dynamic, 2);
    assert_eq!(scaling.level(), ScalingLevel::Unscaled);
    assert!(scaling.escalate());
    assert_eq!(scaling.level(), ScalingLevel::ScaledLow);
    assert_eq!(scaling.threshold(), 1e-100);
    assert!(scaling.escalate());
    assert!(!scaling.escalate());
    assert_eq!(scaling.level(), ScalingLevel::ScaledHigh);

    assert!(!scaling.record_stable());
    assert!(scaling.record_stable());
    scaling.relax();
    assert_eq!(scaling.level(), ScalingLevel::ScaledLow);

    scaling.revert_relax();
    assert_eq!(scaling.level(), ScalingLevel::ScaledHigh);
    assert!(!scaling.record_stable());
    assert!(!scaling.record_stable());
    assert!(!scaling.record_stable());
    assert!(scaling.record_stable());
  }

  #[rstest]
  fn auto_never_relaxes() {
    let mut scaling = controller(RescalingPolicy::Auto, 1);
    assert!(scaling.escalate());
    assert!(!scaling.record_stable());
    assert!(!scaling.record_stable());
  }

  #[rstest]
  #[case(RescalingPolicy::None, ScalingLevel::Unscaled)]
  #[case(RescalingPolicy::Always, ScalingLevel::ScaledHigh)]
  fn fixed_policies_never_move(#[case] policy: RescalingPolicy, #[case] level: ScalingLevel) {
    let mut scaling = controller(policy, 1);
    assert!(!scaling.escalate());
    assert!(!scaling.record_stable());
    assert_eq!(scaling.level(), level);
  }
}
