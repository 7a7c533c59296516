use crate::io::json::{json_read_file, json_read_str, json_write_str, JsonPretty};
use crate::make_error;
use eyre::{Report, WrapErr};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use std::path::Path;
use strum_macros::{Display, EnumString};

/// How partials are rescaled against floating point underflow
#[derive(Copy, Clone, Debug, PartialEq, Eq, SmartDefault, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RescalingPolicy {
  /// Never rescale. Underflow yields a log-likelihood of negative infinity.
  None,

  /// Rescale every pattern of every node on every call
  Always,

  /// Rescale after underflow, and periodically try to go back to cheaper scaling
  #[default]
  Dynamic,

  /// Rescale after underflow and keep rescaling from then on
  Auto,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, SmartDefault, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
  /// Pruning over every pattern
  #[default]
  Reference,

  /// Pruning over distinct child-value pairs only
  Cached,

  /// Batched operations submitted to an acceleration backend
  Accelerated,
}

/// Rows with a largest entry below the threshold are rescaled
#[derive(Copy, Clone, Debug, PartialEq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingThresholds {
  /// Used at the first scaling level, catching only rows close to underflow
  #[default = 1e-100]
  pub low: f64,

  /// Used at the second scaling level. The default rescales every row.
  #[default(f64::MAX)]
  pub high: f64,
}

#[derive(Clone, Debug, PartialEq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct LikelihoodConfig {
  /// Number of worker engines, each computing a contiguous range of patterns
  #[default(num_cpus::get())]
  pub threads: usize,

  /// Space-delimited relative share of patterns per worker, reused cyclically when shorter than the worker count
  pub proportions: Option<String>,

  pub scaling: RescalingPolicy,

  /// Represent leaves with ambiguity codes as partials instead of collapsing them to unknown states
  pub use_ambiguities: bool,

  pub engine: EngineKind,

  /// Acceleration resources to try, in order. Empty tries every resource.
  pub resource_order: Vec<usize>,

  pub scaling_thresholds: ScalingThresholds,

  /// Consecutive stable calls before dynamic scaling tries a cheaper level
  #[default = 100]
  pub relax_window: usize,

  /// Largest probe table, in entries, used when indexing distinct child-value pairs
  #[default(1 << 20)]
  pub max_probe_table: usize,

  /// Calls between scale factor recomputations of the accelerated engine after an underflow
  #[default = 10000]
  pub rescale_frequency: usize,
}

impl LikelihoodConfig {
  pub fn from_json_str(s: impl AsRef<str>) -> Result<Self, Report> {
    let config: Self = json_read_str(s).wrap_err("When reading likelihood configuration")?;
    config.validate()?;
    Ok(config)
  }

  pub fn from_json_file(filepath: impl AsRef<Path>) -> Result<Self, Report> {
    let config: Self = json_read_file(filepath).wrap_err("When reading likelihood configuration")?;
    config.validate()?;
    Ok(config)
  }

  pub fn to_json_str(&self) -> Result<String, Report> {
    json_write_str(self, JsonPretty(true)).wrap_err("When writing likelihood configuration")
  }

  pub fn validate(&self) -> Result<(), Report> {
    if self.threads == 0 {
      return make_error!("Number of threads must be at least 1");
    }
    if self.relax_window == 0 {
      return make_error!("Relaxation window must be at least 1 call");
    }
    if self.rescale_frequency == 0 {
      return make_error!("Rescale frequency must be at least 1 call");
    }
    let ScalingThresholds { low, high } = self.scaling_thresholds;
    if !(low > 0.0 && low <= high) {
      return make_error!("Scaling thresholds must satisfy 0 < low <= high, but got low = {low}, high = {high}");
    }
    self.proportions()?;
    Ok(())
  }

  /// Parsed worker proportions, if any were given
  pub fn proportions(&self) -> Result<Option<Vec<f64>>, Report> {
    let Some(proportions) = &self.proportions else {
      return Ok(None);
    };
    if proportions.trim().is_empty() {
      return Ok(None);
    }
    let values = proportions
      .split_whitespace()
      .map(|s| {
        s.parse::<f64>()
          .wrap_err_with(|| format!("When parsing worker proportion '{s}'"))
      })
      .collect::<Result<Vec<f64>, Report>>()?;
    if values.iter().any(|p| !p.is_finite() || *p <= 0.0) {
      return make_error!("Worker proportions must be positive, but got: {}", values.iter().join(" "));
    }
    Ok(Some(values))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use indoc::indoc;
  use pretty_assertions::assert_eq;
  use rstest::rstest;
  use std::str::FromStr;

  #[rstest]
  fn reads_partial_json() -> Result<(), Report> {
    let config = LikelihoodConfig::from_json_str(indoc! {r#"
      {
        "threads": 3,
        "proportions": "1 2",
        "scaling": "always",
        "engine": "cached",
        "scaling_thresholds": { "low": 1e-50 }
      }
    "#})?;
    assert_eq!(config.threads, 3);
    assert_eq!(config.scaling, RescalingPolicy::Always);
    assert_eq!(config.engine, EngineKind::Cached);
    assert_eq!(config.proportions()?, Some(vec![1.0, 2.0]));
    assert_eq!(config.scaling_thresholds.low, 1e-50);
    assert_eq!(config.scaling_thresholds.high, f64::MAX);
    assert_eq!(config.relax_window, 100);
    Ok(())
  }

  #[rstest]
  fn writes_readable_json() -> Result<(), Report> {
    let config = LikelihoodConfig {
      threads: 2,
      engine: EngineKind::Accelerated,
      resource_order: vec![1, 0],
      ..LikelihoodConfig::default()
    };
    let restored = LikelihoodConfig::from_json_str(config.to_json_str()?)?;
    assert_eq!(restored.engine, EngineKind::Accelerated);
    assert_eq!(restored.resource_order, vec![1, 0]);
    assert_eq!(restored.scaling_thresholds.high, f64::MAX);
    Ok(())
  }

  #[rstest]
  #[case("none", RescalingPolicy::None)]
  #[case("always", RescalingPolicy::Always)]
  #[case("dynamic", RescalingPolicy::Dynamic)]
  #[case("auto", RescalingPolicy::Auto)]
  fn parses_policy(#[case] s: &str, #[case] expected: RescalingPolicy) -> Result<(), Report> {
    assert_eq!(RescalingPolicy::from_str(s)?, expected);
    assert_eq!(expected.to_string(), s);
    Ok(())
  }

  #[rstest]
  #[case(r#"{ "threads": 0 }"#)]
  #[case(r#"{ "proportions": "1 -2" }"#)]
  #[case(r#"{ "proportions": "1 x" }"#)]
  #[case(r#"{ "scaling_thresholds": { "low": 1.0, "high": 0.5 } }"#)]
  #[case(r#"{ "scaling": "sometimes" }"#)]
  fn rejects_invalid_config(#[case] json: &str) {
    assert!(LikelihoodConfig::from_json_str(json).is_err());
  }

  #[rstest]
  fn blank_proportions_mean_even_split() -> Result<(), Report> {
    let config = LikelihoodConfig {
      proportions: Some("  ".to_owned()),
      ..LikelihoodConfig::default()
    };
    assert_eq!(config.proportions()?, None);
    Ok(())
  }
}
