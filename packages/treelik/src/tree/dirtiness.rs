use serde::{Deserialize, Serialize};
use std::ops::{BitOr, BitOrAssign};
use strum_macros::Display;

/// How much of a node's cached likelihood state is still valid.
///
/// Levels are ordered: combining two levels keeps the more severe one.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
pub enum Dirtiness {
  /// Cached values can be reused
  #[default]
  Clean,
  /// Values must be recomputed, child topology is unchanged
  Dirty,
  /// Values must be recomputed and any per-node index mapping must be rebuilt
  Filthy,
}

impl Dirtiness {
  #[inline]
  pub fn is_clean(self) -> bool {
    self == Self::Clean
  }
}

impl BitOr for Dirtiness {
  type Output = Self;

  #[inline]
  fn bitor(self, rhs: Self) -> Self {
    self.max(rhs)
  }
}

impl BitOrAssign for Dirtiness {
  #[inline]
  fn bitor_assign(&mut self, rhs: Self) {
    *self = *self | rhs;
  }
}
