use crate::make_error;
use eyre::Report;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use strum_macros::Display;

/// Set of states a character is compatible with, one bit per state
pub type StateSet = u64;

pub const MAX_STATE_COUNT: usize = StateSet::BITS as usize;

const GENERIC_SYMBOLS: &str = "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz@#";

#[derive(Copy, Clone, Debug, PartialEq, Eq, SmartDefault, Display, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum DataType {
  /// `ACGT` with IUPAC ambiguity codes. `U` reads as `T`, `N`, `-` and `?` are unknown.
  #[default]
  Nucleotide,

  /// `0` and `1`, with `-` and `?` unknown
  Binary,

  /// `n` states written `0-9`, then `A-Z`, then `a-z`, with `-` and `?` unknown
  Generic(usize),
}

impl DataType {
  pub fn state_count(&self) -> usize {
    match self {
      DataType::Nucleotide => 4,
      DataType::Binary => 2,
      DataType::Generic(n) => *n,
    }
  }

  pub fn validate(&self) -> Result<(), Report> {
    let n = self.state_count();
    if !(2..=MAX_STATE_COUNT).contains(&n) {
      return make_error!("Data type must have between 2 and {MAX_STATE_COUNT} states, but '{self}' has {n}");
    }
    Ok(())
  }

  /// Set of all states, used for unknown characters and gaps
  pub fn unknown_set(&self) -> StateSet {
    match self.state_count() {
      MAX_STATE_COUNT => StateSet::MAX,
      n => (1 << n) - 1,
    }
  }

  pub fn state_set(&self, c: char) -> Result<StateSet, Report> {
    if c == '-' || c == '?' {
      return Ok(self.unknown_set());
    }

    let set = match self {
      DataType::Nucleotide => match c.to_ascii_uppercase() {
        'A' => 0b0001,
        'C' => 0b0010,
        'G' => 0b0100,
        'T' | 'U' => 0b1000,
        'R' => 0b0101,
        'Y' => 0b1010,
        'S' => 0b0110,
        'W' => 0b1001,
        'K' => 0b1100,
        'M' => 0b0011,
        'B' => 0b1110,
        'D' => 0b1101,
        'H' => 0b1011,
        'V' => 0b0111,
        'N' | 'X' => 0b1111,
        _ => return make_error!("Unknown nucleotide character: '{c}'"),
      },
      DataType::Binary => match c {
        '0' => 0b01,
        '1' => 0b10,
        _ => return make_error!("Unknown binary character: '{c}'"),
      },
      DataType::Generic(n) => match GENERIC_SYMBOLS.chars().take(*n).position(|s| s == c) {
        Some(state) => 1 << state,
        None => return make_error!("Character '{c}' is not one of the {n} generic states"),
      },
    };

    Ok(set)
  }

  /// State code for a set: the state itself when the set is a single state, `state_count` otherwise
  pub fn state_of(&self, set: StateSet) -> usize {
    if set.count_ones() == 1 {
      set.trailing_zeros() as usize
    } else {
      self.state_count()
    }
  }

  /// Set for a state code. Codes at or above `state_count` are unknown.
  pub fn set_of(&self, state: usize) -> StateSet {
    if state < self.state_count() {
      1 << state
    } else {
      self.unknown_set()
    }
  }

  /// Writes the indicator vector of a set into `out`, which must have `state_count` entries
  pub fn fill_partials(&self, set: StateSet, out: &mut [f64]) {
    for (i, p) in out.iter_mut().enumerate() {
      *p = if set & (1 << i) != 0 { 1.0 } else { 0.0 };
    }
  }

  pub fn is_unknown(&self, set: StateSet) -> bool {
    set == self.unknown_set()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  #[rstest]
  #[case('A', 0)]
  #[case('c', 1)]
  #[case('G', 2)]
  #[case('U', 3)]
  #[case('R', 4)]
  #[case('N', 4)]
  #[case('-', 4)]
  fn nucleotide_states(#[case] c: char, #[case] expected: usize) -> Result<(), Report> {
    let dt = DataType::Nucleotide;
    assert_eq!(dt.state_of(dt.state_set(c)?), expected);
    Ok(())
  }

  #[rstest]
  fn ambiguity_partials() -> Result<(), Report> {
    let dt = DataType::Nucleotide;
    let mut out = [0.0; 4];
    dt.fill_partials(dt.state_set('Y')?, &mut out);
    assert_eq!(out, [0.0, 1.0, 0.0, 1.0]);
    Ok(())
  }

  #[rstest]
  fn generic_symbols() -> Result<(), Report> {
    let dt = DataType::Generic(12);
    assert_eq!(dt.state_of(dt.state_set('B')?), 11);
    assert!(dt.state_set('C').is_err());
    assert!(dt.is_unknown(dt.state_set('?')?));
    Ok(())
  }

  #[rstest]
  #[case(DataType::Generic(1))]
  #[case(DataType::Generic(65))]
  fn rejects_bad_state_count(#[case] dt: DataType) {
    assert!(dt.validate().is_err());
  }

  #[rstest]
  fn full_width_unknown_set() {
    let dt = DataType::Generic(MAX_STATE_COUNT);
    assert_eq!(dt.unknown_set(), StateSet::MAX);
    assert_eq!(dt.state_of(dt.set_of(MAX_STATE_COUNT + 3)), MAX_STATE_COUNT);
  }
}
