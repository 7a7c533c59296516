use crate::alignment::data_type::{DataType, StateSet};
use crate::make_error;
use eyre::{Report, WrapErr};
use itertools::Itertools;
use std::collections::HashMap;
use std::ops::Range;

/// Compressed alignment: identical columns merged into weighted site patterns.
///
/// Patterns appear in the order their first site appears in the alignment. Each leaf row stores the set of
/// states its character is compatible with, so ambiguity codes survive compression.
#[derive(Clone, Debug)]
pub struct Patterns {
  data_type: DataType,
  taxa: Vec<String>,
  sets: Vec<Vec<StateSet>>,
  weights: Vec<f64>,
  site_patterns: Vec<usize>,
  excluded_patterns: Vec<usize>,
  ascertained: bool,
}

impl Patterns {
  pub fn from_sequences(
    data_type: DataType,
    taxa: Vec<String>,
    sequences: &[impl AsRef<str>],
  ) -> Result<Self, Report> {
    data_type.validate()?;
    if taxa.len() != sequences.len() {
      return make_error!(
        "When building patterns: expected one sequence per taxon ({}), but found {}",
        taxa.len(),
        sequences.len()
      );
    }

    let rows = taxa
      .iter()
      .zip(sequences)
      .map(|(taxon, seq)| {
        seq
          .as_ref()
          .chars()
          .filter(|c| !c.is_whitespace())
          .map(|c| data_type.state_set(c))
          .collect::<Result<Vec<StateSet>, Report>>()
          .wrap_err_with(|| format!("When reading sequence of taxon '{taxon}'"))
      })
      .collect::<Result<Vec<_>, Report>>()?;

    Self::from_rows(data_type, taxa, rows)
  }

  /// Builds patterns from integer state codes, one row of sites per taxon. Codes at or above the state count are
  /// unknown.
  pub fn from_states(data_type: DataType, taxa: Vec<String>, states: &[Vec<usize>]) -> Result<Self, Report> {
    data_type.validate()?;
    let rows = states
      .iter()
      .map(|row| row.iter().map(|&s| data_type.set_of(s)).collect_vec())
      .collect_vec();
    Self::from_rows(data_type, taxa, rows)
  }

  fn from_rows(data_type: DataType, taxa: Vec<String>, rows: Vec<Vec<StateSet>>) -> Result<Self, Report> {
    if taxa.len() < 2 {
      return make_error!("When building patterns: at least 2 taxa are required, but found {}", taxa.len());
    }
    if rows.len() != taxa.len() {
      return make_error!("When building patterns: expected {} rows, but found {}", taxa.len(), rows.len());
    }
    if let Some(name) = taxa.iter().duplicates().next() {
      return make_error!("When building patterns: taxon '{name}' appears more than once");
    }

    let site_count = rows[0].len();
    if site_count == 0 {
      return make_error!("When building patterns: alignment has no sites");
    }
    if let Some((taxon, row)) = taxa.iter().zip(&rows).find(|(_, row)| row.len() != site_count) {
      return make_error!(
        "When building patterns: all sequences must have length {site_count}, but '{taxon}' has length {}",
        row.len()
      );
    }

    let mut index: HashMap<Vec<StateSet>, usize> = HashMap::new();
    let mut columns: Vec<Vec<StateSet>> = vec![];
    let mut weights = vec![];
    let mut site_patterns = Vec::with_capacity(site_count);
    for site in 0..site_count {
      let column = rows.iter().map(|row| row[site]).collect_vec();
      let pattern = *index.entry(column.clone()).or_insert_with(|| {
        columns.push(column);
        weights.push(0.0);
        columns.len() - 1
      });
      weights[pattern] += 1.0;
      site_patterns.push(pattern);
    }

    let sets = (0..taxa.len())
      .map(|taxon| columns.iter().map(|column| column[taxon]).collect_vec())
      .collect_vec();

    Ok(Self {
      data_type,
      taxa,
      sets,
      weights,
      site_patterns,
      excluded_patterns: vec![],
      ascertained: false,
    })
  }

  /// Marks the given sites as constitutively excluded from observation.
  ///
  /// Each excluded site removes one unit of weight from its pattern, and the likelihood of the remaining patterns
  /// is conditioned on not observing any of the excluded patterns.
  pub fn with_ascertainment(mut self, excluded_sites: Range<usize>) -> Result<Self, Report> {
    if excluded_sites.is_empty() || excluded_sites.end > self.site_patterns.len() {
      return make_error!(
        "When applying ascertainment: excluded site range {excluded_sites:?} must be non-empty and within the {} sites",
        self.site_patterns.len()
      );
    }

    for site in excluded_sites {
      let pattern = self.site_patterns[site];
      self.weights[pattern] -= 1.0;
      if !self.excluded_patterns.contains(&pattern) {
        self.excluded_patterns.push(pattern);
      }
    }
    self.ascertained = true;

    Ok(self)
  }

  /// Patterns in `range`, as an independent alignment over the same taxa
  pub fn subset(&self, range: Range<usize>) -> Self {
    assert!(
      !self.ascertained,
      "Ascertained patterns cannot be split, since the correction spans all patterns"
    );
    assert!(
      !range.is_empty() && range.end <= self.pattern_count(),
      "Pattern range {range:?} must be non-empty and within the {} patterns",
      self.pattern_count()
    );

    let site_patterns = self
      .site_patterns
      .iter()
      .filter(|&&p| range.contains(&p))
      .map(|&p| p - range.start)
      .collect_vec();

    Self {
      data_type: self.data_type,
      taxa: self.taxa.clone(),
      sets: self.sets.iter().map(|row| row[range.clone()].to_vec()).collect_vec(),
      weights: self.weights[range].to_vec(),
      site_patterns,
      excluded_patterns: vec![],
      ascertained: false,
    }
  }

  #[inline]
  pub const fn data_type(&self) -> DataType {
    self.data_type
  }

  #[inline]
  pub fn state_count(&self) -> usize {
    self.data_type.state_count()
  }

  #[inline]
  pub fn pattern_count(&self) -> usize {
    self.weights.len()
  }

  #[inline]
  pub fn taxon_count(&self) -> usize {
    self.taxa.len()
  }

  #[inline]
  pub fn site_count(&self) -> usize {
    self.site_patterns.len()
  }

  pub fn taxa(&self) -> &[String] {
    &self.taxa
  }

  pub fn weights(&self) -> &[f64] {
    &self.weights
  }

  pub fn total_weight(&self) -> f64 {
    self.weights.iter().sum()
  }

  /// Pattern index of every original site
  pub fn site_patterns(&self) -> &[usize] {
    &self.site_patterns
  }

  pub fn is_ascertained(&self) -> bool {
    self.ascertained
  }

  pub fn excluded_patterns(&self) -> &[usize] {
    &self.excluded_patterns
  }

  /// Whether any leaf observes anything other than an unknown character. Without observations the log-likelihood is
  /// exactly zero.
  pub fn has_observations(&self) -> bool {
    self.sets.iter().flatten().any(|&set| !self.data_type.is_unknown(set))
  }

  /// One state code per pattern. Ambiguous characters become the unknown code `state_count`.
  pub fn leaf_states(&self, taxon: usize) -> Vec<usize> {
    self.sets[taxon].iter().map(|&set| self.data_type.state_of(set)).collect_vec()
  }

  /// Indicator vectors per pattern, laid out pattern-major with `state_count` entries each
  pub fn leaf_partials(&self, taxon: usize) -> Vec<f64> {
    let n_states = self.state_count();
    let mut partials = vec![0.0; self.pattern_count() * n_states];
    for (set, out) in self.sets[taxon].iter().zip(partials.chunks_exact_mut(n_states)) {
      self.data_type.fill_partials(*set, out);
    }
    partials
  }

  pub fn taxon_index(&self, name: &str) -> Option<usize> {
    self.taxa.iter().position(|taxon| taxon == name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use rstest::{fixture, rstest};

  fn taxa(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("t{i}")).collect()
  }

  #[fixture]
  fn nucleotide() -> Patterns {
    Patterns::from_sequences(DataType::Nucleotide, taxa(3), &["ACGAA", "ACGTA", "AYGTA"]).unwrap()
  }

  #[rstest]
  fn compresses_identical_columns(nucleotide: Patterns) {
    assert_eq!(nucleotide.pattern_count(), 4);
    assert_eq!(nucleotide.weights(), &[2.0, 1.0, 1.0, 1.0]);
    assert_eq!(nucleotide.site_patterns(), &[0, 1, 2, 3, 0]);
    assert_eq!(nucleotide.total_weight(), 5.0);
  }

  #[rstest]
  fn ambiguous_leaf_state_is_unknown(nucleotide: Patterns) {
    assert_eq!(nucleotide.leaf_states(2), vec![0, 4, 2, 3]);
    assert_eq!(&nucleotide.leaf_partials(2)[4..8], &[0.0, 1.0, 0.0, 1.0]);
  }

  #[rstest]
  fn subsets_patterns(nucleotide: Patterns) {
    let subset = nucleotide.subset(1..3);
    assert_eq!(subset.pattern_count(), 2);
    assert_eq!(subset.weights(), &[1.0, 1.0]);
    assert_eq!(subset.leaf_states(1), vec![1, 2]);
    assert_eq!(subset.site_patterns(), &[0, 1]);
  }

  #[rstest]
  fn ascertainment_removes_weight() -> Result<(), Report> {
    let patterns = Patterns::from_sequences(DataType::Binary, taxa(2), &["0101", "0110"])?.with_ascertainment(2..4)?;
    assert_eq!(patterns.weights(), &[1.0, 1.0, 0.0, 0.0]);
    assert_eq!(patterns.excluded_patterns(), &[2, 3]);
    assert!(patterns.is_ascertained());
    Ok(())
  }

  #[rstest]
  #[should_panic(expected = "cannot be split")]
  fn ascertained_patterns_cannot_be_split() {
    let patterns = Patterns::from_sequences(DataType::Binary, taxa(2), &["01", "01"])
      .unwrap()
      .with_ascertainment(0..1)
      .unwrap();
    patterns.subset(0..1);
  }

  #[rstest]
  fn rejects_ragged_alignment() {
    assert!(Patterns::from_sequences(DataType::Nucleotide, taxa(2), &["ACGT", "ACG"]).is_err());
  }

  #[rstest]
  fn detects_missing_observations() -> Result<(), Report> {
    let patterns = Patterns::from_sequences(DataType::Nucleotide, taxa(2), &["N-", "?N"])?;
    assert!(!patterns.has_observations());
    Ok(())
  }
}
