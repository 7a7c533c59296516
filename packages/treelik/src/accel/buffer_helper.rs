/// Maps logical indices to library buffer indices, with two buffers for every index at or above `min_index`.
///
/// Indices below `min_index` have a single buffer of the same number. Index `i >= min_index` uses buffer `i` or
/// `i + (max_index - min_index)`, depending on its current offset.
#[derive(Clone, Debug)]
pub struct BufferIndexHelper {
  min_index: usize,
  double_count: usize,
  offsets: Vec<usize>,
  stored_offsets: Vec<usize>,
}

impl BufferIndexHelper {
  pub fn new(max_index: usize, min_index: usize) -> Self {
    assert!(
      min_index <= max_index,
      "Buffer index range is empty: minimum {min_index} exceeds maximum {max_index}"
    );
    let double_count = max_index - min_index;
    Self {
      min_index,
      double_count,
      offsets: vec![0; double_count],
      stored_offsets: vec![0; double_count],
    }
  }

  /// Number of library buffers needed for all indices
  #[inline]
  pub const fn buffer_count(&self) -> usize {
    2 * self.double_count + self.min_index
  }

  pub fn flip(&mut self, index: usize) {
    if index >= self.min_index {
      let offset = &mut self.offsets[index - self.min_index];
      *offset = self.double_count - *offset;
    }
  }

  #[inline]
  pub fn offset_index(&self, index: usize) -> usize {
    if index < self.min_index {
      index
    } else {
      self.offsets[index - self.min_index] + index
    }
  }

  pub fn store(&mut self) {
    self.stored_offsets.copy_from_slice(&self.offsets);
  }

  pub fn restore(&mut self) {
    std::mem::swap(&mut self.offsets, &mut self.stored_offsets);
  }
}
