//! Two-slot storage for per-node buffers with a current and a stored slot selector.
//!
//! Flipping a node points its current selector at the other slot, leaving the previous contents untouched as the
//! stored copy. Store, restore and unstore only move selectors around, never buffer contents.

/// Current and stored slot index (0 or 1) for every node
#[derive(Clone, Debug)]
pub struct SlotSelector {
  current: Vec<u8>,
  stored: Vec<u8>,
}

impl SlotSelector {
  pub fn new(node_count: usize) -> Self {
    Self {
      current: vec![0; node_count],
      stored: vec![0; node_count],
    }
  }

  #[inline]
  pub fn current(&self, node: usize) -> usize {
    self.current[node] as usize
  }

  #[inline]
  pub fn flip(&mut self, node: usize) {
    self.current[node] = 1 - self.current[node];
  }

  /// Remembers the current selectors as the accepted state
  pub fn store(&mut self) {
    self.stored.copy_from_slice(&self.current);
  }

  /// Returns to the accepted state. The rejected selectors become the stored ones, which is harmless because the
  /// next store overwrites them.
  pub fn restore(&mut self) {
    std::mem::swap(&mut self.current, &mut self.stored);
  }

  /// Resets current selectors to the stored ones without swapping
  pub fn unstore(&mut self) {
    self.current.copy_from_slice(&self.stored);
  }
}

/// Two optional slots of equal length per node. Reading a node that was never allocated is a contract violation.
#[derive(Clone, Debug)]
pub struct NodeBuffers<T> {
  name: &'static str,
  slots: Vec<Option<[Vec<T>; 2]>>,
}

impl<T: Copy + Default> NodeBuffers<T> {
  pub fn new(name: &'static str, node_count: usize) -> Self {
    Self {
      name,
      slots: vec![None; node_count],
    }
  }

  pub fn allocate(&mut self, node: usize, len: usize) {
    self.slots[node] = Some([vec![T::default(); len], vec![T::default(); len]]);
  }

  #[inline]
  pub fn is_allocated(&self, node: usize) -> bool {
    self.slots[node].is_some()
  }

  #[inline]
  pub fn get(&self, node: usize, slot: usize) -> &[T] {
    match &self.slots[node] {
      Some(slots) => &slots[slot],
      None => panic!("{} buffer of node {node} is used before it was allocated", self.name),
    }
  }

  #[inline]
  pub fn get_mut(&mut self, node: usize, slot: usize) -> &mut [T] {
    match &mut self.slots[node] {
      Some(slots) => &mut slots[slot],
      None => panic!("{} buffer of node {node} is used before it was allocated", self.name),
    }
  }

  /// Moves a slot out so that it can be written while other nodes are read. Must be returned with `put`.
  pub fn take(&mut self, node: usize, slot: usize) -> Vec<T> {
    match &mut self.slots[node] {
      Some(slots) => std::mem::take(&mut slots[slot]),
      None => panic!("{} buffer of node {node} is used before it was allocated", self.name),
    }
  }

  pub fn put(&mut self, node: usize, slot: usize, buffer: Vec<T>) {
    if let Some(slots) = &mut self.slots[node] {
      slots[slot] = buffer;
    }
  }

  /// Writes `values` into the slot, checking the length against the allocation
  pub fn write(&mut self, node: usize, slot: usize, values: &[T]) {
    let name = self.name;
    let buffer = self.get_mut(node, slot);
    assert_eq!(
      buffer.len(),
      values.len(),
      "{name} buffer of node {node} has size {}, but {} values were given",
      buffer.len(),
      values.len()
    );
    buffer.copy_from_slice(values);
  }
}
