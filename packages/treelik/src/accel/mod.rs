//! Delegation of the pruning traversal to a batched likelihood library.
//!
//! The library owns numbered buffers (tip data, partials, transition matrices, scale factors) and executes flat lists
//! of operations over buffer indices. The bridge in `beagle_likelihood` decides which indices to use and when to
//! flip them; `cpu` provides an in-process implementation of the library interface.

pub mod beagle_likelihood;
pub mod buffer_helper;
pub mod cpu;
pub mod instance;
