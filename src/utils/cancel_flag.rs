//! Flag for cancelling microthreads

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A single-fire thread-safe boolean flag. Clones share the same state.
#[derive(Debug, Clone)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
  /// Create a new flag that isn't set yet
  pub fn new() -> Self { CancelFlag(Arc::new(AtomicBool::new(false))) }

  /// Check whether cancellation has been requested
  pub fn is_cancelled(&self) -> bool { self.0.load(Ordering::Acquire) }

  /// Set the flag. Returns true if this call set it and false if it was
  /// already set, so callers can act on the first request only.
  pub fn cancel(&self) -> bool { !self.0.swap(true, Ordering::AcqRel) }
}

impl Default for CancelFlag {
  fn default() -> Self { Self::new() }
}
