use std::fmt;

use itertools::Itertools;

use crate::error::Fault;
use crate::microthread::MicroThread;

/// Everything that happened in one tick
#[derive(Clone, Debug, Default)]
pub struct TickReport {
  /// Value of the tick counter during the tick
  pub tick: u64,
  /// Number of times a body was polled
  pub resumed: usize,
  /// Microthreads whose body returned successfully, in completion order
  pub completed: Vec<MicroThread>,
  /// Microthreads whose body failed, with the cause
  pub faulted: Vec<(MicroThread, Fault)>,
  /// Microthreads that unwound on cancellation or were removed
  pub canceled: Vec<MicroThread>,
  /// Ready work was left over for the next tick because the resume limit
  /// was reached
  pub deferred: bool,
}
impl TickReport {
  /// Whether no microthread reached a terminal state
  pub fn is_quiet(&self) -> bool {
    self.completed.is_empty() && self.faulted.is_empty() && self.canceled.is_empty()
  }
}
impl fmt::Display for TickReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "tick {}: {} resumed", self.tick, self.resumed)?;
    if !self.completed.is_empty() {
      write!(f, ", completed [{}]", self.completed.iter().join(", "))?;
    }
    if !self.canceled.is_empty() {
      write!(f, ", canceled [{}]", self.canceled.iter().join(", "))?;
    }
    for (thread, fault) in &self.faulted {
      write!(f, ", {thread} faulted: {fault}")?;
    }
    if self.deferred {
      write!(f, " (deferred)")?;
    }
    Ok(())
  }
}
