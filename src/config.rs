//! Tunables of a [crate::scheduler::Scheduler]

use std::num::NonZeroUsize;

/// What happens when a microthread body returns an error or panics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FaultPolicy {
  /// Record the fault in the report and keep draining the tick
  #[default]
  Isolate,
  /// Stop the tick at the first fault and return
  /// [crate::error::TickError::Fault]
  Halt,
}

/// Scheduler configuration
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerConfig {
  /// Upper bound on resumptions in one tick. Once reached, the ready work left
  /// over is carried into the next tick and the report is flagged
  /// `deferred`. `None` drains until everything suspends. The bound is
  /// non-zero so every tick makes progress.
  pub max_resumes_per_tick: Option<NonZeroUsize>,
  /// See [FaultPolicy]
  pub fault_policy: FaultPolicy,
}
impl SchedulerConfig {
  /// Set the livelock guard
  pub fn max_resumes(self, max: NonZeroUsize) -> Self { Self { max_resumes_per_tick: Some(max), ..self } }
  /// Set the fault policy
  pub fn fault_policy(self, fault_policy: FaultPolicy) -> Self { Self { fault_policy, ..self } }
}

#[cfg(test)]
mod test {
  use std::num::NonZeroUsize;

  use super::{FaultPolicy, SchedulerConfig};

  #[test]
  fn builders_set_fields() {
    let max = NonZeroUsize::new(3).unwrap();
    let config = SchedulerConfig::default().max_resumes(max).fault_policy(FaultPolicy::Halt);
    assert_eq!(config.max_resumes_per_tick, Some(max));
    assert_eq!(config.fault_policy, FaultPolicy::Halt);
    assert_eq!(SchedulerConfig::default().max_resumes_per_tick, None);
  }

  #[test]
  fn zero_is_not_a_resume_limit() {
    assert!(NonZeroUsize::new(0).is_none());
    assert!("0".parse::<NonZeroUsize>().is_err());
  }
}
