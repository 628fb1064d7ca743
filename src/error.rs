//! Errors produced by microthread bodies and by the scheduler itself.
//!
//! A body reports failure by returning a [Fault]. Any error type converts into
//! one with `?`, and a [Canceled] anywhere in the error's source chain marks
//! the microthread as canceled rather than faulted.

use std::any::Any;
use std::error::Error;
use std::fmt;
use std::iter;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::microthread::MicroThreadId;
use crate::scheduler::TickReport;

/// What a microthread body eventually produces
pub type BodyResult = Result<(), Fault>;

/// Produced by a suspension point of a microthread whose cancellation was
/// requested. Propagate it out of the body with `?` to end the microthread in
/// [crate::microthread::MicroThreadState::Canceled].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Error)]
#[error("the microthread was canceled")]
pub struct Canceled;

/// The cause recorded for a faulted microthread.
///
/// This deliberately doesn't implement [Error] itself so that every error
/// type can be converted into it.
#[derive(Clone, Debug)]
pub enum Fault {
  /// The body returned an error
  Error(Arc<dyn Error + Send + Sync>),
  /// The body panicked; the payload is rendered if it was a string
  Panic(Arc<str>),
}
impl Fault {
  /// Build a fault from an arbitrary message
  pub fn msg(message: impl fmt::Display) -> Self { Self::Error(Arc::new(Message(message.to_string()))) }

  /// Convert the payload of a caught panic
  pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
    let text = match payload.downcast::<String>() {
      Ok(s) => Arc::from(s.as_str()),
      Err(payload) => match payload.downcast::<&'static str>() {
        Ok(s) => Arc::from(*s),
        Err(_) => Arc::from("non-string panic payload"),
      },
    };
    Self::Panic(text)
  }

  /// Whether the fault was caused by a panic
  pub fn is_panic(&self) -> bool { matches!(self, Self::Panic(_)) }

  /// Find an error of the given type in the source chain of this fault
  pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
    let Self::Error(err) = self else { return None };
    let root: &(dyn Error + 'static) = &**err;
    iter::successors(Some(root), |&e| e.source()).find_map(|e| e.downcast_ref::<E>())
  }

  /// Whether this fault is really a cancellation that unwound the body
  pub fn is_cancellation(&self) -> bool { self.downcast_ref::<Canceled>().is_some() }
}
impl<E: Error + Send + Sync + 'static> From<E> for Fault {
  fn from(err: E) -> Self { Self::Error(Arc::new(err)) }
}
impl fmt::Display for Fault {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Panic(msg) => write!(f, "panicked: {msg}"),
      Self::Error(err) => {
        write!(f, "{err}")?;
        let mut source = err.source();
        while let Some(cause) = source {
          write!(f, ": {cause}")?;
          source = cause.source();
        }
        Ok(())
      },
    }
  }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct Message(String);

/// Conditions that stop [crate::scheduler::Scheduler::run_tick] before the
/// ready queue is drained
#[derive(Clone, Debug, Error)]
pub enum TickError {
  /// `run_tick` or `teardown` was called from inside a microthread body
  #[error("the scheduler was re-entered while a tick was in progress")]
  Reentrant,
  /// A microthread was dequeued while it was already running. This means a
  /// suspension point is broken.
  #[error("microthread {0} was resumed while it was already running")]
  DoubleResume(MicroThreadId),
  /// A body faulted and the scheduler is configured to halt on faults. The
  /// work done so far in the tick is in the report; the rest of the ready
  /// queue runs on the next tick.
  #[error("microthread {id} faulted: {fault}")]
  Fault {
    /// The faulted microthread
    id: MicroThreadId,
    /// The cause
    fault: Fault,
    /// Everything that happened in the tick up to and including the fault
    report: Box<TickReport>,
  },
}

/// Returned by a `timeout` whose deadline passed first
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TimeoutError {
  /// The deadline passed before the operation completed
  #[error("operation timed out after {0:?}")]
  Elapsed(Duration),
  /// The awaiting microthread was canceled
  #[error("timeout interrupted")]
  Canceled(#[from] Canceled),
}

/// Returned by `run_blocking`
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BlockingError {
  /// The worker panicked before producing a value
  #[error("the blocking operation panicked")]
  Panicked,
  /// The awaiting microthread was canceled, or the scheduler is gone
  #[error("blocking operation abandoned")]
  Canceled(#[from] Canceled),
}
