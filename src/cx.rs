//! The context handed to every microthread body

use std::future::Future;
use std::rc::Weak;
use std::sync::Arc;
use std::time::Duration;

use crate::blocking::Blocking;
use crate::dispatch::ContinuationDispatcher;
use crate::error::{Canceled, TimeoutError};
use crate::frame::{FrameBoundary, NextTick};
use crate::microthread::MicroThread;
use crate::scheduler::{Scheduler, SchedulerData};
use crate::time::{self, Delay};

/// Access to the running microthread and the suspension points of its
/// scheduler. Holds the scheduler weakly, so keeping it doesn't keep the
/// scheduler alive; once the scheduler is gone every suspension point fails
/// with [Canceled].
#[derive(Clone)]
pub struct MicroThreadCx {
  thread: MicroThread,
  scheduler: Weak<SchedulerData>,
}
impl MicroThreadCx {
  pub(crate) fn new(thread: MicroThread, scheduler: Weak<SchedulerData>) -> Self {
    Self { thread, scheduler }
  }

  /// The microthread this body belongs to
  pub fn thread(&self) -> &MicroThread { &self.thread }
  /// The owning scheduler, if it still exists
  pub fn scheduler(&self) -> Option<Scheduler> { self.scheduler.upgrade().map(Scheduler) }
  /// Tick counter of the owning scheduler, 0 if it was dropped
  pub fn tick(&self) -> u64 { self.scheduler.upgrade().map_or(0, |s| s.tick()) }
  /// Suspension points bound to the frame loop
  pub fn frame_boundary(&self) -> FrameBoundary { FrameBoundary(self.scheduler.clone()) }
  /// Suspend until the next tick
  pub fn next_tick(&self) -> NextTick { self.frame_boundary().next_tick() }
  /// Suspend until the first tick after `duration` has elapsed
  pub fn delay(&self, duration: Duration) -> Delay { Delay::new(self.scheduler.clone(), duration) }

  /// Run `fut` but give up once `duration` has elapsed
  pub fn timeout<F: Future>(
    &self,
    duration: Duration,
    fut: F,
  ) -> impl Future<Output = Result<F::Output, TimeoutError>> {
    time::timeout(duration, self.delay(duration), fut)
  }

  /// Run a blocking operation on a worker thread and suspend until it
  /// returns
  pub fn run_blocking<T: Send + 'static>(
    &self,
    operation: impl FnOnce() -> T + Send + 'static,
  ) -> Blocking<T> {
    match self.scheduler.upgrade() {
      Some(sched) => sched.run_blocking(operation),
      None => Blocking::abandoned(),
    }
  }

  /// Whether someone asked this microthread to stop
  pub fn is_cancellation_requested(&self) -> bool { self.thread.is_cancellation_requested() }

  /// Explicit cancellation point for bodies that loop without suspending
  pub fn check_cancellation(&self) -> Result<(), Canceled> {
    if self.is_cancellation_requested() { Err(Canceled) } else { Ok(()) }
  }

  /// The dispatcher that resumes this microthread
  pub fn dispatcher(&self) -> &Arc<ContinuationDispatcher> { self.thread.dispatcher() }
}
