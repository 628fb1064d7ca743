//! The frame boundary: a suspension point that resumes in the next tick.

use std::future::Future;
use std::pin::Pin;
use std::rc::Weak;
use std::task::{Context, Poll};

use crate::dispatch::check_cancellation;
use crate::error::Canceled;
use crate::scheduler::SchedulerData;

/// Source of [NextTick] futures for one scheduler. Cheap to clone.
#[derive(Clone)]
pub struct FrameBoundary(pub(crate) Weak<SchedulerData>);
impl FrameBoundary {
  /// Suspend until the scheduler starts a tick after the current one
  pub fn next_tick(&self) -> NextTick {
    NextTick { scheduler: self.0.clone(), captured: None, registered: false }
  }
}

/// Future returned by [FrameBoundary::next_tick]. The tick counter is captured
/// when it is first polled, and it resolves exactly once, in the first tick
/// with a greater counter. Fails with [Canceled] if the awaiting microthread is
/// canceled or the scheduler is dropped. Its waker is registered once.
#[must_use = "futures do nothing unless polled"]
pub struct NextTick {
  scheduler: Weak<SchedulerData>,
  captured: Option<u64>,
  registered: bool,
}
impl Future for NextTick {
  type Output = Result<(), Canceled>;
  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    if let Err(e) = check_cancellation() {
      return Poll::Ready(Err(e));
    }
    let Some(sched) = self.scheduler.upgrade() else { return Poll::Ready(Err(Canceled)) };
    let now = sched.tick();
    let captured = *self.captured.get_or_insert(now);
    if captured < now {
      return Poll::Ready(Ok(()));
    }
    if !self.registered {
      sched.add_frame_waiter(captured, cx.waker().clone());
      self.registered = true;
    }
    Poll::Pending
  }
}
