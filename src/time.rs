//! Deadline-based suspension points. Timers are checked at the start of
//! every tick, so a delay resolves in the first tick that begins after its
//! deadline.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::{pin, Pin};
use std::rc::Weak;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use futures::future::{select, Either};

use crate::dispatch::check_cancellation;
use crate::error::{Canceled, TimeoutError};
use crate::scheduler::SchedulerData;

/// Indicates a microthread to be woken at a specific point in time
///
/// In order to work with Rust's builtin [BinaryHeap] which is a max heap, the
/// [Ord] implementation of this struct is reversed; it can be intuitively
/// thought of as ordering by urgency.
struct Timer {
  expires: Instant,
  seq: u64,
  waker: Waker,
}
impl Eq for Timer {}
impl PartialEq for Timer {
  fn eq(&self, other: &Self) -> bool { (self.expires, self.seq) == (other.expires, other.seq) }
}
impl PartialOrd for Timer {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}
impl Ord for Timer {
  fn cmp(&self, other: &Self) -> Ordering { (other.expires, other.seq).cmp(&(self.expires, self.seq)) }
}

#[derive(Default)]
pub(crate) struct Timers {
  heap: BinaryHeap<Timer>,
  seq: u64,
}
impl Timers {
  /// Returns a key for [Timers::cancel]
  pub fn add(&mut self, expires: Instant, waker: Waker) -> u64 {
    self.seq += 1;
    self.heap.push(Timer { expires, seq: self.seq, waker });
    self.seq
  }

  pub fn cancel(&mut self, seq: u64) { self.heap.retain(|t| t.seq != seq) }

  /// Remove every timer that expired by `now`, earliest first
  pub fn take_due(&mut self, now: Instant) -> Vec<Waker> {
    let mut due = Vec::new();
    while self.heap.peek().is_some_and(|t| t.expires <= now) {
      due.extend(self.heap.pop().map(|t| t.waker));
    }
    due
  }

  pub fn next_deadline(&self) -> Option<Instant> { self.heap.peek().map(|t| t.expires) }
  pub fn len(&self) -> usize { self.heap.len() }
  pub fn clear(&mut self) { self.heap.clear() }
}

/// Future returned by `delay`. Fails with [Canceled] if the awaiting
/// microthread is canceled or the scheduler is dropped first. Dropping it
/// removes its timer.
#[must_use = "futures do nothing unless polled"]
pub struct Delay {
  scheduler: Weak<SchedulerData>,
  expires: Instant,
  timer: Option<u64>,
}
impl Delay {
  pub(crate) fn new(scheduler: Weak<SchedulerData>, duration: Duration) -> Self {
    Self { scheduler, expires: Instant::now() + duration, timer: None }
  }

  /// The point in time this delay resolves after
  pub fn deadline(&self) -> Instant { self.expires }
}
impl Future for Delay {
  type Output = Result<(), Canceled>;
  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    if let Err(e) = check_cancellation() {
      return Poll::Ready(Err(e));
    }
    if self.expires <= Instant::now() {
      return Poll::Ready(Ok(()));
    }
    let Some(sched) = self.scheduler.upgrade() else { return Poll::Ready(Err(Canceled)) };
    if self.timer.is_none() {
      self.timer = Some(sched.add_timer(self.expires, cx.waker().clone()));
    }
    Poll::Pending
  }
}
impl Drop for Delay {
  fn drop(&mut self) {
    if let (Some(seq), Some(sched)) = (self.timer.take(), self.scheduler.upgrade()) {
      sched.cancel_timer(seq)
    }
  }
}

/// Race `fut` against `delay`
pub(crate) async fn timeout<F: Future>(
  duration: Duration,
  delay: Delay,
  fut: F,
) -> Result<F::Output, TimeoutError> {
  let fut = pin!(fut);
  match select(fut, delay).await {
    Either::Left((output, _)) => Ok(output),
    Either::Right((Ok(()), _)) => Err(TimeoutError::Elapsed(duration)),
    Either::Right((Err(canceled), _)) => Err(canceled.into()),
  }
}
