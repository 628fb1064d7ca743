//! The unit of cooperative execution and the handle external code holds to
//! observe and steer it.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::mem;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures::future::join_all;
use trait_set::trait_set;

use crate::dispatch::ContinuationDispatcher;
use crate::error::Fault;
use crate::scheduler::SchedulerData;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Scheduling priority of a microthread; lower values run earlier in a tick
pub type Priority = i64;

/// Process-unique identity of a microthread. Never reused.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct MicroThreadId(u64);
impl MicroThreadId {
  pub(crate) fn next() -> Self { Self(NEXT_ID.fetch_add(1, Ordering::Relaxed)) }
  /// The numeric value
  pub fn get(self) -> u64 { self.0 }
}
impl fmt::Display for MicroThreadId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "#{}", self.0) }
}

/// Lifecycle of a microthread.
///
/// `Starting → Running → (Suspended ⇄ Running) → {Completed, Faulted,
/// Canceled}`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MicroThreadState {
  /// Registered, body not invoked yet
  Starting,
  /// The body is being polled right now
  Running,
  /// The body is waiting at a suspension point
  Suspended,
  /// The body returned successfully
  Completed,
  /// The body returned an error or panicked
  Faulted,
  /// The body unwound on cancellation or the microthread was removed
  Canceled,
}
impl MicroThreadState {
  /// Whether the state is final
  pub fn is_terminal(self) -> bool { matches!(self, Self::Completed | Self::Faulted | Self::Canceled) }
}

/// Where a microthread lands among ready microthreads of equal priority
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ScheduleMode {
  /// After everything already queued
  #[default]
  Last,
  /// Before everything already queued
  First,
}

/// Parameters of a new microthread
#[derive(Clone, Debug, Default)]
pub struct MicroThreadOptions {
  /// Label used in logs and reports
  pub name: Option<String>,
  /// Lower runs earlier
  pub priority: Priority,
  /// Tie-break among equal priorities
  pub schedule_mode: ScheduleMode,
}
impl MicroThreadOptions {
  /// Unnamed microthread with the given priority
  pub fn new(priority: Priority) -> Self { Self { priority, ..Self::default() } }
  /// Set the name
  pub fn named(self, name: impl Into<String>) -> Self { Self { name: Some(name.into()), ..self } }
  /// Set the schedule mode
  pub fn mode(self, schedule_mode: ScheduleMode) -> Self { Self { schedule_mode, ..self } }
}

trait_set! {
  trait CompletionFn = FnOnce(&MicroThread) + 'static;
}

#[derive(Default)]
struct Completion {
  fired: bool,
  callbacks: Vec<Box<dyn CompletionFn>>,
  wakers: Vec<Waker>,
}

pub(crate) struct MicroThreadData {
  id: MicroThreadId,
  name: Option<Rc<str>>,
  priority: Cell<Priority>,
  schedule_mode: Cell<ScheduleMode>,
  state: Cell<MicroThreadState>,
  fault: RefCell<Option<Fault>>,
  remove_requested: Cell<bool>,
  dispatcher: Arc<ContinuationDispatcher>,
  scheduler: Weak<SchedulerData>,
  completion: RefCell<Completion>,
}

/// Shared handle to a microthread. The scheduler owns the body; handles only
/// observe and steer it, and stay valid after it finishes.
#[derive(Clone)]
pub struct MicroThread(Rc<MicroThreadData>);
impl MicroThread {
  pub(crate) fn new(
    opts: MicroThreadOptions,
    dispatcher: Arc<ContinuationDispatcher>,
    scheduler: Weak<SchedulerData>,
  ) -> Self {
    Self(Rc::new(MicroThreadData {
      id: dispatcher.id(),
      name: opts.name.map(Rc::from),
      priority: Cell::new(opts.priority),
      schedule_mode: Cell::new(opts.schedule_mode),
      state: Cell::new(MicroThreadState::Starting),
      fault: RefCell::new(None),
      remove_requested: Cell::new(false),
      dispatcher,
      scheduler,
      completion: RefCell::default(),
    }))
  }

  /// Unique identity
  pub fn id(&self) -> MicroThreadId { self.0.id }
  /// Label given at creation
  pub fn name(&self) -> Option<&str> { self.0.name.as_deref() }
  /// Current lifecycle state
  pub fn state(&self) -> MicroThreadState { self.0.state.get() }
  /// The cause if the state is [MicroThreadState::Faulted]
  pub fn fault(&self) -> Option<Fault> { self.0.fault.borrow().clone() }
  /// Current priority, lower runs earlier
  pub fn priority(&self) -> Priority { self.0.priority.get() }
  /// Tie-break among equal priorities
  pub fn schedule_mode(&self) -> ScheduleMode { self.0.schedule_mode.get() }

  /// Change the priority. If the microthread is waiting in the ready queue it
  /// is re-sorted before the queue is drained again, otherwise the new value
  /// applies the next time it becomes ready.
  pub fn set_priority(&self, priority: Priority) {
    if self.0.priority.replace(priority) == priority {
      return;
    }
    if let Some(sched) = self.0.scheduler.upgrade() {
      sched.reprioritize(self);
    }
  }

  /// Change the tie-break for subsequent enqueues
  pub fn set_schedule_mode(&self, mode: ScheduleMode) { self.0.schedule_mode.set(mode) }

  /// Ask the body to stop. This doesn't change the state by itself; the next
  /// suspension point the body reaches (or the one it is waiting at) fails
  /// with [crate::error::Canceled]. A body waiting on a future that doesn't
  /// observe cancellation is dropped at that await when it is next resumed.
  /// Idempotent.
  pub fn request_cancellation(&self) { self.cancel_handle().cancel() }

  /// Whether cancellation was requested
  pub fn is_cancellation_requested(&self) -> bool { self.0.dispatcher.cancel_flag().is_cancelled() }

  /// A handle that can request cancellation from any thread
  pub fn cancel_handle(&self) -> CancelHandle { CancelHandle(self.0.dispatcher.clone()) }

  /// The adapter that routes wakeups of this microthread to its scheduler
  pub fn dispatcher(&self) -> &Arc<ContinuationDispatcher> { &self.0.dispatcher }

  /// Register a callback that runs exactly once when the microthread reaches
  /// a terminal state. If that already happened it runs immediately.
  pub fn on_completed(&self, callback: impl FnOnce(&MicroThread) + 'static) {
    let mut completion = self.0.completion.borrow_mut();
    if completion.fired {
      drop(completion);
      callback(self)
    } else {
      completion.callbacks.push(Box::new(callback))
    }
  }

  /// A future that resolves with the terminal state
  pub fn join(&self) -> Join { Join(self.clone()) }

  pub(crate) fn set_state(&self, state: MicroThreadState) { self.0.state.set(state) }
  pub(crate) fn request_removal(&self) { self.0.remove_requested.set(true) }
  pub(crate) fn removal_requested(&self) -> bool { self.0.remove_requested.get() }
  /// A pending body of a removed or canceled microthread is dropped instead
  /// of being suspended again
  pub(crate) fn must_unwind(&self) -> bool {
    self.removal_requested() || self.is_cancellation_requested()
  }
  pub(crate) fn belongs_to(&self, sched: &Rc<SchedulerData>) -> bool {
    Weak::ptr_eq(&self.0.scheduler, &Rc::downgrade(sched))
  }

  /// Enter a terminal state and notify everyone who asked
  pub(crate) fn finish(&self, state: MicroThreadState, fault: Option<Fault>) {
    debug_assert!(state.is_terminal(), "{state:?} is not a terminal state");
    self.0.dispatcher.detach();
    self.0.state.set(state);
    *self.0.fault.borrow_mut() = fault;
    let fired = Completion { fired: true, ..Completion::default() };
    let Completion { callbacks, wakers, .. } =
      mem::replace(&mut *self.0.completion.borrow_mut(), fired);
    callbacks.into_iter().for_each(|cb| cb(self));
    wakers.into_iter().for_each(Waker::wake);
  }
}
impl PartialEq for MicroThread {
  fn eq(&self, other: &Self) -> bool { Rc::ptr_eq(&self.0, &other.0) }
}
impl Eq for MicroThread {}
impl Hash for MicroThread {
  fn hash<H: Hasher>(&self, state: &mut H) { self.0.id.hash(state) }
}
impl fmt::Debug for MicroThread {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MicroThread")
      .field("id", &self.id())
      .field("name", &self.name())
      .field("priority", &self.priority())
      .field("state", &self.state())
      .finish()
  }
}
impl fmt::Display for MicroThread {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.name() {
      Some(name) => write!(f, "{name}{}", self.id()),
      None => write!(f, "{}", self.id()),
    }
  }
}

/// Thread-safe cancellation handle of a microthread
#[derive(Clone, Debug)]
pub struct CancelHandle(Arc<ContinuationDispatcher>);
impl CancelHandle {
  /// Request cancellation and wake the microthread so that the suspension
  /// point it is waiting at can observe it. Repeated calls do nothing.
  pub fn cancel(&self) {
    if self.0.cancel_flag().cancel() {
      self.0.post()
    }
  }
  /// Whether cancellation was requested
  pub fn is_cancelled(&self) -> bool { self.0.cancel_flag().is_cancelled() }
}

/// Future returned by [MicroThread::join]
#[must_use = "futures do nothing unless polled"]
pub struct Join(MicroThread);
impl Future for Join {
  type Output = MicroThreadState;
  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let state = self.0.state();
    if state.is_terminal() {
      return Poll::Ready(state);
    }
    let mut completion = self.0 .0.completion.borrow_mut();
    if !completion.wakers.iter().any(|w| w.will_wake(cx.waker())) {
      completion.wakers.push(cx.waker().clone());
    }
    Poll::Pending
  }
}

/// Wait for all of the microthreads to finish, and collect their terminal
/// states in order
pub async fn when_all(threads: impl IntoIterator<Item = MicroThread>) -> Vec<MicroThreadState> {
  join_all(threads.into_iter().map(|t| t.join())).await
}

#[cfg(test)]
mod test {
  use std::cell::Cell;
  use std::rc::{Rc, Weak};
  use std::sync::Arc;

  use test_executors::spin_on;

  use super::{when_all, MicroThread, MicroThreadId, MicroThreadOptions, MicroThreadState};
  use crate::dispatch::{ContinuationDispatcher, Inbox};
  use crate::error::Fault;

  fn detached(name: &str) -> MicroThread {
    let dispatcher = ContinuationDispatcher::new(MicroThreadId::next(), Arc::new(Inbox::default()));
    MicroThread::new(MicroThreadOptions::new(0).named(name), dispatcher, Weak::new())
  }

  #[test]
  fn ids_increase() {
    let a = MicroThreadId::next();
    let b = MicroThreadId::next();
    assert!(a < b);
  }

  #[test]
  fn completion_fires_once() {
    let t = detached("a");
    let count = Rc::new(Cell::new(0));
    let c1 = count.clone();
    t.on_completed(move |_| c1.set(c1.get() + 1));
    t.finish(MicroThreadState::Faulted, Some(Fault::msg("x")));
    assert_eq!(count.get(), 1);
    let c2 = count.clone();
    t.on_completed(move |t| {
      assert_eq!(t.state(), MicroThreadState::Faulted);
      c2.set(c2.get() + 10)
    });
    assert_eq!(count.get(), 11);
    assert_eq!(t.fault().map(|f| f.to_string()).as_deref(), Some("x"));
  }

  #[test]
  fn join_resolves_after_finish() {
    let a = detached("a");
    let b = detached("b");
    a.finish(MicroThreadState::Completed, None);
    b.finish(MicroThreadState::Canceled, None);
    assert_eq!(spin_on(a.join()), MicroThreadState::Completed);
    let states = spin_on(when_all([a, b]));
    assert_eq!(states, vec![MicroThreadState::Completed, MicroThreadState::Canceled]);
  }

  #[test]
  fn display_uses_name() {
    let t = detached("door");
    assert_eq!(t.to_string(), format!("door{}", t.id()));
  }
}
