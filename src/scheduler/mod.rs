//! The scheduler owns every live microthread body and drives them one tick at
//! a time.
//!
//! ```
//! use microthread::gate::SignalGate;
//! use microthread::scheduler::Scheduler;
//!
//! let sched = Scheduler::new();
//! let gate = SignalGate::new();
//! let wait = gate.clone();
//! let waiter = sched.add(1, move |_| async move {
//!   wait.wait().await?;
//!   Ok(())
//! });
//! sched.add(5, move |_| async move {
//!   gate.set();
//!   Ok(())
//! });
//! let report = sched.run_tick().unwrap();
//! assert_eq!(report.completed.len(), 2);
//! assert!(waiter.state().is_terminal());
//! ```

mod ready_queue;
mod report;

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use futures::future::LocalBoxFuture;
use futures::task::waker;
use futures::FutureExt;
use hashbrown::HashMap;
use itertools::Itertools;
use tracing::{debug, error, trace, warn};
use trait_set::trait_set;

use self::ready_queue::{Key, ReadyQueue};
pub use self::report::TickReport;
use crate::blocking::{self, Blocking, Job};
use crate::config::{FaultPolicy, SchedulerConfig};
use crate::cx::MicroThreadCx;
use crate::dispatch::{self, ContinuationDispatcher, Inbox};
use crate::error::{BodyResult, Fault, TickError, TimeoutError};
use crate::frame::FrameBoundary;
use crate::microthread::{MicroThread, MicroThreadId, MicroThreadOptions, MicroThreadState, Priority, ScheduleMode};
use crate::time::{self, Delay, Timers};
use crate::utils::thread_pool::ThreadPool;
use crate::utils::unwrap_or;

trait_set! {
  trait StartFn = FnOnce(MicroThreadCx) -> LocalBoxFuture<'static, BodyResult> + 'static;
}

enum Body {
  /// Not invoked yet
  Pending(Box<dyn StartFn>),
  /// Invoked, panics are caught at every poll
  Started(LocalBoxFuture<'static, std::thread::Result<BodyResult>>),
}

struct Slot {
  thread: MicroThread,
  /// Taken out for the duration of a resumption
  body: Option<Body>,
}

/// Resets the reentrancy flag however the tick ends
struct TickGuard<'a>(&'a Cell<bool>);
impl Drop for TickGuard<'_> {
  fn drop(&mut self) { self.0.set(false) }
}

pub(crate) struct SchedulerData {
  config: SchedulerConfig,
  tick: Cell<u64>,
  in_tick: Cell<bool>,
  last_seq: Cell<i64>,
  first_seq: Cell<i64>,
  registry: RefCell<HashMap<MicroThreadId, Slot>>,
  ready: RefCell<ReadyQueue>,
  inbox: Arc<Inbox>,
  /// Added during a tick, enqueued at the start of the next one
  deferred: RefCell<Vec<MicroThreadId>>,
  frame_waiters: RefCell<Vec<(u64, Waker)>>,
  timers: RefCell<Timers>,
  /// Removed outside of a resumption, reported in the next report
  pending_canceled: RefCell<Vec<MicroThread>>,
  current: RefCell<Option<MicroThread>>,
  pool: ThreadPool<Job>,
}
impl SchedulerData {
  pub fn tick(&self) -> u64 { self.tick.get() }

  pub fn add_frame_waiter(&self, captured: u64, waker: Waker) {
    self.frame_waiters.borrow_mut().push((captured, waker))
  }

  pub fn add_timer(&self, expires: Instant, waker: Waker) -> u64 { self.timers.borrow_mut().add(expires, waker) }
  pub fn cancel_timer(&self, seq: u64) { self.timers.borrow_mut().cancel(seq) }

  pub fn reprioritize(&self, thread: &MicroThread) {
    if self.ready.borrow_mut().reprioritize(thread.id(), thread.priority()) {
      trace!(microthread = %thread, priority = thread.priority(), "re-sorted in the ready queue");
    }
  }

  pub fn run_blocking<T: Send + 'static>(
    &self,
    operation: impl FnOnce() -> T + Send + 'static,
  ) -> Blocking<T> {
    blocking::submit(&self.pool, operation)
  }

  fn enqueue(&self, thread: &MicroThread) {
    let seq = match thread.schedule_mode() {
      ScheduleMode::Last => self.last_seq.replace(self.last_seq.get() + 1),
      ScheduleMode::First => {
        self.first_seq.set(self.first_seq.get() - 1);
        self.first_seq.get()
      },
    };
    self.ready.borrow_mut().push(thread.id(), Key { priority: thread.priority(), seq })
  }

  fn release_frame_waiters(&self, tick: u64) {
    let waiters = mem::take(&mut *self.frame_waiters.borrow_mut());
    let (due, later): (Vec<_>, Vec<_>) = waiters.into_iter().partition(|(captured, _)| *captured < tick);
    self.frame_waiters.borrow_mut().extend(later);
    due.into_iter().for_each(|(_, waker)| waker.wake());
  }

  fn fire_timers(&self, now: Instant) {
    let due = self.timers.borrow_mut().take_due(now);
    due.into_iter().for_each(Waker::wake);
  }

  fn merge_deferred(&self) {
    let deferred = mem::take(&mut *self.deferred.borrow_mut());
    for id in deferred {
      let thread = self.registry.borrow().get(&id).map(|slot| slot.thread.clone());
      if let Some(thread) = thread {
        self.enqueue(&thread)
      }
    }
  }

  /// Move posted microthreads into the ready queue. Posts of unregistered
  /// microthreads are stale and get dropped.
  fn drain_inbox(&self) {
    for id in self.inbox.drain() {
      let thread = self.registry.borrow().get(&id).map(|slot| slot.thread.clone());
      match thread {
        Some(thread) => self.enqueue(&thread),
        None => trace!(microthread = %id, "dropping stale post"),
      }
    }
  }

  /// Unregister a microthread that reached a terminal state and notify
  fn retire(&self, thread: &MicroThread, state: MicroThreadState, fault: Option<Fault>) {
    let slot = self.registry.borrow_mut().remove(&thread.id());
    thread.finish(state, fault);
    debug!(microthread = %thread, ?state, "finished");
    drop(slot);
  }

  /// Poll a microthread's body once, plus any immediate re-polls requested
  /// through [ContinuationDispatcher::send]
  fn resume(self: &Rc<Self>, id: MicroThreadId, report: &mut TickReport) -> Result<(), TickError> {
    let (thread, body) = {
      let mut registry = self.registry.borrow_mut();
      let slot = unwrap_or!(registry.get_mut(&id); return Ok(()));
      if slot.thread.state() == MicroThreadState::Running {
        error!(microthread = %slot.thread, "dequeued while already running");
        return Err(TickError::DoubleResume(id));
      }
      (slot.thread.clone(), slot.body.take())
    };
    let body = unwrap_or!(body; return Err(TickError::DoubleResume(id)));
    let dispatcher = thread.dispatcher().clone();
    dispatcher.dequeued();
    thread.set_state(MicroThreadState::Running);
    report.resumed += 1;
    trace!(microthread = %thread, tick = report.tick, "resuming");
    let prev = self.current.replace(Some(thread.clone()));
    let guard = dispatch::enter(&dispatcher);
    let outcome = self.poll_body(&thread, body, &dispatcher);
    drop(guard);
    *self.current.borrow_mut() = prev;
    let (state, fault) = match outcome {
      Poll::Pending if thread.must_unwind() => (MicroThreadState::Canceled, None),
      Poll::Pending => {
        thread.set_state(MicroThreadState::Suspended);
        return Ok(());
      },
      Poll::Ready(Ok(())) => (MicroThreadState::Completed, None),
      Poll::Ready(Err(fault)) if fault.is_cancellation() => (MicroThreadState::Canceled, None),
      Poll::Ready(Err(fault)) => (MicroThreadState::Faulted, Some(fault)),
    };
    self.retire(&thread, state, fault.clone());
    match fault {
      None if state == MicroThreadState::Completed => report.completed.push(thread),
      None => report.canceled.push(thread),
      Some(fault) => {
        warn!(microthread = %thread, %fault, "microthread faulted");
        report.faulted.push((thread, fault.clone()));
        if self.config.fault_policy == FaultPolicy::Halt {
          return Err(TickError::Fault { id, fault, report: Box::new(report.clone()) });
        }
      },
    }
    Ok(())
  }

  /// Start or continue a body. A suspended body is put back in its slot,
  /// unless it has to unwind, in which case dropping it releases everything it
  /// was waiting on.
  fn poll_body(
    self: &Rc<Self>,
    thread: &MicroThread,
    body: Body,
    dispatcher: &Arc<ContinuationDispatcher>,
  ) -> Poll<BodyResult> {
    let mut fut = match body {
      Body::Started(fut) => fut,
      Body::Pending(start) => {
        let cx = MicroThreadCx::new(thread.clone(), Rc::downgrade(self));
        match catch_unwind(AssertUnwindSafe(|| start(cx))) {
          Ok(fut) => AssertUnwindSafe(fut).catch_unwind().boxed_local(),
          Err(payload) => return Poll::Ready(Err(Fault::from_panic(payload))),
        }
      },
    };
    let waker = waker(dispatcher.clone());
    let mut cx = Context::from_waker(&waker);
    loop {
      match fut.poll_unpin(&mut cx) {
        Poll::Ready(Ok(result)) => return Poll::Ready(result),
        Poll::Ready(Err(payload)) => return Poll::Ready(Err(Fault::from_panic(payload))),
        Poll::Pending if dispatcher.take_inline() && !thread.must_unwind() => {
          trace!(microthread = %thread, "re-polling inline")
        },
        Poll::Pending => break,
      }
    }
    if !thread.must_unwind() {
      if let Some(slot) = self.registry.borrow_mut().get_mut(&thread.id()) {
        slot.body = Some(Body::Started(fut));
      }
    }
    Poll::Pending
  }
}
impl Drop for SchedulerData {
  fn drop(&mut self) {
    let slots = mem::take(self.registry.get_mut());
    for slot in slots.into_values().sorted_by_key(|slot| slot.thread.id()) {
      slot.thread.finish(MicroThreadState::Canceled, None);
    }
  }
}

/// A cooperative scheduler for microthreads, driven by calling
/// [Scheduler::run_tick] once per frame. It is single-threaded; other threads
/// interact with it only by waking microthreads, setting gates and requesting
/// cancellation.
///
/// Clones refer to the same scheduler.
#[derive(Clone)]
pub struct Scheduler(pub(crate) Rc<SchedulerData>);
impl Scheduler {
  /// Create a scheduler with the default configuration
  pub fn new() -> Self { Self::with_config(SchedulerConfig::default()) }

  /// Create a scheduler
  pub fn with_config(config: SchedulerConfig) -> Self {
    Self(Rc::new(SchedulerData {
      config,
      tick: Cell::new(0),
      in_tick: Cell::new(false),
      last_seq: Cell::new(0),
      first_seq: Cell::new(0),
      registry: RefCell::default(),
      ready: RefCell::default(),
      inbox: Arc::default(),
      deferred: RefCell::default(),
      frame_waiters: RefCell::default(),
      timers: RefCell::default(),
      pending_canceled: RefCell::default(),
      current: RefCell::default(),
      pool: ThreadPool::new(),
    }))
  }

  /// The configuration this scheduler was created with
  pub fn config(&self) -> &SchedulerConfig { &self.0.config }

  /// Register a microthread with the given priority. See
  /// [Scheduler::add_with].
  pub fn add<F, Fut>(&self, priority: Priority, body: F) -> MicroThread
  where
    F: FnOnce(MicroThreadCx) -> Fut + 'static,
    Fut: Future<Output = BodyResult> + 'static,
  {
    self.add_with(MicroThreadOptions::new(priority), body)
  }

  /// Register a microthread and make it ready. The body is invoked the first
  /// time the microthread is resumed. Microthreads added while a tick is
  /// running are first resumed in the next tick.
  pub fn add_with<F, Fut>(&self, opts: MicroThreadOptions, body: F) -> MicroThread
  where
    F: FnOnce(MicroThreadCx) -> Fut + 'static,
    Fut: Future<Output = BodyResult> + 'static,
  {
    let data = &self.0;
    let dispatcher = ContinuationDispatcher::new(MicroThreadId::next(), data.inbox.clone());
    let thread = MicroThread::new(opts, dispatcher, Rc::downgrade(data));
    let start: Box<dyn StartFn> = Box::new(move |cx: MicroThreadCx| body(cx).boxed_local());
    let slot = Slot { thread: thread.clone(), body: Some(Body::Pending(start)) };
    data.registry.borrow_mut().insert(thread.id(), slot);
    // Starting microthreads can't be posted into the current tick
    thread.dispatcher().mark_queued();
    if data.in_tick.get() {
      data.deferred.borrow_mut().push(thread.id());
    } else {
      data.enqueue(&thread);
    }
    debug!(microthread = %thread, priority = thread.priority(), "added");
    thread
  }

  /// Run one tick: wake microthreads waiting for the frame boundary or an
  /// expired timer, then resume ready microthreads in priority order until
  /// each has suspended or finished. Microthreads that become ready during
  /// the tick run before it returns.
  pub fn run_tick(&self) -> Result<TickReport, TickError> {
    let data = &self.0;
    if data.in_tick.replace(true) {
      error!("run_tick called while a tick is in progress");
      return Err(TickError::Reentrant);
    }
    let _guard = TickGuard(&data.in_tick);
    let tick = data.tick.get() + 1;
    data.tick.set(tick);
    let mut report = TickReport { tick, ..TickReport::default() };
    report.canceled.append(&mut data.pending_canceled.borrow_mut());
    data.release_frame_waiters(tick);
    data.fire_timers(Instant::now());
    data.merge_deferred();
    loop {
      data.drain_inbox();
      if data.config.max_resumes_per_tick.is_some_and(|max| report.resumed >= max.get()) {
        if !data.ready.borrow().is_empty() {
          warn!(tick, left = data.ready.borrow().len(), "resume limit reached, deferring to the next tick");
          report.deferred = true;
        }
        break;
      }
      let id = unwrap_or!(data.ready.borrow_mut().pop(); break);
      data.resume(id, &mut report)?;
    }
    report.canceled.append(&mut data.pending_canceled.borrow_mut());
    trace!(%report, "tick done");
    Ok(report)
  }

  /// Remove a microthread. A suspended or starting microthread is canceled
  /// right away without resuming its body, and appears in the next report.
  /// A running microthread (removing itself) is canceled when its current
  /// resumption returns. Returns false if the microthread already finished
  /// or belongs to another scheduler.
  pub fn remove(&self, thread: &MicroThread) -> bool {
    let data = &self.0;
    if !thread.belongs_to(data) || thread.state().is_terminal() || thread.removal_requested() {
      return false;
    }
    if thread.state() == MicroThreadState::Running {
      thread.request_removal();
      return true;
    }
    if !data.registry.borrow().contains_key(&thread.id()) {
      return false;
    }
    data.ready.borrow_mut().remove(thread.id());
    data.deferred.borrow_mut().retain(|id| *id != thread.id());
    data.retire(thread, MicroThreadState::Canceled, None);
    data.pending_canceled.borrow_mut().push(thread.clone());
    true
  }

  /// Cancel every registered microthread without resuming it and reset the
  /// queues. Returns the canceled microthreads ordered by id. Fails if
  /// called from inside a tick.
  pub fn teardown(&self) -> Result<Vec<MicroThread>, TickError> {
    let data = &self.0;
    if data.in_tick.get() {
      error!("teardown called while a tick is in progress");
      return Err(TickError::Reentrant);
    }
    let slots = mem::take(&mut *data.registry.borrow_mut());
    data.ready.borrow_mut().clear();
    data.inbox.drain();
    data.deferred.borrow_mut().clear();
    data.pending_canceled.borrow_mut().clear();
    let frame_waiters = mem::take(&mut *data.frame_waiters.borrow_mut());
    data.timers.borrow_mut().clear();
    let threads = (slots.into_values())
      .sorted_by_key(|slot| slot.thread.id())
      .map(|slot| {
        slot.thread.finish(MicroThreadState::Canceled, None);
        slot.thread
      })
      .collect_vec();
    drop(frame_waiters);
    debug!(count = threads.len(), "scheduler torn down");
    Ok(threads)
  }

  /// The microthread being resumed right now, if any
  pub fn current(&self) -> Option<MicroThread> { self.0.current.borrow().clone() }
  /// The number of ticks started so far
  pub fn tick(&self) -> u64 { self.0.tick() }
  /// Number of registered microthreads
  pub fn len(&self) -> usize { self.0.registry.borrow().len() }
  /// Whether there are no registered microthreads
  pub fn is_empty(&self) -> bool { self.0.registry.borrow().is_empty() }
  /// Number of microthreads in the ready queue, not counting posts that
  /// haven't been drained yet
  pub fn ready_len(&self) -> usize { self.0.ready.borrow().len() }
  /// All registered microthreads ordered by id
  pub fn microthreads(&self) -> Vec<MicroThread> {
    (self.0.registry.borrow().values()).map(|slot| slot.thread.clone()).sorted_by_key(|t| t.id()).collect()
  }
  /// The earliest pending timer deadline, useful to frame loops that sleep
  pub fn next_deadline(&self) -> Option<Instant> { self.0.timers.borrow().next_deadline() }

  /// Suspension points bound to this scheduler's ticks
  pub fn frame_boundary(&self) -> FrameBoundary { FrameBoundary(Rc::downgrade(&self.0)) }
  /// Suspend until the first tick after `duration` has elapsed
  pub fn delay(&self, duration: Duration) -> Delay { Delay::new(Rc::downgrade(&self.0), duration) }
  /// Run `fut` but give up once `duration` has elapsed
  pub fn timeout<F: Future>(
    &self,
    duration: Duration,
    fut: F,
  ) -> impl Future<Output = Result<F::Output, TimeoutError>> {
    time::timeout(duration, self.delay(duration), fut)
  }
  /// Run a blocking operation on a worker thread. Awaiting the result
  /// suspends the microthread until the worker is done.
  pub fn run_blocking<T: Send + 'static>(
    &self,
    operation: impl FnOnce() -> T + Send + 'static,
  ) -> Blocking<T> {
    self.0.run_blocking(operation)
  }
}
impl Default for Scheduler {
  fn default() -> Self { Self::new() }
}
impl fmt::Debug for Scheduler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Scheduler")
      .field("tick", &self.tick())
      .field("registered", &self.len())
      .field("ready", &self.ready_len())
      .field("posted", &self.0.inbox.len())
      .field("timers", &self.0.timers.borrow().len())
      .field("config", self.config())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod test {
  use std::cell::{Cell, RefCell};
  use std::future::{ready, Future, Ready};
  use std::num::NonZeroUsize;
  use std::pin::{pin, Pin};
  use std::rc::Rc;
  use std::task::{Context, Poll};
  use std::thread::sleep;
  use std::time::Duration;

  use futures::channel::oneshot;
  use futures::future::poll_fn;
  use itertools::Itertools;

  use super::Scheduler;
  use crate::config::{FaultPolicy, SchedulerConfig};
  use crate::cx::MicroThreadCx;
  use crate::dispatch;
  use crate::error::{BlockingError, BodyResult, Fault, TickError, TimeoutError};
  use crate::gate::SignalGate;
  use crate::microthread::{when_all, MicroThread, MicroThreadOptions, MicroThreadState, ScheduleMode};

  /// Pending once, waking itself either through the waker or with an inline
  /// send
  struct Yield {
    done: bool,
    inline: bool,
  }
  impl Future for Yield {
    type Output = ();
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
      if self.done {
        return Poll::Ready(());
      }
      self.done = true;
      match self.inline {
        true => dispatch::current().expect("polled outside a microthread").send(),
        false => cx.waker().wake_by_ref(),
      }
      Poll::Pending
    }
  }
  fn yield_now() -> Yield { Yield { done: false, inline: false } }

  fn quick(_: MicroThreadCx) -> Ready<BodyResult> { ready(Ok(())) }
  fn explode(_: MicroThreadCx) -> Ready<BodyResult> { panic!("exploded at start") }

  fn priorities(threads: &[MicroThread]) -> Vec<i64> { threads.iter().map(|t| t.priority()).collect() }

  /// Run ticks until the microthread finishes, sleeping between them
  fn tick_until_done(sched: &Scheduler, thread: &MicroThread) {
    for _ in 0..2000 {
      sched.run_tick().unwrap();
      if thread.state().is_terminal() {
        return;
      }
      sleep(Duration::from_millis(1));
    }
    panic!("{thread} did not finish")
  }

  #[test]
  fn completes_in_priority_order() {
    let sched = Scheduler::new();
    for p in [5, 1, 3] {
      sched.add(p, quick);
    }
    let report = sched.run_tick().unwrap();
    assert_eq!(report.tick, 1);
    assert_eq!(report.resumed, 3);
    assert_eq!(priorities(&report.completed), vec![1, 3, 5]);
    assert!(sched.is_empty());
  }

  #[test]
  fn gate_waiter_resumes_in_the_same_tick() {
    let sched = Scheduler::new();
    let gate = SignalGate::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let (wait, xlog) = (gate.clone(), log.clone());
    let x = sched.add(5, move |_| async move {
      wait.wait().await?;
      xlog.borrow_mut().push("x");
      Ok(())
    });
    let first = sched.run_tick().unwrap();
    assert!(first.completed.is_empty());
    assert_eq!(x.state(), MicroThreadState::Suspended);
    let ylog = log.clone();
    let y = sched.add(1, move |_| async move {
      assert_eq!(gate.set(), 1);
      ylog.borrow_mut().push("y");
      Ok(())
    });
    let second = sched.run_tick().unwrap();
    assert_eq!(second.completed, vec![y, x.clone()]);
    assert_eq!(*log.borrow(), vec!["y", "x"]);
    assert_eq!(x.state(), MicroThreadState::Completed);
  }

  #[test]
  fn next_tick_resumes_exactly_once_per_tick() {
    let sched = Scheduler::new();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen2 = seen.clone();
    let t = sched.add(0, move |cx| async move {
      for _ in 0..3 {
        seen2.borrow_mut().push(cx.tick());
        cx.next_tick().await?;
      }
      Ok(())
    });
    for _ in 0..3 {
      assert!(sched.run_tick().unwrap().completed.is_empty());
    }
    assert_eq!(*seen.borrow(), vec![1, 2, 3]);
    assert_eq!(sched.run_tick().unwrap().completed, vec![t.clone()]);
    assert_eq!(sched.run_tick().unwrap().resumed, 0);
  }

  #[test]
  fn faults_are_isolated() {
    let sched = Scheduler::new();
    let err = sched.add(0, |_| async { Err(Fault::msg("boom")) });
    let start_panic = sched.add(1, explode);
    let poll_panic = sched.add(2, |cx| async move {
      cx.check_cancellation()?;
      panic!("exploded while running")
    });
    let fine = sched.add(3, quick);
    let report = sched.run_tick().unwrap();
    assert_eq!(report.completed, vec![fine]);
    let faulted = report.faulted.iter().map(|(t, _)| t.clone()).collect_vec();
    assert_eq!(faulted, vec![err.clone(), start_panic.clone(), poll_panic.clone()]);
    assert_eq!(err.fault().map(|f| f.to_string()).as_deref(), Some("boom"));
    assert!(start_panic.fault().is_some_and(|f| f.is_panic()));
    assert_eq!(poll_panic.state(), MicroThreadState::Faulted);
  }

  #[test]
  fn cancellation_is_idempotent() {
    let sched = Scheduler::new();
    let gate = SignalGate::new();
    let fired = Rc::new(Cell::new(0));
    let t = sched.add(0, move |_| async move {
      gate.wait().await?;
      Ok(())
    });
    let fired2 = fired.clone();
    t.on_completed(move |_| fired2.set(fired2.get() + 1));
    sched.run_tick().unwrap();
    t.request_cancellation();
    t.request_cancellation();
    assert!(t.is_cancellation_requested());
    assert_eq!(t.state(), MicroThreadState::Suspended);
    let report = sched.run_tick().unwrap();
    assert_eq!(report.canceled, vec![t.clone()]);
    assert_eq!(report.resumed, 1);
    assert_eq!(t.state(), MicroThreadState::Canceled);
    t.request_cancellation();
    sched.run_tick().unwrap();
    assert_eq!(fired.get(), 1);
  }

  #[test]
  fn removing_a_suspended_microthread_never_resumes_it() {
    let sched = Scheduler::new();
    let gate = SignalGate::new();
    let wait = gate.clone();
    let resumed = Rc::new(Cell::new(false));
    let resumed2 = resumed.clone();
    let t = sched.add(0, move |_| async move {
      wait.wait().await?;
      resumed2.set(true);
      Ok(())
    });
    let starting = sched.add(0, quick);
    sched.remove(&starting);
    sched.run_tick().unwrap();
    assert!(sched.remove(&t));
    assert!(!sched.remove(&t));
    assert_eq!(t.state(), MicroThreadState::Canceled);
    gate.set();
    let report = sched.run_tick().unwrap();
    assert_eq!(report.resumed, 0);
    assert_eq!(report.canceled, vec![t]);
    assert!(!resumed.get());
    assert_eq!(starting.state(), MicroThreadState::Canceled);
    assert!(sched.is_empty());
  }

  #[test]
  fn removing_itself_takes_effect_after_the_resumption() {
    let sched = Scheduler::new();
    let t = sched.add(0, |cx| async move {
      let sched = cx.scheduler().expect("scheduler alive");
      assert!(sched.remove(cx.thread()));
      cx.next_tick().await?;
      Ok(())
    });
    let report = sched.run_tick().unwrap();
    assert_eq!(report.canceled, vec![t.clone()]);
    assert_eq!(t.state(), MicroThreadState::Canceled);
  }

  #[test]
  fn late_wakes_are_ignored() {
    let sched = Scheduler::new();
    let t = sched.add(0, quick);
    sched.run_tick().unwrap();
    t.dispatcher().post();
    t.dispatcher().send();
    assert!(t.dispatcher().is_detached());
    assert_eq!(sched.run_tick().unwrap().resumed, 0);
  }

  #[test]
  fn schedule_mode_first_jumps_the_queue() {
    let sched = Scheduler::new();
    let a = sched.add(0, quick);
    let b = sched.add(0, quick);
    let c = sched.add_with(MicroThreadOptions::new(0).named("c").mode(ScheduleMode::First), quick);
    let d = sched.add(-1, quick);
    assert_eq!(sched.run_tick().unwrap().completed, vec![d, c, a, b]);
  }

  #[test]
  fn priority_change_resorts_queued() {
    let sched = Scheduler::new();
    let a = sched.add(0, quick);
    let b = sched.add(1, quick);
    let c = sched.add(2, quick);
    c.set_priority(-1);
    assert_eq!(sched.ready_len(), 3);
    assert_eq!(sched.run_tick().unwrap().completed, vec![c, a, b]);
  }

  #[test]
  fn priority_change_while_suspended_applies_to_the_next_enqueue() {
    let sched = Scheduler::new();
    let gate = SignalGate::new();
    let wait = gate.clone();
    let a = sched.add(5, move |_| async move {
      wait.wait().await?;
      Ok(())
    });
    sched.run_tick().unwrap();
    a.set_priority(-1);
    assert_eq!(sched.ready_len(), 0);
    assert_eq!(a.state(), MicroThreadState::Suspended);
    let setter = sched.add(0, move |_| async move {
      gate.set();
      Ok(())
    });
    let other = sched.add(0, quick);
    assert_eq!(sched.run_tick().unwrap().completed, vec![setter, a, other]);
  }

  #[test]
  fn reentrant_ticks_are_refused() {
    let sched = Scheduler::new();
    let results = Rc::new(RefCell::new(Vec::new()));
    let results2 = results.clone();
    sched.add(0, move |cx| async move {
      let sched = cx.scheduler().expect("scheduler alive");
      results2.borrow_mut().push(sched.run_tick().map(|_| ()));
      results2.borrow_mut().push(sched.teardown().map(|_| ()));
      Ok(())
    });
    assert_eq!(sched.run_tick().unwrap().completed.len(), 1);
    let results = results.borrow();
    assert!(matches!(results[0], Err(TickError::Reentrant)));
    assert!(matches!(results[1], Err(TickError::Reentrant)));
  }

  #[test]
  fn halt_policy_stops_at_the_first_fault() {
    let config = SchedulerConfig::default().fault_policy(FaultPolicy::Halt);
    let sched = Scheduler::with_config(config);
    let ok = sched.add(0, quick);
    let bad = sched.add(1, |_| async { Err(Fault::msg("halt")) });
    let after = sched.add(2, quick);
    match sched.run_tick() {
      Err(TickError::Fault { id, fault, report }) => {
        assert_eq!(id, bad.id());
        assert_eq!(fault.to_string(), "halt");
        assert_eq!(report.completed, vec![ok]);
      },
      other => panic!("expected a fault, got {other:?}"),
    }
    assert_eq!(after.state(), MicroThreadState::Starting);
    assert_eq!(sched.run_tick().unwrap().completed, vec![after]);
  }

  #[test]
  fn resume_limit_defers_the_rest() {
    let sched = Scheduler::with_config(SchedulerConfig::default().max_resumes(NonZeroUsize::new(4).unwrap()));
    let spinner = sched.add(0, |cx| async move {
      loop {
        cx.check_cancellation()?;
        yield_now().await;
      }
    });
    let other = sched.add(1, quick);
    let report = sched.run_tick().unwrap();
    assert_eq!(report.resumed, 4);
    assert!(report.deferred);
    assert_eq!(other.state(), MicroThreadState::Starting);
    spinner.request_cancellation();
    let report = sched.run_tick().unwrap();
    assert_eq!(report.canceled, vec![spinner]);
    assert_eq!(report.completed, vec![other]);
    assert!(!report.deferred);
  }

  #[test]
  fn inline_send_repolls_within_one_resumption() {
    let sched = Scheduler::new();
    let inline = sched.add(0, |_| async {
      Yield { done: false, inline: true }.await;
      Ok(())
    });
    let report = sched.run_tick().unwrap();
    assert_eq!(report.resumed, 1);
    assert_eq!(report.completed, vec![inline]);
    let posted = sched.add(0, |_| async {
      yield_now().await;
      Ok(())
    });
    let report = sched.run_tick().unwrap();
    assert_eq!(report.resumed, 2);
    assert_eq!(report.completed, vec![posted]);
  }

  #[test]
  fn additions_during_a_tick_wait_for_the_next() {
    let sched = Scheduler::new();
    let child = Rc::new(RefCell::new(None));
    let child2 = child.clone();
    let parent = sched.add(0, move |cx| async move {
      let sched = cx.scheduler().expect("scheduler alive");
      assert_eq!(sched.current().as_ref(), Some(cx.thread()));
      *child2.borrow_mut() = Some(sched.add(-10, quick));
      Ok(())
    });
    assert_eq!(sched.run_tick().unwrap().completed, vec![parent]);
    let child = child.borrow_mut().take().expect("child added");
    assert_eq!(child.state(), MicroThreadState::Starting);
    assert_eq!(sched.microthreads(), vec![child.clone()]);
    assert_eq!(sched.run_tick().unwrap().completed, vec![child]);
    assert!(sched.current().is_none());
  }

  #[test]
  fn join_and_when_all() {
    let sched = Scheduler::new();
    let a = sched.add(0, |cx| async move {
      cx.next_tick().await?;
      Ok(())
    });
    let b = sched.add(0, |_| async { Err(Fault::msg("b failed")) });
    let states = Rc::new(RefCell::new(Vec::new()));
    let (deps, states2) = (vec![a.clone(), b.clone()], states.clone());
    let joiner = sched.add(1, move |_| async move {
      *states2.borrow_mut() = when_all(deps).await;
      Ok(())
    });
    assert!(sched.run_tick().unwrap().completed.is_empty());
    assert_eq!(sched.run_tick().unwrap().completed, vec![a, joiner]);
    assert_eq!(*states.borrow(), vec![MicroThreadState::Completed, MicroThreadState::Faulted]);
  }

  #[test]
  fn delay_and_timeout() {
    let sched = Scheduler::new();
    let gate = SignalGate::new();
    let delayed = sched.add(0, |cx| async move {
      cx.delay(Duration::from_millis(20)).await?;
      Ok(())
    });
    let timed_out = Rc::new(Cell::new(false));
    let timed_out2 = timed_out.clone();
    let waiter = sched.add(0, move |cx| async move {
      match cx.timeout(Duration::from_millis(10), gate.wait()).await {
        Err(TimeoutError::Elapsed(_)) => timed_out2.set(true),
        other => return Err(Fault::msg(format!("unexpected {other:?}"))),
      }
      Ok(())
    });
    sched.run_tick().unwrap();
    assert!(sched.next_deadline().is_some());
    tick_until_done(&sched, &waiter);
    tick_until_done(&sched, &delayed);
    assert!(timed_out.get());
    assert_eq!(delayed.state(), MicroThreadState::Completed);
    assert!(1 < sched.tick());
  }

  #[test]
  fn blocking_operations() {
    let sched = Scheduler::new();
    let results = Rc::new(RefCell::new(Vec::new()));
    let results2 = results.clone();
    let t = sched.add(0, move |cx| async move {
      let answer = cx.run_blocking(|| 6 * 7).await?;
      let failed = cx.run_blocking(|| -> u32 { panic!("worker exploded") }).await;
      results2.borrow_mut().push((answer, failed));
      Ok(())
    });
    tick_until_done(&sched, &t);
    assert_eq!(t.state(), MicroThreadState::Completed);
    assert_eq!(*results.borrow(), vec![(42, Err(BlockingError::Panicked))]);
  }

  #[test]
  fn teardown_cancels_everything() {
    let sched = Scheduler::new();
    let gate = SignalGate::new();
    let wait = gate.clone();
    let waiting = sched.add(0, move |_| async move {
      wait.wait().await?;
      Ok(())
    });
    sched.run_tick().unwrap();
    let starting = sched.add(0, quick);
    assert_eq!(sched.len(), 2);
    assert_eq!(sched.teardown().unwrap(), vec![waiting.clone(), starting.clone()]);
    assert!(sched.is_empty());
    assert_eq!(waiting.state(), MicroThreadState::Canceled);
    assert_eq!(starting.state(), MicroThreadState::Canceled);
    gate.set();
    assert_eq!(sched.run_tick().unwrap().resumed, 0);
  }

  #[test]
  fn dropping_the_scheduler_cancels_bodies() {
    let sched = Scheduler::new();
    let t = sched.add(0, |cx| async move {
      cx.next_tick().await?;
      Ok(())
    });
    sched.run_tick().unwrap();
    drop(sched);
    assert_eq!(t.state(), MicroThreadState::Canceled);
  }

  #[test]
  fn cancellation_drops_bodies_waiting_on_foreign_futures() {
    let sched = Scheduler::new();
    let (send, recv) = oneshot::channel::<()>();
    let t = sched.add(0, move |_| async move {
      let _ = recv.await;
      Ok(())
    });
    sched.run_tick().unwrap();
    assert_eq!(t.state(), MicroThreadState::Suspended);
    assert!(!send.is_canceled());
    t.request_cancellation();
    let report = sched.run_tick().unwrap();
    assert_eq!(report.canceled, vec![t.clone()]);
    assert_eq!(t.state(), MicroThreadState::Canceled);
    assert!(send.is_canceled());
    assert!(sched.is_empty());
  }

  #[test]
  fn removed_and_canceled_waiters_leave_the_gate() {
    let sched = Scheduler::new();
    let gate = SignalGate::new();
    let waiters = (0..100)
      .map(|_| {
        let wait = gate.clone();
        sched.add(0, move |_| async move {
          wait.wait().await?;
          Ok(())
        })
      })
      .collect_vec();
    sched.run_tick().unwrap();
    assert_eq!(gate.waiter_count(), 100);
    for t in &waiters[..50] {
      assert!(sched.remove(t));
    }
    assert_eq!(gate.waiter_count(), 50);
    waiters[50..60].iter().for_each(|t| t.request_cancellation());
    assert_eq!(sched.run_tick().unwrap().canceled.len(), 60);
    assert_eq!(gate.waiter_count(), 40);
    sched.teardown().unwrap();
    assert_eq!(gate.waiter_count(), 0);
    assert_eq!(gate.set(), 0);
    assert!(sched.is_empty());
  }

  #[test]
  fn repolled_next_tick_registers_once() {
    let sched = Scheduler::new();
    let t = sched.add(0, |cx| async move {
      let mut next = pin!(cx.next_tick());
      poll_fn(|ctx| match next.as_mut().poll(ctx) {
        Poll::Ready(r) => Poll::Ready(r),
        Poll::Pending => next.as_mut().poll(ctx),
      })
      .await?;
      Ok(())
    });
    sched.run_tick().unwrap();
    assert_eq!(sched.0.frame_waiters.borrow().len(), 1);
    assert_eq!(sched.run_tick().unwrap().completed, vec![t]);
    assert!(sched.0.frame_waiters.borrow().is_empty());
  }

  #[test]
  fn finished_timeouts_drop_their_timer() {
    let sched = Scheduler::new();
    let t = sched.add(0, |cx| async move {
      cx.timeout(Duration::from_secs(60), cx.next_tick()).await??;
      Ok(())
    });
    sched.run_tick().unwrap();
    assert!(sched.next_deadline().is_some());
    assert_eq!(sched.run_tick().unwrap().completed, vec![t]);
    assert_eq!(sched.next_deadline(), None);
  }
}
