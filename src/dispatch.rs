//! The continuation dispatcher: every [std::task::Waker] handed to a
//! microthread body routes here, and instead of running anything it reports
//! the microthread as ready to its scheduler. The operation that triggered
//! the wakeup may complete on any thread; the body itself only ever resumes
//! inside [crate::scheduler::Scheduler::run_tick].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::task::ArcWake;
use tracing::debug;

use crate::error::Canceled;
use crate::microthread::MicroThreadId;
use crate::utils::cancel_flag::CancelFlag;

/// Readiness notifications posted from any thread. The scheduler drains it
/// between resumptions.
#[derive(Debug, Default)]
pub(crate) struct Inbox(Mutex<VecDeque<MicroThreadId>>);
impl Inbox {
  fn lock(&self) -> MutexGuard<'_, VecDeque<MicroThreadId>> {
    self.0.lock().unwrap_or_else(PoisonError::into_inner)
  }
  fn push(&self, id: MicroThreadId) { self.lock().push_back(id) }
  pub fn drain(&self) -> Vec<MicroThreadId> { self.lock().drain(..).collect() }
  pub fn len(&self) -> usize { self.lock().len() }
}

/// Per-microthread adapter between the waker protocol and the scheduler
pub struct ContinuationDispatcher {
  id: MicroThreadId,
  inbox: Arc<Inbox>,
  cancel: CancelFlag,
  /// Set from the moment the microthread is posted until it is dequeued, so
  /// that it occupies at most one queue slot
  queued: AtomicBool,
  inline: AtomicBool,
  detached: AtomicBool,
}
impl ContinuationDispatcher {
  pub(crate) fn new(id: MicroThreadId, inbox: Arc<Inbox>) -> Arc<Self> {
    Arc::new(Self {
      id,
      inbox,
      cancel: CancelFlag::new(),
      queued: AtomicBool::new(false),
      inline: AtomicBool::new(false),
      detached: AtomicBool::new(false),
    })
  }

  /// The microthread this dispatcher resumes
  pub fn id(&self) -> MicroThreadId { self.id }

  /// The cancellation flag of the microthread
  pub fn cancel_flag(&self) -> &CancelFlag { &self.cancel }

  /// Whether the microthread has reached a terminal state
  pub fn is_detached(&self) -> bool { self.detached.load(Ordering::Acquire) }

  /// Report the microthread as ready. It is resumed the next time the
  /// scheduler drains its queues, which may still be in the current tick.
  /// Can be called from any thread.
  pub fn post(&self) {
    if self.is_detached() {
      debug!(microthread = %self.id, "ignoring resumption of a finished microthread");
      return;
    }
    if !self.queued.swap(true, Ordering::AcqRel) {
      self.inbox.push(self.id)
    }
  }

  /// Resume synchronously if called from within this microthread's own
  /// resumption, in which case the body is polled again as soon as the
  /// current poll returns. From anywhere else this is the same as
  /// [ContinuationDispatcher::post].
  pub fn send(&self) {
    if is_resuming(self.id) {
      self.inline.store(true, Ordering::Release)
    } else {
      self.post()
    }
  }

  /// Mark as queued without going through the inbox. Returns false if it was
  /// already queued.
  pub(crate) fn mark_queued(&self) -> bool { !self.queued.swap(true, Ordering::AcqRel) }
  pub(crate) fn dequeued(&self) { self.queued.store(false, Ordering::Release) }
  pub(crate) fn take_inline(&self) -> bool { self.inline.swap(false, Ordering::AcqRel) }
  pub(crate) fn detach(&self) { self.detached.store(true, Ordering::Release) }
}
impl ArcWake for ContinuationDispatcher {
  fn wake_by_ref(arc_self: &Arc<Self>) { arc_self.post() }
}
impl fmt::Debug for ContinuationDispatcher {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ContinuationDispatcher")
      .field("id", &self.id)
      .field("queued", &self.queued.load(Ordering::Relaxed))
      .field("detached", &self.is_detached())
      .finish_non_exhaustive()
  }
}

thread_local! {
  static RESUMING: RefCell<Option<Arc<ContinuationDispatcher>>> = const { RefCell::new(None) };
}

/// Marks the current thread as resuming a microthread until dropped
pub(crate) struct ResumeGuard(Option<Arc<ContinuationDispatcher>>);
impl Drop for ResumeGuard {
  fn drop(&mut self) {
    let prev = self.0.take();
    RESUMING.with(|r| *r.borrow_mut() = prev)
  }
}

pub(crate) fn enter(dispatcher: &Arc<ContinuationDispatcher>) -> ResumeGuard {
  ResumeGuard(RESUMING.with(|r| r.replace(Some(dispatcher.clone()))))
}

/// The dispatcher of the microthread being resumed on this thread, if any
pub fn current() -> Option<Arc<ContinuationDispatcher>> { RESUMING.with(|r| r.borrow().clone()) }

fn is_resuming(id: MicroThreadId) -> bool {
  RESUMING.with(|r| r.borrow().as_ref().is_some_and(|d| d.id == id))
}

/// Fail if the microthread being resumed on this thread was asked to cancel.
/// Outside of a resumption this always succeeds.
pub(crate) fn check_cancellation() -> Result<(), Canceled> {
  match current() {
    Some(d) if d.cancel.is_cancelled() => Err(Canceled),
    _ => Ok(()),
  }
}
