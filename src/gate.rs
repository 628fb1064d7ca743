//! Edge-triggered asynchronous rendezvous between microthreads, or between a
//! microthread and any other thread.

use std::collections::BTreeMap;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use crate::dispatch::check_cancellation;
use crate::error::Canceled;

#[derive(Debug, Default)]
struct GateState {
  generation: u64,
  next_key: u64,
  /// One entry per pending wait, in registration order
  waiters: BTreeMap<u64, Waker>,
}

/// Many producers, any number of consumers. [SignalGate::set] releases every
/// wait created before it; waits created after it block until the next call.
/// A `set` nobody waits for is not remembered.
#[derive(Clone, Debug, Default)]
pub struct SignalGate(Arc<Mutex<GateState>>);
impl SignalGate {
  /// Create a gate no one is waiting on
  pub fn new() -> Self { Self::default() }

  fn lock(&self) -> MutexGuard<'_, GateState> { self.0.lock().unwrap_or_else(PoisonError::into_inner) }

  /// Wait for the next [SignalGate::set]. The wait is bound to the current
  /// generation of the gate at the time of this call.
  pub fn wait(&self) -> GateWait {
    GateWait { gate: self.clone(), generation: self.generation(), key: None }
  }

  /// Release every current waiter and start a new generation. Returns the
  /// number of waits that were released.
  pub fn set(&self) -> usize {
    let waiters = {
      let mut state = self.lock();
      state.generation = state.generation.wrapping_add(1);
      mem::take(&mut state.waiters)
    };
    let count = waiters.len();
    waiters.into_values().for_each(Waker::wake);
    count
  }

  /// Number of times the gate has been set
  pub fn generation(&self) -> u64 { self.lock().generation }

  /// Number of pending waits that were polled at least once
  pub fn waiter_count(&self) -> usize { self.lock().waiters.len() }
}

/// Future returned by [SignalGate::wait]. Fails with [Canceled] if awaited by
/// a microthread whose cancellation was requested. Dropping it withdraws the
/// registration.
#[must_use = "futures do nothing unless polled"]
pub struct GateWait {
  gate: SignalGate,
  generation: u64,
  key: Option<u64>,
}
impl Future for GateWait {
  type Output = Result<(), Canceled>;
  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    if let Err(e) = check_cancellation() {
      return Poll::Ready(Err(e));
    }
    let gate = self.gate.clone();
    let mut state = gate.lock();
    if state.generation != self.generation {
      self.key = None;
      return Poll::Ready(Ok(()));
    }
    let registered = match self.key {
      Some(key) => state.waiters.get_mut(&key),
      None => None,
    };
    match registered {
      Some(waker) => waker.clone_from(cx.waker()),
      None => {
        let key = state.next_key;
        state.next_key += 1;
        state.waiters.insert(key, cx.waker().clone());
        self.key = Some(key);
      },
    }
    Poll::Pending
  }
}
impl Drop for GateWait {
  fn drop(&mut self) {
    let Some(key) = self.key.take() else { return };
    let mut state = self.gate.lock();
    if state.generation == self.generation {
      state.waiters.remove(&key);
    }
  }
}
