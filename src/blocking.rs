//! Blocking work handed off to worker threads. The result comes back through
//! the awaiting microthread's continuation dispatcher, so the body resumes in
//! a tick like after any other suspension point.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::FutureExt;

use crate::dispatch::check_cancellation;
use crate::error::{BlockingError, Canceled};
use crate::utils::thread_pool::ThreadPool;

pub(crate) type Job = Box<dyn FnOnce() + Send>;

/// Future returned by `run_blocking`
#[must_use = "futures do nothing unless polled"]
pub struct Blocking<T> {
  recv: Option<oneshot::Receiver<T>>,
}
impl<T> Blocking<T> {
  /// A blocking operation that can never produce a value
  pub(crate) fn abandoned() -> Self { Self { recv: None } }
}
impl<T> Future for Blocking<T> {
  type Output = Result<T, BlockingError>;
  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    check_cancellation()?;
    let Some(recv) = self.recv.as_mut() else { return Poll::Ready(Err(Canceled.into())) };
    recv.poll_unpin(cx).map(|res| res.map_err(|oneshot::Canceled| BlockingError::Panicked))
  }
}

pub(crate) fn submit<T: Send + 'static>(
  pool: &ThreadPool<Job>,
  operation: impl FnOnce() -> T + Send + 'static,
) -> Blocking<T> {
  let (send, recv) = oneshot::channel();
  pool.submit(Box::new(move || {
    // a panic drops the sender, which the receiver reports
    if let Ok(value) = catch_unwind(AssertUnwindSafe(operation)) {
      let _ = send.send(value);
    }
  }));
  Blocking { recv: Some(recv) }
}
