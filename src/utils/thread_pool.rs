//! Worker threads for blocking operations

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use tracing::error;

/// A job dispatched on a [ThreadPool]. The job owns all relevant data, is safe
/// to pass between threads and is executed only once.
pub trait Task: Send + 'static {
  /// Execute the job on the current worker
  fn run(self);
}

impl<F: FnOnce() + Send + 'static> Task for F {
  fn run(self) { self() }
}

enum Message<T: Task> {
  Stop,
  Task(T),
}

struct ThreadPoolData<T: Task> {
  rdv_point: Mutex<Option<SyncSender<Message<T>>>>,
  stopping: AtomicBool,
}
impl<T: Task> ThreadPoolData<T> {
  fn standby(&self) -> MutexGuard<'_, Option<SyncSender<Message<T>>>> {
    self.rdv_point.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// A thread pool that runs blocking operations on behalf of microthreads so
/// the frame loop never waits on them.
///
/// If multiple threads finish their jobs, one waiting thread is kept, the
/// rest exit. If all threads are busy, new threads are spawned when jobs
/// arrive. To get rid of the last waiting thread, drop the thread pool.
pub struct ThreadPool<T: Task> {
  data: Arc<ThreadPoolData<T>>,
}
impl<T: Task> ThreadPool<T> {
  /// Create a new thread pool. This just initializes the threadsafe
  /// datastructures used to synchronize jobs and doesn't spawn any threads.
  /// The first submission spawns the first thread.
  pub fn new() -> Self {
    Self {
      data: Arc::new(ThreadPoolData {
        rdv_point: Mutex::new(None),
        stopping: AtomicBool::new(false),
      }),
    }
  }

  /// Submit a job to the thread pool. This tries to hand the job to the
  /// waiting thread, or spawn a new one.
  pub fn submit(&self, task: T) {
    let task = match self.data.standby().take() {
      Some(port) => match port.try_send(Message::Task(task)) {
        Ok(()) => return,
        // the standby thread is gone, fall back to a fresh one
        Err(TrySendError::Full(msg) | TrySendError::Disconnected(msg)) => match msg {
          Message::Task(task) => task,
          Message::Stop => return,
        },
      },
      None => task,
    };
    let data = self.data.clone();
    let spawned = thread::Builder::new().name("microthread-worker".to_string()).spawn(move || {
      let mut cur_task = task;
      loop {
        cur_task.run();
        // Apply for a new job if no other thread is doing so already
        let mut standby_spot = data.standby();
        if standby_spot.is_some() {
          return;
        }
        let (sender, receiver) = sync_channel(1);
        *standby_spot = Some(sender);
        drop(standby_spot);
        if data.stopping.load(Ordering::SeqCst) {
          return;
        }
        match receiver.recv() {
          Ok(Message::Task(task)) => cur_task = task,
          Ok(Message::Stop) | Err(_) => return,
        }
      }
    });
    if let Err(e) = spawned {
      error!(error = %e, "failed to spawn a worker thread, the job was dropped");
    }
  }
}

impl<T: Task> Default for ThreadPool<T> {
  fn default() -> Self { Self::new() }
}

impl<T: Task> Drop for ThreadPool<T> {
  fn drop(&mut self) {
    self.data.stopping.store(true, Ordering::SeqCst);
    if let Some(pending) = self.data.standby().take() {
      // a full or disconnected channel means the thread is already leaving
      let _ = pending.try_send(Message::Stop);
    }
  }
}
