use std::cmp::Ordering;
use std::collections::BinaryHeap;

use hashbrown::HashMap;

use crate::microthread::{MicroThreadId, Priority};

/// Position in the ready queue. `seq` breaks ties among equal priorities.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct Key {
  pub priority: Priority,
  pub seq: i64,
}

/// In order to work with Rust's builtin [BinaryHeap] which is a max heap, the
/// [Ord] implementation of this struct is reversed; it can be intuitively
/// thought of as ordering by urgency.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Entry {
  key: Key,
  id: MicroThreadId,
}
impl PartialOrd for Entry {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}
impl Ord for Entry {
  fn cmp(&self, other: &Self) -> Ordering {
    (other.key.priority, other.key.seq).cmp(&(self.key.priority, self.key.seq))
  }
}

/// Priority-ordered multiset of microthreads eligible to run.
///
/// Re-prioritized and removed entries are left in the heap and skipped when
/// they surface; `live` holds the one valid key per queued microthread.
#[derive(Debug, Default)]
pub(super) struct ReadyQueue {
  heap: BinaryHeap<Entry>,
  live: HashMap<MicroThreadId, Key>,
}
impl ReadyQueue {
  pub fn push(&mut self, id: MicroThreadId, key: Key) {
    self.live.insert(id, key);
    self.heap.push(Entry { key, id });
  }

  /// Move a queued microthread to its new priority, keeping its sequence
  /// number. Returns false if it isn't queued.
  pub fn reprioritize(&mut self, id: MicroThreadId, priority: Priority) -> bool {
    let Some(key) = self.live.get_mut(&id) else { return false };
    if key.priority != priority {
      key.priority = priority;
      self.heap.push(Entry { key: *key, id });
    }
    true
  }

  pub fn remove(&mut self, id: MicroThreadId) -> bool { self.live.remove(&id).is_some() }

  pub fn pop(&mut self) -> Option<MicroThreadId> {
    while let Some(Entry { key, id }) = self.heap.pop() {
      if self.live.get(&id) == Some(&key) {
        self.live.remove(&id);
        return Some(id);
      }
    }
    None
  }

  pub fn len(&self) -> usize { self.live.len() }
  pub fn is_empty(&self) -> bool { self.live.is_empty() }

  pub fn clear(&mut self) {
    self.heap.clear();
    self.live.clear();
  }
}
