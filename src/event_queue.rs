//! A generic bounded-by-the-caller FIFO of telemetry messages.
//!
//! The queue itself never blocks and never enforces a capacity; the owning component decides when
//! a push must be rejected. Under sustained overload the owner runs a [`EventQueue::prune`] pass
//! that thins the backlog statistically instead of deterministically dropping the oldest or
//! newest items, spreading loss evenly across the stream.
use std::collections::VecDeque;
use std::sync::Mutex;

use rand::Rng;

/// A queued message together with its survival probability.
///
/// The survival probability starts at 1 and is multiplied down by every prune pass the message
/// lives through. It only ever shrinks.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry<T> {
    /// The queued payload.
    pub item: T,
    /// Probability that a message enqueued at the same time is still present.
    pub survival_probability: f64,
}

/// Thread-safe FIFO protected by a single mutex. Locks are held only for the duration of the
/// queue operation itself, never across I/O.
#[derive(Debug, Default)]
pub struct EventQueue<T> {
    queue: Mutex<VecDeque<QueueEntry<T>>>,
}

impl<T> EventQueue<T> {
    /// Create a new empty queue.
    pub fn new() -> EventQueue<T> {
        EventQueue {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Append an item with a fresh survival probability of 1.
    pub fn push(&self, item: T) {
        let mut queue = self
            .queue
            .lock()
            .expect("thread holding queue lock should not panic");
        queue.push_back(QueueEntry {
            item,
            survival_probability: 1.0,
        });
    }

    /// Put an entry back at the front of the queue, preserving its survival probability.
    ///
    /// Used by the batcher to defer an item that would overflow the current batch.
    pub fn push_front(&self, entry: QueueEntry<T>) {
        let mut queue = self
            .queue
            .lock()
            .expect("thread holding queue lock should not panic");
        queue.push_front(entry);
    }

    /// Pop the oldest entry.
    pub fn pop(&self) -> Option<QueueEntry<T>> {
        let mut queue = self
            .queue
            .lock()
            .expect("thread holding queue lock should not panic");
        queue.pop_front()
    }

    /// Approximate number of queued entries. The value may be stale by the time the caller acts
    /// on it.
    pub fn len(&self) -> usize {
        let queue = self
            .queue
            .lock()
            .expect("thread holding queue lock should not panic");
        queue.len()
    }

    /// Returns whether the queue is empty. Approximate, like [`EventQueue::len`].
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run one statistical pruning pass over the backlog.
    ///
    /// Every entry independently survives with `pass_probability`; survivors get their survival
    /// probability multiplied by the same factor. A pass probability of 1 (the default overload
    /// policy) removes nothing. Returns the number of removed entries.
    pub fn prune(&self, pass_probability: f64) -> usize {
        if pass_probability >= 1.0 {
            return 0;
        }
        let pass_probability = pass_probability.max(0.0);

        let mut rng = rand::thread_rng();
        let mut removed = 0;

        let mut queue = self
            .queue
            .lock()
            .expect("thread holding queue lock should not panic");
        queue.retain_mut(|entry| {
            if rng.gen::<f64>() < pass_probability {
                entry.survival_probability *= pass_probability;
                true
            } else {
                removed += 1;
                false
            }
        });

        removed
    }
}
