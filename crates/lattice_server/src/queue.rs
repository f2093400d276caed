//! Wake-aware FIFO shared by the background workers.
//!
//! Consumers poll with a timeout so `stop_requested` is observed within
//! one wake period even when the queue stays empty. Producers (and the
//! shutdown path) can cut a poll short through the internal notifier.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

pub struct TaskQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

impl<T> TaskQueue<T> {
    pub fn push(&self, item: T) {
        self.items.lock().expect("task queue").push_back(item);
        self.notify.notify_one();
    }

    /// Pop the oldest entry, waiting up to `timeout` for one to arrive.
    pub async fn poll(&self, timeout: Duration) -> Option<T> {
        if let Some(item) = self.items.lock().expect("task queue").pop_front() {
            return Some(item);
        }
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
        self.items.lock().expect("task queue").pop_front()
    }

    /// Wake a pending poll without enqueueing anything.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    pub fn clear(&self) {
        self.items.lock().expect("task queue").clear();
    }

    pub fn retain(&self, keep: impl FnMut(&T) -> bool) {
        self.items.lock().expect("task queue").retain(keep);
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("task queue").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of the queued entries, oldest first.
    pub fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.items.lock().expect("task queue").iter().cloned().collect()
    }
}
