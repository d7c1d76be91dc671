// =============================================================================
// Task queues — spec §4.10 (C10)
// =============================================================================
//
// Three dedup-latest queues (buy/sell/monitor) feeding the async task
// processors. Built on the same `parking_lot::Mutex<VecDeque<...>>` plus
// `tokio::sync::Notify`-subscriber idiom the rate limiter uses for its own
// wake-on-availability loop, generalized here to a keyed dedup queue.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// One unit of work. `dedupe_key` identifies the logical task; scheduling a
/// task with the same key as one already queued overwrites it in place
/// rather than appending a duplicate (spec §4.10 `schedule_latest`).
#[derive(Debug, Clone)]
pub struct Task<T> {
    pub dedupe_key: String,
    pub payload: T,
}

struct Inner<T> {
    /// FIFO order of dedupe_keys, oldest first.
    order: Vec<String>,
    /// Latest payload per key.
    payloads: HashMap<String, T>,
}

/// A registration handle. Dropping it, or calling `unregister()` explicitly,
/// removes the subscriber.
pub struct Subscription {
    id: u64,
    subscribers: Arc<Mutex<Vec<(u64, Arc<Notify>)>>>,
}

impl Subscription {
    pub fn unregister(self) {
        // Drop does the work; this just makes the intent explicit at call sites.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscribers.lock().retain(|(id, _)| *id != self.id);
    }
}

/// A dedup-latest task queue, spec §4.10. Generic over the task payload so
/// the same structure backs buy, sell, and monitor queues with distinct
/// payload types.
pub struct TaskQueue<T> {
    inner: Mutex<Inner<T>>,
    subscribers: Arc<Mutex<Vec<(u64, Arc<Notify>)>>>,
    next_subscriber_id: AtomicU64,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { order: Vec::new(), payloads: HashMap::new() }),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_subscriber_id: AtomicU64::new(0),
        }
    }

    /// Enqueue `task`, overwriting any existing task with the same
    /// `dedupe_key` in place (its position in FIFO order is preserved at
    /// its *original* insertion point, matching "retains only the latest
    /// task per key" rather than bumping it to the back).
    pub fn schedule_latest(&self, task: Task<T>) {
        {
            let mut inner = self.inner.lock();
            if !inner.payloads.contains_key(&task.dedupe_key) {
                inner.order.push(task.dedupe_key.clone());
            }
            inner.payloads.insert(task.dedupe_key, task.payload);
        }
        self.notify_subscribers();
    }

    /// Pop the oldest still-queued task, if any.
    pub fn pop(&self) -> Option<Task<T>> {
        let mut inner = self.inner.lock();
        while let Some(key) = inner.order.first().cloned() {
            inner.order.remove(0);
            if let Some(payload) = inner.payloads.remove(&key) {
                return Some(Task { dedupe_key: key, payload });
            }
            // Key was already removed (e.g. by remove_tasks) — keep scanning.
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().payloads.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().payloads.len()
    }

    /// Remove every queued task whose dedupe_key matches `predicate`,
    /// returning how many were removed. Used e.g. to drop stale seat-bound
    /// tasks when a seat clears.
    pub fn remove_tasks(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.payloads.len();
        let removed_keys: Vec<String> = inner.order.iter().filter(|k| predicate(k)).cloned().collect();
        for key in &removed_keys {
            inner.payloads.remove(key);
        }
        inner.order.retain(|k| !removed_keys.contains(k));
        before - inner.payloads.len()
    }

    pub fn clear_all(&self) {
        let mut inner = self.inner.lock();
        inner.order.clear();
        inner.payloads.clear();
    }

    /// Register a subscriber, notified (best-effort, may coalesce multiple
    /// inserts into one wakeup) whenever a task is scheduled.
    pub fn subscribe(&self) -> (Arc<Notify>, Subscription) {
        let notify = Arc::new(Notify::new());
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().push((id, notify.clone()));
        (notify, Subscription { id, subscribers: self.subscribers.clone() })
    }

    fn notify_subscribers(&self) {
        for (_, notify) in self.subscribers.lock().iter() {
            notify.notify_one();
        }
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn schedule_latest_overwrites_same_key_in_place() {
        let q: TaskQueue<i32> = TaskQueue::new();
        q.schedule_latest(Task { dedupe_key: "a".into(), payload: 1 });
        q.schedule_latest(Task { dedupe_key: "b".into(), payload: 2 });
        q.schedule_latest(Task { dedupe_key: "a".into(), payload: 99 });

        // "a" keeps its original FIFO position but has the latest payload.
        let first = q.pop().unwrap();
        assert_eq!(first.dedupe_key, "a");
        assert_eq!(first.payload, 99);

        let second = q.pop().unwrap();
        assert_eq!(second.dedupe_key, "b");
        assert!(q.pop().is_none());
    }

    #[test]
    fn remove_tasks_by_predicate() {
        let q: TaskQueue<i32> = TaskQueue::new();
        q.schedule_latest(Task { dedupe_key: "buy:HSI:LONG".into(), payload: 1 });
        q.schedule_latest(Task { dedupe_key: "buy:HSI:SHORT".into(), payload: 2 });
        q.schedule_latest(Task { dedupe_key: "sell:HSI:LONG".into(), payload: 3 });

        let removed = q.remove_tasks(|k| k.starts_with("buy:"));
        assert_eq!(removed, 2);
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop().unwrap().dedupe_key, "sell:HSI:LONG");
    }

    #[test]
    fn clear_all_empties_the_queue() {
        let q: TaskQueue<i32> = TaskQueue::new();
        q.schedule_latest(Task { dedupe_key: "a".into(), payload: 1 });
        q.clear_all();
        assert!(q.is_empty());
        assert!(q.pop().is_none());
    }

    #[tokio::test]
    async fn subscriber_is_notified_on_insert() {
        let q: TaskQueue<i32> = TaskQueue::new();
        let (notify, _sub) = q.subscribe();
        q.schedule_latest(Task { dedupe_key: "a".into(), payload: 1 });

        tokio::time::timeout(Duration::from_millis(100), notify.notified())
            .await
            .expect("subscriber should be woken on schedule_latest");
    }

    #[test]
    fn unregister_drops_subscription() {
        let q: TaskQueue<i32> = TaskQueue::new();
        let (_notify, sub) = q.subscribe();
        assert_eq!(q.subscribers.lock().len(), 1);
        sub.unregister();
        assert_eq!(q.subscribers.lock().len(), 0);
    }
}
