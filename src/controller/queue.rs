//! Deduplicating work queue with per-key retry backoff
//!
//! A key is held at most once in the queue and is never handed to two
//! workers at the same time. A key added while it is being processed is
//! marked dirty and requeued when the worker calls [`WorkQueue::done`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use crate::retry::RetryConfig;

struct QueueState<T> {
    queue: VecDeque<T>,
    /// Keys waiting to be processed (queued, or re-added while in flight)
    dirty: HashSet<T>,
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

struct Inner<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    retry: RetryConfig,
}

/// Cloneable handle to a shared work queue
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + std::fmt::Debug + 'static,
{
    /// Create an empty queue whose rate-limited adds back off per `retry`
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                retry,
            }),
        }
    }

    /// Mark a key as needing processing
    ///
    /// No-op when the key is already waiting or the queue is shutting down.
    pub fn add(&self, item: T) {
        let mut state = self.inner.state.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            trace!(?item, "key in flight, deferring");
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Re-add a key after a backoff derived from its failure count
    pub fn add_rate_limited(&self, item: T) {
        let failures = {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            let count = state.failures.entry(item.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let delay = self.inner.retry.delay(failures);
        trace!(?item, failures, ?delay, "requeueing with backoff");
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Number of rate-limited re-adds recorded for a key
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.inner
            .state
            .lock()
            .failures
            .get(item)
            .copied()
            .unwrap_or(0)
    }

    /// Whether a key has used up its retry budget
    pub fn is_exhausted(&self, item: &T) -> bool {
        self.inner.retry.is_exhausted(self.num_requeues(item))
    }

    /// Clear the failure history of a key
    pub fn forget(&self, item: &T) {
        self.inner.state.lock().failures.remove(item);
    }

    /// Wait for the next key
    ///
    /// Returns `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    // Let another waiter observe remaining work
                    if !state.queue.is_empty() {
                        self.inner.notify.notify_one();
                    }
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Finish processing a key, requeueing it if it was re-added meanwhile
    pub fn done(&self, item: &T) {
        let mut state = self.inner.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stop accepting keys and wake every waiting worker
    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    /// Whether [`shut_down`](Self::shut_down) has been called
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Whether no keys are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn queue() -> WorkQueue<String> {
        WorkQueue::new(RetryConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            ..RetryConfig::with_max_attempts(3)
        })
    }

    async fn next(q: &WorkQueue<String>) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(1), q.get())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let q = queue();
        q.add("ns1/pvc1".to_string());
        q.add("ns1/pvc1".to_string());
        q.add("ns1/pvc2".to_string());
        assert_eq!(q.len(), 2);

        assert_eq!(next(&q).await.as_deref(), Some("ns1/pvc1"));
        assert_eq!(next(&q).await.as_deref(), Some("ns1/pvc2"));
        assert!(q.is_empty());
    }

    /// Story: a key re-added while a worker holds it is processed again
    /// afterwards, never concurrently
    #[tokio::test]
    async fn story_in_flight_key_is_deferred_until_done() {
        let q = queue();
        let key = "ns1/pvc1".to_string();
        q.add(key.clone());
        let held = next(&q).await.unwrap();

        q.add(key.clone());
        assert!(q.is_empty(), "in-flight key must not be handed out again");

        q.done(&held);
        assert_eq!(next(&q).await, Some(key.clone()));
        q.done(&key);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn rate_limited_adds_count_failures_until_forgotten() {
        let q = queue();
        let key = "ns1/pvc1".to_string();

        q.add_rate_limited(key.clone());
        assert_eq!(q.num_requeues(&key), 1);
        assert_eq!(next(&q).await, Some(key.clone()));
        q.done(&key);

        q.add_rate_limited(key.clone());
        q.add_rate_limited(key.clone());
        assert_eq!(q.num_requeues(&key), 3);
        assert!(q.is_exhausted(&key));

        q.forget(&key);
        assert_eq!(q.num_requeues(&key), 0);
        assert!(!q.is_exhausted(&key));
    }

    #[tokio::test]
    async fn shutdown_drains_then_stops_workers() {
        let q = queue();
        q.add("ns1/pvc1".to_string());
        q.shut_down();
        q.add("ns1/pvc2".to_string());

        assert_eq!(next(&q).await.as_deref(), Some("ns1/pvc1"));
        assert_eq!(q.get().await, None);
        assert!(q.is_shutting_down());
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_workers() {
        let q = queue();
        let worker = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shut_down();

        let got = tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker should wake")
            .unwrap();
        assert_eq!(got, None);
    }
}
