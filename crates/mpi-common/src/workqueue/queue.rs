//! De-duplicating work queue
//!
//! An item is queued at most once no matter how often it is added, and is
//! never handed to two workers at the same time: an item added while a
//! worker holds it is parked and re-queued when that worker calls
//! [`WorkQueue::done`].

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use super::rate_limiter::RateLimiter;

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter<K>>,
}

/// Rate-limited queue of keys awaiting reconciliation
///
/// Clones share the same queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> fmt::Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("WorkQueue")
            .field("queued", &state.queue.len())
            .field("processing", &state.processing.len())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Create an empty queue using `rate_limiter` for requeue delays
    pub fn new(rate_limiter: Box<dyn RateLimiter<K>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                rate_limiter,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<K>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `item` unless it is already queued; ignored after shutdown
    pub fn add(&self, item: K) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Wait for the next item
    ///
    /// Returns `None` once the queue is shut down and drained. The caller
    /// must call [`done`](Self::done) when finished with the item.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.state();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        // Pass the wakeup on so idle workers pick up the rest
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

    /// Finish processing `item`; re-queues it if it was added meanwhile
    pub fn done(&self, item: &K) {
        let mut state = self.state();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Queue `item` after `delay`
    pub fn add_after(&self, item: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Queue `item` once the rate limiter allows it
    pub fn add_rate_limited(&self, item: K) {
        let delay = self.inner.rate_limiter.when(&item);
        self.add_after(item, delay);
    }

    /// Clear the rate limiter's history for `item`
    pub fn forget(&self, item: &K) {
        self.inner.rate_limiter.forget(item);
    }

    /// Rate-limited requeues of `item` since it was last forgotten
    pub fn num_requeues(&self, item: &K) -> u32 {
        self.inner.rate_limiter.num_requeues(item)
    }

    /// Items waiting to be processed
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    /// Returns true if no item is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting items and wake all waiting workers
    pub fn shutdown(&self) {
        self.state().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    /// Returns true once [`shutdown`](Self::shutdown) was called
    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workqueue::rate_limiter::ItemExponentialFailureRateLimiter;

    fn queue() -> WorkQueue<String> {
        WorkQueue::new(Box::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )))
    }

    #[tokio::test]
    async fn duplicate_adds_are_collapsed() {
        let queue = queue();
        queue.add("ns/a".to_string());
        queue.add("ns/a".to_string());
        queue.add("ns/b".to_string());

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
        assert_eq!(queue.get().await.as_deref(), Some("ns/b"));
    }

    #[tokio::test]
    async fn item_added_while_processing_is_requeued_on_done() {
        let queue = queue();
        queue.add("ns/a".to_string());
        let item = queue.get().await.unwrap();

        queue.add(item.clone());
        assert!(queue.is_empty(), "held item must not be handed out twice");

        queue.done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(item));
    }

    #[tokio::test]
    async fn shutdown_drains_then_returns_none() {
        let queue = queue();
        queue.add("ns/a".to_string());
        queue.shutdown();
        queue.add("ns/b".to_string());

        assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn shutdown_wakes_idle_workers() {
        let queue = queue();
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.get().await })
            })
            .collect();

        tokio::task::yield_now().await;
        queue.shutdown();
        for worker in workers {
            assert_eq!(worker.await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn waiting_worker_receives_added_item() {
        let queue = queue();
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.add("ns/a".to_string());
        assert_eq!(worker.await.unwrap().as_deref(), Some("ns/a"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_add_waits_for_backoff() {
        let queue = queue();
        let item = "ns/a".to_string();

        queue.add_rate_limited(item.clone());
        queue.add_rate_limited(item.clone());
        assert_eq!(queue.num_requeues(&item), 2);
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_millis(6)).await;
        assert_eq!(queue.len(), 1);

        queue.forget(&item);
        assert_eq!(queue.num_requeues(&item), 0);
    }
}
