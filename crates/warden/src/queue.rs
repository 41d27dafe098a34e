//! Rate-limited work queue keyed by `namespace/name`.
//!
//! Semantics of the classic controller work queue: adding a key that is
//! already pending is a no-op, and a key currently being processed is
//! never handed to a second worker — re-adds during processing are
//! deferred until [`RateLimitedQueue::done`]. Failed keys re-enter
//! through [`RateLimitedQueue::add_rate_limited`] with per-key
//! exponential backoff.

use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::trace;

/// Base delay of the per-key exponential backoff.
const BASE_DELAY: Duration = Duration::from_millis(5);

/// Backoff ceiling.
const MAX_DELAY: Duration = Duration::from_secs(1000);

#[derive(Default)]
struct Inner {
    queue: VecDeque<String>,
    /// Keys waiting in `queue` or deferred behind `processing`.
    dirty: HashSet<String>,
    /// Keys currently held by a worker.
    processing: HashSet<String>,
    /// Consecutive rate-limited requeues per key.
    failures: HashMap<String, u32>,
}

/// Shared work queue. Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct RateLimitedQueue {
    inner: Arc<Shared>,
}

struct Shared {
    state: Mutex<Inner>,
    notify: Notify,
    shutting_down: AtomicBool,
}

impl RateLimitedQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Shared {
                state: Mutex::new(Inner::default()),
                notify: Notify::new(),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue a key. Deduplicates against pending work; defers behind an
    /// in-flight worker holding the same key.
    pub fn add(&self, key: &str) {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.lock();
        if state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if !state.processing.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Enqueue a key after a delay.
    pub fn add_after(&self, key: &str, delay: Duration) {
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Record a failure for the key and re-enqueue it with exponential
    /// backoff.
    pub fn add_rate_limited(&self, key: &str) {
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            *failures += 1;
            backoff_delay(*failures)
        };
        trace!(key = %key, delay_ms = delay.as_millis() as u64, "Requeueing rate limited");
        self.add_after(key, delay);
    }

    /// Clear the failure history of a key.
    pub fn forget(&self, key: &str) {
        self.lock().failures.remove(key);
    }

    /// How many rate-limited requeues the key has accumulated.
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Next key to process, or `None` once the queue is shut down and
    /// drained. The returned key is held exclusively until
    /// [`RateLimitedQueue::done`].
    pub async fn next(&self) -> Option<String> {
        loop {
            let mut notified = pin!(self.inner.notify.notified());
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if self.inner.shutting_down.load(Ordering::SeqCst) {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release a key after processing; re-enqueues it if adds arrived in
    /// the meantime.
    pub fn done(&self, key: &str) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !self.inner.shutting_down.load(Ordering::SeqCst) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stop handing out work. Pending keys are dropped; waiting workers
    /// unblock with `None`.
    pub fn shut_down(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.lock().queue.clear();
        self.inner.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Mutex poisoning only happens if a holder panicked; the queue
        // state stays coherent either way.
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for RateLimitedQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(32);
    let delay = BASE_DELAY.saturating_mul(2u32.saturating_pow(exp));
    delay.min(MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_deduplicates_pending_keys() {
        let queue = RateLimitedQueue::new();
        queue.add("ns/a");
        queue.add("ns/a");
        queue.add("ns/b");

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.next().await.as_deref(), Some("ns/a"));
        assert_eq!(queue.next().await.as_deref(), Some("ns/b"));
    }

    #[tokio::test]
    async fn readd_during_processing_is_deferred() {
        let queue = RateLimitedQueue::new();
        queue.add("ns/a");

        let key = queue.next().await.unwrap();
        // Same key arrives while a worker holds it.
        queue.add("ns/a");
        assert_eq!(queue.len(), 0);

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next().await.as_deref(), Some("ns/a"));
    }

    #[tokio::test]
    async fn rate_limited_requeues_are_counted_and_forgotten() {
        let queue = RateLimitedQueue::new();
        assert_eq!(queue.num_requeues("ns/a"), 0);

        queue.add_rate_limited("ns/a");
        queue.add_rate_limited("ns/a");
        assert_eq!(queue.num_requeues("ns/a"), 2);

        queue.forget("ns/a");
        assert_eq!(queue.num_requeues("ns/a"), 0);
    }

    #[tokio::test]
    async fn rate_limited_key_eventually_arrives() {
        let queue = RateLimitedQueue::new();
        queue.add_rate_limited("ns/a");
        let key = tokio::time::timeout(Duration::from_secs(5), queue.next())
            .await
            .expect("key should arrive within backoff");
        assert_eq!(key.as_deref(), Some("ns/a"));
    }

    #[tokio::test]
    async fn shutdown_unblocks_waiting_workers() {
        let queue = RateLimitedQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;
        queue.shut_down();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn shutdown_drops_pending_keys() {
        let queue = RateLimitedQueue::new();
        queue.add("ns/a");
        queue.shut_down();
        assert_eq!(queue.next().await, None);
        queue.add("ns/b");
        assert_eq!(queue.next().await, None);
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(5));
        assert_eq!(backoff_delay(2), Duration::from_millis(10));
        assert_eq!(backoff_delay(4), Duration::from_millis(40));
        assert_eq!(backoff_delay(40), MAX_DELAY);
    }
}
