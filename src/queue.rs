//! A deduplicating, delay-capable work queue (spec §4.1).
//!
//! Mirrors the classic "dirty/processing" work-queue algorithm, generalized
//! to arbitrary `Eq + Hash + Clone` items (here, [`ScopedKey`](crate::object::ScopedKey)s)
//! and combined with [`tokio_util::time::DelayQueue`] for `add_after`, the
//! same primitive `kube-runtime`'s [`Scheduler`] builds its dedup on.
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::time::{delay_queue, DelayQueue};

/// Computes the re-add delay for an item given how many times it has failed
/// consecutively (via [`WorkQueue::add_rate_limited`]) since its last
/// [`WorkQueue::forget`].
pub trait RateLimiter<T>: Send + Sync {
    fn delay(&self, item: &T, failures: u32) -> Duration;
}

/// Exponential backoff: `base * 2^failures`, capped at `max`.
pub struct ExponentialRateLimiter {
    pub base: Duration,
    pub max: Duration,
}

impl Default for ExponentialRateLimiter {
    fn default() -> Self {
        // spec §7: 1s initial, 30s cap, factor 2.
        ExponentialRateLimiter {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl<T> RateLimiter<T> for ExponentialRateLimiter {
    fn delay(&self, _item: &T, failures: u32) -> Duration {
        let exp = failures.min(30);
        let scaled = self.base.as_secs_f64() * 2f64.powi(exp as i32);
        Duration::from_secs_f64(scaled.min(self.max.as_secs_f64()))
    }
}

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
    failures: HashMap<T, u32>,
}

enum DelayCmd<T> {
    Schedule(T, Duration),
}

struct Shared<T: Eq + Hash + Clone + Send + 'static> {
    state: Mutex<State<T>>,
    notify: Notify,
    delay_tx: mpsc::UnboundedSender<DelayCmd<T>>,
    rate_limiter: Box<dyn RateLimiter<T>>,
}

impl<T: Eq + Hash + Clone + Send + 'static> Shared<T> {
    fn add_now(&self, item: T) {
        let mut state = self.state.lock();
        if state.shutting_down {
            return;
        }
        if !state.dirty.insert(item.clone()) {
            return;
        }
        if state.processing.contains(&item) {
            // will be re-queued on `done`
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.notify.notify_one();
    }
}

/// A deduplicating FIFO with delayed re-add and per-item rate limiting.
///
/// Cloning a [`WorkQueue`] shares the same underlying queue (it is a thin
/// `Arc` handle), matching how a `Controller` and its `Source`s share one
/// queue.
pub struct WorkQueue<T: Eq + Hash + Clone + Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Eq + Hash + Clone + Send + 'static> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        WorkQueue {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Eq + Hash + Clone + Send + 'static> WorkQueue<T> {
    pub fn new() -> Self {
        Self::with_rate_limiter(Box::new(ExponentialRateLimiter::default()))
    }

    pub fn with_rate_limiter(rate_limiter: Box<dyn RateLimiter<T>>) -> Self {
        let (delay_tx, delay_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
                failures: HashMap::new(),
            }),
            notify: Notify::new(),
            delay_tx,
            rate_limiter,
        });
        tokio::spawn(run_delay_loop(delay_rx, shared.clone()));
        WorkQueue { shared }
    }

    /// Adds `item` if it is not already pending; if a worker currently holds
    /// it, marks it dirty so it is re-enqueued on [`done`](Self::done).
    pub fn add(&self, item: T) {
        self.shared.add_now(item);
    }

    /// Schedules an `add` after `delay`. Multiple calls for the same item
    /// coalesce to the earliest deadline.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let _ = self.shared.delay_tx.send(DelayCmd::Schedule(item, delay));
    }

    /// Computes a backoff from the item's consecutive-failure count and calls
    /// [`add_after`](Self::add_after).
    pub fn add_rate_limited(&self, item: T) {
        let failures = {
            let mut state = self.shared.state.lock();
            let count = state.failures.entry(item.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let delay = self.shared.rate_limiter.delay(&item, failures);
        self.add_after(item, delay);
    }

    /// Resets the per-item failure counter used by [`add_rate_limited`](Self::add_rate_limited).
    pub fn forget(&self, item: &T) {
        self.shared.state.lock().failures.remove(item);
    }

    /// Blocks until an item is ready or the queue is shutting down and empty.
    pub async fn get(&self) -> Option<T> {
        loop {
            {
                let mut state = self.shared.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.processing.insert(item.clone());
                    state.dirty.remove(&item);
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Releases the processing claim on `item`; if it was re-[`add`](Self::add)ed
    /// while being processed, re-enqueues it immediately.
    pub fn done(&self, item: &T) {
        let mut state = self.shared.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    /// Causes all blocked [`get`](Self::get) calls to return `None` once the
    /// queue drains.
    pub fn shut_down(&self) {
        let mut state = self.shared.state.lock();
        state.shutting_down = true;
        drop(state);
        self.shared.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Eq + Hash + Clone + Send + 'static> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_delay_loop<T: Eq + Hash + Clone + Send + 'static>(
    mut rx: mpsc::UnboundedReceiver<DelayCmd<T>>,
    shared: Arc<Shared<T>>,
) {
    let mut dq: DelayQueue<T> = DelayQueue::new();
    let mut keys: HashMap<T, delay_queue::Key> = HashMap::new();
    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(DelayCmd::Schedule(item, delay)) => {
                        if let Some(key) = keys.get(&item) {
                            let now_deadline = dq.deadline(key);
                            let new_deadline = tokio::time::Instant::now() + delay;
                            if new_deadline < now_deadline {
                                dq.reset(key, delay);
                            }
                        } else {
                            let key = dq.insert(item.clone(), delay);
                            keys.insert(item, key);
                        }
                    }
                    None => break,
                }
            }
            Some(expired) = dq.next(), if !dq.is_empty() => {
                let item = expired.into_inner();
                keys.remove(&item);
                shared.add_now(item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dedup_while_processing() {
        let q: WorkQueue<&'static str> = WorkQueue::new();
        q.add("a");
        let got = q.get().await.unwrap();
        assert_eq!(got, "a");
        // re-add while processing: should not appear in queue until done()
        q.add("a");
        assert_eq!(q.len(), 0);
        q.done(&got);
        assert_eq!(q.len(), 1);
        let got2 = q.get().await.unwrap();
        assert_eq!(got2, "a");
        q.done(&got2);
        assert_eq!(q.len(), 0);
    }

    #[tokio::test]
    async fn add_before_get_is_single_delivery() {
        let q: WorkQueue<&'static str> = WorkQueue::new();
        q.add("x");
        q.add("x");
        q.add("x");
        assert_eq!(q.len(), 1);
        let got = q.get().await.unwrap();
        q.done(&got);
        assert_eq!(q.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_delivers_no_earlier_than_delay() {
        let q: WorkQueue<&'static str> = WorkQueue::new();
        q.add_after("y", Duration::from_millis(500));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(q.len(), 0);
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(q.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_coalesces_to_earliest() {
        let q: WorkQueue<&'static str> = WorkQueue::new();
        q.add_after("z", Duration::from_secs(10));
        q.add_after("z", Duration::from_millis(200));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn rate_limited_backoff_is_monotonic_and_capped() {
        let limiter = ExponentialRateLimiter {
            base: Duration::from_millis(1),
            max: Duration::from_millis(8),
        };
        let d0 = RateLimiter::<&str>::delay(&limiter, &"k", 1);
        let d1 = RateLimiter::<&str>::delay(&limiter, &"k", 2);
        let d2 = RateLimiter::<&str>::delay(&limiter, &"k", 20);
        assert!(d0 <= d1);
        assert_eq!(d2, Duration::from_millis(8));
    }

    #[tokio::test]
    async fn shutdown_unblocks_get() {
        let q: WorkQueue<&'static str> = WorkQueue::new();
        q.shut_down();
        assert_eq!(q.get().await, None);
    }
}
