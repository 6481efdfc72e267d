//! The reconcile loop: pulls keys from a [`WorkQueue`], invokes a user
//! [`Reconciler`], and interprets its [`Action`]/error per spec §4.4.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::object::ScopedKey;
use crate::queue::WorkQueue;
use crate::utils::AdmissionLimiter;

/// Results of a reconciliation attempt.
///
/// `requeue_after: None` clears the per-key failure counter and waits for the
/// next watch trigger. `Some(Duration::ZERO)` re-adds the key immediately;
/// `Some(d)` re-adds it after `d` (spec §4.4 Result semantics (a)-(c)).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Requeue after `d` (`d` may be zero for an immediate re-add).
    #[must_use]
    pub fn requeue(d: Duration) -> Self {
        Action { requeue_after: Some(d) }
    }

    /// Do not requeue; wait for the next watch-triggered `Add`.
    #[must_use]
    pub fn await_change() -> Self {
        Action { requeue_after: None }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// An error carrying an explicit requeue delay. When a [`Reconciler`] returns
/// this (or any error that `downcast_ref`s to it), the loop requeues after the
/// carried delay **instead of** applying rate-limited backoff — the error
/// path and [`Action::requeue`] are mutually exclusive return channels (spec
/// §9 open question 1: the error path wins).
#[derive(Debug, Clone, Copy)]
pub struct ReQueueError(pub Duration);

impl fmt::Display for ReQueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "requeue requested after {:?}", self.0)
    }
}

impl std::error::Error for ReQueueError {}

/// A context data type threaded through to reconciler callbacks: a read-only,
/// cheaply cloneable view of shared state, analogous to Actix's `Data`.
pub struct Context<T>(Arc<T>);

impl<T> Context<T> {
    #[must_use]
    pub fn new(state: T) -> Self {
        Context(Arc::new(state))
    }

    #[must_use]
    pub fn get_ref(&self) -> &T {
        self.0.as_ref()
    }

    #[must_use]
    pub fn into_inner(self) -> Arc<T> {
        self.0
    }
}

impl<T> Clone for Context<T> {
    fn clone(&self) -> Self {
        Context(self.0.clone())
    }
}

/// The single capability every controller needs: reconcile one key.
///
/// Implementors may additionally override [`initialize`](Reconciler::initialize)
/// to run one-time setup before any worker starts (spec §4.5); the default is
/// a no-op, so it behaves as an optional capability.
#[async_trait]
pub trait Reconciler: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn reconcile(&self, key: &ScopedKey) -> Result<Action, Self::Error>;

    async fn initialize(&self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Runs `concurrency` workers pulling from `queue`, invoking `reconciler` for
/// each key and interpreting the result, until `cancel` fires and the queue
/// drains (spec §4.4).
pub async fn run<R>(
    cancel: CancellationToken,
    queue: WorkQueue<ScopedKey>,
    reconciler: Arc<R>,
    concurrency: usize,
    admission: Arc<AdmissionLimiter>,
) where
    R: Reconciler + 'static,
{
    let shutdown_queue = queue.clone();
    let shutdown_cancel = cancel.clone();
    let shutdown = tokio::spawn(async move {
        shutdown_cancel.cancelled().await;
        shutdown_queue.shut_down();
    });

    let mut workers = Vec::with_capacity(concurrency);
    for id in 0..concurrency.max(1) {
        let queue = queue.clone();
        let reconciler = reconciler.clone();
        let admission = admission.clone();
        workers.push(tokio::spawn(async move {
            worker_loop(id, queue, reconciler, admission).await;
        }));
    }

    for worker in workers {
        let _ = worker.await;
    }
    shutdown.abort();
}

async fn worker_loop<R>(id: usize, queue: WorkQueue<ScopedKey>, reconciler: Arc<R>, admission: Arc<AdmissionLimiter>)
where
    R: Reconciler,
{
    loop {
        let Some(key) = queue.get().await else {
            tracing::debug!(worker = id, "queue shut down, worker exiting");
            return;
        };
        admission.acquire().await;
        let span = tracing::info_span!("reconciling", key = %key);
        let result = {
            let _enter = span.enter();
            reconciler.reconcile(&key).await
        };
        match result {
            Ok(action) => match action.requeue_after() {
                None => queue.forget(&key),
                Some(d) if d.is_zero() => queue.add_after(key.clone(), Duration::ZERO),
                Some(d) => queue.add_after(key.clone(), d),
            },
            Err(err) => {
                let boxed: Box<dyn std::error::Error + 'static> = Box::new(err);
                if let Some(ReQueueError(delay)) = boxed.downcast_ref::<ReQueueError>().copied() {
                    queue.add_after(key.clone(), delay);
                } else {
                    tracing::warn!(key = %key, error = %boxed, "reconcile failed, rate-limited requeue");
                    queue.add_rate_limited(key.clone());
                }
            }
        }
        queue.done(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingReconciler {
        calls: AtomicUsize,
        action: Mutex<Action>,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct BoomError;

    #[async_trait]
    impl Reconciler for CountingReconciler {
        type Error = BoomError;

        async fn reconcile(&self, _key: &ScopedKey) -> Result<Action, Self::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(*self.action.lock().unwrap())
        }
    }

    fn key(name: &str) -> ScopedKey {
        ScopedKey::new("widget", name, crate::object::Scope::root())
    }

    #[tokio::test]
    async fn single_invocation_then_forget() {
        let queue: WorkQueue<ScopedKey> = WorkQueue::new();
        queue.add(key("a"));
        let reconciler = Arc::new(CountingReconciler {
            calls: AtomicUsize::new(0),
            action: Mutex::new(Action::await_change()),
        });
        let cancel = CancellationToken::new();
        let admission = Arc::new(AdmissionLimiter::new(1000.0, 1000.0));
        let handle = {
            let cancel = cancel.clone();
            let queue = queue.clone();
            let reconciler = reconciler.clone();
            tokio::spawn(async move { run(cancel, queue, reconciler, 1, admission).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn requeue_error_takes_explicit_delay() {
        struct ReQueuingReconciler {
            calls: AtomicUsize,
        }
        #[async_trait]
        impl Reconciler for ReQueuingReconciler {
            type Error = ReQueueError;
            async fn reconcile(&self, _key: &ScopedKey) -> Result<Action, Self::Error> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Err(ReQueueError(Duration::from_millis(10)))
            }
        }
        let queue: WorkQueue<ScopedKey> = WorkQueue::new();
        queue.add(key("a"));
        let cancel = CancellationToken::new();
        let admission = Arc::new(AdmissionLimiter::new(1000.0, 1000.0));
        let reconciler = Arc::new(ReQueuingReconciler { calls: AtomicUsize::new(0) });
        let handle = tokio::spawn(run(cancel.clone(), queue.clone(), reconciler.clone(), 1, admission));
        // an explicit ReQueueError delay (10ms) should win over the default 1s
        // rate-limited backoff, so a second invocation arrives well under 1s.
        tokio::time::timeout(Duration::from_millis(500), async {
            while reconciler.calls.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("ReQueueError delay should have driven a fast second attempt");
        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }
}
