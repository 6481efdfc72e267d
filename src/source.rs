//! Sources feed keys into a [`WorkQueue`] by watching a [`Store`] (spec §4.2).
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use tokio_util::sync::CancellationToken;

use crate::object::{Object, ScopedKey};
use crate::queue::WorkQueue;
use crate::store::{ListOptions, Store, WatchEvent};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] crate::store::Error),
    #[error("watch stream ended")]
    StreamEnded,
}

/// Filters which watch events are relevant to a [`StoreSource`].
pub trait Predicate: Send + Sync {
    fn matches(&self, obj: &Object) -> bool;
}

/// Extracts the queue key(s) to enqueue for a given observed object.
pub trait KeyExtractor: Send + Sync {
    fn keys(&self, obj: &Object) -> Vec<ScopedKey>;
}

/// The default extractor: the object's own [`ScopedKey`].
pub struct SelfKey;

impl KeyExtractor for SelfKey {
    fn keys(&self, obj: &Object) -> Vec<ScopedKey> {
        vec![obj.key()]
    }
}

/// Runs until cancelled, feeding keys into a queue.
#[async_trait]
pub trait Source: Send + Sync {
    async fn run(&self, cancel: CancellationToken, queue: WorkQueue<ScopedKey>);
}

/// Watches one resource type in a [`Store`] and enqueues keys for every
/// Create/Update/Delete event that passes all [`Predicate`]s.
///
/// On any watch error, logs, drops the stream and restarts after the
/// standard exponential backoff (spec §7: 1s initial, 30s cap, factor 2,
/// jitter 0.1), the same retry envelope `kube-runtime`'s watcher gives its
/// list-then-watch loop.
pub struct StoreSource {
    store: Arc<dyn Store>,
    resource: String,
    predicates: Vec<Box<dyn Predicate>>,
    extractor: Box<dyn KeyExtractor>,
}

impl StoreSource {
    pub fn new(store: Arc<dyn Store>, resource: impl Into<String>) -> Self {
        StoreSource {
            store,
            resource: resource.into(),
            predicates: Vec::new(),
            extractor: Box::new(SelfKey),
        }
    }

    pub fn with_predicate(mut self, predicate: Box<dyn Predicate>) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn with_extractor(mut self, extractor: Box<dyn KeyExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    fn passes(&self, obj: &Object) -> bool {
        self.predicates.iter().all(|p| p.matches(obj))
    }

    async fn run_once(&self, cancel: &CancellationToken, queue: &WorkQueue<ScopedKey>) -> Result<(), Error> {
        let opts = ListOptions {
            include_sub_scopes: true,
            send_initial_events: true,
            ..Default::default()
        };
        let mut watcher = self.store.watch(&self.resource, opts).await?;
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    watcher.stop();
                    return Ok(());
                }
                event = watcher.next() => event?,
            };
            let Some(event) = event else {
                return Err(Error::StreamEnded);
            };
            let obj = match &event {
                WatchEvent::Create(o) | WatchEvent::Update(o) | WatchEvent::Delete(o) => Some(o),
                WatchEvent::Bookmark { .. } => None,
            };
            if let Some(obj) = obj {
                if self.passes(obj) {
                    for key in self.extractor.keys(obj) {
                        queue.add(key);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Source for StoreSource {
    async fn run(&self, cancel: CancellationToken, queue: WorkQueue<ScopedKey>) {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_secs(1))
            .with_max_interval(Duration::from_secs(30))
            .with_randomization_factor(0.1)
            .with_multiplier(2.0)
            .with_max_elapsed_time(None)
            .build();
        while !cancel.is_cancelled() {
            match self.run_once(&cancel, &queue).await {
                Ok(()) => break, // cancelled cleanly
                Err(err) => {
                    tracing::warn!(resource = %self.resource, error = %err, "watch stream failed, restarting");
                    let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(30));
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
