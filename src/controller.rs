//! Binds a name, a set of [`Source`]s, concurrency, a [`Reconciler`] and
//! optional leader election into one runnable unit (spec §4.5).
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::lease::{Elector, LeaseConfig};
use crate::object::ScopedKey;
use crate::queue::{RateLimiter, WorkQueue};
use crate::reconcile::{self, Reconciler};
use crate::source::Source;
use crate::store::{ListOptions, Store};
use crate::utils::AdmissionLimiter;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("controller {name} initialize failed: {source}")]
    Initialize {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("leader election config invalid: {0}")]
    LeaseConfig(#[from] crate::lease::Error),
}

/// Tunables for a [`Controller`] (spec §4.5).
pub struct ControllerOptions {
    pub concurrency: usize,
    pub leader_election: Option<LeaseConfig>,
    pub rate_limiter: Option<Box<dyn RateLimiter<ScopedKey>>>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        ControllerOptions {
            concurrency: 1,
            leader_election: None,
            rate_limiter: None,
        }
    }
}

/// Binds a name, a set of [`Source`]s, concurrency, a [`Reconciler`] and
/// optional leader election; owns its own queue and workers.
pub struct Controller<R: Reconciler> {
    name: String,
    sources: Vec<Arc<dyn Source>>,
    queue: WorkQueue<ScopedKey>,
    reconciler: Arc<R>,
    options: ControllerOptions,
    elector: Option<Elector>,
    admission: Arc<AdmissionLimiter>,
    bulk_triggers: Mutex<Vec<BoxStream<'static, Vec<ScopedKey>>>>,
    graceful_shutdown: Mutex<Vec<BoxFuture<'static, ()>>>,
    forceful_shutdown: Mutex<Vec<BoxFuture<'static, ()>>>,
}

impl<R: Reconciler + 'static> Controller<R> {
    pub fn new(name: impl Into<String>, reconciler: Arc<R>) -> Self {
        Controller {
            name: name.into(),
            sources: Vec::new(),
            queue: WorkQueue::new(),
            reconciler,
            options: ControllerOptions::default(),
            elector: None,
            admission: Arc::new(AdmissionLimiter::default()),
            bulk_triggers: Mutex::new(Vec::new()),
            graceful_shutdown: Mutex::new(Vec::new()),
            forceful_shutdown: Mutex::new(Vec::new()),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn Source>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.options.concurrency = concurrency;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Box<dyn RateLimiter<ScopedKey>>) -> Self {
        self.queue = WorkQueue::with_rate_limiter(limiter);
        self
    }

    /// Gates this controller's entire run loop behind leader election over
    /// `store`, contending for `config`'s lease (spec §4.5).
    pub fn with_leader_election(mut self, store: Arc<dyn crate::store::Store>, config: LeaseConfig) -> Result<Self, Error> {
        self.elector = Some(Elector::new(store, config)?);
        Ok(self)
    }

    /// Triggers a reconcile of every object currently known to `store` for
    /// `resource` whenever `trigger` emits a value, e.g. on a config reload
    /// (spec §10.5, grounded on `Controller::reconcile_all_on`).
    ///
    /// Additive: can be called more than once, and a terminated `trigger`
    /// simply stops being polled without affecting the rest of the controller.
    #[must_use]
    pub fn reconcile_all_on(
        self,
        store: Arc<dyn Store>,
        resource: impl Into<String>,
        trigger: impl futures::Stream<Item = ()> + Send + 'static,
    ) -> Self {
        let resource = resource.into();
        let keys = trigger
            .then(move |()| {
                let store = store.clone();
                let resource = resource.clone();
                async move {
                    match store.list(&resource, ListOptions { include_sub_scopes: true, ..Default::default() }).await {
                        Ok(page) => page.items.iter().map(|o| o.key()).collect(),
                        Err(err) => {
                            tracing::warn!(resource = %resource, error = %err, "bulk reconcile list failed");
                            Vec::new()
                        }
                    }
                }
            })
            .boxed();
        self.bulk_triggers.lock().push(keys);
        self
    }

    /// Starts a graceful shutdown once `trigger` resolves: sources stop and
    /// no new work is admitted, but reconciles already in flight are allowed
    /// to finish (spec §10.5, grounded on `Controller::graceful_shutdown_on`).
    ///
    /// Additive: the controller begins shutting down as soon as any one of
    /// the registered triggers resolves.
    #[must_use]
    pub fn graceful_shutdown_on(self, trigger: impl std::future::Future<Output = ()> + Send + 'static) -> Self {
        self.graceful_shutdown.lock().push(trigger.boxed());
        self
    }

    /// Initiates graceful shutdown on Ctrl+C or SIGTERM (on Unix); a second
    /// signal requests a forceful shutdown that aborts in-flight reconciles
    /// at their next yield point (spec §10.5, grounded on
    /// `Controller::shutdown_on_signal`).
    #[must_use]
    pub fn shutdown_on_signal(self) -> Self {
        async fn signalled() {
            #[cfg(unix)]
            {
                let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }
        }

        let (graceful_tx, graceful_rx) = tokio::sync::oneshot::channel();
        self.graceful_shutdown.lock().push(async move {
            let _ = graceful_rx.await;
        }.boxed());
        self.forceful_shutdown.lock().push(
            async move {
                signalled().await;
                tracing::info!("press ctrl+c (or send SIGTERM) again to force shutdown");
                if graceful_tx.send(()).is_err() {
                    tracing::info!("graceful shutdown already in progress");
                }
                signalled().await;
            }
            .boxed(),
        );
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> WorkQueue<ScopedKey> {
        self.queue.clone()
    }

    /// Runs sources and the reconcile loop until `cancel` fires, gated by
    /// leader election if configured. Returns the first error encountered
    /// during initialization; reconciler errors are retried internally and
    /// never surface here.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), Error> {
        let span = tracing::info_span!("controller", name = %self.name);
        let _enter = span.enter();
        match &self.elector {
            None => self.clone().run_body(cancel).await,
            Some(elector) => {
                let this = self.clone();
                elector
                    .run(cancel, move |held_cancel| {
                        let this = this.clone();
                        async move {
                            if let Err(err) = this.run_body(held_cancel).await {
                                tracing::error!(controller = %this.name, error = %err, "controller body failed");
                            }
                        }
                    })
                    .await;
                Ok(())
            }
        }
    }

    /// Spawns sources, bulk-reconcile triggers and the reconcile loop under
    /// their own cancellation tokens so a graceful shutdown can stop intake
    /// while letting in-flight reconciles drain, and a forceful one can abort
    /// everything outright (spec §10.5).
    async fn run_body(self: Arc<Self>, cancel: CancellationToken) -> Result<(), Error> {
        if let Err(err) = self.reconciler.initialize().await {
            return Err(Error::Initialize {
                name: self.name.clone(),
                source: Box::new(err),
            });
        }

        let bulk_triggers: Vec<_> = self.bulk_triggers.lock().drain(..).collect();
        let graceful_shutdown: Vec<_> = self.graceful_shutdown.lock().drain(..).collect();
        let forceful_shutdown: Vec<_> = self.forceful_shutdown.lock().drain(..).collect();

        let sources_cancel = CancellationToken::new();
        let reconcile_cancel = CancellationToken::new();

        let mut tasks = tokio::task::JoinSet::new();
        for source in &self.sources {
            let source = source.clone();
            let queue = self.queue.clone();
            let src_cancel = sources_cancel.clone();
            tasks.spawn(async move { source.run(src_cancel, queue).await });
        }
        for mut trigger in bulk_triggers {
            let queue = self.queue.clone();
            let src_cancel = sources_cancel.clone();
            tasks.spawn(async move {
                loop {
                    tokio::select! {
                        _ = src_cancel.cancelled() => break,
                        next = trigger.next() => match next {
                            Some(keys) => keys.into_iter().for_each(|key| queue.add(key)),
                            None => break,
                        },
                    }
                }
            });
        }

        let queue = self.queue.clone();
        let reconciler = self.reconciler.clone();
        let concurrency = self.options.concurrency.max(1);
        let admission = self.admission.clone();
        let reconcile_loop_cancel = reconcile_cancel.clone();
        tasks.spawn(async move {
            reconcile::run(reconcile_loop_cancel, queue, reconciler, concurrency, admission).await;
        });

        let graceful = async {
            if graceful_shutdown.is_empty() {
                std::future::pending::<()>().await;
            } else {
                futures::future::select_all(graceful_shutdown).await;
            }
        };
        let forceful = async {
            if forceful_shutdown.is_empty() {
                std::future::pending::<()>().await;
            } else {
                futures::future::select_all(forceful_shutdown).await;
            }
        };
        tokio::pin!(graceful);
        tokio::pin!(forceful);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    sources_cancel.cancel();
                    reconcile_cancel.cancel();
                    break;
                }
                _ = &mut graceful => {
                    tracing::info!(controller = %self.name, "graceful shutdown: stopping intake, draining in-flight reconciles");
                    sources_cancel.cancel();
                    reconcile_cancel.cancel();
                    break;
                }
                _ = &mut forceful => {
                    tracing::warn!(controller = %self.name, "forceful shutdown: aborting in-flight reconciles");
                    sources_cancel.cancel();
                    reconcile_cancel.cancel();
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    return Ok(());
                }
                result = tasks.join_next() => if result.is_none() {
                    return Ok(());
                },
            }
        }

        while tasks.join_next().await.is_some() {}
        Ok(())
    }
}
