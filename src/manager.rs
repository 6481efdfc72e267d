//! Aggregates N controllers behind a shared name→controller map, optionally
//! gating all of them behind one shared lease (spec §4.6).
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::lease::{Elector, LeaseConfig};
use crate::store::Store;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("controller {0} is already registered")]
    DuplicateName(String),
    #[error("leader election config invalid: {0}")]
    LeaseConfig(#[from] crate::lease::Error),
    #[error(transparent)]
    Controller(Box<dyn std::error::Error + Send + Sync>),
}

type RunFuture = Pin<Box<dyn Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>> + Send>>;

/// A type-erased, already-bound controller run closure, so a manager can hold
/// controllers over different `Reconciler` types in one map.
trait RunnableController: Send + Sync {
    fn run(&self, cancel: CancellationToken) -> RunFuture;
}

struct BoxedController<F>(F)
where
    F: Fn(CancellationToken) -> RunFuture + Send + Sync;

impl<F> RunnableController for BoxedController<F>
where
    F: Fn(CancellationToken) -> RunFuture + Send + Sync,
{
    fn run(&self, cancel: CancellationToken) -> RunFuture {
        (self.0)(cancel)
    }
}

/// Interval between shared-lease re-acquisition attempts after a loss, per
/// spec §4.6.
const LEASE_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Holds a name→controller map plus an optional shared [`LeaseConfig`] that
/// gates every controller's run loop behind a single elected leader.
pub struct ControllerManager {
    controllers: HashMap<String, Arc<dyn RunnableController>>,
    order: Vec<String>,
    shared_election: Option<(Arc<dyn Store>, LeaseConfig)>,
    enable: Vec<String>,
    disable: Vec<String>,
}

impl ControllerManager {
    pub fn new() -> Self {
        ControllerManager {
            controllers: HashMap::new(),
            order: Vec::new(),
            shared_election: None,
            enable: Vec::new(),
            disable: Vec::new(),
        }
    }

    /// Registers a controller under `name`. `run` should be the controller's
    /// already-bound `Arc<Controller<_>>::run` closure, type-erased to a
    /// common error type.
    pub fn add_controller<Fut, E>(
        &mut self,
        name: impl Into<String>,
        run: impl Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    ) -> Result<(), Error>
    where
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let name = name.into();
        if self.controllers.contains_key(&name) {
            return Err(Error::DuplicateName(name));
        }
        self.order.push(name.clone());
        self.controllers.insert(
            name,
            Arc::new(BoxedController(move |cancel| {
                let fut = run(cancel);
                Box::pin(async move { fut.await.map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>) })
                    as RunFuture
            })),
        );
        Ok(())
    }

    /// Gates every registered controller behind a single lease acquired on
    /// `store`. A `ttl` of zero uses the default [`LeaseConfig`] durations.
    pub fn with_shared_leader_election(mut self, store: Arc<dyn Store>, mut config: LeaseConfig, ttl: Duration) -> Self {
        if !ttl.is_zero() {
            config.lease_duration = ttl;
        }
        self.shared_election = Some((store, config));
        self
    }

    /// If non-empty, only these names (or `"*"` for all) run.
    pub fn enable(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.enable = names.into_iter().map(Into::into).collect();
        self
    }

    /// Subtracted from the enabled set when [`enable`](Self::enable) is empty.
    pub fn disable(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.disable = names.into_iter().map(Into::into).collect();
        self
    }

    fn active_names(&self) -> Vec<String> {
        let wildcard = self.enable.iter().any(|n| n == "*");
        self.order
            .iter()
            .filter(|name| {
                if wildcard {
                    true
                } else if !self.enable.is_empty() {
                    self.enable.contains(name)
                } else {
                    !self.disable.contains(name)
                }
            })
            .cloned()
            .collect()
    }

    /// Launches every enabled controller in parallel; returns on the first
    /// error. If a shared lease is configured, all controllers run only
    /// while it's held, and re-acquisition is retried at
    /// [`LEASE_RETRY_INTERVAL`] after a loss.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), Error> {
        let names = self.active_names();
        let controllers: Vec<Arc<dyn RunnableController>> =
            names.iter().map(|n| self.controllers[n].clone()).collect();

        match self.shared_election {
            None => run_all(&controllers, cancel).await,
            Some((store, config)) => {
                let elector = Elector::new(store, config)?;
                loop {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    let controllers = controllers.clone();
                    let outcome_slot: Arc<parking_lot::Mutex<Option<Result<(), Error>>>> =
                        Arc::new(parking_lot::Mutex::new(None));
                    let slot = outcome_slot.clone();
                    elector
                        .run(cancel.clone(), move |held_cancel| {
                            let controllers = controllers.clone();
                            let slot = slot.clone();
                            async move {
                                let outcome = run_all(&controllers, held_cancel).await;
                                *slot.lock() = Some(outcome);
                            }
                        })
                        .await;
                    if let Some(Err(err)) = outcome_slot.lock().take() {
                        return Err(err);
                    }
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    tracing::info!("shared lease lost, retrying acquisition");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(LEASE_RETRY_INTERVAL) => {}
                    }
                }
            }
        }
    }
}

impl Default for ControllerManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_all(controllers: &[Arc<dyn RunnableController>], cancel: CancellationToken) -> Result<(), Error> {
    let mut tasks = tokio::task::JoinSet::new();
    for controller in controllers {
        let controller = controller.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { controller.run(cancel).await });
    }
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(Error::Controller(err)),
            Err(join_err) => return Err(Error::Controller(Box::new(join_err))),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn noop_controller(cancel: CancellationToken) -> Result<(), std::convert::Infallible> {
        cancel.cancelled().await;
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let mut manager = ControllerManager::new();
        manager.add_controller("widgets", noop_controller).unwrap();
        let err = manager.add_controller("widgets", noop_controller).unwrap_err();
        assert!(matches!(err, Error::DuplicateName(name) if name == "widgets"));
    }

    #[tokio::test]
    async fn enable_list_restricts_active_set() {
        let mut manager = ControllerManager::new();
        manager.add_controller("a", noop_controller).unwrap();
        manager.add_controller("b", noop_controller).unwrap();
        let manager = manager.enable(["a"]);
        assert_eq!(manager.active_names(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn disable_list_subtracts_from_all() {
        let mut manager = ControllerManager::new();
        manager.add_controller("a", noop_controller).unwrap();
        manager.add_controller("b", noop_controller).unwrap();
        let manager = manager.disable(["b"]);
        assert_eq!(manager.active_names(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn all_controllers_run_until_cancelled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut manager = ControllerManager::new();
        for name in ["a", "b", "c"] {
            let calls = calls.clone();
            manager
                .add_controller(name, move |cancel: CancellationToken| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        cancel.cancelled().await;
                        Ok::<_, std::convert::Infallible>(())
                    }
                })
                .unwrap();
        }
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(manager.run(run_cancel));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
