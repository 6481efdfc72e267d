//! Leader election over a [`Lease`] object written into the [`Store`] (spec §4.3).
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::object::{Object, Scope};
use crate::store::{Error as StoreError, GetOptions, Store, WriteOptions};

/// `1.2x` jitter applied to `retry_period`, matching the reference leader
/// election implementation's constant.
const JITTER_FACTOR: f64 = 1.2;

const LEASE_RESOURCE: &str = "lease";

fn leader_election_scope() -> Scope {
    Scope::root().with("namespaces", "leader-election")
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid leader election config: {0}")]
    Config(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// The persisted layout of a lease object (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseSpec {
    pub holder_identity: String,
    pub lease_duration_seconds: u64,
    pub acquire_time: DateTime<Utc>,
    pub renew_time: DateTime<Utc>,
    pub leader_transitions: u64,
}

/// Tunables for an [`Elector`]. Durations follow the validation rules from
/// the reference `coordination` module: `lease_duration > renew_deadline >
/// JITTER_FACTOR * retry_period`, all durations at least 1s, and the lease
/// duration floor is 10s (spec §4.3).
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub name: String,
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl LeaseConfig {
    pub fn new(name: impl Into<String>, identity: impl Into<String>) -> Self {
        LeaseConfig {
            name: name.into(),
            identity: identity.into(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        let min = Duration::from_secs(1);
        if self.lease_duration < Duration::from_secs(10) {
            return Err(Error::Config("lease_duration must be at least 10s".into()));
        }
        if self.renew_deadline < min || self.retry_period < min {
            return Err(Error::Config("renew_deadline and retry_period must be at least 1s".into()));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(Error::Config("lease_duration must exceed renew_deadline".into()));
        }
        let jittered_retry = self.retry_period.as_secs_f64() * JITTER_FACTOR;
        if self.renew_deadline.as_secs_f64() <= jittered_retry {
            return Err(Error::Config(
                "renew_deadline must exceed retry_period * 1.2".into(),
            ));
        }
        Ok(())
    }
}

/// The last-observed state of a contended lease. `expires_at` is always a
/// local `Instant` captured when the underlying record was first observed,
/// never derived from the record's own `renew_time` — see
/// [`Elector::try_acquire_or_renew`].
#[derive(Debug, Clone)]
pub enum LeaseState {
    Unheld,
    HeldByOther { holder: String, expires_at: Instant },
    HeldBySelf { renew_at: Instant, expires_at: Instant },
}

impl LeaseState {
    fn expires_at(&self) -> Instant {
        match self {
            LeaseState::Unheld => Instant::now(),
            LeaseState::HeldByOther { expires_at, .. } => *expires_at,
            LeaseState::HeldBySelf { expires_at, .. } => *expires_at,
        }
    }
}

/// Drives the acquire/renew/release state machine for one candidate over one
/// named lease (spec §4.3).
pub struct Elector {
    store: Arc<dyn Store>,
    config: LeaseConfig,
    /// Caches, per observed `resource_version`, the local wall-clock instant
    /// the record was first seen plus the resulting expiry. Re-reading the
    /// same version of the record reuses that instant rather than racing it
    /// against the record's own timestamp, so a skewed remote clock cannot
    /// make this candidate see the lease as both live and expired on
    /// different polls. Keyed on `resource_version` rather than
    /// `renew_time` so that a write which changes only `lease_duration` (as
    /// [`Elector::release`] does) is still treated as a fresh observation.
    last_observation: parking_lot::Mutex<Option<(u64, LeaseState)>>,
}

impl Elector {
    pub fn new(store: Arc<dyn Store>, config: LeaseConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Elector {
            store,
            config,
            last_observation: parking_lot::Mutex::new(None),
        })
    }

    fn scoped_store(&self) -> Box<dyn Store> {
        self.store.scope(leader_election_scope())
    }

    async fn get_lease(&self) -> Result<Option<Object>, Error> {
        match self.scoped_store().get(LEASE_RESOURCE, &self.config.name, GetOptions::default()).await {
            Ok(obj) => Ok(Some(obj)),
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn decode(obj: &Object) -> Result<LeaseSpec, Error> {
        serde_json::from_value(obj.status.clone())
            .map_err(|e| Error::Config(format!("malformed lease record: {e}")))
    }

    fn encode(spec: &LeaseSpec) -> serde_json::Value {
        serde_json::to_value(spec).expect("LeaseSpec always serializes")
    }

    /// Runs a single acquire-or-renew attempt. Returns `true` if this
    /// candidate holds the lease after the call.
    async fn try_acquire_or_renew(&self) -> Result<bool, Error> {
        let now = Utc::now();
        let store = self.scoped_store();
        match self.get_lease().await? {
            None => {
                let spec = LeaseSpec {
                    holder_identity: self.config.identity.clone(),
                    lease_duration_seconds: self.config.lease_duration.as_secs(),
                    acquire_time: now,
                    renew_time: now,
                    leader_transitions: 0,
                };
                let obj = Object {
                    name: self.config.name.clone(),
                    uid: String::new(),
                    resource: LEASE_RESOURCE.into(),
                    scopes: leader_election_scope(),
                    resource_version: 0,
                    creation_timestamp: now,
                    deletion_timestamp: None,
                    finalizers: vec![],
                    owner_references: vec![],
                    labels: Default::default(),
                    annotations: Default::default(),
                    status: Self::encode(&spec),
                };
                match store.create(obj, WriteOptions::default()).await {
                    Ok(_) => Ok(true),
                    Err(StoreError::AlreadyExists) => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
            Some(mut obj) => {
                let spec = Self::decode(&obj)?;
                let wall_clock_expiry = Duration::from_secs(spec.lease_duration_seconds);
                let held_by_us = spec.holder_identity == self.config.identity;

                let mut last = self.last_observation.lock();
                let expires_at = last
                    .as_ref()
                    .filter(|(version, _)| *version == obj.resource_version)
                    .map(|(_, state)| state.expires_at())
                    .unwrap_or_else(|| Instant::now() + wall_clock_expiry);
                let expired = Instant::now() >= expires_at;
                *last = Some((
                    obj.resource_version,
                    if held_by_us {
                        LeaseState::HeldBySelf { renew_at: Instant::now(), expires_at }
                    } else if expired {
                        LeaseState::Unheld
                    } else {
                        LeaseState::HeldByOther { holder: spec.holder_identity.clone(), expires_at }
                    },
                ));
                drop(last);

                if !held_by_us && !expired {
                    return Ok(false);
                }
                let new_spec = LeaseSpec {
                    holder_identity: self.config.identity.clone(),
                    lease_duration_seconds: self.config.lease_duration.as_secs(),
                    acquire_time: if held_by_us { spec.acquire_time } else { now },
                    renew_time: now,
                    leader_transitions: if held_by_us {
                        spec.leader_transitions
                    } else {
                        spec.leader_transitions + 1
                    },
                };
                obj.status = Self::encode(&new_spec);
                match store.update(obj, WriteOptions::default()).await {
                    Ok(_) => Ok(true),
                    Err(StoreError::Conflict) => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Repeatedly attempts to acquire the lease (jittered `retry_period`
    /// interval) then, while held, runs `callback` and renews until the
    /// lease is lost or `cancel` fires.
    pub async fn run<F, Fut>(&self, cancel: CancellationToken, callback: F)
    where
        F: Fn(CancellationToken) -> Fut,
        Fut: Future<Output = ()>,
    {
        while !cancel.is_cancelled() {
            if self.acquire(&cancel).await {
                let held_cancel = CancellationToken::new();
                let callback_fut = callback(held_cancel.clone());
                tokio::pin!(callback_fut);
                tokio::select! {
                    _ = &mut callback_fut => {}
                    _ = self.hold(&held_cancel) => {}
                    _ = cancel.cancelled() => { held_cancel.cancel(); }
                }
                held_cancel.cancel();
            } else {
                let delay = jittered(self.config.retry_period);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    async fn acquire(&self, cancel: &CancellationToken) -> bool {
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(err) => tracing::warn!(error = %err, "leader election acquire attempt failed"),
            }
            if cancel.is_cancelled() {
                return false;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(jittered(self.config.retry_period)) => {}
            }
        }
    }

    /// Renews on `retry_period`, bounded each attempt by `renew_deadline`.
    /// Returns once renewal fails or is lost; the caller cancels the held
    /// context in response.
    async fn hold(&self, held_cancel: &CancellationToken) {
        loop {
            tokio::time::sleep(self.config.retry_period).await;
            let attempt = tokio::time::timeout(self.config.renew_deadline, self.try_acquire_or_renew()).await;
            match attempt {
                Ok(Ok(true)) => continue,
                Ok(Ok(false)) => {
                    tracing::info!(lease = %self.config.name, "lost leadership");
                    held_cancel.cancel();
                    return;
                }
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "leader election renewal errored, stopping");
                    held_cancel.cancel();
                    return;
                }
                Err(_elapsed) => {
                    tracing::warn!(lease = %self.config.name, "leader election renewal deadline exceeded");
                    held_cancel.cancel();
                    return;
                }
            }
        }
    }

    /// Releases the lease by writing a short-TTL record, if we still hold it.
    pub async fn release(&self) -> Result<(), Error> {
        if let Some(mut obj) = self.get_lease().await? {
            let spec = Self::decode(&obj)?;
            if spec.holder_identity != self.config.identity {
                return Ok(());
            }
            let released = LeaseSpec {
                lease_duration_seconds: 1,
                ..spec
            };
            obj.status = Self::encode(&released);
            self.scoped_store().update(obj, WriteOptions::default()).await?;
        }
        Ok(())
    }
}

fn jittered(base: Duration) -> Duration {
    let factor = rand::rng().random_range(1.0..JITTER_FACTOR);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn config(name: &str, identity: &str) -> LeaseConfig {
        LeaseConfig {
            name: name.into(),
            identity: identity.into(),
            lease_duration: Duration::from_secs(10),
            renew_deadline: Duration::from_secs(4),
            retry_period: Duration::from_secs(1),
        }
    }

    #[test]
    fn validate_rejects_short_lease_duration() {
        let mut cfg = config("l", "a");
        cfg.lease_duration = Duration::from_secs(5);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_retry_period_too_close_to_renew_deadline() {
        let mut cfg = config("l", "a");
        cfg.renew_deadline = Duration::from_millis(1100);
        cfg.retry_period = Duration::from_secs(1);
        assert!(cfg.validate().is_err());
    }

    #[tokio::test]
    async fn second_candidate_acquires_after_first_releases() {
        let store = Arc::new(MemoryStore::new());
        let a = Elector::new(store.clone(), config("mylease", "a")).unwrap();
        let b = Elector::new(store.clone(), config("mylease", "b")).unwrap();

        assert!(a.try_acquire_or_renew().await.unwrap());
        assert!(!b.try_acquire_or_renew().await.unwrap());

        a.release().await.unwrap();
        // Expiry is measured from this candidate's own first observation of
        // the released record, not from the wall-clock moment of release, so
        // the first post-release check just registers that observation.
        assert!(!b.try_acquire_or_renew().await.unwrap());
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(b.try_acquire_or_renew().await.unwrap());
    }

    #[tokio::test]
    async fn expiry_is_measured_from_local_observation_not_record_renew_time() {
        // A record whose `renew_time` is already far in the past (as if
        // written by a clock-skewed peer) must still be treated as live
        // until this candidate's own observation window elapses.
        let store = Arc::new(MemoryStore::new());
        let long_ago = Utc::now() - chrono::Duration::hours(1);
        let spec = LeaseSpec {
            holder_identity: "other".into(),
            lease_duration_seconds: 10,
            acquire_time: long_ago,
            renew_time: long_ago,
            leader_transitions: 0,
        };
        let obj = Object {
            name: "mylease".into(),
            uid: String::new(),
            resource: LEASE_RESOURCE.into(),
            scopes: leader_election_scope(),
            resource_version: 0,
            creation_timestamp: long_ago,
            deletion_timestamp: None,
            finalizers: vec![],
            owner_references: vec![],
            labels: Default::default(),
            annotations: Default::default(),
            status: Elector::encode(&spec),
        };
        store.scope(leader_election_scope()).create(obj, WriteOptions::default()).await.unwrap();

        let b = Elector::new(store.clone(), config("mylease", "b")).unwrap();
        assert!(!b.try_acquire_or_renew().await.unwrap());
    }

    #[tokio::test]
    async fn renewal_by_holder_does_not_require_expiry() {
        let store = Arc::new(MemoryStore::new());
        let a = Elector::new(store.clone(), config("mylease", "a")).unwrap();
        assert!(a.try_acquire_or_renew().await.unwrap());
        assert!(a.try_acquire_or_renew().await.unwrap());
    }
}
