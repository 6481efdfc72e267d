//! [`BetterReconciler`]: a wrapper reconciler that enforces the
//! finalizer add/remove protocol and delegates the live/deleting halves of
//! reconciliation to a typed inner [`InnerReconciler`] (spec §4.7).
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::object::{Object, ScopedKey};
use crate::reconcile::{Action, Reconciler};
use crate::store::{DeleteOptions, GetOptions, Store, WriteOptions};

#[derive(Debug, thiserror::Error)]
pub enum Error<E: std::error::Error + Send + Sync + 'static> {
    #[error("store error: {0}")]
    Store(#[from] crate::store::Error),
    #[error(transparent)]
    Inner(E),
}

/// The typed capability a [`BetterReconciler`] delegates to: apply desired
/// state on a live object, and clean up external state before a deleting
/// object's finalizer is removed.
///
/// `sync` takes `obj` by mutable reference so it may record status
/// information (e.g. for [`BetterReconcilerOptions::auto_set_status`]); the
/// wrapper compares the object before and after the call to decide whether a
/// `Status.Update` is due.
#[async_trait]
pub trait InnerReconciler: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn sync(&self, obj: &mut Object) -> Result<(), Self::Error>;

    async fn remove(&self, obj: &Object) -> Result<(), Self::Error>;
}

/// Options controlling the finalizer/requeue/status behavior of a
/// [`BetterReconciler`] (spec §4.7).
#[derive(Default)]
pub struct BetterReconcilerOptions {
    /// When set, the wrapper enforces the finalizer add/remove protocol.
    pub finalizer: Option<String>,
    /// When set, a successful `Sync` is followed by a requeue after this
    /// duration, for periodic resync.
    pub requeue_on_success: Option<Duration>,
    /// When true, a failed `Sync` copies the error message into the
    /// object's `status.message` field, if present.
    pub auto_set_status: bool,
}

/// Wraps an [`InnerReconciler`] with finalizer management, NotFound
/// tolerance, and deletion-propagation semantics, turning it into a full
/// [`Reconciler`] the controller engine can drive.
pub struct BetterReconciler<I: InnerReconciler> {
    store: Arc<dyn Store>,
    inner: Arc<I>,
    options: BetterReconcilerOptions,
}

impl<I: InnerReconciler> BetterReconciler<I> {
    pub fn new(store: Arc<dyn Store>, inner: Arc<I>, options: BetterReconcilerOptions) -> Self {
        BetterReconciler { store, inner, options }
    }

    fn scoped(&self, key: &ScopedKey) -> Box<dyn Store> {
        self.store.scope(key.scopes.clone())
    }

    async fn handle_deleting(&self, scoped: &dyn Store, mut obj: Object) -> Result<Action, Error<I::Error>> {
        let Some(finalizer) = &self.options.finalizer else {
            self.inner.remove(&obj).await.map_err(Error::Inner)?;
            return self.remove_and_finish(scoped, obj).await;
        };
        if !obj.has_finalizer(finalizer) {
            return Ok(Action::await_change());
        }
        self.inner.remove(&obj).await.map_err(Error::Inner)?;
        obj.finalizers.retain(|f| f != finalizer);
        self.remove_and_finish(scoped, obj).await
    }

    async fn remove_and_finish(&self, scoped: &dyn Store, obj: Object) -> Result<Action, Error<I::Error>> {
        if obj.finalizers.is_empty() {
            match scoped.delete(&obj.resource, &obj.name, DeleteOptions::default()).await {
                Ok(()) | Err(crate::store::Error::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            scoped.update(obj, WriteOptions::default()).await?;
        }
        Ok(Action::await_change())
    }

    async fn handle_live(&self, scoped: &dyn Store, mut obj: Object) -> Result<Action, Error<I::Error>> {
        if let Some(finalizer) = &self.options.finalizer {
            if !obj.has_finalizer(finalizer) {
                obj.finalizers.push(finalizer.clone());
                obj = scoped.update(obj, WriteOptions::default()).await?;
            }
        }

        let before = obj.clone();
        let sync_result = self.inner.sync(&mut obj).await;

        if let Err(err) = &sync_result {
            if self.options.auto_set_status {
                set_status_message(&mut obj, err.to_string());
            }
        }

        if obj != before {
            let status = obj.status.clone();
            scoped.status().update_status(&obj.resource, &obj.name, status).await?;
        }

        sync_result.map_err(Error::Inner)?;

        match self.options.requeue_on_success {
            Some(d) if !d.is_zero() => Ok(Action::requeue(d)),
            _ => Ok(Action::await_change()),
        }
    }
}

/// Sets `status.message` only if the status value is already an object
/// containing that key — spec §4.7: "if such a field exists".
fn set_status_message(obj: &mut Object, message: String) {
    if let serde_json::Value::Object(map) = &mut obj.status {
        if map.contains_key("message") {
            map.insert("message".to_string(), serde_json::Value::String(message));
        }
    }
}

#[async_trait]
impl<I: InnerReconciler + 'static> Reconciler for BetterReconciler<I> {
    type Error = Error<I::Error>;

    async fn reconcile(&self, key: &ScopedKey) -> Result<Action, Self::Error> {
        let scoped = self.scoped(key);
        let obj = match scoped.get(&key.resource, &key.name, GetOptions::default()).await {
            Ok(obj) => obj,
            Err(crate::store::Error::NotFound) => return Ok(Action::await_change()),
            Err(e) => return Err(e.into()),
        };

        if obj.is_being_deleted() {
            self.handle_deleting(scoped.as_ref(), obj).await
        } else {
            self.handle_live(scoped.as_ref(), obj).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Scope;
    use crate::store::memory::MemoryStore;
    use crate::store::WriteOptions as WO;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn widget(name: &str) -> Object {
        Object {
            name: name.into(),
            uid: String::new(),
            resource: "widget".into(),
            scopes: Scope::root(),
            resource_version: 0,
            creation_timestamp: chrono::Utc::now(),
            deletion_timestamp: None,
            finalizers: vec![],
            owner_references: vec![],
            labels: Default::default(),
            annotations: Default::default(),
            status: serde_json::Value::Null,
        }
    }

    struct RecordingInner {
        remove_calls: AtomicUsize,
        sync_calls: AtomicUsize,
        last_remove_finalizers: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl InnerReconciler for RecordingInner {
        type Error = std::convert::Infallible;

        async fn sync(&self, _obj: &mut Object) -> Result<(), Self::Error> {
            self.sync_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn remove(&self, obj: &Object) -> Result<(), Self::Error> {
            self.remove_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_remove_finalizers.lock().unwrap() = obj.finalizers.clone();
            Ok(())
        }
    }

    #[tokio::test]
    async fn missing_object_is_treated_as_success() {
        let store = Arc::new(MemoryStore::new());
        let inner = Arc::new(RecordingInner {
            remove_calls: AtomicUsize::new(0),
            sync_calls: AtomicUsize::new(0),
            last_remove_finalizers: StdMutex::new(vec![]),
        });
        let reconciler = BetterReconciler::new(store, inner, BetterReconcilerOptions::default());
        let key = ScopedKey::new("widget", "missing", Scope::root());
        let action = reconciler.reconcile(&key).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn deleting_object_calls_remove_even_without_a_configured_finalizer() {
        let store = Arc::new(MemoryStore::new());
        store.create(widget("a"), WO::default()).await.unwrap();
        let inner = Arc::new(RecordingInner {
            remove_calls: AtomicUsize::new(0),
            sync_calls: AtomicUsize::new(0),
            last_remove_finalizers: StdMutex::new(vec![]),
        });
        let reconciler = BetterReconciler::new(store.clone(), inner.clone(), BetterReconcilerOptions::default());
        let key = ScopedKey::new("widget", "a", Scope::root());

        // some other system's finalizer keeps the object alive in the store
        // even though this wrapper has none of its own configured.
        {
            let mut obj = store.get("widget", "a", GetOptions::default()).await.unwrap();
            obj.finalizers.push("other-system.example/finalizer".into());
            store.update(obj, WO::default()).await.unwrap();
        }
        store.delete("widget", "a", DeleteOptions::default()).await.unwrap();

        reconciler.reconcile(&key).await.unwrap();
        assert_eq!(inner.remove_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn finalizer_protocol_round_trip() {
        let store = Arc::new(MemoryStore::new());
        store.create(widget("a"), WO::default()).await.unwrap();
        let inner = Arc::new(RecordingInner {
            remove_calls: AtomicUsize::new(0),
            sync_calls: AtomicUsize::new(0),
            last_remove_finalizers: StdMutex::new(vec![]),
        });
        let reconciler = BetterReconciler::new(
            store.clone(),
            inner.clone(),
            BetterReconcilerOptions {
                finalizer: Some("test.finalizer".into()),
                ..Default::default()
            },
        );
        let key = ScopedKey::new("widget", "a", Scope::root());

        // first pass: finalizer gets added, Sync is called.
        reconciler.reconcile(&key).await.unwrap();
        let obj = store.get("widget", "a", GetOptions::default()).await.unwrap();
        assert!(obj.has_finalizer("test.finalizer"));
        assert_eq!(inner.sync_calls.load(Ordering::SeqCst), 1);

        // delete: the store honors the existing finalizer by setting
        // DeletionTimestamp rather than hard-deleting immediately.
        store.delete("widget", "a", DeleteOptions::default()).await.unwrap();

        // second pass: Remove is called exactly once, finalizer is stripped, object is gone.
        reconciler.reconcile(&key).await.unwrap();
        assert_eq!(inner.remove_calls.load(Ordering::SeqCst), 1);
        let err = store.get("widget", "a", GetOptions::default()).await.unwrap_err();
        assert!(matches!(err, crate::store::Error::NotFound));
    }

    #[tokio::test]
    async fn requeue_on_success_requests_periodic_resync() {
        let store = Arc::new(MemoryStore::new());
        store.create(widget("a"), WO::default()).await.unwrap();
        let inner = Arc::new(RecordingInner {
            remove_calls: AtomicUsize::new(0),
            sync_calls: AtomicUsize::new(0),
            last_remove_finalizers: StdMutex::new(vec![]),
        });
        let reconciler = BetterReconciler::new(
            store,
            inner,
            BetterReconcilerOptions {
                requeue_on_success: Some(Duration::from_secs(30)),
                ..Default::default()
            },
        );
        let key = ScopedKey::new("widget", "a", Scope::root());
        let action = reconciler.reconcile(&key).await.unwrap();
        assert_eq!(action.requeue_after(), Some(Duration::from_secs(30)));
    }
}
