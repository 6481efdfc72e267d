//! Processes the attempt-to-delete and attempt-to-orphan queues: classifies
//! owner references and issues Store deletes/patches (spec §4.9).
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use tokio::sync::mpsc;

use crate::gc::builder::ChangeEvent;
use crate::gc::graph::{Graph, Node};
use crate::object::{finalizers, Object, OwnerReference, Scope, Uid};
use crate::queue::WorkQueue;
use crate::store::{DeleteOptions, Error as StoreError, GetOptions, Patch, PropagationPolicy, Store, WriteOptions};

/// Bounded retry count for the finalizer-remove conflict loop (spec §7).
const FINALIZER_REMOVE_ATTEMPTS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("finalizer removal retries exhausted")]
    FinalizerRemovalExhausted,
}

enum OwnerClass {
    Dangling,
    WaitingForDependentsDeletion,
    Solid,
}

/// Drives the two GC worker pools (delete, orphan) against a shared [`Graph`].
pub struct DeleteOrphanWorkers {
    graph: Arc<Graph>,
    store: Arc<dyn Store>,
    to_delete: WorkQueue<Uid>,
    to_orphan: WorkQueue<Uid>,
    changes_tx: mpsc::UnboundedSender<ChangeEvent>,
}

impl DeleteOrphanWorkers {
    pub fn new(
        graph: Arc<Graph>,
        store: Arc<dyn Store>,
        to_delete: WorkQueue<Uid>,
        to_orphan: WorkQueue<Uid>,
        changes_tx: mpsc::UnboundedSender<ChangeEvent>,
    ) -> Self {
        DeleteOrphanWorkers {
            graph,
            store,
            to_delete,
            to_orphan,
            changes_tx,
        }
    }

    pub fn to_delete_queue(&self) -> WorkQueue<Uid> {
        self.to_delete.clone()
    }

    pub fn to_orphan_queue(&self) -> WorkQueue<Uid> {
        self.to_orphan.clone()
    }

    /// Single-concurrency worker loop over the attempt-to-delete queue.
    pub async fn run_delete_worker(&self, cancel: tokio_util::sync::CancellationToken) {
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return,
                item = self.to_delete.get() => item,
            };
            let Some(uid) = item else { return };
            self.attempt_to_delete(uid.clone()).await;
            self.to_delete.done(&uid);
        }
    }

    /// Single-concurrency worker loop over the attempt-to-orphan queue.
    pub async fn run_orphan_worker(&self, cancel: tokio_util::sync::CancellationToken) {
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return,
                item = self.to_orphan.get() => item,
            };
            let Some(uid) = item else { return };
            self.attempt_to_orphan(uid.clone()).await;
            self.to_orphan.done(&uid);
        }
    }

    async fn attempt_to_delete(&self, uid: Uid) {
        let Some(node) = self.graph.get(&uid) else {
            return;
        };

        if node.is_being_deleted() && !node.is_deleting_children() {
            // ownership of the deletion lies with whoever set the timestamp.
            return;
        }

        let identity = node.identity();
        let scoped = self.store.scope(identity.scopes.clone());
        let live = match scoped.get(&identity.resource, &identity.name, GetOptions::default()).await {
            Ok(obj) => obj,
            Err(StoreError::NotFound) => {
                let _ = self.changes_tx.send(ChangeEvent::virtual_delete(uid, identity));
                return;
            }
            Err(err) => {
                tracing::warn!(uid = %uid, error = %err, "attempt-to-delete: store error, rate-limited retry");
                self.to_delete.add_rate_limited(uid);
                return;
            }
        };
        if live.uid != uid {
            // object recreated under the same coordinates.
            let _ = self.changes_tx.send(ChangeEvent::virtual_delete(uid, identity));
            return;
        }

        if node.is_deleting_children() {
            self.process_deleting_dependents(&node, &live).await;
            return;
        }

        let (dangling, waiting, solid) = self.classify_owners(&live.owner_references).await;

        if !solid.is_empty() {
            if !dangling.is_empty() || !waiting.is_empty() {
                let stale: Vec<Uid> = dangling.iter().chain(waiting.iter()).map(|r| r.uid.clone()).collect();
                if let Err(err) = self.delete_owner_references(&live, &stale).await {
                    tracing::warn!(uid = %uid, error = %err, "failed to patch dangling owner references");
                    self.to_delete.add_rate_limited(uid);
                }
            }
            return;
        }

        if !waiting.is_empty() && !node.children().is_empty() {
            let _ = scoped
                .delete(
                    &identity.resource,
                    &identity.name,
                    DeleteOptions { propagation_policy: PropagationPolicy::Foreground },
                )
                .await;
            return;
        }

        let policy = if live.has_finalizer(finalizers::ORPHAN) {
            PropagationPolicy::Orphan
        } else if live.has_finalizer(finalizers::FOREGROUND_DELETION) {
            PropagationPolicy::Foreground
        } else {
            PropagationPolicy::Background
        };
        if let Err(err) = scoped.delete(&identity.resource, &identity.name, DeleteOptions { propagation_policy: policy }).await {
            if !matches!(err, StoreError::NotFound) {
                tracing::warn!(uid = %uid, error = %err, "delete failed, rate-limited retry");
                self.to_delete.add_rate_limited(uid);
            }
        }
    }

    async fn process_deleting_dependents(&self, node: &Arc<Node>, live: &Object) {
        let blockers: Vec<Uid> = node
            .children()
            .into_iter()
            .filter(|child_uid| {
                self.graph
                    .get(child_uid)
                    .map(|child| child.owners().iter().any(|r| node.owner_ref_matches(r) && r.block_owner_deletion))
                    .unwrap_or(false)
            })
            .collect();

        if blockers.is_empty() {
            if let Err(err) = self.remove_finalizer(live.resource.clone(), live.name.clone(), live.scopes.clone(), finalizers::FOREGROUND_DELETION).await {
                tracing::warn!(uid = %node.uid, error = %err, "failed to remove foregroundDeletion finalizer");
                self.to_delete.add_rate_limited(node.uid.clone());
            }
        } else {
            for child_uid in blockers {
                let already_deleting_children = self.graph.get(&child_uid).map(|c| c.is_deleting_children()).unwrap_or(false);
                if !already_deleting_children {
                    self.to_delete.add(child_uid);
                }
            }
        }
    }

    async fn classify_owners(&self, owner_refs: &[OwnerReference]) -> (Vec<OwnerReference>, Vec<OwnerReference>, Vec<OwnerReference>) {
        let mut dangling = Vec::new();
        let mut waiting = Vec::new();
        let mut solid = Vec::new();

        for r in owner_refs {
            let cache_key = (r.resource.clone(), r.name.clone(), r.scopes.clone());
            if self.graph.is_cached_absent(&cache_key) {
                dangling.push(r.clone());
                continue;
            }
            let class = self.classify_owner(r, &cache_key).await;
            match class {
                OwnerClass::Dangling => dangling.push(r.clone()),
                OwnerClass::WaitingForDependentsDeletion => waiting.push(r.clone()),
                OwnerClass::Solid => solid.push(r.clone()),
            }
        }
        (dangling, waiting, solid)
    }

    async fn classify_owner(&self, r: &OwnerReference, cache_key: &(String, String, Scope)) -> OwnerClass {
        let scoped = self.store.scope(r.scopes.clone());
        match scoped.get(&r.resource, &r.name, GetOptions::default()).await {
            Err(StoreError::NotFound) => {
                self.graph.cache_absent_owner(cache_key.clone());
                OwnerClass::Dangling
            }
            Ok(owner_obj) if owner_obj.uid != r.uid => {
                self.graph.cache_absent_owner(cache_key.clone());
                OwnerClass::Dangling
            }
            Ok(owner_obj) => {
                if owner_obj.is_being_deleted() && owner_obj.has_finalizer(finalizers::FOREGROUND_DELETION) {
                    OwnerClass::WaitingForDependentsDeletion
                } else {
                    OwnerClass::Solid
                }
            }
            // Can't classify right now; err on the side of treating the owner
            // as solid so we don't wrongly delete a protected dependent.
            Err(_) => OwnerClass::Solid,
        }
    }

    async fn attempt_to_orphan(&self, uid: Uid) {
        let Some(node) = self.graph.get(&uid) else {
            return;
        };
        let identity = node.identity();

        for child_uid in node.children() {
            let Some(child) = self.graph.get(&child_uid) else { continue };
            let child_identity = child.identity();
            let remaining: Vec<OwnerReference> = child.owners().into_iter().filter(|r| r.uid != uid).collect();
            let scoped = self.store.scope(child_identity.scopes.clone());
            let patch = Patch::Merge(serde_json::json!({ "owner_references": remaining }));
            if let Err(err) = scoped.patch(&child_identity.resource, &child_identity.name, patch, WriteOptions::default()).await {
                if !matches!(err, StoreError::NotFound) {
                    tracing::warn!(uid = %uid, child = %child_uid, error = %err, "failed to strip owner reference while orphaning");
                    self.to_orphan.add_rate_limited(uid);
                    return;
                }
            }
        }

        if let Err(err) = self
            .remove_finalizer(identity.resource.clone(), identity.name.clone(), identity.scopes.clone(), finalizers::ORPHAN)
            .await
        {
            tracing::warn!(uid = %uid, error = %err, "failed to remove orphan finalizer");
            self.to_orphan.add_rate_limited(uid);
        }
    }

    /// Retry-on-conflict loop bounded by [`FINALIZER_REMOVE_ATTEMPTS`]
    /// (spec §4.9/§7).
    async fn remove_finalizer(&self, resource: String, name: String, scopes: Scope, finalizer: &str) -> Result<(), Error> {
        let scoped = self.store.scope(scopes);
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(200))
            .with_max_interval(Duration::from_secs(5))
            .with_multiplier(2.0)
            .with_max_elapsed_time(None)
            .build();

        for _ in 0..FINALIZER_REMOVE_ATTEMPTS {
            let obj = match scoped.get(&resource, &name, GetOptions::default()).await {
                Ok(obj) => obj,
                Err(StoreError::NotFound) => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            if !obj.has_finalizer(finalizer) {
                return Ok(());
            }
            let filtered: Vec<String> = obj.finalizers.iter().filter(|f| f.as_str() != finalizer).cloned().collect();
            let patch = Patch::Merge(serde_json::json!({
                "resource_version": obj.resource_version,
                "finalizers": filtered,
            }));
            match scoped.patch(&resource, &name, patch, WriteOptions::default()).await {
                Ok(_) => return Ok(()),
                Err(StoreError::Conflict) => {
                    let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(1));
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(StoreError::NotFound) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::FinalizerRemovalExhausted)
    }

    /// Patches `resourceVersion` + a filtered `ownerReferences` list, removing
    /// every UID in `remove` (spec §4.9 `deleteOwnerReferences`).
    async fn delete_owner_references(&self, live: &Object, remove: &[Uid]) -> Result<(), Error> {
        let keep: Vec<OwnerReference> = live.owner_references.iter().filter(|r| !remove.contains(&r.uid)).cloned().collect();
        let patch = Patch::Merge(serde_json::json!({
            "resource_version": live.resource_version,
            "owner_references": keep,
        }));
        let scoped = self.store.scope(live.scopes.clone());
        scoped.patch(&live.resource, &live.name, patch, WriteOptions::default()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::builder::{ChangeKind, GraphBuilder};
    use crate::gc::graph::Identity;
    use crate::object::Scope;
    use crate::store::memory::MemoryStore;
    use crate::store::WriteOptions as WO;

    fn widget(resource: &str, name: &str, scopes: Scope) -> Object {
        Object {
            name: name.into(),
            uid: String::new(),
            resource: resource.into(),
            scopes,
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

    async fn setup() -> (Arc<MemoryStore>, Arc<Graph>, DeleteOrphanWorkers, GraphBuilder, mpsc::UnboundedReceiver<ChangeEvent>) {
        let store = Arc::new(MemoryStore::new());
        let graph = Arc::new(Graph::new());
        let to_delete: WorkQueue<Uid> = WorkQueue::new();
        let to_orphan: WorkQueue<Uid> = WorkQueue::new();
        let (builder, rx) = GraphBuilder::new(graph.clone(), to_delete.clone(), to_orphan.clone());
        let collector = DeleteOrphanWorkers::new(graph.clone(), store.clone() as Arc<dyn Store>, to_delete, to_orphan, builder.sender());
        (store, graph, collector, builder, rx)
    }

    #[tokio::test]
    async fn dangling_owner_reference_is_stripped_and_object_deleted() {
        let (store, graph, collector, builder, mut rx) = setup().await;

        let child = store
            .create(widget("employee", "alice", Scope::root()), WO::default())
            .await
            .unwrap();
        let mut child = child;
        child.owner_references.push(OwnerReference {
            uid: "missing-uid".into(),
            resource: "zoo".into(),
            name: "main".into(),
            scopes: Scope::root(),
            block_owner_deletion: true,
            controller: true,
        });
        let child = store.update(child, WO::default()).await.unwrap();

        builder.process(ChangeEvent {
            uid: child.uid.clone(),
            identity: Identity { resource: child.resource.clone(), name: child.name.clone(), scopes: child.scopes.clone() },
            owners: child.owner_references.clone(),
            kind: ChangeKind::Add,
            virtual_: false,
            deleting: false,
            finalizers: vec![],
        });

        assert!(graph.get(&"missing-uid".to_string()).unwrap().is_virtual());

        // drain the verification item queued for the virtual owner: the
        // owner Get comes back NotFound, so a virtual delete is emitted.
        collector.attempt_to_delete("missing-uid".to_string()).await;
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        builder.process(event);
        assert!(graph.get(&"missing-uid".to_string()).is_none());

        // the cascade enqueues the child; attempt-to-delete on it classifies
        // the dangling ref and deletes it (no solid owners remain).
        collector.attempt_to_delete(child.uid.clone()).await;
        let err = store.get("employee", "alice", GetOptions::default()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
        assert!(graph.is_cached_absent(&("zoo".to_string(), "main".to_string(), Scope::root())));
    }

    #[tokio::test]
    async fn orphan_strips_owner_reference_from_children() {
        let (store, graph, collector, builder, _rx) = setup().await;
        let owner = store.create(widget("zoo", "main", Scope::root()), WO::default()).await.unwrap();
        let mut child = store
            .create(widget("employee", "alice", Scope::root().with("zoo", "main")), WO::default())
            .await
            .unwrap();
        child.owner_references.push(OwnerReference {
            uid: owner.uid.clone(),
            resource: "zoo".into(),
            name: "main".into(),
            scopes: Scope::root(),
            block_owner_deletion: false,
            controller: true,
        });
        let child = store.update(child, WO::default()).await.unwrap();

        builder.process(ChangeEvent::from_object(&owner, ChangeKind::Add));
        builder.process(ChangeEvent::from_object(&child, ChangeKind::Add));

        let node = graph.get(&owner.uid).unwrap();
        assert_eq!(node.children(), vec![child.uid.clone()]);

        collector.attempt_to_orphan(owner.uid.clone()).await;
        let updated_child = store.get("employee", "alice", GetOptions::default()).await.unwrap();
        assert!(updated_child.owner_references.iter().all(|r| r.uid != owner.uid));
    }
}
