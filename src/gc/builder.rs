//! Consumes watch events on every monitored resource, maintains the
//! [`Graph`], and emits work to the delete/orphan queues (spec §4.8).
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::gc::graph::{Graph, Identity};
use crate::object::{finalizers, Object, OwnerReference, Uid};
use crate::queue::WorkQueue;
use crate::store::{ListOptions, Store, WatchEvent};

/// What kind of transition a [`ChangeEvent`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Update,
    Delete,
}

/// One change observed (or synthesized) for a single object identity (spec §4.8).
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub uid: Uid,
    pub identity: Identity,
    pub owners: Vec<OwnerReference>,
    pub kind: ChangeKind,
    /// True when this event was synthesized by the collector's verification
    /// pass rather than observed directly on a watch stream.
    pub virtual_: bool,
    pub deleting: bool,
    pub finalizers: Vec<String>,
}

impl ChangeEvent {
    pub fn from_object(obj: &Object, kind: ChangeKind) -> Self {
        ChangeEvent {
            uid: obj.uid.clone(),
            identity: Identity {
                resource: obj.resource.clone(),
                name: obj.name.clone(),
                scopes: obj.scopes.clone(),
            },
            owners: obj.owner_references.clone(),
            kind,
            virtual_: false,
            deleting: obj.is_being_deleted(),
            finalizers: obj.finalizers.clone(),
        }
    }

    /// Synthesizes a delete for a node the collector could no longer confirm
    /// in the Store (spec §4.9 step 3's "enqueue a virtual delete event").
    pub fn virtual_delete(uid: Uid, identity: Identity) -> Self {
        ChangeEvent {
            uid,
            identity,
            owners: Vec::new(),
            kind: ChangeKind::Delete,
            virtual_: true,
            deleting: false,
            finalizers: Vec::new(),
        }
    }
}

/// Maintains the [`Graph`] from a stream of [`ChangeEvent`]s, and watches a
/// fixed set of monitored resources to produce them.
pub struct GraphBuilder {
    graph: Arc<Graph>,
    to_delete: WorkQueue<Uid>,
    to_orphan: WorkQueue<Uid>,
    changes_tx: mpsc::UnboundedSender<ChangeEvent>,
}

impl GraphBuilder {
    pub fn new(graph: Arc<Graph>, to_delete: WorkQueue<Uid>, to_orphan: WorkQueue<Uid>) -> (Self, mpsc::UnboundedReceiver<ChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            GraphBuilder {
                graph,
                to_delete,
                to_orphan,
                changes_tx: tx,
            },
            rx,
        )
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<ChangeEvent> {
        self.changes_tx.clone()
    }

    /// Watches `resource` on `store` until `cancel` fires, translating every
    /// Create/Update/Delete into a [`ChangeEvent`] fed to this builder.
    /// Restarts the watch with the standard retry backoff on any error
    /// (spec §4.2/§7), same envelope as [`crate::source::StoreSource`].
    pub async fn watch_resource(&self, store: Arc<dyn Store>, resource: String, cancel: CancellationToken) {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_secs(1))
            .with_max_interval(Duration::from_secs(30))
            .with_randomization_factor(0.1)
            .with_multiplier(2.0)
            .with_max_elapsed_time(None)
            .build();
        while !cancel.is_cancelled() {
            match self.watch_once(&store, &resource, &cancel).await {
                Ok(()) => break,
                Err(err) => {
                    tracing::warn!(resource = %resource, error = %err, "graph watch failed, restarting");
                    let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(30));
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn watch_once(&self, store: &Arc<dyn Store>, resource: &str, cancel: &CancellationToken) -> Result<(), crate::store::Error> {
        let opts = ListOptions {
            include_sub_scopes: true,
            send_initial_events: true,
            ..Default::default()
        };
        let mut watcher = store.watch(resource, opts).await?;
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    watcher.stop();
                    return Ok(());
                }
                event = watcher.next() => event?,
            };
            let Some(event) = event else {
                return Err(crate::store::Error::Internal("watch stream ended".into()));
            };
            let change = match event {
                WatchEvent::Create(obj) => Some(ChangeEvent::from_object(&obj, ChangeKind::Add)),
                WatchEvent::Update(obj) => Some(ChangeEvent::from_object(&obj, ChangeKind::Update)),
                WatchEvent::Delete(obj) => Some(ChangeEvent::from_object(&obj, ChangeKind::Delete)),
                WatchEvent::Bookmark { .. } => None,
            };
            if let Some(change) = change {
                let _ = self.changes_tx.send(change);
            }
        }
    }

    /// Drains `rx` with concurrency 1 so the graph's topology invariants hold
    /// under a single-writer model (spec §4.8/§5).
    pub async fn run(&self, mut rx: mpsc::UnboundedReceiver<ChangeEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = rx.recv() => event,
            };
            let Some(event) = event else { return };
            self.process(event);
        }
    }

    pub fn process(&self, event: ChangeEvent) {
        let existing = self.graph.get(&event.uid);

        if let Some(node) = &existing {
            let not_virtual_delete = !(event.kind == ChangeKind::Delete && event.virtual_);
            if not_virtual_delete && !node.is_observed() {
                let old_identity = node.identity();
                if old_identity != event.identity {
                    for child_uid in node.children() {
                        if let Some(child) = self.graph.get(&child_uid) {
                            let still_matches =
                                child.owners().iter().any(|r| node.owner_ref_matches(r) && event.identity.matches_ref(r));
                            if !still_matches {
                                self.to_delete.add(child_uid);
                            }
                        }
                    }
                }
                node.set_identity(event.identity.clone());
                node.mark_observed();
            }
        }

        match (existing, event.kind) {
            (None, ChangeKind::Add) | (None, ChangeKind::Update) => {
                let node = self.graph.create(event.uid.clone(), event.identity.clone(), event.owners.clone(), event.finalizers.clone());
                self.add_dependent_to_owners(&node, &event.owners);
                self.process_transitions(&node, event.deleting, &event.finalizers);
            }
            (Some(node), ChangeKind::Add) | (Some(node), ChangeKind::Update) => {
                let old_owners = node.owners();
                let (added, removed, changed) = diff_owners(&old_owners, &event.owners);
                if !added.is_empty() || !removed.is_empty() || !changed.is_empty() {
                    node.set_owners(event.owners.clone());
                    for r in &removed {
                        if r.block_owner_deletion {
                            self.to_delete.add(r.uid.clone());
                        }
                    }
                    for (old, new) in &changed {
                        if old.block_owner_deletion && !new.block_owner_deletion {
                            self.to_delete.add(new.uid.clone());
                        }
                    }
                    for o in &event.owners {
                        let (owner_node, _created) = self.graph.get_or_create_virtual(o);
                        owner_node.add_child(node.uid.clone());
                    }
                    for r in &removed {
                        if let Some(owner_node) = self.graph.get(&r.uid) {
                            owner_node.remove_child(&node.uid);
                        }
                    }
                }
                node.set_finalizers(event.finalizers.clone());
                self.process_transitions(&node, event.deleting, &event.finalizers);
            }
            (Some(node), ChangeKind::Delete) => {
                let is_partial = event.virtual_ && (!node.is_virtual() || node.identity() != event.identity);
                if is_partial {
                    for child_uid in node.children() {
                        if let Some(child) = self.graph.get(&child_uid) {
                            if child.owners().iter().any(|r| node.owner_ref_matches(r)) {
                                self.to_delete.add(child_uid);
                            }
                        }
                    }
                    let identity = node.identity();
                    self.graph.cache_absent_owner((identity.resource, identity.name, identity.scopes));
                } else {
                    self.graph.remove(&event.uid);
                    for owner in node.owners() {
                        if let Some(owner_node) = self.graph.get(&owner.uid) {
                            owner_node.remove_child(&node.uid);
                        }
                    }
                    for child_uid in node.children() {
                        self.to_delete.add(child_uid);
                    }
                    for owner in node.owners() {
                        if let Some(owner_node) = self.graph.get(&owner.uid) {
                            if owner_node.is_deleting_children() {
                                self.to_delete.add(owner.uid.clone());
                            }
                        }
                    }
                }
            }
            (None, ChangeKind::Delete) => {}
        }
    }

    /// Adds `node` to each of `owners`' children sets, synthesizing virtual
    /// owner nodes (and queuing them for verification) where missing, and
    /// flagging `node` itself for re-evaluation if its scope or ref
    /// coordinates don't line up with the owner it claims (spec §4.8).
    fn add_dependent_to_owners(&self, node: &Arc<crate::gc::graph::Node>, owners: &[OwnerReference]) {
        let mut stale_ref = false;
        for owner_ref in owners {
            let (owner_node, created) = self.graph.get_or_create_virtual(owner_ref);
            owner_node.add_child(node.uid.clone());
            if created {
                self.to_delete.add(owner_ref.uid.clone());
            }
            let owner_identity = owner_node.identity();
            let scope_ok = owner_identity.scopes.is_ancestor_of(&node.identity().scopes);
            let coords_match = owner_identity.matches_ref(owner_ref);
            if !scope_ok || !coords_match {
                stale_ref = true;
            }
        }
        if stale_ref {
            self.to_delete.add(node.uid.clone());
        }
    }

    /// Reacts to a deletion timestamp newly observed on `node` (spec §4.8).
    fn process_transitions(&self, node: &Arc<crate::gc::graph::Node>, deleting: bool, node_finalizers: &[String]) {
        if !deleting {
            return;
        }
        node.mark_being_deleted();
        if node_finalizers.iter().any(|f| f == finalizers::ORPHAN) {
            self.to_orphan.add(node.uid.clone());
        } else if node_finalizers.iter().any(|f| f == finalizers::FOREGROUND_DELETION) {
            node.mark_deleting_children();
            for child_uid in node.children() {
                self.to_delete.add(child_uid);
            }
            self.to_delete.add(node.uid.clone());
        } else if node_finalizers.is_empty() {
            self.to_delete.add(node.uid.clone());
        }
    }
}

/// Splits old vs. new owner references into (added, removed, changed-by-uid).
#[allow(clippy::type_complexity)]
fn diff_owners(old: &[OwnerReference], new: &[OwnerReference]) -> (Vec<OwnerReference>, Vec<OwnerReference>, Vec<(OwnerReference, OwnerReference)>) {
    let mut added = Vec::new();
    let mut removed = Vec::new();
    let mut changed = Vec::new();
    for n in new {
        match old.iter().find(|o| o.uid == n.uid) {
            None => added.push(n.clone()),
            Some(o) if o != n => changed.push((o.clone(), n.clone())),
            Some(_) => {}
        }
    }
    for o in old {
        if !new.iter().any(|n| n.uid == o.uid) {
            removed.push(o.clone());
        }
    }
    (added, removed, changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Scope;

    fn owner_ref(uid: &str, block: bool) -> OwnerReference {
        OwnerReference {
            uid: uid.into(),
            resource: "zoo".into(),
            name: "main".into(),
            scopes: Scope::root(),
            block_owner_deletion: block,
            controller: true,
        }
    }

    fn builder() -> (GraphBuilder, Arc<Graph>, WorkQueue<Uid>, WorkQueue<Uid>) {
        let graph = Arc::new(Graph::new());
        let to_delete: WorkQueue<Uid> = WorkQueue::new();
        let to_orphan: WorkQueue<Uid> = WorkQueue::new();
        let (builder, _rx) = GraphBuilder::new(graph.clone(), to_delete.clone(), to_orphan.clone());
        (builder, graph, to_delete, to_orphan)
    }

    #[tokio::test]
    async fn new_child_creates_virtual_owner_and_queues_verification() {
        let (builder, graph, to_delete, _) = builder();
        let event = ChangeEvent {
            uid: "child-1".into(),
            identity: Identity {
                resource: "employee".into(),
                name: "alice".into(),
                scopes: Scope::root().with("zoo", "main"),
            },
            owners: vec![owner_ref("owner-1", true)],
            kind: ChangeKind::Add,
            virtual_: false,
            deleting: false,
            finalizers: vec![],
        };
        builder.process(event);
        let owner = graph.get(&"owner-1".to_string()).unwrap();
        assert!(owner.is_virtual());
        assert_eq!(owner.children(), vec!["child-1".to_string()]);
        let queued = to_delete.get().await.unwrap();
        assert_eq!(queued, "owner-1".to_string());
    }

    #[tokio::test]
    async fn foreground_delete_blocks_until_children_gone() {
        let (builder, graph, to_delete, _) = builder();
        builder.process(ChangeEvent {
            uid: "owner-1".into(),
            identity: Identity { resource: "zoo".into(), name: "main".into(), scopes: Scope::root() },
            owners: vec![],
            kind: ChangeKind::Add,
            virtual_: false,
            deleting: false,
            finalizers: vec![],
        });
        builder.process(ChangeEvent {
            uid: "child-1".into(),
            identity: Identity { resource: "employee".into(), name: "alice".into(), scopes: Scope::root().with("zoo", "main") },
            owners: vec![owner_ref("owner-1", true)],
            kind: ChangeKind::Add,
            virtual_: false,
            deleting: false,
            finalizers: vec![],
        });
        while to_delete.len() > 0 {
            let item = to_delete.get().await.unwrap();
            to_delete.done(&item);
        }

        builder.process(ChangeEvent {
            uid: "owner-1".into(),
            identity: Identity { resource: "zoo".into(), name: "main".into(), scopes: Scope::root() },
            owners: vec![],
            kind: ChangeKind::Update,
            virtual_: false,
            deleting: true,
            finalizers: vec![finalizers::FOREGROUND_DELETION.to_string()],
        });

        let owner = graph.get(&"owner-1".to_string()).unwrap();
        assert!(owner.is_deleting_children());
        let mut queued = std::collections::HashSet::new();
        queued.insert(to_delete.get().await.unwrap());
        queued.insert(to_delete.get().await.unwrap());
        assert!(queued.contains("child-1"));
        assert!(queued.contains("owner-1"));
    }
}
