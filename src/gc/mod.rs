//! Ownership-graph garbage collection: watches every monitored resource,
//! maintains a [`Graph`] of owner/child relationships, and drives deletion or
//! orphaning of dependents whose owners are gone (spec §4.8/§4.9).
pub mod builder;
pub mod collector;
pub mod graph;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::object::Uid;
use crate::queue::WorkQueue;
use crate::store::Store;

pub use builder::{ChangeEvent, ChangeKind, GraphBuilder};
pub use collector::DeleteOrphanWorkers;
pub use graph::{Graph, Identity, Node, DEFAULT_ABSENT_OWNER_CAPACITY};

/// Wires a [`Graph`], [`GraphBuilder`] and [`GarbageCollector`] into a single
/// runnable unit that watches a fixed set of resources on one [`Store`].
pub struct GarbageCollector {
    store: Arc<dyn Store>,
    resources: Vec<String>,
    graph: Arc<Graph>,
    builder: Arc<GraphBuilder>,
    gc: Arc<DeleteOrphanWorkers>,
    changes_rx: parking_lot::Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<ChangeEvent>>>,
}

impl GarbageCollector {
    /// `resources` is the fixed set of resource types this collector monitors
    /// for ownership relationships; every object type that can appear in an
    /// `OwnerReference` must be included.
    pub fn new(store: Arc<dyn Store>, resources: Vec<String>) -> Self {
        Self::with_absent_owner_capacity(store, resources, DEFAULT_ABSENT_OWNER_CAPACITY)
    }

    pub fn with_absent_owner_capacity(store: Arc<dyn Store>, resources: Vec<String>, absent_owner_capacity: usize) -> Self {
        let graph = Arc::new(Graph::with_absent_owner_capacity(absent_owner_capacity));
        let to_delete: WorkQueue<Uid> = WorkQueue::new();
        let to_orphan: WorkQueue<Uid> = WorkQueue::new();
        let (builder, changes_rx) = GraphBuilder::new(graph.clone(), to_delete.clone(), to_orphan.clone());
        let builder = Arc::new(builder);
        let gc = Arc::new(DeleteOrphanWorkers::new(graph.clone(), store.clone(), to_delete, to_orphan, builder.sender()));
        GarbageCollector {
            store,
            resources,
            graph,
            builder,
            gc,
            changes_rx: parking_lot::Mutex::new(Some(changes_rx)),
        }
    }

    pub fn graph(&self) -> Arc<Graph> {
        self.graph.clone()
    }

    /// Runs every watch loop, the single-writer graph builder, and the two
    /// single-concurrency delete/orphan worker loops until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let changes_rx = self
            .changes_rx
            .lock()
            .take()
            .expect("GarbageCollector::run called more than once");

        let mut tasks = tokio::task::JoinSet::new();
        for resource in self.resources.clone() {
            let builder = self.builder.clone();
            let store = self.store.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { builder.watch_resource(store, resource, cancel).await });
        }

        {
            let builder = self.builder.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { builder.run(changes_rx, cancel).await });
        }

        {
            let gc = self.gc.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { gc.run_delete_worker(cancel).await });
        }

        {
            let gc = self.gc.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { gc.run_orphan_worker(cancel).await });
        }

        while tasks.join_next().await.is_some() {}
    }
}
