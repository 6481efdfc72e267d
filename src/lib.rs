//! A reusable, Kubernetes-style controller runtime over a generic object [`Store`].
//!
//! This crate is deliberately decoupled from any concrete storage backend or
//! wire format. Given a [`Store`] implementation, it provides:
//!
//! - a deduplicating, delay-capable work queue ([`queue`]),
//! - watch-driven [`Source`](source::Source)s that feed keys into a queue,
//! - cooperative [`lease`]-backed leader election,
//! - a [`Controller`](controller::Controller) that binds sources, a queue and
//!   a reconciler together, and a [`ControllerManager`](manager::ControllerManager)
//!   that runs several of them,
//! - a finalizer-aware reconciler wrapper ([`reconciler`]),
//! - and a concurrent ownership-graph [`GarbageCollector`](gc::GarbageCollector).

pub mod controller;
pub mod gc;
pub mod lease;
pub mod manager;
pub mod object;
pub mod queue;
pub mod reconcile;
pub mod reconciler;
pub mod source;
pub mod store;
pub mod utils;

pub use controller::Controller;
pub use gc::GarbageCollector;
pub use manager::ControllerManager;
pub use object::{Object, OwnerReference, Scope, ScopedKey};
pub use reconcile::{Action, Context, ReQueueError};
pub use reconciler::BetterReconciler;
pub use store::Store;
