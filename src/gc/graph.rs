//! The ownership graph: a thread-safe UID→[`Node`] map plus a bounded
//! absent-owner LRU (spec §3/§4.8).
use std::collections::VecDeque;
use std::sync::Arc;

use ahash::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};

use crate::object::{OwnerReference, Resource, Scope, Uid};

/// The coordinates a [`Node`] currently believes it has: its `Resource`,
/// `Name` and containing `Scope`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub resource: Resource,
    pub name: String,
    pub scopes: Scope,
}

impl Identity {
    pub fn matches_ref(&self, r: &OwnerReference) -> bool {
        self.resource == r.resource && self.name == r.name && self.scopes == r.scopes
    }
}

/// One vertex of the ownership graph.
///
/// Each flag is independently guarded (spec §3): a node's identity, owner
/// list and children set can each be read/written without contending on the
/// others, and without ever taking a lock on another `Node`.
pub struct Node {
    pub uid: Uid,
    identity: RwLock<Identity>,
    owners: RwLock<Vec<OwnerReference>>,
    children: RwLock<HashSet<Uid>>,
    finalizers: RwLock<Vec<String>>,
    /// Synthesized from a child's owner reference, never observed by a watch event.
    virtual_: Mutex<bool>,
    /// Set once any create/update event for this UID has been processed.
    observed: Mutex<bool>,
    /// DeletionTimestamp has been seen non-nil.
    being_deleted: Mutex<bool>,
    /// The `foregroundDeletion` finalizer is present: children must go first.
    deleting_children: Mutex<bool>,
}

impl Node {
    fn new(uid: Uid, identity: Identity, owners: Vec<OwnerReference>, finalizers: Vec<String>, virtual_: bool) -> Self {
        Node {
            uid,
            identity: RwLock::new(identity),
            owners: RwLock::new(owners),
            children: RwLock::new(HashSet::default()),
            finalizers: RwLock::new(finalizers),
            virtual_: Mutex::new(virtual_),
            observed: Mutex::new(!virtual_),
            being_deleted: Mutex::new(false),
            deleting_children: Mutex::new(false),
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity.read().clone()
    }

    pub fn set_identity(&self, identity: Identity) {
        *self.identity.write() = identity;
    }

    pub fn owners(&self) -> Vec<OwnerReference> {
        self.owners.read().clone()
    }

    pub fn set_owners(&self, owners: Vec<OwnerReference>) {
        *self.owners.write() = owners;
    }

    pub fn finalizers(&self) -> Vec<String> {
        self.finalizers.read().clone()
    }

    pub fn set_finalizers(&self, finalizers: Vec<String>) {
        *self.finalizers.write() = finalizers;
    }

    pub fn children(&self) -> Vec<Uid> {
        self.children.read().iter().cloned().collect()
    }

    pub fn add_child(&self, child: Uid) {
        self.children.write().insert(child);
    }

    pub fn remove_child(&self, child: &Uid) {
        self.children.write().remove(child);
    }

    pub fn is_virtual(&self) -> bool {
        *self.virtual_.lock()
    }

    pub fn clear_virtual(&self) {
        *self.virtual_.lock() = false;
    }

    pub fn is_observed(&self) -> bool {
        *self.observed.lock()
    }

    pub fn mark_observed(&self) {
        *self.observed.lock() = true;
        self.clear_virtual();
    }

    pub fn is_being_deleted(&self) -> bool {
        *self.being_deleted.lock()
    }

    pub fn mark_being_deleted(&self) {
        *self.being_deleted.lock() = true;
    }

    pub fn is_deleting_children(&self) -> bool {
        *self.deleting_children.lock()
    }

    pub fn mark_deleting_children(&self) {
        *self.deleting_children.lock() = true;
    }

    /// True iff `r` refers to this node by UID. Owner references always
    /// carry the target's UID, so UID equality alone is authoritative;
    /// `Identity::matches_ref` is the separate check callers use to confirm
    /// an owner's claimed coordinates still agree with what was observed.
    pub fn owner_ref_matches(&self, r: &OwnerReference) -> bool {
        r.uid == self.uid
    }
}

struct AbsentOwnerCache {
    capacity: usize,
    order: VecDeque<(Resource, String, Scope)>,
    present: HashSet<(Resource, String, Scope)>,
}

impl AbsentOwnerCache {
    fn new(capacity: usize) -> Self {
        AbsentOwnerCache {
            capacity,
            order: VecDeque::new(),
            present: HashSet::default(),
        }
    }

    fn insert(&mut self, key: (Resource, String, Scope)) {
        if self.present.contains(&key) {
            return;
        }
        if self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.present.remove(&evicted);
            }
        }
        self.order.push_back(key.clone());
        self.present.insert(key);
    }

    fn contains(&self, key: &(Resource, String, Scope)) -> bool {
        self.present.contains(key)
    }

    fn remove(&mut self, key: &(Resource, String, Scope)) {
        self.present.remove(key);
        self.order.retain(|k| k != key);
    }
}

/// Default bounded capacity for the absent-owner LRU (spec §3: "500-1000").
pub const DEFAULT_ABSENT_OWNER_CAPACITY: usize = 500;

/// The concurrent in-memory DAG of owner/child object identities.
pub struct Graph {
    nodes: RwLock<HashMap<Uid, Arc<Node>>>,
    absent_owners: Mutex<AbsentOwnerCache>,
}

impl Graph {
    pub fn new() -> Self {
        Self::with_absent_owner_capacity(DEFAULT_ABSENT_OWNER_CAPACITY)
    }

    pub fn with_absent_owner_capacity(capacity: usize) -> Self {
        Graph {
            nodes: RwLock::new(HashMap::default()),
            absent_owners: Mutex::new(AbsentOwnerCache::new(capacity)),
        }
    }

    pub fn get(&self, uid: &Uid) -> Option<Arc<Node>> {
        self.nodes.read().get(uid).cloned()
    }

    pub fn create(&self, uid: Uid, identity: Identity, owners: Vec<OwnerReference>, finalizers: Vec<String>) -> Arc<Node> {
        let node = Arc::new(Node::new(uid.clone(), identity, owners, finalizers, false));
        self.nodes.write().insert(uid, node.clone());
        node
    }

    /// Returns the existing node for `r.uid`, or synthesizes a virtual one
    /// from the owner reference's claimed coordinates.
    pub fn get_or_create_virtual(&self, r: &OwnerReference) -> (Arc<Node>, bool) {
        if let Some(existing) = self.get(&r.uid) {
            return (existing, false);
        }
        let mut nodes = self.nodes.write();
        if let Some(existing) = nodes.get(&r.uid) {
            return (existing.clone(), false);
        }
        let identity = Identity {
            resource: r.resource.clone(),
            name: r.name.clone(),
            scopes: r.scopes.clone(),
        };
        let node = Arc::new(Node::new(r.uid.clone(), identity, Vec::new(), Vec::new(), true));
        nodes.insert(r.uid.clone(), node.clone());
        (node, true)
    }

    pub fn remove(&self, uid: &Uid) -> Option<Arc<Node>> {
        self.nodes.write().remove(uid)
    }

    pub fn contains(&self, uid: &Uid) -> bool {
        self.nodes.read().contains_key(uid)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cache_absent_owner(&self, key: (Resource, String, Scope)) {
        self.absent_owners.lock().insert(key);
    }

    pub fn is_cached_absent(&self, key: &(Resource, String, Scope)) -> bool {
        self.absent_owners.lock().contains(key)
    }

    pub fn forget_absent_owner(&self, key: &(Resource, String, Scope)) {
        self.absent_owners.lock().remove(key);
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str) -> Identity {
        Identity {
            resource: "widget".into(),
            name: name.into(),
            scopes: Scope::root(),
        }
    }

    #[test]
    fn virtual_node_is_cleared_on_observation() {
        let graph = Graph::new();
        let owner_ref = OwnerReference {
            uid: "owner-1".into(),
            resource: "widget".into(),
            name: "parent".into(),
            scopes: Scope::root(),
            block_owner_deletion: true,
            controller: true,
        };
        let (node, created) = graph.get_or_create_virtual(&owner_ref);
        assert!(created);
        assert!(node.is_virtual());
        node.mark_observed();
        assert!(!node.is_virtual());
    }

    #[test]
    fn absent_owner_cache_evicts_oldest_past_capacity() {
        let graph = Graph::with_absent_owner_capacity(2);
        let a = ("widget".to_string(), "a".to_string(), Scope::root());
        let b = ("widget".to_string(), "b".to_string(), Scope::root());
        let c = ("widget".to_string(), "c".to_string(), Scope::root());
        graph.cache_absent_owner(a.clone());
        graph.cache_absent_owner(b.clone());
        graph.cache_absent_owner(c.clone());
        assert!(!graph.is_cached_absent(&a));
        assert!(graph.is_cached_absent(&b));
        assert!(graph.is_cached_absent(&c));
    }

    #[test]
    fn children_are_tracked_on_the_owner_node() {
        let graph = Graph::new();
        let owner = graph.create("owner-1".into(), identity("parent"), vec![], vec![]);
        owner.add_child("child-1".into());
        assert_eq!(owner.children(), vec!["child-1".to_string()]);
        owner.remove_child(&"child-1".to_string());
        assert!(owner.children().is_empty());
    }
}
