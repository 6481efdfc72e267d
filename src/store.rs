//! The [`Store`] contract every backend (etcd, MongoDB, in-memory, ...) must
//! satisfy, plus the error taxonomy every component classifies failures into.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::object::{Object, Scope};

/// The failure taxonomy every [`Store`] implementation must classify its
/// errors into (see spec §7). Components branch on `kind()`, never on the
/// concrete backend error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object not found")]
    NotFound,
    #[error("object already exists")]
    AlreadyExists,
    #[error("optimistic concurrency conflict")]
    Conflict,
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("internal store error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound => ErrorKind::NotFound,
            Error::AlreadyExists => ErrorKind::AlreadyExists,
            Error::Conflict => ErrorKind::Conflict,
            Error::BadRequest(_) => ErrorKind::BadRequest,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

/// Coarse classification of a [`Error`], used by components that only care
/// about the kind and not the concrete variant (e.g. garbage collector
/// classification logic).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Conflict,
    BadRequest,
    Cancelled,
    Internal,
}

pub type Result<T> = std::result::Result<T, Error>;

/// How a [`Store::delete`] should propagate to dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PropagationPolicy {
    /// Dependents are deleted asynchronously by the garbage collector.
    #[default]
    Background,
    /// The object is not hard-deleted until its blocking dependents are gone.
    Foreground,
    /// Dependents are released (their owner references to this object are
    /// stripped) rather than deleted.
    Orphan,
}

/// A label or field selector requirement, `key {=,!=} value`.
#[derive(Debug, Clone)]
pub struct Requirement {
    pub key: String,
    pub value: String,
    pub negate: bool,
}

/// Options accepted by [`Store::list`] and [`Store::watch`].
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub include_sub_scopes: bool,
    pub send_initial_events: bool,
    pub resource_version: Option<u64>,
    pub label_requirements: Vec<Requirement>,
    pub field_requirements: Vec<Requirement>,
    pub page_size: Option<usize>,
    pub continue_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub resource_version: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct WriteOptions {}

#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    pub propagation_policy: PropagationPolicy,
}

/// A page of objects returned by [`Store::list`].
#[derive(Debug, Clone, Default)]
pub struct ObjectList {
    pub items: Vec<Object>,
    pub continue_token: Option<String>,
    pub resource_version: u64,
}

/// A JSON-Patch or JSON-Merge-Patch body for [`Store::patch`].
#[derive(Debug, Clone)]
pub enum Patch {
    Json(json_patch::Patch),
    Merge(Value),
}

/// A single change observed on a watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Create(Object),
    Update(Object),
    Delete(Object),
    /// Marks the end of the initial snapshot (when `send_initial_events` was
    /// requested) or carries a resume checkpoint.
    Bookmark { resource_version: u64 },
}

/// A live watch. Dropping it (or calling [`Watcher::stop`]) ends the stream.
#[async_trait]
pub trait Watcher: Send {
    /// Receives the next event, or `Ok(None)` once the stream ends cleanly.
    async fn next(&mut self) -> Result<Option<WatchEvent>>;

    fn stop(&mut self);
}

/// Restricted handle for updating only an object's `status` subresource.
#[async_trait]
pub trait StatusStorage: Send + Sync {
    async fn update_status(&self, resource: &str, name: &str, status: Value) -> Result<Object>;
}

/// The sole external dependency of every component in this crate: a generic
/// object store scoped by containment hierarchy.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, resource: &str, name: &str, opts: GetOptions) -> Result<Object>;

    async fn list(&self, resource: &str, opts: ListOptions) -> Result<ObjectList>;

    async fn count(&self, resource: &str, opts: ListOptions) -> Result<usize>;

    async fn create(&self, obj: Object, opts: WriteOptions) -> Result<Object>;

    async fn update(&self, obj: Object, opts: WriteOptions) -> Result<Object>;

    async fn patch(&self, resource: &str, name: &str, patch: Patch, opts: WriteOptions) -> Result<Object>;

    async fn delete(&self, resource: &str, name: &str, opts: DeleteOptions) -> Result<()>;

    async fn watch(&self, resource: &str, opts: ListOptions) -> Result<Box<dyn Watcher>>;

    /// Returns a view of this store narrowed to the given scope; all
    /// subsequent operations through the returned handle are implicitly
    /// prefixed by it.
    fn scope(&self, scope: Scope) -> Box<dyn Store>;

    fn status(&self) -> Box<dyn StatusStorage>;

    /// The [`Scope`] this handle is narrowed to, or the root scope.
    fn current_scope(&self) -> Scope;
}
