//! The data model shared by every component: [`Scope`], [`ScopedKey`],
//! [`Object`] and [`OwnerReference`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An opaque, unique identifier assigned to an object on creation.
///
/// Two objects with the same [`Resource`] and [`Name`](Scope) may be created,
/// deleted and recreated over time; the UID disambiguates those incarnations.
pub type Uid = String;

/// The type tag of an object, e.g. `"widget"`.
pub type Resource = String;

/// One segment of a [`Scope`]: the resource type and name of a containing object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeSegment {
    pub resource: Resource,
    pub name: String,
}

impl fmt::Display for ScopeSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource, self.name)
    }
}

/// An ordered list of `(Resource, Name)` pairs naming the containment
/// hierarchy an object lives under.
///
/// Scopes form a total prefix order: scope `a` is "under" scope `b` iff `b`
/// is a prefix of `a`. Equality requires an exact sequence match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope(Vec<ScopeSegment>);

impl Scope {
    pub fn root() -> Self {
        Scope(Vec::new())
    }

    pub fn new(segments: Vec<ScopeSegment>) -> Self {
        Scope(segments)
    }

    pub fn push(&mut self, resource: impl Into<Resource>, name: impl Into<String>) {
        self.0.push(ScopeSegment {
            resource: resource.into(),
            name: name.into(),
        });
    }

    pub fn with(mut self, resource: impl Into<Resource>, name: impl Into<String>) -> Self {
        self.push(resource, name);
        self
    }

    pub fn segments(&self) -> &[ScopeSegment] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True iff `self` is a prefix of `other`, i.e. `other` is nested under `self`
    /// (or equal to it).
    pub fn is_ancestor_of(&self, other: &Scope) -> bool {
        self.0.len() <= other.0.len() && self.0.iter().zip(other.0.iter()).all(|(a, b)| a == b)
    }

    /// Serializes as `/R1/N1/R2/N2/...`.
    pub fn to_path(&self) -> String {
        let mut s = String::new();
        for seg in &self.0 {
            s.push('/');
            s.push_str(&seg.resource);
            s.push('/');
            s.push_str(&seg.name);
        }
        s
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_path())
    }
}

/// Error parsing a [`Scope`] from its path form.
#[derive(Debug, thiserror::Error)]
pub enum ScopeParseError {
    #[error("scope path must have an even number of segments, got {0}")]
    OddSegmentCount(usize),
}

impl FromStr for Scope {
    type Err = ScopeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').filter(|p| !p.is_empty()).collect();
        if parts.len() % 2 != 0 {
            return Err(ScopeParseError::OddSegmentCount(parts.len()));
        }
        let segments = parts
            .chunks(2)
            .map(|pair| ScopeSegment {
                resource: pair[0].to_string(),
                name: pair[1].to_string(),
            })
            .collect();
        Ok(Scope(segments))
    }
}

/// `(Resource, Name, Scopes)`: the reconciliation unit.
///
/// Two keys are equal iff all three components are equal; the type is
/// `Hash`-able so it can be used directly as a work-queue item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopedKey {
    pub resource: Resource,
    pub name: String,
    pub scopes: Scope,
}

impl ScopedKey {
    pub fn new(resource: impl Into<Resource>, name: impl Into<String>, scopes: Scope) -> Self {
        ScopedKey {
            resource: resource.into(),
            name: name.into(),
            scopes,
        }
    }
}

impl fmt::Display for ScopedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/{}", self.scopes, self.resource, self.name)
    }
}

/// A reference from a dependent object to one of its owners.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerReference {
    pub uid: Uid,
    pub resource: Resource,
    pub name: String,
    pub scopes: Scope,
    pub block_owner_deletion: bool,
    pub controller: bool,
}

/// Standard finalizer identifiers understood by the garbage collector.
pub mod finalizers {
    /// The owner is deleting its children before itself.
    pub const FOREGROUND_DELETION: &str = "foregroundDeletion";
    /// The owner is releasing its children without deleting them.
    pub const ORPHAN: &str = "orphan";
}

/// An entity managed through a [`Store`](crate::store::Store).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub name: String,
    pub uid: Uid,
    pub resource: Resource,
    pub scopes: Scope,
    pub resource_version: u64,
    pub creation_timestamp: DateTime<Utc>,
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default)]
    pub labels: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub status: serde_json::Value,
}

impl Object {
    pub fn key(&self) -> ScopedKey {
        ScopedKey::new(self.resource.clone(), self.name.clone(), self.scopes.clone())
    }

    pub fn is_being_deleted(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, name: &str) -> bool {
        self.finalizers.iter().any(|f| f == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_path_round_trips() {
        let scope = Scope::root().with("zoo", "main").with("cage", "3");
        let path = scope.to_path();
        assert_eq!(path, "/zoo/main/cage/3");
        let parsed: Scope = path.parse().unwrap();
        assert_eq!(parsed, scope);
    }

    #[test]
    fn scope_ancestor_check() {
        let root = Scope::root().with("zoo", "main");
        let child = root.clone().with("cage", "3");
        assert!(root.is_ancestor_of(&child));
        assert!(!child.is_ancestor_of(&root));
        assert!(root.is_ancestor_of(&root));
    }

    #[test]
    fn odd_path_segments_rejected() {
        let err = "/zoo/main/cage".parse::<Scope>().unwrap_err();
        assert!(matches!(err, ScopeParseError::OddSegmentCount(3)));
    }
}
