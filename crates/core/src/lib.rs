//! Herald core types: identities, watched resources, notification records and the
//! collaborator seams the reconciler talks to.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod classify;
pub mod dedup;
pub mod diff;
pub mod error;

pub use classify::{classify, Transitions};
pub use dedup::DedupCache;
pub use diff::{diff_specs, FieldChange, SpecDiff};
pub use error::{ClassifyError, NotifyError, StoreError};

/// `(namespace, name)` of a watched resource and of its companion record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub namespace: String,
    pub name: String,
}

impl Identity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Read-only view of the monitored workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchedResource {
    pub identity: Identity,
    /// Server-assigned object id; distinguishes a recreated object from its predecessor.
    #[serde(default)]
    pub uid: Option<String>,
    pub generation: i64,
    pub desired_replicas: i32,
    pub ready_replicas: i32,
    pub observed_generation: i64,
    /// Deletion timestamp set but the object is still in the store.
    pub deleting: bool,
    /// Opaque desired specification, kept for diffing.
    pub spec: serde_json::Value,
}

impl WatchedResource {
    /// The owning system has caught up with this generation and every desired replica is ready.
    pub fn is_ready(&self) -> bool {
        self.generation == self.observed_generation && self.ready_replicas == self.desired_replicas
    }

    pub fn snapshot(&self) -> SpecSnapshot {
        SpecSnapshot { uid: self.uid.clone(), generation: self.generation, spec: self.spec.clone() }
    }
}

/// Copy of a resource's spec as it was when a message was composed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecSnapshot {
    #[serde(default)]
    pub uid: Option<String>,
    pub generation: i64,
    pub spec: serde_json::Value,
}

impl SpecSnapshot {
    /// Whether this snapshot was taken of `resource` rather than of an earlier object
    /// with the same identity. Snapshots without a uid on either side are assumed to match.
    pub fn same_object(&self, resource: &WatchedResource) -> bool {
        match (&self.uid, &resource.uid) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

/// Durable record of what was last communicated about a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub identity: Identity,
    pub message: String,
    pub snapshot: SpecSnapshot,
    pub ready_generation: Option<i64>,
    /// Optimistic concurrency token; `None` until the record has been stored.
    pub version: Option<String>,
}

impl NotificationRecord {
    pub fn new(resource: &WatchedResource, message: impl Into<String>) -> Self {
        Self {
            identity: resource.identity.clone(),
            message: message.into(),
            snapshot: resource.snapshot(),
            ready_generation: None,
            version: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransitionKind {
    Created,
    Updated,
    Ready,
    Deleted,
}

impl TransitionKind {
    /// Kinds the dedup cache keeps a generation for.
    pub const TRACKED: [TransitionKind; 3] = [TransitionKind::Created, TransitionKind::Updated, TransitionKind::Ready];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Created => "created",
            TransitionKind::Updated => "updated",
            TransitionKind::Ready => "ready",
            TransitionKind::Deleted => "deleted",
        }
    }
}

/// Lifecycle event derived for one reconciliation pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Created { message: String },
    Updated { message: String, diff: SpecDiff },
    Ready { message: String },
    Deleted { message: String },
    NoOp,
}

impl Transition {
    pub fn kind(&self) -> Option<TransitionKind> {
        match self {
            Transition::Created { .. } => Some(TransitionKind::Created),
            Transition::Updated { .. } => Some(TransitionKind::Updated),
            Transition::Ready { .. } => Some(TransitionKind::Ready),
            Transition::Deleted { .. } => Some(TransitionKind::Deleted),
            Transition::NoOp => None,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Transition::Created { message }
            | Transition::Updated { message, .. }
            | Transition::Ready { message }
            | Transition::Deleted { message } => Some(message),
            Transition::NoOp => None,
        }
    }
}

/// What the event source observed for an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    Applied,
    Deleted,
}

/// Inbound "something about this resource changed" event. Delivery is at-least-once
/// and bursts for one identity may be coalesced; the reconciler re-reads state itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub identity: Identity,
    pub kind: SignalKind,
}

/// Outbound payload: `{"message": ..., "deploymentname": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub message: String,
    #[serde(rename = "deploymentname")]
    pub deployment_name: String,
}

impl Notification {
    pub fn new(identity: &Identity, message: impl Into<String>) -> Self {
        Self { message: message.into(), deployment_name: identity.to_string() }
    }
}

/// Where watched resources are read from.
#[async_trait::async_trait]
pub trait ResourceSource: Send + Sync {
    /// `Ok(None)` when the resource no longer exists.
    async fn get(&self, identity: &Identity) -> Result<Option<WatchedResource>, StoreError>;
}

/// Keyed datastore for notification records with optimistic concurrency.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, identity: &Identity) -> Result<Option<NotificationRecord>, StoreError>;

    /// Fails with [`StoreError::AlreadyExists`] when a record is already stored.
    async fn create(&self, record: &NotificationRecord) -> Result<NotificationRecord, StoreError>;

    /// Fails with [`StoreError::Conflict`] when `record.version` is stale.
    async fn replace(&self, record: &NotificationRecord) -> Result<NotificationRecord, StoreError>;
}

/// Fire-and-forget notification sink. Implementations do not retry.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

pub mod prelude {
    pub use super::{
        Identity, Notification, NotificationRecord, Notifier, RecordStore, ResourceSource, Signal, SignalKind, SpecSnapshot,
        Transition, TransitionKind, WatchedResource,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_serializes_wire_shape() {
        let n = Notification::new(&Identity::new("ns", "app"), "hello");
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(v, serde_json::json!({ "message": "hello", "deploymentname": "ns/app" }));
    }

    #[test]
    fn readiness_requires_caught_up_generation() {
        let mut r = WatchedResource {
            identity: Identity::new("ns", "app"),
            uid: None,
            generation: 2,
            desired_replicas: 3,
            ready_replicas: 3,
            observed_generation: 1,
            deleting: false,
            spec: serde_json::json!({ "replicas": 3 }),
        };
        assert!(!r.is_ready());
        r.observed_generation = 2;
        assert!(r.is_ready());
        r.ready_replicas = 2;
        assert!(!r.is_ready());
    }

    #[test]
    fn snapshot_matches_only_its_own_object() {
        let mut r = WatchedResource {
            identity: Identity::new("ns", "app"),
            uid: Some("u1".into()),
            generation: 1,
            desired_replicas: 1,
            ready_replicas: 1,
            observed_generation: 1,
            deleting: false,
            spec: serde_json::json!({}),
        };
        let snap = r.snapshot();
        assert!(snap.same_object(&r));
        r.uid = Some("u2".into());
        assert!(!snap.same_object(&r));
        r.uid = None;
        assert!(snap.same_object(&r));
    }
}
