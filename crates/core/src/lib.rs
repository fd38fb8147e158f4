//! Argus core types: resource kinds, the sensor/central message taxonomy,
//! and the `Observed` seam that store wrappers implement.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Category of cluster object tracked by the platform.
///
/// Every kind has its own normalization wrapper on the sensor side and its
/// own pipeline fragment on the central side. Adding a kind means adding
/// those two pieces; nothing here needs to grow beyond the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Node,
    Deployment,
    Service,
    /// Runtime listening-endpoint reports (process + port). Ephemeral data:
    /// persisted, but never reconciled against a live set.
    ListeningEndpoint,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Node,
        ResourceKind::Deployment,
        ResourceKind::Service,
        ResourceKind::ListeningEndpoint,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Node => "node",
            ResourceKind::Deployment => "deployment",
            ResourceKind::Service => "service",
            ResourceKind::ListeningEndpoint => "listening-endpoint",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "node" => Ok(ResourceKind::Node),
            "deployment" => Ok(ResourceKind::Deployment),
            "service" => Ok(ResourceKind::Service),
            "listening-endpoint" => Ok(ResourceKind::ListeningEndpoint),
            other => Err(format!("unknown resource kind: {other}")),
        }
    }
}

/// Set of identities the sensor currently holds for one kind.
///
/// BTreeSet keeps serialization and diff output deterministic.
pub type IdentitySet = BTreeSet<String>;

/// A message originating from a sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum SensorMessage {
    /// A resource was created or updated. `payload` is the last-observed
    /// upstream representation, opaque to everything but the owning
    /// fragment. An absent payload is tolerated downstream as a no-op.
    Upsert {
        kind: ResourceKind,
        identity: String,
        payload: Option<serde_json::Value>,
    },
    /// A resource went away.
    Delete { kind: ResourceKind, identity: String },
    /// Reply to a [`CentralMessage::ReconcileRequest`]: the authoritative
    /// identity set for `kind`, taken from the live store.
    ReconcileResponse { kind: ResourceKind, ids: IdentitySet },
}

impl SensorMessage {
    pub fn kind(&self) -> ResourceKind {
        match self {
            SensorMessage::Upsert { kind, .. }
            | SensorMessage::Delete { kind, .. }
            | SensorMessage::ReconcileResponse { kind, .. } => *kind,
        }
    }

    /// Short action label used for metrics tagging.
    pub fn action(&self) -> &'static str {
        match self {
            SensorMessage::Upsert { .. } => "upsert",
            SensorMessage::Delete { .. } => "delete",
            SensorMessage::ReconcileResponse { .. } => "reconcile-response",
        }
    }
}

/// A sensor message together with its originating cluster.
///
/// Produced by the sensor, owned by the dispatcher until handed to exactly
/// one matching fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub cluster_id: String,
    pub msg: SensorMessage,
}

impl Envelope {
    pub fn new(cluster_id: impl Into<String>, msg: SensorMessage) -> Self {
        Self { cluster_id: cluster_id.into(), msg }
    }
}

/// A message from central to a sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum CentralMessage {
    /// Ask the sensor for its authoritative identity set for `kind`.
    ReconcileRequest { kind: ResourceKind },
}

/// A normalized, comparable view of one observed cluster object.
///
/// Implementations own the kind-specific derived comparison set: the store
/// only asks whether two wraps of the same identity agree on it. The set is
/// expected to be canonicalized at construction (filtered, deduplicated,
/// sorted) so the comparison is a cheap ordered walk.
pub trait Observed: Send + Sync + 'static {
    /// Stable unique key within this kind and cluster.
    fn identity(&self) -> &str;

    /// Whether the derived comparison set equals `prior`'s. Untracked
    /// payload fields never participate.
    fn derived_matches(&self, prior: &Self) -> bool;

    /// The raw upstream representation forwarded to central.
    fn payload(&self) -> &serde_json::Value;
}
