//! Central-side message pipeline: the per-kind fragment contract and the
//! dispatcher that routes each inbound envelope to exactly one fragment.
//!
//! Reconcile-response messages never reach the dispatcher; the connection
//! layer resolves them against the pending authoritative fetch before
//! resource events are routed here.

#![forbid(unsafe_code)]

pub mod fragments;

use anyhow::Result;
use argus_core::{CentralMessage, Envelope, IdentitySet, ResourceKind};
use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::{error, warn};

/// Last-known authoritative identity sets for one cluster, one entry per
/// kind. Built fresh for every reconciliation pass and superseded
/// wholesale; never mutated between passes.
#[derive(Debug, Default, Clone)]
pub struct ClusterSyncState {
    sets: FxHashMap<ResourceKind, IdentitySet>,
}

impl ClusterSyncState {
    pub fn insert(&mut self, kind: ResourceKind, ids: IdentitySet) {
        self.sets.insert(kind, ids);
    }

    /// None means the sensor never delivered a set for `kind` this pass,
    /// which is distinct from an empty set (everything deleted upstream).
    pub fn get(&self, kind: ResourceKind) -> Option<&IdentitySet> {
        self.sets.get(&kind)
    }
}

/// Side-effect sink injected into fragments so `run` stays testable without
/// a live connection.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, cluster_id: &str, msg: CentralMessage) -> Result<()>;
}

/// Sink that discards everything. For fragments without side effects, and
/// for offline replay.
pub struct NullSink;

#[async_trait::async_trait]
impl EventSink for NullSink {
    async fn send(&self, _cluster_id: &str, _msg: CentralMessage) -> Result<()> {
        Ok(())
    }
}

/// A polymorphic unit of message handling, one per resource kind.
///
/// New kinds are added by implementing this trait and registering the
/// fragment, never by growing the dispatcher.
#[async_trait::async_trait]
pub trait Fragment: Send + Sync {
    /// Stable name used in logs and registration diagnostics.
    fn name(&self) -> &'static str;

    /// Kinds this fragment owns. Checked for cross-fragment exclusivity at
    /// registration time.
    fn coverage(&self) -> &'static [ResourceKind];

    /// Pure routing predicate. Total, side-effect free, and true for at
    /// most the message variants this fragment owns.
    fn matches(&self, env: &Envelope) -> bool;

    /// Apply one message to durable storage. Must be idempotent: delivery
    /// is at-least-once and redelivery must leave state unchanged. A
    /// structurally absent payload is a logged no-op, not an error.
    async fn run(&self, env: &Envelope, sink: &dyn EventSink) -> Result<()>;

    /// Remove durable records absent from the authoritative set delivered
    /// in `sync`. Fragments with nothing to reconcile return Ok
    /// immediately.
    async fn reconcile(&self, cluster_id: &str, sync: &ClusterSyncState) -> Result<()>;

    /// Release any per-cluster resources on connection teardown.
    fn on_finish(&self, cluster_id: &str);
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no fragment registered for {action} message of kind {kind}")]
    Unroutable { kind: ResourceKind, action: &'static str },
    #[error("fragments {first} and {second} both cover kind {kind}")]
    CoverageConflict {
        first: &'static str,
        second: &'static str,
        kind: ResourceKind,
    },
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

/// Routes each inbound envelope to the first matching fragment. Owns no
/// state beyond the registered fragment list.
pub struct Dispatcher {
    fragments: Vec<Box<dyn Fragment>>,
}

impl Dispatcher {
    /// Registers `fragments` in order, rejecting the set outright if two
    /// fragments claim the same kind. Silent order-dependent routing is a
    /// latent correctness risk; overlap is a startup error, not a
    /// tie-break.
    pub fn new(fragments: Vec<Box<dyn Fragment>>) -> Result<Self, PipelineError> {
        let mut owners: FxHashMap<ResourceKind, &'static str> = FxHashMap::default();
        for fragment in &fragments {
            for &kind in fragment.coverage() {
                if let Some(first) = owners.insert(kind, fragment.name()) {
                    return Err(PipelineError::CoverageConflict {
                        first,
                        second: fragment.name(),
                        kind,
                    });
                }
            }
        }
        Ok(Self { fragments })
    }

    /// Routes `env` to its owning fragment and runs it.
    ///
    /// The ingestion counter is bumped before the handler so throughput
    /// observability is unaffected by handler failures. An envelope no
    /// fragment accepts is a configuration error, surfaced as
    /// [`PipelineError::Unroutable`].
    pub async fn dispatch(&self, env: &Envelope, sink: &dyn EventSink) -> Result<(), PipelineError> {
        let fragment = self
            .fragments
            .iter()
            .find(|f| f.matches(env))
            .ok_or(PipelineError::Unroutable {
                kind: env.msg.kind(),
                action: env.msg.action(),
            })?;
        counter!(
            "pipeline_messages_total",
            1u64,
            "kind" => env.msg.kind().as_str(),
            "action" => env.msg.action()
        );
        fragment.run(env, sink).await.map_err(PipelineError::Handler)
    }

    /// Runs every fragment's reconcile hook for one cluster. Reconciliation
    /// is pass-independent per fragment: an error is logged and counted but
    /// does not stop the remaining fragments.
    pub async fn reconcile_all(&self, cluster_id: &str, sync: &ClusterSyncState) {
        for fragment in &self.fragments {
            if let Err(e) = fragment.reconcile(cluster_id, sync).await {
                counter!("pipeline_reconcile_errors_total", 1u64, "fragment" => fragment.name());
                error!(cluster = %cluster_id, fragment = %fragment.name(), error = %e, "fragment reconcile failed");
            }
        }
    }

    /// Invoked when a cluster's connection is torn down.
    pub fn finish_cluster(&self, cluster_id: &str) {
        warn!(cluster = %cluster_id, "cluster connection finished; releasing fragment resources");
        for fragment in &self.fragments {
            fragment.on_finish(cluster_id);
        }
    }

    pub fn fragments(&self) -> &[Box<dyn Fragment>] {
        &self.fragments
    }
}

#[cfg(test)]
mod tests {
    use super::fragments::standard_fragments;
    use super::*;
    use argus_core::SensorMessage;
    use argus_persist::{DurableStore, MemoryStore};
    use serde_json::json;
    use std::sync::Arc;

    fn upsert(kind: ResourceKind, id: &str) -> Envelope {
        Envelope::new(
            "c1",
            SensorMessage::Upsert {
                kind,
                identity: id.into(),
                payload: Some(json!({"name": id})),
            },
        )
    }

    fn delete(kind: ResourceKind, id: &str) -> Envelope {
        Envelope::new("c1", SensorMessage::Delete { kind, identity: id.into() })
    }

    #[test]
    fn every_well_formed_message_has_exactly_one_owner() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let dispatcher = Dispatcher::new(standard_fragments(&store)).unwrap();
        for kind in ResourceKind::ALL {
            for env in [upsert(kind, "x"), delete(kind, "x")] {
                let owners = dispatcher.fragments().iter().filter(|f| f.matches(&env)).count();
                assert_eq!(owners, 1, "{kind} {} must have one owner", env.msg.action());
            }
        }
    }

    #[test]
    fn overlapping_coverage_is_rejected_at_registration() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let mut frags = standard_fragments(&store);
        frags.push(Box::new(super::fragments::NodesFragment::new(Arc::clone(&store))));
        match Dispatcher::new(frags) {
            Err(PipelineError::CoverageConflict { kind, .. }) => {
                assert_eq!(kind, ResourceKind::Node)
            }
            Err(other) => panic!("expected coverage conflict, got {other:?}"),
            Ok(_) => panic!("overlapping fragments must not register"),
        }
    }

    #[tokio::test]
    async fn unroutable_message_is_surfaced() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let nodes_only: Vec<Box<dyn Fragment>> =
            vec![Box::new(super::fragments::NodesFragment::new(Arc::clone(&store)))];
        let dispatcher = Dispatcher::new(nodes_only).unwrap();
        let err = dispatcher
            .dispatch(&upsert(ResourceKind::Service, "svc"), &NullSink)
            .await
            .unwrap_err();
        match err {
            PipelineError::Unroutable { kind, action } => {
                assert_eq!(kind, ResourceKind::Service);
                assert_eq!(action, "upsert");
            }
            other => panic!("expected unroutable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatch_applies_upserts_and_deletes_idempotently() {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn DurableStore> = store.clone();
        let dispatcher = Dispatcher::new(standard_fragments(&dyn_store)).unwrap();

        // At-least-once delivery: applying the same upsert twice leaves the
        // same durable state as applying it once.
        for _ in 0..2 {
            dispatcher.dispatch(&upsert(ResourceKind::Node, "n1"), &NullSink).await.unwrap();
        }
        assert_eq!(store.list_keys("c1", ResourceKind::Node).unwrap().len(), 1);

        for _ in 0..2 {
            dispatcher.dispatch(&delete(ResourceKind::Node, "n1"), &NullSink).await.unwrap();
        }
        assert!(store.list_keys("c1", ResourceKind::Node).unwrap().is_empty());
    }

    #[tokio::test]
    async fn absent_payload_is_a_logged_noop() {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn DurableStore> = store.clone();
        let dispatcher = Dispatcher::new(standard_fragments(&dyn_store)).unwrap();
        let env = Envelope::new(
            "c1",
            SensorMessage::Upsert {
                kind: ResourceKind::Deployment,
                identity: "d1".into(),
                payload: None,
            },
        );
        dispatcher.dispatch(&env, &NullSink).await.unwrap();
        assert!(store.list_keys("c1", ResourceKind::Deployment).unwrap().is_empty());
    }
}
