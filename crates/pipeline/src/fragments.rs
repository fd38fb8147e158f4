//! Concrete fragments, one per resource kind. All four persist through the
//! shared durable store; only the store-backed kinds reconcile.

use std::sync::Arc;

use anyhow::Result;
use argus_core::{Envelope, ResourceKind, SensorMessage};
use argus_persist::DurableStore;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::{ClusterSyncState, EventSink, Fragment};

/// The full fragment set central registers at startup.
pub fn standard_fragments(store: &Arc<dyn DurableStore>) -> Vec<Box<dyn Fragment>> {
    vec![
        Box::new(NodesFragment::new(Arc::clone(store))),
        Box::new(DeploymentsFragment::new(Arc::clone(store))),
        Box::new(ServicesFragment::new(Arc::clone(store))),
        Box::new(ListeningEndpointsFragment::new(Arc::clone(store))),
    ]
}

fn owns(kind: ResourceKind, env: &Envelope) -> bool {
    matches!(
        &env.msg,
        SensorMessage::Upsert { kind: k, .. } | SensorMessage::Delete { kind: k, .. } if *k == kind
    )
}

/// Applies one resource event to the durable store. Upserts and deletes map
/// onto the store's idempotent put/delete, so redelivery is harmless.
fn apply(store: &dyn DurableStore, kind: ResourceKind, env: &Envelope) -> Result<()> {
    match &env.msg {
        SensorMessage::Upsert { identity, payload, .. } => match payload {
            Some(body) => {
                debug!(cluster = %env.cluster_id, %kind, identity = %identity, "persisting upsert");
                store.put(&env.cluster_id, kind, identity, body)
            }
            None => {
                // Not a protocol violation, merely nothing to do.
                warn!(cluster = %env.cluster_id, %kind, identity = %identity, "upsert carried no payload; skipping");
                Ok(())
            }
        },
        SensorMessage::Delete { identity, .. } => {
            debug!(cluster = %env.cluster_id, %kind, identity = %identity, "persisting delete");
            store.delete(&env.cluster_id, kind, identity)
        }
        SensorMessage::ReconcileResponse { .. } => {
            warn!(cluster = %env.cluster_id, %kind, "reconcile response reached a fragment; dropping");
            Ok(())
        }
    }
}

/// Removes durable records for `kind` that the authoritative set no longer
/// contains. Healing is best-effort per key: a failed delete is logged and
/// counted, the rest of the keys proceed.
fn heal(
    store: &dyn DurableStore,
    kind: ResourceKind,
    cluster_id: &str,
    sync: &ClusterSyncState,
) -> Result<()> {
    let Some(authoritative) = sync.get(kind) else {
        debug!(cluster = %cluster_id, %kind, "no authoritative set delivered this pass; skipping");
        return Ok(());
    };
    let durable = store.list_keys(cluster_id, kind)?;
    let stale: Vec<&String> = durable.difference(authoritative).collect();
    if stale.is_empty() {
        debug!(cluster = %cluster_id, %kind, records = durable.len(), "no drift");
        return Ok(());
    }
    info!(cluster = %cluster_id, %kind, stale = stale.len(), "removing durable records missing upstream");
    let mut failed = 0u64;
    for identity in stale {
        // Same idempotent mutation path live deletes take.
        match store.delete(cluster_id, kind, identity) {
            Ok(()) => counter!("pipeline_reconcile_healed_total", 1u64, "kind" => kind.as_str()),
            Err(e) => {
                failed += 1;
                warn!(cluster = %cluster_id, %kind, identity = %identity, error = %e, "failed to remove stale record");
            }
        }
    }
    if failed > 0 {
        counter!("pipeline_reconcile_heal_failures_total", failed, "kind" => kind.as_str());
    }
    Ok(())
}

/// Persists node events and reconciles them against the sensor's live set.
pub struct NodesFragment {
    store: Arc<dyn DurableStore>,
}

impl NodesFragment {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl Fragment for NodesFragment {
    fn name(&self) -> &'static str {
        "nodes"
    }

    fn coverage(&self) -> &'static [ResourceKind] {
        &[ResourceKind::Node]
    }

    fn matches(&self, env: &Envelope) -> bool {
        owns(ResourceKind::Node, env)
    }

    async fn run(&self, env: &Envelope, _sink: &dyn EventSink) -> Result<()> {
        apply(self.store.as_ref(), ResourceKind::Node, env)
    }

    async fn reconcile(&self, cluster_id: &str, sync: &ClusterSyncState) -> Result<()> {
        heal(self.store.as_ref(), ResourceKind::Node, cluster_id, sync)
    }

    fn on_finish(&self, _cluster_id: &str) {}
}

pub struct DeploymentsFragment {
    store: Arc<dyn DurableStore>,
}

impl DeploymentsFragment {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl Fragment for DeploymentsFragment {
    fn name(&self) -> &'static str {
        "deployments"
    }

    fn coverage(&self) -> &'static [ResourceKind] {
        &[ResourceKind::Deployment]
    }

    fn matches(&self, env: &Envelope) -> bool {
        owns(ResourceKind::Deployment, env)
    }

    async fn run(&self, env: &Envelope, _sink: &dyn EventSink) -> Result<()> {
        apply(self.store.as_ref(), ResourceKind::Deployment, env)
    }

    async fn reconcile(&self, cluster_id: &str, sync: &ClusterSyncState) -> Result<()> {
        heal(self.store.as_ref(), ResourceKind::Deployment, cluster_id, sync)
    }

    fn on_finish(&self, _cluster_id: &str) {}
}

pub struct ServicesFragment {
    store: Arc<dyn DurableStore>,
}

impl ServicesFragment {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl Fragment for ServicesFragment {
    fn name(&self) -> &'static str {
        "services"
    }

    fn coverage(&self) -> &'static [ResourceKind] {
        &[ResourceKind::Service]
    }

    fn matches(&self, env: &Envelope) -> bool {
        owns(ResourceKind::Service, env)
    }

    async fn run(&self, env: &Envelope, _sink: &dyn EventSink) -> Result<()> {
        apply(self.store.as_ref(), ResourceKind::Service, env)
    }

    async fn reconcile(&self, cluster_id: &str, sync: &ClusterSyncState) -> Result<()> {
        heal(self.store.as_ref(), ResourceKind::Service, cluster_id, sync)
    }

    fn on_finish(&self, _cluster_id: &str) {}
}

/// Runtime listening-endpoint reports. Persisted like everything else, but
/// the sensor holds no authoritative store for them, so there is nothing to
/// reconcile.
pub struct ListeningEndpointsFragment {
    store: Arc<dyn DurableStore>,
}

impl ListeningEndpointsFragment {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl Fragment for ListeningEndpointsFragment {
    fn name(&self) -> &'static str {
        "listening-endpoints"
    }

    fn coverage(&self) -> &'static [ResourceKind] {
        &[ResourceKind::ListeningEndpoint]
    }

    fn matches(&self, env: &Envelope) -> bool {
        owns(ResourceKind::ListeningEndpoint, env)
    }

    async fn run(&self, env: &Envelope, _sink: &dyn EventSink) -> Result<()> {
        apply(self.store.as_ref(), ResourceKind::ListeningEndpoint, env)
    }

    async fn reconcile(&self, _cluster_id: &str, _sync: &ClusterSyncState) -> Result<()> {
        // Nothing to reconcile
        Ok(())
    }

    fn on_finish(&self, _cluster_id: &str) {}
}
