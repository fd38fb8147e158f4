//! Argus sensor: per-kind authoritative stores, the ingest loop that
//! decides which changes are worth forwarding, and the reconcile-request
//! responder.

#![forbid(unsafe_code)]

pub mod watch;
pub mod wrap;

use std::sync::Arc;

use anyhow::{Context, Result};
use argus_core::{CentralMessage, Envelope, IdentitySet, Observed, ResourceKind, SensorMessage};
use argus_store::ResourceStore;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Service};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::wrap::{DeploymentWrap, NodeWrap, ServiceWrap};

/// What the watch layer observed happen to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Applied,
    Deleted,
}

/// A typed cluster object as delivered by the watch layer.
#[derive(Debug, Clone)]
pub enum KindObject {
    Node(Box<Node>),
    Deployment(Box<Deployment>),
    Service(Box<Service>),
}

/// One ingestion event from the cluster watch layer.
#[derive(Debug, Clone)]
pub struct ResourceEvent {
    pub action: WatchAction,
    pub object: KindObject,
}

/// All per-kind authoritative stores for one sensor process.
///
/// Exclusively owned by the process instance that created them; constructed
/// explicitly and handed to the ingest loop, never ambient state.
#[derive(Default)]
pub struct SensorStores {
    pub nodes: ResourceStore<NodeWrap>,
    pub deployments: ResourceStore<DeploymentWrap>,
    pub services: ResourceStore<ServiceWrap>,
}

impl SensorStores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authoritative identity set for a store-backed kind; None for kinds
    /// the sensor does not track live.
    pub fn identities(&self, kind: ResourceKind) -> Option<IdentitySet> {
        match kind {
            ResourceKind::Node => Some(self.nodes.identities()),
            ResourceKind::Deployment => Some(self.deployments.identities()),
            ResourceKind::Service => Some(self.services.identities()),
            ResourceKind::ListeningEndpoint => None,
        }
    }
}

/// Applies one watch event to the owning store and forwards it downstream
/// when it matters. Deletes always forward; upserts only when the derived
/// comparison set changed, so untracked churn (relabels, status noise)
/// never floods the channel.
pub async fn handle_event(
    cluster_id: &str,
    stores: &SensorStores,
    event: ResourceEvent,
    out_tx: &mpsc::Sender<Envelope>,
) -> Result<()> {
    match &event.object {
        KindObject::Node(node) => {
            apply_observed(cluster_id, ResourceKind::Node, &stores.nodes, NodeWrap::new(node)?, event.action, out_tx)
                .await
        }
        KindObject::Deployment(deployment) => {
            apply_observed(
                cluster_id,
                ResourceKind::Deployment,
                &stores.deployments,
                DeploymentWrap::new(deployment)?,
                event.action,
                out_tx,
            )
            .await
        }
        KindObject::Service(service) => {
            apply_observed(
                cluster_id,
                ResourceKind::Service,
                &stores.services,
                ServiceWrap::new(service)?,
                event.action,
                out_tx,
            )
            .await
        }
    }
}

async fn apply_observed<T: Observed>(
    cluster_id: &str,
    kind: ResourceKind,
    store: &ResourceStore<T>,
    wrap: T,
    action: WatchAction,
    out_tx: &mpsc::Sender<Envelope>,
) -> Result<()> {
    let identity = wrap.identity().to_string();
    match action {
        WatchAction::Applied => {
            let payload = wrap.payload().clone();
            if store.upsert(wrap) {
                out_tx
                    .send(Envelope::new(
                        cluster_id,
                        SensorMessage::Upsert { kind, identity, payload: Some(payload) },
                    ))
                    .await
                    .context("outbound channel closed")?;
            } else {
                counter!("sensor_suppressed_updates_total", 1u64, "kind" => kind.as_str());
                debug!(%kind, identity = %identity, "no significant change; suppressing update");
            }
        }
        WatchAction::Deleted => {
            store.remove(&identity);
            out_tx
                .send(Envelope::new(cluster_id, SensorMessage::Delete { kind, identity }))
                .await
                .context("outbound channel closed")?;
        }
    }
    Ok(())
}

/// Spawns the ingest loop for one cluster connection.
///
/// Watch events are applied to the stores and forwarded when significant;
/// reconcile requests from central are answered out of the live identity
/// sets. Either input channel closing ends the loop; both close together
/// on connection teardown.
pub fn spawn_ingest(
    cluster_id: String,
    stores: Arc<SensorStores>,
    mut events: mpsc::Receiver<ResourceEvent>,
    mut requests: mpsc::Receiver<CentralMessage>,
    cap: usize,
) -> (mpsc::Receiver<Envelope>, tokio::task::JoinHandle<()>) {
    let (out_tx, out_rx) = mpsc::channel(cap);
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => {
                        if let Err(e) = handle_event(&cluster_id, &stores, event, &out_tx).await {
                            warn!(cluster = %cluster_id, error = %e, "dropping unprocessable watch event");
                        }
                    }
                    None => {
                        debug!(cluster = %cluster_id, "watch event channel closed; stopping ingest loop");
                        break;
                    }
                },
                maybe = requests.recv() => match maybe {
                    Some(CentralMessage::ReconcileRequest { kind }) => {
                        match stores.identities(kind) {
                            Some(ids) => {
                                info!(cluster = %cluster_id, %kind, live = ids.len(), "answering reconcile request");
                                let _ = out_tx
                                    .send(Envelope::new(
                                        cluster_id.clone(),
                                        SensorMessage::ReconcileResponse { kind, ids },
                                    ))
                                    .await;
                            }
                            None => {
                                warn!(cluster = %cluster_id, %kind, "reconcile request for untracked kind; ignoring");
                            }
                        }
                    }
                    None => {
                        debug!(cluster = %cluster_id, "central channel closed; stopping ingest loop");
                        break;
                    }
                },
            }
        }
        info!(cluster = %cluster_id, "ingest loop stopped");
    });
    (out_rx, handle)
}
