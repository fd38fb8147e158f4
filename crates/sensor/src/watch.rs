//! Kubernetes watch wiring: one watcher task per tracked kind, all feeding
//! the ingest loop's event channel.

use anyhow::Result;
use futures::TryStreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::{
    api::Api,
    runtime::watcher::{self, Event},
    Client,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{KindObject, ResourceEvent, WatchAction};

async fn forward<K>(
    label: &'static str,
    api: Api<K>,
    to_object: fn(K) -> KindObject,
    tx: mpsc::Sender<ResourceEvent>,
) -> Result<()>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug + Send + 'static,
{
    let cfg = watcher::Config::default();
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);
    info!(kind = %label, "watcher started");
    while let Some(ev) = stream.try_next().await? {
        match ev {
            Event::Applied(o) => {
                let _ = tx
                    .send(ResourceEvent { action: WatchAction::Applied, object: to_object(o) })
                    .await;
            }
            Event::Deleted(o) => {
                let _ = tx
                    .send(ResourceEvent { action: WatchAction::Deleted, object: to_object(o) })
                    .await;
            }
            Event::Restarted(list) => {
                // Relist after a watch gap: replay as upserts and let the
                // stores' change detection suppress the no-op noise.
                debug!(kind = %label, count = list.len(), "watch restart");
                for o in list {
                    let _ = tx
                        .send(ResourceEvent { action: WatchAction::Applied, object: to_object(o) })
                        .await;
                }
            }
        }
    }
    warn!(kind = %label, "watcher stream ended");
    Ok(())
}

/// Starts a watcher per tracked kind. Tasks end when their stream errors
/// terminally or when the ingest side drops the receiver.
pub fn spawn_watchers(
    client: Client,
    tx: mpsc::Sender<ResourceEvent>,
) -> Vec<tokio::task::JoinHandle<Result<()>>> {
    let nodes: Api<Node> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client.clone());
    let services: Api<Service> = Api::all(client);
    vec![
        tokio::spawn(forward("node", nodes, |n| KindObject::Node(Box::new(n)), tx.clone())),
        tokio::spawn(forward(
            "deployment",
            deployments,
            |d| KindObject::Deployment(Box::new(d)),
            tx.clone(),
        )),
        tokio::spawn(forward("service", services, |s| KindObject::Service(Box::new(s)), tx)),
    ]
}
