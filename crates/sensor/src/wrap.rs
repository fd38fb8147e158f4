//! Kind-specific normalization wrappers.
//!
//! Each wrapper extracts the derived comparison set for its kind at
//! construction time: filter to the recognized subset, parse and validate,
//! drop invalid entries, deduplicate, sort. Two logically-equal sets then
//! compare equal regardless of upstream ordering, which is what makes the
//! store's change-significance check a cheap ordered walk.

use std::net::IpAddr;

use anyhow::{anyhow, Context, Result};
use argus_core::Observed;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use smallvec::SmallVec;

/// Stable identity: the object's UID when present, else namespace/name.
fn object_identity(meta: &ObjectMeta) -> Option<String> {
    if let Some(uid) = &meta.uid {
        return Some(uid.clone());
    }
    let name = meta.name.as_deref()?;
    Some(match meta.namespace.as_deref() {
        Some(ns) => format!("{ns}/{name}"),
        None => name.to_string(),
    })
}

/// A node with its tracked network addresses as the derived comparison set.
///
/// Only InternalIP and ExternalIP address types are tracked; entries that
/// fail to parse as IPs are discarded. A node relabel that does not alter
/// its addresses is not a significant change.
pub struct NodeWrap {
    name: String,
    addresses: SmallVec<[IpAddr; 4]>,
    payload: serde_json::Value,
}

impl NodeWrap {
    pub fn new(node: &Node) -> Result<Self> {
        let name = node
            .metadata
            .name
            .clone()
            .ok_or_else(|| anyhow!("node missing metadata.name"))?;
        let mut addresses: SmallVec<[IpAddr; 4]> = SmallVec::new();
        for addr in node.status.iter().flat_map(|s| s.addresses.iter().flatten()) {
            if addr.type_ != "InternalIP" && addr.type_ != "ExternalIP" {
                continue;
            }
            if let Ok(ip) = addr.address.parse::<IpAddr>() {
                addresses.push(ip);
            }
        }
        addresses.sort_unstable();
        addresses.dedup();
        let payload = serde_json::to_value(node).context("serializing node")?;
        Ok(Self { name, addresses, payload })
    }

    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }
}

impl Observed for NodeWrap {
    fn identity(&self) -> &str {
        &self.name
    }

    fn derived_matches(&self, prior: &Self) -> bool {
        self.addresses == prior.addresses
    }

    fn payload(&self) -> &serde_json::Value {
        &self.payload
    }
}

/// A service with its cluster IPs and port numbers as the derived set.
pub struct ServiceWrap {
    identity: String,
    cluster_ips: SmallVec<[IpAddr; 2]>,
    ports: SmallVec<[i32; 4]>,
    payload: serde_json::Value,
}

impl ServiceWrap {
    pub fn new(service: &Service) -> Result<Self> {
        let identity = object_identity(&service.metadata)
            .ok_or_else(|| anyhow!("service missing identifying metadata"))?;
        let mut cluster_ips: SmallVec<[IpAddr; 2]> = SmallVec::new();
        let mut ports: SmallVec<[i32; 4]> = SmallVec::new();
        if let Some(spec) = &service.spec {
            // clusterIPs supersedes the single clusterIP field when set.
            // Headless services report "None", which fails the IP parse and
            // drops out here.
            let ips = spec
                .cluster_ips
                .as_deref()
                .filter(|ips| !ips.is_empty())
                .map(|ips| ips.to_vec())
                .or_else(|| spec.cluster_ip.clone().map(|ip| vec![ip]))
                .unwrap_or_default();
            cluster_ips.extend(ips.iter().filter_map(|ip| ip.parse().ok()));
            ports.extend(spec.ports.iter().flatten().map(|p| p.port));
        }
        cluster_ips.sort_unstable();
        cluster_ips.dedup();
        ports.sort_unstable();
        ports.dedup();
        let payload = serde_json::to_value(service).context("serializing service")?;
        Ok(Self { identity, cluster_ips, ports, payload })
    }

    pub fn cluster_ips(&self) -> &[IpAddr] {
        &self.cluster_ips
    }

    pub fn ports(&self) -> &[i32] {
        &self.ports
    }
}

impl Observed for ServiceWrap {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn derived_matches(&self, prior: &Self) -> bool {
        self.cluster_ips == prior.cluster_ips && self.ports == prior.ports
    }

    fn payload(&self) -> &serde_json::Value {
        &self.payload
    }
}

/// A deployment with its container images as the derived set.
pub struct DeploymentWrap {
    identity: String,
    images: SmallVec<[String; 4]>,
    payload: serde_json::Value,
}

impl DeploymentWrap {
    pub fn new(deployment: &Deployment) -> Result<Self> {
        let identity = object_identity(&deployment.metadata)
            .ok_or_else(|| anyhow!("deployment missing identifying metadata"))?;
        let mut images: SmallVec<[String; 4]> = SmallVec::new();
        if let Some(spec) = &deployment.spec {
            if let Some(pod) = &spec.template.spec {
                images.extend(pod.containers.iter().filter_map(|c| c.image.clone()));
            }
        }
        images.sort_unstable();
        images.dedup();
        let payload = serde_json::to_value(deployment).context("serializing deployment")?;
        Ok(Self { identity, images, payload })
    }

    pub fn images(&self) -> &[String] {
        &self.images
    }
}

impl Observed for DeploymentWrap {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn derived_matches(&self, prior: &Self) -> bool {
        self.images == prior.images
    }

    fn payload(&self) -> &serde_json::Value {
        &self.payload
    }
}
