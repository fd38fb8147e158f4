//! Reconciliation coordinator: periodic and on-connect diff-and-heal passes
//! that correct drift the at-least-once delete stream cannot cover.
//!
//! Adds and updates are self-correcting (a later upsert overwrites an
//! earlier one); a missed delete has no future message that corrects it, so
//! full-set comparison against the sensor's authoritative sets is the only
//! recovery mechanism.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use argus_core::{IdentitySet, ResourceKind};
use argus_pipeline::{ClusterSyncState, Dispatcher};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Requests a sensor's current authoritative identity set for one kind,
/// blocking on the transport round trip.
#[async_trait::async_trait]
pub trait AuthoritativeSource: Send + Sync {
    async fn fetch(&self, cluster_id: &str, kind: ResourceKind) -> Result<IdentitySet>;
}

/// Where a (cluster, kind) pair currently sits in its reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PassState {
    #[default]
    Idle,
    /// Authoritative set requested, waiting on the transport.
    InProgress,
    /// Authoritative set in hand, durable keys being compared.
    Diffing,
    /// Stale keys being deleted, best-effort per key.
    Healing,
}

/// Connection lifecycle events feeding the coordinator loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    Connected(String),
    Disconnected(String),
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Interval between timer-driven passes over connected clusters.
    pub interval: Duration,
    /// Bound on one authoritative-set round trip; expiry abandons the pass
    /// for that kind only.
    pub fetch_timeout: Duration,
    /// Kinds with a sensor-side authoritative store. Ephemeral kinds are
    /// never fetched; their fragments have nothing to reconcile anyway.
    pub kinds: Vec<ResourceKind>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            fetch_timeout: Duration::from_secs(30),
            kinds: vec![ResourceKind::Node, ResourceKind::Deployment, ResourceKind::Service],
        }
    }
}

impl ReconcileConfig {
    /// Defaults overridable via `ARGUS_RECONCILE_INTERVAL_SECS` and
    /// `ARGUS_RECONCILE_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.interval = Duration::from_secs(env_secs("ARGUS_RECONCILE_INTERVAL_SECS", 3600));
        cfg.fetch_timeout = Duration::from_secs(env_secs("ARGUS_RECONCILE_TIMEOUT_SECS", 30));
        cfg
    }
}

fn env_secs(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

/// Drives reconciliation passes per (cluster, kind) and tracks each pair's
/// [`PassState`].
pub struct Coordinator {
    source: Arc<dyn AuthoritativeSource>,
    dispatcher: Arc<Dispatcher>,
    config: ReconcileConfig,
    states: Mutex<FxHashMap<(String, ResourceKind), PassState>>,
}

impl Coordinator {
    pub fn new(
        source: Arc<dyn AuthoritativeSource>,
        dispatcher: Arc<Dispatcher>,
        config: ReconcileConfig,
    ) -> Self {
        Self { source, dispatcher, config, states: Mutex::new(FxHashMap::default()) }
    }

    pub fn state(&self, cluster_id: &str, kind: ResourceKind) -> PassState {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.get(&(cluster_id.to_string(), kind)).copied().unwrap_or_default()
    }

    fn set_state(&self, cluster_id: &str, kind: ResourceKind, next: PassState) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let prev = states.insert((cluster_id.to_string(), kind), next).unwrap_or_default();
        debug!(cluster = %cluster_id, %kind, ?prev, ?next, "pass state transition");
    }

    /// Resets every state for `cluster_id` to Idle without completing the
    /// pass. No partial credit: the next pass starts fresh.
    fn abandon(&self, cluster_id: &str) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.retain(|(cluster, _), _| cluster != cluster_id);
    }

    /// One full pass for `cluster_id`: fetch the authoritative set for each
    /// configured kind (bounded per round trip), build a fresh
    /// [`ClusterSyncState`] wholesale, then let every fragment heal against
    /// it. Kinds whose fetch fails or times out sit this pass out.
    pub async fn run_pass(&self, cluster_id: &str) {
        let t0 = Instant::now();
        let mut sync = ClusterSyncState::default();
        let mut fetched: Vec<ResourceKind> = Vec::new();
        for &kind in &self.config.kinds {
            self.set_state(cluster_id, kind, PassState::InProgress);
            match timeout(self.config.fetch_timeout, self.source.fetch(cluster_id, kind)).await {
                Ok(Ok(ids)) => {
                    self.set_state(cluster_id, kind, PassState::Diffing);
                    debug!(cluster = %cluster_id, %kind, live = ids.len(), "authoritative set received");
                    sync.insert(kind, ids);
                    fetched.push(kind);
                }
                Ok(Err(e)) => {
                    counter!("reconcile_fetch_failures_total", 1u64, "kind" => kind.as_str());
                    warn!(cluster = %cluster_id, %kind, error = %e, "authoritative set request failed; skipping kind this pass");
                    self.set_state(cluster_id, kind, PassState::Idle);
                }
                Err(_) => {
                    counter!("reconcile_fetch_timeouts_total", 1u64, "kind" => kind.as_str());
                    warn!(
                        cluster = %cluster_id,
                        %kind,
                        timeout_secs = self.config.fetch_timeout.as_secs(),
                        "authoritative set request timed out; skipping kind this pass"
                    );
                    self.set_state(cluster_id, kind, PassState::Idle);
                }
            }
        }
        if fetched.is_empty() {
            warn!(cluster = %cluster_id, "no authoritative sets received; nothing to heal");
            return;
        }
        for &kind in &fetched {
            self.set_state(cluster_id, kind, PassState::Healing);
        }
        self.dispatcher.reconcile_all(cluster_id, &sync).await;
        for &kind in &fetched {
            self.set_state(cluster_id, kind, PassState::Idle);
        }
        info!(
            cluster = %cluster_id,
            kinds = fetched.len(),
            took_ms = %t0.elapsed().as_millis(),
            "reconciliation pass complete"
        );
    }

    /// Runs a pass unless shutdown fires first; an interrupted pass is
    /// dropped mid-await and its states reset to Idle.
    async fn guarded_pass(&self, cluster_id: &str, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = shutdown.changed() => {
                warn!(cluster = %cluster_id, "reconciliation pass abandoned by shutdown");
                self.abandon(cluster_id);
                false
            }
            _ = self.run_pass(cluster_id) => true,
        }
    }

    /// Coordinator loop: connection events trigger immediate passes, the
    /// interval timer sweeps all connected clusters, shutdown stops
    /// everything. Disconnects abandon any state for the cluster and tear
    /// down fragment resources.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ClusterEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut connected: BTreeSet<String> = BTreeSet::new();
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("shutdown; stopping reconciliation loop");
                    break;
                }
                maybe = events.recv() => match maybe {
                    Some(ClusterEvent::Connected(cluster)) => {
                        info!(cluster = %cluster, "cluster connected; starting reconciliation pass");
                        connected.insert(cluster.clone());
                        let mut pass_shutdown = shutdown.clone();
                        if !self.guarded_pass(&cluster, &mut pass_shutdown).await {
                            break;
                        }
                    }
                    Some(ClusterEvent::Disconnected(cluster)) => {
                        connected.remove(&cluster);
                        self.abandon(&cluster);
                        self.dispatcher.finish_cluster(&cluster);
                    }
                    None => {
                        debug!("cluster event channel closed; stopping reconciliation loop");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    for cluster in connected.clone() {
                        let mut pass_shutdown = shutdown.clone();
                        if !self.guarded_pass(&cluster, &mut pass_shutdown).await {
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_persist::{DurableStore, MemoryStore};
    use argus_pipeline::fragments::standard_fragments;
    use serde_json::json;

    struct StaticSource {
        sets: FxHashMap<(String, ResourceKind), IdentitySet>,
    }

    impl StaticSource {
        fn new() -> Self {
            Self { sets: FxHashMap::default() }
        }

        fn with(mut self, cluster: &str, kind: ResourceKind, ids: &[&str]) -> Self {
            self.sets.insert(
                (cluster.to_string(), kind),
                ids.iter().map(|s| s.to_string()).collect(),
            );
            self
        }
    }

    #[async_trait::async_trait]
    impl AuthoritativeSource for StaticSource {
        async fn fetch(&self, cluster_id: &str, kind: ResourceKind) -> Result<IdentitySet> {
            self.sets
                .get(&(cluster_id.to_string(), kind))
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no set for {cluster_id}/{kind}"))
        }
    }

    /// Never answers; exercises the round-trip timeout.
    struct StalledSource;

    #[async_trait::async_trait]
    impl AuthoritativeSource for StalledSource {
        async fn fetch(&self, _cluster_id: &str, _kind: ResourceKind) -> Result<IdentitySet> {
            std::future::pending().await
        }
    }

    fn seeded_store(cluster: &str, kind: ResourceKind, ids: &[&str]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for id in ids {
            store.put(cluster, kind, id, &json!({"name": id})).unwrap();
        }
        store
    }

    fn coordinator(
        store: &Arc<MemoryStore>,
        source: Arc<dyn AuthoritativeSource>,
        config: ReconcileConfig,
    ) -> Coordinator {
        let dyn_store: Arc<dyn DurableStore> = store.clone();
        let dispatcher = Arc::new(Dispatcher::new(standard_fragments(&dyn_store)).unwrap());
        Coordinator::new(source, dispatcher, config)
    }

    #[tokio::test]
    async fn pass_converges_durable_keys_to_intersection() {
        let store = seeded_store("x", ResourceKind::Node, &["a", "b", "c"]);
        let source = Arc::new(
            StaticSource::new()
                .with("x", ResourceKind::Node, &["b", "c", "d"])
                .with("x", ResourceKind::Deployment, &[])
                .with("x", ResourceKind::Service, &[]),
        );
        let coord = coordinator(&store, source, ReconcileConfig::default());
        coord.run_pass("x").await;
        let keys = store.list_keys("x", ResourceKind::Node).unwrap();
        assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec!["b", "c"]);
        for kind in [ResourceKind::Node, ResourceKind::Deployment, ResourceKind::Service] {
            assert_eq!(coord.state("x", kind), PassState::Idle);
        }
    }

    #[tokio::test]
    async fn fetch_failure_skips_that_kind_only() {
        let store = seeded_store("x", ResourceKind::Node, &["a", "b"]);
        store.put("x", ResourceKind::Deployment, "dep", &json!({})).unwrap();
        // Deployments and services never answer; nodes still heal.
        let source = Arc::new(StaticSource::new().with("x", ResourceKind::Node, &["b"]));
        let coord = coordinator(&store, source, ReconcileConfig::default());
        coord.run_pass("x").await;
        assert_eq!(store.list_keys("x", ResourceKind::Node).unwrap().len(), 1);
        assert_eq!(store.list_keys("x", ResourceKind::Deployment).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fetch_timeout_leaves_durable_state_untouched() {
        let store = seeded_store("x", ResourceKind::Node, &["a", "b"]);
        let config = ReconcileConfig {
            fetch_timeout: Duration::from_millis(10),
            ..ReconcileConfig::default()
        };
        let coord = coordinator(&store, Arc::new(StalledSource), config);
        coord.run_pass("x").await;
        assert_eq!(store.list_keys("x", ResourceKind::Node).unwrap().len(), 2);
        assert_eq!(coord.state("x", ResourceKind::Node), PassState::Idle);
    }

    #[tokio::test]
    async fn sync_state_is_superseded_wholesale_between_passes() {
        let store = seeded_store("x", ResourceKind::Node, &["a", "b", "c"]);
        let source1 = Arc::new(StaticSource::new().with("x", ResourceKind::Node, &["a", "b", "c"]));
        let coord = coordinator(&store, source1, ReconcileConfig::default());
        coord.run_pass("x").await;
        assert_eq!(store.list_keys("x", ResourceKind::Node).unwrap().len(), 3);

        // A later pass sees a shrunken live set; the earlier set must not
        // linger.
        let source2 = Arc::new(StaticSource::new().with("x", ResourceKind::Node, &["c"]));
        let coord = coordinator(&store, source2, ReconcileConfig::default());
        coord.run_pass("x").await;
        let keys = store.list_keys("x", ResourceKind::Node).unwrap();
        assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec!["c"]);
    }

    #[tokio::test]
    async fn connect_event_triggers_a_pass() {
        let store = seeded_store("x", ResourceKind::Node, &["a", "b"]);
        let source = Arc::new(
            StaticSource::new()
                .with("x", ResourceKind::Node, &["b"])
                .with("x", ResourceKind::Deployment, &[])
                .with("x", ResourceKind::Service, &[]),
        );
        let coord = Arc::new(coordinator(&store, source, ReconcileConfig::default()));
        let (tx, rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&coord).run(rx, shutdown_rx));
        tx.send(ClusterEvent::Connected("x".into())).await.unwrap();
        tx.send(ClusterEvent::Disconnected("x".into())).await.unwrap();
        drop(tx);
        handle.await.unwrap();
        let keys = store.list_keys("x", ResourceKind::Node).unwrap();
        assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(coord.state("x", ResourceKind::Node), PassState::Idle);
    }
}
