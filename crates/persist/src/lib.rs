//! Central-side durable storage for synchronized resources.
//!
//! One table keyed by (cluster, kind, identity); fragments treat their kind
//! as their own namespace. Deletes are idempotent so the at-least-once
//! message stream and reconciliation can share the same mutation path.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use argus_core::{IdentitySet, ResourceKind};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;

/// Per-resource-kind persistence consumed by pipeline fragments and
/// enumerated by reconciliation.
pub trait DurableStore: Send + Sync {
    /// Insert or overwrite one record.
    fn put(
        &self,
        cluster_id: &str,
        kind: ResourceKind,
        identity: &str,
        payload: &serde_json::Value,
    ) -> Result<()>;

    /// Remove one record. Deleting an absent key returns Ok.
    fn delete(&self, cluster_id: &str, kind: ResourceKind, identity: &str) -> Result<()>;

    /// Enumerate the stored identities for one cluster and kind.
    fn list_keys(&self, cluster_id: &str, kind: ResourceKind) -> Result<IdentitySet>;
}

/// SQLite-backed store. Simple, synchronous; the pipeline isn't latency
/// sensitive here.
pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("ARGUS_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path)
            .with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", &"WAL").ok();
        db.pragma_update(None, "synchronous", &"NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS resources (
                cluster TEXT NOT NULL,
                kind    TEXT NOT NULL,
                id      TEXT NOT NULL,
                payload TEXT NOT NULL,
                ts      INTEGER NOT NULL,
                PRIMARY KEY (cluster, kind, id)
            )",
            [],
        )
        .context("creating resources table")?;
        let me = Self { db: Mutex::new(db) };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }
}

impl DurableStore for SqliteStore {
    fn put(
        &self,
        cluster_id: &str,
        kind: ResourceKind,
        identity: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let started = std::time::Instant::now();
        let body = serde_json::to_string(payload).context("serializing payload")?;
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        db.execute(
            "INSERT INTO resources(cluster, kind, id, payload, ts) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(cluster, kind, id)
             DO UPDATE SET payload = excluded.payload, ts = excluded.ts",
            (cluster_id, kind.as_str(), identity, &body, chrono::Utc::now().timestamp()),
        )?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64, "kind" => kind.as_str());
        Ok(())
    }

    fn delete(&self, cluster_id: &str, kind: ResourceKind, identity: &str) -> Result<()> {
        let started = std::time::Instant::now();
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        // Affected-row count is irrelevant: absent keys delete to the same
        // end state.
        db.execute(
            "DELETE FROM resources WHERE cluster = ?1 AND kind = ?2 AND id = ?3",
            (cluster_id, kind.as_str(), identity),
        )?;
        histogram!("persist_delete_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_delete_total", 1u64, "kind" => kind.as_str());
        Ok(())
    }

    fn list_keys(&self, cluster_id: &str, kind: ResourceKind) -> Result<IdentitySet> {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt =
            db.prepare("SELECT id FROM resources WHERE cluster = ?1 AND kind = ?2")?;
        let mut rows = stmt.query((cluster_id, kind.as_str()))?;
        let mut out = IdentitySet::new();
        while let Some(row) = rows.next()? {
            out.insert(row.get(0)?);
        }
        Ok(out)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".argus");
        let _ = std::fs::create_dir_all(&p);
        p.push("argus.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "argus.db".to_string()
}

/// In-memory store used by tests and the offline replay tool.
///
/// Individual identities can be marked to fail deletion, exercising the
/// best-effort healing path without a real backend outage.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<FxHashMap<(String, ResourceKind), BTreeMap<String, serde_json::Value>>>,
    failing_deletes: Mutex<IdentitySet>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent delete of `identity` (any cluster, any kind) fails.
    pub fn inject_delete_failure(&self, identity: &str) {
        let mut failing = self.failing_deletes.lock().unwrap_or_else(|e| e.into_inner());
        failing.insert(identity.to_string());
    }
}

impl DurableStore for MemoryStore {
    fn put(
        &self,
        cluster_id: &str,
        kind: ResourceKind,
        identity: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .entry((cluster_id.to_string(), kind))
            .or_default()
            .insert(identity.to_string(), payload.clone());
        Ok(())
    }

    fn delete(&self, cluster_id: &str, kind: ResourceKind, identity: &str) -> Result<()> {
        {
            let failing = self.failing_deletes.lock().unwrap_or_else(|e| e.into_inner());
            if failing.contains(identity) {
                anyhow::bail!("injected delete failure for {identity}");
            }
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(records) = inner.get_mut(&(cluster_id.to_string(), kind)) {
            records.remove(identity);
        }
        Ok(())
    }

    fn list_keys(&self, cluster_id: &str, kind: ResourceKind) -> Result<IdentitySet> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .get(&(cluster_id.to_string(), kind))
            .map(|records| records.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!(
            "argus-test-{}.db",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        );
        dir.join(f).to_string_lossy().to_string()
    }

    fn exercise_store(store: &dyn DurableStore) {
        store.put("c1", ResourceKind::Node, "a", &json!({"v": 1})).unwrap();
        store.put("c1", ResourceKind::Node, "b", &json!({"v": 2})).unwrap();
        // Overwrite replaces, never duplicates.
        store.put("c1", ResourceKind::Node, "a", &json!({"v": 3})).unwrap();
        // Other clusters and kinds live in their own namespaces.
        store.put("c2", ResourceKind::Node, "a", &json!({"v": 1})).unwrap();
        store.put("c1", ResourceKind::Service, "svc", &json!({"v": 1})).unwrap();

        let keys = store.list_keys("c1", ResourceKind::Node).unwrap();
        assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec!["a", "b"]);

        store.delete("c1", ResourceKind::Node, "a").unwrap();
        // Idempotent: second delete of the same key succeeds identically.
        store.delete("c1", ResourceKind::Node, "a").unwrap();
        store.delete("c1", ResourceKind::Node, "ghost").unwrap();

        let keys = store.list_keys("c1", ResourceKind::Node).unwrap();
        assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(store.list_keys("c2", ResourceKind::Node).unwrap().len(), 1);
        assert_eq!(store.list_keys("c1", ResourceKind::Service).unwrap().len(), 1);
    }

    #[test]
    fn sqlite_put_delete_list() {
        let path = temp_db();
        let store = SqliteStore::open(&path).unwrap();
        exercise_store(&store);
    }

    #[test]
    fn memory_put_delete_list() {
        exercise_store(&MemoryStore::new());
    }

    #[test]
    fn memory_injected_delete_failure() {
        let store = MemoryStore::new();
        store.put("c1", ResourceKind::Node, "a", &json!({})).unwrap();
        store.inject_delete_failure("a");
        assert!(store.delete("c1", ResourceKind::Node, "a").is_err());
        // The record survives the failed delete.
        assert_eq!(store.list_keys("c1", ResourceKind::Node).unwrap().len(), 1);
    }
}
