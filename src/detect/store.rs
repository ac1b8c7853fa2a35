//! Bounded in-memory detection store with optional SQLite write-behind.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use super::Detection;
use crate::storage::{self, Pool};

/// Aggregate counts over the stored detections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionStats {
    pub total: usize,
    pub recent_24h: usize,
    /// Each type counted at most once per detection.
    pub by_type: BTreeMap<String, usize>,
}

/// Ring buffer of detections, oldest evicted first.
pub struct DetectionStore {
    entries: RwLock<VecDeque<Detection>>,
    capacity: usize,
    pool: Option<Pool>,
}

impl DetectionStore {
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
            pool: None,
        }
    }

    /// A store backed by `pool`, preloaded with the newest `capacity` rows.
    pub async fn with_pool(capacity: usize, pool: Pool) -> anyhow::Result<Self> {
        let capacity = capacity.max(1);
        let loader = pool.clone();
        let loaded = tokio::task::spawn_blocking(move || storage::load_recent(&loader, capacity))
            .await??;
        info!(count = loaded.len(), "reloaded stored detections");

        Ok(Self {
            entries: RwLock::new(loaded.into()),
            capacity,
            pool: Some(pool),
        })
    }

    pub async fn insert(&self, detection: Detection) {
        if let Some(pool) = &self.pool {
            let pool = pool.clone();
            let record = detection.clone();
            let keep = self.capacity;
            let result = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
                storage::save_detection(&pool, &record)?;
                storage::prune(&pool, keep)?;
                Ok(())
            })
            .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(id = %detection.id, error = %e, "failed to persist detection"),
                Err(e) => warn!(id = %detection.id, error = %e, "persistence task failed"),
            }
        }

        let mut entries = self.entries.write().await;
        entries.push_back(detection);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    pub async fn get(&self, id: Uuid) -> Option<Detection> {
        self.entries.read().await.iter().find(|d| d.id == id).cloned()
    }

    /// Every stored detection, newest first.
    pub async fn list(&self) -> Vec<Detection> {
        self.entries.read().await.iter().rev().cloned().collect()
    }

    /// Detections for one server, newest first. `server` is either the full
    /// volume UUID or its short identifier (the UUID's first group).
    pub async fn by_volume(&self, server: &str) -> Vec<Detection> {
        let prefix = format!("{}-", server);
        self.entries
            .read()
            .await
            .iter()
            .rev()
            .filter(|d| d.volume_id == server || d.volume_id.starts_with(&prefix))
            .cloned()
            .collect()
    }

    pub async fn stats(&self, now: DateTime<Utc>) -> DetectionStats {
        let entries = self.entries.read().await;
        let cutoff = now - Duration::hours(24);

        let mut stats = DetectionStats {
            total: entries.len(),
            ..Default::default()
        };
        for detection in entries.iter() {
            if detection.created_at > cutoff {
                stats.recent_24h += 1;
            }
            for kind in detection.distinct_types() {
                *stats.by_type.entry(kind.to_string()).or_insert(0) += 1;
            }
        }
        stats
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{TYPE_SUSPICIOUS_CONTENT, TYPE_SUSPICIOUS_FILE};

    fn detection(volume: &str) -> Detection {
        let mut d = Detection::new("0123456789abcdef", volume);
        d.add_type(TYPE_SUSPICIOUS_FILE);
        d
    }

    #[tokio::test]
    async fn test_ring_buffer_evicts_oldest() {
        let store = DetectionStore::in_memory(2);
        let first = detection("a");
        let first_id = first.id;
        store.insert(first).await;
        store.insert(detection("b")).await;
        store.insert(detection("c")).await;

        assert_eq!(store.len().await, 2);
        assert!(store.get(first_id).await.is_none());
        let volumes: Vec<String> = store.list().await.into_iter().map(|d| d.volume_id).collect();
        assert_eq!(volumes, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_by_volume_newest_first() {
        let store = DetectionStore::in_memory(10);
        let older = detection("srv");
        let newer = detection("srv");
        let (older_id, newer_id) = (older.id, newer.id);
        store.insert(older).await;
        store.insert(detection("other")).await;
        store.insert(newer).await;

        let history = store.by_volume("srv").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, newer_id);
        assert_eq!(history[1].id, older_id);
        assert!(store.by_volume("missing").await.is_empty());
    }

    #[tokio::test]
    async fn test_by_volume_accepts_short_identifier() {
        let store = DetectionStore::in_memory(10);
        store.insert(detection("8d2f0c1e-aaaa-bbbb-cccc-123456789abc")).await;
        store.insert(detection("8d2f0c1eff-other")).await;

        assert_eq!(store.by_volume("8d2f0c1e").await.len(), 1);
        assert_eq!(store.by_volume("8d2f0c1e-aaaa-bbbb-cccc-123456789abc").await.len(), 1);
    }

    #[tokio::test]
    async fn test_stats_count_types_once_per_detection() {
        let store = DetectionStore::in_memory(10);

        let mut repeated = detection("a");
        repeated.add_type(TYPE_SUSPICIOUS_FILE);
        repeated.add_type(TYPE_SUSPICIOUS_CONTENT);
        store.insert(repeated).await;

        let mut old = detection("b");
        old.created_at = Utc::now() - Duration::hours(25);
        store.insert(old).await;

        let stats = store.stats(Utc::now()).await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.recent_24h, 1);
        assert_eq!(stats.by_type[TYPE_SUSPICIOUS_FILE], 2);
        assert_eq!(stats.by_type[TYPE_SUSPICIOUS_CONTENT], 1);
    }

    #[tokio::test]
    async fn test_persisted_detections_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detections.db");

        let kept = {
            let store = DetectionStore::with_pool(2, storage::open_pool(&path).unwrap())
                .await
                .unwrap();
            store.insert(detection("a")).await;
            store.insert(detection("b")).await;
            store.insert(detection("c")).await;
            store.list().await
        };

        let reopened = DetectionStore::with_pool(2, storage::open_pool(&path).unwrap())
            .await
            .unwrap();
        let ids: Vec<Uuid> = reopened.list().await.into_iter().map(|d| d.id).collect();
        assert_eq!(ids, kept.iter().map(|d| d.id).collect::<Vec<_>>());
    }
}
