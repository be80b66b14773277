use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use beacon_core::frame::StatusBody;
use beacon_core::ids::TaskId;

struct CacheEntry {
    body: StatusBody,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Holds the most recently broadcast body per task, with a bounded TTL so
/// abandoned tasks self-clean. Writes are last-writer-wins keyed by
/// sequence number, not arrival order: a stale write never overwrites a
/// newer entry.
pub struct LatestStateCache {
    entries: DashMap<TaskId, CacheEntry>,
}

impl LatestStateCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Store a body under its task key. Returns false when the write was
    /// discarded because a fresher (higher-sequence) entry is present.
    pub fn put(&self, body: StatusBody, ttl: Duration) -> bool {
        let expires_at = Instant::now() + ttl;
        match self.entries.entry(body.task_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if !current.is_expired() && current.body.sequence >= body.sequence {
                    tracing::debug!(
                        task_id = %body.task_id,
                        stale = body.sequence,
                        current = current.body.sequence,
                        "discarding stale cache write"
                    );
                    return false;
                }
                occupied.insert(CacheEntry { body, expires_at });
                true
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry { body, expires_at });
                true
            }
        }
    }

    /// Fetch the latest body for a task. Expired entries read as absent and
    /// are removed.
    pub fn get(&self, task_id: &TaskId) -> Option<StatusBody> {
        let expired = match self.entries.get(task_id) {
            Some(entry) if entry.is_expired() => true,
            Some(entry) => return Some(entry.body.clone()),
            None => return None,
        };
        if expired {
            self.entries.remove_if(task_id, |_, entry| entry.is_expired());
        }
        None
    }

    /// Drop a task's entry outright (e.g. task deleted).
    pub fn invalidate(&self, task_id: &TaskId) {
        self.entries.remove(task_id);
    }

    /// Remove all expired entries. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LatestStateCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Start a background task that periodically purges expired entries.
pub fn start_purge_task(
    cache: Arc<LatestStateCache>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = cache.purge_expired();
            if removed > 0 {
                tracing::debug!(removed = removed, "cache purge");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::status::TaskStatus;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(60);

    fn body(task: &str, sequence: u64) -> StatusBody {
        StatusBody::new(
            TaskId::from_raw(task),
            sequence,
            TaskStatus::Processing,
            None,
            &json!({"prompt": "x"}),
            "t0".into(),
            "t1".into(),
        )
    }

    #[tokio::test]
    async fn put_then_get() {
        let cache = LatestStateCache::new();
        assert!(cache.put(body("task_1", 1), TTL));

        let got = cache.get(&TaskId::from_raw("task_1")).unwrap();
        assert_eq!(got.sequence, 1);
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let cache = LatestStateCache::new();
        assert!(cache.get(&TaskId::from_raw("task_x")).is_none());
    }

    #[tokio::test]
    async fn newer_sequence_overwrites() {
        let cache = LatestStateCache::new();
        cache.put(body("task_1", 1), TTL);
        assert!(cache.put(body("task_1", 2), TTL));
        assert_eq!(cache.get(&TaskId::from_raw("task_1")).unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn stale_sequence_is_discarded() {
        let cache = LatestStateCache::new();
        cache.put(body("task_1", 5), TTL);
        assert!(!cache.put(body("task_1", 3), TTL));
        assert_eq!(cache.get(&TaskId::from_raw("task_1")).unwrap().sequence, 5);
    }

    #[tokio::test]
    async fn duplicate_sequence_is_discarded() {
        let cache = LatestStateCache::new();
        cache.put(body("task_1", 5), TTL);
        assert!(!cache.put(body("task_1", 5), TTL));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = LatestStateCache::new();
        cache.put(body("task_1", 1), TTL);

        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        assert!(cache.get(&TaskId::from_raw("task_1")).is_none());
        // Expired read also removed the entry
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_accepts_any_sequence() {
        let cache = LatestStateCache::new();
        cache.put(body("task_1", 9), TTL);

        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        // A lower sequence is fine once the old entry has lapsed
        assert!(cache.put(body("task_1", 2), TTL));
        assert_eq!(cache.get(&TaskId::from_raw("task_1")).unwrap().sequence, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_expired() {
        let cache = LatestStateCache::new();
        cache.put(body("task_old", 1), TTL);
        tokio::time::advance(TTL / 2).await;
        cache.put(body("task_new", 1), TTL);
        tokio::time::advance(TTL / 2).await;

        let removed = cache.purge_expired();
        assert_eq!(removed, 1);
        assert!(cache.get(&TaskId::from_raw("task_old")).is_none());
        assert!(cache.get(&TaskId::from_raw("task_new")).is_some());
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let cache = LatestStateCache::new();
        cache.put(body("task_1", 1), TTL);
        cache.invalidate(&TaskId::from_raw("task_1"));
        assert!(cache.get(&TaskId::from_raw("task_1")).is_none());
    }
}
