use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::model::{DraftError, IncidentDraft, IncidentId, OfflineIncident, UnixTimeMs};
use crate::store::{DurableStore, StorageError};

/// Single collection key; the whole queue is one read-modify-write unit.
pub const QUEUE_KEY: &str = "queue:incidents";

pub const DEFAULT_MAX_ENTRIES: usize = 1_000;

#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Hard cap on stored records. When full, oldest `synced` records
    /// are evicted first; if every record is still pending the enqueue
    /// fails rather than dropping user data.
    pub max_entries: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_entries == 0 {
            return Err(QueueError::InvalidConfig {
                reason: "max_entries must be > 0".into(),
            });
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("invalid draft: {0}")]
    Draft(#[from] DraftError),

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("persisted queue is corrupted: {reason}")]
    Corrupted { reason: String },

    #[error("queue is full ({max} entries, all pending)")]
    Full { max: usize },

    #[error("invalid queue config: {reason}")]
    InvalidConfig { reason: String },
}

impl From<StorageError> for QueueError {
    fn from(e: StorageError) -> Self {
        // Untrustworthy persisted bytes are a distinct failure from an
        // operation that merely didn't complete.
        if e.is_corruption() {
            QueueError::Corrupted {
                reason: e.to_string(),
            }
        } else {
            QueueError::Storage(e)
        }
    }
}

/// Ordered, crash-safe storage of [`OfflineIncident`] records.
///
/// The persisted collection is always the complete, consistent set:
/// every mutation loads the whole collection, applies the change in
/// memory, and writes the whole collection back before returning. The
/// collection key is guarded by a mutex so two read-modify-write
/// cycles never interleave.
pub struct OfflineQueue {
    store: Arc<dyn DurableStore>,
    config: QueueConfig,
    write_lock: tokio::sync::Mutex<()>,
}

impl OfflineQueue {
    pub fn new(store: Arc<dyn DurableStore>, config: QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Assigns id, timestamp and `Pending` state, persists the updated
    /// collection, and returns the stored record. On any error the
    /// previously persisted collection is untouched and the caller is
    /// free to retry.
    pub async fn enqueue(
        &self,
        draft: IncidentDraft,
        now: UnixTimeMs,
    ) -> Result<OfflineIncident, QueueError> {
        draft.validate()?;

        let _guard = self.write_lock.lock().await;
        let mut items = self.load().await?;

        if items.len() >= self.config.max_entries {
            self.evict_synced(&mut items);
            if items.len() >= self.config.max_entries {
                return Err(QueueError::Full {
                    max: self.config.max_entries,
                });
            }
        }

        let incident = OfflineIncident::from_draft(draft, now);
        items.push(incident.clone());
        self.persist(&items).await?;

        info!(id = %incident.id, total = items.len(), "incident enqueued");
        Ok(incident)
    }

    /// Every stored record, insertion order, oldest first. A fresh read
    /// on each call.
    pub async fn all(&self) -> Result<Vec<OfflineIncident>, QueueError> {
        self.load().await
    }

    pub async fn pending_only(&self) -> Result<Vec<OfflineIncident>, QueueError> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .filter(OfflineIncident::is_pending)
            .collect())
    }

    pub async fn pending_count(&self) -> Result<usize, QueueError> {
        Ok(self.pending_only().await?.len())
    }

    /// Transitions the named records to `synced` in one persistence
    /// write. Unknown or already-synced ids are skipped, not errors.
    pub async fn mark_synced(&self, ids: &[IncidentId]) -> Result<(), QueueError> {
        if ids.is_empty() {
            return Ok(());
        }
        let wanted: HashSet<&IncidentId> = ids.iter().collect();

        let _guard = self.write_lock.lock().await;
        let mut items = self.load().await?;

        let mut changed = 0usize;
        for item in items.iter_mut() {
            if item.is_pending() && wanted.contains(&item.id) {
                item.mark_synced();
                changed += 1;
            }
        }

        if changed > 0 {
            self.persist(&items).await?;
            info!(marked = changed, "records marked synced");
        }
        Ok(())
    }

    /// Deletes all `synced` records; pending records are untouched
    /// regardless of age. Returns the number removed.
    pub async fn purge_synced(&self) -> Result<usize, QueueError> {
        let _guard = self.write_lock.lock().await;
        let mut items = self.load().await?;

        let before = items.len();
        items.retain(OfflineIncident::is_pending);
        let removed = before - items.len();

        if removed > 0 {
            self.persist(&items).await?;
            info!(removed, "synced records purged");
        }
        Ok(removed)
    }

    /// Last-resort recovery after [`QueueError::Corrupted`]: overwrite
    /// the unreadable collection with an empty one. Callers must treat
    /// this as data loss and surface it, not as routine cleanup.
    pub async fn discard_corrupted(&self) -> Result<(), QueueError> {
        let _guard = self.write_lock.lock().await;
        warn!("discarding corrupted queue collection");
        self.persist(&[]).await
    }

    async fn load(&self) -> Result<Vec<OfflineIncident>, QueueError> {
        match self.store.read(QUEUE_KEY).await? {
            None => Ok(Vec::new()),
            Some(bytes) => {
                ciborium::from_reader(bytes.as_slice()).map_err(
                    |e: ciborium::de::Error<std::io::Error>| QueueError::Corrupted {
                        reason: e.to_string(),
                    },
                )
            }
        }
    }

    async fn persist(&self, items: &[OfflineIncident]) -> Result<(), QueueError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(&items, &mut bytes).map_err(
            |e: ciborium::ser::Error<std::io::Error>| {
                QueueError::Storage(StorageError::Serialization(e.to_string()))
            },
        )?;
        self.store.write(QUEUE_KEY, &bytes).await?;
        Ok(())
    }

    fn evict_synced(&self, items: &mut Vec<OfflineIncident>) {
        while items.len() >= self.config.max_entries {
            let Some(pos) = items.iter().position(|i| i.sync_state.is_synced()) else {
                return;
            };
            let evicted = items.remove(pos);
            warn!(id = %evicted.id, "evicted oldest synced record to make room");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Priority;
    use crate::store::MemoryStore;
    use proptest::prelude::*;

    fn draft(title: &str) -> IncidentDraft {
        IncidentDraft {
            title: title.into(),
            description: "details".into(),
            priority: Priority::Medium,
            location: None,
            location_address: None,
            photo: None,
        }
    }

    fn queue_over(store: Arc<MemoryStore>) -> OfflineQueue {
        OfflineQueue::new(store, QueueConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn enqueue_then_all_preserves_order() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_over(store);

        queue.enqueue(draft("one"), UnixTimeMs(1)).await.unwrap();
        queue.enqueue(draft("two"), UnixTimeMs(2)).await.unwrap();
        queue.enqueue(draft("three"), UnixTimeMs(3)).await.unwrap();

        let titles: Vec<_> = queue
            .all()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.title)
            .collect();
        assert_eq!(titles, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn collection_survives_restart() {
        let store = Arc::new(MemoryStore::new());
        let first = queue_over(store.clone());
        let stored = first.enqueue(draft("report"), UnixTimeMs(5)).await.unwrap();

        // A fresh queue over the same store simulates a process restart.
        let second = queue_over(store);
        let all = second.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, stored.id);
        assert!(all[0].is_pending());
    }

    #[tokio::test]
    async fn pending_only_filters_synced() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_over(store);

        let a = queue.enqueue(draft("a"), UnixTimeMs(1)).await.unwrap();
        let b = queue.enqueue(draft("b"), UnixTimeMs(2)).await.unwrap();
        queue.mark_synced(&[a.id.clone()]).await.unwrap();

        let pending = queue.pending_only().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b.id);
        assert_eq!(queue.all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn mark_synced_unknown_id_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_over(store);

        let a = queue.enqueue(draft("a"), UnixTimeMs(1)).await.unwrap();
        queue.mark_synced(&[IncidentId::generate()]).await.unwrap();

        assert_eq!(queue.pending_count().await.unwrap(), 1);

        // Marking twice is equally harmless.
        queue.mark_synced(&[a.id.clone()]).await.unwrap();
        queue.mark_synced(&[a.id]).await.unwrap();
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn purge_removes_only_synced() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_over(store);

        let a = queue.enqueue(draft("a"), UnixTimeMs(1)).await.unwrap();
        queue.enqueue(draft("b"), UnixTimeMs(2)).await.unwrap();
        queue.mark_synced(&[a.id]).await.unwrap();

        assert_eq!(queue.purge_synced().await.unwrap(), 1);
        let all = queue.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].title, "b");

        // Nothing synced left; purge is a no-op.
        assert_eq!(queue.purge_synced().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn full_queue_of_pending_rejects() {
        let store = Arc::new(MemoryStore::new());
        let queue = OfflineQueue::new(store, QueueConfig { max_entries: 2 }).unwrap();

        queue.enqueue(draft("a"), UnixTimeMs(1)).await.unwrap();
        queue.enqueue(draft("b"), UnixTimeMs(2)).await.unwrap();

        let err = queue.enqueue(draft("c"), UnixTimeMs(3)).await.unwrap_err();
        assert!(matches!(err, QueueError::Full { max: 2 }));
        assert_eq!(queue.all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn full_queue_evicts_synced_first() {
        let store = Arc::new(MemoryStore::new());
        let queue = OfflineQueue::new(store, QueueConfig { max_entries: 2 }).unwrap();

        let a = queue.enqueue(draft("a"), UnixTimeMs(1)).await.unwrap();
        queue.enqueue(draft("b"), UnixTimeMs(2)).await.unwrap();
        queue.mark_synced(&[a.id.clone()]).await.unwrap();

        let c = queue.enqueue(draft("c"), UnixTimeMs(3)).await.unwrap();
        let all = queue.all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|i| i.id != a.id));
        assert!(all.iter().any(|i| i.id == c.id));
    }

    #[tokio::test]
    async fn corrupted_collection_surfaces_not_silently_empty() {
        let store = Arc::new(MemoryStore::new());
        store.inject_raw(QUEUE_KEY, b"not cbor at all".to_vec()).await;

        let queue = queue_over(store);
        assert!(matches!(
            queue.all().await,
            Err(QueueError::Corrupted { .. })
        ));
        assert!(matches!(
            queue.enqueue(draft("x"), UnixTimeMs(1)).await,
            Err(QueueError::Corrupted { .. })
        ));
    }

    #[tokio::test]
    async fn discard_corrupted_recovers() {
        let store = Arc::new(MemoryStore::new());
        store.inject_raw(QUEUE_KEY, vec![0xDE, 0xAD]).await;

        let queue = queue_over(store);
        assert!(queue.all().await.is_err());

        queue.discard_corrupted().await.unwrap();
        assert!(queue.all().await.unwrap().is_empty());
        queue.enqueue(draft("fresh"), UnixTimeMs(1)).await.unwrap();
        assert_eq!(queue.all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_draft_rejected_before_persisting() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_over(store.clone());

        let err = queue.enqueue(draft("  "), UnixTimeMs(1)).await.unwrap_err();
        assert!(matches!(err, QueueError::Draft(_)));
        assert_eq!(store.read(QUEUE_KEY).await.unwrap(), None);
    }

    proptest! {
        #[test]
        fn persisted_collection_roundtrips(
            titles in proptest::collection::vec("[a-zA-Z][a-zA-Z0-9 ]{0,39}", 1..20),
            priority_idx in 0usize..4,
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async move {
                let priority = [
                    Priority::Low,
                    Priority::Medium,
                    Priority::High,
                    Priority::Critical,
                ][priority_idx];

                let store = Arc::new(MemoryStore::new());
                let queue = queue_over(store.clone());

                let mut stored = Vec::new();
                for (i, title) in titles.iter().enumerate() {
                    let mut d = draft(title);
                    d.priority = priority;
                    stored.push(queue.enqueue(d, UnixTimeMs(i as u64)).await.unwrap());
                }

                let reloaded = queue_over(store).all().await.unwrap();
                prop_assert_eq!(reloaded, stored);
                Ok(())
            })?;
        }
    }
}
