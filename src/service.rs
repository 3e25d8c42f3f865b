use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::cache::{CacheConfig, CacheError, CacheManager};
use crate::connectivity::{ConnectivityMonitor, NetStatus, Subscription};
use crate::endpoint::SubmissionEndpoint;
use crate::model::{IncidentDraft, OfflineIncident, UnixTimeMs};
use crate::queue::{OfflineQueue, QueueConfig, QueueError};
use crate::store::DurableStore;
use crate::sync::{SyncConfig, SyncEngine, SyncError, SyncOutcome};

/// Logical cache key for the server incident feed.
pub const FEED_CACHE_KEY: &str = "incident-feed";

#[derive(Clone, Debug, Default)]
pub struct ServiceConfig {
    pub queue: QueueConfig,
    pub sync: SyncConfig,
    pub cache: CacheConfig,
}

#[derive(Error, Debug)]
pub enum OfflineError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("runtime error: {reason}")]
    Runtime { reason: String },
}

/// The offline subsystem wired together: durable store, connectivity
/// monitor, offline queue, sync engine and cache manager constructed
/// as explicit objects and handed to consumers, no ambient globals.
///
/// Sync runs on three triggers, all funneled through the same guarded
/// engine: after a successful enqueue while online, on every
/// offline-to-online transition, and manually (pull-to-refresh).
pub struct OfflineService {
    queue: Arc<OfflineQueue>,
    cache: CacheManager,
    engine: Arc<SyncEngine>,
    monitor: Arc<ConnectivityMonitor>,
    subscription: Subscription,
}

impl OfflineService {
    /// Builds the service and subscribes it to connectivity
    /// transitions. Must be called from within a tokio runtime, the
    /// transition listener spawns sync sessions onto it so the
    /// platform notification callback is never blocked.
    pub fn start(
        store: Arc<dyn DurableStore>,
        monitor: Arc<ConnectivityMonitor>,
        endpoint: Arc<dyn SubmissionEndpoint>,
        config: ServiceConfig,
    ) -> Result<Arc<Self>, OfflineError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|e| OfflineError::Runtime {
            reason: e.to_string(),
        })?;

        let queue = Arc::new(OfflineQueue::new(store.clone(), config.queue)?);
        let cache = CacheManager::new(store.clone(), config.cache)?;
        let engine = Arc::new(SyncEngine::new(
            queue.clone(),
            endpoint,
            monitor.clone(),
            store,
            config.sync,
        )?);

        let service = Arc::new_cyclic(|weak: &std::sync::Weak<OfflineService>| {
            let weak = weak.clone();
            let subscription = monitor.subscribe(move |status| {
                if status != NetStatus::Online {
                    return;
                }
                let Some(service) = weak.upgrade() else { return };
                handle.spawn(async move {
                    match service.sync_now().await {
                        Ok(outcome) => {
                            info!(
                                succeeded = outcome.succeeded,
                                still_pending = outcome.still_pending,
                                "connectivity-triggered sync finished"
                            );
                        }
                        Err(e) => warn!(error = %e, "connectivity-triggered sync failed"),
                    }
                });
            });

            OfflineService {
                queue,
                cache,
                engine,
                monitor: monitor.clone(),
                subscription,
            }
        });

        Ok(service)
    }

    /// Durably queues a report. Succeeds regardless of connectivity;
    /// a storage failure propagates so the UI can let the user retry.
    /// When online, a sync session is kicked off in the background.
    pub async fn report_incident(
        self: &Arc<Self>,
        draft: IncidentDraft,
    ) -> Result<OfflineIncident, OfflineError> {
        let incident = self.queue.enqueue(draft, UnixTimeMs::now()).await?;

        if self.monitor.current_status().is_online() {
            let service = self.clone();
            tokio::spawn(async move {
                if let Err(e) = service.sync_now().await {
                    warn!(error = %e, "post-enqueue sync failed");
                }
            });
        }

        Ok(incident)
    }

    /// Runs one sync session now (manual trigger, pull-to-refresh).
    /// Idempotent under the engine's reentrancy guard. A session that
    /// confirmed at least one report invalidates the cached feed so
    /// the next read refetches.
    pub async fn sync_now(&self) -> Result<SyncOutcome, OfflineError> {
        let outcome = self.engine.trigger_sync(UnixTimeMs::now()).await?;
        if outcome.succeeded > 0 {
            self.cache.remove(FEED_CACHE_KEY).await?;
        }
        Ok(outcome)
    }

    pub async fn all_incidents(&self) -> Result<Vec<OfflineIncident>, OfflineError> {
        Ok(self.queue.all().await?)
    }

    pub async fn pending_incidents(&self) -> Result<Vec<OfflineIncident>, OfflineError> {
        Ok(self.queue.pending_only().await?)
    }

    /// Badge count for the UI.
    pub async fn pending_count(&self) -> Result<usize, OfflineError> {
        Ok(self.queue.pending_count().await?)
    }

    pub async fn purge_synced(&self) -> Result<usize, OfflineError> {
        Ok(self.queue.purge_synced().await?)
    }

    /// See [`OfflineQueue::discard_corrupted`].
    pub async fn discard_corrupted_queue(&self) -> Result<(), OfflineError> {
        Ok(self.queue.discard_corrupted().await?)
    }

    pub async fn last_sync(&self) -> Result<Option<UnixTimeMs>, OfflineError> {
        Ok(self.engine.last_sync().await?)
    }

    pub async fn cached_feed(&self) -> Result<Option<Vec<u8>>, OfflineError> {
        Ok(self.cache.get(FEED_CACHE_KEY, UnixTimeMs::now()).await?)
    }

    pub async fn store_feed(&self, payload: Vec<u8>) -> Result<(), OfflineError> {
        Ok(self
            .cache
            .put(FEED_CACHE_KEY, payload, UnixTimeMs::now())
            .await?)
    }

    /// Invoked on user logout. Never touches queue or sync state.
    pub async fn clear_cache(&self) -> Result<(), OfflineError> {
        Ok(self.cache.clear_all().await?)
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn connectivity(&self) -> NetStatus {
        self.monitor.current_status()
    }
}

impl Drop for OfflineService {
    fn drop(&mut self) {
        self.monitor.unsubscribe(&self.subscription);
    }
}
