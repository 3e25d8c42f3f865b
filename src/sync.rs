use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::endpoint::{SubmissionEndpoint, SubmitError};
use crate::model::{IncidentId, UnixTimeMs};
use crate::queue::{OfflineQueue, QueueError};
use crate::store::DurableStore;

/// Sync metadata lives in its own namespace; neither the queue key nor
/// any cache key is ever written from here.
pub const LAST_SYNC_KEY: &str = "sync:last-sync-ms";

pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Bound on each per-item submission, timeout counts as an ordinary
    /// item failure. The session itself has no separate cancellation.
    pub submit_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            submit_timeout: DEFAULT_SUBMIT_TIMEOUT,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.submit_timeout.is_zero() {
            return Err(SyncError::InvalidConfig {
                reason: "submit_timeout must be non-zero".into(),
            });
        }
        Ok(())
    }
}

/// Summary of one sync session. Submission failures are reported here,
/// never as errors.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub attempted: usize,
    pub succeeded: usize,
    pub still_pending: usize,
}

impl SyncOutcome {
    fn skipped() -> Self {
        Self::default()
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("invalid sync config: {reason}")]
    InvalidConfig { reason: String },
}

// Releases the reentrancy flag on every exit path, including errors.
struct SessionGuard<'a>(&'a AtomicBool);

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Replays pending queue entries against the remote endpoint and
/// reconciles local state.
///
/// At most one session runs at a time; a `trigger_sync` while one is
/// in flight returns immediately with `attempted = 0` instead of
/// queuing a second session. Items enqueued during a session are left
/// for the next trigger, keeping sessions bounded. Failed items are
/// retried on the next trigger, there is no in-session retry loop.
pub struct SyncEngine {
    queue: Arc<OfflineQueue>,
    endpoint: Arc<dyn SubmissionEndpoint>,
    monitor: Arc<ConnectivityMonitor>,
    store: Arc<dyn DurableStore>,
    config: SyncConfig,
    in_flight: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        queue: Arc<OfflineQueue>,
        endpoint: Arc<dyn SubmissionEndpoint>,
        monitor: Arc<ConnectivityMonitor>,
        store: Arc<dyn DurableStore>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        Ok(Self {
            queue,
            endpoint,
            monitor,
            store,
            config,
            in_flight: AtomicBool::new(false),
        })
    }

    /// Runs one sync session over a snapshot of the currently pending
    /// records. Storage failures propagate; per-item submission
    /// failures only show up in the outcome's `still_pending`.
    #[instrument(skip(self))]
    pub async fn trigger_sync(&self, now: UnixTimeMs) -> Result<SyncOutcome, SyncError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("sync already in flight, skipping");
            return Ok(SyncOutcome::skipped());
        }
        let _guard = SessionGuard(&self.in_flight);

        if !self.monitor.current_status().is_online() {
            info!("offline, skipping sync");
            return Ok(SyncOutcome::skipped());
        }

        let snapshot = self.queue.pending_only().await?;
        let attempted = snapshot.len();

        let mut succeeded_ids: Vec<IncidentId> = Vec::new();
        for incident in &snapshot {
            match tokio::time::timeout(self.config.submit_timeout, self.endpoint.submit(incident))
                .await
            {
                Ok(Ok(server_id)) => {
                    info!(id = %incident.id, server_id = %server_id.0, "incident submitted");
                    succeeded_ids.push(incident.id.clone());
                }
                Ok(Err(e)) => {
                    warn!(id = %incident.id, error = %e, "submission failed, left pending");
                }
                Err(_) => {
                    let e = SubmitError::TimedOut {
                        after_ms: self.config.submit_timeout.as_millis() as u64,
                    };
                    warn!(id = %incident.id, error = %e, "submission failed, left pending");
                }
            }
        }

        if !succeeded_ids.is_empty() {
            // One persistence write for the whole batch.
            self.queue.mark_synced(&succeeded_ids).await?;
        }

        self.stamp_last_sync(now).await;

        let outcome = SyncOutcome {
            attempted,
            succeeded: succeeded_ids.len(),
            still_pending: attempted - succeeded_ids.len(),
        };
        info!(
            attempted = outcome.attempted,
            succeeded = outcome.succeeded,
            still_pending = outcome.still_pending,
            "sync session finished"
        );
        Ok(outcome)
    }

    /// When the last completed session finished, if any.
    pub async fn last_sync(&self) -> Result<Option<UnixTimeMs>, SyncError> {
        match self.store.read(LAST_SYNC_KEY).await.map_err(QueueError::from)? {
            None => Ok(None),
            Some(bytes) => {
                let ms: u64 = ciborium::from_reader(bytes.as_slice()).map_err(
                    |e: ciborium::de::Error<std::io::Error>| {
                        QueueError::Corrupted {
                            reason: e.to_string(),
                        }
                    },
                )?;
                Ok(Some(UnixTimeMs(ms)))
            }
        }
    }

    // Metadata only; queue state is already reconciled, so a failed
    // stamp is logged rather than failing the session.
    async fn stamp_last_sync(&self, now: UnixTimeMs) {
        let mut bytes = Vec::new();
        if ciborium::into_writer(&now.0, &mut bytes).is_ok() {
            if let Err(e) = self.store.write(LAST_SYNC_KEY, &bytes).await {
                warn!(error = %e, "failed to record last sync time");
            }
        }
    }
}
