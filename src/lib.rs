//! Offline-first incident submission and synchronization core for the
//! Watchpost citizen reporting client.
//!
//! Reports are accepted regardless of connectivity, durably persisted
//! in an ordered queue, and replayed against the server once the
//! device comes back online, with per-item success tracking so one bad
//! report never blocks the rest. Server-derived reads are served from
//! a time-bounded cache kept in a separate storage namespace, so
//! clearing it can never discard unsynced user data.
//!
//! Everything is wired by explicit construction: bring a
//! [`DurableStore`], a [`ConnectivityMonitor`] fed by the platform
//! shell, and a [`SubmissionEndpoint`], and hand them to
//! [`OfflineService::start`].

pub mod cache;
pub mod connectivity;
pub mod endpoint;
pub mod model;
pub mod queue;
pub mod service;
pub mod store;
pub mod sync;

pub use cache::{CacheConfig, CacheError, CacheManager};
pub use connectivity::{ConnectivityMonitor, NetStatus, Subscription};
pub use endpoint::{HttpEndpoint, ServerIncidentId, SubmissionEndpoint, SubmitError};
pub use model::{
    DraftError, GeoPoint, IncidentDraft, IncidentId, OfflineIncident, PhotoRef, Priority,
    SyncState, UnixTimeMs,
};
pub use queue::{OfflineQueue, QueueConfig, QueueError};
pub use service::{OfflineError, OfflineService, ServiceConfig, FEED_CACHE_KEY};
pub use store::{DurableStore, FileStore, MemoryStore, StorageError};
pub use sync::{SyncConfig, SyncEngine, SyncError, SyncOutcome};
