use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const MAX_TITLE_LENGTH: usize = 256;
pub const MAX_DESCRIPTION_LENGTH: usize = 4096;
pub const MAX_ADDRESS_LENGTH: usize = 512;

/// Unix timestamp in milliseconds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    pub fn saturating_add_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }
}

/// Locally generated incident identifier. Not a server identifier;
/// stable for the record's local lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IncidentId(String);

impl IncidentId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IncidentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

/// Validated lat/lon pair.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    lat: f64,
    lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Result<Self, DraftError> {
        if !lat.is_finite() || !lon.is_finite() {
            return Err(DraftError::InvalidCoordinates {
                reason: "coordinates must be finite".into(),
            });
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(DraftError::InvalidCoordinates {
                reason: format!("latitude must be between -90 and 90, got {lat}"),
            });
        }
        if !(-180.0..=180.0).contains(&lon) {
            return Err(DraftError::InvalidCoordinates {
                reason: format!("longitude must be between -180 and 180, got {lon}"),
            });
        }
        Ok(Self { lat, lon })
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }

    pub fn lon(&self) -> f64 {
        self.lon
    }
}

/// Don't store image bytes. Store a handle/URI/path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoRef {
    pub uri: String,
    pub size_bytes: Option<u64>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    Synced,
}

impl SyncState {
    pub fn is_pending(&self) -> bool {
        matches!(self, SyncState::Pending)
    }

    pub fn is_synced(&self) -> bool {
        matches!(self, SyncState::Synced)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DraftError {
    #[error("title cannot be empty")]
    MissingTitle,

    #[error("title exceeds {max} characters")]
    TitleTooLong { max: usize },

    #[error("description exceeds {max} characters")]
    DescriptionTooLong { max: usize },

    #[error("address exceeds {max} characters")]
    AddressTooLong { max: usize },

    #[error("invalid coordinates: {reason}")]
    InvalidCoordinates { reason: String },
}

/// The report content supplied by the composition UI. Ids, timestamps
/// and sync state are assigned by the queue at enqueue time.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentDraft {
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub location: Option<GeoPoint>,
    pub location_address: Option<String>,
    pub photo: Option<PhotoRef>,
}

impl IncidentDraft {
    pub fn validate(&self) -> Result<(), DraftError> {
        if self.title.trim().is_empty() {
            return Err(DraftError::MissingTitle);
        }
        if self.title.len() > MAX_TITLE_LENGTH {
            return Err(DraftError::TitleTooLong {
                max: MAX_TITLE_LENGTH,
            });
        }
        if self.description.len() > MAX_DESCRIPTION_LENGTH {
            return Err(DraftError::DescriptionTooLong {
                max: MAX_DESCRIPTION_LENGTH,
            });
        }
        if let Some(address) = &self.location_address {
            if address.len() > MAX_ADDRESS_LENGTH {
                return Err(DraftError::AddressTooLong {
                    max: MAX_ADDRESS_LENGTH,
                });
            }
        }
        Ok(())
    }
}

// Redact debug output because drafts carry user-provided content.
impl fmt::Debug for IncidentDraft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncidentDraft")
            .field("priority", &self.priority)
            .field("location_present", &self.location.is_some())
            .field("photo_present", &self.photo.is_some())
            .finish()
    }
}

/// A locally created, not-yet-confirmed incident report.
///
/// Exists in exactly one of two states at any instant; the set of
/// `Pending` records is exactly the replay set for the next sync
/// attempt. `created_at` is immutable after enqueue.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineIncident {
    pub id: IncidentId,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub location: Option<GeoPoint>,
    pub location_address: Option<String>,
    pub photo: Option<PhotoRef>,
    pub created_at: UnixTimeMs,
    pub sync_state: SyncState,
}

impl OfflineIncident {
    pub fn from_draft(draft: IncidentDraft, now: UnixTimeMs) -> Self {
        Self {
            id: IncidentId::generate(),
            title: draft.title,
            description: draft.description,
            priority: draft.priority,
            location: draft.location,
            location_address: draft.location_address,
            photo: draft.photo,
            created_at: now,
            sync_state: SyncState::Pending,
        }
    }

    /// The only state transition. There is deliberately no inverse.
    pub fn mark_synced(&mut self) {
        self.sync_state = SyncState::Synced;
    }

    pub fn is_pending(&self) -> bool {
        self.sync_state.is_pending()
    }
}

// Redacted for the same reason as IncidentDraft.
impl fmt::Debug for OfflineIncident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineIncident")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("location_present", &self.location.is_some())
            .field("photo_present", &self.photo.is_some())
            .field("created_at", &self.created_at)
            .field("sync_state", &self.sync_state)
            .finish()
    }
}
