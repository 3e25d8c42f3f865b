use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument};

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_BYTES: usize = 10 * 1024 * 1024;

const STORE_MAGIC: &[u8; 4] = b"WPOF";
const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted value for key '{key}': {reason}")]
    Corrupted { key: String, reason: String },

    #[error("integrity check failed for key '{key}': expected {expected}, got {actual}")]
    IntegrityCheckFailed {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes, max {max}")]
    ValueTooLarge { size: usize, max: usize },
}

impl StorageError {
    /// True for errors that mean the persisted bytes cannot be trusted,
    /// as opposed to the operation merely failing.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StorageError::Corrupted { .. }
                | StorageError::IntegrityCheckFailed { .. }
                | StorageError::FutureSchema { .. }
        )
    }
}

impl From<ciborium::de::Error<std::io::Error>> for StorageError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StorageError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

pub fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.trim().is_empty() {
        return Err(StorageError::InvalidKey {
            key: key.to_string(),
            reason: "key cannot be empty or whitespace".to_string(),
        });
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(StorageError::InvalidKey {
            key: key.chars().take(50).collect::<String>() + "...",
            reason: format!("key exceeds maximum length of {MAX_KEY_LENGTH} bytes"),
        });
    }
    if key.contains('\0') {
        return Err(StorageError::InvalidKey {
            key: key.replace('\0', "\\0"),
            reason: "key cannot contain null bytes".to_string(),
        });
    }
    if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
        return Err(StorageError::InvalidKey {
            key: key.to_string(),
            reason: "key cannot contain path traversal sequences".to_string(),
        });
    }
    for c in key.chars() {
        if c.is_control() {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
                reason: "key contains control characters".to_string(),
            });
        }
    }
    Ok(())
}

fn validate_value(value: &[u8]) -> Result<(), StorageError> {
    if value.len() > MAX_VALUE_BYTES {
        return Err(StorageError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_BYTES,
        });
    }
    Ok(())
}

/// Key/value persistence surviving process restart. All operations are
/// atomic per key; a failure is reported to the caller, never swallowed.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn write(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
    /// All stored keys starting with `prefix`, in no particular order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

fn seal(payload: &[u8]) -> Result<Vec<u8>, StorageError> {
    let checksum = blake3::hash(payload);
    let envelope = StoreEnvelope {
        magic: *STORE_MAGIC,
        schema_version: CURRENT_SCHEMA_VERSION,
        checksum: *checksum.as_bytes(),
        payload: payload.to_vec(),
    };
    let mut bytes = Vec::new();
    ciborium::into_writer(&envelope, &mut bytes)?;
    Ok(bytes)
}

fn unseal(key: &str, bytes: &[u8]) -> Result<Vec<u8>, StorageError> {
    if bytes.is_empty() {
        return Err(StorageError::Corrupted {
            key: key.to_string(),
            reason: "empty file".to_string(),
        });
    }

    let envelope: StoreEnvelope =
        ciborium::from_reader(bytes).map_err(|e| StorageError::Corrupted {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

    if envelope.magic != *STORE_MAGIC {
        return Err(StorageError::Corrupted {
            key: key.to_string(),
            reason: "invalid magic bytes".to_string(),
        });
    }

    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(StorageError::FutureSchema {
            found: envelope.schema_version,
            max: CURRENT_SCHEMA_VERSION,
        });
    }

    let actual = blake3::hash(&envelope.payload);
    if actual.as_bytes() != &envelope.checksum {
        return Err(StorageError::IntegrityCheckFailed {
            key: key.to_string(),
            expected: hex::encode(envelope.checksum),
            actual: hex::encode(actual.as_bytes()),
        });
    }

    Ok(envelope.payload)
}

/// One file per key under a root directory. Values are wrapped in a
/// checksummed envelope so disk corruption surfaces as an error rather
/// than silently decoding into garbage. Writes go through a temp file
/// and `rename` so a crash mid-write never clobbers the previous value.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    #[instrument]
    pub async fn open(root: impl Into<PathBuf> + std::fmt::Debug) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        info!(root = %root.display(), "file store opened");
        Ok(Self { root })
    }

    // Hex filenames keep arbitrary keys filesystem-safe, and byte-wise
    // hex is prefix-preserving so `list(prefix)` stays a filename scan.
    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(hex::encode(key.as_bytes()))
    }

    async fn sync_parent(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            if let Ok(dir) = tokio::fs::File::open(parent).await {
                let _ = dir.sync_all().await;
            }
        }
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_key(key)?;
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(unseal(key, &bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        validate_key(key)?;
        validate_value(value)?;

        let sealed = seal(value)?;
        let path = self.path_for(key);
        let tmp_path = path.with_extension("tmp");

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&sealed).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &path).await?;
        self.sync_parent(&path).await;

        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let encoded_prefix = hex::encode(prefix.as_bytes());
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&encoded_prefix) {
                continue;
            }
            // Non-hex names (e.g. leftover .tmp files) are not store keys.
            let Ok(raw) = hex::decode(name) else { continue };
            if let Ok(key) = String::from_utf8(raw) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

/// In-memory store for tests and ephemeral sessions. Same contract as
/// `FileStore` minus durability.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: tokio::sync::Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a key with raw bytes, bypassing validation. Lets tests
    /// simulate a corrupted persisted collection.
    pub async fn inject_raw(&self, key: &str, value: Vec<u8>) {
        self.entries.lock().await.insert(key.to_string(), value);
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_key(key)?;
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        validate_key(key)?;
        validate_value(value)?;
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .entries
            .lock()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn key_validation() {
        assert!(validate_key("queue:incidents").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("   ").is_err());
        assert!(validate_key("a\0b").is_err());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("/absolute").is_err());
        assert!(validate_key(&"k".repeat(MAX_KEY_LENGTH + 1)).is_err());
        assert!(validate_key("has\x01control").is_err());
    }

    #[test]
    fn envelope_roundtrip() {
        let payload = b"hello world".to_vec();
        let sealed = seal(&payload).unwrap();
        assert_eq!(unseal("k", &sealed).unwrap(), payload);
    }

    #[test]
    fn envelope_detects_flipped_byte() {
        let mut sealed = seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(unseal("k", &sealed).is_err());
    }

    #[test]
    fn envelope_rejects_empty() {
        assert!(matches!(
            unseal("k", b""),
            Err(StorageError::Corrupted { .. })
        ));
    }

    #[tokio::test]
    async fn file_store_roundtrip() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        store.write("queue:incidents", b"data").await.unwrap();
        assert_eq!(
            store.read("queue:incidents").await.unwrap(),
            Some(b"data".to_vec())
        );
    }

    #[tokio::test]
    async fn file_store_missing_key_is_none() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        assert_eq!(store.read("cache:feed").await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store.write("queue:incidents", b"persisted").await.unwrap();
        }
        let store = FileStore::open(dir.path()).await.unwrap();
        assert_eq!(
            store.read("queue:incidents").await.unwrap(),
            Some(b"persisted".to_vec())
        );
    }

    #[tokio::test]
    async fn file_store_corruption_surfaces() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        store.write("queue:incidents", b"good").await.unwrap();

        let path = dir.path().join(hex::encode(b"queue:incidents"));
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let err = store.read("queue:incidents").await.unwrap_err();
        assert!(err.is_corruption(), "got: {err}");
    }

    #[tokio::test]
    async fn file_store_write_leaves_no_tmp() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        store.write("cache:feed", b"v").await.unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn file_store_list_by_prefix() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        store.write("cache:feed", b"a").await.unwrap();
        store.write("cache:stations", b"b").await.unwrap();
        store.write("queue:incidents", b"c").await.unwrap();

        let mut keys = store.list("cache:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["cache:feed", "cache:stations"]);
    }

    #[tokio::test]
    async fn oversized_value_rejected() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let huge = vec![0u8; MAX_VALUE_BYTES + 1];
        assert!(matches!(
            store.write("cache:feed", &huge).await,
            Err(StorageError::ValueTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        store.write("sync:last-sync-ms", b"123").await.unwrap();
        assert_eq!(
            store.read("sync:last-sync-ms").await.unwrap(),
            Some(b"123".to_vec())
        );
        store.remove("sync:last-sync-ms").await.unwrap();
        assert_eq!(store.read("sync:last-sync-ms").await.unwrap(), None);
    }
}
