//! Object store abstraction
//!
//! A flat key/blob namespace with just enough primitives for lossless
//! concurrent appends: whole-object writes guarded by an opaque version
//! token, and (where the provider has it) server-side concatenation.
//! Backends are chosen once at startup and handed around as
//! `Arc<dyn ObjectStore>`.

pub mod gcs;
pub mod gcs_auth;
pub mod keys;
pub mod local;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{CollectorError, Result};
use crate::types::{StorageBackend, StorageConfig};

pub use gcs::GcsStore;
pub use keys::KeyLayout;
pub use local::LocalStore;
pub use memory::MemoryStore;

/// Opaque generation marker, only ever compared for equality
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version(String);

impl Version {
    pub fn new(raw: impl Into<String>) -> Self {
        Version(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Write guard for optimistic concurrency
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional overwrite
    None,
    /// Creation fast path: fail if the key already exists
    MustNotExist,
    /// Only write over this exact generation
    Matches(Version),
}

/// Result of a conditional write. Conflicts are expected under contention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(Version),
    VersionConflict,
}

impl WriteOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, WriteOutcome::Written(_))
    }
}

/// What a backend can do natively
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCapabilities {
    /// Server-side concatenation of several objects into one
    pub server_compose: bool,
    /// In-place append that is serialized by the store itself
    pub native_append: bool,
    /// Maximum source objects per compose call
    pub max_compose_sources: usize,
}

/// Content plus the generation it was read at
#[derive(Debug, Clone, Default)]
pub struct VersionedContent {
    pub bytes: Vec<u8>,
    /// None when the object does not exist
    pub version: Option<Version>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &str;

    fn capabilities(&self) -> StoreCapabilities;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Object content, empty when the key is absent
    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        Ok(self.read_versioned(key).await?.bytes)
    }

    async fn read_versioned(&self, key: &str) -> Result<VersionedContent>;

    /// Current generation without fetching content; None when absent
    async fn current_version(&self, key: &str) -> Result<Option<Version>> {
        Ok(self.read_versioned(key).await?.version)
    }

    async fn write_whole(&self, key: &str, bytes: Vec<u8>, precondition: Precondition) -> Result<WriteOutcome>;

    /// Keys under `prefix`, sorted lexicographically
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Concatenate `sources` (in the given order) into `dest`. Callers must
    /// respect `max_compose_sources`.
    async fn compose_into(&self, dest: &str, sources: &[String], precondition: Precondition) -> Result<WriteOutcome>;

    /// Server-side copy; overwrites `dest`
    async fn copy(&self, source: &str, dest: &str) -> Result<()>;

    /// Idempotent delete; absent keys are not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// Last modification time, None when absent
    async fn modified_at(&self, key: &str) -> Result<Option<DateTime<Utc>>>;

    /// Append one newline-terminated line. Only for `native_append` stores.
    async fn append_line(&self, key: &str, _line: &str) -> Result<()> {
        Err(CollectorError::StoreUnsupported(format!(
            "{} has no native append (key {})",
            self.name(),
            key
        )))
    }
}

/// Build the configured backend. Called once at startup.
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
    match config.backend {
        StorageBackend::Local => {
            let store = LocalStore::new(&config.local_root).await?;
            info!("💾 Using local storage at: {}", config.local_root);
            Ok(Arc::new(store))
        }
        StorageBackend::Gcs => {
            let bucket = config.bucket.clone().ok_or_else(|| {
                CollectorError::ConfigError("storage.bucket is required for the gcs backend".to_string())
            })?;
            let store = GcsStore::from_key_file(bucket.clone(), &config.credentials_path, config.max_compose_sources)?;
            info!("☁️  Using GCS bucket: {}", bucket);
            Ok(Arc::new(store))
        }
    }
}

/// Delete leftover temp objects (`_tmp/...`) older than `older_than`
pub async fn prune_temp_objects(store: &dyn ObjectStore, older_than: DateTime<Utc>) -> Result<usize> {
    let mut removed = 0;
    for key in store.list_by_prefix(keys::TEMP_PREFIX).await? {
        match store.modified_at(&key).await? {
            Some(modified) if modified < older_than => {
                store.delete(&key).await?;
                removed += 1;
            }
            Some(_) => {}
            None => debug!("Temp object vanished before pruning: {}", key),
        }
    }
    if removed > 0 {
        info!("🧹 Pruned {} temp objects from {}", removed, store.name());
    } else {
        debug!("No temp objects to prune in {}", store.name());
    }
    Ok(removed)
}

/// Split stored NDJSON into non-empty lines, warning about undecodable bytes
pub fn ndjson_lines(key: &str, bytes: &[u8]) -> Vec<String> {
    match std::str::from_utf8(bytes) {
        Ok(text) => text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
        Err(e) => {
            warn!("Object {} is not valid UTF-8 ({}), decoding lossily", key, e);
            String::from_utf8_lossy(bytes)
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.contains('\u{FFFD}'))
                .map(str::to_string)
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_prune_temp_objects_keeps_real_data() {
        let store = MemoryStore::new();
        store.write_whole("_tmp/append/a.jsonl", b"x\n".to_vec(), Precondition::None).await.unwrap();
        store.write_whole("_tmp/compose/b.tmp", b"y\n".to_vec(), Precondition::None).await.unwrap();
        store.write_whole("kraken/BTC/5s/2025-01-15.jsonl", b"z\n".to_vec(), Precondition::None).await.unwrap();

        let removed = prune_temp_objects(&store, Utc::now() + Duration::seconds(1)).await.unwrap();

        assert_eq!(removed, 2);
        assert_eq!(store.list_by_prefix("").await.unwrap(), vec!["kraken/BTC/5s/2025-01-15.jsonl".to_string()]);
    }

    #[test]
    fn test_ndjson_lines_skips_blanks() {
        let lines = ndjson_lines("k", b"{\"a\":1}\n\n  \n{\"a\":2}\n");
        assert_eq!(lines, vec!["{\"a\":1}".to_string(), "{\"a\":2}".to_string()]);
    }
}
