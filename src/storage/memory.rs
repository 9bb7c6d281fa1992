/// In-process object store with GCS-like generation semantics
/// Used for dry runs and as the remote-store stand-in in tests
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use super::{ObjectStore, Precondition, StoreCapabilities, Version, VersionedContent, WriteOutcome};
use crate::error::{CollectorError, Result};

#[derive(Debug, Clone)]
struct Entry {
    bytes: Vec<u8>,
    generation: u64,
    modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, Entry>,
    next_generation: u64,
    compose_sizes: Vec<usize>,
    failing_prefix: Option<String>,
}

impl State {
    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn check_failure(&self, key: &str) -> Result<()> {
        match &self.failing_prefix {
            Some(prefix) if key.starts_with(prefix.as_str()) => Err(CollectorError::StoreRequest {
                status: 503,
                message: format!("injected failure for {}", key),
            }),
            _ => Ok(()),
        }
    }

    fn precondition_holds(&self, key: &str, precondition: &Precondition) -> bool {
        let current = self.objects.get(key).map(|e| e.generation);
        match precondition {
            Precondition::None => true,
            Precondition::MustNotExist => current.is_none(),
            Precondition::Matches(v) => current.map(|g| g.to_string()) == Some(v.as_str().to_string()),
        }
    }

    fn put(&mut self, key: &str, bytes: Vec<u8>) -> Version {
        let generation = self.bump();
        self.objects.insert(
            key.to_string(),
            Entry {
                bytes,
                generation,
                modified: Utc::now(),
            },
        );
        Version::new(generation.to_string())
    }
}

pub struct MemoryStore {
    state: Mutex<State>,
    capabilities: StoreCapabilities,
}

impl MemoryStore {
    /// Compose-capable store with the GCS source limit
    pub fn new() -> Self {
        Self::with_capabilities(StoreCapabilities {
            server_compose: true,
            native_append: false,
            max_compose_sources: 32,
        })
    }

    pub fn with_capabilities(capabilities: StoreCapabilities) -> Self {
        MemoryStore {
            state: Mutex::new(State::default()),
            capabilities,
        }
    }

    /// Whole-object writes only (forces the compare-and-swap append path)
    pub fn cas_only() -> Self {
        Self::with_capabilities(StoreCapabilities {
            server_compose: false,
            native_append: false,
            max_compose_sources: 32,
        })
    }

    /// Source counts of every compose call so far
    pub async fn compose_sizes(&self) -> Vec<usize> {
        self.state.lock().await.compose_sizes.clone()
    }

    /// Make every operation on keys under `prefix` fail with a 503
    pub async fn fail_prefix(&self, prefix: Option<&str>) {
        self.state.lock().await.failing_prefix = prefix.map(str::to_string);
    }

    pub async fn object_count(&self) -> usize {
        self.state.lock().await.objects.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn capabilities(&self) -> StoreCapabilities {
        self.capabilities
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let state = self.state.lock().await;
        state.check_failure(key)?;
        Ok(state.objects.contains_key(key))
    }

    async fn read_versioned(&self, key: &str) -> Result<VersionedContent> {
        let state = self.state.lock().await;
        state.check_failure(key)?;
        Ok(match state.objects.get(key) {
            Some(entry) => VersionedContent {
                bytes: entry.bytes.clone(),
                version: Some(Version::new(entry.generation.to_string())),
            },
            None => VersionedContent::default(),
        })
    }

    async fn current_version(&self, key: &str) -> Result<Option<Version>> {
        let state = self.state.lock().await;
        state.check_failure(key)?;
        Ok(state.objects.get(key).map(|e| Version::new(e.generation.to_string())))
    }

    async fn write_whole(&self, key: &str, bytes: Vec<u8>, precondition: Precondition) -> Result<WriteOutcome> {
        let mut state = self.state.lock().await;
        state.check_failure(key)?;
        if !state.precondition_holds(key, &precondition) {
            return Ok(WriteOutcome::VersionConflict);
        }
        Ok(WriteOutcome::Written(state.put(key, bytes)))
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        state.check_failure(prefix)?;
        Ok(state
            .objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn compose_into(&self, dest: &str, sources: &[String], precondition: Precondition) -> Result<WriteOutcome> {
        if !self.capabilities.server_compose {
            return Err(CollectorError::StoreUnsupported("memory store configured without compose".to_string()));
        }
        if sources.len() > self.capabilities.max_compose_sources {
            return Err(CollectorError::StoreRequest {
                status: 400,
                message: format!(
                    "compose of {} sources exceeds limit {}",
                    sources.len(),
                    self.capabilities.max_compose_sources
                ),
            });
        }

        let mut state = self.state.lock().await;
        state.check_failure(dest)?;
        let mut combined = Vec::new();
        for source in sources {
            let entry = state.objects.get(source).ok_or_else(|| CollectorError::StoreRequest {
                status: 404,
                message: format!("compose source not found: {}", source),
            })?;
            combined.extend_from_slice(&entry.bytes);
        }
        if !state.precondition_holds(dest, &precondition) {
            return Ok(WriteOutcome::VersionConflict);
        }
        state.compose_sizes.push(sources.len());
        Ok(WriteOutcome::Written(state.put(dest, combined)))
    }

    async fn copy(&self, source: &str, dest: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_failure(dest)?;
        let bytes = state
            .objects
            .get(source)
            .map(|e| e.bytes.clone())
            .ok_or_else(|| CollectorError::StoreRequest {
                status: 404,
                message: format!("copy source not found: {}", source),
            })?;
        state.put(dest, bytes);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.objects.remove(key);
        Ok(())
    }

    async fn modified_at(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let state = self.state.lock().await;
        Ok(state.objects.get(key).map(|e| e.modified))
    }
}
