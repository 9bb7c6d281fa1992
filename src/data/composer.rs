/// Merge many small objects into one, within the store's per-call source limit
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{CollectorError, Result};
use crate::storage::{KeyLayout, ObjectStore, Precondition, WriteOutcome};

pub struct Composer {
    store: Arc<dyn ObjectStore>,
}

impl Composer {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Composer { store }
    }

    /// Write the concatenation of `sources` (sorted, deduplicated) to `dest`.
    /// Returns the number of sources merged; zero sources leave `dest` untouched.
    pub async fn compose_many(&self, dest: &str, sources: &[String]) -> Result<usize> {
        let mut sorted: Vec<String> = sources.iter().filter(|s| s.as_str() != dest).cloned().collect();
        sorted.sort();
        sorted.dedup();

        match sorted.len() {
            0 => {
                debug!("Nothing to compose into {}", dest);
                return Ok(0);
            }
            1 => {
                self.store.copy(&sorted[0], dest).await?;
                return Ok(1);
            }
            _ => {}
        }

        let caps = self.store.capabilities();
        if !caps.server_compose {
            self.concatenate_locally(dest, &sorted).await?;
        } else if sorted.len() <= caps.max_compose_sources {
            self.compose_once(dest, &sorted).await?;
        } else {
            self.compose_in_batches(dest, &sorted, caps.max_compose_sources).await?;
        }
        Ok(sorted.len())
    }

    async fn compose_once(&self, dest: &str, sources: &[String]) -> Result<()> {
        match self.store.compose_into(dest, sources, Precondition::None).await? {
            WriteOutcome::Written(_) => Ok(()),
            WriteOutcome::VersionConflict => Err(CollectorError::InternalError(format!(
                "unconditional compose into {} reported a conflict",
                dest
            ))),
        }
    }

    /// First batch takes `limit` sources; every later batch takes the running
    /// intermediate plus `limit - 1` sources, so no call exceeds `limit`.
    async fn compose_in_batches(&self, dest: &str, sources: &[String], limit: usize) -> Result<()> {
        if limit < 2 {
            return Err(CollectorError::ConfigError(format!("compose limit {} is below 2", limit)));
        }

        let run = uuid::Uuid::new_v4().simple().to_string();
        let mut intermediates: Vec<String> = Vec::new();
        let mut remaining = sources;
        let mut running: Option<String> = None;

        let result: Result<()> = async {
            loop {
                let room = if running.is_some() { limit - 1 } else { limit };
                let take = room.min(remaining.len());
                let (batch, rest) = remaining.split_at(take);
                remaining = rest;

                let mut call_sources = Vec::with_capacity(take + 1);
                if let Some(prev) = &running {
                    call_sources.push(prev.clone());
                }
                call_sources.extend_from_slice(batch);

                if remaining.is_empty() {
                    return self.compose_once(dest, &call_sources).await;
                }

                let part = KeyLayout::temp_compose(dest, &run, intermediates.len());
                self.compose_once(&part, &call_sources).await?;
                intermediates.push(part.clone());
                running = Some(part);
            }
        }
        .await;

        for part in &intermediates {
            if let Err(e) = self.store.delete(part).await {
                warn!("Failed to delete compose intermediate {}: {}", part, e);
            }
        }
        debug!(
            "Composed {} sources into {} using {} intermediates",
            sources.len(),
            dest,
            intermediates.len()
        );
        result
    }

    /// Stores without server-side compose get a read-and-rewrite
    async fn concatenate_locally(&self, dest: &str, sources: &[String]) -> Result<()> {
        let mut combined = Vec::new();
        for source in sources {
            let bytes = self.store.read(source).await?;
            if bytes.is_empty() {
                continue;
            }
            combined.extend_from_slice(&bytes);
            if !combined.ends_with(b"\n") {
                combined.push(b'\n');
            }
        }
        self.store.write_whole(dest, combined, Precondition::None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, StoreCapabilities};

    async fn seed(store: &MemoryStore, keys: &[String]) {
        for key in keys {
            store
                .write_whole(key, format!("{{\"src\":\"{}\"}}\n", key).into_bytes(), Precondition::None)
                .await
                .unwrap();
        }
    }

    fn minute_keys(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| format!("kraken/BTC/5s/min/2025-01-15/{:02}/{:02}.jsonl", i / 60, i % 60))
            .collect()
    }

    #[tokio::test]
    async fn test_source_order_does_not_matter() {
        let store = Arc::new(MemoryStore::new());
        let keys = vec!["p/a.jsonl".to_string(), "p/b.jsonl".to_string(), "p/c.jsonl".to_string()];
        seed(&store, &keys).await;
        let composer = Composer::new(store.clone());

        composer.compose_many("out/abc.jsonl", &keys).await.unwrap();
        let reversed: Vec<String> = keys.iter().rev().cloned().collect();
        composer.compose_many("out/cba.jsonl", &reversed).await.unwrap();

        let abc = store.read("out/abc.jsonl").await.unwrap();
        assert_eq!(abc, store.read("out/cba.jsonl").await.unwrap());
        assert!(String::from_utf8(abc).unwrap().starts_with("{\"src\":\"p/a.jsonl\"}"));
    }

    #[tokio::test]
    async fn test_batches_respect_source_limit() {
        let store = Arc::new(MemoryStore::new());
        let keys = minute_keys(45);
        seed(&store, &keys).await;
        let composer = Composer::new(store.clone());

        // Shuffled input must still produce sorted output
        let mut shuffled = keys.clone();
        shuffled.reverse();
        shuffled.swap(3, 17);
        assert_eq!(composer.compose_many("kraken/BTC/5s/2025-01-15.jsonl", &shuffled).await.unwrap(), 45);

        let mut naive = Vec::new();
        for key in &keys {
            naive.extend(store.read(key).await.unwrap());
        }
        assert_eq!(store.read("kraken/BTC/5s/2025-01-15.jsonl").await.unwrap(), naive);

        let sizes = store.compose_sizes().await;
        assert!(sizes.len() >= 2);
        assert!(sizes.iter().all(|&n| n <= 32));
        assert!(store.list_by_prefix("_tmp/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tiny_limit_many_rounds() {
        let store = Arc::new(MemoryStore::with_capabilities(StoreCapabilities {
            server_compose: true,
            native_append: false,
            max_compose_sources: 2,
        }));
        let keys = minute_keys(7);
        seed(&store, &keys).await;

        Composer::new(store.clone()).compose_many("day.jsonl", &keys).await.unwrap();

        let mut naive = Vec::new();
        for key in &keys {
            naive.extend(store.read(key).await.unwrap());
        }
        assert_eq!(store.read("day.jsonl").await.unwrap(), naive);
        assert!(store.compose_sizes().await.iter().all(|&n| n <= 2));
    }

    #[tokio::test]
    async fn test_single_and_empty_source_sets() {
        let store = Arc::new(MemoryStore::new());
        let keys = minute_keys(1);
        seed(&store, &keys).await;
        let composer = Composer::new(store.clone());

        assert_eq!(composer.compose_many("empty.jsonl", &[]).await.unwrap(), 0);
        assert!(!store.exists("empty.jsonl").await.unwrap());

        assert_eq!(composer.compose_many("one.jsonl", &keys).await.unwrap(), 1);
        assert_eq!(store.read("one.jsonl").await.unwrap(), store.read(&keys[0]).await.unwrap());
    }

    #[tokio::test]
    async fn test_falls_back_to_rewrite_without_compose() {
        let store = Arc::new(MemoryStore::cas_only());
        let keys = minute_keys(5);
        seed(&store, &keys).await;

        Composer::new(store.clone()).compose_many("day.jsonl", &keys).await.unwrap();

        let text = String::from_utf8(store.read("day.jsonl").await.unwrap()).unwrap();
        assert_eq!(text.lines().count(), 5);
    }
}
