/// Lossless single-line appends to shared NDJSON objects
///
/// Three strategies, picked from the store's capabilities:
/// - Serialized: the store appends natively under its own lock
/// - Compose: line goes to a temp object, then `[dest, temp]` is composed
///   into `dest` guarded by dest's generation
/// - CompareAndSwap: read-modify-write guarded by the version token
///
/// Conflicts are retried with jittered backoff inside a fixed budget.
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{CollectorError, Result};
use crate::storage::{KeyLayout, ObjectStore, Precondition, WriteOutcome};
use crate::types::{AppendConfig, AppendStrategyChoice};
use crate::utils::retry::{retry_with_backoff, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendStrategy {
    Serialized,
    Compose,
    CompareAndSwap,
}

impl AppendStrategy {
    /// Resolve the configured choice against what the store supports
    pub fn select(store: &dyn ObjectStore, choice: AppendStrategyChoice) -> Result<Self> {
        let caps = store.capabilities();
        match choice {
            AppendStrategyChoice::Auto => Ok(if caps.native_append {
                AppendStrategy::Serialized
            } else if caps.server_compose {
                AppendStrategy::Compose
            } else {
                AppendStrategy::CompareAndSwap
            }),
            AppendStrategyChoice::Serialized if !caps.native_append => Err(CollectorError::ConfigError(format!(
                "append_strategy = serialized but the {} store has no native append",
                store.name()
            ))),
            AppendStrategyChoice::Compose if !caps.server_compose => Err(CollectorError::ConfigError(format!(
                "append_strategy = compose but the {} store cannot compose",
                store.name()
            ))),
            AppendStrategyChoice::Serialized => Ok(AppendStrategy::Serialized),
            AppendStrategyChoice::Compose => Ok(AppendStrategy::Compose),
            AppendStrategyChoice::Cas => Ok(AppendStrategy::CompareAndSwap),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            AppendStrategy::Serialized => "serialized",
            AppendStrategy::Compose => "compose",
            AppendStrategy::CompareAndSwap => "cas",
        }
    }
}

/// One attempt's failure: a lost race, or a real store error
#[derive(Debug)]
enum AttemptError {
    Conflict,
    Store(CollectorError),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Conflict => f.write_str("version conflict"),
            AttemptError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl From<CollectorError> for AttemptError {
    fn from(e: CollectorError) -> Self {
        AttemptError::Store(e)
    }
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            AttemptError::Conflict => true,
            AttemptError::Store(e) => e.is_transient(),
        }
    }
}

pub struct AtomicAppender {
    store: Arc<dyn ObjectStore>,
    strategy: AppendStrategy,
    retry: RetryPolicy,
    unconditional_final_write: bool,
}

impl AtomicAppender {
    pub fn new(store: Arc<dyn ObjectStore>, choice: AppendStrategyChoice, config: &AppendConfig) -> Result<Self> {
        let strategy = AppendStrategy::select(store.as_ref(), choice)?;
        debug!("Append strategy for {} store: {}", store.name(), strategy.as_str());
        Ok(AtomicAppender {
            store,
            strategy,
            retry: RetryPolicy::new(
                config.max_retries.saturating_add(1),
                config.initial_delay_ms,
                config.max_delay_ms,
                config.initial_delay_ms,
            ),
            unconditional_final_write: config.unconditional_final_write,
        })
    }

    pub fn strategy(&self) -> AppendStrategy {
        self.strategy
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Append `line` (without its newline) to `key`
    pub async fn append(&self, key: &str, line: &str) -> Result<()> {
        if line.trim().is_empty() || line.contains('\n') || line.contains('\r') {
            return Err(CollectorError::InvalidRecord(format!(
                "append payload for {} must be one non-empty line",
                key
            )));
        }

        match self.strategy {
            AppendStrategy::Serialized => self.store.append_line(key, line).await,
            AppendStrategy::Compose => self.append_by_compose(key, line).await,
            AppendStrategy::CompareAndSwap => self.append_by_cas(key, line).await,
        }
    }

    async fn append_by_cas(&self, key: &str, line: &str) -> Result<()> {
        let result = retry_with_backoff(&self.retry, "cas append", AttemptError::is_retryable, || async move {
            let current = self.store.read_versioned(key).await?;
            let precondition = match current.version {
                Some(v) => Precondition::Matches(v),
                None => Precondition::MustNotExist,
            };
            let content = extend_with_line(current.bytes, line);
            match self.store.write_whole(key, content, precondition).await? {
                WriteOutcome::Written(_) => Ok(()),
                WriteOutcome::VersionConflict => Err(AttemptError::Conflict),
            }
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(AttemptError::Store(e)) => Err(e),
            Err(AttemptError::Conflict) if self.unconditional_final_write => {
                warn!("CAS budget exhausted for {}, forcing unconditional write", key);
                let current = self.store.read(key).await?;
                self.store
                    .write_whole(key, extend_with_line(current, line), Precondition::None)
                    .await?;
                Ok(())
            }
            Err(AttemptError::Conflict) => Err(CollectorError::AppendConflictBudgetExhausted {
                key: key.to_string(),
                attempts: self.retry.max_attempts,
            }),
        }
    }

    async fn append_by_compose(&self, key: &str, line: &str) -> Result<()> {
        let temp = KeyLayout::temp_append(key);
        let payload = format!("{}\n", line).into_bytes();
        self.store.write_whole(&temp, payload.clone(), Precondition::None).await?;

        let sources = [key.to_string(), temp.clone()];
        let result = retry_with_backoff(&self.retry, "compose append", AttemptError::is_retryable, || {
            let payload = payload.clone();
            let sources = &sources;
            async move {
                let outcome = match self.store.current_version(key).await? {
                    // Creation races resolve through MustNotExist
                    None => self.store.write_whole(key, payload, Precondition::MustNotExist).await?,
                    Some(v) => self.store.compose_into(key, sources, Precondition::Matches(v)).await?,
                };
                match outcome {
                    WriteOutcome::Written(_) => Ok(()),
                    WriteOutcome::VersionConflict => Err(AttemptError::Conflict),
                }
            }
        })
        .await;

        if let Err(e) = self.store.delete(&temp).await {
            debug!("Leaving temp object {} for pruning: {}", temp, e);
        }

        match result {
            Ok(()) => Ok(()),
            Err(AttemptError::Store(e)) => Err(e),
            Err(AttemptError::Conflict) => Err(CollectorError::AppendConflictBudgetExhausted {
                key: key.to_string(),
                attempts: self.retry.max_attempts,
            }),
        }
    }
}

/// `content + line + "\n"`, repairing a missing trailing newline first
fn extend_with_line(mut content: Vec<u8>, line: &str) -> Vec<u8> {
    if !content.is_empty() && !content.ends_with(b"\n") {
        content.push(b'\n');
    }
    content.extend_from_slice(line.as_bytes());
    content.push(b'\n');
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, StoreCapabilities, VersionedContent};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::collections::HashSet;

    fn roomy_budget() -> AppendConfig {
        AppendConfig {
            max_retries: 200,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            unconditional_final_write: false,
        }
    }

    async fn concurrent_appends(appender: Arc<AtomicAppender>, key: &str, n: usize) -> HashSet<String> {
        let mut handles = Vec::new();
        let mut expected = HashSet::new();
        for i in 0..n {
            let line = format!("{{\"n\":{}}}", i);
            expected.insert(line.clone());
            let appender = appender.clone();
            let key = key.to_string();
            handles.push(tokio::spawn(async move { appender.append(&key, &line).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        expected
    }

    async fn lines_of(store: &dyn ObjectStore, key: &str) -> Vec<String> {
        let bytes = store.read(key).await.unwrap();
        assert!(bytes.ends_with(b"\n"));
        String::from_utf8(bytes).unwrap().lines().map(str::to_string).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_cas_appends_lose_nothing() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::cas_only());
        let appender = Arc::new(AtomicAppender::new(store.clone(), AppendStrategyChoice::Auto, &roomy_budget()).unwrap());
        assert_eq!(appender.strategy(), AppendStrategy::CompareAndSwap);

        let expected = concurrent_appends(appender, "kraken/BTC/5s/min/2025-01-15/10/00.jsonl", 24).await;
        let lines = lines_of(store.as_ref(), "kraken/BTC/5s/min/2025-01-15/10/00.jsonl").await;

        assert_eq!(lines.len(), 24);
        assert_eq!(lines.into_iter().collect::<HashSet<_>>(), expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_compose_appends_lose_nothing() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let appender = Arc::new(AtomicAppender::new(store.clone(), AppendStrategyChoice::Auto, &roomy_budget()).unwrap());
        assert_eq!(appender.strategy(), AppendStrategy::Compose);

        let expected = concurrent_appends(appender, "okx/ETH/5s/min/2025-01-15/10/00.jsonl", 24).await;
        let lines = lines_of(store.as_ref(), "okx/ETH/5s/min/2025-01-15/10/00.jsonl").await;

        assert_eq!(lines.len(), 24);
        assert_eq!(lines.into_iter().collect::<HashSet<_>>(), expected);
        assert!(store.list_by_prefix("_tmp/").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_serialized_appends_lose_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(crate::storage::LocalStore::new(dir.path()).await.unwrap());
        let appender = Arc::new(AtomicAppender::new(store.clone(), AppendStrategyChoice::Auto, &AppendConfig::default()).unwrap());
        assert_eq!(appender.strategy(), AppendStrategy::Serialized);

        let expected = concurrent_appends(appender, "coinbase/BTC/5s/min/2025-01-15/10/00.jsonl", 24).await;
        let lines = lines_of(store.as_ref(), "coinbase/BTC/5s/min/2025-01-15/10/00.jsonl").await;

        assert_eq!(lines.len(), 24);
        assert_eq!(lines.into_iter().collect::<HashSet<_>>(), expected);
    }

    #[tokio::test]
    async fn test_rejects_multi_line_payloads() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let appender = AtomicAppender::new(store.clone(), AppendStrategyChoice::Auto, &AppendConfig::default()).unwrap();

        assert!(matches!(appender.append("k", "a\nb").await, Err(CollectorError::InvalidRecord(_))));
        assert!(matches!(appender.append("k", "   ").await, Err(CollectorError::InvalidRecord(_))));
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_strategy_selection_respects_capabilities() {
        let cas_only = MemoryStore::cas_only();
        assert!(AppendStrategy::select(&cas_only, AppendStrategyChoice::Compose).is_err());
        assert!(AppendStrategy::select(&cas_only, AppendStrategyChoice::Serialized).is_err());
        assert_eq!(
            AppendStrategy::select(&MemoryStore::new(), AppendStrategyChoice::Cas).unwrap(),
            AppendStrategy::CompareAndSwap
        );
    }

    /// Loses every conditional write; unconditional writes go through
    struct AlwaysContended {
        inner: MemoryStore,
    }

    #[async_trait]
    impl ObjectStore for AlwaysContended {
        fn name(&self) -> &str {
            "contended"
        }
        fn capabilities(&self) -> StoreCapabilities {
            self.inner.capabilities()
        }
        async fn exists(&self, key: &str) -> Result<bool> {
            self.inner.exists(key).await
        }
        async fn read_versioned(&self, key: &str) -> Result<VersionedContent> {
            self.inner.read_versioned(key).await
        }
        async fn write_whole(&self, key: &str, bytes: Vec<u8>, precondition: Precondition) -> Result<WriteOutcome> {
            match precondition {
                Precondition::None => self.inner.write_whole(key, bytes, precondition).await,
                _ => Ok(WriteOutcome::VersionConflict),
            }
        }
        async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list_by_prefix(prefix).await
        }
        async fn compose_into(&self, _dest: &str, _sources: &[String], _p: Precondition) -> Result<WriteOutcome> {
            Ok(WriteOutcome::VersionConflict)
        }
        async fn copy(&self, source: &str, dest: &str) -> Result<()> {
            self.inner.copy(source, dest).await
        }
        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }
        async fn modified_at(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
            self.inner.modified_at(key).await
        }
    }

    fn tight_budget(unconditional_final_write: bool) -> AppendConfig {
        AppendConfig {
            max_retries: 2,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            unconditional_final_write,
        }
    }

    #[tokio::test]
    async fn test_exhausted_budget_drops_the_append() {
        let store: Arc<dyn ObjectStore> = Arc::new(AlwaysContended { inner: MemoryStore::cas_only() });
        let appender = AtomicAppender::new(store.clone(), AppendStrategyChoice::Cas, &tight_budget(false)).unwrap();

        let err = appender.append("k", "{\"n\":1}").await.unwrap_err();
        assert!(matches!(err, CollectorError::AppendConflictBudgetExhausted { attempts: 3, .. }));
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_opt_in_final_unconditional_write() {
        let store: Arc<dyn ObjectStore> = Arc::new(AlwaysContended { inner: MemoryStore::cas_only() });
        let appender = AtomicAppender::new(store.clone(), AppendStrategyChoice::Cas, &tight_budget(true)).unwrap();

        appender.append("k", "{\"n\":1}").await.unwrap();
        assert_eq!(store.read("k").await.unwrap(), b"{\"n\":1}\n".to_vec());
    }

    #[test]
    fn test_extend_repairs_missing_newline() {
        assert_eq!(extend_with_line(b"a".to_vec(), "b"), b"a\nb\n".to_vec());
        assert_eq!(extend_with_line(Vec::new(), "b"), b"b\n".to_vec());
    }
}
