/// Per-cycle fan-out across (venue, instrument) pairs
///
/// Each cycle runs one task per active pair with bounded concurrency and a
/// per-task timeout. Permanent exchange errors count against the venue;
/// past the threshold the venue is dropped until restart.
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::monitor::RepairTarget;
use super::stats::{CollectionStats, TaskResult};
use crate::data::{compute_metrics, AtomicAppender};
use crate::error::{CollectorError, Result};
use crate::storage::KeyLayout;
use crate::types::{Config, DataClass, Pair, TickRecord};
use crate::utils::retry::{retry_with_backoff, RetryPolicy};
use crate::venues::VenueClient;

/// Shallow book used to probe instruments at startup
const DISCOVERY_DEPTH: usize = 5;

/// Knobs the orchestrator needs from the config
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub order_book_depth: usize,
    pub spread_layers: [usize; 3],
    pub volume_layer: usize,
    pub max_concurrency: usize,
    pub task_timeout: Duration,
    pub venue_error_threshold: u32,
    pub fetch_retry: RetryPolicy,
}

impl CollectorSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let spread_layers: [usize; 3] = config
            .spread_layers
            .as_slice()
            .try_into()
            .map_err(|_| CollectorError::ConfigError("spread_layers must have exactly 3 entries".to_string()))?;
        Ok(CollectorSettings {
            order_book_depth: config.order_book_depth,
            spread_layers,
            volume_layer: config.volume_layer,
            max_concurrency: config.max_concurrency.max(1),
            task_timeout: Duration::from_secs(config.task_timeout_seconds),
            venue_error_threshold: config.venue_error_threshold,
            fetch_retry: config.fetch_retry.clone(),
        })
    }
}

/// Health is tracked per venue and data class; `bybit` spot and `bybit` futures
/// are separate sources with separate error counts
pub type VenueKey = (String, DataClass);

fn venue_label((name, data_class): &VenueKey) -> String {
    match data_class {
        DataClass::Spot => name.clone(),
        DataClass::Futures => format!("{}:futures", name),
    }
}

/// Consecutive permanent failures of one venue
#[derive(Debug, Clone, Default)]
pub struct VenueHealth {
    pub consecutive_errors: u32,
    pub last_error: Option<DateTime<Utc>>,
    pub disabled: bool,
}

/// A venue with the instruments that passed discovery
pub struct VenueSource {
    pub client: Arc<dyn VenueClient>,
    pub instruments: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub duration: Duration,
}

/// Probe every instrument once per venue; keep what answers.
/// Zero usable instruments across all venues is fatal.
pub async fn discover_sources(
    venues: Vec<Arc<dyn VenueClient>>,
    instruments: &[String],
    retry: &RetryPolicy,
) -> Result<Vec<VenueSource>> {
    let mut sources = Vec::new();
    let mut failed_venues = Vec::new();

    for client in venues {
        info!("🧪 Testing {} connection...", client.name());
        let mut available = Vec::new();
        for instrument in instruments {
            let label = format!("probe {}:{}", client.name(), instrument);
            let probe = retry_with_backoff(retry, &label, CollectorError::is_transient, || {
                client.fetch_order_book(instrument, DISCOVERY_DEPTH)
            })
            .await;
            match probe {
                Ok(book) if !book.bids.is_empty() && !book.asks.is_empty() => {
                    debug!("✅ {}: {} available", client.name(), instrument);
                    available.push(instrument.clone());
                }
                Ok(_) => warn!("❌ {}: {} returned an empty book", client.name(), instrument),
                Err(e) => warn!("❌ {}: {} unavailable ({}: {})", client.name(), instrument, e.error_code(), e),
            }
        }

        if available.is_empty() {
            warn!("⚠️  {} has no available instruments, skipping", client.name());
            failed_venues.push(client.name().to_string());
        } else {
            info!("✅ {}: {} instruments ({})", client.name(), available.len(), available.join(", "));
            sources.push(VenueSource {
                client,
                instruments: available,
            });
        }
    }

    if sources.is_empty() {
        return Err(CollectorError::NoDataSources(format!(
            "no venue answered for any of: {}",
            instruments.join(", ")
        )));
    }
    info!(
        "🎯 Active venues: {} | Failed: {}",
        sources.iter().map(|s| s.client.name().to_string()).collect::<Vec<_>>().join(", "),
        if failed_venues.is_empty() { "none".to_string() } else { failed_venues.join(", ") }
    );
    Ok(sources)
}

pub struct CollectionOrchestrator {
    sources: Vec<VenueSource>,
    appender: Arc<AtomicAppender>,
    settings: CollectorSettings,
    health: RwLock<HashMap<VenueKey, VenueHealth>>,
    stats: RwLock<CollectionStats>,
}

impl CollectionOrchestrator {
    pub fn new(sources: Vec<VenueSource>, appender: Arc<AtomicAppender>, settings: CollectorSettings) -> Self {
        let health = sources
            .iter()
            .map(|s| ((s.client.name().to_string(), s.client.data_class()), VenueHealth::default()))
            .collect();
        CollectionOrchestrator {
            sources,
            appender,
            settings,
            health: RwLock::new(health),
            stats: RwLock::new(CollectionStats::new()),
        }
    }

    /// Every pair discovered at startup, disabled venues included
    pub fn all_pairs(&self) -> Vec<Pair> {
        self.sources
            .iter()
            .flat_map(|s| {
                s.instruments
                    .iter()
                    .map(move |i| Pair::new(s.client.name(), i, s.client.data_class()))
            })
            .collect()
    }

    pub async fn enabled_pairs(&self) -> Vec<Pair> {
        let health = self.health.read().await;
        self.all_pairs()
            .into_iter()
            .filter(|p| {
                !health
                    .get(&(p.venue.clone(), p.data_class))
                    .map_or(false, |h| h.disabled)
            })
            .collect()
    }

    pub async fn disabled_venues(&self) -> Vec<String> {
        let health = self.health.read().await;
        let mut names: Vec<String> = health.iter().filter(|(_, h)| h.disabled).map(|(k, _)| venue_label(k)).collect();
        names.sort();
        names
    }

    pub async fn venue_health(&self, venue: &str, data_class: DataClass) -> Option<VenueHealth> {
        self.health.read().await.get(&(venue.to_string(), data_class)).cloned()
    }

    fn client_for(&self, pair: &Pair) -> Option<&Arc<dyn VenueClient>> {
        self.sources
            .iter()
            .find(|s| s.client.name() == pair.venue && s.client.data_class() == pair.data_class)
            .map(|s| &s.client)
    }

    /// One collection cycle stamped with `now`
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CycleReport {
        let started = Instant::now();
        let pairs = self.enabled_pairs().await;

        let results: Vec<(Pair, TaskResult)> = stream::iter(pairs)
            .map(|pair| async move {
                let result = self.run_task(&pair, now).await;
                (pair, result)
            })
            .buffer_unordered(self.settings.max_concurrency)
            .collect()
            .await;

        let mut report = CycleReport {
            attempted: results.len(),
            ..CycleReport::default()
        };
        {
            let mut stats = self.stats.write().await;
            for (pair, result) in &results {
                stats.record(&pair.to_string(), *result, now);
                match result {
                    TaskResult::Appended => report.succeeded += 1,
                    TaskResult::Failed => report.failed += 1,
                    TaskResult::TimedOut => report.timed_out += 1,
                }
            }
            report.duration = started.elapsed();
            stats.record_cycle(report.duration);
        }
        report
    }

    /// Task wrapper: timeout, health bookkeeping, outcome classification
    async fn run_task(&self, pair: &Pair, ts: DateTime<Utc>) -> TaskResult {
        match tokio::time::timeout(self.settings.task_timeout, self.collect_pair(pair, ts)).await {
            Ok(Ok(tick)) => {
                self.record_venue_success(pair).await;
                debug!("✅ {}: mid {:?}", pair, tick.mid);
                TaskResult::Appended
            }
            Ok(Err(e)) => {
                match &e {
                    CollectorError::AppendConflictBudgetExhausted { .. } => {
                        self.stats.write().await.record_dropped_append();
                        warn!("🗑️  Dropped tick for {}: {}", pair, e);
                    }
                    e if e.is_permanent_venue_error() => {
                        warn!("Exchange error {}: {} ({})", pair, e, e.error_code());
                        self.record_venue_failure(pair).await;
                    }
                    e => warn!("Fetch failed {}: {} ({})", pair, e, e.error_code()),
                }
                TaskResult::Failed
            }
            Err(_) => {
                warn!("⏱️  Task timeout for {} after {:?}", pair, self.settings.task_timeout);
                TaskResult::TimedOut
            }
        }
    }

    /// Fetch with retry, compute metrics, append to the minute's raw object
    pub async fn collect_pair(&self, pair: &Pair, ts: DateTime<Utc>) -> Result<TickRecord> {
        let client = self
            .client_for(pair)
            .ok_or_else(|| CollectorError::UnsupportedVenue(pair.to_string()))?;

        let label = format!("fetch {}", pair);
        let book = retry_with_backoff(&self.settings.fetch_retry, &label, CollectorError::is_transient, || {
            client.fetch_order_book(&pair.instrument, self.settings.order_book_depth)
        })
        .await?;

        if book.bids.is_empty() || book.asks.is_empty() {
            return Err(CollectorError::InvalidRecord(format!("{}: one-sided order book", pair)));
        }

        let tick = compute_metrics(&book, self.settings.spread_layers, self.settings.volume_layer).into_tick(pair, ts);
        let line = tick.to_line()?;
        self.appender.append(&KeyLayout::raw_minute(pair, tick.timestamp), &line).await?;
        Ok(tick)
    }

    async fn record_venue_success(&self, pair: &Pair) {
        let mut health = self.health.write().await;
        if let Some(h) = health.get_mut(&(pair.venue.clone(), pair.data_class)) {
            h.consecutive_errors = 0;
        }
    }

    async fn record_venue_failure(&self, pair: &Pair) {
        let key = (pair.venue.clone(), pair.data_class);
        let mut health = self.health.write().await;
        let label = venue_label(&key);
        let h = health.entry(key).or_default();
        h.consecutive_errors += 1;
        h.last_error = Some(Utc::now());
        if h.consecutive_errors > self.settings.venue_error_threshold && !h.disabled {
            h.disabled = true;
            error!(
                "⛔ Disabling {} after {} consecutive errors (threshold {})",
                label, h.consecutive_errors, self.settings.venue_error_threshold
            );
        }
    }

    pub async fn log_health(&self) {
        let disabled = self.disabled_venues().await;
        self.stats.read().await.log_health(&disabled);
    }

    pub async fn stats_snapshot(&self) -> (u64, u64, u64) {
        let stats = self.stats.read().await;
        (stats.total_fetches, stats.successful_fetches, stats.failed_fetches)
    }
}

#[async_trait]
impl RepairTarget for CollectionOrchestrator {
    async fn active_pairs(&self) -> Vec<Pair> {
        self.enabled_pairs().await
    }

    /// Out-of-band fetch stamped 30s into the missed minute
    async fn force_collect(&self, pair: &Pair, minute: DateTime<Utc>) -> Result<()> {
        let ts = minute + ChronoDuration::seconds(30);
        match tokio::time::timeout(self.settings.task_timeout, self.collect_pair(pair, ts)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(CollectorError::TaskTimeout(format!("forced fetch {}", pair))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, ObjectStore};
    use crate::types::{AppendConfig, AppendStrategyChoice, DataClass};
    use crate::venues::{ScriptedFailure, SimulatedVenue};
    use chrono::TimeZone;

    fn settings(threshold: u32) -> CollectorSettings {
        CollectorSettings {
            order_book_depth: 20,
            spread_layers: [5, 50, 100],
            volume_layer: 50,
            max_concurrency: 4,
            task_timeout: Duration::from_millis(200),
            venue_error_threshold: threshold,
            fetch_retry: RetryPolicy::new(3, 1, 2, 0),
        }
    }

    fn appender(store: Arc<dyn ObjectStore>) -> Arc<AtomicAppender> {
        Arc::new(AtomicAppender::new(store, AppendStrategyChoice::Auto, &AppendConfig::default()).unwrap())
    }

    fn at(minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 10, minute, second).unwrap()
    }

    #[tokio::test]
    async fn test_cycle_appends_one_tick_per_pair() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let venue = Arc::new(SimulatedVenue::new("sim", DataClass::Spot));
        let sources = vec![VenueSource {
            client: venue.clone(),
            instruments: vec!["BTC".into(), "ETH".into()],
        }];
        let orchestrator = CollectionOrchestrator::new(sources, appender(store.clone()), settings(10));

        let report = orchestrator.run_cycle(at(0, 5)).await;
        orchestrator.run_cycle(at(0, 10)).await;

        assert_eq!((report.attempted, report.succeeded), (2, 2));
        let key = KeyLayout::raw_minute(&Pair::new("sim", "BTC", DataClass::Spot), at(0, 0));
        let text = String::from_utf8(store.read(&key).await.unwrap()).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.starts_with(r#"{"t":"2025-01-15T10:00:05Z","exchange":"sim","asset":"BTC""#));
    }

    #[tokio::test]
    async fn test_venue_disabled_after_threshold() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let venue = Arc::new(SimulatedVenue::new("flaky", DataClass::Spot));
        venue.fail_always("BTC", ScriptedFailure::Permanent).await;
        let sources = vec![VenueSource {
            client: venue.clone(),
            instruments: vec!["BTC".into()],
        }];
        let orchestrator = CollectionOrchestrator::new(sources, appender(store), settings(10));

        for cycle in 0..11u32 {
            orchestrator.run_cycle(at(0, cycle * 5)).await;
        }
        assert_eq!(venue.calls_for("BTC").await, 11);
        assert!(orchestrator.venue_health("flaky", DataClass::Spot).await.unwrap().disabled);

        for cycle in 11..15u32 {
            let report = orchestrator.run_cycle(at(cycle / 12, (cycle % 12) * 5)).await;
            assert_eq!(report.attempted, 0);
        }
        assert_eq!(venue.calls_for("BTC").await, 11);
        assert_eq!(orchestrator.disabled_venues().await, vec!["flaky".to_string()]);
    }

    #[tokio::test]
    async fn test_same_named_venues_keep_separate_health() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let spot = Arc::new(SimulatedVenue::new("bybit", DataClass::Spot));
        spot.fail_always("BTC", ScriptedFailure::Permanent).await;
        let futures = Arc::new(SimulatedVenue::new("bybit", DataClass::Futures));
        let sources = vec![
            VenueSource {
                client: spot.clone(),
                instruments: vec!["BTC".into()],
            },
            VenueSource {
                client: futures.clone(),
                instruments: vec!["BTC".into()],
            },
        ];
        let orchestrator = CollectionOrchestrator::new(sources, appender(store), settings(1));

        for cycle in 0..4u32 {
            orchestrator.run_cycle(at(0, cycle * 5)).await;
        }

        assert!(orchestrator.venue_health("bybit", DataClass::Spot).await.unwrap().disabled);
        assert!(!orchestrator.venue_health("bybit", DataClass::Futures).await.unwrap().disabled);
        assert_eq!(spot.calls_for("BTC").await, 2);
        assert_eq!(futures.calls_for("BTC").await, 4);
        assert_eq!(
            orchestrator.enabled_pairs().await,
            vec![Pair::new("bybit", "BTC", DataClass::Futures)]
        );
        assert_eq!(orchestrator.disabled_venues().await, vec!["bybit".to_string()]);
    }

    #[tokio::test]
    async fn test_timeouts_and_transient_errors_spare_venue_health() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let venue = Arc::new(SimulatedVenue::new("slow", DataClass::Spot));
        venue.fail_always("BTC", ScriptedFailure::Hang).await;
        venue.fail_always("ETH", ScriptedFailure::Transient).await;
        let sources = vec![VenueSource {
            client: venue.clone(),
            instruments: vec!["BTC".into(), "ETH".into()],
        }];
        let orchestrator = CollectionOrchestrator::new(sources, appender(store), settings(1));

        for cycle in 0..3u32 {
            let report = orchestrator.run_cycle(at(0, cycle * 5)).await;
            assert_eq!(report.timed_out, 1);
            assert_eq!(report.failed, 1);
            assert_eq!(report.succeeded, 0);
        }
        let health = orchestrator.venue_health("slow", DataClass::Spot).await.unwrap();
        assert_eq!(health.consecutive_errors, 0);
        assert!(!health.disabled);
        // 3 attempts per transient cycle
        assert_eq!(venue.calls_for("ETH").await, 9);
    }

    #[tokio::test]
    async fn test_discovery_drops_dead_instruments_and_venues() {
        let good = Arc::new(SimulatedVenue::new("good", DataClass::Spot));
        good.fail_always("DOGE", ScriptedFailure::Unavailable).await;
        let dead = Arc::new(SimulatedVenue::new("dead", DataClass::Futures));
        dead.fail_always("BTC", ScriptedFailure::Permanent).await;
        dead.fail_always("DOGE", ScriptedFailure::Permanent).await;

        let instruments = vec!["BTC".to_string(), "DOGE".to_string()];
        let venues: Vec<Arc<dyn VenueClient>> = vec![good.clone(), dead.clone()];
        let sources = discover_sources(venues, &instruments, &RetryPolicy::new(2, 1, 1, 0)).await.unwrap();

        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].client.name(), "good");
        assert_eq!(sources[0].instruments, vec!["BTC".to_string()]);
    }

    #[tokio::test]
    async fn test_no_sources_is_fatal() {
        let dead = Arc::new(SimulatedVenue::new("dead", DataClass::Spot));
        dead.fail_always("BTC", ScriptedFailure::Permanent).await;
        let venues: Vec<Arc<dyn VenueClient>> = vec![dead];

        let err = discover_sources(venues, &["BTC".to_string()], &RetryPolicy::no_retry()).await.err().unwrap();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_forced_collect_lands_in_missed_minute() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let venue = Arc::new(SimulatedVenue::new("sim", DataClass::Futures));
        let sources = vec![VenueSource {
            client: venue,
            instruments: vec!["BTC".into()],
        }];
        let orchestrator = CollectionOrchestrator::new(sources, appender(store.clone()), settings(10));
        let pair = Pair::new("sim", "BTC", DataClass::Futures);

        orchestrator.force_collect(&pair, at(7, 0)).await.unwrap();

        let text = String::from_utf8(store.read(&KeyLayout::raw_minute(&pair, at(7, 0))).await.unwrap()).unwrap();
        assert!(text.contains(r#""t":"2025-01-15T10:07:30Z""#));
        assert!(text.contains(r#""data_type":"futures""#));
    }
}
