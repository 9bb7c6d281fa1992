/// Guaranteed delivery backstop
///
/// Every period, looks at the most recent minute that closed at least
/// `safety_margin` ago. Any active pair whose raw object for that minute is
/// missing or empty gets exactly one forced fetch, stamped inside the minute.
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::storage::{KeyLayout, ObjectStore};
use crate::types::Pair;
use crate::utils::time::{floor_minute, iso_utc};

/// Minutes remembered in the handled set
const HANDLED_RETENTION_MINUTES: i64 = 60;

/// Who the monitor asks for pairs and repairs
#[async_trait]
pub trait RepairTarget: Send + Sync {
    async fn active_pairs(&self) -> Vec<Pair>;

    /// Fetch and append one tick into `minute`'s raw object
    async fn force_collect(&self, pair: &Pair, minute: DateTime<Utc>) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub minute: Option<DateTime<Utc>>,
    pub checked: usize,
    pub repaired: usize,
    pub failed: usize,
}

pub struct GuaranteedDeliveryMonitor {
    store: Arc<dyn ObjectStore>,
    target: Arc<dyn RepairTarget>,
    safety_margin: Duration,
    handled: BTreeMap<DateTime<Utc>, HashSet<Pair>>,
}

impl GuaranteedDeliveryMonitor {
    pub fn new(store: Arc<dyn ObjectStore>, target: Arc<dyn RepairTarget>, safety_margin: Duration) -> Self {
        GuaranteedDeliveryMonitor {
            store,
            target,
            safety_margin,
            handled: BTreeMap::new(),
        }
    }

    /// Latest minute m with m + 1min + margin <= now
    pub fn checkable_minute(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        floor_minute(now - self.safety_margin) - Duration::minutes(1)
    }

    pub async fn check(&mut self, now: DateTime<Utc>) -> MonitorReport {
        let minute = self.checkable_minute(now);
        let mut report = MonitorReport {
            minute: Some(minute),
            ..MonitorReport::default()
        };

        for pair in self.target.active_pairs().await {
            if self.handled.get(&minute).map_or(false, |set| set.contains(&pair)) {
                continue;
            }
            report.checked += 1;

            let key = KeyLayout::raw_minute(&pair, minute);
            let present = match self.store.read(&key).await {
                Ok(bytes) => !bytes.iter().all(u8::is_ascii_whitespace),
                Err(e) => {
                    // Unknown state; look again next pass
                    warn!("Monitor could not read {}: {}", key, e);
                    continue;
                }
            };
            self.handled.entry(minute).or_default().insert(pair.clone());
            if present {
                continue;
            }

            warn!("🚨 Missing data for {} at {}, forcing collection", pair, iso_utc(minute));
            match self.target.force_collect(&pair, minute).await {
                Ok(()) => {
                    report.repaired += 1;
                    info!("✅ Forced collection filled {} at {}", pair, iso_utc(minute));
                }
                Err(e) => {
                    report.failed += 1;
                    error!("❌ Forced collection failed for {} at {}: {}", pair, iso_utc(minute), e);
                }
            }
        }

        self.prune(now);
        report
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = floor_minute(now) - Duration::minutes(HANDLED_RETENTION_MINUTES);
        self.handled = self.handled.split_off(&cutoff);
    }

    pub fn handled_minutes(&self) -> usize {
        self.handled.len()
    }

    /// Periodic loop until shutdown is signalled
    pub async fn run(mut self, period: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        info!("🛡️  Guaranteed delivery monitor started (every {:?})", period);
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.check(Utc::now()).await;
                    if report.repaired + report.failed > 0 {
                        info!(
                            "🛡️  Monitor pass: {} checked, {} repaired, {} failed",
                            report.checked, report.repaired, report.failed
                        );
                    } else {
                        debug!("Monitor pass: {} checked, nothing missing", report.checked);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("🛡️  Guaranteed delivery monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, Precondition};
    use crate::types::DataClass;
    use chrono::TimeZone;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingTarget {
        pairs: Vec<Pair>,
        forced: Mutex<Vec<(Pair, DateTime<Utc>)>>,
    }

    #[async_trait]
    impl RepairTarget for RecordingTarget {
        async fn active_pairs(&self) -> Vec<Pair> {
            self.pairs.clone()
        }

        async fn force_collect(&self, pair: &Pair, minute: DateTime<Utc>) -> Result<()> {
            self.forced.lock().await.push((pair.clone(), minute));
            Ok(())
        }
    }

    fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, hour, minute, second).unwrap()
    }

    #[tokio::test]
    async fn test_missing_minute_forced_exactly_once() {
        let store = Arc::new(MemoryStore::new());
        let present = Pair::new("kraken", "BTC", DataClass::Spot);
        let missing = Pair::new("okx", "BTC", DataClass::Futures);
        store
            .write_whole(&KeyLayout::raw_minute(&present, at(10, 4, 0)), b"{}\n".to_vec(), Precondition::None)
            .await
            .unwrap();

        let target = Arc::new(RecordingTarget {
            pairs: vec![present.clone(), missing.clone()],
            ..Default::default()
        });
        let mut monitor = GuaranteedDeliveryMonitor::new(store, target.clone(), Duration::seconds(30));

        // Not yet past the margin: still looking at 10:03
        assert_eq!(monitor.checkable_minute(at(10, 5, 10)), at(10, 3, 0));

        let first = monitor.check(at(10, 5, 31)).await;
        let second = monitor.check(at(10, 5, 59)).await;

        assert_eq!(first.minute, Some(at(10, 4, 0)));
        assert_eq!((first.checked, first.repaired), (2, 1));
        assert_eq!(second.checked, 0);
        assert_eq!(*target.forced.lock().await, vec![(missing, at(10, 4, 0))]);
    }

    #[tokio::test]
    async fn test_disabled_venues_are_not_forced() {
        use crate::collector::orchestrator::{CollectionOrchestrator, CollectorSettings, VenueSource};
        use crate::data::AtomicAppender;
        use crate::types::{AppendConfig, AppendStrategyChoice};
        use crate::utils::retry::RetryPolicy;
        use crate::venues::{ScriptedFailure, SimulatedVenue};

        let store = Arc::new(MemoryStore::new());
        let good = Arc::new(SimulatedVenue::new("kraken", DataClass::Spot));
        let bad = Arc::new(SimulatedVenue::new("okx", DataClass::Futures));
        bad.fail_always("BTC", ScriptedFailure::Permanent).await;

        let appender = Arc::new(
            AtomicAppender::new(store.clone(), AppendStrategyChoice::Auto, &AppendConfig::default()).unwrap(),
        );
        let settings = CollectorSettings {
            order_book_depth: 20,
            spread_layers: [5, 50, 100],
            volume_layer: 50,
            max_concurrency: 2,
            task_timeout: std::time::Duration::from_secs(5),
            venue_error_threshold: 0,
            fetch_retry: RetryPolicy::no_retry(),
        };
        let sources = vec![
            VenueSource {
                client: good.clone(),
                instruments: vec!["BTC".into()],
            },
            VenueSource {
                client: bad.clone(),
                instruments: vec!["BTC".into()],
            },
        ];
        let orchestrator = Arc::new(CollectionOrchestrator::new(sources, appender, settings));

        orchestrator.run_cycle(at(10, 0, 5)).await;
        assert_eq!(orchestrator.disabled_venues().await, vec!["okx:futures".to_string()]);

        let mut monitor = GuaranteedDeliveryMonitor::new(store.clone(), orchestrator.clone(), Duration::seconds(30));
        let report = monitor.check(at(10, 2, 31)).await;

        assert_eq!(report.minute, Some(at(10, 1, 0)));
        assert_eq!((report.checked, report.repaired, report.failed), (1, 1, 0));
        assert_eq!(good.calls_for("BTC").await, 2);
        assert_eq!(bad.calls_for("BTC").await, 1);
        let kraken = Pair::new("kraken", "BTC", DataClass::Spot);
        assert!(store.exists(&KeyLayout::raw_minute(&kraken, at(10, 1, 0))).await.unwrap());
    }

    #[tokio::test]
    async fn test_handled_set_is_pruned_to_an_hour() {
        let store = Arc::new(MemoryStore::new());
        let target = Arc::new(RecordingTarget {
            pairs: vec![Pair::new("kraken", "ETH", DataClass::Spot)],
            ..Default::default()
        });
        let mut monitor = GuaranteedDeliveryMonitor::new(store, target.clone(), Duration::seconds(30));

        for minute in 0..59 {
            monitor.check(at(10, minute, 45)).await;
        }
        monitor.check(at(11, 30, 45)).await;

        assert!(monitor.handled_minutes() <= 61);
        assert!(monitor.handled_minutes() < 59);
        assert_eq!(target.forced.lock().await.len(), 60);
    }
}
