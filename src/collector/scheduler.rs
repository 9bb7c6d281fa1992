/// Periodic minute-aggregate and daily rollup publishing
///
/// One job per (pair, cadence). A job is due when its last successful
/// publish is older than the cadence interval; failures leave the
/// timestamp alone so the job stays due.
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::data::{Composer, WindowAggregator};
use crate::error::Result;
use crate::storage::{KeyLayout, ObjectStore, Precondition};
use crate::types::{Cadence, Config, Pair};
use crate::utils::time::trailing_minutes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Idle,
    Due,
    Publishing,
}

#[derive(Debug, Clone)]
pub struct JobState {
    pub phase: JobPhase,
    pub last_success: Option<DateTime<Utc>>,
}

impl JobState {
    fn new() -> Self {
        JobState {
            phase: JobPhase::Idle,
            last_success: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub aggregate_interval: Duration,
    pub raw_interval: Duration,
    /// Minutes re-aggregated on each near-live publish
    pub lookback_minutes: u64,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        SchedulerSettings {
            aggregate_interval: Duration::minutes(config.publish_1min_minutes as i64),
            raw_interval: Duration::minutes(config.publish_5s_minutes as i64),
            lookback_minutes: config.aggregate_lookback(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub published: usize,
    pub failed: usize,
}

pub struct PublishScheduler {
    store: Arc<dyn ObjectStore>,
    composer: Composer,
    settings: SchedulerSettings,
    jobs: BTreeMap<(Pair, Cadence), JobState>,
}

impl PublishScheduler {
    pub fn new(store: Arc<dyn ObjectStore>, pairs: Vec<Pair>, settings: SchedulerSettings) -> Self {
        let jobs = pairs
            .into_iter()
            .flat_map(|pair| {
                [Cadence::MinuteAggregate, Cadence::RawDaily]
                    .map(|cadence| ((pair.clone(), cadence), JobState::new()))
            })
            .collect();
        PublishScheduler {
            composer: Composer::new(store.clone()),
            store,
            settings,
            jobs,
        }
    }

    pub fn job(&self, pair: &Pair, cadence: Cadence) -> Option<&JobState> {
        self.jobs.get(&(pair.clone(), cadence))
    }

    fn interval(&self, cadence: Cadence) -> Duration {
        match cadence {
            Cadence::MinuteAggregate => self.settings.aggregate_interval,
            Cadence::RawDaily => self.settings.raw_interval,
        }
    }

    /// Run every job whose interval has elapsed
    pub async fn run_due(&mut self, now: DateTime<Utc>) -> PublishReport {
        self.run_jobs(now, false).await
    }

    /// Run every job regardless of timing (shutdown pass, manual repair)
    pub async fn publish_all(&mut self, now: DateTime<Utc>) -> PublishReport {
        self.run_jobs(now, true).await
    }

    async fn run_jobs(&mut self, now: DateTime<Utc>, force: bool) -> PublishReport {
        let mut report = PublishReport::default();
        let keys: Vec<(Pair, Cadence)> = self.jobs.keys().cloned().collect();

        for (pair, cadence) in keys {
            let interval = self.interval(cadence);
            let previous = {
                let Some(state) = self.jobs.get_mut(&(pair.clone(), cadence)) else {
                    continue;
                };
                let due = force || state.last_success.map_or(true, |last| now - last >= interval);
                if !due {
                    continue;
                }
                state.phase = JobPhase::Due;
                state.last_success
            };

            self.set_phase(&pair, cadence, JobPhase::Publishing);
            let result = self.publish(&pair, cadence, now, previous).await;

            if let Some(state) = self.jobs.get_mut(&(pair.clone(), cadence)) {
                state.phase = JobPhase::Idle;
                match result {
                    Ok(()) => {
                        state.last_success = Some(now);
                        report.published += 1;
                        match cadence {
                            Cadence::MinuteAggregate => info!("📊 Published 1min data for {}", pair),
                            Cadence::RawDaily => info!("📈 Published 5s daily data for {}", pair),
                        }
                    }
                    Err(e) => {
                        report.failed += 1;
                        error!("Failed to publish {} {}: {} ({})", cadence.as_str(), pair, e, e.error_code());
                    }
                }
            }
        }
        report
    }

    fn set_phase(&mut self, pair: &Pair, cadence: Cadence, phase: JobPhase) {
        if let Some(state) = self.jobs.get_mut(&(pair.clone(), cadence)) {
            state.phase = phase;
        }
    }

    async fn publish(
        &self,
        pair: &Pair,
        cadence: Cadence,
        now: DateTime<Utc>,
        previous_success: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if cadence == Cadence::MinuteAggregate {
            let minutes = trailing_minutes(now, self.settings.lookback_minutes);
            self.publish_minute_aggregates(pair, &minutes).await?;
        }

        let today = now.date_naive();
        // The previous run may have missed the last minutes of an earlier day
        if let Some(previous) = previous_success {
            let previous_day = previous.date_naive();
            if previous_day < today {
                info!("🌙 Day rollover for {}: finalizing {} {}", pair, cadence.as_str(), previous_day);
                self.compose_daily(pair, cadence, previous_day).await?;
            }
        }
        self.compose_daily(pair, cadence, today).await?;
        Ok(())
    }

    /// Re-aggregate each listed minute; returns how many aggregates were written
    pub async fn publish_minute_aggregates(&self, pair: &Pair, minutes: &[DateTime<Utc>]) -> Result<usize> {
        let mut written = 0;
        for minute in minutes {
            if self.aggregate_minute(pair, *minute).await? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Fold one minute's raw ticks into its aggregate object (whole overwrite).
    /// Minutes without parseable ticks are left alone.
    pub async fn aggregate_minute(&self, pair: &Pair, minute: DateTime<Utc>) -> Result<bool> {
        let raw_key = KeyLayout::raw_minute(pair, minute);
        let bytes = self.store.read(&raw_key).await?;
        if bytes.is_empty() {
            return Ok(false);
        }
        let ticks = WindowAggregator::parse_ticks(&raw_key, &bytes);
        if ticks.is_empty() {
            return Ok(false);
        }

        let aggregate = WindowAggregator::aggregate(pair, minute, &ticks);
        let line = format!("{}\n", aggregate.to_line()?);
        self.store
            .write_whole(&KeyLayout::aggregate_minute(pair, minute), line.into_bytes(), Precondition::None)
            .await?;
        debug!("Aggregated {} ticks for {} at {}", ticks.len(), pair, minute);
        Ok(true)
    }

    /// Compose all per-minute objects of `date` into the daily object
    pub async fn compose_daily(&self, pair: &Pair, cadence: Cadence, date: NaiveDate) -> Result<usize> {
        let sources = self
            .store
            .list_by_prefix(&KeyLayout::minute_prefix(pair, cadence, date))
            .await?;
        self.composer
            .compose_many(&KeyLayout::daily(pair, cadence, date), &sources)
            .await
    }

    /// Rebuild a whole day for one pair: every raw minute is re-aggregated,
    /// then both daily objects are recomposed. Returns (aggregates, raw minutes).
    pub async fn rollup_day(&self, pair: &Pair, date: NaiveDate) -> Result<(usize, usize)> {
        let raw_keys = self
            .store
            .list_by_prefix(&KeyLayout::minute_prefix(pair, Cadence::RawDaily, date))
            .await?;
        let minutes: Vec<DateTime<Utc>> = raw_keys.iter().filter_map(|k| KeyLayout::minute_of(k)).collect();

        let aggregates = self.publish_minute_aggregates(pair, &minutes).await?;
        self.compose_daily(pair, Cadence::MinuteAggregate, date).await?;
        let raw = self.compose_daily(pair, Cadence::RawDaily, date).await?;
        Ok((aggregates, raw))
    }

    /// Periodic loop; a final forced pass runs once shutdown is signalled
    pub async fn run(mut self, period: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        info!("📤 Publish scheduler started ({} jobs)", self.jobs.len());
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_due(Utc::now()).await;
                    if report.published + report.failed > 0 {
                        debug!("Publish pass: {} published, {} failed", report.published, report.failed);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("📤 Final publish pass before shutdown...");
        let report = self.publish_all(Utc::now()).await;
        info!("📤 Final publish pass: {} published, {} failed", report.published, report.failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::{DataClass, TickRecord};
    use chrono::TimeZone;

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            aggregate_interval: Duration::minutes(5),
            raw_interval: Duration::minutes(60),
            lookback_minutes: 5,
        }
    }

    fn at(day: u32, hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, day, hour, minute, second).unwrap()
    }

    async fn put_tick(store: &MemoryStore, pair: &Pair, ts: DateTime<Utc>, mid: f64) {
        let tick = TickRecord {
            timestamp: ts,
            venue: pair.venue.clone(),
            instrument: pair.instrument.clone(),
            data_class: pair.data_class,
            mid: Some(mid),
            spread_l5_pct: Some(0.01),
            spread_l50_pct: Some(0.02),
            spread_l100_pct: Some(0.03),
            vol_l50_bids: Some(5.0),
            vol_l50_asks: Some(6.0),
            depth_bids: Some(200),
            depth_asks: Some(200),
        };
        let key = KeyLayout::raw_minute(pair, ts);
        let mut bytes = store.read(&key).await.unwrap();
        bytes.extend(format!("{}\n", tick.to_line().unwrap()).into_bytes());
        store.write_whole(&key, bytes, Precondition::None).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_builds_aggregates_and_dailies() {
        let store = Arc::new(MemoryStore::new());
        let pair = Pair::new("kraken", "BTC", DataClass::Spot);
        put_tick(&store, &pair, at(15, 10, 3, 5), 100.0).await;
        put_tick(&store, &pair, at(15, 10, 3, 10), 102.0).await;
        put_tick(&store, &pair, at(15, 10, 4, 5), 104.0).await;

        let mut scheduler = PublishScheduler::new(store.clone(), vec![pair.clone()], settings());
        let report = scheduler.run_due(at(15, 10, 4, 30)).await;
        assert_eq!(report, PublishReport { published: 2, failed: 0 });

        let daily = String::from_utf8(
            store
                .read(&KeyLayout::daily(&pair, Cadence::MinuteAggregate, at(15, 0, 0, 0).date_naive()))
                .await
                .unwrap(),
        )
        .unwrap();
        let lines: Vec<&str> = daily.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with(r#"{"t":"2025-01-15T10:03:00Z","exchange":"kraken","asset":"BTC","mid":101.0"#));

        let raw_daily = store
            .read(&KeyLayout::daily(&pair, Cadence::RawDaily, at(15, 0, 0, 0).date_naive()))
            .await
            .unwrap();
        assert_eq!(String::from_utf8(raw_daily).unwrap().lines().count(), 3);
        assert_eq!(scheduler.job(&pair, Cadence::RawDaily).unwrap().phase, JobPhase::Idle);
    }

    #[tokio::test]
    async fn test_republishing_is_byte_identical() {
        let store = Arc::new(MemoryStore::new());
        let pair = Pair::new("okx", "ETH", DataClass::Futures);
        for (second, mid) in [(5, 3000.125), (10, 3000.5), (15, 2999.875)] {
            put_tick(&store, &pair, at(15, 10, 3, second), mid).await;
        }
        let scheduler = PublishScheduler::new(store.clone(), vec![pair.clone()], settings());
        let key = KeyLayout::aggregate_minute(&pair, at(15, 10, 3, 0));

        assert!(scheduler.aggregate_minute(&pair, at(15, 10, 3, 0)).await.unwrap());
        let first = store.read(&key).await.unwrap();
        assert!(scheduler.aggregate_minute(&pair, at(15, 10, 3, 0)).await.unwrap());

        assert_eq!(store.read(&key).await.unwrap(), first);
        assert!(!scheduler.aggregate_minute(&pair, at(15, 10, 9, 0)).await.unwrap());
    }

    #[tokio::test]
    async fn test_failing_pair_does_not_block_others() {
        let store = Arc::new(MemoryStore::new());
        let good = Pair::new("kraken", "ETH", DataClass::Spot);
        let bad = Pair::new("coinbase", "BTC", DataClass::Spot);
        put_tick(&store, &good, at(15, 10, 3, 5), 10.0).await;
        store.fail_prefix(Some("coinbase/")).await;

        let mut scheduler = PublishScheduler::new(store.clone(), vec![good.clone(), bad.clone()], settings());
        let report = scheduler.run_due(at(15, 10, 3, 30)).await;

        assert_eq!(report, PublishReport { published: 2, failed: 2 });
        assert!(scheduler.job(&bad, Cadence::MinuteAggregate).unwrap().last_success.is_none());
        assert_eq!(
            scheduler.job(&good, Cadence::MinuteAggregate).unwrap().last_success,
            Some(at(15, 10, 3, 30))
        );

        // Still due on the next pass; the healthy pair is not
        store.fail_prefix(None).await;
        let retry = scheduler.run_due(at(15, 10, 4, 0)).await;
        assert_eq!(retry, PublishReport { published: 2, failed: 0 });
    }

    #[tokio::test]
    async fn test_day_rollover_finalizes_previous_day() {
        let store = Arc::new(MemoryStore::new());
        let pair = Pair::new("bybit", "BTC", DataClass::Futures);
        put_tick(&store, &pair, at(15, 23, 54, 5), 1.0).await;

        let mut scheduler = PublishScheduler::new(
            store.clone(),
            vec![pair.clone()],
            SchedulerSettings {
                aggregate_interval: Duration::minutes(5),
                raw_interval: Duration::minutes(5),
                lookback_minutes: 5,
            },
        );
        scheduler.run_due(at(15, 23, 56, 0)).await;

        put_tick(&store, &pair, at(15, 23, 59, 55), 2.0).await;
        scheduler.run_due(at(16, 0, 1, 0)).await;

        let day = at(15, 0, 0, 0).date_naive();
        let raw_daily = store.read(&KeyLayout::daily(&pair, Cadence::RawDaily, day)).await.unwrap();
        assert_eq!(String::from_utf8(raw_daily).unwrap().lines().count(), 2);
        let agg_daily = store.read(&KeyLayout::daily(&pair, Cadence::MinuteAggregate, day)).await.unwrap();
        assert_eq!(String::from_utf8(agg_daily).unwrap().lines().count(), 2);
    }

    #[tokio::test]
    async fn test_rollup_day_rebuilds_everything() {
        let store = Arc::new(MemoryStore::new());
        let pair = Pair::new("kraken", "SOL", DataClass::Spot);
        for hour in [0, 6, 12, 23] {
            put_tick(&store, &pair, at(15, hour, 30, 5), 150.0).await;
        }
        let scheduler = PublishScheduler::new(store.clone(), vec![pair.clone()], settings());

        let (aggregates, raw) = scheduler.rollup_day(&pair, at(15, 0, 0, 0).date_naive()).await.unwrap();

        assert_eq!((aggregates, raw), (4, 4));
        let agg_daily = store
            .read(&KeyLayout::daily(&pair, Cadence::MinuteAggregate, at(15, 0, 0, 0).date_naive()))
            .await
            .unwrap();
        assert_eq!(String::from_utf8(agg_daily).unwrap().lines().count(), 4);
    }
}
