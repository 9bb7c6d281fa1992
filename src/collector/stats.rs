/// Collection statistics and periodic health summary
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tracing::{info, warn};

/// Cycle durations kept for averaging
const CYCLE_HISTORY: usize = 100;
/// Cycles averaged in the health line
const RECENT_CYCLES: usize = 10;
/// Pairs below this success percentage are reported
const UNHEALTHY_PAIR_PCT: f64 = 80.0;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PairHealth {
    pub success: u64,
    pub failed: u64,
    pub last_success: Option<DateTime<Utc>>,
}

impl PairHealth {
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.success + self.failed;
        (total > 0).then(|| self.success as f64 / total as f64 * 100.0)
    }
}

/// How a single pair's task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    Appended,
    Failed,
    TimedOut,
}

#[derive(Debug, Default)]
pub struct CollectionStats {
    pub total_fetches: u64,
    pub successful_fetches: u64,
    pub failed_fetches: u64,
    pub timed_out_fetches: u64,
    pub dropped_appends: u64,
    pub last_success_time: Option<DateTime<Utc>>,
    pub cycles: u64,
    cycle_times: VecDeque<Duration>,
    pairs: BTreeMap<String, PairHealth>,
}

impl CollectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, pair_key: &str, result: TaskResult, at: DateTime<Utc>) {
        self.total_fetches += 1;
        let health = self.pairs.entry(pair_key.to_string()).or_default();
        match result {
            TaskResult::Appended => {
                self.successful_fetches += 1;
                self.last_success_time = Some(at);
                health.success += 1;
                health.last_success = Some(at);
            }
            TaskResult::Failed => {
                self.failed_fetches += 1;
                health.failed += 1;
            }
            TaskResult::TimedOut => {
                self.failed_fetches += 1;
                self.timed_out_fetches += 1;
                health.failed += 1;
            }
        }
    }

    pub fn record_dropped_append(&mut self) {
        self.dropped_appends += 1;
    }

    pub fn record_cycle(&mut self, duration: Duration) {
        self.cycles += 1;
        self.cycle_times.push_back(duration);
        while self.cycle_times.len() > CYCLE_HISTORY {
            self.cycle_times.pop_front();
        }
    }

    pub fn success_rate(&self) -> Option<f64> {
        (self.total_fetches > 0).then(|| self.successful_fetches as f64 / self.total_fetches as f64 * 100.0)
    }

    /// Mean of the most recent cycle durations
    pub fn average_recent_cycle(&self) -> Duration {
        let recent: Vec<&Duration> = self.cycle_times.iter().rev().take(RECENT_CYCLES).collect();
        if recent.is_empty() {
            return Duration::ZERO;
        }
        recent.iter().copied().sum::<Duration>() / recent.len() as u32
    }

    /// Pairs under the success threshold, with their rate
    pub fn unhealthy_pairs(&self) -> Vec<(String, f64)> {
        self.pairs
            .iter()
            .filter_map(|(key, health)| {
                health
                    .success_rate()
                    .filter(|rate| *rate < UNHEALTHY_PAIR_PCT)
                    .map(|rate| (key.clone(), rate))
            })
            .collect()
    }

    pub fn pair(&self, key: &str) -> Option<&PairHealth> {
        self.pairs.get(key)
    }

    pub fn log_health(&self, disabled_venues: &[String]) {
        let Some(rate) = self.success_rate() else {
            return;
        };
        info!(
            "📊 Health: {}/{} success ({:.1}%) | Avg cycle: {:.1}s | Timeouts: {} | Dropped appends: {}",
            self.successful_fetches,
            self.total_fetches,
            rate,
            self.average_recent_cycle().as_secs_f64(),
            self.timed_out_fetches,
            self.dropped_appends
        );

        let unhealthy = self.unhealthy_pairs();
        if !unhealthy.is_empty() {
            let listed: Vec<String> = unhealthy.iter().map(|(k, r)| format!("{}({:.0}%)", k, r)).collect();
            warn!("⚠️  Unhealthy pairs: {}", listed.join(", "));
        }
        if !disabled_venues.is_empty() {
            warn!("⛔ Disabled venues: {}", disabled_venues.join(", "));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rates_and_unhealthy_pairs() {
        let mut stats = CollectionStats::new();
        let now = Utc::now();
        for _ in 0..9 {
            stats.record("kraken:BTC", TaskResult::Appended, now);
        }
        stats.record("kraken:BTC", TaskResult::TimedOut, now);
        stats.record("okx:ETH:futures", TaskResult::Appended, now);
        stats.record("okx:ETH:futures", TaskResult::Failed, now);

        assert_eq!(stats.total_fetches, 12);
        assert_eq!(stats.timed_out_fetches, 1);
        assert_eq!(stats.pair("kraken:BTC").unwrap().success_rate(), Some(90.0));
        assert_eq!(stats.unhealthy_pairs(), vec![("okx:ETH:futures".to_string(), 50.0)]);
    }

    #[test]
    fn test_recent_cycle_average_uses_last_ten() {
        let mut stats = CollectionStats::new();
        for _ in 0..20 {
            stats.record_cycle(Duration::from_secs(10));
        }
        for _ in 0..10 {
            stats.record_cycle(Duration::from_secs(2));
        }
        assert_eq!(stats.average_recent_cycle(), Duration::from_secs(2));
        assert_eq!(stats.cycles, 30);
    }
}
