/// Simulated venue (dry-run mode) with deterministic books
/// Failures can be scripted per instrument for exercising the orchestrator
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use super::{OrderBook, VenueClient};
use crate::error::{CollectorError, Result};
use crate::types::DataClass;

/// Failure modes a scripted fetch can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    RateLimited,
    Transient,
    Permanent,
    Unavailable,
    /// Never answers (until the caller's timeout fires)
    Hang,
}

#[derive(Debug, Default)]
struct Script {
    queued: HashMap<String, VecDeque<ScriptedFailure>>,
    always: HashMap<String, ScriptedFailure>,
    calls: HashMap<String, u64>,
}

pub struct SimulatedVenue {
    name: String,
    data_class: DataClass,
    script: Arc<RwLock<Script>>,
}

impl SimulatedVenue {
    pub fn new(name: &str, data_class: DataClass) -> Self {
        SimulatedVenue {
            name: name.to_string(),
            data_class,
            script: Arc::new(RwLock::new(Script::default())),
        }
    }

    /// Fail the next `count` fetches of `instrument` with `failure`
    pub async fn push_failures(&self, instrument: &str, failure: ScriptedFailure, count: usize) {
        let mut script = self.script.write().await;
        let queue = script.queued.entry(instrument.to_string()).or_default();
        queue.extend(std::iter::repeat(failure).take(count));
    }

    /// Fail every fetch of `instrument` with `failure`
    pub async fn fail_always(&self, instrument: &str, failure: ScriptedFailure) {
        self.script.write().await.always.insert(instrument.to_string(), failure);
    }

    /// Clear every scripted failure for `instrument`
    pub async fn recover(&self, instrument: &str) {
        let mut script = self.script.write().await;
        script.always.remove(instrument);
        script.queued.remove(instrument);
    }

    pub async fn calls_for(&self, instrument: &str) -> u64 {
        self.script.read().await.calls.get(instrument).copied().unwrap_or(0)
    }

    pub async fn total_calls(&self) -> u64 {
        self.script.read().await.calls.values().sum()
    }

    fn failure_error(&self, instrument: &str, failure: ScriptedFailure) -> CollectorError {
        match failure {
            ScriptedFailure::RateLimited => CollectorError::RateLimited(format!("{}: simulated 429", self.name)),
            ScriptedFailure::Transient => {
                CollectorError::TransientNetwork(format!("{}: simulated connection reset", self.name))
            }
            ScriptedFailure::Permanent => CollectorError::PermanentExchange {
                venue: self.name.clone(),
                message: format!("simulated rejection for {}", instrument),
            },
            ScriptedFailure::Unavailable => CollectorError::InstrumentUnavailable(format!("{}:{}", self.name, instrument)),
            // Only reached if the hang is somehow cut short
            ScriptedFailure::Hang => CollectorError::TaskTimeout(format!("{}:{}", self.name, instrument)),
        }
    }

    /// Reference price derived from the instrument name
    fn base_price(instrument: &str) -> f64 {
        match instrument.to_uppercase().as_str() {
            "BTC" => 60_000.0,
            "ETH" => 3_000.0,
            "SOL" => 150.0,
            other => 10.0 + other.bytes().map(f64::from).sum::<f64>(),
        }
    }

    fn synthetic_book(instrument: &str, depth: usize, call: u64) -> OrderBook {
        let base = Self::base_price(instrument);
        // Small deterministic drift so consecutive ticks differ
        let mid = base * (1.0 + ((call % 20) as f64 - 10.0) * 0.0001);
        let step = base * 0.0001;
        let bids = (0..depth)
            .map(|i| (mid - step * (i as f64 + 0.5), 1.0 + i as f64 * 0.1))
            .collect();
        let asks = (0..depth)
            .map(|i| (mid + step * (i as f64 + 0.5), 1.0 + i as f64 * 0.1))
            .collect();
        OrderBook { bids, asks }
    }
}

#[async_trait]
impl VenueClient for SimulatedVenue {
    fn name(&self) -> &str {
        &self.name
    }

    fn data_class(&self) -> DataClass {
        self.data_class
    }

    async fn fetch_order_book(&self, instrument: &str, depth: usize) -> Result<OrderBook> {
        let (call, failure) = {
            let mut script = self.script.write().await;
            let counter = script.calls.entry(instrument.to_string()).or_insert(0);
            *counter += 1;
            let call = *counter;
            let failure = match script.queued.get_mut(instrument).and_then(|q| q.pop_front()) {
                Some(f) => Some(f),
                None => script.always.get(instrument).copied(),
            };
            (call, failure)
        };

        match failure {
            Some(ScriptedFailure::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(self.failure_error(instrument, ScriptedFailure::Hang))
            }
            Some(f) => Err(self.failure_error(instrument, f)),
            None => {
                debug!("📝 [SIM] {}:{} book #{}", self.name, instrument, call);
                Ok(Self::synthetic_book(instrument, depth, call))
            }
        }
    }
}
