/// Core type definitions for the depth collector
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::retry::RetryPolicy;
use crate::utils::time::iso_seconds;

/// Market the venue data comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataClass {
    #[default]
    Spot,
    #[serde(alias = "derivative")]
    Futures,
}

impl DataClass {
    pub fn as_str(&self) -> &str {
        match self {
            DataClass::Spot => "spot",
            DataClass::Futures => "futures",
        }
    }

    pub fn is_spot(&self) -> bool {
        matches!(self, DataClass::Spot)
    }
}

/// One (venue, instrument) collection target
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pair {
    pub venue: String,
    pub instrument: String,
    pub data_class: DataClass,
}

impl Pair {
    pub fn new(venue: &str, instrument: &str, data_class: DataClass) -> Self {
        Pair {
            venue: venue.to_string(),
            instrument: instrument.to_string(),
            data_class,
        }
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.data_class {
            DataClass::Spot => write!(f, "{}:{}", self.venue, self.instrument),
            DataClass::Futures => write!(f, "{}:{}:futures", self.venue, self.instrument),
        }
    }
}

/// Number of numeric fields carried by tick and minute records
pub const NUMERIC_FIELD_COUNT: usize = 8;

/// One sampled order book reduced to summary metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickRecord {
    #[serde(rename = "t", with = "iso_seconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "exchange")]
    pub venue: String,
    #[serde(rename = "asset")]
    pub instrument: String,
    #[serde(rename = "data_type", default, skip_serializing_if = "DataClass::is_spot")]
    pub data_class: DataClass,
    #[serde(default)]
    pub mid: Option<f64>,
    #[serde(rename = "spread_L5_pct", default)]
    pub spread_l5_pct: Option<f64>,
    #[serde(rename = "spread_L50_pct", default)]
    pub spread_l50_pct: Option<f64>,
    #[serde(rename = "spread_L100_pct", default)]
    pub spread_l100_pct: Option<f64>,
    #[serde(rename = "vol_L50_bids", default)]
    pub vol_l50_bids: Option<f64>,
    #[serde(rename = "vol_L50_asks", default)]
    pub vol_l50_asks: Option<f64>,
    #[serde(default)]
    pub depth_bids: Option<u64>,
    #[serde(default)]
    pub depth_asks: Option<u64>,
}

impl TickRecord {
    /// Numeric fields in wire order (mid, spreads, volumes, depths)
    pub fn numeric_values(&self) -> [Option<f64>; NUMERIC_FIELD_COUNT] {
        [
            self.mid,
            self.spread_l5_pct,
            self.spread_l50_pct,
            self.spread_l100_pct,
            self.vol_l50_bids,
            self.vol_l50_asks,
            self.depth_bids.map(|d| d as f64),
            self.depth_asks.map(|d| d as f64),
        ]
    }

    pub fn pair(&self) -> Pair {
        Pair::new(&self.venue, &self.instrument, self.data_class)
    }

    /// Serialize as a single NDJSON line (no trailing newline)
    pub fn to_line(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Per-minute mean of all ticks observed for one pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinuteAggregate {
    #[serde(rename = "t", with = "iso_seconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "exchange")]
    pub venue: String,
    #[serde(rename = "asset")]
    pub instrument: String,
    #[serde(rename = "data_type", default, skip_serializing_if = "DataClass::is_spot")]
    pub data_class: DataClass,
    pub mid: Option<f64>,
    #[serde(rename = "spread_L5_pct")]
    pub spread_l5_pct: Option<f64>,
    #[serde(rename = "spread_L50_pct")]
    pub spread_l50_pct: Option<f64>,
    #[serde(rename = "spread_L100_pct")]
    pub spread_l100_pct: Option<f64>,
    #[serde(rename = "vol_L50_bids")]
    pub vol_l50_bids: Option<f64>,
    #[serde(rename = "vol_L50_asks")]
    pub vol_l50_asks: Option<f64>,
    pub depth_bids: Option<f64>,
    pub depth_asks: Option<f64>,
}

impl MinuteAggregate {
    pub fn from_means(
        pair: &Pair,
        minute: DateTime<Utc>,
        means: [Option<f64>; NUMERIC_FIELD_COUNT],
    ) -> Self {
        let [mid, spread_l5_pct, spread_l50_pct, spread_l100_pct, vol_l50_bids, vol_l50_asks, depth_bids, depth_asks] =
            means;

        MinuteAggregate {
            timestamp: minute,
            venue: pair.venue.clone(),
            instrument: pair.instrument.clone(),
            data_class: pair.data_class,
            mid,
            spread_l5_pct,
            spread_l50_pct,
            spread_l100_pct,
            vol_l50_bids,
            vol_l50_asks,
            depth_bids,
            depth_asks,
        }
    }

    pub fn to_line(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Which rollup family a publish job produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Cadence {
    /// Raw 5s ticks composed into a daily file
    RawDaily,
    /// Minute aggregates published near-live, then composed daily
    MinuteAggregate,
}

impl Cadence {
    pub fn as_str(&self) -> &str {
        match self {
            Cadence::RawDaily => "5s",
            Cadence::MinuteAggregate => "1min",
        }
    }
}

/// Configuration for the collector
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Sampling
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_order_book_depth")]
    pub order_book_depth: usize,
    #[serde(default = "default_spread_layers")]
    pub spread_layers: Vec<usize>,
    #[serde(default = "default_volume_layer")]
    pub volume_layer: usize,

    // Publishing
    #[serde(default = "default_publish_1min_minutes")]
    pub publish_1min_minutes: u64,
    #[serde(default = "default_publish_5s_minutes")]
    pub publish_5s_minutes: u64,
    #[serde(default)]
    pub aggregate_lookback_minutes: Option<u64>,

    // Orchestration
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_task_timeout_seconds")]
    pub task_timeout_seconds: u64,
    #[serde(default = "default_venue_error_threshold")]
    pub venue_error_threshold: u32,
    #[serde(default = "default_health_log_every_cycles")]
    pub health_log_every_cycles: u64,
    #[serde(default = "RetryPolicy::venue_fetch_default")]
    pub fetch_retry: RetryPolicy,

    // Guaranteed delivery
    #[serde(default = "default_true")]
    pub monitor_enabled: bool,
    #[serde(default = "default_monitor_interval_seconds")]
    pub monitor_interval_seconds: u64,
    #[serde(default = "default_monitor_safety_margin_seconds")]
    pub monitor_safety_margin_seconds: u64,

    // Storage
    pub storage: StorageConfig,
    #[serde(default)]
    pub append: AppendConfig,

    // Sources
    pub venues: Vec<VenueConfig>,
    pub instruments: Vec<String>,

    // Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Minutes re-aggregated on each near-live publish
    pub fn aggregate_lookback(&self) -> u64 {
        self.aggregate_lookback_minutes
            .unwrap_or(self.publish_1min_minutes)
            .max(1)
    }

    pub fn enabled_venues(&self) -> impl Iterator<Item = &VenueConfig> {
        self.venues.iter().filter(|v| v.enabled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Local,
    Gcs,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_local_root")]
    pub local_root: String,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "default_credentials_path")]
    pub credentials_path: String,
    #[serde(default = "default_max_compose_sources")]
    pub max_compose_sources: usize,
    #[serde(default)]
    pub append_strategy: AppendStrategyChoice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AppendStrategyChoice {
    #[default]
    Auto,
    Cas,
    Compose,
    Serialized,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppendConfig {
    #[serde(default = "default_append_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_append_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_append_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub unconditional_final_write: bool,
}

impl Default for AppendConfig {
    fn default() -> Self {
        AppendConfig {
            max_retries: default_append_max_retries(),
            initial_delay_ms: default_append_initial_delay_ms(),
            max_delay_ms: default_append_max_delay_ms(),
            unconditional_final_write: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueConfig {
    pub name: String,
    pub quote: String,
    #[serde(default)]
    pub data_class: DataClass,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_interval_seconds() -> u64 {
    5
}

fn default_order_book_depth() -> usize {
    200
}

fn default_spread_layers() -> Vec<usize> {
    vec![5, 50, 100]
}

fn default_volume_layer() -> usize {
    50
}

fn default_publish_1min_minutes() -> u64 {
    5
}

fn default_publish_5s_minutes() -> u64 {
    60
}

fn default_max_concurrency() -> usize {
    8
}

fn default_task_timeout_seconds() -> u64 {
    30
}

fn default_venue_error_threshold() -> u32 {
    10
}

fn default_health_log_every_cycles() -> u64 {
    10
}

fn default_monitor_interval_seconds() -> u64 {
    30
}

fn default_monitor_safety_margin_seconds() -> u64 {
    30
}

fn default_local_root() -> String {
    "data".to_string()
}

fn default_credentials_path() -> String {
    "gcs-key.json".to_string()
}

fn default_max_compose_sources() -> usize {
    32
}

fn default_append_max_retries() -> u32 {
    5
}

fn default_append_initial_delay_ms() -> u64 {
    25
}

fn default_append_max_delay_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_true() -> bool {
    true
}
