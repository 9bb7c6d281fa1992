/// Minute aggregation from raw ticks
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::storage::ndjson_lines;
use crate::types::{MinuteAggregate, Pair, TickRecord, NUMERIC_FIELD_COUNT};
use crate::utils::time::floor_minute;

/// Folds one minute of ticks into a single averaged record
pub struct WindowAggregator;

impl WindowAggregator {
    /// Field-wise mean over ticks that carry a finite value. Fields with no
    /// contributing tick stay null. Independent of tick order.
    pub fn aggregate(pair: &Pair, minute: DateTime<Utc>, ticks: &[TickRecord]) -> MinuteAggregate {
        let mut columns: [Vec<f64>; NUMERIC_FIELD_COUNT] = Default::default();
        for tick in ticks {
            for (column, value) in columns.iter_mut().zip(tick.numeric_values()) {
                if let Some(v) = value.filter(|v| v.is_finite()) {
                    column.push(v);
                }
            }
        }

        let means = columns.map(|mut column| Self::mean(&mut column));
        MinuteAggregate::from_means(pair, floor_minute(minute), means)
    }

    /// Summed in sorted order so the result is bit-identical for any input order
    fn mean(values: &mut [f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        values.sort_by(|a, b| a.total_cmp(b));
        let sum: f64 = values.iter().sum();
        Some(sum / values.len() as f64)
    }

    /// Decode an NDJSON object into ticks, skipping lines that fail to parse
    pub fn parse_ticks(key: &str, bytes: &[u8]) -> Vec<TickRecord> {
        let mut ticks = Vec::new();
        let mut skipped = 0usize;
        for line in ndjson_lines(key, bytes) {
            match serde_json::from_str::<TickRecord>(&line) {
                Ok(tick) => ticks.push(tick),
                Err(e) => {
                    skipped += 1;
                    warn!("Skipping malformed line in {}: {}", key, e);
                }
            }
        }
        if skipped > 0 {
            warn!("{} malformed lines skipped in {}", skipped, key);
        }
        ticks
    }
}
