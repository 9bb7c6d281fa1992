/// Object key layout shared with downstream readers. Must stay byte-compatible.
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

use crate::types::{Cadence, DataClass, Pair};

/// Root for disposable objects (append temporaries, compose intermediates)
pub const TEMP_PREFIX: &str = "_tmp/";

pub struct KeyLayout;

impl KeyLayout {
    /// `{venue}/{instrument}`, or `futures/{venue}/{instrument}` for derivatives
    pub fn pair_root(pair: &Pair) -> String {
        match pair.data_class {
            DataClass::Spot => format!("{}/{}", pair.venue, pair.instrument),
            DataClass::Futures => format!("futures/{}/{}", pair.venue, pair.instrument),
        }
    }

    /// Per-minute object for a cadence: `{root}/{cadence}/min/{date}/{hour}/{minute}.jsonl`
    pub fn minute_object(pair: &Pair, cadence: Cadence, ts: DateTime<Utc>) -> String {
        format!(
            "{}/{}/min/{}/{}.jsonl",
            Self::pair_root(pair),
            cadence.as_str(),
            ts.format("%Y-%m-%d"),
            ts.format("%H/%M")
        )
    }

    /// Raw 5s ticks for one minute
    pub fn raw_minute(pair: &Pair, ts: DateTime<Utc>) -> String {
        Self::minute_object(pair, Cadence::RawDaily, ts)
    }

    /// One-line minute aggregate
    pub fn aggregate_minute(pair: &Pair, ts: DateTime<Utc>) -> String {
        Self::minute_object(pair, Cadence::MinuteAggregate, ts)
    }

    /// Prefix listing every per-minute object of one day
    pub fn minute_prefix(pair: &Pair, cadence: Cadence, date: NaiveDate) -> String {
        format!(
            "{}/{}/min/{}/",
            Self::pair_root(pair),
            cadence.as_str(),
            date.format("%Y-%m-%d")
        )
    }

    /// Daily rollup: `{root}/{cadence}/{date}.jsonl`
    pub fn daily(pair: &Pair, cadence: Cadence, date: NaiveDate) -> String {
        format!(
            "{}/{}/{}.jsonl",
            Self::pair_root(pair),
            cadence.as_str(),
            date.format("%Y-%m-%d")
        )
    }

    /// Minute encoded in a per-minute key (`.../{date}/{hour}/{minute}.jsonl`)
    pub fn minute_of(key: &str) -> Option<DateTime<Utc>> {
        let mut parts = key.rsplit('/');
        let minute = parts.next()?.strip_suffix(".jsonl")?;
        let hour = parts.next()?;
        let date = NaiveDate::parse_from_str(parts.next()?, "%Y-%m-%d").ok()?;
        let time = NaiveTime::from_hms_opt(hour.parse().ok()?, minute.parse().ok()?, 0)?;
        Some(date.and_time(time).and_utc())
    }

    /// Disposable single-line object used by the compose append strategy
    pub fn temp_append(key: &str) -> String {
        format!("{}append/{}.{}.jsonl", TEMP_PREFIX, key, uuid::Uuid::new_v4().simple())
    }

    /// Intermediate object for one compose run; `run` ties the parts together
    pub fn temp_compose(dest: &str, run: &str, part: usize) -> String {
        format!("{}compose/{}.{}.part{}", TEMP_PREFIX, dest, run, part)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_spot_layout() {
        let pair = Pair::new("coinbase", "BTC", DataClass::Spot);
        let ts = Utc.with_ymd_and_hms(2025, 8, 3, 7, 5, 42).unwrap();
        let day = ts.date_naive();

        assert_eq!(KeyLayout::raw_minute(&pair, ts), "coinbase/BTC/5s/min/2025-08-03/07/05.jsonl");
        assert_eq!(KeyLayout::aggregate_minute(&pair, ts), "coinbase/BTC/1min/min/2025-08-03/07/05.jsonl");
        assert_eq!(KeyLayout::daily(&pair, Cadence::RawDaily, day), "coinbase/BTC/5s/2025-08-03.jsonl");
        assert_eq!(KeyLayout::daily(&pair, Cadence::MinuteAggregate, day), "coinbase/BTC/1min/2025-08-03.jsonl");
        assert_eq!(KeyLayout::minute_prefix(&pair, Cadence::RawDaily, day), "coinbase/BTC/5s/min/2025-08-03/");
    }

    #[test]
    fn test_futures_layout() {
        let pair = Pair::new("bybit", "ETH", DataClass::Futures);
        let ts = Utc.with_ymd_and_hms(2025, 8, 3, 23, 59, 1).unwrap();

        assert_eq!(KeyLayout::raw_minute(&pair, ts), "futures/bybit/ETH/5s/min/2025-08-03/23/59.jsonl");
        assert_eq!(KeyLayout::daily(&pair, Cadence::MinuteAggregate, ts.date_naive()), "futures/bybit/ETH/1min/2025-08-03.jsonl");
    }

    #[test]
    fn test_minute_of_key() {
        let pair = Pair::new("okx", "SOL", DataClass::Futures);
        let ts = Utc.with_ymd_and_hms(2025, 8, 3, 23, 59, 0).unwrap();

        assert_eq!(KeyLayout::minute_of(&KeyLayout::raw_minute(&pair, ts)), Some(ts));
        assert_eq!(KeyLayout::minute_of("okx/SOL/5s/2025-08-03.jsonl"), None);
        assert_eq!(KeyLayout::minute_of("okx/SOL/5s/min/2025-08-03/24/00.jsonl"), None);
    }

    #[test]
    fn test_temp_keys_live_outside_data_prefixes() {
        let tmp = KeyLayout::temp_append("kraken/BTC/5s/min/2025-08-03/07/05.jsonl");
        assert!(tmp.starts_with("_tmp/append/kraken/BTC/"));
        assert_ne!(tmp, KeyLayout::temp_append("kraken/BTC/5s/min/2025-08-03/07/05.jsonl"));
    }
}
