/// Time utilities for minute windows and the wire timestamp format
use chrono::{DateTime, Duration, DurationRound, Timelike, Utc};

/// Floor a timestamp to the start of its minute
pub fn floor_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::minutes(1))
        .unwrap_or_else(|_| ts.with_second(0).and_then(|t| t.with_nanosecond(0)).unwrap_or(ts))
}

/// Drop sub-second precision
pub fn floor_second(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_nanosecond(0).unwrap_or(ts)
}

/// ISO-8601 UTC with a `Z` suffix, second precision
pub fn iso_utc(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// The `count` minutes ending at (and including) the minute containing `now`, oldest first
pub fn trailing_minutes(now: DateTime<Utc>, count: u64) -> Vec<DateTime<Utc>> {
    let end = floor_minute(now);
    (0..count as i64)
        .rev()
        .map(|back| end - Duration::minutes(back))
        .collect()
}

/// Serde adapter for the `t` field
pub mod iso_seconds {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::iso_utc(*ts))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        let parsed = DateTime::parse_from_rfc3339(&raw).map_err(de::Error::custom)?;
        Ok(super::floor_second(parsed.with_timezone(&Utc)))
    }
}
