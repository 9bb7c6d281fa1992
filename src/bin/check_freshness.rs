/// Watchdog: report how old the newest minute aggregate is for every configured pair.
/// Exits non-zero when any pair is stale.
///
/// Usage: check_freshness [config.toml] [--max-age-minutes N]
use chrono::{Duration, Utc};
use depthlog::{
    config::load_config,
    storage::{ndjson_lines, open_store, KeyLayout, ObjectStore},
    Cadence, MinuteAggregate, Pair,
};

const DEFAULT_MAX_AGE_MINUTES: i64 = 6;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config_path = "config.toml".to_string();
    let mut max_age = Duration::minutes(DEFAULT_MAX_AGE_MINUTES);

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--max-age-minutes" {
            let value = args
                .next()
                .ok_or_else(|| anyhow::anyhow!("--max-age-minutes needs a value"))?;
            max_age = Duration::minutes(value.parse()?);
        } else {
            config_path = arg;
        }
    }

    let config = load_config(&config_path)?;
    let store = open_store(&config.storage).await?;
    let now = Utc::now();

    println!("🩺 Data freshness ({})", now.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("==============================\n");

    let mut stale = Vec::new();
    for venue in config.enabled_venues() {
        for instrument in &config.instruments {
            let pair = Pair::new(&venue.name, instrument, venue.data_class);
            match latest_minute(store.as_ref(), &pair, now).await? {
                Some(ts) => {
                    let age = now - ts;
                    let fresh = age <= max_age;
                    println!(
                        "   {} {:<28} last {}  ({}m {}s ago)",
                        if fresh { "✅" } else { "❌" },
                        pair.to_string(),
                        ts.format("%H:%M"),
                        age.num_minutes(),
                        age.num_seconds() % 60
                    );
                    if !fresh {
                        stale.push(pair.to_string());
                    }
                }
                None => {
                    println!("   ❌ {:<28} no data today", pair.to_string());
                    stale.push(pair.to_string());
                }
            }
        }
    }

    if stale.is_empty() {
        println!("\n✅ All pairs fresh (threshold {}m)", max_age.num_minutes());
        Ok(())
    } else {
        println!("\n⚠️  {} stale pairs: {}", stale.len(), stale.join(", "));
        std::process::exit(1);
    }
}

/// Newest aggregate timestamp: the daily rollup's last line, else the newest minute object
async fn latest_minute(
    store: &dyn ObjectStore,
    pair: &Pair,
    now: chrono::DateTime<Utc>,
) -> anyhow::Result<Option<chrono::DateTime<Utc>>> {
    let today = now.date_naive();
    let daily_key = KeyLayout::daily(pair, Cadence::MinuteAggregate, today);
    let from_daily = ndjson_lines(&daily_key, &store.read(&daily_key).await?)
        .last()
        .and_then(|line| serde_json::from_str::<MinuteAggregate>(line).ok())
        .map(|agg| agg.timestamp);

    let minute_keys = store
        .list_by_prefix(&KeyLayout::minute_prefix(pair, Cadence::MinuteAggregate, today))
        .await?;
    let from_minutes = minute_keys.last().and_then(|key| KeyLayout::minute_of(key));

    Ok(from_daily.max(from_minutes))
}
