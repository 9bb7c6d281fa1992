/// Rebuild minute aggregates and daily rollups for one UTC date (backfill / repair)
///
/// Usage: rollup_day <YYYY-MM-DD> [config.toml] [--prune-tmp]
use chrono::{Duration, NaiveDate, Utc};
use depthlog::{
    collector::{PublishScheduler, SchedulerSettings},
    config::load_config,
    storage::{open_store, prune_temp_objects},
    utils::init_logging,
    Pair,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut date = None;
    let mut config_path = "config.toml".to_string();
    let mut prune_tmp = false;

    for arg in std::env::args().skip(1) {
        if arg == "--prune-tmp" {
            prune_tmp = true;
        } else if date.is_none() {
            date = Some(NaiveDate::parse_from_str(&arg, "%Y-%m-%d")?);
        } else {
            config_path = arg;
        }
    }
    let date = date.ok_or_else(|| anyhow::anyhow!("usage: rollup_day <YYYY-MM-DD> [config.toml] [--prune-tmp]"))?;

    let config = load_config(&config_path)?;
    init_logging(&config.logging);
    let store = open_store(&config.storage).await?;

    let pairs: Vec<Pair> = config
        .enabled_venues()
        .flat_map(|venue| {
            config
                .instruments
                .iter()
                .map(move |instrument| Pair::new(&venue.name, instrument, venue.data_class))
        })
        .collect();

    info!("🔁 Rolling up {} for {} pairs", date, pairs.len());
    let scheduler = PublishScheduler::new(store.clone(), pairs.clone(), SchedulerSettings::from_config(&config));

    let mut failures = 0;
    for pair in &pairs {
        match scheduler.rollup_day(pair, date).await {
            Ok((aggregates, raw)) => info!("✅ {}: {} minute aggregates, {} raw minutes", pair, aggregates, raw),
            Err(e) => {
                failures += 1;
                error!("❌ {}: {} ({})", pair, e, e.error_code());
            }
        }
    }

    if prune_tmp {
        let removed = prune_temp_objects(store.as_ref(), Utc::now() - Duration::hours(1)).await?;
        info!("🧹 Removed {} temp objects", removed);
    }

    if failures > 0 {
        anyhow::bail!("{} pairs failed to roll up", failures);
    }
    Ok(())
}
