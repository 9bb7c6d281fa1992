/// Main entry point for the depth collector service
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use depthlog::{
    collector::{
        discover_sources, CollectionOrchestrator, CollectorSettings, GuaranteedDeliveryMonitor, PublishScheduler,
        RepairTarget, SchedulerSettings,
    },
    config::load_config,
    data::AtomicAppender,
    error::Result,
    storage::{open_store, ObjectStore},
    utils::init_logging,
    venues::{make_venue, VenueClient},
    Config,
};

/// How often the scheduler looks for due publish jobs
const PUBLISH_CHECK_SECONDS: u64 = 30;

/// Application state
pub struct CollectorApp {
    config: Arc<Config>,
    store: Arc<dyn ObjectStore>,
    orchestrator: Arc<CollectionOrchestrator>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl CollectorApp {
    pub async fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        info!("🚀 Starting depth collector...");
        info!(
            "⏱️  Sampling every {}s | 1min publish every {}m | 5s publish every {}m",
            config.interval_seconds, config.publish_1min_minutes, config.publish_5s_minutes
        );

        let store = open_store(&config.storage).await?;
        let appender = Arc::new(AtomicAppender::new(
            store.clone(),
            config.storage.append_strategy,
            &config.append,
        )?);
        info!("🧩 Append strategy: {} on {}", appender.strategy().as_str(), store.name());

        let mut venues: Vec<Arc<dyn VenueClient>> = Vec::new();
        for venue in config.enabled_venues() {
            match make_venue(venue) {
                Ok(client) => venues.push(client),
                Err(e) => warn!("⚠️  Skipping venue {}: {} ({})", venue.name, e, e.error_code()),
            }
        }

        let sources = discover_sources(venues, &config.instruments, &config.fetch_retry).await?;
        let settings = CollectorSettings::from_config(&config)?;
        let orchestrator = Arc::new(CollectionOrchestrator::new(sources, appender, settings));
        info!("📋 Collecting {} pairs", orchestrator.all_pairs().len());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(CollectorApp {
            config,
            store,
            orchestrator,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Start background tasks and run the collection loop until Ctrl+C
    pub async fn run(self) -> Result<()> {
        let started = Utc::now();
        self.setup_shutdown_handler();
        let background = self.spawn_background_tasks();

        let interval = Duration::from_secs(self.config.interval_seconds);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown = self.shutdown_rx.clone();
        let mut cycles: u64 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    info!("Shutdown signal received");
                    break;
                }
            }

            let report = self.orchestrator.run_cycle(Utc::now()).await;
            cycles += 1;
            if report.duration > interval {
                warn!(
                    "⚠️  Cycle took {:.2}s, longer than the {}s interval",
                    report.duration.as_secs_f64(),
                    self.config.interval_seconds
                );
            }
            if self.config.health_log_every_cycles > 0 && cycles % self.config.health_log_every_cycles == 0 {
                self.orchestrator.log_health().await;
            }
        }

        self.shutdown_sequence(started, cycles, background).await
    }

    fn spawn_background_tasks(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let scheduler = PublishScheduler::new(
            self.store.clone(),
            self.orchestrator.all_pairs(),
            SchedulerSettings::from_config(&self.config),
        );
        handles.push(tokio::spawn(
            scheduler.run(Duration::from_secs(PUBLISH_CHECK_SECONDS), self.shutdown_rx.clone()),
        ));

        if self.config.monitor_enabled {
            let target: Arc<dyn RepairTarget> = self.orchestrator.clone();
            let monitor = GuaranteedDeliveryMonitor::new(
                self.store.clone(),
                target,
                chrono::Duration::seconds(self.config.monitor_safety_margin_seconds as i64),
            );
            handles.push(tokio::spawn(monitor.run(
                Duration::from_secs(self.config.monitor_interval_seconds),
                self.shutdown_rx.clone(),
            )));
        } else {
            info!("🛡️  Guaranteed delivery monitor disabled");
        }

        handles
    }

    /// Setup graceful shutdown handler
    fn setup_shutdown_handler(&self) {
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            info!("Ctrl+C received - initiating graceful shutdown");
            let _ = shutdown_tx.send(true);
        });
    }

    /// Stop background tasks (the scheduler runs its final publish pass) and log a summary
    async fn shutdown_sequence(&self, started: chrono::DateTime<Utc>, cycles: u64, background: Vec<JoinHandle<()>>) -> Result<()> {
        info!("Starting shutdown sequence...");
        let _ = self.shutdown_tx.send(true);

        for handle in background {
            if let Err(e) = handle.await {
                error!("Background task failed during shutdown: {}", e);
            }
        }

        self.orchestrator.log_health().await;
        let (total, succeeded, failed) = self.orchestrator.stats_snapshot().await;
        let uptime = Utc::now() - started;
        info!(
            "🏁 Shutdown complete: {} cycles, {} fetches ({} ok, {} failed), uptime {}m",
            cycles,
            total,
            succeeded,
            failed,
            uptime.num_minutes()
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CONFIG_PATH").ok())
        .unwrap_or_else(|| "config.toml".to_string());

    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Failed to load {}: {} ({})", config_path, e, e.error_code());
            return Err(e);
        }
    };
    init_logging(&config.logging);

    let app = match CollectorApp::new(config).await {
        Ok(app) => app,
        Err(e) => {
            error!("❌ Startup failed: {} ({})", e, e.error_code());
            return Err(e);
        }
    };

    app.run().await
}
