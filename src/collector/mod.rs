pub mod monitor;
pub mod orchestrator;
pub mod scheduler;
pub mod stats;

pub use monitor::{GuaranteedDeliveryMonitor, MonitorReport, RepairTarget};
pub use orchestrator::{discover_sources, CollectionOrchestrator, CollectorSettings, CycleReport, VenueSource};
pub use scheduler::{PublishReport, PublishScheduler, SchedulerSettings};
pub use stats::CollectionStats;
