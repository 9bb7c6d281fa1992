pub mod aggregator;
pub mod appender;
pub mod composer;
pub mod metrics;

pub use aggregator::WindowAggregator;
pub use appender::{AppendStrategy, AtomicAppender};
pub use composer::Composer;
pub use metrics::{compute_metrics, BookMetrics};
