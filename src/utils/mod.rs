pub mod logging;
pub mod retry;
pub mod time;

pub use logging::init_logging;
pub use retry::{retry_with_backoff, RetryPolicy};
pub use time::*;
