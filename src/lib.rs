pub mod types;
pub mod error;
pub mod config;
pub mod storage;
pub mod data;
pub mod venues;
pub mod collector;
pub mod utils;

pub use types::*;
pub use error::{CollectorError, Result};
