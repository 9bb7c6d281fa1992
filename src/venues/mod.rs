//! Exchange connectivity: order book snapshots per (venue, instrument)
//!
//! Every venue is reached through the [`VenueClient`] trait so the
//! orchestrator never knows whether it talks to a REST API or the
//! in-process simulator.

pub mod rest;
pub mod simulated;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{CollectorError, Result};
use crate::types::{DataClass, VenueConfig};

pub use rest::{RestVenue, RestVenueKind};
pub use simulated::{ScriptedFailure, SimulatedVenue};

/// One price level: (price, size)
pub type Level = (f64, f64);

/// Bid/ask snapshot, best levels first on each side
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderBook {
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
}

impl OrderBook {
    /// Drop unusable levels and sort bids descending, asks ascending
    pub fn normalized(mut self) -> Self {
        let usable = |&(price, size): &Level| price.is_finite() && price > 0.0 && size.is_finite() && size >= 0.0;
        self.bids.retain(usable);
        self.asks.retain(usable);
        self.bids.sort_by(|a, b| b.0.total_cmp(&a.0));
        self.asks.sort_by(|a, b| a.0.total_cmp(&b.0));
        self
    }

    pub fn truncated(mut self, depth: usize) -> Self {
        self.bids.truncate(depth);
        self.asks.truncate(depth);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

#[async_trait]
pub trait VenueClient: Send + Sync {
    /// Venue id as it appears in object keys and records
    fn name(&self) -> &str;

    fn data_class(&self) -> DataClass;

    /// Snapshot of at most `depth` levels per side for a base asset.
    /// Fails with RateLimited, TransientNetwork or a permanent exchange error.
    async fn fetch_order_book(&self, instrument: &str, depth: usize) -> Result<OrderBook>;
}

/// Build a client for a configured venue
pub fn make_venue(config: &VenueConfig) -> Result<Arc<dyn VenueClient>> {
    if config.name == "simulated" {
        return Ok(Arc::new(SimulatedVenue::new("simulated", config.data_class)));
    }
    let kind = RestVenueKind::from_name(&config.name)
        .ok_or_else(|| CollectorError::UnsupportedVenue(config.name.clone()))?;
    Ok(Arc::new(RestVenue::new(kind, &config.quote, config.data_class)?))
}
