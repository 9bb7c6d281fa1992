/// Order book summary metrics
use chrono::{DateTime, Utc};

use crate::types::{Pair, TickRecord};
use crate::utils::time::floor_second;
use crate::venues::{Level, OrderBook};

/// Metrics for one snapshot; spreads follow the configured layer order
#[derive(Debug, Clone, PartialEq)]
pub struct BookMetrics {
    pub mid: Option<f64>,
    pub spreads_pct: [Option<f64>; 3],
    pub vol_bids: f64,
    pub vol_asks: f64,
    pub depth_bids: u64,
    pub depth_asks: u64,
}

impl BookMetrics {
    pub fn into_tick(self, pair: &Pair, timestamp: DateTime<Utc>) -> TickRecord {
        let [spread_l5_pct, spread_l50_pct, spread_l100_pct] = self.spreads_pct;
        TickRecord {
            timestamp: floor_second(timestamp),
            venue: pair.venue.clone(),
            instrument: pair.instrument.clone(),
            data_class: pair.data_class,
            mid: self.mid,
            spread_l5_pct,
            spread_l50_pct,
            spread_l100_pct,
            vol_l50_bids: Some(self.vol_bids),
            vol_l50_asks: Some(self.vol_asks),
            depth_bids: Some(self.depth_bids),
            depth_asks: Some(self.depth_asks),
        }
    }
}

fn mean_price(levels: &[Level], n: usize) -> Option<f64> {
    let take = n.min(levels.len());
    if take == 0 {
        return None;
    }
    Some(levels[..take].iter().map(|(price, _)| price).sum::<f64>() / take as f64)
}

fn summed_size(levels: &[Level], n: usize) -> f64 {
    levels.iter().take(n).map(|(_, size)| size).sum()
}

fn pct(numerator: f64, denominator: f64) -> Option<f64> {
    if denominator == 0.0 || !denominator.is_finite() {
        return None;
    }
    Some(numerator / denominator * 100.0).filter(|v| v.is_finite())
}

/// mid = (best bid + best ask) / 2; spread%@n compares the mean of the top
/// n ask and bid prices against mid; volume sums the top `volume_layer` sizes.
/// Expects a normalized book (best levels first).
pub fn compute_metrics(book: &OrderBook, spread_layers: [usize; 3], volume_layer: usize) -> BookMetrics {
    let mid = match (book.bids.first(), book.asks.first()) {
        (Some(bid), Some(ask)) => Some((bid.0 + ask.0) / 2.0),
        _ => None,
    };

    let spreads_pct = spread_layers.map(|n| {
        let (bid, ask) = (mean_price(&book.bids, n)?, mean_price(&book.asks, n)?);
        pct(ask - bid, mid?)
    });

    BookMetrics {
        mid,
        spreads_pct,
        vol_bids: summed_size(&book.bids, volume_layer),
        vol_asks: summed_size(&book.asks, volume_layer),
        depth_bids: book.bids.len() as u64,
        depth_asks: book.asks.len() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataClass;
    use chrono::TimeZone;

    fn book() -> OrderBook {
        OrderBook {
            bids: vec![(99.0, 1.0), (98.0, 2.0), (97.0, 3.0)],
            asks: vec![(101.0, 1.5), (102.0, 2.5)],
        }
    }

    fn close(actual: Option<f64>, expected: f64) -> bool {
        actual.map_or(false, |v| (v - expected).abs() < 1e-9)
    }

    #[test]
    fn test_metrics_from_small_book() {
        let m = compute_metrics(&book(), [1, 2, 100], 2);

        assert_eq!(m.mid, Some(100.0));
        assert!(close(m.spreads_pct[0], 2.0));
        // top-2: asks 101.5, bids 98.5
        assert!(close(m.spreads_pct[1], 3.0));
        // layer deeper than the book uses every level: asks 101.5, bids 98.0
        assert!(close(m.spreads_pct[2], 3.5));
        assert_eq!(m.vol_bids, 3.0);
        assert_eq!(m.vol_asks, 4.0);
        assert_eq!((m.depth_bids, m.depth_asks), (3, 2));
    }

    #[test]
    fn test_one_sided_book_has_no_mid() {
        let one_sided = OrderBook {
            bids: vec![(99.0, 1.0)],
            asks: vec![],
        };
        let m = compute_metrics(&one_sided, [5, 50, 100], 50);
        assert_eq!(m.mid, None);
        assert_eq!(m.spreads_pct, [None, None, None]);
        assert_eq!(m.vol_asks, 0.0);
        assert_eq!(m.depth_asks, 0);
    }

    #[test]
    fn test_into_tick_floors_timestamp() {
        let pair = Pair::new("bybit", "BTC", DataClass::Futures);
        let ts = Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 5).unwrap() + chrono::Duration::milliseconds(731);
        let tick = compute_metrics(&book(), [5, 50, 100], 50).into_tick(&pair, ts);

        assert_eq!(tick.timestamp, Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 5).unwrap());
        assert_eq!(tick.data_class, DataClass::Futures);
        assert_eq!(tick.depth_bids, Some(3));
    }
}
