use crate::market::types::{LiquidationEvent, LiquidationSide};
use serde::{Deserialize, Serialize};

pub const RATE_WINDOW_MS: i64 = 60_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiquidationStats {
    pub long_liquidated_usd: f64,
    pub short_liquidated_usd: f64,
    pub total_usd: f64,
    pub long_count: usize,
    pub short_count: usize,
    pub major_count: usize,
    pub whale_count: usize,
    pub largest: Option<LiquidationEvent>,
    pub events_last_minute: usize,
    pub usd_last_minute: f64,
}

impl LiquidationStats {
    pub fn event_count(&self) -> usize {
        self.long_count + self.short_count
    }

    /// Events per minute over the trailing window.
    pub fn rate_per_minute(&self) -> f64 {
        self.events_last_minute as f64 * (60_000.0 / RATE_WINDOW_MS as f64)
    }
}

/// Single pass over the buffered events. Ties on the largest event keep the
/// earliest arrival.
pub fn aggregate_liquidations<'a, I>(events: I, now_ms: i64) -> LiquidationStats
where
    I: IntoIterator<Item = &'a LiquidationEvent>,
{
    let window_start = now_ms.saturating_sub(RATE_WINDOW_MS);
    let mut stats = LiquidationStats::default();
    let mut largest: Option<&LiquidationEvent> = None;

    for event in events {
        match event.side {
            LiquidationSide::LongLiquidated => {
                stats.long_liquidated_usd += event.usd_value;
                stats.long_count += 1;
            }
            LiquidationSide::ShortLiquidated => {
                stats.short_liquidated_usd += event.usd_value;
                stats.short_count += 1;
            }
        }
        if event.is_major {
            stats.major_count += 1;
        }
        if event.is_whale {
            stats.whale_count += 1;
        }
        if event.timestamp > window_start && event.timestamp <= now_ms {
            stats.events_last_minute += 1;
            stats.usd_last_minute += event.usd_value;
        }
        if largest.is_none_or(|current| event.usd_value > current.usd_value) {
            largest = Some(event);
        }
    }

    stats.total_usd = stats.long_liquidated_usd + stats.short_liquidated_usd;
    stats.largest = largest.cloned();
    stats
}
