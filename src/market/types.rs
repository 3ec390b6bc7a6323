use crate::error::AppError;
use serde::{Deserialize, Serialize};

pub const DEFAULT_SYMBOLS: [&str; 3] = ["BTCUSDT", "ETHUSDT", "SOLUSDT"];
pub const DEFAULT_PERSISTED_SYMBOLS: [&str; 2] = ["BTCUSDT", "ETHUSDT"];
pub const DEFAULT_STREAM_BASE_URL: &str = "wss://fstream.binance.com/stream";
pub const DEFAULT_INCLUDE_LIQUIDATIONS: bool = true;
pub const DEFAULT_FRAME_INTERVAL_MS: u64 = 16;
pub const DEFAULT_RING_CAPACITY: usize = 200;
pub const DEFAULT_OVERFLOW_THRESHOLD: usize = 50;
pub const DEFAULT_TICK_RETENTION: u32 = 500;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
pub const DEFAULT_BACKOFF_CAP_MS: u64 = 30_000;
pub const DEFAULT_BACKOFF_JITTER_MS: u64 = 250;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_LEASE_TTL_MS: u64 = 3_000;
pub const DEFAULT_COMPUTE_WORKERS: usize = 2;
pub const DEFAULT_MAJOR_LIQUIDATION_USD: f64 = 100_000.0;
pub const DEFAULT_WHALE_LIQUIDATION_USD: f64 = 1_000_000.0;
pub const DEFAULT_LATEST_EVENTS_LIMIT: usize = 50;
pub const MIN_FRAME_INTERVAL_MS: u64 = 8;
pub const MAX_FRAME_INTERVAL_MS: u64 = 1_000;
pub const MIN_RING_CAPACITY: usize = 10;
pub const MAX_RING_CAPACITY: usize = 10_000;
pub const MIN_TICK_RETENTION: u32 = 10;
pub const MAX_TICK_RETENTION: u32 = 10_000;
pub const MIN_BACKOFF_BASE_MS: u64 = 50;
pub const MAX_BACKOFF_BASE_MS: u64 = 10_000;
pub const MAX_BACKOFF_CAP_MS: u64 = 300_000;
pub const MIN_RECONNECT_ATTEMPTS: u32 = 1;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 100;
pub const MIN_LEASE_TTL_MS: u64 = 300;
pub const MAX_LEASE_TTL_MS: u64 = 60_000;
pub const MAX_COMPUTE_WORKERS: usize = 16;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub attempt: u32,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            attempt: 0,
        }
    }
}

/// Status change published by the connection manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FeedStatusUpdate {
    pub state: ConnectionState,
    pub reason: Option<String>,
    pub retry_in_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Neutral,
}

impl Direction {
    pub fn between(previous: Option<f64>, current: f64) -> Self {
        match previous {
            Some(last) if current > last => Self::Up,
            Some(last) if current < last => Self::Down,
            _ => Self::Neutral,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub symbol: String,
    pub price: f64,
    pub change: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    pub timestamp: i64,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum LiquidationSide {
    LongLiquidated,
    ShortLiquidated,
}

impl LiquidationSide {
    /// A forced SELL closes a long position, a forced BUY closes a short.
    pub fn from_order_side(order_side: &str) -> Option<Self> {
        if order_side.eq_ignore_ascii_case("sell") {
            Some(Self::LongLiquidated)
        } else if order_side.eq_ignore_ascii_case("buy") {
            Some(Self::ShortLiquidated)
        } else {
            match order_side.to_ascii_lowercase().as_str() {
                "long" | "long-liquidated" => Some(Self::LongLiquidated),
                "short" | "short-liquidated" => Some(Self::ShortLiquidated),
                _ => None,
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiquidationEvent {
    pub id: String,
    pub symbol: String,
    pub side: LiquidationSide,
    pub price: f64,
    pub qty: f64,
    pub usd_value: f64,
    pub timestamp: i64,
    pub is_major: bool,
    pub is_whale: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FeedEvent {
    Ticker(StreamEvent),
    Liquidation(LiquidationEvent),
}

impl FeedEvent {
    pub fn symbol(&self) -> &str {
        match self {
            Self::Ticker(event) => &event.symbol,
            Self::Liquidation(event) => &event.symbol,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TickRecord {
    pub symbol: String,
    pub price: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UiCandle {
    pub t: i64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

impl UiCandle {
    pub fn from_trade(bucket_open_time: i64, price: f64, quantity: f64) -> Self {
        Self {
            t: bucket_open_time,
            o: price,
            h: price,
            l: price,
            c: price,
            v: quantity,
        }
    }

    pub fn apply_trade(&mut self, price: f64, quantity: f64) {
        self.h = self.h.max(price);
        self.l = self.l.min(price);
        self.c = price;
        self.v += quantity;
    }

    pub fn is_bullish(&self) -> bool {
        self.c >= self.o
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionArgs {
    pub symbols: Option<Vec<String>>,
    pub persisted_symbols: Option<Vec<String>>,
    pub stream_base_url: Option<String>,
    pub include_liquidations: Option<bool>,
    pub frame_interval_ms: Option<u64>,
    pub ring_capacity: Option<usize>,
    pub overflow_threshold: Option<usize>,
    pub tick_retention: Option<u32>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_cap_ms: Option<u64>,
    pub backoff_jitter_ms: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
    pub lease_ttl_ms: Option<u64>,
    pub compute_workers: Option<usize>,
    pub major_liquidation_usd: Option<f64>,
    pub whale_liquidation_usd: Option<f64>,
    pub latest_events_limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub symbols: Vec<String>,
    pub persisted_symbols: Vec<String>,
    pub stream_base_url: String,
    pub include_liquidations: bool,
    pub frame_interval_ms: u64,
    pub ring_capacity: usize,
    pub overflow_threshold: usize,
    pub tick_retention: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub backoff_jitter_ms: u64,
    pub max_reconnect_attempts: u32,
    pub lease_ttl_ms: u64,
    pub compute_workers: usize,
    pub major_liquidation_usd: f64,
    pub whale_liquidation_usd: f64,
    pub latest_events_limit: usize,
}

fn normalize_symbol(raw: &str) -> Result<String, AppError> {
    let symbol = raw.trim().to_ascii_uppercase();
    if symbol.is_empty() || !symbol.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return Err(AppError::InvalidArgument(format!(
            "symbol '{raw}' must be non-empty alphanumeric ASCII"
        )));
    }
    Ok(symbol)
}

fn normalize_symbol_list(raw: Vec<String>) -> Result<Vec<String>, AppError> {
    let mut symbols = Vec::with_capacity(raw.len());
    for entry in raw {
        let symbol = normalize_symbol(&entry)?;
        if !symbols.contains(&symbol) {
            symbols.push(symbol);
        }
    }
    Ok(symbols)
}

fn split_env_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect()
}

impl StartSessionArgs {
    pub fn from_env() -> Self {
        let read = |key: &str| {
            std::env::var(key)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        Self {
            symbols: read("MARKET_PULSE_SYMBOLS").map(|value| split_env_list(&value)),
            persisted_symbols: read("MARKET_PULSE_PERSISTED_SYMBOLS")
                .map(|value| split_env_list(&value)),
            stream_base_url: read("MARKET_PULSE_STREAM_URL"),
            compute_workers: read("MARKET_PULSE_COMPUTE_WORKERS")
                .and_then(|value| value.parse::<usize>().ok()),
            ..Self::default()
        }
    }

    pub fn normalize(self) -> Result<SessionConfig, AppError> {
        let symbols = normalize_symbol_list(
            self.symbols
                .unwrap_or_else(|| DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect()),
        )?;
        if symbols.is_empty() {
            return Err(AppError::InvalidArgument(
                "symbols must contain at least one entry".to_string(),
            ));
        }

        let persisted_symbols = match self.persisted_symbols {
            Some(raw) => normalize_symbol_list(raw)?,
            None => DEFAULT_PERSISTED_SYMBOLS
                .iter()
                .map(|s| s.to_string())
                .filter(|symbol| symbols.contains(symbol))
                .collect(),
        };
        if let Some(unknown) = persisted_symbols
            .iter()
            .find(|symbol| !symbols.contains(symbol))
        {
            return Err(AppError::InvalidArgument(format!(
                "persisted symbol {unknown} is not a tracked symbol"
            )));
        }

        let stream_base_url = self
            .stream_base_url
            .unwrap_or_else(|| DEFAULT_STREAM_BASE_URL.to_string())
            .trim()
            .trim_end_matches('/')
            .to_string();
        if !(stream_base_url.starts_with("ws://") || stream_base_url.starts_with("wss://")) {
            return Err(AppError::InvalidArgument(
                "streamBaseUrl must use ws:// or wss://".to_string(),
            ));
        }

        let include_liquidations = self
            .include_liquidations
            .unwrap_or(DEFAULT_INCLUDE_LIQUIDATIONS);

        let frame_interval_ms = self.frame_interval_ms.unwrap_or(DEFAULT_FRAME_INTERVAL_MS);
        if !(MIN_FRAME_INTERVAL_MS..=MAX_FRAME_INTERVAL_MS).contains(&frame_interval_ms) {
            return Err(AppError::InvalidArgument(format!(
                "frameIntervalMs must be between {MIN_FRAME_INTERVAL_MS} \
                 and {MAX_FRAME_INTERVAL_MS}"
            )));
        }

        let ring_capacity = self.ring_capacity.unwrap_or(DEFAULT_RING_CAPACITY);
        if !(MIN_RING_CAPACITY..=MAX_RING_CAPACITY).contains(&ring_capacity) {
            return Err(AppError::InvalidArgument(format!(
                "ringCapacity must be between {MIN_RING_CAPACITY} and {MAX_RING_CAPACITY}"
            )));
        }

        let overflow_threshold = self
            .overflow_threshold
            .unwrap_or(DEFAULT_OVERFLOW_THRESHOLD);
        if overflow_threshold > ring_capacity {
            return Err(AppError::InvalidArgument(
                "overflowThreshold must not exceed ringCapacity".to_string(),
            ));
        }

        let tick_retention = self.tick_retention.unwrap_or(DEFAULT_TICK_RETENTION);
        if !(MIN_TICK_RETENTION..=MAX_TICK_RETENTION).contains(&tick_retention) {
            return Err(AppError::InvalidArgument(format!(
                "tickRetention must be between {MIN_TICK_RETENTION} and {MAX_TICK_RETENTION}"
            )));
        }

        let backoff_base_ms = self.backoff_base_ms.unwrap_or(DEFAULT_BACKOFF_BASE_MS);
        if !(MIN_BACKOFF_BASE_MS..=MAX_BACKOFF_BASE_MS).contains(&backoff_base_ms) {
            return Err(AppError::InvalidArgument(format!(
                "backoffBaseMs must be between {MIN_BACKOFF_BASE_MS} and {MAX_BACKOFF_BASE_MS}"
            )));
        }
        let backoff_cap_ms = self.backoff_cap_ms.unwrap_or(DEFAULT_BACKOFF_CAP_MS);
        if !(backoff_base_ms..=MAX_BACKOFF_CAP_MS).contains(&backoff_cap_ms) {
            return Err(AppError::InvalidArgument(format!(
                "backoffCapMs must be between backoffBaseMs and {MAX_BACKOFF_CAP_MS}"
            )));
        }
        // Jitter above the base would let attempt k+1 fire before attempt k.
        let backoff_jitter_ms = self
            .backoff_jitter_ms
            .unwrap_or(DEFAULT_BACKOFF_JITTER_MS.min(backoff_base_ms));
        if backoff_jitter_ms > backoff_base_ms {
            return Err(AppError::InvalidArgument(
                "backoffJitterMs must not exceed backoffBaseMs".to_string(),
            ));
        }

        let max_reconnect_attempts = self
            .max_reconnect_attempts
            .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS);
        if !(MIN_RECONNECT_ATTEMPTS..=MAX_RECONNECT_ATTEMPTS).contains(&max_reconnect_attempts) {
            return Err(AppError::InvalidArgument(format!(
                "maxReconnectAttempts must be between {MIN_RECONNECT_ATTEMPTS} \
                 and {MAX_RECONNECT_ATTEMPTS}"
            )));
        }

        let lease_ttl_ms = self.lease_ttl_ms.unwrap_or(DEFAULT_LEASE_TTL_MS);
        if !(MIN_LEASE_TTL_MS..=MAX_LEASE_TTL_MS).contains(&lease_ttl_ms) {
            return Err(AppError::InvalidArgument(format!(
                "leaseTtlMs must be between {MIN_LEASE_TTL_MS} and {MAX_LEASE_TTL_MS}"
            )));
        }

        let compute_workers = self.compute_workers.unwrap_or(DEFAULT_COMPUTE_WORKERS);
        if compute_workers > MAX_COMPUTE_WORKERS {
            return Err(AppError::InvalidArgument(format!(
                "computeWorkers must be at most {MAX_COMPUTE_WORKERS}"
            )));
        }

        let major_liquidation_usd = self
            .major_liquidation_usd
            .unwrap_or(DEFAULT_MAJOR_LIQUIDATION_USD);
        if !major_liquidation_usd.is_finite() || major_liquidation_usd <= 0.0 {
            return Err(AppError::InvalidArgument(
                "majorLiquidationUsd must be a finite positive number".to_string(),
            ));
        }
        let whale_liquidation_usd = self
            .whale_liquidation_usd
            .unwrap_or(DEFAULT_WHALE_LIQUIDATION_USD.max(major_liquidation_usd));
        if !whale_liquidation_usd.is_finite() || whale_liquidation_usd < major_liquidation_usd {
            return Err(AppError::InvalidArgument(
                "whaleLiquidationUsd must be finite and at least majorLiquidationUsd".to_string(),
            ));
        }

        let latest_events_limit = self
            .latest_events_limit
            .unwrap_or(DEFAULT_LATEST_EVENTS_LIMIT.min(ring_capacity));
        if latest_events_limit == 0 || latest_events_limit > ring_capacity {
            return Err(AppError::InvalidArgument(
                "latestEventsLimit must be between 1 and ringCapacity".to_string(),
            ));
        }

        Ok(SessionConfig {
            symbols,
            persisted_symbols,
            stream_base_url,
            include_liquidations,
            frame_interval_ms,
            ring_capacity,
            overflow_threshold,
            tick_retention,
            backoff_base_ms,
            backoff_cap_ms,
            backoff_jitter_ms,
            max_reconnect_attempts,
            lease_ttl_ms,
            compute_workers,
            major_liquidation_usd,
            whale_liquidation_usd,
            latest_events_limit,
        })
    }
}

impl SessionConfig {
    pub fn is_persisted(&self, symbol: &str) -> bool {
        self.persisted_symbols.iter().any(|entry| entry == symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_direction_from_previous_price() {
        assert_eq!(Direction::between(Some(49_000.0), 50_000.0), Direction::Up);
        assert_eq!(Direction::between(Some(50_000.0), 49_000.0), Direction::Down);
        assert_eq!(
            Direction::between(Some(50_000.0), 50_000.0),
            Direction::Neutral
        );
        assert_eq!(Direction::between(None, 50_000.0), Direction::Neutral);
    }

    #[test]
    fn maps_forced_order_side_to_liquidated_position() {
        assert_eq!(
            LiquidationSide::from_order_side("SELL"),
            Some(LiquidationSide::LongLiquidated)
        );
        assert_eq!(
            LiquidationSide::from_order_side("buy"),
            Some(LiquidationSide::ShortLiquidated)
        );
        assert_eq!(
            LiquidationSide::from_order_side("short"),
            Some(LiquidationSide::ShortLiquidated)
        );
        assert_eq!(LiquidationSide::from_order_side("hold"), None);
    }

    #[test]
    fn normalizes_start_args_defaults() {
        let config = StartSessionArgs::default()
            .normalize()
            .expect("defaults should be valid");

        assert_eq!(config.symbols, DEFAULT_SYMBOLS.to_vec());
        assert_eq!(config.persisted_symbols, DEFAULT_PERSISTED_SYMBOLS.to_vec());
        assert_eq!(config.stream_base_url, DEFAULT_STREAM_BASE_URL);
        assert_eq!(config.frame_interval_ms, DEFAULT_FRAME_INTERVAL_MS);
        assert_eq!(config.ring_capacity, DEFAULT_RING_CAPACITY);
        assert_eq!(config.overflow_threshold, DEFAULT_OVERFLOW_THRESHOLD);
        assert_eq!(config.tick_retention, DEFAULT_TICK_RETENTION);
        assert_eq!(config.backoff_jitter_ms, DEFAULT_BACKOFF_JITTER_MS);
        assert_eq!(config.compute_workers, DEFAULT_COMPUTE_WORKERS);
        assert_eq!(config.latest_events_limit, DEFAULT_LATEST_EVENTS_LIMIT);
        assert!(config.is_persisted("BTCUSDT"));
        assert!(!config.is_persisted("SOLUSDT"));
    }

    #[test]
    fn uppercases_and_deduplicates_symbols() {
        let config = StartSessionArgs {
            symbols: Some(vec![
                " btcusdt".to_string(),
                "BTCUSDT".to_string(),
                "ethusdt".to_string(),
            ]),
            persisted_symbols: Some(vec!["ethusdt".to_string()]),
            ..StartSessionArgs::default()
        }
        .normalize()
        .expect("symbols should normalize");

        assert_eq!(config.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(config.persisted_symbols, vec!["ETHUSDT"]);
    }

    #[test]
    fn rejects_persisted_symbol_outside_tracked_set() {
        let result = StartSessionArgs {
            symbols: Some(vec!["BTCUSDT".to_string()]),
            persisted_symbols: Some(vec!["DOGEUSDT".to_string()]),
            ..StartSessionArgs::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn rejects_jitter_larger_than_base_delay() {
        let result = StartSessionArgs {
            backoff_base_ms: Some(100),
            backoff_jitter_ms: Some(150),
            ..StartSessionArgs::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn validates_frame_interval_range() {
        let result = StartSessionArgs {
            frame_interval_ms: Some(1),
            ..StartSessionArgs::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn rejects_non_websocket_stream_url() {
        let result = StartSessionArgs {
            stream_base_url: Some("https://fstream.binance.com/stream".to_string()),
            ..StartSessionArgs::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn extends_candle_with_trade() {
        let mut candle = UiCandle::from_trade(60_000, 100.0, 0.5);
        candle.apply_trade(98.0, 0.25);
        candle.apply_trade(101.0, 0.25);

        assert_eq!(candle.h, 101.0);
        assert_eq!(candle.l, 98.0);
        assert_eq!(candle.c, 101.0);
        assert!((candle.v - 1.0).abs() < 1e-9);
        assert!(candle.is_bullish());
    }
}
