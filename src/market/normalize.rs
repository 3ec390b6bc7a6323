//! Wire payloads → canonical [`FeedEvent`]s.
//!
//! Frames arrive as a bare object, an array of objects, a `{type, payload}`
//! envelope or a combined-stream `{stream, data}` envelope, nested in any
//! combination. Every item is decoded on its own so one bad entry never
//! takes the rest of the frame down with it.

use crate::error::AppError;
use crate::market::types::{
    Direction, FeedEvent, LiquidationEvent, LiquidationSide, StreamEvent,
};
use serde::Deserialize;
use std::collections::HashMap;

const MAX_ENVELOPE_DEPTH: usize = 4;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NumberLike {
    Text(String),
    Number(f64),
}

impl NumberLike {
    fn value(&self) -> Result<f64, AppError> {
        let parsed = match self {
            Self::Text(text) => text.trim().parse::<f64>()?,
            Self::Number(number) => *number,
        };
        if !parsed.is_finite() {
            return Err(AppError::MalformedMessage(
                "numeric field must be finite".to_string(),
            ));
        }
        Ok(parsed)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawFrame {
    Batch(Vec<RawFrame>),
    Envelope {
        #[serde(rename = "type")]
        kind: String,
        payload: Box<RawFrame>,
    },
    Combined {
        stream: String,
        data: Box<RawFrame>,
    },
    Item(WireItem),
    Unrecognized(simd_json::OwnedValue),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireItem {
    ForceOrder(ForceOrderWire),
    Ticker(TickerWire),
    Liquidation(GenericLiquidationWire),
    Quote(GenericQuoteWire),
}

#[derive(Debug, Deserialize)]
struct ForceOrderWire {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "o")]
    order: ForceOrderInnerWire,
}

#[derive(Debug, Deserialize)]
struct ForceOrderInnerWire {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "q")]
    quantity: NumberLike,
    #[serde(rename = "z", default)]
    filled_quantity: Option<NumberLike>,
    #[serde(rename = "p")]
    price: NumberLike,
    #[serde(rename = "ap", default)]
    average_price: Option<NumberLike>,
    #[serde(rename = "T", default)]
    trade_time: Option<i64>,
}

/// Both `24hrTicker` and `24hrMiniTicker` shapes; the mini variant has no
/// explicit change field and is derived from the open.
#[derive(Debug, Deserialize)]
struct TickerWire {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    close: NumberLike,
    #[serde(rename = "p", default)]
    change: Option<NumberLike>,
    #[serde(rename = "o", default)]
    open: Option<NumberLike>,
    #[serde(rename = "h")]
    high: NumberLike,
    #[serde(rename = "l")]
    low: NumberLike,
    #[serde(rename = "v")]
    volume: NumberLike,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenericLiquidationWire {
    symbol: String,
    side: String,
    price: NumberLike,
    #[serde(alias = "quantity")]
    qty: NumberLike,
    #[serde(default)]
    usd_value: Option<NumberLike>,
    #[serde(default)]
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenericQuoteWire {
    symbol: String,
    price: NumberLike,
    #[serde(default)]
    change: Option<NumberLike>,
    #[serde(default)]
    high: Option<NumberLike>,
    #[serde(default)]
    low: Option<NumberLike>,
    #[serde(default)]
    volume: Option<NumberLike>,
    #[serde(default)]
    timestamp: Option<i64>,
}

#[derive(Debug, Default, PartialEq)]
pub struct NormalizedFrame {
    pub events: Vec<FeedEvent>,
    pub dropped: Vec<String>,
}

/// Stateful normalizer: owns the per-symbol last-price memory used to derive
/// tick direction and the sequence counter behind liquidation ids.
#[derive(Debug)]
pub struct FeedNormalizer {
    last_prices: HashMap<String, f64>,
    sequence: u64,
    major_liquidation_usd: f64,
    whale_liquidation_usd: f64,
}

impl FeedNormalizer {
    pub fn new(major_liquidation_usd: f64, whale_liquidation_usd: f64) -> Self {
        Self {
            last_prices: HashMap::new(),
            sequence: 0,
            major_liquidation_usd,
            whale_liquidation_usd,
        }
    }

    /// Seeds the direction baseline, typically from the tick cache at cold start.
    pub fn seed_price(&mut self, symbol: &str, price: f64) {
        if price.is_finite() {
            self.last_prices.insert(symbol.to_ascii_uppercase(), price);
        }
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.last_prices.get(symbol).copied()
    }

    pub fn normalize_frame(
        &mut self,
        payload: &mut [u8],
        received_at_ms: i64,
    ) -> Result<NormalizedFrame, AppError> {
        let frame: RawFrame = simd_json::serde::from_slice(payload)?;
        let mut normalized = NormalizedFrame::default();
        self.collect(frame, 0, received_at_ms, &mut normalized);
        Ok(normalized)
    }

    fn collect(
        &mut self,
        frame: RawFrame,
        depth: usize,
        received_at_ms: i64,
        out: &mut NormalizedFrame,
    ) {
        if depth > MAX_ENVELOPE_DEPTH {
            out.dropped
                .push(format!("envelope nesting deeper than {MAX_ENVELOPE_DEPTH}"));
            return;
        }

        match frame {
            RawFrame::Batch(items) => {
                for item in items {
                    self.collect(item, depth + 1, received_at_ms, out);
                }
            }
            RawFrame::Envelope { kind, payload } => {
                tracing::trace!(%kind, "unwrapping typed envelope");
                self.collect(*payload, depth + 1, received_at_ms, out);
            }
            RawFrame::Combined { stream, data } => {
                tracing::trace!(%stream, "unwrapping combined stream envelope");
                self.collect(*data, depth + 1, received_at_ms, out);
            }
            RawFrame::Item(item) => match self.normalize_item(item, received_at_ms) {
                Ok(event) => out.events.push(event),
                Err(error) => out.dropped.push(error.to_string()),
            },
            RawFrame::Unrecognized(value) => {
                out.dropped.push(format!("unrecognized payload shape: {value:?}"));
            }
        }
    }

    fn normalize_item(
        &mut self,
        item: WireItem,
        received_at_ms: i64,
    ) -> Result<FeedEvent, AppError> {
        match item {
            WireItem::ForceOrder(wire) => {
                let order = wire.order;
                let price = match order.average_price.as_ref().map(NumberLike::value) {
                    Some(Ok(average)) if average > 0.0 => average,
                    _ => order.price.value()?,
                };
                let qty = match order.filled_quantity.as_ref().map(NumberLike::value) {
                    Some(Ok(filled)) if filled > 0.0 => filled,
                    _ => order.quantity.value()?,
                };
                let timestamp = order.trade_time.unwrap_or(wire.event_time);
                self.build_liquidation(&order.symbol, &order.side, price, qty, None, timestamp)
            }
            WireItem::Ticker(wire) => {
                if !wire.event_type.contains("Ticker") {
                    return Err(AppError::MalformedMessage(format!(
                        "unexpected event type '{}' for ticker stream",
                        wire.event_type
                    )));
                }
                let price = wire.close.value()?;
                let change = match (&wire.change, &wire.open) {
                    (Some(change), _) => change.value()?,
                    (None, Some(open)) => price - open.value()?,
                    (None, None) => 0.0,
                };
                self.build_ticker(
                    &wire.symbol,
                    price,
                    change,
                    wire.high.value()?,
                    wire.low.value()?,
                    wire.volume.value()?,
                    wire.event_time,
                )
            }
            WireItem::Liquidation(wire) => {
                let usd_value = wire.usd_value.as_ref().map(NumberLike::value).transpose()?;
                self.build_liquidation(
                    &wire.symbol,
                    &wire.side,
                    wire.price.value()?,
                    wire.qty.value()?,
                    usd_value,
                    wire.timestamp.unwrap_or(received_at_ms),
                )
            }
            WireItem::Quote(wire) => {
                let price = wire.price.value()?;
                let optional = |field: &Option<NumberLike>, fallback: f64| {
                    field
                        .as_ref()
                        .map(NumberLike::value)
                        .transpose()
                        .map(|value| value.unwrap_or(fallback))
                };
                self.build_ticker(
                    &wire.symbol,
                    price,
                    optional(&wire.change, 0.0)?,
                    optional(&wire.high, price)?,
                    optional(&wire.low, price)?,
                    optional(&wire.volume, 0.0)?,
                    wire.timestamp.unwrap_or(received_at_ms),
                )
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_ticker(
        &mut self,
        symbol: &str,
        price: f64,
        change: f64,
        high: f64,
        low: f64,
        volume: f64,
        timestamp: i64,
    ) -> Result<FeedEvent, AppError> {
        let symbol = validated_symbol(symbol)?;
        if price <= 0.0 || volume < 0.0 {
            return Err(AppError::MalformedMessage(format!(
                "ticker for {symbol} has non-positive price or negative volume"
            )));
        }

        let previous = self.last_prices.insert(symbol.clone(), price);
        Ok(FeedEvent::Ticker(StreamEvent {
            direction: Direction::between(previous, price),
            symbol,
            price,
            change,
            high,
            low,
            volume,
            timestamp,
        }))
    }

    fn build_liquidation(
        &mut self,
        symbol: &str,
        side: &str,
        price: f64,
        qty: f64,
        usd_value: Option<f64>,
        timestamp: i64,
    ) -> Result<FeedEvent, AppError> {
        let symbol = validated_symbol(symbol)?;
        let side = LiquidationSide::from_order_side(side).ok_or_else(|| {
            AppError::MalformedMessage(format!("unknown liquidation side '{side}'"))
        })?;
        if price <= 0.0 || qty < 0.0 {
            return Err(AppError::MalformedMessage(format!(
                "liquidation for {symbol} has non-positive price or negative quantity"
            )));
        }

        let usd_value = usd_value.unwrap_or(price * qty).max(0.0);
        self.sequence = self.sequence.wrapping_add(1);
        Ok(FeedEvent::Liquidation(LiquidationEvent {
            id: format!("{symbol}-{timestamp}-{}", self.sequence),
            symbol,
            side,
            price,
            qty,
            usd_value,
            timestamp,
            is_major: usd_value >= self.major_liquidation_usd,
            is_whale: usd_value >= self.whale_liquidation_usd,
        }))
    }
}

fn validated_symbol(raw: &str) -> Result<String, AppError> {
    let symbol = raw.trim().to_ascii_uppercase();
    if symbol.is_empty() || !symbol.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return Err(AppError::MalformedMessage(format!(
            "symbol '{raw}' must be non-empty alphanumeric ASCII"
        )));
    }
    Ok(symbol)
}
