use crate::error::AppError;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

const FORCE_ORDER_STREAM: &str = "!forceOrder@arr";

pub type FeedWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn ticker_stream_name(symbol: &str) -> String {
    format!("{}@ticker", symbol.to_ascii_lowercase())
}

/// Combined-stream URL carrying every tracked ticker plus, optionally, the
/// aggregated forced-liquidation stream.
pub fn combined_stream_endpoint(
    base_url: &str,
    symbols: &[String],
    include_liquidations: bool,
) -> String {
    let mut streams: Vec<String> = symbols
        .iter()
        .map(|symbol| ticker_stream_name(symbol))
        .collect();
    if include_liquidations {
        streams.push(FORCE_ORDER_STREAM.to_string());
    }
    format!(
        "{}?streams={}",
        base_url.trim_end_matches('/'),
        streams.join("/")
    )
}

pub async fn connect_feed_stream(endpoint: &str) -> Result<FeedWsStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(64 << 20),
        max_frame_size: Some(16 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(endpoint, Some(ws_config), true).await?;
    Ok(stream)
}
