//! Feed connection lifecycle.
//!
//! Transition table driven by [`next_status`]:
//!
//! | from          | event            | to            |
//! |---------------|------------------|---------------|
//! | disconnected  | Connect          | connecting    |
//! | connecting    | Opened           | connected     |
//! | connecting    | Dropped          | reconnecting  |
//! | connected     | Dropped          | reconnecting  |
//! | reconnecting  | RetryDue         | connecting    |
//! | reconnecting  | RetriesExhausted | disconnected  |
//! | any           | Disconnect       | disconnected  |

use crate::error::AppError;
use crate::market::binance::{combined_stream_endpoint, connect_feed_stream, FeedWsStream};
use crate::market::leader::LeaderElection;
use crate::market::normalize::FeedNormalizer;
use crate::market::persistence::now_unix_ms;
use crate::market::types::{
    ConnectionState, ConnectionStatus, FeedEvent, FeedStatusUpdate, SessionConfig,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const STATUS_THROTTLE_MS: u64 = 500;
const MAX_BACKOFF_EXPONENT: u32 = 32;

pub type EventCallback = Arc<dyn Fn(FeedEvent) + Send + Sync>;
pub type StatusCallback = Arc<dyn Fn(FeedStatusUpdate) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    Opened,
    Dropped,
    RetryDue,
    RetriesExhausted,
    Disconnect,
}

/// `None` marks an event that is not valid in the current status.
pub fn next_status(status: ConnectionStatus, event: ConnectionEvent) -> Option<ConnectionStatus> {
    use ConnectionEvent as Event;
    use ConnectionStatus as Status;

    match (status, event) {
        (_, Event::Disconnect) => Some(Status::Disconnected),
        (Status::Disconnected, Event::Connect) => Some(Status::Connecting),
        (Status::Connecting, Event::Opened) => Some(Status::Connected),
        (Status::Connecting | Status::Connected, Event::Dropped) => Some(Status::Reconnecting),
        (Status::Reconnecting, Event::RetryDue) => Some(Status::Connecting),
        (Status::Reconnecting, Event::RetriesExhausted) => Some(Status::Disconnected),
        _ => None,
    }
}

/// Capped exponential backoff: `min(base * 2^attempt + jitter, cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub jitter_ms: u64,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            base_ms: config.backoff_base_ms,
            cap_ms: config.backoff_cap_ms,
            jitter_ms: config.backoff_jitter_ms,
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// Deterministic form of [`Self::delay`]; `jitter_ms` is clamped to the
    /// policy's jitter bound.
    pub fn delay_with_jitter(&self, attempt: u32, jitter_ms: u64) -> Duration {
        let exponent = attempt.min(MAX_BACKOFF_EXPONENT);
        let scaled_ms = self.base_ms.saturating_mul(1_u64 << exponent);
        let jittered_ms = scaled_ms.saturating_add(jitter_ms.min(self.jitter_ms));
        Duration::from_millis(jittered_ms.min(self.cap_ms))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = if self.jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=self.jitter_ms)
        };
        self.delay_with_jitter(attempt, jitter_ms)
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// Decides whether normalized events may leave the manager.
pub trait LeaderGate: Send + Sync {
    fn is_leader(&self) -> bool;
}

impl LeaderGate for LeaderElection {
    fn is_leader(&self) -> bool {
        LeaderElection::is_leader(self)
    }
}

#[derive(Debug, Default)]
struct StatusPublishThrottle {
    last_update: Option<FeedStatusUpdate>,
    last_emit: Option<Instant>,
}

impl StatusPublishThrottle {
    /// Repeats of the same reconnecting update inside the window are muted.
    fn allow(&mut self, update: &FeedStatusUpdate, now: Instant) -> bool {
        let repeated = update.state.status == ConnectionStatus::Reconnecting
            && self.last_update.as_ref().is_some_and(|last| {
                last.state == update.state && last.reason == update.reason
            })
            && self.last_emit.is_some_and(|instant| {
                now.duration_since(instant) < Duration::from_millis(STATUS_THROTTLE_MS)
            });
        if repeated {
            return false;
        }

        self.last_update = Some(update.clone());
        self.last_emit = Some(now);
        true
    }
}

/// Everything the spawned feed task shares with its manager.
#[derive(Clone)]
struct FeedLink {
    endpoint: String,
    backoff: BackoffPolicy,
    gate: Arc<dyn LeaderGate>,
    normalizer: Arc<Mutex<FeedNormalizer>>,
    state: Arc<Mutex<ConnectionState>>,
    throttle: Arc<Mutex<StatusPublishThrottle>>,
    on_event: Option<EventCallback>,
    on_status: Option<StatusCallback>,
}

impl FeedLink {
    fn transition(
        &self,
        event: ConnectionEvent,
        attempt: u32,
        reason: Option<String>,
        retry_in: Option<Duration>,
    ) {
        let state = {
            let mut writable = self.state.lock();
            let Some(status) = next_status(writable.status, event) else {
                tracing::debug!(
                    status = writable.status.as_str(),
                    ?event,
                    "ignoring connection event not valid in current status"
                );
                return;
            };
            let attempt = if status == ConnectionStatus::Connected {
                0
            } else {
                attempt
            };
            *writable = ConnectionState { status, attempt };
            *writable
        };

        let update = FeedStatusUpdate {
            state,
            reason,
            retry_in_ms: retry_in.map(|delay| delay.as_millis().min(u64::MAX as u128) as u64),
        };
        tracing::info!(
            status = state.status.as_str(),
            attempt = state.attempt,
            reason = update.reason.as_deref().unwrap_or(""),
            retry_in_ms = update.retry_in_ms,
            "feed connection status"
        );

        if !self.throttle.lock().allow(&update, Instant::now()) {
            return;
        }
        if let Some(on_status) = &self.on_status {
            on_status(update);
        }
    }

    fn handle_payload(&self, mut payload: Vec<u8>) {
        let normalized = self
            .normalizer
            .lock()
            .normalize_frame(payload.as_mut_slice(), now_unix_ms());

        let frame = match normalized {
            Ok(frame) => frame,
            Err(error) => {
                tracing::warn!(%error, "dropped undecodable feed frame");
                return;
            }
        };
        for reason in &frame.dropped {
            tracing::warn!(%reason, "dropped malformed feed item");
        }

        if !self.gate.is_leader() {
            tracing::trace!(
                events = frame.events.len(),
                "not leader, withholding normalized events"
            );
            return;
        }
        if let Some(on_event) = &self.on_event {
            for event in frame.events {
                on_event(event);
            }
        }
    }
}

enum StreamExit {
    Cancelled,
    Dropped(String),
}

async fn pump_stream(
    link: &FeedLink,
    websocket_stream: &mut FeedWsStream,
    cancel_token: &CancellationToken,
) -> StreamExit {
    loop {
        let frame = tokio::select! {
            _ = cancel_token.cancelled() => {
                let _ = websocket_stream.close(None).await;
                return StreamExit::Cancelled;
            }
            next_message = websocket_stream.next() => next_message,
        };

        let Some(frame_result) = frame else {
            return StreamExit::Dropped("websocket stream ended".to_string());
        };

        match frame_result {
            Ok(Message::Text(text_payload)) => link.handle_payload(text_payload.into_bytes()),
            Ok(Message::Binary(binary_payload)) => link.handle_payload(binary_payload),
            Ok(Message::Ping(payload)) => {
                if let Err(error) = websocket_stream.send(Message::Pong(payload)).await {
                    return StreamExit::Dropped(format!("failed to answer ping: {error}"));
                }
            }
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|close| format!("server closed stream: {}", close.reason))
                    .unwrap_or_else(|| "server closed stream".to_string());
                return StreamExit::Dropped(reason);
            }
            Ok(_) => {}
            Err(error) => return StreamExit::Dropped(format!("websocket frame error: {error}")),
        }
    }
}

async fn run_feed_loop(link: FeedLink, cancel_token: CancellationToken) {
    let mut attempt = 0_u32;
    link.transition(
        ConnectionEvent::Connect,
        attempt,
        Some("opening websocket stream".to_string()),
        None,
    );

    loop {
        let connected = tokio::select! {
            _ = cancel_token.cancelled() => break,
            result = connect_feed_stream(&link.endpoint) => result,
        };

        let reason = match connected {
            Ok(mut websocket_stream) => {
                attempt = 0;
                link.transition(
                    ConnectionEvent::Opened,
                    attempt,
                    Some("websocket connected".to_string()),
                    None,
                );
                match pump_stream(&link, &mut websocket_stream, &cancel_token).await {
                    StreamExit::Cancelled => break,
                    StreamExit::Dropped(reason) => reason,
                }
            }
            Err(error) => format!("websocket connect error: {error}"),
        };

        if link.backoff.is_exhausted(attempt) {
            let exhausted = AppError::ExhaustedRetries { attempts: attempt };
            tracing::warn!(%exhausted, last_error = %reason, "giving up on feed connection");
            link.transition(ConnectionEvent::Dropped, attempt, Some(reason), None);
            link.transition(
                ConnectionEvent::RetriesExhausted,
                attempt,
                Some(exhausted.to_string()),
                None,
            );
            return;
        }

        let delay = link.backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        link.transition(ConnectionEvent::Dropped, attempt, Some(reason), Some(delay));

        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        link.transition(
            ConnectionEvent::RetryDue,
            attempt,
            Some(format!("reconnect attempt {attempt}")),
            None,
        );
    }

    tracing::debug!("feed loop cancelled");
}

struct RunningFeed {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns one logical feed connection for a tracked symbol set.
pub struct StreamConnectionManager {
    endpoint: String,
    backoff: BackoffPolicy,
    gate: Arc<dyn LeaderGate>,
    normalizer: Arc<Mutex<FeedNormalizer>>,
    state: Arc<Mutex<ConnectionState>>,
    throttle: Arc<Mutex<StatusPublishThrottle>>,
    on_event: Option<EventCallback>,
    on_status: Option<StatusCallback>,
    parent_token: CancellationToken,
    running: Option<RunningFeed>,
}

impl StreamConnectionManager {
    pub fn new(config: &SessionConfig, gate: Arc<dyn LeaderGate>) -> Self {
        Self {
            endpoint: combined_stream_endpoint(
                &config.stream_base_url,
                &config.symbols,
                config.include_liquidations,
            ),
            backoff: BackoffPolicy::from_config(config),
            gate,
            normalizer: Arc::new(Mutex::new(FeedNormalizer::new(
                config.major_liquidation_usd,
                config.whale_liquidation_usd,
            ))),
            state: Arc::new(Mutex::new(ConnectionState::default())),
            throttle: Arc::new(Mutex::new(StatusPublishThrottle::default())),
            on_event: None,
            on_status: None,
            parent_token: CancellationToken::new(),
            running: None,
        }
    }

    /// Binds the feed task to an outer token so session teardown reaches it.
    pub fn with_parent_token(mut self, parent_token: CancellationToken) -> Self {
        self.parent_token = parent_token;
        self
    }

    /// Takes effect on the next `connect()`.
    pub fn on_event(&mut self, callback: EventCallback) {
        self.on_event = Some(callback);
    }

    /// Takes effect on the next `connect()`.
    pub fn on_status(&mut self, callback: StatusCallback) {
        self.on_status = Some(callback);
    }

    pub fn seed_prices<I>(&self, prices: I)
    where
        I: IntoIterator<Item = (String, f64)>,
    {
        let mut normalizer = self.normalizer.lock();
        for (symbol, price) in prices {
            normalizer.seed_price(&symbol, price);
        }
    }

    /// Price memory behind `direction`. Holders may seed it while the feed is
    /// owned by another session.
    pub fn normalizer(&self) -> Arc<Mutex<FeedNormalizer>> {
        Arc::clone(&self.normalizer)
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.normalizer.lock().last_price(symbol)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Starts the feed task. A no-op while one is already live; restarts a
    /// task that stopped after exhausting its retries.
    pub async fn connect(&mut self) {
        if self.is_running() {
            return;
        }
        if let Some(finished) = self.running.take() {
            let _ = finished.handle.await;
        }

        let link = FeedLink {
            endpoint: self.endpoint.clone(),
            backoff: self.backoff,
            gate: Arc::clone(&self.gate),
            normalizer: Arc::clone(&self.normalizer),
            state: Arc::clone(&self.state),
            throttle: Arc::clone(&self.throttle),
            on_event: self.on_event.clone(),
            on_status: self.on_status.clone(),
        };
        let cancel_token = self.parent_token.child_token();
        let handle = tokio::spawn(run_feed_loop(link, cancel_token.clone()));

        self.running = Some(RunningFeed {
            cancel_token,
            handle,
        });
    }

    /// Cancels the socket and any pending retry timer, then forces
    /// `disconnected`. No reconnection follows until the next `connect()`.
    pub async fn disconnect(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel_token.cancel();
            if let Err(error) = running.handle.await {
                tracing::warn!(%error, "feed task ended abnormally");
            }
        }

        if self.state().status == ConnectionStatus::Disconnected {
            return;
        }
        let update = {
            let mut writable = self.state.lock();
            *writable = ConnectionState::default();
            FeedStatusUpdate {
                state: *writable,
                reason: Some("disconnected by request".to_string()),
                retry_in_ms: None,
            }
        };
        tracing::info!(status = update.state.status.as_str(), "feed connection status");
        if let Some(on_status) = &self.on_status {
            on_status(update);
        }
    }
}
