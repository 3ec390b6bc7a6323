//! Session orchestration: one [`MarketSession`] per consumer.
//!
//! Every session campaigns for the feed lease. The leader opens the socket,
//! batches normalized events per frame, writes the tick cache and broadcasts
//! each flushed batch through the [`SessionHub`]; followers never connect and
//! mirror those broadcasts into their own view instead.

use crate::error::AppError;
use crate::market::buffer::{run_frame_loop, EventRingBuffer, FrameBatcher};
use crate::market::connection::{LeaderGate, StreamConnectionManager};
use crate::market::leader::{run_election_loop, LeaderElection, SessionBroadcast, SessionHub};
use crate::market::normalize::FeedNormalizer;
use crate::market::persistence::{now_unix_ms, TickCache};
use crate::market::stats::{aggregate_liquidations, LiquidationStats};
use crate::market::types::{
    ConnectionState, Direction, FeedEvent, LiquidationEvent, SessionConfig, StreamEvent,
    TickRecord, UiCandle,
};
use crate::workers::compute::{
    BackgroundCompute, ComputeOp, ComputeResult, ComputeStrategy, RecordFilter, SortSpec,
};
use crate::workers::render::{
    ChartMode, Crosshair, DrawCommand, RenderOutcome, RenderWorker, Surface, Viewport,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CANDLE_TIMEFRAME_MS: i64 = 60_000;
const MAX_CANDLES_PER_SYMBOL: usize = 240;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_session_id() -> String {
    format!(
        "session-{}-{}-{}",
        std::process::id(),
        SESSION_COUNTER.fetch_add(1, Ordering::Relaxed),
        now_unix_ms()
    )
}

fn candle_bucket_open_time(timestamp_ms: i64, timeframe_ms: i64) -> i64 {
    if timeframe_ms <= 0 {
        return timestamp_ms;
    }
    timestamp_ms - timestamp_ms.rem_euclid(timeframe_ms)
}

/// One-minute candles built from ticker updates. Volume per candle is the
/// growth of the rolling 24h volume between consecutive tickers.
#[derive(Debug, Default)]
struct CandleSeries {
    candles: VecDeque<UiCandle>,
    last_rolling_volume: Option<f64>,
}

impl CandleSeries {
    fn apply_tick(&mut self, tick: &StreamEvent) {
        let traded = match self.last_rolling_volume {
            Some(previous) if tick.volume >= previous => tick.volume - previous,
            _ => 0.0,
        };
        self.last_rolling_volume = Some(tick.volume);

        let bucket_open = candle_bucket_open_time(tick.timestamp, CANDLE_TIMEFRAME_MS);
        match self.candles.back_mut() {
            Some(current) if bucket_open < current.t => (),
            Some(current) if bucket_open == current.t => current.apply_trade(tick.price, traded),
            _ => {
                self.candles
                    .push_back(UiCandle::from_trade(bucket_open, tick.price, traded));
                if self.candles.len() > MAX_CANDLES_PER_SYMBOL {
                    self.candles.pop_front();
                }
            }
        }
    }
}

/// Read model shared by leader and follower paths.
#[derive(Debug)]
struct SessionView {
    connection: ConnectionState,
    liquidations: EventRingBuffer<LiquidationEvent>,
    stats: LiquidationStats,
    prices: BTreeMap<String, StreamEvent>,
    candles: HashMap<String, CandleSeries>,
}

impl SessionView {
    fn new(config: &SessionConfig) -> Self {
        Self {
            connection: ConnectionState::default(),
            liquidations: EventRingBuffer::new(config.ring_capacity, config.overflow_threshold),
            stats: LiquidationStats::default(),
            prices: BTreeMap::new(),
            candles: HashMap::new(),
        }
    }

    fn seed_price(&mut self, record: &TickRecord) {
        self.prices.insert(
            record.symbol.clone(),
            StreamEvent {
                symbol: record.symbol.clone(),
                price: record.price,
                change: 0.0,
                high: record.price,
                low: record.price,
                volume: 0.0,
                timestamp: record.timestamp,
                direction: Direction::Neutral,
            },
        );
    }

    /// Applies one flushed batch in arrival order and recomputes stats.
    fn apply_batch(&mut self, batch: &[FeedEvent], now_ms: i64) -> usize {
        let mut liquidations = Vec::new();
        for event in batch {
            match event {
                FeedEvent::Ticker(tick) => {
                    self.candles
                        .entry(tick.symbol.clone())
                        .or_default()
                        .apply_tick(tick);
                    self.prices.insert(tick.symbol.clone(), tick.clone());
                }
                FeedEvent::Liquidation(liquidation) => liquidations.push(liquidation.clone()),
            }
        }

        let trimmed = self.liquidations.merge(liquidations);
        self.stats = aggregate_liquidations(self.liquidations.iter(), now_ms);
        trimmed
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub is_leader: bool,
    pub connection_status: ConnectionState,
    pub derived_stats: LiquidationStats,
    /// Newest first.
    pub latest_events: Vec<LiquidationEvent>,
    pub prices: Vec<StreamEvent>,
}

pub struct MarketSession {
    session_id: String,
    config: Arc<SessionConfig>,
    election: Arc<LeaderElection>,
    view: Arc<Mutex<SessionView>>,
    manager: Arc<tokio::sync::Mutex<StreamConnectionManager>>,
    compute: Arc<BackgroundCompute>,
    render: tokio::sync::Mutex<Option<RenderWorker>>,
    cancel_token: CancellationToken,
    persist_token: CancellationToken,
    persist_task: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MarketSession {
    pub async fn create(
        hub: SessionHub,
        config: SessionConfig,
        tick_cache: Option<TickCache>,
    ) -> Result<Self, AppError> {
        let session_id = next_session_id();
        let config = Arc::new(config);
        let cancel_token = CancellationToken::new();
        let election = Arc::new(LeaderElection::new(
            session_id.clone(),
            hub.lease(),
            config.lease_ttl_ms,
        ));
        let view = Arc::new(Mutex::new(SessionView::new(&config)));
        let batcher = Arc::new(Mutex::new(FrameBatcher::<FeedEvent>::new()));

        let mut manager = StreamConnectionManager::new(&config, election.clone())
            .with_parent_token(cancel_token.child_token());

        if let Some(cache) = &tick_cache {
            let mut seeds = Vec::new();
            for symbol in &config.symbols {
                match cache.load(symbol, 1).await {
                    Ok(records) => seeds.extend(records),
                    Err(error) => {
                        tracing::warn!(%symbol, %error, "tick cache warm start failed");
                    }
                }
            }
            manager.seed_prices(seeds.iter().map(|record| (record.symbol.clone(), record.price)));
            let mut writable = view.lock();
            for record in &seeds {
                writable.seed_price(record);
            }
        }

        let mut tasks = Vec::new();
        let price_memory = manager.normalizer();

        let persist_token = CancellationToken::new();
        let (persist_tx, persist_rx) = mpsc::unbounded_channel::<TickRecord>();
        let persist_task = tick_cache.map(|cache| {
            tokio::spawn(run_persist_writer(
                cache,
                persist_rx,
                election.clone(),
                persist_token.clone(),
            ))
        });

        {
            let batcher = Arc::clone(&batcher);
            let config = Arc::clone(&config);
            manager.on_event(Arc::new(move |event: FeedEvent| {
                if let FeedEvent::Ticker(tick) = &event {
                    if config.is_persisted(&tick.symbol) {
                        let _ = persist_tx.send(TickRecord {
                            symbol: tick.symbol.clone(),
                            price: tick.price,
                            timestamp: tick.timestamp,
                        });
                    }
                }
                batcher.lock().push(event);
            }));
        }
        {
            let view = Arc::clone(&view);
            let hub = hub.clone();
            let origin = session_id.clone();
            manager.on_status(Arc::new(move |update| {
                view.lock().connection = update.state;
                hub.publish(SessionBroadcast::Status {
                    origin: origin.clone(),
                    update,
                });
            }));
        }

        let manager = Arc::new(tokio::sync::Mutex::new(manager));

        {
            let view = Arc::clone(&view);
            let hub = hub.clone();
            let origin = session_id.clone();
            let election = Arc::clone(&election);
            tasks.push(tokio::spawn(run_frame_loop(
                batcher,
                Duration::from_millis(config.frame_interval_ms),
                cancel_token.clone(),
                move |batch: Vec<FeedEvent>| {
                    apply_leader_flush(election.as_ref(), &view, &hub, &origin, batch);
                },
            )));
        }

        tasks.push(tokio::spawn(run_follower_mirror(
            hub.subscribe(),
            session_id.clone(),
            Arc::clone(&election),
            Arc::clone(&view),
            price_memory,
            cancel_token.clone(),
        )));

        let (leadership_tx, leadership_rx) = watch::channel(false);
        tasks.push(tokio::spawn(run_leadership_switch(
            leadership_rx,
            Arc::clone(&manager),
            cancel_token.clone(),
        )));
        tasks.push(tokio::spawn(run_election_loop(
            Arc::clone(&election),
            cancel_token.clone(),
            move |is_leader| {
                leadership_tx.send_replace(is_leader);
            },
        )));

        let compute = Arc::new(BackgroundCompute::probe(config.compute_workers).await);

        tracing::info!(
            %session_id,
            symbols = ?config.symbols,
            compute = ?compute.strategy(),
            "market session created"
        );

        Ok(Self {
            session_id,
            config,
            election,
            view,
            manager,
            compute,
            render: tokio::sync::Mutex::new(None),
            cancel_token,
            persist_token,
            persist_task: Mutex::new(persist_task),
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn compute_strategy(&self) -> ComputeStrategy {
        self.compute.strategy()
    }

    fn ensure_open(&self) -> Result<(), AppError> {
        if self.is_closed() {
            return Err(AppError::SessionClosed);
        }
        Ok(())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let view = self.view.lock();
        SessionSnapshot {
            session_id: self.session_id.clone(),
            is_leader: self.election.is_leader(),
            connection_status: view.connection,
            derived_stats: view.stats.clone(),
            latest_events: view
                .liquidations
                .latest(self.config.latest_events_limit)
                .cloned()
                .collect(),
            prices: view.prices.values().cloned().collect(),
        }
    }

    /// Sorts and filters the latest quote of every tracked symbol.
    pub async fn request_sort(
        &self,
        sort: SortSpec,
        filter: RecordFilter,
    ) -> Result<Vec<StreamEvent>, AppError> {
        self.ensure_open()?;
        let records: Vec<StreamEvent> = self.view.lock().prices.values().cloned().collect();
        match self
            .compute
            .request(ComputeOp::SortFilter {
                records,
                sort,
                filter,
            })
            .await?
        {
            ComputeResult::Records(records) => Ok(records),
            ComputeResult::Stats(_) => Err(AppError::WorkerUnavailable(
                "compute returned stats for a sort request".to_string(),
            )),
        }
    }

    /// Recomputes liquidation stats over the buffered events off-thread.
    pub async fn request_liquidation_stats(&self) -> Result<LiquidationStats, AppError> {
        self.ensure_open()?;
        let events: Vec<LiquidationEvent> =
            self.view.lock().liquidations.iter().cloned().collect();
        match self
            .compute
            .request(ComputeOp::LiquidationStats {
                events,
                now_ms: now_unix_ms(),
            })
            .await?
        {
            ComputeResult::Stats(stats) => Ok(stats),
            ComputeResult::Records(_) => Err(AppError::WorkerUnavailable(
                "compute returned records for a stats request".to_string(),
            )),
        }
    }

    /// Hands `surface` to the render worker, starting one if needed.
    pub async fn attach_surface(&self, surface: Surface) -> Result<(), AppError> {
        self.ensure_open()?;
        let mut render = self.render.lock().await;
        if render.is_none() {
            *render = Some(RenderWorker::spawn()?);
        }
        match render.as_ref() {
            Some(worker) => worker.init(surface).await,
            None => Err(AppError::WorkerUnavailable("render worker missing".to_string())),
        }
    }

    pub async fn request_draw(
        &self,
        symbol: &str,
        viewport: Viewport,
        mode: ChartMode,
        crosshair: Option<Crosshair>,
    ) -> RenderOutcome {
        if self.is_closed() {
            return RenderOutcome::Degraded {
                reason: AppError::SessionClosed.to_string(),
            };
        }

        let symbol = symbol.trim().to_ascii_uppercase();
        let data: Vec<UiCandle> = self
            .view
            .lock()
            .candles
            .get(&symbol)
            .map(|series| series.candles.iter().cloned().collect())
            .unwrap_or_default();

        let render = self.render.lock().await;
        let Some(worker) = render.as_ref() else {
            return RenderOutcome::Degraded {
                reason: "no drawing surface attached".to_string(),
            };
        };
        worker
            .draw(DrawCommand {
                data,
                viewport,
                mode,
                crosshair,
            })
            .await
    }

    /// Restarts the feed connection. Followers own no socket, so this returns
    /// `false` for them.
    pub async fn reconnect(&self) -> Result<bool, AppError> {
        self.ensure_open()?;
        if !self.election.is_leader() {
            return Ok(false);
        }
        let mut manager = self.manager.lock().await;
        manager.disconnect().await;
        manager.connect().await;
        Ok(true)
    }

    /// Cancels every task, releases the lease and stops the workers.
    pub async fn teardown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // The feed stops first so the write queue is final; it is flushed
        // while the lease is still held.
        self.manager.lock().await.disconnect().await;
        self.persist_token.cancel();
        let persist_task = self.persist_task.lock().take();
        if let Some(task) = persist_task {
            if let Err(error) = task.await {
                tracing::warn!(
                    session_id = %self.session_id,
                    %error,
                    "tick cache writer ended abnormally"
                );
            }
        }

        self.cancel_token.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(error) = task.await {
                tracing::warn!(
                    session_id = %self.session_id,
                    %error,
                    "session task ended abnormally"
                );
            }
        }

        self.manager.lock().await.disconnect().await;
        self.compute.shutdown().await;
        if let Some(worker) = self.render.lock().await.take() {
            worker.teardown().await;
        }
        tracing::info!(session_id = %self.session_id, "market session torn down");
    }
}

/// Merges one frame into the view and shares it with followers. A frame
/// whose lease lapsed after its events were accepted is dropped.
fn apply_leader_flush(
    gate: &dyn LeaderGate,
    view: &Mutex<SessionView>,
    hub: &SessionHub,
    origin: &str,
    batch: Vec<FeedEvent>,
) -> bool {
    if !gate.is_leader() {
        tracing::debug!(events = batch.len(), "leadership lapsed, dropping pending frame");
        return false;
    }

    let trimmed = view.lock().apply_batch(&batch, now_unix_ms());
    if trimmed > 0 {
        tracing::debug!(trimmed, "liquidation buffer trimmed");
    }
    hub.publish(SessionBroadcast::Flush {
        origin: origin.to_string(),
        batch,
    });
    true
}

async fn persist_if_leader(gate: &dyn LeaderGate, cache: &TickCache, record: &TickRecord) -> bool {
    if !gate.is_leader() {
        tracing::debug!(symbol = %record.symbol, "leadership lapsed, skipping tick write");
        return false;
    }
    match cache.save_record(record).await {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(symbol = %record.symbol, %error, "tick cache write failed");
            false
        }
    }
}

/// Writes queued ticks while this session leads. Ticks still queued at
/// cancellation are written before returning.
async fn run_persist_writer(
    cache: TickCache,
    mut records: mpsc::UnboundedReceiver<TickRecord>,
    gate: Arc<dyn LeaderGate>,
    cancel_token: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            _ = cancel_token.cancelled() => break,
            next = records.recv() => next,
        };
        let Some(record) = record else {
            return;
        };
        persist_if_leader(gate.as_ref(), &cache, &record).await;
    }

    while let Ok(record) = records.try_recv() {
        persist_if_leader(gate.as_ref(), &cache, &record).await;
    }
}

async fn run_follower_mirror(
    mut updates: broadcast::Receiver<SessionBroadcast>,
    session_id: String,
    election: Arc<LeaderElection>,
    view: Arc<Mutex<SessionView>>,
    price_memory: Arc<Mutex<FeedNormalizer>>,
    cancel_token: CancellationToken,
) {
    loop {
        let update = tokio::select! {
            _ = cancel_token.cancelled() => break,
            next = updates.recv() => next,
        };

        let update = match update {
            Ok(update) => update,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(%session_id, skipped, "follower mirror lagged behind leader");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if update.origin() == session_id || election.is_leader() {
            continue;
        }

        match update {
            SessionBroadcast::Status { update, .. } => {
                view.lock().connection = update.state;
            }
            SessionBroadcast::Flush { batch, .. } => {
                {
                    let mut normalizer = price_memory.lock();
                    for event in &batch {
                        if let FeedEvent::Ticker(tick) = event {
                            normalizer.seed_price(&tick.symbol, tick.price);
                        }
                    }
                }
                view.lock().apply_batch(&batch, now_unix_ms());
            }
        }
    }
}

async fn run_leadership_switch(
    mut leadership: watch::Receiver<bool>,
    manager: Arc<tokio::sync::Mutex<StreamConnectionManager>>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            changed = leadership.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let is_leader = *leadership.borrow_and_update();
        let mut manager = manager.lock().await;
        if is_leader {
            manager.connect().await;
        } else {
            manager.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::initialize_pool_from_path;
    use crate::db::tests::unique_db_path;
    use crate::market::types::{ConnectionStatus, LiquidationSide, StartSessionArgs};
    use crate::workers::compute::{SortDirection, SortField};
    use futures_util::{SinkExt, StreamExt};
    use std::sync::atomic::AtomicBool;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    struct FixedGate(AtomicBool);

    impl LeaderGate for FixedGate {
        fn is_leader(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn ticker_frame(price: f64) -> String {
        format!(
            r#"{{"stream":"btcusdt@ticker","data":{{"e":"24hrTicker","E":1700000000000,"s":"BTCUSDT","p":"0.0","c":"{price}","h":"{price}","l":"{price}","v":"10.0"}}}}"#
        )
    }

    /// Accepts one client per frame list, sends the frames and holds the
    /// socket until the client leaves. Frames wait for `start` when given.
    async fn spawn_feed_server(
        connections: Vec<Vec<String>>,
        start: Option<tokio::sync::oneshot::Receiver<()>>,
    ) -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("ephemeral port should bind");
        let port = listener
            .local_addr()
            .expect("listener should have an address")
            .port();
        let server = tokio::spawn(async move {
            let mut start = start;
            for frames in connections {
                let (tcp_stream, _) = listener.accept().await.expect("client should connect");
                let mut websocket = tokio_tungstenite::accept_async(tcp_stream)
                    .await
                    .expect("websocket handshake should succeed");
                if let Some(start) = start.take() {
                    start.await.expect("start signal should arrive");
                }
                for frame in frames {
                    websocket
                        .send(Message::Text(frame))
                        .await
                        .expect("frame should be sent");
                }
                while let Some(Ok(_)) = websocket.next().await {}
            }
        });
        (format!("ws://127.0.0.1:{port}/stream"), server)
    }

    fn btc_quote(session: &MarketSession) -> Option<StreamEvent> {
        session
            .snapshot()
            .prices
            .into_iter()
            .find(|event| event.symbol == "BTCUSDT")
    }

    fn config_for(base_url: String) -> SessionConfig {
        StartSessionArgs {
            symbols: Some(vec![
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
                "SOLUSDT".to_string(),
            ]),
            persisted_symbols: Some(vec!["BTCUSDT".to_string()]),
            stream_base_url: Some(base_url),
            ring_capacity: Some(20),
            overflow_threshold: Some(5),
            backoff_base_ms: Some(50),
            backoff_jitter_ms: Some(0),
            max_reconnect_attempts: Some(1),
            lease_ttl_ms: Some(300),
            compute_workers: Some(1),
            latest_events_limit: Some(10),
            ..StartSessionArgs::default()
        }
        .normalize()
        .expect("test config should be valid")
    }

    fn tick(symbol: &str, price: f64, volume: f64, timestamp: i64) -> FeedEvent {
        FeedEvent::Ticker(StreamEvent {
            symbol: symbol.to_string(),
            price,
            change: 0.0,
            high: price,
            low: price,
            volume,
            timestamp,
            direction: Direction::Neutral,
        })
    }

    fn liquidation(id: &str, usd_value: f64, timestamp: i64) -> FeedEvent {
        FeedEvent::Liquidation(LiquidationEvent {
            id: id.to_string(),
            symbol: "BTCUSDT".to_string(),
            side: LiquidationSide::LongLiquidated,
            price: 50_000.0,
            qty: usd_value / 50_000.0,
            usd_value,
            timestamp,
            is_major: usd_value >= 100_000.0,
            is_whale: usd_value >= 1_000_000.0,
        })
    }

    async fn eventually<F>(what: &str, mut check: F)
    where
        F: FnMut() -> bool,
    {
        let waited = tokio::time::timeout(Duration::from_secs(10), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {what}");
    }

    async fn unreachable_base_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("ephemeral port should bind");
        let port = listener
            .local_addr()
            .expect("listener should have an address")
            .port();
        format!("ws://127.0.0.1:{port}/stream")
    }

    /// Holds the hub lease for an outside holder so sessions stay followers.
    async fn occupy_lease(hub: &SessionHub) {
        let acquired = hub
            .lease()
            .try_acquire("external-leader", now_unix_ms(), 600_000)
            .await
            .expect("lease round");
        assert!(acquired);
    }

    #[test]
    fn view_merges_batches_and_recomputes_stats() {
        let config = config_for("ws://127.0.0.1:1/stream".to_string());
        let mut view = SessionView::new(&config);
        let now_ms = 10_000_000;

        let mut batch = vec![tick("BTCUSDT", 50_000.0, 100.0, now_ms)];
        for index in 0..25 {
            batch.push(liquidation(&format!("liq-{index}"), 1_000.0 * (index + 1) as f64, now_ms));
        }
        let trimmed = view.apply_batch(&batch, now_ms);

        assert_eq!(trimmed, 5);
        assert_eq!(view.liquidations.len(), 20);
        assert_eq!(view.stats.long_count, 20);
        assert_eq!(
            view.stats.largest.as_ref().map(|event| event.id.as_str()),
            Some("liq-24")
        );
        assert_eq!(view.prices.get("BTCUSDT").map(|event| event.price), Some(50_000.0));
    }

    #[test]
    fn candles_track_rolling_volume_growth() {
        let mut series = CandleSeries::default();
        let base = 1_700_000_040_000;
        for (offset, price, volume) in [
            (0, 100.0, 1_000.0),
            (5_000, 103.0, 1_004.0),
            (9_000, 99.0, 1_010.0),
            (60_000, 101.0, 1_011.0),
        ] {
            if let FeedEvent::Ticker(event) = tick("BTCUSDT", price, volume, base + offset) {
                series.apply_tick(&event);
            }
        }

        assert_eq!(series.candles.len(), 2);
        let first = &series.candles[0];
        assert_eq!(first.t, candle_bucket_open_time(base, CANDLE_TIMEFRAME_MS));
        assert_eq!((first.o, first.h, first.l, first.c), (100.0, 103.0, 99.0, 99.0));
        assert_eq!(first.v, 10.0);
        assert_eq!(series.candles[1].v, 1.0);
    }

    #[tokio::test]
    async fn follower_mirrors_leader_broadcasts() {
        let hub = SessionHub::in_memory();
        occupy_lease(&hub).await;
        let config = config_for(unreachable_base_url().await);
        let session = MarketSession::create(hub.clone(), config, None)
            .await
            .expect("session should start");

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!session.is_leader());

        hub.publish(SessionBroadcast::Status {
            origin: "external-leader".to_string(),
            update: crate::market::types::FeedStatusUpdate {
                state: ConnectionState {
                    status: ConnectionStatus::Connected,
                    attempt: 0,
                },
                reason: None,
                retry_in_ms: None,
            },
        });
        let now_ms = now_unix_ms();
        hub.publish(SessionBroadcast::Flush {
            origin: "external-leader".to_string(),
            batch: vec![
                tick("ETHUSDT", 2_000.0, 10.0, now_ms),
                liquidation("a", 5_000.0, now_ms),
                liquidation("b", 7_000.0, now_ms),
            ],
        });

        eventually("mirrored flush", || session.snapshot().latest_events.len() == 2).await;
        let snapshot = session.snapshot();
        assert_eq!(snapshot.connection_status.status, ConnectionStatus::Connected);
        assert_eq!(snapshot.latest_events[0].id, "b");
        assert_eq!(snapshot.derived_stats.events_last_minute, 2);
        assert_eq!(snapshot.prices.len(), 1);

        session.teardown().await;
    }

    #[tokio::test]
    async fn exactly_one_session_leads_and_survivor_takes_over() {
        let hub = SessionHub::in_memory();
        let base_url = unreachable_base_url().await;
        let first = MarketSession::create(hub.clone(), config_for(base_url.clone()), None)
            .await
            .expect("first session should start");
        let second = MarketSession::create(hub.clone(), config_for(base_url), None)
            .await
            .expect("second session should start");

        eventually("a leader", || first.is_leader() || second.is_leader()).await;
        for _ in 0..20 {
            assert!(!(first.is_leader() && second.is_leader()));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (leader, survivor) = if first.is_leader() {
            (first, second)
        } else {
            (second, first)
        };
        leader.teardown().await;
        assert!(!leader.is_leader());
        eventually("re-election", || survivor.is_leader()).await;

        survivor.teardown().await;
    }

    #[tokio::test]
    async fn sort_and_draw_requests_use_workers() {
        let hub = SessionHub::in_memory();
        occupy_lease(&hub).await;
        let config = config_for(unreachable_base_url().await);
        let session = MarketSession::create(hub.clone(), config, None)
            .await
            .expect("session should start");
        assert_eq!(session.compute_strategy(), ComputeStrategy::Workers { workers: 1 });

        let now_ms = now_unix_ms();
        hub.publish(SessionBroadcast::Flush {
            origin: "external-leader".to_string(),
            batch: vec![
                tick("BTCUSDT", 50_000.0, 300.0, now_ms),
                tick("ETHUSDT", 2_000.0, 900.0, now_ms),
                tick("SOLUSDT", 150.0, 600.0, now_ms),
                liquidation("a", 250_000.0, now_ms),
            ],
        });
        eventually("mirrored prices", || session.snapshot().prices.len() == 3).await;

        let by_volume = session
            .request_sort(
                SortSpec {
                    field: SortField::Volume,
                    direction: SortDirection::Descending,
                },
                RecordFilter::default(),
            )
            .await
            .expect("sort should succeed");
        let symbols: Vec<&str> = by_volume.iter().map(|event| event.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["ETHUSDT", "SOLUSDT", "BTCUSDT"]);

        let stats = session
            .request_liquidation_stats()
            .await
            .expect("stats should succeed");
        assert_eq!(stats.major_count, 1);

        let viewport = Viewport {
            css_width: 120.0,
            css_height: 80.0,
            device_pixel_ratio: 1.0,
        };
        let degraded = session
            .request_draw("BTCUSDT", viewport, ChartMode::Line, None)
            .await;
        assert!(matches!(degraded, RenderOutcome::Degraded { .. }));

        session
            .attach_surface(Surface::for_viewport(&viewport).expect("valid viewport"))
            .await
            .expect("surface should attach");
        let drawn = session
            .request_draw("btcusdt", viewport, ChartMode::Candles, None)
            .await;
        assert!(matches!(drawn, RenderOutcome::Drawn { width: 120, height: 80, .. }));

        session.teardown().await;
        assert!(matches!(
            session.request_sort(
                SortSpec {
                    field: SortField::Price,
                    direction: SortDirection::Ascending,
                },
                RecordFilter::default(),
            )
            .await,
            Err(AppError::SessionClosed)
        ));
        assert!(matches!(session.reconnect().await, Err(AppError::SessionClosed)));
    }

    #[tokio::test]
    async fn leader_streams_persists_and_warm_starts_from_cache() {
        let db_path = unique_db_path("session");
        let pool = initialize_pool_from_path(&db_path)
            .await
            .expect("pool initialization should succeed");
        let cache = TickCache::new(pool.clone(), 50);
        cache
            .save_record(&TickRecord {
                symbol: "BTCUSDT".to_string(),
                price: 49_000.0,
                timestamp: 1_000,
            })
            .await
            .expect("seed tick should be written");

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("ephemeral port should bind");
        let port = listener
            .local_addr()
            .expect("listener should have an address")
            .port();
        let server = tokio::spawn(async move {
            let (tcp_stream, _) = listener.accept().await.expect("client should connect");
            let mut websocket = tokio_tungstenite::accept_async(tcp_stream)
                .await
                .expect("websocket handshake should succeed");
            let frames = [
                r#"{"stream":"btcusdt@ticker","data":{"e":"24hrTicker","E":1700000000000,"s":"BTCUSDT","p":"1000.0","c":"50000.0","h":"50500.0","l":"48800.0","v":"1234.5"}}"#,
                r#"{"stream":"!forceOrder@arr","data":{"e":"forceOrder","E":1700000000100,"o":{"s":"BTCUSDT","S":"BUY","q":"3.0","p":"50000","ap":"50000","z":"3.0","T":1700000000100}}}"#,
            ];
            for frame in frames {
                websocket
                    .send(Message::Text(frame.to_string()))
                    .await
                    .expect("frame should be sent");
            }
            while let Some(Ok(_)) = websocket.next().await {}
        });

        let hub = SessionHub::sqlite(pool.clone());
        let session = MarketSession::create(
            hub.clone(),
            config_for(format!("ws://127.0.0.1:{port}/stream")),
            Some(cache.clone()),
        )
        .await
        .expect("session should start");

        let warm = session.snapshot();
        assert_eq!(warm.prices.len(), 1);
        assert_eq!(warm.prices[0].price, 49_000.0);

        eventually("streamed events", || {
            let snapshot = session.snapshot();
            snapshot.latest_events.len() == 1
                && snapshot.prices.iter().any(|event| event.price == 50_000.0)
        })
        .await;

        let snapshot = session.snapshot();
        assert!(snapshot.is_leader);
        assert_eq!(snapshot.connection_status.status, ConnectionStatus::Connected);
        let btc = snapshot
            .prices
            .iter()
            .find(|event| event.symbol == "BTCUSDT")
            .expect("btc quote");
        assert_eq!(btc.direction, Direction::Up);
        assert_eq!(snapshot.latest_events[0].side, LiquidationSide::ShortLiquidated);
        assert_eq!(snapshot.derived_stats.short_liquidated_usd, 150_000.0);

        let mut persisted = Vec::new();
        for _ in 0..500 {
            persisted = cache.load("BTCUSDT", 10).await.expect("tick read should succeed");
            if persisted.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(persisted.len(), 2);
        assert_eq!(persisted.last().map(|record| record.price), Some(50_000.0));

        session.teardown().await;
        assert_eq!(session.snapshot().connection_status, ConnectionState::default());
        server.await.expect("server should observe the close");

        let lease_rows = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM leader_lease")
            .fetch_one(&pool)
            .await
            .expect("lease table must be queryable");
        assert_eq!(lease_rows, 0);

        hub.close().await;
        drop(cache);
        pool.close().await;
        let _ = std::fs::remove_file(db_path);
    }

    #[test]
    fn frame_is_dropped_once_leadership_lapses() {
        let config = config_for("ws://127.0.0.1:1/stream".to_string());
        let view = Mutex::new(SessionView::new(&config));
        let hub = SessionHub::in_memory();
        let mut receiver = hub.subscribe();
        let gate = FixedGate(AtomicBool::new(false));
        let now_ms = now_unix_ms();

        let applied = apply_leader_flush(
            &gate,
            &view,
            &hub,
            "tab-1",
            vec![tick("BTCUSDT", 50_000.0, 1.0, now_ms)],
        );
        assert!(!applied);
        assert!(view.lock().prices.is_empty());
        assert!(receiver.try_recv().is_err());

        gate.0.store(true, Ordering::SeqCst);
        let applied = apply_leader_flush(
            &gate,
            &view,
            &hub,
            "tab-1",
            vec![tick("BTCUSDT", 50_000.0, 1.0, now_ms)],
        );
        assert!(applied);
        assert_eq!(view.lock().prices.len(), 1);
        assert!(matches!(
            receiver.try_recv(),
            Ok(SessionBroadcast::Flush { .. })
        ));
    }

    #[tokio::test]
    async fn tick_writes_follow_leadership_and_drain_on_cancel() {
        let db_path = unique_db_path("persist-writer");
        let pool = initialize_pool_from_path(&db_path)
            .await
            .expect("pool initialization should succeed");
        let cache = TickCache::new(pool.clone(), 50);
        let gate = Arc::new(FixedGate(AtomicBool::new(false)));
        let record = |symbol: &str, price: f64| TickRecord {
            symbol: symbol.to_string(),
            price,
            timestamp: 1_000,
        };

        let (follower_tx, follower_rx) = mpsc::unbounded_channel();
        follower_tx.send(record("ETHUSDT", 2_000.0)).expect("queue");
        let follower_token = CancellationToken::new();
        follower_token.cancel();
        run_persist_writer(cache.clone(), follower_rx, gate.clone(), follower_token).await;
        assert!(cache.load("ETHUSDT", 10).await.expect("read").is_empty());

        gate.0.store(true, Ordering::SeqCst);
        let (leader_tx, leader_rx) = mpsc::unbounded_channel();
        for price in [50_000.0, 50_100.0, 50_200.0] {
            leader_tx.send(record("BTCUSDT", price)).expect("queue");
        }
        let leader_token = CancellationToken::new();
        leader_token.cancel();
        run_persist_writer(cache.clone(), leader_rx, gate, leader_token).await;
        assert_eq!(cache.load("BTCUSDT", 10).await.expect("read").len(), 3);

        drop(cache);
        pool.close().await;
        let _ = std::fs::remove_file(db_path);
    }

    #[tokio::test]
    async fn takeover_continues_direction_from_mirrored_price() {
        let (start_tx, start_rx) = tokio::sync::oneshot::channel();
        let (base_url, server) = spawn_feed_server(
            vec![vec![ticker_frame(50_000.0)], vec![ticker_frame(49_000.0)]],
            Some(start_rx),
        )
        .await;
        let hub = SessionHub::in_memory();

        let first = MarketSession::create(hub.clone(), config_for(base_url.clone()), None)
            .await
            .expect("first session should start");
        eventually("first session leads", || first.is_leader()).await;
        let second = MarketSession::create(hub.clone(), config_for(base_url), None)
            .await
            .expect("second session should start");
        start_tx.send(()).expect("server should wait for the start signal");

        eventually("follower mirrors the leader quote", || {
            btc_quote(&second).is_some_and(|quote| quote.price == 50_000.0)
        })
        .await;
        assert!(!second.is_leader());

        first.teardown().await;
        eventually("takeover quote", || {
            btc_quote(&second).is_some_and(|quote| quote.price == 49_000.0)
        })
        .await;

        assert!(second.is_leader());
        let quote = btc_quote(&second).expect("btc quote");
        assert_eq!(quote.direction, Direction::Down);

        second.teardown().await;
        server.await.expect("server should see both clients leave");
    }

    #[tokio::test]
    async fn follower_in_another_pool_receives_leader_state() {
        let db_path = unique_db_path("cross-pool");
        let leader_pool = initialize_pool_from_path(&db_path)
            .await
            .expect("pool initialization should succeed");
        let follower_pool = initialize_pool_from_path(&db_path)
            .await
            .expect("second pool should open the same file");
        let (base_url, server) = spawn_feed_server(vec![vec![ticker_frame(50_000.0)]], None).await;

        let leader_hub = SessionHub::sqlite(leader_pool.clone());
        let leader = MarketSession::create(leader_hub.clone(), config_for(base_url.clone()), None)
            .await
            .expect("leader session should start");
        eventually("leader streams", || btc_quote(&leader).is_some()).await;

        // A process that starts later catches up from the relay's recent rows.
        let follower_hub = SessionHub::sqlite(follower_pool.clone());
        let follower =
            MarketSession::create(follower_hub.clone(), config_for(base_url), None)
                .await
                .expect("follower session should start");
        eventually("follower receives the quote and status", || {
            let snapshot = follower.snapshot();
            snapshot.connection_status.status == ConnectionStatus::Connected
                && snapshot.prices.iter().any(|event| event.price == 50_000.0)
        })
        .await;
        assert!(leader.is_leader());
        assert!(!follower.is_leader());

        follower.teardown().await;
        leader.teardown().await;
        server.await.expect("server should observe the close");
        leader_hub.close().await;
        follower_hub.close().await;
        leader_pool.close().await;
        follower_pool.close().await;
        let _ = std::fs::remove_file(db_path);
    }
}
