//! CPU-bound queries offloaded to a pool of dedicated OS threads.
//!
//! Each worker owns its inbound queue; every reply funnels through one router
//! task that resolves the waiting caller by `request_id`, so replies may come
//! back in any order. When the pool cannot start, or a worker dies mid-request,
//! the caller runs [`execute_inline`] on its retained copy of the payload.

use crate::error::AppError;
use crate::market::stats::{aggregate_liquidations, LiquidationStats};
use crate::market::types::{Direction, LiquidationEvent, StreamEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    Symbol,
    Price,
    Change,
    Volume,
    Timestamp,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SortSpec {
    pub field: SortField,
    #[serde(default)]
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordFilter {
    pub symbols: Option<Vec<String>>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub min_volume: Option<f64>,
    pub direction: Option<Direction>,
}

impl RecordFilter {
    fn accepts(&self, record: &StreamEvent) -> bool {
        self.symbols
            .as_ref()
            .is_none_or(|symbols| symbols.iter().any(|symbol| symbol == &record.symbol))
            && self.min_price.is_none_or(|min| record.price >= min)
            && self.max_price.is_none_or(|max| record.price <= max)
            && self.min_volume.is_none_or(|min| record.volume >= min)
            && self.direction.is_none_or(|direction| record.direction == direction)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ComputeOp {
    SortFilter {
        records: Vec<StreamEvent>,
        sort: SortSpec,
        filter: RecordFilter,
    },
    LiquidationStats {
        events: Vec<LiquidationEvent>,
        now_ms: i64,
    },
}

impl ComputeOp {
    fn name(&self) -> &'static str {
        match self {
            Self::SortFilter { .. } => "sort_filter",
            Self::LiquidationStats { .. } => "liquidation_stats",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ComputeResult {
    Records(Vec<StreamEvent>),
    Stats(LiquidationStats),
}

fn compare_records(left: &StreamEvent, right: &StreamEvent, field: SortField) -> CmpOrdering {
    match field {
        SortField::Symbol => left.symbol.cmp(&right.symbol),
        SortField::Price => left.price.total_cmp(&right.price),
        SortField::Change => left.change.total_cmp(&right.change),
        SortField::Volume => left.volume.total_cmp(&right.volume),
        SortField::Timestamp => left.timestamp.cmp(&right.timestamp),
    }
}

/// Reference implementation shared by both strategies. Sorting is stable:
/// equal keys keep their input order in either direction.
pub fn execute_inline(op: ComputeOp) -> ComputeResult {
    match op {
        ComputeOp::SortFilter {
            records,
            sort,
            filter,
        } => {
            let mut kept: Vec<StreamEvent> = records
                .into_iter()
                .filter(|record| filter.accepts(record))
                .collect();
            kept.sort_by(|left, right| {
                let ordering = compare_records(left, right, sort.field);
                match sort.direction {
                    SortDirection::Ascending => ordering,
                    SortDirection::Descending => ordering.reverse(),
                }
            });
            ComputeResult::Records(kept)
        }
        ComputeOp::LiquidationStats { events, now_ms } => {
            ComputeResult::Stats(aggregate_liquidations(&events, now_ms))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeStrategy {
    Workers { workers: usize },
    Inline,
}

#[derive(Debug)]
enum WorkerInbound {
    Init,
    Request { request_id: u64, op: ComputeOp },
    Shutdown,
}

#[derive(Debug)]
enum WorkerReply {
    Done(ComputeResult),
    Crashed(String),
}

#[derive(Debug)]
enum WorkerOutbound {
    Ready {
        worker: usize,
    },
    Response {
        worker: usize,
        request_id: u64,
        reply: WorkerReply,
    },
}

fn panic_reason(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}

fn worker_main(
    worker: usize,
    mut inbound: mpsc::UnboundedReceiver<WorkerInbound>,
    outbound: mpsc::UnboundedSender<WorkerOutbound>,
) {
    while let Some(message) = inbound.blocking_recv() {
        match message {
            WorkerInbound::Init => {
                if outbound.send(WorkerOutbound::Ready { worker }).is_err() {
                    break;
                }
            }
            WorkerInbound::Request { request_id, op } => {
                let reply = match panic::catch_unwind(AssertUnwindSafe(|| execute_inline(op))) {
                    Ok(result) => WorkerReply::Done(result),
                    Err(payload) => WorkerReply::Crashed(panic_reason(payload.as_ref())),
                };
                let response = WorkerOutbound::Response {
                    worker,
                    request_id,
                    reply,
                };
                if outbound.send(response).is_err() {
                    break;
                }
            }
            WorkerInbound::Shutdown => break,
        }
    }
}

struct WorkerHandle {
    inbound: mpsc::UnboundedSender<WorkerInbound>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    degraded: AtomicBool,
}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<WorkerReply>>>>;

struct WorkerPool {
    workers: Vec<WorkerHandle>,
    next_worker: AtomicUsize,
    next_request_id: AtomicU64,
    pending: PendingReplies,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    fn pick_worker(&self) -> Option<(usize, &WorkerHandle)> {
        let count = self.workers.len();
        let start = self.next_worker.fetch_add(1, Ordering::Relaxed);
        (0..count)
            .map(|offset| start.wrapping_add(offset) % count)
            .map(|index| (index, &self.workers[index]))
            .find(|(_, handle)| !handle.degraded.load(Ordering::Acquire))
    }

    fn healthy_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|handle| !handle.degraded.load(Ordering::Acquire))
            .count()
    }
}

async fn route_replies(
    mut outbound: mpsc::UnboundedReceiver<WorkerOutbound>,
    pending: PendingReplies,
) {
    while let Some(message) = outbound.recv().await {
        match message {
            WorkerOutbound::Ready { worker } => {
                tracing::debug!(worker, "late ready from compute worker");
            }
            WorkerOutbound::Response {
                worker,
                request_id,
                reply,
            } => {
                let Some(waiter) = pending.lock().remove(&request_id) else {
                    tracing::debug!(worker, request_id, "no caller waiting for compute reply");
                    continue;
                };
                let _ = waiter.send(reply);
            }
        }
    }
}

/// Starts `workers` threads and waits for each to acknowledge `INIT`.
async fn start_pool(workers: usize) -> Result<WorkerPool, AppError> {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let mut handles = Vec::with_capacity(workers);

    for worker in 0..workers {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let outbound = outbound_tx.clone();
        let thread = thread::Builder::new()
            .name(format!("compute-worker-{worker}"))
            .spawn(move || worker_main(worker, inbound_rx, outbound))?;

        inbound_tx
            .send(WorkerInbound::Init)
            .map_err(|_| AppError::WorkerUnavailable(format!("worker {worker} exited early")))?;
        handles.push(WorkerHandle {
            inbound: inbound_tx,
            thread: Mutex::new(Some(thread)),
            degraded: AtomicBool::new(false),
        });
    }
    drop(outbound_tx);

    let handshake = async {
        let mut ready = 0;
        while ready < workers {
            match outbound_rx.recv().await {
                Some(WorkerOutbound::Ready { .. }) => ready += 1,
                Some(WorkerOutbound::Response { .. }) => {}
                None => {
                    return Err(AppError::WorkerUnavailable(
                        "compute workers exited during handshake".to_string(),
                    ))
                }
            }
        }
        Ok(())
    };
    let handshake_result = match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
        Ok(result) => result,
        Err(_) => Err(AppError::WorkerUnavailable(
            "compute workers did not report ready in time".to_string(),
        )),
    };
    if let Err(error) = handshake_result {
        for handle in &handles {
            let _ = handle.inbound.send(WorkerInbound::Shutdown);
        }
        return Err(error);
    }

    let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
    let router = tokio::spawn(route_replies(outbound_rx, Arc::clone(&pending)));

    Ok(WorkerPool {
        workers: handles,
        next_worker: AtomicUsize::new(0),
        next_request_id: AtomicU64::new(1),
        pending,
        router: Mutex::new(Some(router)),
    })
}

/// Front door for compute requests; picks the strategy once at probe time.
pub struct BackgroundCompute {
    pool: Option<WorkerPool>,
    closed: AtomicBool,
}

impl BackgroundCompute {
    /// Falls back to [`ComputeStrategy::Inline`] when `workers` is zero or
    /// the pool fails its startup handshake.
    pub async fn probe(workers: usize) -> Self {
        let pool = if workers == 0 {
            None
        } else {
            match start_pool(workers).await {
                Ok(pool) => {
                    tracing::info!(workers, "compute workers ready");
                    Some(pool)
                }
                Err(error) => {
                    tracing::warn!(%error, "compute workers unavailable, using inline strategy");
                    None
                }
            }
        };

        Self {
            pool,
            closed: AtomicBool::new(false),
        }
    }

    pub fn strategy(&self) -> ComputeStrategy {
        match &self.pool {
            Some(pool) if pool.healthy_workers() > 0 => ComputeStrategy::Workers {
                workers: pool.healthy_workers(),
            },
            _ => ComputeStrategy::Inline,
        }
    }

    pub async fn request(&self, op: ComputeOp) -> Result<ComputeResult, AppError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AppError::SessionClosed);
        }
        let Some(pool) = &self.pool else {
            return Ok(execute_inline(op));
        };
        let Some((worker, handle)) = pool.pick_worker() else {
            return Ok(execute_inline(op));
        };

        let request_id = pool.next_request_id.fetch_add(1, Ordering::Relaxed);
        let op_name = op.name();
        let fallback = op.clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        pool.pending.lock().insert(request_id, reply_tx);

        if handle
            .inbound
            .send(WorkerInbound::Request { request_id, op })
            .is_err()
        {
            pool.pending.lock().remove(&request_id);
            handle.degraded.store(true, Ordering::Release);
            tracing::warn!(worker, request_id, op = op_name, "compute worker gone, running inline");
            return Ok(execute_inline(fallback));
        }

        match reply_rx.await {
            Ok(WorkerReply::Done(result)) => Ok(result),
            Ok(WorkerReply::Crashed(reason)) => {
                handle.degraded.store(true, Ordering::Release);
                tracing::warn!(
                    worker,
                    request_id,
                    op = op_name,
                    %reason,
                    "compute worker crashed, running inline"
                );
                Ok(execute_inline(fallback))
            }
            Err(_) => {
                handle.degraded.store(true, Ordering::Release);
                tracing::warn!(
                    worker,
                    request_id,
                    op = op_name,
                    "compute reply lost, running inline"
                );
                Ok(execute_inline(fallback))
            }
        }
    }

    /// Stops every worker thread and the reply router. Later requests fail
    /// with [`AppError::SessionClosed`].
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(pool) = &self.pool else {
            return;
        };

        for handle in &pool.workers {
            let _ = handle.inbound.send(WorkerInbound::Shutdown);
        }
        for (worker, handle) in pool.workers.iter().enumerate() {
            let maybe_thread = handle.thread.lock().take();
            if let Some(thread) = maybe_thread {
                match tokio::task::spawn_blocking(move || thread.join()).await {
                    Ok(Ok(())) => {}
                    _ => tracing::warn!(worker, "compute worker did not exit cleanly"),
                }
            }
        }

        let maybe_router = pool.router.lock().take();
        if let Some(router) = maybe_router {
            let _ = router.await;
        }
        pool.pending.lock().clear();
        tracing::info!("compute workers stopped");
    }
}
