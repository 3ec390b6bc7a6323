//! Single-writer election between concurrently live sessions.
//!
//! Leadership is a time-bounded lease held in a shared store. A holder
//! considers itself leader only until the deadline derived from the instant
//! it *started* its last successful acquire, while contenders may only take
//! the lease once the stored expiry has passed. Both sides read the same
//! clock, so the two windows never overlap.

use crate::error::AppError;
use crate::market::persistence::now_unix_ms;
use crate::market::relay::{run_relay_reader, run_relay_writer, SqliteRelay};
use crate::market::types::{FeedEvent, FeedStatusUpdate};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_LEASE_NAME: &str = "market-feed";
const BROADCAST_CAPACITY: usize = 1_024;

#[derive(Debug, Clone, PartialEq, Eq)]
struct LeaseRecord {
    holder: String,
    expires_at_ms: i64,
}

/// In-process lease; sessions sharing one process share one `MemoryLease`.
#[derive(Debug, Default)]
pub struct MemoryLease {
    slot: Mutex<Option<LeaseRecord>>,
}

impl MemoryLease {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_acquire(&self, holder: &str, now_ms: i64, ttl_ms: u64) -> bool {
        let mut slot = self.slot.lock();
        let available = match slot.as_ref() {
            None => true,
            Some(current) => current.holder == holder || current.expires_at_ms <= now_ms,
        };
        if available {
            *slot = Some(LeaseRecord {
                holder: holder.to_string(),
                expires_at_ms: now_ms.saturating_add(ttl_ms as i64),
            });
        }
        available
    }

    fn release(&self, holder: &str) {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|current| current.holder == holder) {
            *slot = None;
        }
    }
}

/// Cross-process lease in the shared sqlite database.
#[derive(Debug, Clone)]
pub struct SqliteLease {
    pool: SqlitePool,
    name: String,
}

impl SqliteLease {
    pub fn new(pool: SqlitePool, name: impl Into<String>) -> Self {
        Self {
            pool,
            name: name.into(),
        }
    }

    async fn try_acquire(&self, holder: &str, now_ms: i64, ttl_ms: u64) -> Result<bool, AppError> {
        let expires_at_ms = now_ms.saturating_add(ttl_ms as i64);
        let result = sqlx::query(
            "INSERT INTO leader_lease (name, holder, expires_at_ms) VALUES (?, ?, ?) \
             ON CONFLICT(name) DO UPDATE \
             SET holder = excluded.holder, expires_at_ms = excluded.expires_at_ms \
             WHERE leader_lease.holder = excluded.holder OR leader_lease.expires_at_ms <= ?",
        )
        .bind(&self.name)
        .bind(holder)
        .bind(expires_at_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, holder: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM leader_lease WHERE name = ? AND holder = ?")
            .bind(&self.name)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Debug)]
pub enum LeaseBackend {
    Memory(MemoryLease),
    Sqlite(SqliteLease),
}

impl LeaseBackend {
    pub fn memory() -> Self {
        Self::Memory(MemoryLease::new())
    }

    pub fn sqlite(pool: SqlitePool) -> Self {
        Self::Sqlite(SqliteLease::new(pool, DEFAULT_LEASE_NAME))
    }

    /// Acquires or renews. `Ok(false)` means another holder owns a live lease.
    pub async fn try_acquire(
        &self,
        holder: &str,
        now_ms: i64,
        ttl_ms: u64,
    ) -> Result<bool, AppError> {
        match self {
            Self::Memory(lease) => Ok(lease.try_acquire(holder, now_ms, ttl_ms)),
            Self::Sqlite(lease) => lease.try_acquire(holder, now_ms, ttl_ms).await,
        }
    }

    pub async fn release(&self, holder: &str) -> Result<(), AppError> {
        match self {
            Self::Memory(lease) => {
                lease.release(holder);
                Ok(())
            }
            Self::Sqlite(lease) => lease.release(holder).await,
        }
    }
}

#[derive(Debug)]
pub struct LeaderElection {
    holder_id: String,
    lease: Arc<LeaseBackend>,
    ttl_ms: u64,
    deadline_ms: AtomicI64,
}

impl LeaderElection {
    pub fn new(holder_id: impl Into<String>, lease: Arc<LeaseBackend>, ttl_ms: u64) -> Self {
        Self {
            holder_id: holder_id.into(),
            lease,
            ttl_ms: ttl_ms.max(1),
            deadline_ms: AtomicI64::new(0),
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Renewal cadence; three renewals fit into one lease lifetime.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis((self.ttl_ms / 3).max(1))
    }

    pub fn is_leader(&self) -> bool {
        now_unix_ms() < self.deadline_ms.load(Ordering::Acquire)
    }

    /// One acquire-or-renew round. Storage failures keep the current deadline,
    /// which then lapses on its own if the store stays unreachable.
    pub async fn campaign(&self) -> bool {
        let started_ms = now_unix_ms();
        match self
            .lease
            .try_acquire(&self.holder_id, started_ms, self.ttl_ms)
            .await
        {
            Ok(true) => {
                self.deadline_ms.store(
                    started_ms.saturating_add(self.ttl_ms as i64),
                    Ordering::Release,
                );
            }
            Ok(false) => {
                self.deadline_ms.store(0, Ordering::Release);
            }
            Err(error) => {
                tracing::warn!(holder = %self.holder_id, %error, "leader lease round failed");
            }
        }
        self.is_leader()
    }

    pub async fn resign(&self) {
        self.deadline_ms.store(0, Ordering::Release);
        if let Err(error) = self.lease.release(&self.holder_id).await {
            tracing::warn!(holder = %self.holder_id, %error, "failed to release leader lease");
        }
    }
}

/// Runs campaign rounds until cancelled, reporting every leadership flip.
/// The lease is released on the way out.
pub async fn run_election_loop<F>(
    election: Arc<LeaderElection>,
    cancel_token: CancellationToken,
    mut on_change: F,
) where
    F: FnMut(bool),
{
    let mut ticker = tokio::time::interval(election.heartbeat_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut was_leader = false;

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                let is_leader = election.campaign().await;
                if is_leader != was_leader {
                    tracing::info!(holder = %election.holder_id(), is_leader, "leadership changed");
                    was_leader = is_leader;
                    on_change(is_leader);
                }
            }
        }
    }

    election.resign().await;
    if was_leader {
        on_change(false);
    }
}

/// What a leader shares with its followers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionBroadcast {
    Status {
        origin: String,
        update: FeedStatusUpdate,
    },
    Flush {
        origin: String,
        batch: Vec<FeedEvent>,
    },
}

impl SessionBroadcast {
    pub fn origin(&self) -> &str {
        match self {
            Self::Status { origin, .. } | Self::Flush { origin, .. } => origin,
        }
    }
}

#[derive(Debug, Clone)]
struct HubRelay {
    outgoing: mpsc::UnboundedSender<SessionBroadcast>,
    cancel_token: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

/// Coordination domain shared by every session that competes for the feed:
/// the lease store plus the leader → follower update channel.
///
/// A memory hub fans updates out in-process. A sqlite hub routes every
/// update through the shared database, so sessions in any process that
/// opens the same file receive them.
#[derive(Debug, Clone)]
pub struct SessionHub {
    lease: Arc<LeaseBackend>,
    updates: broadcast::Sender<SessionBroadcast>,
    relay: Option<HubRelay>,
}

impl SessionHub {
    pub fn in_memory() -> Self {
        let (updates, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            lease: Arc::new(LeaseBackend::memory()),
            updates,
            relay: None,
        }
    }

    /// Spawns the relay writer and reader; call from within a tokio runtime.
    pub fn sqlite(pool: SqlitePool) -> Self {
        let (updates, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();
        let relay = SqliteRelay::new(pool.clone());

        let tasks = vec![
            tokio::spawn(run_relay_writer(
                relay.clone(),
                outgoing_rx,
                cancel_token.clone(),
            )),
            tokio::spawn(run_relay_reader(
                relay,
                updates.clone(),
                cancel_token.clone(),
            )),
        ];

        Self {
            lease: Arc::new(LeaseBackend::sqlite(pool)),
            updates,
            relay: Some(HubRelay {
                outgoing,
                cancel_token,
                tasks: Arc::new(Mutex::new(tasks)),
            }),
        }
    }

    pub fn lease(&self) -> Arc<LeaseBackend> {
        Arc::clone(&self.lease)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionBroadcast> {
        self.updates.subscribe()
    }

    /// Returns how many local subscribers will see the update; zero is not
    /// an error.
    pub fn publish(&self, update: SessionBroadcast) -> usize {
        match &self.relay {
            Some(relay) => match relay.outgoing.send(update) {
                Ok(()) => self.updates.receiver_count(),
                Err(_) => 0,
            },
            None => self.updates.send(update).unwrap_or(0),
        }
    }

    /// Stops the relay tasks after writing queued updates. Affects every
    /// clone of this hub.
    pub async fn close(&self) {
        let Some(relay) = &self.relay else {
            return;
        };
        relay.cancel_token.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *relay.tasks.lock());
        for task in tasks {
            if let Err(error) = task.await {
                tracing::warn!(%error, "relay task ended abnormally");
            }
        }
    }
}
