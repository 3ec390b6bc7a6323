//! Leader → follower updates carried through the shared sqlite database, so
//! followers in other processes see what the leader flushed.

use crate::error::AppError;
use crate::market::leader::SessionBroadcast;
use crate::market::persistence::now_unix_ms;
use sqlx::SqlitePool;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub const RELAY_POLL_INTERVAL: Duration = Duration::from_millis(50);
const RELAY_READ_BATCH: i64 = 256;
/// Rows a fresh reader replays so it starts from the leader's recent state.
const RELAY_REPLAY_ROWS: i64 = 64;
const RELAY_RETENTION_ROWS: i64 = 4_096;
const RELAY_PRUNE_EVERY: u64 = 256;

#[derive(Debug, Default)]
pub struct RelayPage {
    /// Highest row id read, decodable or not.
    pub cursor: i64,
    pub rows: usize,
    pub updates: Vec<SessionBroadcast>,
}

#[derive(Debug, Clone)]
pub struct SqliteRelay {
    pool: SqlitePool,
}

impl SqliteRelay {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, update: &SessionBroadcast) -> Result<i64, AppError> {
        let payload = simd_json::serde::to_string(update)?;
        let result = sqlx::query(
            "INSERT INTO session_relay (origin, payload, created_at_ms) VALUES (?, ?, ?)",
        )
        .bind(update.origin())
        .bind(payload)
        .bind(now_unix_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn latest_id(&self) -> Result<i64, AppError> {
        let latest = sqlx::query_scalar::<_, Option<i64>>("SELECT MAX(id) FROM session_relay")
            .fetch_one(&self.pool)
            .await?;
        Ok(latest.unwrap_or(0))
    }

    pub async fn read_after(&self, cursor: i64, limit: i64) -> Result<RelayPage, AppError> {
        let rows = sqlx::query_as::<_, (i64, String)>(
            "SELECT id, payload FROM session_relay WHERE id > ? ORDER BY id ASC LIMIT ?",
        )
        .bind(cursor)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut page = RelayPage {
            cursor,
            rows: rows.len(),
            updates: Vec::with_capacity(rows.len()),
        };
        for (id, payload) in rows {
            page.cursor = page.cursor.max(id);
            let mut bytes = payload.into_bytes();
            match simd_json::serde::from_slice::<SessionBroadcast>(&mut bytes) {
                Ok(update) => page.updates.push(update),
                Err(error) => tracing::warn!(id, %error, "skipping undecodable relay row"),
            }
        }
        Ok(page)
    }

    /// Keeps the newest `keep_rows` rows.
    pub async fn prune(&self, keep_rows: i64) -> Result<u64, AppError> {
        let result = sqlx::query(
            "DELETE FROM session_relay \
             WHERE id <= (SELECT COALESCE(MAX(id), 0) FROM session_relay) - ?",
        )
        .bind(keep_rows)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

async fn write_update(relay: &SqliteRelay, update: &SessionBroadcast, written: &mut u64) {
    if let Err(error) = relay.append(update).await {
        tracing::warn!(origin = %update.origin(), %error, "relay write failed");
        return;
    }
    *written += 1;
    if *written % RELAY_PRUNE_EVERY == 0 {
        if let Err(error) = relay.prune(RELAY_RETENTION_ROWS).await {
            tracing::warn!(%error, "relay prune failed");
        }
    }
}

/// Appends published updates in order. Updates still queued at cancellation
/// are written before returning.
pub async fn run_relay_writer(
    relay: SqliteRelay,
    mut outgoing: mpsc::UnboundedReceiver<SessionBroadcast>,
    cancel_token: CancellationToken,
) {
    let mut written = 0_u64;
    loop {
        let update = tokio::select! {
            _ = cancel_token.cancelled() => break,
            next = outgoing.recv() => next,
        };
        let Some(update) = update else {
            return;
        };
        write_update(&relay, &update, &mut written).await;
    }

    while let Ok(update) = outgoing.try_recv() {
        write_update(&relay, &update, &mut written).await;
    }
}

/// Polls for rows past the cursor and re-broadcasts them in-process.
pub async fn run_relay_reader(
    relay: SqliteRelay,
    updates: broadcast::Sender<SessionBroadcast>,
    cancel_token: CancellationToken,
) {
    let mut cursor = match relay.latest_id().await {
        Ok(latest) => (latest - RELAY_REPLAY_ROWS).max(0),
        Err(error) => {
            tracing::warn!(%error, "relay cursor lookup failed, replaying retained rows");
            0
        }
    };
    let mut ticker = tokio::time::interval(RELAY_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        loop {
            match relay.read_after(cursor, RELAY_READ_BATCH).await {
                Ok(page) => {
                    cursor = page.cursor;
                    for update in page.updates {
                        let _ = updates.send(update);
                    }
                    if page.rows < RELAY_READ_BATCH as usize {
                        break;
                    }
                }
                Err(AppError::Sqlx(sqlx::Error::PoolClosed)) => return,
                Err(error) => {
                    tracing::warn!(cursor, %error, "relay poll failed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::initialize_pool_from_path;
    use crate::db::tests::unique_db_path;
    use crate::market::types::{Direction, FeedEvent, StreamEvent};

    fn flush(origin: &str, price: f64) -> SessionBroadcast {
        SessionBroadcast::Flush {
            origin: origin.to_string(),
            batch: vec![FeedEvent::Ticker(StreamEvent {
                symbol: "BTCUSDT".to_string(),
                price,
                change: 0.0,
                high: price,
                low: price,
                volume: 1.0,
                timestamp: 1_700_000_000_000,
                direction: Direction::Up,
            })],
        }
    }

    #[tokio::test]
    async fn appended_updates_read_back_in_order() {
        let db_path = unique_db_path("relay-order");
        let pool = initialize_pool_from_path(&db_path)
            .await
            .expect("pool initialization should succeed");
        let relay = SqliteRelay::new(pool.clone());

        let first = relay.append(&flush("tab-1", 50_000.0)).await.expect("append");
        let second = relay.append(&flush("tab-1", 50_100.0)).await.expect("append");
        assert!(second > first);

        let page = relay.read_after(0, 10).await.expect("read");
        assert_eq!(page.rows, 2);
        assert_eq!(page.cursor, second);
        assert_eq!(page.updates, vec![flush("tab-1", 50_000.0), flush("tab-1", 50_100.0)]);

        let empty = relay.read_after(second, 10).await.expect("read");
        assert_eq!(empty.rows, 0);
        assert_eq!(empty.cursor, second);

        pool.close().await;
        let _ = std::fs::remove_file(db_path);
    }

    #[tokio::test]
    async fn undecodable_rows_are_skipped_but_consumed() {
        let db_path = unique_db_path("relay-garbage");
        let pool = initialize_pool_from_path(&db_path)
            .await
            .expect("pool initialization should succeed");
        let relay = SqliteRelay::new(pool.clone());

        sqlx::query("INSERT INTO session_relay (origin, payload, created_at_ms) VALUES (?, ?, ?)")
            .bind("tab-9")
            .bind("{not json")
            .bind(0_i64)
            .execute(&pool)
            .await
            .expect("raw insert");
        let valid = relay.append(&flush("tab-1", 42.0)).await.expect("append");

        let page = relay.read_after(0, 10).await.expect("read");
        assert_eq!(page.rows, 2);
        assert_eq!(page.cursor, valid);
        assert_eq!(page.updates, vec![flush("tab-1", 42.0)]);

        pool.close().await;
        let _ = std::fs::remove_file(db_path);
    }

    #[tokio::test]
    async fn prune_keeps_newest_rows() {
        let db_path = unique_db_path("relay-prune");
        let pool = initialize_pool_from_path(&db_path)
            .await
            .expect("pool initialization should succeed");
        let relay = SqliteRelay::new(pool.clone());

        let mut last = 0;
        for index in 0..10 {
            last = relay
                .append(&flush("tab-1", 100.0 + index as f64))
                .await
                .expect("append");
        }
        assert_eq!(relay.prune(3).await.expect("prune"), 7);

        let page = relay.read_after(0, 100).await.expect("read");
        assert_eq!(page.rows, 3);
        assert_eq!(page.cursor, last);
        assert_eq!(relay.latest_id().await.expect("latest"), last);

        pool.close().await;
        let _ = std::fs::remove_file(db_path);
    }

    #[tokio::test]
    async fn writer_flushes_queue_on_cancellation() {
        let db_path = unique_db_path("relay-writer");
        let pool = initialize_pool_from_path(&db_path)
            .await
            .expect("pool initialization should succeed");
        let relay = SqliteRelay::new(pool.clone());
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();

        for index in 0..5 {
            outgoing_tx
                .send(flush("tab-1", 10.0 * index as f64))
                .expect("writer should be listening");
        }
        cancel_token.cancel();
        run_relay_writer(relay.clone(), outgoing_rx, cancel_token).await;

        let page = relay.read_after(0, 100).await.expect("read");
        assert_eq!(page.updates.len(), 5);

        pool.close().await;
        let _ = std::fs::remove_file(db_path);
    }
}
