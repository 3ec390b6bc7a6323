use crate::error::AppError;
use crate::market::types::TickRecord;
use sqlx::{Row, SqlitePool};
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

fn map_tick_row(row: &sqlx::sqlite::SqliteRow) -> Result<TickRecord, AppError> {
    Ok(TickRecord {
        symbol: row.try_get("symbol")?,
        price: row.try_get("price")?,
        timestamp: row.try_get("timestamp_ms")?,
    })
}

/// Symbol-keyed tick history. Every write evicts whatever falls outside the
/// newest `retention` records for that symbol.
#[derive(Debug, Clone)]
pub struct TickCache {
    pool: SqlitePool,
    retention: u32,
}

impl TickCache {
    pub fn new(pool: SqlitePool, retention: u32) -> Self {
        Self {
            pool,
            retention: retention.max(1),
        }
    }

    pub fn retention(&self) -> u32 {
        self.retention
    }

    pub async fn save(&self, symbol: &str, price: f64) -> Result<(), AppError> {
        self.save_record(&TickRecord {
            symbol: symbol.to_string(),
            price,
            timestamp: now_unix_ms(),
        })
        .await
    }

    pub async fn save_record(&self, record: &TickRecord) -> Result<(), AppError> {
        if !record.price.is_finite() {
            return Err(AppError::InvalidArgument(
                "tick price must be finite".to_string(),
            ));
        }

        let mut transaction = self.pool.begin().await?;

        sqlx::query("INSERT INTO tick_cache (symbol, price, timestamp_ms) VALUES (?, ?, ?)")
            .bind(&record.symbol)
            .bind(record.price)
            .bind(record.timestamp)
            .execute(&mut *transaction)
            .await?;

        sqlx::query(
            "DELETE FROM tick_cache WHERE symbol = ? AND id NOT IN ( \
               SELECT id FROM tick_cache WHERE symbol = ? \
               ORDER BY timestamp_ms DESC, id DESC LIMIT ? \
             )",
        )
        .bind(&record.symbol)
        .bind(&record.symbol)
        .bind(i64::from(self.retention))
        .execute(&mut *transaction)
        .await?;

        transaction.commit().await?;
        Ok(())
    }

    /// Most recent `limit` ticks for `symbol`, oldest first.
    pub async fn load(&self, symbol: &str, limit: u32) -> Result<Vec<TickRecord>, AppError> {
        let rows = sqlx::query(
            "SELECT symbol, price, timestamp_ms FROM tick_cache \
             WHERE symbol = ? \
             ORDER BY timestamp_ms DESC, id DESC \
             LIMIT ?",
        )
        .bind(symbol)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut ticks = Vec::with_capacity(rows.len());
        for row in rows.iter().rev() {
            ticks.push(map_tick_row(row)?);
        }

        Ok(ticks)
    }

    pub async fn last_known_price(&self, symbol: &str) -> Result<Option<f64>, AppError> {
        let latest = self.load(symbol, 1).await?;
        Ok(latest.last().map(|record| record.price))
    }
}
