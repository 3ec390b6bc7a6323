use crate::market::leader::SessionHub;
use crate::market::pipeline::MarketSession;
use sqlx::SqlitePool;
use std::time::Instant;
use tokio::sync::Mutex;

pub struct AppState {
    pub started_at: Instant,
    pub db_pool: SqlitePool,
    pub hub: SessionHub,
    pub session: Mutex<Option<MarketSession>>,
}

impl AppState {
    pub fn new(db_pool: SqlitePool, hub: SessionHub) -> Self {
        Self {
            started_at: Instant::now(),
            db_pool,
            hub,
            session: Mutex::new(None),
        }
    }
}
