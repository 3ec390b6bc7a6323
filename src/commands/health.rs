use crate::market::pipeline::MarketSession;
use crate::market::types::ConnectionStatus;
use crate::{error::AppError, state::AppState};
use serde::Serialize;
use sqlx::SqlitePool;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub db: &'static str,
    pub session_id: Option<String>,
    pub is_leader: bool,
    pub connection: ConnectionStatus,
}

pub async fn build_health_response(
    started_at: Instant,
    pool: &SqlitePool,
    session: Option<&MarketSession>,
) -> HealthResponse {
    let db_status = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(pool)
        .await
    {
        Ok(_) => "ok",
        Err(_) => "error",
    };

    let (session_id, is_leader, connection) = match session {
        Some(session) => {
            let snapshot = session.snapshot();
            (
                Some(snapshot.session_id),
                snapshot.is_leader,
                snapshot.connection_status.status,
            )
        }
        None => (None, false, ConnectionStatus::Disconnected),
    };

    HealthResponse {
        status: if db_status == "ok" { "ok" } else { "degraded" },
        uptime_ms: started_at.elapsed().as_millis(),
        db: db_status,
        session_id,
        is_leader,
        connection,
    }
}

pub async fn health(state: &AppState) -> Result<HealthResponse, AppError> {
    let session = state.session.lock().await;
    Ok(build_health_response(state.started_at, &state.db_pool, session.as_ref()).await)
}
