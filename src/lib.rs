pub mod commands;
pub mod db;
pub mod error;
pub mod market;
pub mod state;
pub mod telemetry;
pub mod workers;

use commands::{
    app_info::app_info,
    health::health,
    market_session::{market_session_snapshot, start_market_session, stop_market_session},
};
use db::initialize_pool;
use error::AppError;
use market::leader::SessionHub;
use market::types::StartSessionArgs;
use state::AppState;
use std::time::Duration;

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(5);

pub fn run() -> Result<(), AppError> {
    telemetry::init_tracing();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve())
}

async fn serve() -> Result<(), AppError> {
    let info = app_info();
    tracing::info!(
        product = %info.product_name,
        version = %info.version,
        platform = %info.platform,
        "starting"
    );

    let db_pool = initialize_pool().await?;
    let hub = SessionHub::sqlite(db_pool.clone());
    let state = AppState::new(db_pool, hub);

    let started = start_market_session(&state, Some(StartSessionArgs::from_env())).await?;
    tracing::info!(session_id = %started.session_id, "session ready");

    let mut ticker = tokio::time::interval(STATUS_LOG_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(error) = result {
                    tracing::warn!(%error, "failed to listen for shutdown signal");
                }
                break;
            }
            _ = ticker.tick() => {
                match market_session_snapshot(&state).await {
                    Ok(snapshot) => {
                        let healthy = health(&state).await?;
                        tracing::info!(
                            leader = snapshot.is_leader,
                            status = snapshot.connection_status.status.as_str(),
                            attempt = snapshot.connection_status.attempt,
                            symbols = snapshot.prices.len(),
                            liquidations_usd = snapshot.derived_stats.total_usd,
                            db = healthy.db,
                            "session status"
                        );
                    }
                    Err(error) => tracing::warn!(%error, "session snapshot unavailable"),
                }
            }
        }
    }

    tracing::info!("shutting down");
    stop_market_session(&state).await?;
    state.hub.close().await;
    state.db_pool.close().await;
    Ok(())
}
