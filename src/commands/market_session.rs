use crate::market::persistence::TickCache;
use crate::market::pipeline::{MarketSession, SessionSnapshot};
use crate::market::stats::LiquidationStats;
use crate::market::types::{StartSessionArgs, StreamEvent};
use crate::workers::compute::{RecordFilter, SortSpec};
use crate::workers::render::{ChartMode, Crosshair, RenderOutcome, Surface, Viewport};
use crate::{error::AppError, state::AppState};
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSessionStarted {
    pub session_id: String,
    pub symbols: Vec<String>,
    pub persisted_symbols: Vec<String>,
    pub replaced_previous: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSessionStopResult {
    pub stopped: bool,
}

pub async fn start_market_session(
    state: &AppState,
    args: Option<StartSessionArgs>,
) -> Result<MarketSessionStarted, AppError> {
    let config = args.unwrap_or_default().normalize()?;

    let existing = {
        let mut slot = state.session.lock().await;
        slot.take()
    };
    let replaced_previous = existing.is_some();
    if let Some(session) = existing {
        session.teardown().await;
    }

    let tick_cache = TickCache::new(state.db_pool.clone(), config.tick_retention);
    let symbols = config.symbols.clone();
    let persisted_symbols = config.persisted_symbols.clone();
    let session = MarketSession::create(state.hub.clone(), config, Some(tick_cache)).await?;
    let session_id = session.session_id().to_string();

    tracing::info!(
        session_id = %session_id,
        symbols = ?symbols,
        "market session started"
    );

    *state.session.lock().await = Some(session);

    Ok(MarketSessionStarted {
        session_id,
        symbols,
        persisted_symbols,
        replaced_previous,
    })
}

pub async fn stop_market_session(state: &AppState) -> Result<MarketSessionStopResult, AppError> {
    let existing = {
        let mut slot = state.session.lock().await;
        slot.take()
    };

    let stopped = if let Some(session) = existing {
        let session_id = session.session_id().to_string();
        session.teardown().await;
        tracing::info!(session_id = %session_id, "market session stopped");
        true
    } else {
        false
    };

    Ok(MarketSessionStopResult { stopped })
}

pub async fn market_session_snapshot(state: &AppState) -> Result<SessionSnapshot, AppError> {
    let slot = state.session.lock().await;
    let session = slot.as_ref().ok_or(AppError::SessionClosed)?;
    Ok(session.snapshot())
}

pub async fn market_session_sort(
    state: &AppState,
    sort: SortSpec,
    filter: Option<RecordFilter>,
) -> Result<Vec<StreamEvent>, AppError> {
    let slot = state.session.lock().await;
    let session = slot.as_ref().ok_or(AppError::SessionClosed)?;
    session.request_sort(sort, filter.unwrap_or_default()).await
}

pub async fn market_session_liquidation_stats(
    state: &AppState,
) -> Result<LiquidationStats, AppError> {
    let slot = state.session.lock().await;
    let session = slot.as_ref().ok_or(AppError::SessionClosed)?;
    session.request_liquidation_stats().await
}

pub async fn market_session_attach_surface(
    state: &AppState,
    viewport: Viewport,
) -> Result<(), AppError> {
    let surface = Surface::for_viewport(&viewport)?;
    let slot = state.session.lock().await;
    let session = slot.as_ref().ok_or(AppError::SessionClosed)?;
    session.attach_surface(surface).await
}

pub async fn market_session_draw(
    state: &AppState,
    symbol: &str,
    viewport: Viewport,
    mode: ChartMode,
    crosshair: Option<Crosshair>,
) -> RenderOutcome {
    let slot = state.session.lock().await;
    match slot.as_ref() {
        Some(session) => session.request_draw(symbol, viewport, mode, crosshair).await,
        None => RenderOutcome::Degraded {
            reason: AppError::SessionClosed.to_string(),
        },
    }
}

pub async fn market_session_reconnect(state: &AppState) -> Result<bool, AppError> {
    let slot = state.session.lock().await;
    let session = slot.as_ref().ok_or(AppError::SessionClosed)?;
    session.reconnect().await
}
