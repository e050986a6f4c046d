use crate::dao;
use crate::model::{DailyStats, HourlyStats, LocationStats, Overview, SyncAck, VisitRecord};
use crate::utils::{internal_error, with_timeout, ApiError};
use crate::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

const DEFAULT_TIMEOUT: u64 = 5000;

pub async fn sync_visit(
    State(state): State<AppState>,
    Json(visit): Json<VisitRecord>,
) -> Result<Json<SyncAck>, ApiError> {
    with_timeout(
        DEFAULT_TIMEOUT,
        dao::save(state.db_connection_pool.clone(), &visit),
    )
    .await?
    .map_err(internal_error)?;
    tracing::debug!("Visit of {} persisted", visit.page_url);
    Ok(Json(SyncAck { success: true }))
}

pub async fn get_stats(State(state): State<AppState>) -> Result<Json<Vec<DailyStats>>, ApiError> {
    let stats = with_timeout(
        DEFAULT_TIMEOUT,
        dao::get_daily_stats(state.db_connection_pool.clone()),
    )
    .await?
    .map_err(internal_error)?;
    Ok(Json(stats))
}

pub async fn get_location_stats(
    State(state): State<AppState>,
) -> Result<Json<Vec<LocationStats>>, ApiError> {
    let stats = with_timeout(
        DEFAULT_TIMEOUT,
        dao::get_location_stats(state.db_connection_pool.clone()),
    )
    .await?
    .map_err(internal_error)?;
    Ok(Json(stats))
}

pub async fn get_overview(State(state): State<AppState>) -> Result<Json<Overview>, ApiError> {
    let overview = with_timeout(
        DEFAULT_TIMEOUT,
        dao::get_overview(state.db_connection_pool.clone(), state.now()),
    )
    .await?
    .map_err(internal_error)?;
    Ok(Json(overview))
}

pub async fn get_hourly_stats(
    State(state): State<AppState>,
) -> Result<Json<Vec<HourlyStats>>, ApiError> {
    let stats = with_timeout(
        DEFAULT_TIMEOUT,
        dao::get_hourly_stats(state.db_connection_pool.clone(), state.now()),
    )
    .await?
    .map_err(internal_error)?;
    Ok(Json(stats))
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
