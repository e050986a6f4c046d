pub mod collector;
pub mod dao;
pub mod model;
pub mod routes;
pub mod scheduler;
pub mod utils;

use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use routes::{get_hourly_stats, get_location_stats, get_overview, get_stats, health, sync_visit};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

const DATABASE_MAX_CONNECTIONS: u32 = 20;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    pub db_connection_pool: Pool<Sqlite>,
    clock: Clock,
}

impl AppState {
    pub fn new(db_connection_pool: Pool<Sqlite>) -> Self {
        Self::with_clock(db_connection_pool, Arc::new(Utc::now))
    }

    /// State whose notion of "now" comes from `clock` instead of the system time.
    pub fn with_clock(db_connection_pool: Pool<Sqlite>, clock: Clock) -> Self {
        Self {
            db_connection_pool,
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub async fn create_db_connection_pool(database_url: &str) -> Result<Pool<Sqlite>, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    let pool = SqlitePoolOptions::new()
        .max_connections(DATABASE_MAX_CONNECTIONS)
        .connect_with(options)
        .await?;
    dao::create_schema(&pool).await?;
    Ok(pool)
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/analytics/sync", post(sync_visit))
        .route("/api/analytics/stats", get(get_stats))
        .route("/api/analytics/location-stats", get(get_location_stats))
        .route("/api/analytics/overview", get(get_overview))
        .route("/api/analytics/hourly", get(get_hourly_stats))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
