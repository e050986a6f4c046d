use axum::serve;
use dotenvy::dotenv;
use tokio::net::TcpListener;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use visit_analytics::scheduler::configure_scheduler;
use visit_analytics::utils::get_env;
use visit_analytics::{create_db_connection_pool, create_router, AppState};

const DEFAULT_TRACING_LEVEL: &str = "visit_analytics=debug,tower_http=debug";

#[tokio::main]
async fn main() {
    _ = dotenv();
    let database_url = get_env("DATABASE_URL");
    let server_address = get_env("SERVER_ADDRESS");
    configure_tracing();
    let db_connection_pool = create_db_connection_pool(&database_url)
        .await
        .expect("Creating database connection pool failed");
    let _scheduler = configure_scheduler(db_connection_pool.clone())
        .await
        .expect("Starting retention scheduler failed");
    let listener = create_listener(&server_address).await;
    let router = create_router(AppState::new(db_connection_pool));
    serve(listener, router)
        .await
        .expect("Server failed to start");
}

fn configure_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or(DEFAULT_TRACING_LEVEL.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn create_listener(server_address: &str) -> TcpListener {
    let listener = TcpListener::bind(&server_address)
        .await
        .expect("Creating tcp listener failed");
    tracing::info!("Analytics server listening on address: {}", server_address);
    listener
}
