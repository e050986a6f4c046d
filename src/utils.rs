use crate::model::ErrorResponse;
use axum::http::StatusCode;
use axum::Json;
use std::env;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn internal_error<E>(err: E) -> ApiError
where
    E: Display,
{
    tracing::error!("{}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "Internal server error".into(),
        }),
    )
}

pub async fn with_timeout<F: Future>(
    duration_in_mills: u64,
    task: F,
) -> Result<<F as Future>::Output, ApiError> {
    timeout(Duration::from_millis(duration_in_mills), task)
        .await
        .map_err(internal_error)
}

pub fn get_env(name: &str) -> String {
    env::var(name).unwrap_or_else(|_| panic!("Environment variable {} is required", name))
}
