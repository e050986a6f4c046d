use crate::dao::delete_expired;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite};
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};

pub const CLEANING_JOB_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// One retention pass. Failures are logged and left for the next tick.
pub async fn purge_expired(db_connection_pool: Pool<Sqlite>, now: DateTime<Utc>) -> Option<u64> {
    match delete_expired(db_connection_pool, now).await {
        Ok(deleted) => {
            if deleted > 0 {
                tracing::info!("Cleaned {} old records", deleted);
            }
            Some(deleted)
        }
        Err(err) => {
            tracing::error!("Error cleaning old data: {}", err);
            None
        }
    }
}

pub async fn configure_scheduler(
    db_connection_pool: Pool<Sqlite>,
) -> Result<JobScheduler, JobSchedulerError> {
    let scheduler = JobScheduler::new().await?;
    scheduler
        .add(create_cleaning_job(CLEANING_JOB_INTERVAL, db_connection_pool)?)
        .await?;
    scheduler.start().await?;
    Ok(scheduler)
}

fn create_cleaning_job(
    interval: Duration,
    db_connection_pool: Pool<Sqlite>,
) -> Result<Job, JobSchedulerError> {
    Job::new_repeated_async(interval, move |_, _| {
        let connection_pool = db_connection_pool.clone();
        Box::pin(async move {
            purge_expired(connection_pool, Utc::now()).await;
        })
    })
}
