use crate::model::{DailyStats, HourlyStats, LocationStats, Overview, VisitRecord};
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteQueryResult;
use sqlx::{Error, Pool, Sqlite};

pub const RETENTION_DAYS: i64 = 30;
const DAILY_STATS_LIMIT: i64 = 30;
const LOCATION_STATS_LIMIT: i64 = 100;
const SQLITE_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
const SQLITE_DATE_FORMAT: &str = "%Y-%m-%d";

/// Oldest instant still inside the retention window, in the shape of
/// `strftime('%Y-%m-%d %H:%M:%f', timestamp)` so the two compare as text.
pub fn retention_cutoff(now: DateTime<Utc>) -> String {
    (now - Duration::days(RETENTION_DAYS))
        .format(SQLITE_DATETIME_FORMAT)
        .to_string()
}

pub async fn create_schema(db_connection_pool: &Pool<Sqlite>) -> Result<SqliteQueryResult, Error> {
    sqlx::query(
        r#"
              create table if not exists visits (
                  id integer primary key autoincrement,
                  timestamp text,
                  page_url text,
                  ip text,
                  country text,
                  region text,
                  city text,
                  user_agent text,
                  created_at datetime default current_timestamp
              )
            "#,
    )
    .execute(db_connection_pool)
    .await
}

pub async fn save(
    db_connection_pool: Pool<Sqlite>,
    visit: &VisitRecord,
) -> Result<SqliteQueryResult, Error> {
    sqlx::query(
        r#"
              insert into visits(timestamp, page_url, ip, country, region, city, user_agent)
              values ($1, $2, $3, $4, $5, $6, $7)
            "#,
    )
    .bind(&visit.timestamp)
    .bind(&visit.page_url)
    .bind(&visit.ip)
    .bind(&visit.country)
    .bind(&visit.region)
    .bind(&visit.city)
    .bind(&visit.user_agent)
    .execute(&db_connection_pool)
    .await
}

pub async fn get_daily_stats(db_connection_pool: Pool<Sqlite>) -> Result<Vec<DailyStats>, Error> {
    sqlx::query_as(
        r#"
              select date(timestamp) as date, count(*) as visits, count(distinct ip) as unique_visitors, page_url
              from visits
              group by date(timestamp), page_url
              order by date desc, page_url
              limit $1
            "#,
    )
    .bind(DAILY_STATS_LIMIT)
    .fetch_all(&db_connection_pool)
    .await
}

pub async fn get_location_stats(
    db_connection_pool: Pool<Sqlite>,
) -> Result<Vec<LocationStats>, Error> {
    sqlx::query_as(
        r#"
              select country, city, count(*) as visits
              from visits
              group by country, city
              order by visits desc, country, city
              limit $1
            "#,
    )
    .bind(LOCATION_STATS_LIMIT)
    .fetch_all(&db_connection_pool)
    .await
}

pub async fn get_overview(
    db_connection_pool: Pool<Sqlite>,
    now: DateTime<Utc>,
) -> Result<Overview, Error> {
    sqlx::query_as(
        r#"
              select
                  count(*) as total_visits,
                  count(distinct ip) as unique_visitors,
                  count(distinct page_url) as total_pages,
                  count(distinct country) as total_countries
              from visits
              where strftime('%Y-%m-%d %H:%M:%f', timestamp) >= $1
            "#,
    )
    .bind(retention_cutoff(now))
    .fetch_one(&db_connection_pool)
    .await
}

pub async fn get_hourly_stats(
    db_connection_pool: Pool<Sqlite>,
    now: DateTime<Utc>,
) -> Result<Vec<HourlyStats>, Error> {
    sqlx::query_as(
        r#"
              select strftime('%H', timestamp) as hour, count(*) as visits
              from visits
              where date(timestamp) = $1
              group by hour
              order by hour
            "#,
    )
    .bind(now.format(SQLITE_DATE_FORMAT).to_string())
    .fetch_all(&db_connection_pool)
    .await
}

/// Deletes every visit older than the retention window and returns how many went.
pub async fn delete_expired(
    db_connection_pool: Pool<Sqlite>,
    now: DateTime<Utc>,
) -> Result<u64, Error> {
    sqlx::query("delete from visits where strftime('%Y-%m-%d %H:%M:%f', timestamp) < $1")
        .bind(retention_cutoff(now))
        .execute(&db_connection_pool)
        .await
        .map(|result| result.rows_affected())
}
