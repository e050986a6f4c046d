use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sqlx::FromRow;

pub const UNKNOWN: &str = "unknown";

fn unknown() -> String {
    UNKNOWN.to_string()
}

fn unknown_if_null<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_else(unknown))
}

/// One page view as it travels from the collector to the aggregator.
///
/// Contents are trusted as sent; only `timestamp` and `pageUrl` must be present.
/// Absent or null location and agent fields read as `"unknown"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitRecord {
    pub timestamp: String,
    pub page_url: String,
    #[serde(default = "unknown", deserialize_with = "unknown_if_null")]
    pub ip: String,
    #[serde(default = "unknown", deserialize_with = "unknown_if_null")]
    pub country: String,
    #[serde(default = "unknown", deserialize_with = "unknown_if_null")]
    pub region: String,
    #[serde(default = "unknown", deserialize_with = "unknown_if_null")]
    pub city: String,
    #[serde(default = "unknown", deserialize_with = "unknown_if_null")]
    pub user_agent: String,
}

impl VisitRecord {
    pub fn new(
        timestamp: DateTime<Utc>,
        page_url: &str,
        location: GeoLocation,
        user_agent: &str,
    ) -> Self {
        Self {
            timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            page_url: page_url.to_string(),
            ip: location.ip,
            country: location.country,
            region: location.region,
            city: location.city,
            user_agent: user_agent.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub ip: String,
    pub country: String,
    pub region: String,
    pub city: String,
}

impl GeoLocation {
    pub fn unknown() -> Self {
        Self {
            ip: unknown(),
            country: unknown(),
            region: unknown(),
            city: unknown(),
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, FromRow)]
pub struct DailyStats {
    pub date: Option<String>,
    pub visits: i64,
    pub unique_visitors: i64,
    #[serde(rename = "pageUrl")]
    pub page_url: String,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, FromRow)]
pub struct LocationStats {
    pub country: String,
    pub city: String,
    pub visits: i64,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Overview {
    pub total_visits: i64,
    pub unique_visitors: i64,
    pub total_pages: i64,
    pub total_countries: i64,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, FromRow)]
pub struct HourlyStats {
    pub hour: Option<String>,
    pub visits: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncAck {
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
