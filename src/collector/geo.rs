use crate::model::{GeoLocation, UNKNOWN};
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;

const IP_LOOKUP_URL: &str = "https://api.ipify.org?format=json";
const GEO_LOOKUP_URL: &str = "https://ipapi.co/json/";

/// Source of the visitor's public address and coarse location.
#[async_trait]
pub trait GeoResolver: Send + Sync {
    async fn resolve(&self) -> anyhow::Result<GeoLocation>;
}

#[derive(Deserialize)]
struct IpLookup {
    ip: String,
}

#[derive(Deserialize)]
struct GeoLookup {
    country_name: Option<String>,
    region: Option<String>,
    city: Option<String>,
}

fn or_unknown(value: Option<String>) -> String {
    value
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

/// Resolves through the public ipify and ipapi services, queried concurrently.
pub struct HttpGeoResolver {
    client: reqwest::Client,
    ip_lookup_url: String,
    geo_lookup_url: String,
}

impl HttpGeoResolver {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_urls(client, IP_LOOKUP_URL, GEO_LOOKUP_URL)
    }

    pub fn with_urls(client: reqwest::Client, ip_lookup_url: &str, geo_lookup_url: &str) -> Self {
        Self {
            client,
            ip_lookup_url: ip_lookup_url.to_string(),
            geo_lookup_url: geo_lookup_url.to_string(),
        }
    }

    async fn fetch<T: for<'de> Deserialize<'de>>(&self, url: &str) -> anyhow::Result<T> {
        self.client
            .get(url)
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?
            .error_for_status()?
            .json::<T>()
            .await
            .with_context(|| format!("decoding response of {url}"))
    }
}

#[async_trait]
impl GeoResolver for HttpGeoResolver {
    async fn resolve(&self) -> anyhow::Result<GeoLocation> {
        let (ip, geo) = tokio::try_join!(
            self.fetch::<IpLookup>(&self.ip_lookup_url),
            self.fetch::<GeoLookup>(&self.geo_lookup_url),
        )?;
        Ok(GeoLocation {
            ip: ip.ip,
            country: or_unknown(geo.country_name),
            region: or_unknown(geo.region),
            city: or_unknown(geo.city),
        })
    }
}
