//! Visitor-side collector.
//!
//! Records page views, keeps them in a local cache bucketed by day and page,
//! and delivers each one to the ingestion endpoint with bounded retries.
//! Nothing here reports failure to the caller: errors are logged and the
//! operation degrades to a no-op or an empty result.

pub mod cache;
pub mod geo;
pub mod navigation;
pub mod storage;
pub mod transport;

use crate::model::{GeoLocation, VisitRecord};
use cache::{BucketKey, CachedVisit, VisitCache};
use chrono::{NaiveDate, Utc};
use geo::{GeoResolver, HttpGeoResolver};
use navigation::Navigator;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use storage::LocalStorage;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use transport::{HttpTransport, Transport};
use url::Url;

const DEFAULT_API_ENDPOINT: &str = "http://localhost:3000/api/analytics/sync";

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub api_endpoint: Url,
    pub retry_times: u32,
    pub retry_base_delay: Duration,
    pub geo_timeout: Duration,
    pub delivery_timeout: Duration,
    pub retention_days: i64,
    pub storage_key: String,
    pub maintenance_interval: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            api_endpoint: Url::parse(DEFAULT_API_ENDPOINT).expect("default endpoint is a valid url"),
            retry_times: 3,
            retry_base_delay: Duration::from_secs(1),
            geo_timeout: Duration::from_secs(2),
            delivery_timeout: Duration::from_secs(2),
            retention_days: 30,
            storage_key: "pageVisits".to_string(),
            maintenance_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Wait before retry number `attempt + 1`: `base * 2^attempt`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

struct Inner {
    config: CollectorConfig,
    user_agent: String,
    cache: Mutex<VisitCache>,
    storage: Arc<dyn LocalStorage>,
    geo: Arc<dyn GeoResolver>,
    transport: Arc<dyn Transport>,
}

/// One collector per page session; clones share the same cache.
#[derive(Clone)]
pub struct Collector {
    inner: Arc<Inner>,
}

impl Collector {
    pub fn new(
        config: CollectorConfig,
        user_agent: &str,
        storage: Arc<dyn LocalStorage>,
        geo: Arc<dyn GeoResolver>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let cache = load_cache(storage.as_ref(), &config.storage_key);
        let collector = Self {
            inner: Arc::new(Inner {
                config,
                user_agent: user_agent.to_string(),
                cache: Mutex::new(cache),
                storage,
                geo,
                transport,
            }),
        };
        collector.clean_old_data();
        collector
    }

    /// Collector talking to the public geolocation services and the configured endpoint over HTTP.
    pub fn with_http(config: CollectorConfig, user_agent: &str, storage: Arc<dyn LocalStorage>) -> Self {
        let client = reqwest::Client::new();
        Self::new(
            config,
            user_agent,
            storage,
            Arc::new(HttpGeoResolver::new(client.clone())),
            Arc::new(HttpTransport::new(client)),
        )
    }

    /// Schedules recording of a visit on a detached task and returns at once.
    pub fn record_visit(&self, page_url: &str) {
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!("Analytics record skipped: no async runtime");
            return;
        };
        let collector = self.clone();
        let page_url = page_url.to_string();
        runtime.spawn(async move { collector.record_now(&page_url).await });
    }

    /// Records a fresh visit for every navigation the host page reports.
    pub fn attach(&self, navigator: &Navigator) {
        let collector = self.clone();
        navigator.subscribe(move |event| collector.record_visit(&event.path()));
    }

    /// Prunes the cache every `maintenance_interval` for as long as the collector lives.
    pub fn spawn_maintenance(&self) -> Option<JoinHandle<()>> {
        let runtime = Handle::try_current().ok()?;
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.maintenance_interval;
        Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                Collector { inner }.clean_old_data();
            }
        }))
    }

    pub fn stats_by_date(&self, date: NaiveDate) -> Vec<CachedVisit> {
        self.cache().stats_by_date(date)
    }

    pub fn today_stats(&self) -> Vec<CachedVisit> {
        self.stats_by_date(Utc::now().date_naive())
    }

    pub fn page_stats(&self, page_url: &str) -> Vec<CachedVisit> {
        self.cache().page_stats(page_url)
    }

    pub fn location_stats(&self) -> BTreeMap<String, usize> {
        self.cache().location_stats()
    }

    pub fn clean_old_data(&self) {
        let mut cache = self.cache();
        let removed = cache.prune(Utc::now(), self.inner.config.retention_days);
        if removed > 0 {
            tracing::debug!("Pruned {} visit buckets, {} visits kept", removed, cache.len());
        }
        self.persist(&cache);
    }

    fn cache(&self) -> MutexGuard<'_, VisitCache> {
        self.inner
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn record_now(&self, page_url: &str) {
        let location = self.resolve_location().await;
        let now = Utc::now();
        let record = VisitRecord::new(now, page_url, location, &self.inner.user_agent);
        let key = BucketKey::new(now.date_naive(), page_url);
        let index = {
            let mut cache = self.cache();
            let index = cache.push(key.clone(), CachedVisit::new(record.clone()));
            self.persist_or_prune(&mut cache);
            index
        };
        self.sync_to_server(&key, index, &record).await;
    }

    async fn resolve_location(&self) -> GeoLocation {
        match tokio::time::timeout(self.inner.config.geo_timeout, self.inner.geo.resolve()).await {
            Ok(Ok(location)) => location,
            Ok(Err(err)) => {
                tracing::warn!("Geo location fetch failed: {:#}", err);
                GeoLocation::unknown()
            }
            Err(_) => {
                tracing::warn!("Geo location fetch timed out");
                GeoLocation::unknown()
            }
        }
    }

    async fn sync_to_server(&self, key: &BucketKey, index: usize, record: &VisitRecord) {
        let body = match serde_json::to_string(record) {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!("Sync to server failed: {}", err);
                return;
            }
        };
        let config = &self.inner.config;
        let mut attempt = 0;
        loop {
            match self.deliver(&body).await {
                Ok(()) => {
                    self.mark_synced(key, index);
                    return;
                }
                Err(err) if attempt < config.retry_times => {
                    let delay = backoff_delay(config.retry_base_delay, attempt);
                    tracing::debug!("Visit delivery failed ({:#}), retrying in {:?}", err, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    tracing::warn!("Visit delivery abandoned after {} retries: {:#}", attempt, err);
                    return;
                }
            }
        }
    }

    async fn deliver(&self, body: &str) -> anyhow::Result<()> {
        let config = &self.inner.config;
        if self.inner.transport.send_beacon(&config.api_endpoint, body) {
            return Ok(());
        }
        self.inner
            .transport
            .post(&config.api_endpoint, body.to_string(), config.delivery_timeout)
            .await
    }

    fn mark_synced(&self, key: &BucketKey, index: usize) {
        let mut cache = self.cache();
        if cache.mark_synced(key, index) {
            self.persist(&cache);
        }
    }

    fn persist_or_prune(&self, cache: &mut VisitCache) {
        if let Err(err) = self.try_persist(cache) {
            tracing::warn!("Analytics storage save failed: {:#}", err);
            cache.prune(Utc::now(), self.inner.config.retention_days);
            self.persist(cache);
        }
    }

    fn persist(&self, cache: &VisitCache) {
        if let Err(err) = self.try_persist(cache) {
            tracing::warn!("Analytics storage save failed: {:#}", err);
        }
    }

    fn try_persist(&self, cache: &VisitCache) -> anyhow::Result<()> {
        let json = cache.to_json()?;
        self.inner
            .storage
            .set_item(&self.inner.config.storage_key, &json)
    }
}

fn load_cache(storage: &dyn LocalStorage, key: &str) -> VisitCache {
    let loaded = storage
        .get_item(key)
        .and_then(|stored| stored.map(|json| VisitCache::from_json(&json)).transpose());
    match loaded {
        Ok(cache) => cache.unwrap_or_default(),
        Err(err) => {
            tracing::warn!("Analytics storage load failed: {:#}", err);
            VisitCache::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use storage::MemoryStorage;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::Instant;

    struct FixedGeo(Option<GeoLocation>);

    #[async_trait]
    impl GeoResolver for FixedGeo {
        async fn resolve(&self) -> anyhow::Result<GeoLocation> {
            self.0.clone().ok_or_else(|| anyhow::anyhow!("lookup refused"))
        }
    }

    struct StalledGeo;

    #[async_trait]
    impl GeoResolver for StalledGeo {
        async fn resolve(&self) -> anyhow::Result<GeoLocation> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(nyc())
        }
    }

    #[derive(Default)]
    struct ScriptedTransport {
        failures: usize,
        beacon: bool,
        attempts: Mutex<Vec<Instant>>,
        bodies: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn failing(failures: usize) -> Self {
            Self {
                failures,
                ..Self::default()
            }
        }

        fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn send_beacon(&self, _endpoint: &Url, body: &str) -> bool {
            if self.beacon {
                self.bodies.lock().unwrap().push(body.to_string());
            }
            self.beacon
        }

        async fn post(&self, _endpoint: &Url, body: String, _timeout: Duration) -> anyhow::Result<()> {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.push(Instant::now());
            if attempts.len() <= self.failures {
                anyhow::bail!("connection refused");
            }
            self.bodies.lock().unwrap().push(body);
            Ok(())
        }
    }

    struct BrokenStorage;

    impl LocalStorage for BrokenStorage {
        fn get_item(&self, _key: &str) -> anyhow::Result<Option<String>> {
            anyhow::bail!("storage disabled")
        }

        fn set_item(&self, _key: &str, _value: &str) -> anyhow::Result<()> {
            anyhow::bail!("quota exceeded")
        }
    }

    /// Memory storage whose next write can be made to fail once.
    #[derive(Default)]
    struct FlakyStorage {
        items: MemoryStorage,
        fail_next: AtomicBool,
        writes: AtomicUsize,
    }

    impl LocalStorage for FlakyStorage {
        fn get_item(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.items.get_item(key)
        }

        fn set_item(&self, key: &str, value: &str) -> anyhow::Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail_next.swap(false, Ordering::SeqCst) {
                anyhow::bail!("quota exceeded");
            }
            self.items.set_item(key, value)
        }
    }

    fn expired_visit() -> (BucketKey, CachedVisit) {
        let at = Utc::now() - chrono::Duration::days(40);
        let key = BucketKey::new(at.date_naive(), "/old");
        (key, CachedVisit::new(VisitRecord::new(at, "/old", nyc(), "test-agent")))
    }

    fn nyc() -> GeoLocation {
        GeoLocation {
            ip: "1.2.3.4".into(),
            country: "US".into(),
            region: "NY".into(),
            city: "NYC".into(),
        }
    }

    fn collector(
        storage: Arc<dyn LocalStorage>,
        geo: Arc<dyn GeoResolver>,
        transport: Arc<dyn Transport>,
    ) -> Collector {
        Collector::new(CollectorConfig::default(), "test-agent", storage, geo, transport)
    }

    fn stored(storage: &MemoryStorage) -> VisitCache {
        VisitCache::from_json(&storage.get_item("pageVisits").unwrap().unwrap()).unwrap()
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn delivered_visit_is_marked_synced_and_persisted() {
        let storage = Arc::new(MemoryStorage::default());
        let transport = Arc::new(ScriptedTransport::default());
        let collector = collector(storage.clone(), Arc::new(FixedGeo(Some(nyc()))), transport.clone());

        collector.record_now("/home").await;

        let visits = collector.page_stats("/home");
        assert_eq!(visits.len(), 1);
        assert!(visits[0].is_synced());
        assert_eq!(visits[0].record().city, "NYC");
        assert_eq!(visits[0].record().user_agent, "test-agent");
        assert!(stored(&storage).page_stats("/home")[0].is_synced());

        let sent: serde_json::Value = serde_json::from_str(&transport.bodies.lock().unwrap()[0]).unwrap();
        assert_eq!(sent["pageUrl"], "/home");
        assert_eq!(sent["ip"], "1.2.3.4");
        assert!(sent.get("synced").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_back_off_geometrically_then_give_up() {
        let transport = Arc::new(ScriptedTransport::failing(usize::MAX));
        let collector = collector(
            Arc::new(MemoryStorage::default()),
            Arc::new(FixedGeo(Some(nyc()))),
            transport.clone(),
        );

        collector.record_now("/home").await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        let attempts = transport.attempts();
        assert_eq!(attempts.len(), 4);
        let gaps: Vec<Duration> = attempts.windows(2).map(|pair| pair[1] - pair[0]).collect();
        assert_eq!(gaps, vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]);
        assert!(!collector.page_stats("/home")[0].is_synced());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_after_transient_failures() {
        let transport = Arc::new(ScriptedTransport::failing(2));
        let collector = collector(
            Arc::new(MemoryStorage::default()),
            Arc::new(FixedGeo(Some(nyc()))),
            transport.clone(),
        );

        collector.record_now("/home").await;

        assert_eq!(transport.attempts().len(), 3);
        assert!(collector.page_stats("/home")[0].is_synced());
    }

    #[tokio::test]
    async fn accepted_beacon_counts_as_delivered() {
        let transport = Arc::new(ScriptedTransport {
            beacon: true,
            ..ScriptedTransport::default()
        });
        let collector = collector(
            Arc::new(MemoryStorage::default()),
            Arc::new(FixedGeo(Some(nyc()))),
            transport.clone(),
        );

        collector.record_now("/home").await;

        assert!(transport.attempts().is_empty());
        assert_eq!(transport.bodies.lock().unwrap().len(), 1);
        assert!(collector.page_stats("/home")[0].is_synced());
    }

    #[tokio::test]
    async fn failed_geo_lookup_falls_back_to_unknown() {
        let collector = collector(
            Arc::new(MemoryStorage::default()),
            Arc::new(FixedGeo(None)),
            Arc::new(ScriptedTransport::default()),
        );

        collector.record_now("/home").await;

        assert_eq!(collector.page_stats("/home")[0].record().ip, "unknown");
        assert_eq!(collector.location_stats().get("unknown-unknown"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_geo_lookup_is_cut_off() {
        let collector = collector(
            Arc::new(MemoryStorage::default()),
            Arc::new(StalledGeo),
            Arc::new(ScriptedTransport::default()),
        );
        let started = Instant::now();

        collector.record_now("/home").await;

        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(collector.page_stats("/home")[0].record().country, "unknown");
    }

    #[test]
    fn corrupt_storage_starts_empty() {
        let storage = Arc::new(MemoryStorage::default());
        storage.set_item("pageVisits", "{not json").unwrap();

        let collector = collector(
            storage.clone(),
            Arc::new(FixedGeo(Some(nyc()))),
            Arc::new(ScriptedTransport::default()),
        );

        assert!(collector.location_stats().is_empty());
        assert!(stored(&storage).is_empty());
    }

    #[test]
    fn initialization_prunes_expired_buckets() {
        let storage = Arc::new(MemoryStorage::default());
        let today = Utc::now().format("%Y-%m-%d");
        let visit = r#"{"timestamp":"2000-01-01T00:00:00.000Z","pageUrl":"/p","ip":"unknown","country":"unknown","region":"unknown","city":"unknown","userAgent":"ua","synced":true}"#;
        storage
            .set_item("pageVisits", &format!(r#"{{"2000-01-01:/old":[{visit}],"{today}:/new":[{visit}]}}"#))
            .unwrap();

        let collector = collector(
            storage.clone(),
            Arc::new(FixedGeo(Some(nyc()))),
            Arc::new(ScriptedTransport::default()),
        );

        assert!(collector.page_stats("/old").is_empty());
        assert_eq!(collector.today_stats().len(), 1);
        assert!(stored(&storage).page_stats("/old").is_empty());
    }

    #[tokio::test]
    async fn broken_storage_never_breaks_recording() {
        let collector = collector(
            Arc::new(BrokenStorage),
            Arc::new(FixedGeo(Some(nyc()))),
            Arc::new(ScriptedTransport::default()),
        );

        collector.record_now("/home").await;

        assert!(collector.page_stats("/home")[0].is_synced());
    }

    #[tokio::test]
    async fn failed_save_prunes_expired_buckets_and_saves_again() {
        let storage = Arc::new(FlakyStorage::default());
        let collector = collector(
            storage.clone(),
            Arc::new(FixedGeo(Some(nyc()))),
            Arc::new(ScriptedTransport::default()),
        );
        let (key, visit) = expired_visit();
        collector.cache().push(key, visit);
        let writes_before = storage.writes.load(Ordering::SeqCst);
        storage.fail_next.store(true, Ordering::SeqCst);

        collector.record_now("/home").await;

        // failed save, retried save, then the save after the acknowledgment
        assert_eq!(storage.writes.load(Ordering::SeqCst) - writes_before, 3);
        assert!(collector.page_stats("/old").is_empty());
        let stored = stored(&storage.items);
        assert!(stored.page_stats("/old").is_empty());
        assert_eq!(stored.page_stats("/home").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_prunes_expired_buckets_each_interval() {
        let storage = Arc::new(MemoryStorage::default());
        let collector = collector(
            storage.clone(),
            Arc::new(FixedGeo(Some(nyc()))),
            Arc::new(ScriptedTransport::default()),
        );
        let (key, visit) = expired_visit();
        collector.cache().push(key, visit);
        let maintenance = collector.spawn_maintenance().expect("runtime available");

        tokio::time::sleep(Duration::from_secs(30 * 60)).await;
        assert_eq!(collector.page_stats("/old").len(), 1);

        tokio::time::sleep(CollectorConfig::default().maintenance_interval).await;
        assert!(collector.page_stats("/old").is_empty());
        assert!(stored(&storage).page_stats("/old").is_empty());
        maintenance.abort();
    }

    #[tokio::test]
    async fn navigation_events_record_visits_in_the_background() {
        let navigator = Navigator::new();
        let collector = collector(
            Arc::new(MemoryStorage::default()),
            Arc::new(FixedGeo(Some(nyc()))),
            Arc::new(ScriptedTransport::default()),
        );
        collector.attach(&navigator);

        navigator.emit(navigation::NavigationEvent::Push("https://site.test/docs/intro?x=1".into()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while !collector.page_stats("/docs/intro").first().is_some_and(CachedVisit::is_synced) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("visit recorded");
        assert_eq!(collector.stats_by_date(Utc::now().date_naive()).len(), 1);
    }

    #[test]
    fn recording_without_a_runtime_is_a_no_op() {
        let collector = collector(
            Arc::new(MemoryStorage::default()),
            Arc::new(FixedGeo(Some(nyc()))),
            Arc::new(ScriptedTransport::default()),
        );

        collector.record_visit("/home");

        assert!(collector.page_stats("/home").is_empty());
        assert!(collector.spawn_maintenance().is_none());
    }
}
