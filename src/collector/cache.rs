//! Visits kept on the visitor's side, bucketed by day and page.

use crate::model::VisitRecord;
use anyhow::{anyhow, Context};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketKey {
    pub date: NaiveDate,
    pub page_url: String,
}

impl BucketKey {
    pub fn new(date: NaiveDate, page_url: &str) -> Self {
        Self {
            date,
            page_url: page_url.to_string(),
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.date.format(DATE_FORMAT), self.page_url)
    }
}

impl FromStr for BucketKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (date, page_url) = s
            .split_once(':')
            .ok_or_else(|| anyhow!("bucket key {s:?} has no date separator"))?;
        let date = NaiveDate::parse_from_str(date, DATE_FORMAT)
            .with_context(|| format!("bucket key {s:?} has an invalid date"))?;
        Ok(Self::new(date, page_url))
    }
}

/// A recorded visit plus its delivery state. Only `synced` ever changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedVisit {
    #[serde(flatten)]
    record: VisitRecord,
    synced: bool,
}

impl CachedVisit {
    pub fn new(record: VisitRecord) -> Self {
        Self {
            record,
            synced: false,
        }
    }

    pub fn record(&self) -> &VisitRecord {
        &self.record
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct VisitCache {
    buckets: BTreeMap<BucketKey, Vec<CachedVisit>>,
}

impl VisitCache {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let raw: BTreeMap<String, Vec<CachedVisit>> =
            serde_json::from_str(json).context("decoding visit cache")?;
        let buckets = raw
            .into_iter()
            .map(|(key, visits)| Ok((key.parse::<BucketKey>()?, visits)))
            .collect::<anyhow::Result<BTreeMap<_, _>>>()?;
        Ok(Self { buckets })
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        let raw: BTreeMap<String, &Vec<CachedVisit>> = self
            .buckets
            .iter()
            .map(|(key, visits)| (key.to_string(), visits))
            .collect();
        serde_json::to_string(&raw).context("encoding visit cache")
    }

    /// Appends to the bucket and returns the visit's position inside it.
    pub fn push(&mut self, key: BucketKey, visit: CachedVisit) -> usize {
        let bucket = self.buckets.entry(key).or_default();
        bucket.push(visit);
        bucket.len() - 1
    }

    /// Returns false when the visit is gone (its bucket was pruned).
    pub fn mark_synced(&mut self, key: &BucketKey, index: usize) -> bool {
        match self.buckets.get_mut(key).and_then(|bucket| bucket.get_mut(index)) {
            Some(visit) => {
                visit.synced = true;
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn get(&self, key: &BucketKey, index: usize) -> Option<&CachedVisit> {
        self.buckets.get(key).and_then(|bucket| bucket.get(index))
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drops every bucket whose day started more than `retention_days` before `now`.
    pub fn prune(&mut self, now: DateTime<Utc>, retention_days: i64) -> usize {
        let before = self.buckets.len();
        let window = Duration::days(retention_days);
        self.buckets.retain(|key, _| {
            let day_start = key.date.and_time(NaiveTime::MIN).and_utc();
            now.signed_duration_since(day_start) <= window
        });
        before - self.buckets.len()
    }

    pub fn stats_by_date(&self, date: NaiveDate) -> Vec<CachedVisit> {
        self.buckets
            .iter()
            .filter(|(key, _)| key.date == date)
            .flat_map(|(_, visits)| visits.iter().cloned())
            .collect()
    }

    pub fn page_stats(&self, page_url: &str) -> Vec<CachedVisit> {
        self.buckets
            .iter()
            .filter(|(key, _)| key.page_url.contains(page_url))
            .flat_map(|(_, visits)| visits.iter().cloned())
            .collect()
    }

    /// Visit counts keyed by `country-city`.
    pub fn location_stats(&self) -> BTreeMap<String, usize> {
        let mut stats = BTreeMap::new();
        for visit in self.buckets.values().flatten() {
            let location = format!("{}-{}", visit.record.country, visit.record.city);
            *stats.entry(location).or_insert(0) += 1;
        }
        stats
    }
}
