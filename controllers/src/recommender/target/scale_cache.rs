use std::collections::HashMap;

use chrono::{Duration, NaiveDateTime};
use parking_lot::Mutex;
use resources::objects::{object_reference::CrossVersionObjectReference, scale::Scale};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScaleCacheKey {
    pub namespace: String,
    /// `Kind.group`, e.g. `Deployment.apps`.
    pub group_kind: String,
    pub name: String,
}

/// Outcome of a scale query: Ok(None) when the object has no scale subresource
/// or doesn't exist, Err with the message of any other failure.
pub type ScaleResult = Result<Option<Scale>, String>;

#[derive(Debug, Clone)]
struct CacheEntry {
    /// The object the scale was read from, to query it again.
    target: CrossVersionObjectReference,
    result: ScaleResult,
    refresh_after: NaiveDateTime,
    delete_after: NaiveDateTime,
}

/// Cache of scale subresource queries.
///
/// Entries are refreshed in the background once stale,
/// and dropped when unused for `lifetime`.
pub struct ScaleCache {
    entries: Mutex<HashMap<ScaleCacheKey, CacheEntry>>,
    validity: Duration,
    lifetime: Duration,
    jitter_factor: f64,
}

impl ScaleCache {
    pub fn new(validity: Duration, lifetime: Duration, jitter_factor: f64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            validity,
            lifetime,
            jitter_factor,
        }
    }

    fn refresh_after(&self, now: NaiveDateTime) -> NaiveDateTime {
        let jitter = if self.jitter_factor > 0.0 {
            rand::random::<f64>() * self.jitter_factor
        } else {
            0.0
        };
        let validity_ms = self.validity.num_milliseconds() as f64;
        now + Duration::milliseconds((validity_ms * (1.0 + jitter)) as i64)
    }

    /// Cached result for `key`. A hit keeps the entry alive for another lifetime.
    pub fn get(&self, key: &ScaleCacheKey, now: NaiveDateTime) -> Option<ScaleResult> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        entry.delete_after = now + self.lifetime;
        Some(entry.result.to_owned())
    }

    /// Insert a new entry. An existing entry is left untouched.
    pub fn insert(
        &self,
        key: ScaleCacheKey,
        target: CrossVersionObjectReference,
        result: ScaleResult,
        now: NaiveDateTime,
    ) {
        let refresh_after = self.refresh_after(now);
        self.entries.lock().entry(key).or_insert(CacheEntry {
            target,
            result,
            refresh_after,
            delete_after: now + self.lifetime,
        });
    }

    /// Replace the result of an existing entry. Absent keys are not resurrected.
    pub fn refresh(&self, key: &ScaleCacheKey, result: ScaleResult, now: NaiveDateTime) {
        let refresh_after = self.refresh_after(now);
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.result = result;
            entry.refresh_after = refresh_after;
        }
    }

    /// Stale entries, with the object to query for each.
    pub fn keys_to_refresh(
        &self,
        now: NaiveDateTime,
    ) -> Vec<(ScaleCacheKey, CrossVersionObjectReference)> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.refresh_after < now)
            .map(|(key, entry)| (key.to_owned(), entry.target.to_owned()))
            .collect()
    }

    pub fn remove_expired(&self, now: NaiveDateTime) {
        self.entries.lock().retain(|key, entry| {
            let keep = entry.delete_after >= now;
            if !keep {
                tracing::debug!("Removing expired scale cache entry {:?}", key);
            }
            keep
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
