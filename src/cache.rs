use crate::config::RunConfig;
use crate::Result;
use chrono::{DateTime, Utc};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use futures::Future;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Manifests expire on the CDN side well before the general TTL.
const ATHOME_MAX_AGE: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    Manga,
    Chapter,
    Feed,
    AtHome,
    Group,
    Cover,
}

impl CacheKind {
    pub fn dir(&self) -> &'static str {
        match self {
            CacheKind::Manga => "manga",
            CacheKind::Chapter => "chapter",
            CacheKind::Feed => "feed",
            CacheKind::AtHome => "athome",
            CacheKind::Group => "group",
            CacheKind::Cover => "cover",
        }
    }

    fn max_age(&self, ttl: Duration) -> Duration {
        match self {
            CacheKind::AtHome => ttl.min(ATHOME_MAX_AGE),
            _ => ttl,
        }
    }
}

/// One stored catalog response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: String,
    pub kind: CacheKind,
    /// Written as an RFC 3339 string.
    pub issued_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapters: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub covers: Option<Vec<serde_json::Value>>,
}

impl CacheEntry {
    pub fn new(id: impl Into<String>, kind: CacheKind, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            kind,
            issued_at: Utc::now(),
            payload,
            chapters: None,
            covers: None,
        }
    }

    pub fn from_value<T: Serialize>(
        id: impl Into<String>,
        kind: CacheKind,
        value: &T,
    ) -> Result<Self> {
        Ok(Self::new(id, kind, serde_json::to_value(value)?))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn with_chapters<T: Serialize>(mut self, chapters: &[T]) -> Result<Self> {
        self.chapters = Some(to_values(chapters)?);
        Ok(self)
    }

    pub fn with_covers<T: Serialize>(mut self, covers: &[T]) -> Result<Self> {
        self.covers = Some(to_values(covers)?);
        Ok(self)
    }

    /// Attached chapter list, `None` when absent or not decodable as `T`.
    pub fn decode_chapters<T: DeserializeOwned>(&self) -> Option<Vec<T>> {
        from_values(self.chapters.as_ref()?)
    }

    pub fn decode_covers<T: DeserializeOwned>(&self) -> Option<Vec<T>> {
        from_values(self.covers.as_ref()?)
    }
}

fn to_values<T: Serialize>(items: &[T]) -> Result<Vec<serde_json::Value>> {
    items
        .iter()
        .map(|item| serde_json::to_value(item).map_err(Into::into))
        .collect()
}

fn from_values<T: DeserializeOwned>(values: &[serde_json::Value]) -> Option<Vec<T>> {
    values
        .iter()
        .map(|value| serde_json::from_value(value.clone()).ok())
        .collect()
}

/// gzip-compressed JSON files under `{root}/{kind}/{id}.json.gz`.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    root: PathBuf,
    ttl: Duration,
    force_refresh: bool,
}

impl ResponseCache {
    pub fn new(root: impl AsRef<Path>, ttl: Duration, force_refresh: bool) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            ttl,
            force_refresh,
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(config.cache_root(), config.cache_ttl(), config.force_refresh())
    }

    pub fn path(&self, id: &str, kind: CacheKind) -> PathBuf {
        self.root.join(kind.dir()).join(format!("{id}.json.gz"))
    }

    /// Any read problem yields `None`; a broken cache never stops a run.
    pub fn load(&self, id: &str, kind: CacheKind) -> Option<CacheEntry> {
        let path = self.path(id, kind);
        let file = fs::File::open(&path).ok()?;
        let mut json = Vec::new();
        if let Err(e) = GzDecoder::new(file).read_to_end(&mut json) {
            debug!("unreadable cache file {}: {e}", path.display());
            return None;
        }
        match serde_json::from_slice::<CacheEntry>(&json) {
            Ok(entry) if entry.kind == kind => Some(entry),
            Ok(_) => None,
            Err(e) => {
                debug!("malformed cache file {}: {e}", path.display());
                None
            }
        }
    }

    #[instrument(skip(self, entry), fields(id = %entry.id, kind = ?entry.kind))]
    pub fn save(&self, entry: &CacheEntry) -> Result<()> {
        let path = self.path(&entry.id, entry.kind);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut encoder = GzEncoder::new(fs::File::create(&tmp)?, Compression::default());
            encoder.write_all(&serde_json::to_vec(entry)?)?;
            encoder.finish()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn fresh(&self, entry: &CacheEntry) -> bool {
        self.fresh_at(entry, Utc::now())
    }

    pub fn fresh_at(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        if self.force_refresh {
            return false;
        }
        match now.signed_duration_since(entry.issued_at).to_std() {
            Ok(age) => age < entry.kind.max_age(self.ttl),
            // Issued "in the future": clock skew, still fresh.
            Err(_) => true,
        }
    }

    pub fn load_fresh(&self, id: &str, kind: CacheKind) -> Option<CacheEntry> {
        self.load(id, kind).filter(|entry| self.fresh(entry))
    }

    /// Serves a fresh entry, or runs `fetch` and stores what it returns.
    pub async fn get_or_fetch<T, F, Fut>(&self, id: &str, kind: CacheKind, fetch: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(entry) = self.load_fresh(id, kind) {
            match entry.decode() {
                Ok(value) => {
                    debug!(id, ?kind, "cache hit");
                    return Ok(value);
                }
                Err(e) => debug!(id, ?kind, "stale cache shape: {e}"),
            }
        }
        let value = fetch().await?;
        self.store(id, kind, &value);
        Ok(value)
    }

    /// Saves `value`, logging instead of failing.
    pub fn store<T: Serialize>(&self, id: &str, kind: CacheKind, value: &T) {
        let saved = CacheEntry::from_value(id, kind, value).and_then(|entry| self.save(&entry));
        if let Err(e) = saved {
            warn!(id, ?kind, "could not write cache: {e}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_save_then_load() {
        let tmpdir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(tmpdir.path(), Duration::from_secs(60), false);
        let entry = CacheEntry::new("m1", CacheKind::Manga, json!({"title": "x"}))
            .with_chapters(&[json!({"id": "c1"})])
            .unwrap();
        cache.save(&entry).unwrap();

        let path = tmpdir.path().join("manga").join("m1.json.gz");
        assert!(path.exists());
        let loaded = cache.load("m1", CacheKind::Manga).unwrap();
        assert_eq!(loaded.payload, json!({"title": "x"}));
        assert_eq!(loaded.decode_chapters::<serde_json::Value>().unwrap().len(), 1);
        assert!(loaded.decode_covers::<serde_json::Value>().is_none());
        assert!(cache.fresh(&loaded));
        assert!(cache.load("m1", CacheKind::Chapter).is_none());
    }

    #[test]
    fn test_issued_at_is_iso_string_on_disk() {
        let tmpdir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(tmpdir.path(), Duration::from_secs(60), false);
        cache
            .save(&CacheEntry::new("c1", CacheKind::Chapter, json!(null)))
            .unwrap();
        let mut json = String::new();
        GzDecoder::new(fs::File::open(cache.path("c1", CacheKind::Chapter)).unwrap())
            .read_to_string(&mut json)
            .unwrap();
        let raw: serde_json::Value = serde_json::from_str(&json).unwrap();
        let issued = raw["issued_at"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(issued).is_ok());
    }

    #[test]
    fn test_corrupt_files_are_empty() {
        let tmpdir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(tmpdir.path(), Duration::from_secs(60), false);
        let path = cache.path("bad", CacheKind::Feed);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"definitely not gzip").unwrap();
        assert!(cache.load("bad", CacheKind::Feed).is_none());
        assert!(cache.load("missing", CacheKind::Feed).is_none());
    }

    #[test]
    fn test_freshness_window() {
        let cache = ResponseCache::new("unused", Duration::from_secs(3600), false);
        let entry = CacheEntry::new("m1", CacheKind::Manga, json!({}));
        let issued = entry.issued_at;
        assert!(cache.fresh_at(&entry, issued + chrono::Duration::seconds(3599)));
        assert!(!cache.fresh_at(&entry, issued + chrono::Duration::seconds(3600)));

        let athome = CacheEntry::new("c1", CacheKind::AtHome, json!({}));
        assert!(!cache.fresh_at(&athome, athome.issued_at + chrono::Duration::minutes(11)));

        let forced = ResponseCache::new("unused", Duration::from_secs(3600), true);
        assert!(!forced.fresh_at(&entry, issued));
    }

    #[tokio::test]
    async fn test_get_or_fetch_hits_cache_second_time() {
        let tmpdir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(tmpdir.path(), Duration::from_secs(60), false);
        let first: Vec<u32> = cache
            .get_or_fetch("x", CacheKind::Feed, || async { Ok(vec![1, 2]) })
            .await
            .unwrap();
        let second: Vec<u32> = cache
            .get_or_fetch("x", CacheKind::Feed, || async {
                Err(crate::MangadexError::Cancelled)
            })
            .await
            .unwrap();
        assert_eq!(first, second);
    }
}
