use crate::cache::{CacheEntry, CacheKind, ResponseCache};
use crate::catalog::Catalog;
use crate::config::{RunConfig, UPLOADS_ROOT};
use crate::export::sanitize;
use crate::model::{Cover, Manga};
use crate::network::ImageNetwork;
use crate::Result;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Saves cover artwork next to a title's chapters, under `{title}/covers/`.
pub struct CoverDownloader {
    catalog: Arc<dyn Catalog>,
    network: Arc<dyn ImageNetwork>,
    cache: Arc<ResponseCache>,
    config: Arc<RunConfig>,
}

impl CoverDownloader {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        network: Arc<dyn ImageNetwork>,
        cache: Arc<ResponseCache>,
        config: Arc<RunConfig>,
    ) -> Self {
        Self {
            catalog,
            network,
            cache,
            config,
        }
    }

    pub fn dir(&self, title: &str) -> PathBuf {
        self.config
            .download_root()
            .join(sanitize(title))
            .join("covers")
    }

    /// `{volume}-{file}`, or `cover-{file}` when the cover has no volume.
    pub fn file_name(cover: &Cover) -> String {
        let volume = cover
            .attributes
            .volume
            .as_deref()
            .filter(|v| !v.is_empty())
            .unwrap_or("cover");
        sanitize(&format!("{volume}-{}", cover.attributes.file_name))
    }

    async fn covers(&self, manga_id: &str) -> Result<Vec<Cover>> {
        if let Some(covers) = self
            .cache
            .load_fresh(manga_id, CacheKind::Cover)
            .and_then(|entry| entry.decode_covers::<Cover>())
        {
            return Ok(covers);
        }
        let covers = self.catalog.list_covers(manga_id).await?;
        let saved = CacheEntry::new(manga_id, CacheKind::Cover, serde_json::Value::Null)
            .with_covers(&covers)
            .and_then(|entry| self.cache.save(&entry));
        if let Err(e) = saved {
            warn!("could not cache covers of {manga_id}: {e}");
        }
        Ok(covers)
    }

    /// Returns how many new covers were written.
    #[instrument(skip(self, manga), fields(manga = %manga.id))]
    pub async fn download(&self, manga: &Manga, title: &str) -> Result<usize> {
        let covers = self.covers(&manga.id).await?;
        let dir = self.dir(title);
        fs::create_dir_all(&dir)?;

        let mut written = 0;
        for cover in &covers {
            let path = dir.join(Self::file_name(cover));
            if fs::metadata(&path).is_ok_and(|m| m.len() > 0) {
                debug!(path = %path.display(), "cover already saved");
                continue;
            }
            let url = format!("{UPLOADS_ROOT}/covers/{}/{}", manga.id, cover.attributes.file_name);
            match self.network.get(&url, self.config.page_timeout()).await {
                Ok(page) => {
                    let tmp = path.with_extension("part");
                    fs::write(&tmp, &page.bytes)?;
                    fs::rename(&tmp, &path)?;
                    written += 1;
                }
                Err(e) => warn!("cover {} failed: {e}", cover.attributes.file_name),
            }
        }
        info!("{written} new cover(s) for {title}");
        Ok(written)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cover_file_name() {
        let cover: Cover = serde_json::from_value(json!({
            "id": "x",
            "attributes": {"volume": "2", "fileName": "abc.jpg"}
        }))
        .unwrap();
        assert_eq!(CoverDownloader::file_name(&cover), "2-abc.jpg");
        let cover: Cover = serde_json::from_value(json!({
            "id": "y",
            "attributes": {"volume": null, "fileName": "def.png"}
        }))
        .unwrap();
        assert_eq!(CoverDownloader::file_name(&cover), "cover-def.png");
    }
}
