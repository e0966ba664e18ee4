use crate::cache::{CacheEntry, CacheKind, ResponseCache};
use crate::catalog::{Catalog, ChapterFilter, ParentKind};
use crate::config::RunConfig;
use crate::cover::CoverDownloader;
use crate::engine::{ChapterEngine, ChapterOutcome, ChapterRequest};
use crate::ident::{Identifier, IdentifierKind};
use crate::model::{Chapter, Manga};
use crate::prefix::{prefix_map, volume_listing};
use crate::{MangadexError, Result};
use serde_json::json;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceBuilder, ServiceExt};
use tracing::{debug, info, instrument, warn};

/// Largest page the feed endpoints hand out.
pub const FEED_LIMIT: u32 = 500;
/// Every this many feed pages the driver takes the longer cool-down.
const COOLDOWN_EVERY: u32 = 5;
const SEARCH_LIMIT: u32 = 10;

/// Walks a paginated chapter listing, serving it from the cache while fresh.
#[instrument(skip(catalog, cache, config, filter))]
pub(crate) async fn fetch_feed(
    catalog: &dyn Catalog,
    cache: &ResponseCache,
    config: &RunConfig,
    parent: ParentKind,
    id: &str,
    filter: &ChapterFilter,
) -> Result<Vec<Chapter>> {
    let key = format!("{parent}-{id}-{}", filter.key());
    if let Some(chapters) = cache
        .load_fresh(&key, CacheKind::Feed)
        .and_then(|entry| entry.decode_chapters::<Chapter>())
    {
        debug!(chapters = chapters.len(), "feed served from cache");
        return Ok(chapters);
    }

    let mut chapters = Vec::new();
    let mut offset = 0;
    let mut page = 0;
    loop {
        if page > 0 && page % COOLDOWN_EVERY == 0 {
            sleep(config.page_cooldown()).await;
        }
        let batch = catalog
            .list_chapters(parent, id, filter, offset, FEED_LIMIT)
            .await?;
        page += 1;
        let received = batch.chapters.len() as u32;
        chapters.extend(batch.chapters);
        offset += received;
        if received == 0 || offset >= batch.total {
            break;
        }
    }
    debug!(chapters = chapters.len(), pages = page, "feed fetched");

    let saved = CacheEntry::new(
        &key,
        CacheKind::Feed,
        json!({"parent": parent.to_string(), "id": id, "total": chapters.len()}),
    )
    .with_chapters(&chapters)
    .and_then(|entry| cache.save(&entry));
    if let Err(e) = saved {
        warn!("could not cache feed {key}: {e}");
    }
    Ok(chapters)
}

/// Drops repeated chapter ids.
fn unique_ids(chapters: Vec<Chapter>) -> Vec<Chapter> {
    let mut ids = HashSet::new();
    chapters
        .into_iter()
        .filter(|chapter| ids.insert(chapter.id.clone()))
        .collect()
}

/// Drops repeated chapter ids, then repeated releases of the same title:
/// one (manga, volume, chapter, groups) combination is kept once.
pub(crate) fn dedupe(chapters: Vec<Chapter>) -> Vec<Chapter> {
    let mut releases = HashSet::new();
    unique_ids(chapters)
        .into_iter()
        .filter(|chapter| {
            let mut groups: Vec<&str> = chapter.groups().map(|g| g.id.as_str()).collect();
            groups.sort_unstable();
            let release = (
                chapter.manga_id().unwrap_or_default().to_string(),
                chapter.volume().to_string(),
                chapter.label().to_string(),
                groups.join(","),
            );
            releases.insert(release)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
enum RangeItem {
    Exact(String),
    Span(f64, f64),
}

/// Chapter selection such as `1-10,12,15.5`.
///
/// Numeric labels match spans and numerically equal items, anything else only
/// matches an identical item.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeFilter {
    items: Vec<RangeItem>,
}

impl RangeFilter {
    pub fn matches(&self, label: &str) -> bool {
        let number = label.parse::<f64>().ok();
        self.items.iter().any(|item| match (item, number) {
            (RangeItem::Span(low, high), Some(n)) => *low <= n && n <= *high,
            (RangeItem::Exact(exact), Some(n)) => exact.parse::<f64>().ok() == Some(n),
            (RangeItem::Exact(exact), None) => exact == label,
            (RangeItem::Span(..), None) => false,
        })
    }
}

impl FromStr for RangeFilter {
    type Err = String;

    fn from_str(expr: &str) -> std::result::Result<Self, Self::Err> {
        let mut items = Vec::new();
        for part in expr.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let span = part.split_once('-').and_then(|(low, high)| {
                Some((low.trim().parse::<f64>().ok()?, high.trim().parse::<f64>().ok()?))
            });
            items.push(match span {
                Some((low, high)) if low <= high => RangeItem::Span(low, high),
                Some((low, high)) => RangeItem::Span(high, low),
                None => RangeItem::Exact(part.to_string()),
            });
        }
        if items.is_empty() {
            return Err(format!("empty chapter range '{expr}'"));
        }
        Ok(Self { items })
    }
}

/// Tally of one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub already_downloaded: usize,
    pub incomplete: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: &Result<ChapterOutcome>) {
        match outcome {
            Ok(ChapterOutcome::Completed(_)) => self.completed += 1,
            Ok(ChapterOutcome::AlreadyDownloaded(_)) => self.already_downloaded += 1,
            Ok(ChapterOutcome::Incomplete { .. }) => self.incomplete += 1,
            Ok(ChapterOutcome::Skipped(_)) => self.skipped += 1,
            Err(_) => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: RunSummary) {
        self.completed += other.completed;
        self.already_downloaded += other.already_downloaded;
        self.incomplete += other.incomplete;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }

    pub fn total(&self) -> usize {
        self.completed + self.already_downloaded + self.incomplete + self.skipped + self.failed
    }
}

/// Expands an identifier into chapters and feeds them to the engine one by one.
pub struct BulkDriver {
    catalog: Arc<dyn Catalog>,
    cache: Arc<ResponseCache>,
    config: Arc<RunConfig>,
    engine: ChapterEngine,
    range: Option<RangeFilter>,
    covers: Option<CoverDownloader>,
    cancel: CancellationToken,
}

impl BulkDriver {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        cache: Arc<ResponseCache>,
        config: Arc<RunConfig>,
        engine: ChapterEngine,
    ) -> Self {
        let cancel = engine.cancellation().clone();
        Self {
            catalog,
            cache,
            config,
            engine,
            range: None,
            covers: None,
            cancel,
        }
    }

    pub fn with_range(mut self, range: RangeFilter) -> Self {
        self.range = Some(range);
        self
    }

    pub fn with_covers(mut self, covers: CoverDownloader) -> Self {
        self.covers = Some(covers);
        self
    }

    pub async fn download(&self, identifier: &Identifier) -> Result<RunSummary> {
        let id = identifier.id();
        match identifier.kind() {
            IdentifierKind::Chapter => {
                let outcome = self.download_chapter(id).await;
                let mut summary = RunSummary::default();
                summary.record(&outcome);
                match outcome {
                    Err(MangadexError::Cancelled) => Err(MangadexError::Cancelled),
                    Err(e) => {
                        warn!("chapter {id} failed: {e}");
                        Ok(summary)
                    }
                    Ok(_) => Ok(summary),
                }
            }
            IdentifierKind::Manga => self.download_title(id).await,
            IdentifierKind::Group => self.download_parent(ParentKind::Group, id).await,
            IdentifierKind::User => self.download_parent(ParentKind::User, id).await,
            IdentifierKind::List => self.download_parent(ParentKind::List, id).await,
        }
    }

    pub async fn download_chapter(&self, id: &str) -> Result<ChapterOutcome> {
        let mut engine = self.engine.clone();
        engine.ready().await?.call(ChapterRequest::new(id)).await
    }

    pub async fn download_title(&self, manga_id: &str) -> Result<RunSummary> {
        self.run_title(manga_id, None).await
    }

    /// Chapters of a group, uploader or list, downloaded title by title.
    #[instrument(skip(self))]
    pub async fn download_parent(&self, parent: ParentKind, id: &str) -> Result<RunSummary> {
        let filter = ChapterFilter::default()
            .language(self.config.language())
            .ascending(self.config.ascending());
        let chapters = fetch_feed(
            self.catalog.as_ref(),
            &self.cache,
            &self.config,
            parent,
            id,
            &filter,
        )
        .await?;
        // Releases are deduplicated per title in `run_title`.
        let mut titles: Vec<(String, Vec<Chapter>)> = Vec::new();
        for chapter in unique_ids(chapters) {
            let Some(manga_id) = chapter.manga_id().map(str::to_string) else {
                warn!("chapter {} has no manga, ignoring", chapter.id);
                continue;
            };
            match titles.iter_mut().find(|(m, _)| *m == manga_id) {
                Some((_, list)) => list.push(chapter),
                None => titles.push((manga_id, vec![chapter])),
            }
        }
        let count: usize = titles.iter().map(|(_, chapters)| chapters.len()).sum();
        info!("{count} chapter(s) of {parent} {id} across {} title(s)", titles.len());

        let mut summary = RunSummary::default();
        for (manga_id, chapters) in titles {
            match self.run_title(&manga_id, Some(chapters)).await {
                Ok(title_summary) => summary.merge(title_summary),
                Err(MangadexError::Cancelled) => return Err(MangadexError::Cancelled),
                Err(e) => warn!("title {manga_id} failed: {e}"),
            }
        }
        Ok(summary)
    }

    /// First search hit for `query`.
    pub async fn search(&self, query: &str) -> Result<Manga> {
        let mut hits = self.catalog.search_manga(query, SEARCH_LIMIT).await?.into_iter();
        let first = hits
            .next()
            .ok_or_else(|| MangadexError::schema(format!("no title matches '{query}'")))?;
        for other in hits {
            info!("also matched: {} ({})", other.title(self.config.language()), other.id);
        }
        info!("Selected {} ({})", first.title(self.config.language()), first.id);
        Ok(first)
    }

    /// Downloads `selection`, or the whole feed, of one title. File names use
    /// the prefix map of the whole feed so they match across runs.
    #[instrument(skip(self, selection))]
    async fn run_title(
        &self,
        manga_id: &str,
        selection: Option<Vec<Chapter>>,
    ) -> Result<RunSummary> {
        let manga: Manga = self
            .cache
            .get_or_fetch(manga_id, CacheKind::Manga, || self.catalog.get_manga(manga_id))
            .await?;
        let title = manga.title(self.config.language());
        let filter = ChapterFilter::default()
            .language(self.config.language())
            .ascending(self.config.ascending());
        let feed = fetch_feed(
            self.catalog.as_ref(),
            &self.cache,
            &self.config,
            ParentKind::Manga,
            manga_id,
            &filter,
        )
        .await?;

        let mut listing = volume_listing(&feed);
        if self.config.ascending() {
            listing.reverse();
        }
        let prefixes = prefix_map(&listing);

        let language = self.config.language();
        let chapters: Vec<Chapter> = dedupe(selection.unwrap_or(feed))
            .into_iter()
            .filter(|chapter| chapter.language() == language)
            .filter(|chapter| {
                self.range
                    .as_ref()
                    .map_or(true, |range| range.matches(chapter.label()))
            })
            .collect();
        info!("{title}: {} chapter(s) selected", chapters.len());

        let mut service = ServiceBuilder::new()
            .rate_limit(1, self.config.request_delay())
            .service(self.engine.clone());
        let mut summary = RunSummary::default();
        for chapter in chapters {
            if self.cancel.is_cancelled() {
                return Err(MangadexError::Cancelled);
            }
            let id = chapter.id.clone();
            let request = ChapterRequest::from_chapter(chapter.clone())
                .title(&title)
                .prefix(prefixes.prefix(chapter.volume()));
            let outcome = service.ready().await?.call(request).await;
            summary.record(&outcome);
            match outcome {
                Err(MangadexError::Cancelled) => return Err(MangadexError::Cancelled),
                Err(e) => warn!("chapter {id} failed: {e}"),
                Ok(_) => {}
            }
        }

        if let Some(covers) = &self.covers {
            if let Err(e) = covers.download(&manga, &title).await {
                warn!("covers of {title} failed: {e}");
            }
        }
        info!(
            "{title}: {} done, {} already there, {} incomplete, {} skipped, {} failed",
            summary.completed,
            summary.already_downloaded,
            summary.incomplete,
            summary.skipped,
            summary.failed
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn chapter(id: &str, volume: &str, label: &str, group: &str) -> Chapter {
        titled_chapter(id, "m1", volume, label, group)
    }

    fn titled_chapter(id: &str, manga: &str, volume: &str, label: &str, group: &str) -> Chapter {
        serde_json::from_value(json!({
            "id": id,
            "attributes": {"volume": volume, "chapter": label, "translatedLanguage": "en"},
            "relationships": [
                {"id": manga, "type": "manga"},
                {"id": group, "type": "scanlation_group"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_range_filter() {
        let range: RangeFilter = "1-10, 12,15.5,Extra".parse().unwrap();
        assert!(range.matches("1"));
        assert!(range.matches("10"));
        assert!(range.matches("7.5"));
        assert!(!range.matches("11"));
        assert!(range.matches("12"));
        assert!(range.matches("15.5"));
        assert!(range.matches("Extra"));
        assert!(!range.matches("extra"));
        assert!(!range.matches(""));

        let reversed: RangeFilter = "5-3".parse().unwrap();
        assert!(reversed.matches("4"));
        assert!("  , ".parse::<RangeFilter>().is_err());
    }

    #[test]
    fn test_dedupe() {
        let chapters = vec![
            chapter("a", "1", "1", "g1"),
            chapter("a", "1", "1", "g1"),
            chapter("b", "1", "1", "g1"),
            chapter("c", "1", "1", "g2"),
            chapter("d", "1", "2", "g1"),
        ];
        let ids: Vec<_> = dedupe(chapters).into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["a", "c", "d"]);
    }

    #[test]
    fn test_same_release_of_two_titles_is_kept() {
        let chapters = vec![
            titled_chapter("a1", "m1", "1", "1", "g1"),
            titled_chapter("b1", "m2", "1", "1", "g1"),
            titled_chapter("b1", "m2", "1", "1", "g1"),
        ];
        let ids: Vec<_> = dedupe(chapters.clone()).into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["a1", "b1"]);
        let ids: Vec<_> = unique_ids(chapters).into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["a1", "b1"]);
    }

    #[test]
    fn test_summary_total() {
        let mut summary = RunSummary::default();
        summary.record(&Ok(ChapterOutcome::Skipped(String::from("x"))));
        summary.record(&Err(MangadexError::RateLimited));
        let mut other = RunSummary::default();
        other.record(&Ok(ChapterOutcome::Completed("p".into())));
        summary.merge(other);
        assert_eq!(summary.total(), 3);
        assert_eq!(summary.failed, 1);
    }
}
