use crate::cache::{CacheKind, ResponseCache};
use crate::catalog::{Catalog, ChapterFilter, ParentKind};
use crate::config::{Quality, RunConfig};
use crate::driver::fetch_feed;
use crate::export::{self, extension_of, ChapterExport, Exporter};
use crate::external::MangaPlus;
use crate::model::{AtHomeManifest, Chapter, Manga, ScanlatorGroup};
use crate::network::{is_first_party, page_url, ImageNetwork, TelemetryReport};
use crate::prefix::{prefix_map, volume_listing};
use crate::sidecar::ChapterObserver;
use crate::{MangadexError, Result};
use bytes::Bytes;
use futures::{stream, Future, StreamExt};
use getset::{CopyGetters, Getters};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{debug, debug_span, info, instrument, warn, Instrument};

/// A chapter to download, with whatever the caller already knows about it.
#[derive(Debug, Clone)]
pub struct ChapterRequest {
    pub(crate) id: String,
    pub(crate) chapter: Option<Chapter>,
    pub(crate) title: Option<String>,
    pub(crate) prefix: Option<char>,
}

impl ChapterRequest {
    pub fn new(id: impl ToString) -> Self {
        Self {
            id: id.to_string(),
            chapter: None,
            title: None,
            prefix: None,
        }
    }

    /// Skips the chapter lookup.
    pub fn from_chapter(chapter: Chapter) -> Self {
        Self {
            id: chapter.id.clone(),
            chapter: Some(chapter),
            title: None,
            prefix: None,
        }
    }

    pub fn title(mut self, title: impl ToString) -> Self {
        self.title = Some(title.to_string());
        self
    }

    pub fn prefix(mut self, prefix: char) -> Self {
        self.prefix = Some(prefix);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// How a chapter ended for this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChapterOutcome {
    /// Every page was fetched or already present.
    Completed(PathBuf),
    /// Nothing to do; the artifact on disk was already complete.
    AlreadyDownloaded(PathBuf),
    /// Some pages failed on every base; the next run picks them up.
    Incomplete { path: PathBuf, missing: usize },
    /// The chapter cannot be fetched at all (external host, region lock, no pages).
    Skipped(String),
}

/// Pages to fetch and where from. Only the fallback base changes once built.
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct DownloadPlan {
    #[getset(get = "pub")]
    pages: Vec<String>,
    #[getset(get = "pub")]
    hash: String,
    #[getset(get = "pub")]
    primary: String,
    #[getset(get = "pub")]
    fallback: Option<String>,
    /// Attempts per page against each base.
    #[getset(get_copy = "pub")]
    retries: u32,
}

impl DownloadPlan {
    pub fn new(manifest: &AtHomeManifest, quality: Quality, retries: u32) -> Self {
        Self {
            pages: manifest.pages(quality).to_vec(),
            hash: manifest.hash().to_string(),
            primary: manifest.base_url().clone(),
            fallback: None,
            retries,
        }
    }

    pub fn set_fallback(&mut self, base: impl Into<String>) {
        self.fallback = Some(base.into());
    }

    /// Bases in the order they are tried.
    pub fn bases(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.fallback.as_deref())
    }
}

/// Turns a [`ChapterRequest`] into a finished artifact on disk.
///
/// Cheap to clone; all collaborators are shared. Pages of one chapter are
/// fetched concurrently, chapters are meant to be fed one at a time.
#[derive(Clone)]
pub struct ChapterEngine {
    catalog: Arc<dyn Catalog>,
    network: Arc<dyn ImageNetwork>,
    cache: Arc<ResponseCache>,
    config: Arc<RunConfig>,
    observer: Option<Arc<dyn ChapterObserver>>,
    cancel: CancellationToken,
}

impl ChapterEngine {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        network: Arc<dyn ImageNetwork>,
        config: Arc<RunConfig>,
    ) -> Self {
        Self {
            catalog,
            network,
            cache: Arc::new(ResponseCache::from_config(&config)),
            config,
            observer: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ChapterObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Downloads one chapter. Chapters that cannot be fetched at all come back
    /// as [`ChapterOutcome::Skipped`]; other errors are for the caller to log.
    pub async fn download_chapter(&self, request: ChapterRequest) -> Result<ChapterOutcome> {
        let id = request.id.clone();
        match self.run(request).await {
            Err(e) if e.is_skippable() => {
                match &e {
                    MangadexError::ChapterExternalUnsupported(host) => {
                        info!("Chapter external to {host}, skipping")
                    }
                    _ => info!("Skipping chapter {id}: {e}"),
                }
                Ok(ChapterOutcome::Skipped(e.to_string()))
            }
            outcome => outcome,
        }
    }

    async fn run(&self, request: ChapterRequest) -> Result<ChapterOutcome> {
        if self.cancel.is_cancelled() {
            return Err(MangadexError::Cancelled);
        }
        let chapter = match request.chapter {
            Some(chapter) => chapter,
            None => {
                let id = request.id.as_str();
                self.cache
                    .get_or_fetch(id, CacheKind::Chapter, || self.catalog.get_chapter(id))
                    .await?
            }
        };

        let external = match chapter.external_url() {
            Some(url) if MangaPlus::recognizes(url) => Some(url.to_string()),
            Some(url) => {
                let host = url::Url::parse(url)
                    .ok()
                    .and_then(|u| u.host_str().map(str::to_string))
                    .unwrap_or_else(|| url.to_string());
                return Err(MangadexError::ChapterExternalUnsupported(host));
            }
            None => None,
        };

        let export = self.chapter_export(&chapter, request.title, request.prefix).await?;
        info!("Downloading {}", export.base_name());
        let exporter = export::open(export)?;

        if chapter.pages() > 0 && exporter.exists_page_count(chapter.pages() as usize) {
            return self.already_downloaded(&chapter, exporter);
        }

        match external {
            Some(url) => self.download_external(&chapter, &url, exporter).await,
            None => self.download_pages(&chapter, exporter).await,
        }
    }

    /// Title, prefix and group names that make up the chapter's file names.
    async fn chapter_export(
        &self,
        chapter: &Chapter,
        title: Option<String>,
        prefix: Option<char>,
    ) -> Result<ChapterExport> {
        let needs_manga = title.is_none() || prefix.is_none();
        let manga = match (needs_manga, chapter.manga_id()) {
            (false, _) => None,
            (true, Some(manga_id)) => Some(self.manga(manga_id).await?),
            (true, None) => {
                return Err(MangadexError::schema(format!(
                    "chapter {} has no manga relationship",
                    chapter.id
                )))
            }
        };
        let title = match (title, &manga) {
            (Some(title), _) => title,
            (None, Some(manga)) => manga.title(self.config.language()),
            (None, None) => chapter.id.clone(),
        };
        let prefix = match (prefix, &manga) {
            (Some(prefix), _) => prefix,
            (None, Some(manga)) => self.prefix_for(chapter, &manga.id).await?,
            (None, None) => crate::prefix::DEFAULT_PREFIX,
        };
        let groups = self.group_names(chapter).await?;
        Ok(ChapterExport::new(chapter, &title, prefix, groups, &self.config))
    }

    async fn manga(&self, id: &str) -> Result<Manga> {
        self.cache
            .get_or_fetch(id, CacheKind::Manga, || self.catalog.get_manga(id))
            .await
    }

    async fn prefix_for(&self, chapter: &Chapter, manga_id: &str) -> Result<char> {
        let filter = ChapterFilter::default().language(chapter.language());
        let feed = fetch_feed(
            self.catalog.as_ref(),
            &self.cache,
            &self.config,
            ParentKind::Manga,
            manga_id,
            &filter,
        )
        .await?;
        Ok(prefix_map(&volume_listing(&feed)).prefix(chapter.volume()))
    }

    async fn group_names(&self, chapter: &Chapter) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for group in chapter.groups() {
            match group.name() {
                Some(name) => names.push(name.to_string()),
                None => {
                    let id = group.id.as_str();
                    let group: ScanlatorGroup = self
                        .cache
                        .get_or_fetch(id, CacheKind::Group, || self.catalog.get_group(id))
                        .await?;
                    names.push(group.name().clone());
                }
            }
        }
        Ok(names)
    }

    async fn download_pages(
        &self,
        chapter: &Chapter,
        mut exporter: Box<dyn Exporter>,
    ) -> Result<ChapterOutcome> {
        let id = chapter.id.as_str();
        let primary: AtHomeManifest = self
            .cache
            .get_or_fetch(id, CacheKind::AtHome, || self.catalog.get_athome(id))
            .await?;
        let mut plan = DownloadPlan::new(&primary, self.config.quality(), self.config.retries());
        if plan.pages().is_empty() {
            self.release_empty(exporter)?;
            return Err(MangadexError::ChapterEmpty(id.to_string()));
        }
        if exporter.exists_all_pages(plan.pages()) {
            return self.already_downloaded(chapter, exporter);
        }

        match self.catalog.get_athome(id).await {
            Ok(fallback) => plan.set_fallback(fallback.base_url().clone()),
            Err(e) => debug!("no fallback base for {id}: {e}"),
        }

        let progress = self.progress_bar(plan.pages().len() as u64, &exporter.export().base_name());
        let scheduled = self.run_schedule(&plan, exporter.as_mut(), &progress).await;
        progress.finish_and_clear();
        if let Err(e) = scheduled {
            // Pages written so far stay on disk.
            if let Err(close_error) = exporter.close() {
                warn!("could not close chapter {id}: {close_error}");
            }
            return Err(e);
        }

        if exporter.exists_all_pages(plan.pages()) {
            self.completed(chapter, exporter)
        } else {
            let missing = (1..=plan.pages().len())
                .filter(|&index| !exporter.exists(index, extension_of(&plan.pages()[index - 1])))
                .count();
            let path = exporter.close()?;
            warn!("Chapter {id} incomplete, {missing} page(s) missing");
            Ok(ChapterOutcome::Incomplete { path, missing })
        }
    }

    async fn download_external(
        &self,
        chapter: &Chapter,
        url: &str,
        mut exporter: Box<dyn Exporter>,
    ) -> Result<ChapterOutcome> {
        let adapter = MangaPlus::new(self.network.clone(), self.config.page_timeout());
        let pages = match adapter.manifest(url).await {
            Ok(pages) if pages.is_empty() => {
                self.release_empty(exporter)?;
                return Err(MangadexError::ChapterEmpty(chapter.id.clone()));
            }
            Ok(pages) => pages,
            Err(e) => {
                if let Err(close_error) = exporter.close() {
                    warn!("could not close chapter {}: {close_error}", chapter.id);
                }
                return Err(e);
            }
        };
        if exporter.exists_all_pages(&MangaPlus::file_names(&pages)) {
            return self.already_downloaded(chapter, exporter);
        }

        let progress = self.progress_bar(pages.len() as u64, &exporter.export().base_name());
        let fetched = adapter
            .download_into(&pages, exporter.as_mut(), &self.cancel, &progress)
            .await;
        progress.finish_and_clear();
        match fetched {
            Ok(0) => self.completed(chapter, exporter),
            Ok(missing) => {
                let path = exporter.close()?;
                warn!("External chapter {} incomplete, {missing} page(s) missing", chapter.id);
                Ok(ChapterOutcome::Incomplete { path, missing })
            }
            Err(e) => {
                if let Err(close_error) = exporter.close() {
                    warn!("could not close chapter {}: {close_error}", chapter.id);
                }
                Err(e)
            }
        }
    }

    /// Fetches every missing page with bounded concurrency and stores it as it arrives.
    async fn run_schedule(
        &self,
        plan: &DownloadPlan,
        exporter: &mut dyn Exporter,
        progress: &ProgressBar,
    ) -> Result<()> {
        let pending: Vec<(usize, String)> = plan
            .pages()
            .iter()
            .enumerate()
            .map(|(i, name)| (i + 1, name.clone()))
            .filter(|(index, name)| !exporter.exists(*index, extension_of(name)))
            .collect();
        progress.inc((plan.pages().len() - pending.len()) as u64);
        let limit = pending.len().min(self.config.concurrency()).max(1);
        debug!(pending = pending.len(), limit, "fetching pages");

        let mut fetches = stream::iter(pending)
            .map(|(index, name)| async move {
                let fetched = self.fetch_page(plan, &name).await;
                (index, name, fetched)
            })
            .buffer_unordered(limit);

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Err(MangadexError::Cancelled),
                next = fetches.next() => next,
            };
            let Some((index, name, fetched)) = next else {
                break;
            };
            match fetched {
                Ok(bytes) => {
                    exporter.add_image(index, extension_of(&name), &bytes, &name)?;
                }
                Err(e) => warn!("page {index} ({name}) failed on every base: {e}"),
            }
            progress.inc(1);
        }
        Ok(())
    }

    /// Retries one page against each base in turn, a fresh budget per base.
    #[instrument(level = "debug", skip(self, plan))]
    async fn fetch_page(&self, plan: &DownloadPlan, filename: &str) -> Result<Bytes> {
        let mut last_error = None;
        for base in plan.bases() {
            for attempt in 1..=plan.retries() {
                match self.attempt(base, plan.hash(), filename).await {
                    Ok(bytes) => return Ok(bytes),
                    Err(e) => {
                        warn!(base, attempt, "page {filename} failed: {e}");
                        last_error = Some(e);
                        if attempt < plan.retries() {
                            sleep(self.config.retry_delay()).await;
                        }
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| MangadexError::schema("no base to fetch from")))
    }

    /// One GET, followed by its telemetry record unless the base is first-party.
    async fn attempt(&self, base: &str, hash: &str, filename: &str) -> Result<Bytes> {
        let quality = self.config.quality();
        let url = page_url(base, quality, hash, filename);
        let started = Instant::now();
        let result = self
            .network
            .fetch_page(base, hash, quality, filename, self.config.page_timeout())
            .await;
        if !is_first_party(&url) {
            let (success, bytes, cached) = match &result {
                Ok(page) => (true, page.bytes.len(), page.cached),
                Err(_) => (false, 0, false),
            };
            self.network
                .report(TelemetryReport {
                    url,
                    success,
                    bytes,
                    duration: started.elapsed().as_millis() as u64,
                    cached,
                })
                .await;
        }
        result.map(|page| page.bytes)
    }

    fn already_downloaded(
        &self,
        chapter: &Chapter,
        exporter: Box<dyn Exporter>,
    ) -> Result<ChapterOutcome> {
        info!("File already downloaded: {}", exporter.export().base_name());
        self.notify(chapter, exporter.export());
        Ok(ChapterOutcome::AlreadyDownloaded(exporter.close()?))
    }

    /// Drops the artifact of a chapter without pages unless earlier runs stored some.
    fn release_empty(&self, exporter: Box<dyn Exporter>) -> Result<()> {
        if exporter.list_pages().is_empty() {
            exporter.discard()
        } else {
            exporter.close().map(|_| ())
        }
    }

    fn completed(&self, chapter: &Chapter, exporter: Box<dyn Exporter>) -> Result<ChapterOutcome> {
        self.notify(chapter, exporter.export());
        let path = exporter.close()?;
        info!("Finished {}", path.display());
        Ok(ChapterOutcome::Completed(path))
    }

    fn notify(&self, chapter: &Chapter, export: &ChapterExport) {
        if let Some(observer) = &self.observer {
            observer.chapter_completed(chapter, export);
        }
    }

    fn progress_bar(&self, len: u64, name: &str) -> ProgressBar {
        if !self.config.progress() {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len);
        let template = "{msg} [{bar:40.cyan/blue}] {pos:>3}/{len:3}";
        if let Ok(style) = ProgressStyle::default_bar().template(template) {
            bar.set_style(style.progress_chars("##-"));
        }
        bar.set_message(name.to_string());
        bar
    }
}

impl Service<ChapterRequest> for ChapterEngine {
    type Response = ChapterOutcome;
    type Error = MangadexError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(Err(MangadexError::Cancelled));
        }
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ChapterRequest) -> Self::Future {
        let span = debug_span!("chapter", id = %req.id);
        let engine = self.clone();
        Box::pin(async move { engine.download_chapter(req).await }.instrument(span))
    }
}
