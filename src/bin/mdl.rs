use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use mangadex_dl::{
    ArchiveFormat, BulkDriver, Catalog, CatalogClient, ChapterEngine, CoverDownloader, Identifier,
    IdentifierKind, ImageNetwork, JsonSidecar, MangadexError, NetworkClient, RangeFilter,
    ResponseCache, RunConfigBuilder, RunSummary, SessionStore, TOKEN_FILE,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "mdl",
    version,
    author,
    about = "Download chapters, titles, groups, users or lists from mangadex"
)]
struct Arguments {
    #[arg(help = "UUID, mangadex.org url or file with one identifier per line")]
    identifier: String,
    #[arg(short = 't', long = "type", help = "chapter, manga, group, user or list")]
    kind: Option<IdentifierKind>,
    #[arg(short, long, default_value_t = String::from("en"), help = "translation language")]
    language: String,
    #[arg(short, long, default_value = ".", help = "download root")]
    directory: PathBuf,
    #[arg(long, help = "one folder per chapter instead of an archive")]
    folder: bool,
    #[arg(short, long, default_value = "zip", help = "archive extension, zip or cbz")]
    format: ArchiveFormat,
    #[arg(long, help = "also save cover artwork")]
    covers: bool,
    #[arg(long, help = "keep an info.json next to each title")]
    json: bool,
    #[arg(short, long, help = "chapters to get, e.g. 1-10,12,15.5")]
    range: Option<RangeFilter>,
    #[arg(long, help = "process chapters in ascending order")]
    order: bool,
    #[arg(short, long, help = "treat the identifier as a title to search for")]
    search: bool,
    #[arg(long, help = "ask for credentials even if a session is stored")]
    login: bool,
    #[arg(long, help = "verbose logging")]
    debug: bool,
    #[arg(long, help = "ignore cached catalog responses")]
    refresh: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Arguments::parse();

    let level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new(format!("warn,mangadex_dl={level},mdl={level}"))
            }),
        )
        .init();

    let format = if args.folder {
        ArchiveFormat::Folder
    } else {
        args.format
    };
    let config = Arc::new(
        RunConfigBuilder::default()
            .download_root(args.directory)
            .language(args.language)
            .format(format)
            .force_refresh(args.refresh)
            .ascending(args.order)
            .write_sidecar(args.json)
            .build()?,
    );

    let client = Arc::new(CatalogClient::new(&config, Arc::new(SessionStore::open(TOKEN_FILE)))?);
    if let Err(e) = client.authenticate(args.login).await {
        if args.login {
            return Err(e.into());
        }
        warn!("continuing without a session: {e}");
    }
    let catalog: Arc<dyn Catalog> = client;
    let network: Arc<dyn ImageNetwork> = Arc::new(NetworkClient::new()?);
    let cache = Arc::new(ResponseCache::from_config(&config));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, stopping after the pages in flight");
                cancel.cancel();
            }
        });
    }

    let mut engine = ChapterEngine::new(catalog.clone(), network.clone(), config.clone())
        .with_cache(cache.clone())
        .with_cancellation(cancel);
    if config.write_sidecar() {
        engine = engine.with_observer(Arc::new(JsonSidecar::new()));
    }
    let mut driver = BulkDriver::new(catalog.clone(), cache.clone(), config.clone(), engine);
    if let Some(range) = args.range {
        driver = driver.with_range(range);
    }
    if args.covers {
        driver = driver.with_covers(CoverDownloader::new(catalog, network, cache, config.clone()));
    }

    let identifiers = if args.search {
        let manga = driver.search(&args.identifier).await?;
        vec![Identifier::new(IdentifierKind::Manga, manga.id)]
    } else {
        Identifier::resolve(&args.identifier, args.kind)?
    };

    let mut summary = RunSummary::default();
    for identifier in &identifiers {
        match driver.download(identifier).await {
            Ok(done) => summary.merge(done),
            Err(MangadexError::Cancelled) => {
                warn!("cancelled");
                break;
            }
            // Nothing could be selected for the only thing asked for.
            Err(e) if identifiers.len() == 1 => return Err(e.into()),
            Err(e) => error!("{} {} failed: {e}", identifier.kind(), identifier.id()),
        }
    }
    info!(
        "{} chapter(s): {} downloaded, {} already there, {} incomplete, {} skipped, {} failed",
        summary.total(),
        summary.completed,
        summary.already_downloaded,
        summary.incomplete,
        summary.skipped,
        summary.failed
    );
    Ok(())
}
