mod cache;
mod catalog;
mod config;
mod cover;
mod driver;
mod engine;
mod export;
mod external;
mod ident;
mod model;
mod network;
mod prefix;
mod sidecar;

pub use cache::{CacheEntry, CacheKind, ResponseCache};
pub use catalog::auth::{Credentials, Session, SessionStore};
pub use catalog::{Catalog, CatalogClient, ChapterFilter, ChapterPage, ParentKind};
pub use config::{ArchiveFormat, Quality, RunConfig, RunConfigBuilder, CACHE_DIR, TOKEN_FILE};
pub use cover::CoverDownloader;
pub use driver::{BulkDriver, RangeFilter, RunSummary, FEED_LIMIT};
pub use engine::{ChapterEngine, ChapterOutcome, ChapterRequest, DownloadPlan};
pub use export::{ArchiveExporter, ChapterExport, Exporter, FolderExporter};
pub use external::{xor_decrypt, ExternalPage, MangaPlus};
pub use ident::{Identifier, IdentifierKind};
pub use model::{AtHomeManifest, Chapter, Cover, Manga, Relationship, ScanlatorGroup};
pub use network::{ImageNetwork, NetworkClient, PageResponse, TelemetryReport};
pub use prefix::{prefix_map, PrefixMap};
pub use sidecar::{ChapterObserver, JsonSidecar, TitleInfo};

pub type Result<T, E = MangadexError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum MangadexError {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("catalog answered HTTP {code}: {body}")]
    HttpStatus { code: u16, body: String },
    #[error(transparent)]
    Decode(#[from] serde_json::Error),
    #[error("unexpected response shape: {0}")]
    Schema(String),
    #[error("rate limited by the catalog")]
    RateLimited,
    #[error("chapter is hosted on an unsupported external site '{0}'")]
    ChapterExternalUnsupported(String),
    #[error("chapter {0} has no pages")]
    ChapterEmpty(String),
    #[error("cancelled")]
    Cancelled,
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Archive(#[from] zip::result::ZipError),
    #[error(transparent)]
    Protobuf(#[from] prost::DecodeError),
    #[error("invalid url '{0}'")]
    UrlParseError(String),
}

impl MangadexError {
    /// Errors that only make the current chapter unreachable; the run goes on.
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            MangadexError::HttpStatus { code: 300 | 451, .. }
                | MangadexError::ChapterExternalUnsupported(_)
                | MangadexError::ChapterEmpty(_)
        )
    }

    pub(crate) fn schema(msg: impl Into<String>) -> Self {
        MangadexError::Schema(msg.into())
    }
}
