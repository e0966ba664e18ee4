use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub(crate) const API_ROOT: &str = "https://api.mangadex.org";
pub(crate) const REPORT_URL: &str = "https://api.mangadex.network/report";
pub(crate) const UPLOADS_HOST: &str = "uploads.mangadex.org";
pub(crate) const UPLOADS_ROOT: &str = "https://uploads.mangadex.org";
pub(crate) const MANGAPLUS_HOST: &str = "mangaplus.shueisha.co.jp";
pub(crate) const MANGAPLUS_API: &str = "https://jumpg-webapi.tokyo-cdn.com/api";
pub const TOKEN_FILE: &str = ".mdauth";
pub const CACHE_DIR: &str = ".cache";

/// How finished chapters land on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchiveFormat {
    #[default]
    Zip,
    Cbz,
    Folder,
}

impl ArchiveFormat {
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            ArchiveFormat::Zip => Some("zip"),
            ArchiveFormat::Cbz => Some("cbz"),
            ArchiveFormat::Folder => None,
        }
    }
}

impl FromStr for ArchiveFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "zip" => Ok(ArchiveFormat::Zip),
            "cbz" => Ok(ArchiveFormat::Cbz),
            "folder" => Ok(ArchiveFormat::Folder),
            other => Err(format!("unknown archive format '{other}'")),
        }
    }
}

/// Image quality served by the image network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Quality {
    #[default]
    Data,
    DataSaver,
}

impl Quality {
    pub fn path_segment(&self) -> &'static str {
        match self {
            Quality::Data => "data",
            Quality::DataSaver => "data-saver",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_segment())
    }
}

/// Immutable settings for one run, shared by the driver, the engine and the clients.
#[derive(Debug, Clone, Builder, Getters, CopyGetters)]
#[builder(default, setter(into))]
pub struct RunConfig {
    #[getset(get = "pub")]
    pub(crate) download_root: PathBuf,
    /// Translated language to download.
    #[getset(get = "pub")]
    pub(crate) language: String,
    /// Language left out of file names.
    #[getset(get = "pub")]
    pub(crate) default_language: String,
    #[getset(get_copy = "pub")]
    pub(crate) format: ArchiveFormat,
    #[getset(get_copy = "pub")]
    pub(crate) quality: Quality,
    /// Upper bound on in-flight page requests within one chapter.
    #[getset(get_copy = "pub")]
    pub(crate) concurrency: usize,
    /// Attempts per page against each CDN base.
    #[getset(get_copy = "pub")]
    pub(crate) retries: u32,
    #[getset(get_copy = "pub")]
    pub(crate) retry_delay: Duration,
    #[getset(get_copy = "pub")]
    pub(crate) page_timeout: Duration,
    #[getset(get_copy = "pub")]
    pub(crate) catalog_timeout: Duration,
    /// Minimum spacing between two catalog requests.
    #[getset(get_copy = "pub")]
    pub(crate) request_delay: Duration,
    /// Extra pause taken every fifth page of a paginated listing.
    #[getset(get_copy = "pub")]
    pub(crate) page_cooldown: Duration,
    #[getset(get = "pub")]
    pub(crate) cache_root: PathBuf,
    #[getset(get_copy = "pub")]
    pub(crate) cache_ttl: Duration,
    #[getset(get_copy = "pub")]
    pub(crate) force_refresh: bool,
    #[getset(get_copy = "pub")]
    pub(crate) ascending: bool,
    #[getset(get_copy = "pub")]
    pub(crate) write_sidecar: bool,
    #[getset(get_copy = "pub")]
    pub(crate) progress: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            download_root: PathBuf::from("."),
            language: String::from("en"),
            default_language: String::from("en"),
            format: ArchiveFormat::default(),
            quality: Quality::default(),
            concurrency: 8,
            retries: 3,
            retry_delay: Duration::from_secs(3),
            page_timeout: Duration::from_secs(30),
            catalog_timeout: Duration::from_secs(15),
            request_delay: Duration::from_secs(2),
            page_cooldown: Duration::from_secs(3),
            cache_root: PathBuf::from(CACHE_DIR),
            cache_ttl: Duration::from_secs(6 * 60 * 60),
            force_refresh: false,
            ascending: false,
            write_sidecar: false,
            progress: true,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = RunConfigBuilder::default()
            .language("fr")
            .format(ArchiveFormat::Cbz)
            .build()
            .unwrap();
        assert_eq!(config.language(), "fr");
        assert_eq!(config.default_language(), "en");
        assert_eq!(config.format().extension(), Some("cbz"));
        assert_eq!(config.concurrency(), 8);
        assert_eq!(config.retries(), 3);
        assert_eq!(config.quality().path_segment(), "data");
    }

    #[test]
    fn test_archive_format_parse() {
        assert_eq!("CBZ".parse::<ArchiveFormat>(), Ok(ArchiveFormat::Cbz));
        assert_eq!("folder".parse::<ArchiveFormat>(), Ok(ArchiveFormat::Folder));
        assert!("rar".parse::<ArchiveFormat>().is_err());
    }
}
