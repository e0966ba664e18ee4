use crate::config::{MANGAPLUS_API, MANGAPLUS_HOST};
use crate::export::{extension_of, Exporter};
use crate::network::ImageNetwork;
use crate::{MangadexError, Result};
use indicatif::ProgressBar;
use prost::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Wire messages of the MangaPlus viewer API, reduced to the fields we read.
mod proto {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Response {
        #[prost(message, optional, tag = "1")]
        pub success: Option<SuccessResult>,
        #[prost(message, optional, tag = "2")]
        pub error: Option<ErrorResult>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ErrorResult {
        #[prost(message, optional, tag = "2")]
        pub english_popup: Option<Popup>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Popup {
        #[prost(string, tag = "1")]
        pub subject: String,
        #[prost(string, tag = "2")]
        pub body: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct SuccessResult {
        #[prost(message, optional, tag = "10")]
        pub manga_viewer: Option<MangaViewer>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct MangaViewer {
        #[prost(message, repeated, tag = "1")]
        pub pages: Vec<Page>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Page {
        #[prost(message, optional, tag = "1")]
        pub manga_page: Option<MangaPage>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct MangaPage {
        #[prost(string, tag = "1")]
        pub image_url: String,
        #[prost(uint32, tag = "2")]
        pub width: u32,
        #[prost(uint32, tag = "3")]
        pub height: u32,
        #[prost(string, tag = "5")]
        pub encryption_key: String,
    }
}

use proto::Response;

/// `out[i] = data[i] ^ key[i % key.len()]`, in place. Applying it twice is the identity.
pub fn xor_decrypt(data: &mut [u8], key: &[u8]) {
    if key.is_empty() {
        return;
    }
    for (byte, k) in data.iter_mut().zip(key.iter().cycle()) {
        *byte ^= k;
    }
}

/// One encrypted page of an external chapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalPage {
    pub url: String,
    /// Hex-encoded XOR key, empty when the page is served in clear.
    pub key: String,
}

/// Chapters hosted on MangaPlus. Pages are fetched one at a time.
pub struct MangaPlus {
    network: Arc<dyn ImageNetwork>,
    api_root: String,
    timeout: Duration,
}

impl MangaPlus {
    pub fn new(network: Arc<dyn ImageNetwork>, timeout: Duration) -> Self {
        Self {
            network,
            api_root: MANGAPLUS_API.to_string(),
            timeout,
        }
    }

    pub fn recognizes(url: &str) -> bool {
        url::Url::parse(url)
            .ok()
            .and_then(|url| url.host_str().map(|host| host == MANGAPLUS_HOST))
            .unwrap_or(false)
    }

    /// Numeric chapter id at the end of a `/viewer/{id}` link.
    pub fn chapter_id(url: &str) -> Result<String> {
        let parsed =
            url::Url::parse(url).map_err(|_| MangadexError::UrlParseError(url.to_string()))?;
        parsed
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .filter(|id| id.chars().all(|c| c.is_ascii_digit()))
            .map(str::to_string)
            .ok_or_else(|| MangadexError::UrlParseError(url.to_string()))
    }

    #[instrument(skip(self))]
    pub async fn manifest(&self, url: &str) -> Result<Vec<ExternalPage>> {
        let id = Self::chapter_id(url)?;
        let manifest_url = format!(
            "{}/manga_viewer?chapter_id={id}&split=yes&img_quality=super_high",
            self.api_root
        );
        let response = self.network.get(&manifest_url, self.timeout).await?;
        decode_manifest(&response.bytes)
    }

    /// GETs one page and strips its encryption.
    pub async fn fetch(&self, page: &ExternalPage) -> Result<Vec<u8>> {
        let response = self.network.get(&page.url, self.timeout).await?;
        let mut bytes = response.bytes.to_vec();
        if !page.key.is_empty() {
            let key = hex::decode(&page.key)
                .map_err(|e| MangadexError::schema(format!("bad page key: {e}")))?;
            xor_decrypt(&mut bytes, &key);
        }
        Ok(bytes)
    }

    /// Page names in manifest order, in the form the exporter checks against.
    pub fn file_names(pages: &[ExternalPage]) -> Vec<String> {
        pages.iter().map(|page| page.url.clone()).collect()
    }

    /// Feeds every missing page of `pages` into `exporter` in manifest order and
    /// returns how many pages are still missing.
    pub async fn download_into(
        &self,
        pages: &[ExternalPage],
        exporter: &mut dyn Exporter,
        cancel: &CancellationToken,
        progress: &ProgressBar,
    ) -> Result<usize> {
        progress.set_length(pages.len() as u64);

        for (i, page) in pages.iter().enumerate() {
            let index = i + 1;
            let ext = extension_of(&page.url).to_string();
            if exporter.exists(index, &ext) {
                progress.inc(1);
                continue;
            }
            let fetched = tokio::select! {
                _ = cancel.cancelled() => return Err(MangadexError::Cancelled),
                fetched = self.fetch(page) => fetched,
            };
            match fetched {
                Ok(bytes) => {
                    exporter.add_image(index, &ext, &bytes, &page.url)?;
                }
                Err(e) => warn!("external page {index} failed: {e}"),
            }
            progress.inc(1);
        }
        let missing = pages
            .iter()
            .enumerate()
            .filter(|(i, page)| !exporter.exists(i + 1, extension_of(&page.url)))
            .count();
        debug!(pages = pages.len(), missing, "external chapter fetched");
        Ok(missing)
    }
}

fn decode_manifest(bytes: &[u8]) -> Result<Vec<ExternalPage>> {
    let response = Response::decode(bytes)?;
    if let Some(error) = response.error {
        let reason = error
            .english_popup
            .map(|popup| format!("{}: {}", popup.subject, popup.body))
            .unwrap_or_else(|| String::from("unknown error"));
        return Err(MangadexError::schema(format!("external host refused: {reason}")));
    }
    let viewer = response
        .success
        .and_then(|success| success.manga_viewer)
        .ok_or_else(|| MangadexError::schema("external manifest without viewer"))?;
    Ok(viewer
        .pages
        .into_iter()
        .filter_map(|page| page.manga_page)
        .map(|page| ExternalPage {
            url: page.image_url,
            key: page.encryption_key,
        })
        .collect())
}
