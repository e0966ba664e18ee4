use crate::config::{Quality, REPORT_URL, UPLOADS_HOST};
use crate::{MangadexError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, instrument};

const REPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Body of a served page.
#[derive(Debug, Clone)]
pub struct PageResponse {
    pub bytes: Bytes,
    /// The node answered from its own cache (`X-Cache: HIT`).
    pub cached: bool,
}

/// Per-attempt record POSTed to the image network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryReport {
    pub url: String,
    pub success: bool,
    pub bytes: usize,
    /// Milliseconds.
    pub duration: u64,
    pub cached: bool,
}

/// `{base}/{quality}/{hash}/{filename}`
pub fn page_url(base: &str, quality: Quality, hash: &str, filename: &str) -> String {
    format!(
        "{}/{}/{}/{}",
        base.trim_end_matches('/'),
        quality.path_segment(),
        hash,
        filename
    )
}

/// Pages served by the catalog's own upload host are not reported.
pub fn is_first_party(url: &str) -> bool {
    url::Url::parse(url)
        .ok()
        .and_then(|url| url.host_str().map(|host| host == UPLOADS_HOST))
        .unwrap_or(false)
}

/// Page transport of the image network.
#[async_trait]
pub trait ImageNetwork: Send + Sync {
    /// GETs `url`; anything but `200` is an error.
    async fn get(&self, url: &str, timeout: Duration) -> Result<PageResponse>;

    /// Sends a telemetry record. Never fails; problems are only logged.
    async fn report(&self, report: TelemetryReport);

    async fn fetch_page(
        &self,
        base: &str,
        hash: &str,
        quality: Quality,
        filename: &str,
        timeout: Duration,
    ) -> Result<PageResponse> {
        self.get(&page_url(base, quality, hash, filename), timeout)
            .await
    }
}

/// reqwest-backed [`ImageNetwork`].
#[derive(Debug, Clone)]
pub struct NetworkClient {
    http: reqwest::Client,
    report_url: String,
}

impl NetworkClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("mangadex-dl/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            report_url: REPORT_URL.to_string(),
        })
    }

    pub fn with_report_url(mut self, report_url: impl Into<String>) -> Self {
        self.report_url = report_url.into();
        self
    }
}

#[async_trait]
impl ImageNetwork for NetworkClient {
    #[instrument(level = "trace", skip(self))]
    async fn get(&self, url: &str, timeout: Duration) -> Result<PageResponse> {
        let response = self.http.get(url).timeout(timeout).send().await?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(MangadexError::HttpStatus {
                code: status,
                body: String::new(),
            });
        }
        let cached = response
            .headers()
            .get("x-cache")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_uppercase().starts_with("HIT"));
        let bytes = response.bytes().await?;
        Ok(PageResponse { bytes, cached })
    }

    async fn report(&self, report: TelemetryReport) {
        let http = self.http.clone();
        let url = self.report_url.clone();
        // Detached: telemetry must never hold up a download.
        tokio::spawn(async move {
            let sent = http
                .post(&url)
                .timeout(REPORT_TIMEOUT)
                .json(&report)
                .send()
                .await
                .and_then(|r| r.error_for_status());
            if let Err(e) = sent {
                debug!("telemetry for {} not delivered: {e}", report.url);
            }
        });
    }
}
