pub mod auth;
mod limit;

use crate::config::{RunConfig, API_ROOT};
use crate::model::{
    AtHomeManifest, Chapter, CollectionResponse, Cover, EntityResponse, Manga, ScanlatorGroup,
};
use crate::{MangadexError, Result};
use async_trait::async_trait;
use auth::{Credentials, Session, SessionStore};
use bytes::Bytes;
use limit::{send_with_retry, RateLimiter, RawResponse, DEFAULT_BACKOFF};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Entity a chapter listing hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParentKind {
    Manga,
    Group,
    User,
    List,
}

impl fmt::Display for ParentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ParentKind::Manga => "manga",
            ParentKind::Group => "group",
            ParentKind::User => "user",
            ParentKind::List => "list",
        })
    }
}

/// Query knobs of a chapter listing.
#[derive(Debug, Clone, Default)]
pub struct ChapterFilter {
    pub languages: Vec<String>,
    pub ascending: bool,
}

impl ChapterFilter {
    pub fn language(mut self, language: impl ToString) -> Self {
        self.languages.push(language.to_string());
        self
    }

    pub fn ascending(mut self, ascending: bool) -> Self {
        self.ascending = ascending;
        self
    }

    /// File-name safe digest of the filter, used to key cached feeds.
    pub(crate) fn key(&self) -> String {
        let languages = if self.languages.is_empty() {
            String::from("all")
        } else {
            self.languages.join("_")
        };
        let order = if self.ascending { "asc" } else { "desc" };
        format!("{languages}-{order}")
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        let order = if self.ascending { "asc" } else { "desc" };
        let mut query = vec![
            ("order[chapter]", order.to_string()),
            ("order[volume]", order.to_string()),
            ("includes[]", String::from("scanlation_group")),
        ];
        for rating in ["safe", "suggestive", "erotica", "pornographic"] {
            query.push(("contentRating[]", rating.to_string()));
        }
        for language in &self.languages {
            query.push(("translatedLanguage[]", language.clone()));
        }
        query
    }
}

/// One page of a paginated chapter listing.
#[derive(Debug, Clone, Default)]
pub struct ChapterPage {
    pub chapters: Vec<Chapter>,
    pub total: u32,
}

/// Typed view of the catalog REST surface.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn get_manga(&self, id: &str) -> Result<Manga>;

    async fn get_chapter(&self, id: &str) -> Result<Chapter>;

    async fn list_chapters(
        &self,
        parent: ParentKind,
        id: &str,
        filter: &ChapterFilter,
        offset: u32,
        limit: u32,
    ) -> Result<ChapterPage>;

    async fn get_athome(&self, chapter_id: &str) -> Result<AtHomeManifest>;

    async fn get_group(&self, id: &str) -> Result<ScanlatorGroup>;

    async fn search_manga(&self, title: &str, limit: u32) -> Result<Vec<Manga>>;

    async fn list_covers(&self, manga_id: &str) -> Result<Vec<Cover>>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Session,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckResponse {
    is_authenticated: bool,
}

/// reqwest-backed [`Catalog`] with throttling, 429 cooldown and session refresh.
pub struct CatalogClient {
    http: reqwest::Client,
    api_root: String,
    timeout: Duration,
    limiter: RateLimiter,
    session: Arc<SessionStore>,
    refresh_lock: Mutex<()>,
}

impl CatalogClient {
    pub fn new(config: &RunConfig, session: Arc<SessionStore>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("mangadex-dl/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            api_root: API_ROOT.to_string(),
            timeout: config.catalog_timeout(),
            limiter: RateLimiter::new(config.request_delay()),
            session,
            refresh_lock: Mutex::new(()),
        })
    }

    pub fn with_api_root(mut self, api_root: impl Into<String>) -> Self {
        self.api_root = api_root.into();
        self
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_root.trim_end_matches('/'), path)
    }

    /// Throttles and sends one request built by `build`, signing it when `sign` is set.
    async fn send<F>(&self, build: &F, sign: bool) -> Result<RawResponse>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let this = self;
        send_with_retry(DEFAULT_BACKOFF, move || async move {
            this.limiter.wait().await;
            let mut request = build().timeout(this.timeout);
            if let Some(token) = this.session.token().filter(|_| sign) {
                request = request.bearer_auth(token);
            }
            RawResponse::read(request.send().await?).await
        })
        .await
    }

    /// Sends a signed request and returns the body of a 2xx answer.
    ///
    /// 401/403 on a signed request triggers a single refresh-and-retry.
    async fn execute<F>(&self, build: F) -> Result<Bytes>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let mut refreshed = false;
        loop {
            let signed = self.session.is_logged_in();
            let response = self.send(&build, true).await?;
            match response.status {
                200..=299 => return Ok(response.body),
                401 | 403 if signed && !refreshed => {
                    refreshed = true;
                    warn!("session rejected, refreshing");
                    self.refresh_session().await?;
                }
                code => return Err(status_error(code, &response.body)),
            }
        }
    }

    async fn get_json<T>(&self, path: &str, query: &[(&str, String)]) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let url = self.url(path);
        debug!(%url, ?query, "catalog GET");
        let bytes = self.execute(|| self.http.get(&url).query(query)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn post_json<T>(&self, path: &str, body: &serde_json::Value) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let url = self.url(path);
        let bytes = self.execute(|| self.http.post(&url).json(body)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    #[instrument(skip(self, credentials), fields(user = %credentials.username))]
    pub async fn login(&self, credentials: &Credentials) -> Result<()> {
        self.session.clear();
        let response: TokenResponse = self
            .post_json(
                "/auth/login",
                &json!({"username": credentials.username, "password": credentials.password}),
            )
            .await
            .map_err(|e| MangadexError::Auth(e.to_string()))?;
        self.session.replace(response.token)?;
        info!("logged in");
        Ok(())
    }

    /// Swaps the refresh token for a new session. Concurrent callers are serialized.
    pub async fn refresh_session(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        let refresh = self
            .session
            .refresh_token()
            .ok_or_else(|| MangadexError::Auth(String::from("no refresh token")))?;
        let url = self.url("/auth/refresh");
        let body = json!({ "token": refresh });
        let response = self
            .send(&|| self.http.post(&url).json(&body), false)
            .await?;
        if !(200..300).contains(&response.status) {
            return Err(MangadexError::Auth(
                status_error(response.status, &response.body).to_string(),
            ));
        }
        let response: TokenResponse = serde_json::from_slice(&response.body)?;
        self.session.replace(response.token)?;
        debug!("session refreshed");
        Ok(())
    }

    pub async fn check_session(&self) -> Result<bool> {
        if !self.session.is_logged_in() {
            return Ok(false);
        }
        let response: CheckResponse = self.get_json("/auth/check", &[]).await?;
        Ok(response.is_authenticated)
    }

    /// Startup flow: verify the stored token, refresh it, and finally ask for credentials.
    pub async fn authenticate(&self, force_prompt: bool) -> Result<()> {
        if !force_prompt && self.session.is_logged_in() {
            match self.check_session().await {
                Ok(true) => return Ok(()),
                Ok(false) | Err(_) => {
                    if self.refresh_session().await.is_ok() {
                        return Ok(());
                    }
                    warn!("stored session expired");
                }
            }
        }
        if force_prompt || self.session.is_logged_in() {
            let credentials = Credentials::prompt()?;
            self.login(&credentials).await?;
        }
        Ok(())
    }
}

fn status_error(code: u16, body: &[u8]) -> MangadexError {
    MangadexError::HttpStatus {
        code,
        body: String::from_utf8_lossy(body).into_owned(),
    }
}

#[async_trait]
impl Catalog for CatalogClient {
    #[instrument(skip(self))]
    async fn get_manga(&self, id: &str) -> Result<Manga> {
        let response: EntityResponse<Manga> = self.get_json(&format!("/manga/{id}"), &[]).await?;
        Ok(response.data)
    }

    #[instrument(skip(self))]
    async fn get_chapter(&self, id: &str) -> Result<Chapter> {
        let query = [("includes[]", String::from("scanlation_group"))];
        let response: EntityResponse<Chapter> =
            self.get_json(&format!("/chapter/{id}"), &query).await?;
        Ok(response.data)
    }

    #[instrument(skip(self, filter))]
    async fn list_chapters(
        &self,
        parent: ParentKind,
        id: &str,
        filter: &ChapterFilter,
        offset: u32,
        limit: u32,
    ) -> Result<ChapterPage> {
        let mut query = filter.query();
        query.push(("offset", offset.to_string()));
        query.push(("limit", limit.to_string()));
        let path = match parent {
            ParentKind::Manga => format!("/manga/{id}/feed"),
            ParentKind::List => format!("/list/{id}/feed"),
            ParentKind::Group => {
                query.push(("groups[]", id.to_string()));
                String::from("/chapter")
            }
            ParentKind::User => {
                query.push(("uploader", id.to_string()));
                String::from("/chapter")
            }
        };
        let response: CollectionResponse<Chapter> = self.get_json(&path, &query).await?;
        Ok(ChapterPage {
            chapters: response.data,
            total: response.total,
        })
    }

    #[instrument(skip(self))]
    async fn get_athome(&self, chapter_id: &str) -> Result<AtHomeManifest> {
        self.get_json(&format!("/at-home/server/{chapter_id}"), &[])
            .await
    }

    #[instrument(skip(self))]
    async fn get_group(&self, id: &str) -> Result<ScanlatorGroup> {
        let response: EntityResponse<ScanlatorGroup> =
            self.get_json(&format!("/group/{id}"), &[]).await?;
        Ok(response.data)
    }

    #[instrument(skip(self))]
    async fn search_manga(&self, title: &str, limit: u32) -> Result<Vec<Manga>> {
        let query = [
            ("title", title.to_string()),
            ("limit", limit.to_string()),
            ("order[relevance]", String::from("desc")),
        ];
        let response: CollectionResponse<Manga> = self.get_json("/manga", &query).await?;
        Ok(response.data)
    }

    #[instrument(skip(self))]
    async fn list_covers(&self, manga_id: &str) -> Result<Vec<Cover>> {
        let query = [
            ("manga[]", manga_id.to_string()),
            ("limit", String::from("100")),
        ];
        let response: CollectionResponse<Cover> = self.get_json("/cover", &query).await?;
        Ok(response.data)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn test_filter_query() {
        let query = ChapterFilter::default().language("fr").query();
        assert!(query.contains(&("translatedLanguage[]", String::from("fr"))));
        assert!(query.contains(&("order[chapter]", String::from("desc"))));
        assert!(query.contains(&("order[volume]", String::from("desc"))));

        let keys: Vec<&str> = query.iter().map(|(k, _)| *k).collect();
        assert_eq!(&keys[..2], &["order[chapter]", "order[volume]"]);

        let query = ChapterFilter::default().ascending(true).query();
        assert!(query.contains(&("order[chapter]", String::from("asc"))));
        assert!(!query.iter().any(|(k, _)| *k == "translatedLanguage[]"));
    }

    #[test]
    fn test_filter_key() {
        assert_eq!(ChapterFilter::default().key(), "all-desc");
        let filter = ChapterFilter::default().language("en").language("fr").ascending(true);
        assert_eq!(filter.key(), "en_fr-asc");
    }

    /// Answers every connection with `respond(request)` over HTTP/1.1 and
    /// keeps the raw requests it saw.
    async fn serve<F>(respond: F) -> (String, Arc<parking_lot::Mutex<Vec<String>>>)
    where
        F: Fn(&str) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let root = format!("http://{}", listener.local_addr().unwrap());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let request = read_request(&mut socket).await;
                let (status, body) = respond(&request);
                log.lock().push(request);
                let response = format!(
                    "HTTP/1.1 {status} Stub\r\ncontent-type: application/json\r\n\
                     content-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
        });
        (root, seen)
    }

    /// Head plus `content-length` bytes of body, lowercased.
    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_lowercase();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_lowercase()
    }

    fn client(root: &str, session: &Arc<SessionStore>) -> CatalogClient {
        let config = RunConfig {
            request_delay: Duration::ZERO,
            ..RunConfig::default()
        };
        let mut client = CatalogClient::new(&config, session.clone())
            .unwrap()
            .with_api_root(root);
        client.http = reqwest::Client::builder().no_proxy().build().unwrap();
        client
    }

    fn logged_in() -> Arc<SessionStore> {
        let session = Arc::new(SessionStore::in_memory());
        session
            .replace(Session {
                session: String::from("old"),
                refresh: String::from("r1"),
            })
            .unwrap();
        session
    }

    fn refreshed_token() -> String {
        json!({"result": "ok", "token": {"session": "new", "refresh": "r2"}}).to_string()
    }

    #[tokio::test]
    async fn test_rejected_session_is_refreshed_and_retried() {
        let (root, seen) = serve(|request| {
            if request.starts_with("post /auth/refresh") {
                (200, refreshed_token())
            } else if request.contains("authorization: bearer new") {
                let manga = json!({"result": "ok", "data": {
                    "id": "m1", "attributes": {"title": {"en": "Fresh"}}
                }});
                (200, manga.to_string())
            } else {
                (401, String::from("{}"))
            }
        })
        .await;
        let session = logged_in();

        let manga = client(&root, &session).get_manga("m1").await.unwrap();
        assert_eq!(manga.id, "m1");
        assert_eq!(session.token().as_deref(), Some("new"));
        assert_eq!(session.refresh_token().as_deref(), Some("r2"));

        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 3);
        assert!(seen[0].starts_with("get /manga/m1"));
        assert!(seen[0].contains("authorization: bearer old"));
        assert!(seen[1].starts_with("post /auth/refresh"));
        assert!(seen[1].contains("\"token\":\"r1\""));
        assert!(!seen[1].contains("authorization:"));
        assert!(seen[2].contains("authorization: bearer new"));
    }

    #[tokio::test]
    async fn test_second_rejection_is_returned() {
        let (root, seen) = serve(|request| {
            if request.starts_with("post /auth/refresh") {
                (200, refreshed_token())
            } else {
                (403, String::from("{\"result\":\"error\"}"))
            }
        })
        .await;
        let session = logged_in();

        let result = client(&root, &session).get_manga("m1").await;
        assert!(matches!(result, Err(MangadexError::HttpStatus { code: 403, .. })));
        // One refresh, then the retried request; no further attempts.
        assert_eq!(seen.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_anonymous_rejection_is_not_refreshed() {
        let (root, seen) = serve(|_| (401, String::from("{}"))).await;
        let session = Arc::new(SessionStore::in_memory());

        let result = client(&root, &session).get_manga("m1").await;
        assert!(matches!(result, Err(MangadexError::HttpStatus { code: 401, .. })));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_url_join() {
        let client = CatalogClient::new(&RunConfig::default(), Arc::new(SessionStore::in_memory()))
            .unwrap()
            .with_api_root("http://localhost:1234/");
        assert_eq!(client.url("/manga/x"), "http://localhost:1234/manga/x");
    }
}
