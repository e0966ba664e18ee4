use crate::{MangadexError, Result};
use bytes::Bytes;
use futures::Future;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::warn;

/// Used when a 429 carries no usable cooldown header.
pub(crate) const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);
const TRANSPORT_RETRIES: u32 = 2;
const TRANSPORT_DELAY: Duration = Duration::from_secs(1);

/// Spaces consecutive requests at least `delay` apart.
///
/// Callers reserve their slot under the lock and sleep outside it, so
/// concurrent callers queue up behind each other instead of racing.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    next_slot: Mutex<Option<Instant>>,
    delay: Duration,
}

impl RateLimiter {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            next_slot: Mutex::new(None),
            delay,
        }
    }

    pub(crate) async fn wait(&self) {
        let slot = {
            let mut next = self.next_slot.lock();
            let now = Instant::now();
            let slot = match *next {
                Some(at) if at > now => at,
                _ => now,
            };
            *next = Some(slot + self.delay);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

/// Status, cooldown hint and body of one catalog answer.
#[derive(Debug, Clone)]
pub(crate) struct RawResponse {
    pub(crate) status: u16,
    pub(crate) retry_after: Option<Duration>,
    pub(crate) body: Bytes,
}

impl RawResponse {
    pub(crate) async fn read(response: reqwest::Response) -> Result<Self> {
        let status = response.status().as_u16();
        let retry_after = retry_after(response.headers());
        let body = response.bytes().await?;
        Ok(Self {
            status,
            retry_after,
            body,
        })
    }
}

/// Reads `Retry-After` (seconds) or the catalog's `X-RateLimit-Retry-After` (unix time).
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
        headers.get(name).and_then(|v| v.to_str().ok())
    }

    if let Some(secs) =
        header(headers, RETRY_AFTER.as_str()).and_then(|v| v.trim().parse::<u64>().ok())
    {
        return Some(Duration::from_secs(secs));
    }
    let until = header(headers, "x-ratelimit-retry-after")?
        .trim()
        .parse::<u64>()
        .ok()?;
    let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
    Some(Duration::from_secs(until.saturating_sub(now).max(1)))
}

/// Sends a request, retrying transport failures a couple of times and a 429 once.
///
/// The second 429 in a row is reported as [`MangadexError::RateLimited`].
pub(crate) async fn send_with_retry<F, Fut>(backoff: Duration, mut send: F) -> Result<RawResponse>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<RawResponse>>,
{
    let mut throttled = false;
    let mut transport_attempts = 0;
    loop {
        let response = match send().await {
            Ok(response) => response,
            Err(MangadexError::Transport(e)) if transport_attempts < TRANSPORT_RETRIES => {
                transport_attempts += 1;
                warn!("catalog request failed ({e}), retrying");
                tokio::time::sleep(TRANSPORT_DELAY).await;
                continue;
            }
            Err(e) => return Err(e),
        };

        if response.status != 429 {
            return Ok(response);
        }
        if throttled {
            return Err(MangadexError::RateLimited);
        }
        throttled = true;
        let cooldown = response.retry_after.unwrap_or(backoff);
        warn!("rate limited, cooling down for {}s", cooldown.as_secs_f32());
        tokio::time::sleep(cooldown).await;
    }
}
