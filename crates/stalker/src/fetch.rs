//! Resilient outbound fetch.
//!
//! Every request to the portal (and to the media backends it hands out) goes
//! through this layer. It sends portal-shaped browser headers, resolves
//! redirects manually, and recognizes edge-protection challenges (Cloudflare
//! and friends) so a transient block does not immediately kill the request.

use std::sync::OnceLock;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{self, HeaderMap, HeaderValue, LOCATION};
use reqwest::{Client, Request, Response, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::error::PortalError;
use crate::session::{PortalSession, REQUEST_TIMEOUT};

/// Spoofed desktop browser, used when no operator override is configured.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Legacy MAG firmware user agent, sent on session-less fetches.
pub const STB_USER_AGENT: &str = "Mozilla/5.0 (QtEmbedded; U; Linux; C) AppleWebKit/533.3 (KHTML, like Gecko) MAG200 stbapp ver: 4 rev: 2116 Mobile Safari/533.3";

/// Manual redirect resolution gives up after this many hops.
const MAX_REDIRECTS: usize = 10;

/// Backoff schedule for edge-challenge retries.
///
/// Delays grow exponentially from `initial_delay` and are capped at
/// `max_delay`; `max_attempts` counts requests, not waits.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(3),
            backoff_multiplier: 2,
            max_delay: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after the given 1-based attempt was blocked.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// True when the response is an automated edge-protection block rather than
/// a real portal answer: 403/503 plus a provider signature (`Server` header
/// naming cloudflare, or a `CF-RAY` id).
pub fn is_edge_challenge(status: StatusCode, headers: &HeaderMap) -> bool {
    if status != StatusCode::FORBIDDEN && status != StatusCode::SERVICE_UNAVAILABLE {
        return false;
    }
    let server = headers
        .get(header::SERVER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    server.to_ascii_lowercase().contains("cloudflare") || headers.contains_key("cf-ray")
}

fn fallback_client() -> Result<&'static Client, PortalError> {
    static CLIENT: OnceLock<Result<Client, String>> = OnceLock::new();
    let client = CLIENT.get_or_init(|| {
        Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| e.to_string())
    });
    match client {
        Ok(client) => Ok(client),
        Err(message) => Err(PortalError::Other(message.clone())),
    }
}

fn header_value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap_or(HeaderValue::from_static(""))
}

/// Browser-like header set the portal expects. With a session the full
/// STB-plus-Chrome profile is sent (cookies, bearer token, client hints);
/// without one only the legacy STB user agent.
fn build_request(
    client: &Client,
    url: Url,
    session: Option<&PortalSession>,
    referer: Option<&str>,
) -> Result<Request, PortalError> {
    let mut headers = HeaderMap::new();
    match session {
        Some(session) => {
            headers.insert(header::USER_AGENT, header_value(session.user_agent()));
            headers.insert(
                header::ACCEPT,
                HeaderValue::from_static(
                    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
                ),
            );
            headers.insert(
                header::ACCEPT_LANGUAGE,
                HeaderValue::from_static("en-US,en;q=0.5"),
            );
            headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
            headers.insert(
                "X-Requested-With",
                HeaderValue::from_static("XMLHttpRequest"),
            );
            headers.insert(
                "X-User-Agent",
                header_value(&format!("Model: {}; Link: Ethernet", session.model)),
            );
            headers.insert(
                header::AUTHORIZATION,
                header_value(&format!("Bearer {}", session.token())),
            );
            headers.insert(header::ORIGIN, header_value(&session.origin()));
            headers.insert(
                header::REFERER,
                header_value(referer.unwrap_or(session.base_url().as_str())),
            );
            headers.insert("Sec-Fetch-Dest", HeaderValue::from_static("empty"));
            headers.insert("Sec-Fetch-Mode", HeaderValue::from_static("cors"));
            headers.insert("Sec-Fetch-Site", HeaderValue::from_static("same-origin"));
            headers.insert(
                "Sec-CH-UA",
                HeaderValue::from_static(r#""Chromium";v="126", "Not.A/Brand";v="24""#),
            );
            headers.insert("Sec-CH-UA-Mobile", HeaderValue::from_static("?0"));
            headers.insert("Sec-CH-UA-Platform", HeaderValue::from_static(r#""Windows""#));
            headers.insert(header::COOKIE, header_value(&session.cookie_line()));
        }
        None => {
            headers.insert(header::USER_AGENT, HeaderValue::from_static(STB_USER_AGENT));
            if let Some(referer) = referer {
                headers.insert(header::REFERER, header_value(referer));
            }
        }
    }
    Ok(client.get(url).headers(headers).build()?)
}

/// Execute a request, retrying while the response is an edge challenge.
///
/// The request is cloned before every send so a consumed body is never
/// reused. After the final attempt the still-blocked response is returned
/// as-is; callers treat an HTML body as the failure signal.
pub(crate) async fn send_with_retry(
    client: &Client,
    req: Request,
    policy: &RetryPolicy,
) -> Result<Response, PortalError> {
    let mut attempt = 1u32;
    loop {
        let current = req
            .try_clone()
            .ok_or_else(|| PortalError::Other("request cannot be cloned".to_string()))?;
        let resp = client.execute(current).await?;
        if attempt >= policy.max_attempts.max(1)
            || !is_edge_challenge(resp.status(), resp.headers())
        {
            return Ok(resp);
        }
        // Drain so the connection goes back to the pool.
        let status = resp.status();
        let _ = resp.bytes().await;
        let delay = policy.delay_for_attempt(attempt);
        warn!(
            url = %req.url(),
            %status,
            attempt,
            delay_secs = delay.as_secs_f32(),
            "edge challenge detected, backing off"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Resolve a `Location` header against the URL that produced it. Handles
/// both absolute and relative forms.
pub(crate) fn resolve_redirect(current: &Url, location: &str) -> Result<Url, PortalError> {
    current
        .join(location)
        .map_err(|e| PortalError::InvalidUrl(format!("{location}: {e}")))
}

pub async fn fetch_response(
    url: &str,
    session: Option<&PortalSession>,
    referer: Option<&str>,
) -> Result<Response, PortalError> {
    fetch_response_with_policy(url, session, referer, &RetryPolicy::default()).await
}

pub(crate) async fn fetch_response_with_policy(
    url: &str,
    session: Option<&PortalSession>,
    referer: Option<&str>,
    policy: &RetryPolicy,
) -> Result<Response, PortalError> {
    let client = match session {
        Some(session) => session.client(),
        None => fallback_client()?,
    };
    let mut current =
        Url::parse(url).map_err(|e| PortalError::InvalidUrl(format!("{url}: {e}")))?;

    for _ in 0..MAX_REDIRECTS {
        let req = build_request(client, current.clone(), session, referer)?;
        let resp = send_with_retry(client, req, policy).await?;
        let status = resp.status();

        if status.is_success() || is_edge_challenge(status, resp.headers()) {
            // A still-blocked response after retry exhaustion is handed back
            // unconsumed; the caller recognizes the HTML body.
            return Ok(resp);
        }
        if status.is_redirection() {
            let location = resp
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    PortalError::InvalidUrl(format!("{current}: redirect without Location"))
                })?
                .to_string();
            debug!(from = %current, to = %location, "following redirect");
            current = resolve_redirect(&current, &location)?;
            continue;
        }
        return Err(PortalError::Status {
            url: current.to_string(),
            status,
        });
    }
    Err(PortalError::RedirectLoop(url.to_string()))
}

/// Fetch a URL to completion, returning the body and its content type.
pub async fn fetch(
    url: &str,
    session: Option<&PortalSession>,
) -> Result<(Bytes, String), PortalError> {
    let resp = fetch_response(url, session, None).await?;
    let content_type = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = resp.bytes().await?;
    Ok((body, content_type))
}

/// Leading `<` means the portal (or the edge in front of it) answered with
/// an HTML page where JSON was expected.
pub fn is_html(body: &[u8]) -> bool {
    body.first() == Some(&b'<')
}
