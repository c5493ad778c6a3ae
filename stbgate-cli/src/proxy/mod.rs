//! Portal-impersonating proxy gateway.
//!
//! Players built for the original middleware keep talking their native API;
//! this service answers in its place. `create_link` requests are intercepted
//! and answered with a locally synthesized envelope carrying a freshly
//! resolved link; everything else is forwarded to the real portal with the
//! session's credentials swapped in.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, COOKIE};
use axum::http::{HeaderMap, HeaderValue, Response};
use reqwest::Client;
use stalker_client::{Channel, PortalError, PortalSession, is_edge_challenge};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};

/// Pause before the single retry when the portal's edge answers a forwarded
/// request with a challenge.
const EDGE_RETRY_PAUSE: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct ProxyState {
    session: Arc<PortalSession>,
    /// Channels indexed by their opaque command string, the key players use
    /// in `create_link` requests.
    by_cmd: Arc<HashMap<String, Channel>>,
    /// When set, issued links point at the HLS service on this address
    /// instead of the portal's backend.
    rewrite_to: Option<String>,
}

impl ProxyState {
    pub fn new(
        session: Arc<PortalSession>,
        channels: &HashMap<String, Channel>,
        rewrite_to: Option<String>,
    ) -> Self {
        let by_cmd = channels
            .values()
            .map(|channel| (channel.command.clone(), channel.clone()))
            .collect();
        Self {
            session,
            by_cmd: Arc::new(by_cmd),
            rewrite_to,
        }
    }
}

/// Run the proxy service until the shutdown token fires.
pub async fn serve(bind: String, state: ProxyState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(%bind, "proxy service listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

pub fn router(state: ProxyState) -> Router {
    Router::new()
        .fallback(handle)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle(
    State(state): State<ProxyState>,
    req: Request,
) -> std::result::Result<Response<Body>, GatewayError> {
    let query = req.uri().query().unwrap_or_default();
    let params: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();

    if params.get("action").map(String::as_str) == Some("create_link")
        && params.get("type").map(String::as_str) == Some("itv")
    {
        intercept_create_link(&state, &params).await
    } else {
        forward(&state, req).await
    }
}

/// Answer a `create_link` request locally, in the exact JSON+debug-string
/// shape the original PHP backend produces.
async fn intercept_create_link(
    state: &ProxyState,
    params: &HashMap<String, String>,
) -> std::result::Result<Response<Body>, GatewayError> {
    let cmd = params
        .get("cmd")
        .ok_or_else(|| GatewayError::bad_request("missing cmd parameter"))?;
    let channel = state
        .by_cmd
        .get(cmd)
        .ok_or_else(|| GatewayError::not_found(format!("unknown channel command '{cmd}'")))?;

    let mut link = channel.create_link(false).await?;
    if let Some(hls) = &state.rewrite_to {
        link = format!("http://{hls}/iptv/{}", urlencoding::encode(&channel.title));
    }
    debug!(channel = %channel.title, %link, "synthesized create_link reply");

    let body = link_envelope(&link, &channel.cmd_ch_id, &channel.cmd_id);
    let mut resp = Response::new(Body::from(body));
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(resp)
}

fn forward_client() -> std::result::Result<&'static Client, GatewayError> {
    static CLIENT: OnceLock<std::result::Result<Client, String>> = OnceLock::new();
    let client = CLIENT.get_or_init(|| {
        // Unlike the shared fetch layer this path follows redirects; the
        // forwarded reply must look like it came from the portal itself.
        Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| e.to_string())
    });
    match client {
        Ok(client) => Ok(client),
        Err(message) => Err(GatewayError::bad_gateway(message.clone())),
    }
}

/// Forward any other portal API call upstream, impersonating the session.
async fn forward(
    state: &ProxyState,
    req: Request,
) -> std::result::Result<Response<Body>, GatewayError> {
    let upstream_url = match req.uri().query() {
        Some(query) => format!("{}?{query}", state.session.base_url()),
        None => state.session.base_url().to_string(),
    };

    let client = forward_client()?;
    let request = client
        .get(&upstream_url)
        .headers(remap_headers(req.headers(), &state.session))
        .build()
        .map_err(PortalError::from)?;
    let retry = request.try_clone();

    let mut resp = client.execute(request).await.map_err(PortalError::from)?;
    if is_edge_challenge(resp.status(), resp.headers())
        && let Some(retry_request) = retry
    {
        warn!(url = %upstream_url, status = %resp.status(), "edge challenge on forwarded request, retrying once");
        let _ = resp.bytes().await;
        tokio::time::sleep(EDGE_RETRY_PAUSE).await;
        resp = client
            .execute(retry_request)
            .await
            .map_err(PortalError::from)?;
    }

    let status = resp.status();
    let mut headers = HeaderMap::new();
    for (name, value) in resp.headers() {
        headers.append(name.clone(), value.clone());
    }
    let mut out = Response::new(Body::from_stream(resp.bytes_stream()));
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    Ok(out)
}

/// Selectively remap inbound headers before forwarding: the bearer token and
/// cookie line are replaced with the session's, referers are dropped, and
/// everything else passes through unchanged.
fn remap_headers(from: &HeaderMap, session: &PortalSession) -> HeaderMap {
    let mut to = HeaderMap::new();
    for (name, value) in from {
        match name.as_str() {
            "authorization" => {
                if let Ok(v) = HeaderValue::from_str(&format!("Bearer {}", session.token())) {
                    to.insert(AUTHORIZATION, v);
                }
            }
            "cookie" => {
                let cookie = format!("PHPSESSID=null; {};", session.cookie_line());
                if let Ok(v) = HeaderValue::from_str(&cookie) {
                    to.insert(COOKIE, v);
                }
            }
            "referer" | "referrer" => {}
            // Host and Content-Length belong to our hop, not the portal's.
            "host" | "content-length" => {}
            _ => {
                to.append(name.clone(), value.clone());
            }
        }
    }
    to
}

/// Byte-compatible clone of the original backend's `create_link` reply. The
/// fixed string lengths and counters are part of the template: player
/// firmware matches on the envelope, not on its arithmetic.
fn link_envelope(link: &str, id: &str, link_id: &str) -> String {
    let escaped = escape_link(link);
    let link_id = if link_id.is_empty() { "0" } else { link_id };
    format!(
        "{{\"js\":{{\"id\":\"{id}\",\"cmd\":\"{escaped}\",\"streamer_id\":0,\"link_id\":{link_id},\"load\":0,\"error\":\"\"}},\
         \"text\":\"array(6) {{\\n  [\\\"id\\\"]=>\\n  string(4) \\\"{id}\\\"\\n  [\\\"cmd\\\"]=>\\n  string(99) \\\"{escaped}\\\"\\n  \
         [\\\"streamer_id\\\"]=>\\n  int(0)\\n  [\\\"link_id\\\"]=>\\n  int({link_id})\\n  [\\\"load\\\"]=>\\n  int(0)\\n  \
         [\\\"error\\\"]=>\\n  string(0) \\\"\\\"\\n}}\\ngenerated in: 0.01s; query counter: 8; cache hits: 0; cache miss: 0; php errors: 0; sql errors: 0;\"}}"
    )
}

/// `/` escaped as `\/`, matching the PHP serializer the portal runs.
fn escape_link(link: &str) -> String {
    link.replace('/', "\\/")
}
