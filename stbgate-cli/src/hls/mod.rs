//! HLS gateway.
//!
//! Serves the catalog to ordinary players: `/iptv` lists every channel as an
//! extended M3U playlist, `/iptv/{title}` resolves a fresh portal link and
//! relays it, and `/iptv/{title}/media` carries the rewritten segment and
//! variant URIs of HLS playlists back through the gateway.

mod playlist;

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::{
    CACHE_CONTROL, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, DATE, HOST, TRANSFER_ENCODING,
};
use axum::http::{HeaderMap, HeaderValue, Response};
use axum::routing::get;
use serde::Deserialize;
use stalker_client::{Channel, fetch_response};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::{GatewayError, Result};

#[derive(Clone)]
struct HlsState {
    channels: Arc<HashMap<String, Channel>>,
}

/// Run the HLS service until the shutdown token fires.
pub async fn serve(
    bind: String,
    channels: Arc<HashMap<String, Channel>>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(%bind, "HLS service listening");
    axum::serve(listener, router(channels))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

pub fn router(channels: Arc<HashMap<String, Channel>>) -> Router {
    Router::new()
        .route("/iptv", get(channel_list))
        .route("/iptv/{title}", get(channel_stream))
        .route("/iptv/{title}/media", get(media_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(HlsState { channels })
}

/// Extended M3U listing of the whole catalog, with logos and genre groups,
/// pointing every entry back at this gateway.
async fn channel_list(State(state): State<HlsState>, headers: HeaderMap) -> Response<Body> {
    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");

    let mut titles: Vec<&String> = state.channels.keys().collect();
    titles.sort();

    let mut out = String::from("#EXTM3U\n");
    for title in titles {
        let channel = &state.channels[title];
        out.push_str(&format!(
            "#EXTINF:-1 tvg-logo=\"{}\" group-title=\"{}\",{}\nhttp://{}/iptv/{}\n",
            channel.logo_url(),
            channel.genre(),
            title,
            host,
            urlencoding::encode(title),
        ));
    }

    let mut resp = Response::new(Body::from(out));
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("audio/x-mpegurl"));
    resp
}

async fn channel_stream(
    State(state): State<HlsState>,
    Path(title): Path<String>,
) -> std::result::Result<Response<Body>, GatewayError> {
    let channel = state
        .channels
        .get(&title)
        .ok_or_else(|| GatewayError::not_found(format!("unknown channel '{title}'")))?;
    let link = channel.create_link(false).await?;
    relay_upstream(channel, &title, &link).await
}

#[derive(Debug, Deserialize)]
struct MediaQuery {
    u: String,
}

async fn media_stream(
    State(state): State<HlsState>,
    Path(title): Path<String>,
    Query(query): Query<MediaQuery>,
) -> std::result::Result<Response<Body>, GatewayError> {
    let channel = state
        .channels
        .get(&title)
        .ok_or_else(|| GatewayError::not_found(format!("unknown channel '{title}'")))?;
    let target = url::Url::parse(&query.u)
        .map_err(|e| GatewayError::bad_request(format!("invalid url: {e}")))?;
    if !matches!(target.scheme(), "http" | "https") {
        return Err(GatewayError::bad_request("only http/https URLs are allowed"));
    }
    relay_upstream(channel, &title, target.as_str()).await
}

/// Fetch the upstream URL with the portal session attached, classify the
/// payload and relay it: playlists are rewritten through this gateway,
/// everything else streams through untouched.
async fn relay_upstream(
    channel: &Channel,
    title: &str,
    link: &str,
) -> std::result::Result<Response<Body>, GatewayError> {
    let session = channel.session();
    let upstream = fetch_response(link, Some(session), Some(&session.stream_referer())).await?;
    let status = upstream.status();
    let content_type = upstream
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    match classify(&content_type) {
        LinkKind::Playlist => {
            let headers = forward_headers(upstream.headers(), false);
            let base = upstream.url().clone();
            let body = upstream
                .bytes()
                .await
                .map_err(stalker_client::PortalError::from)?;
            let body = match playlist::rewrite(&body, &base, title) {
                Ok(rewritten) => rewritten,
                Err(e) => {
                    // Serve the original bytes rather than failing playback.
                    warn!(%base, error = %e, "playlist rewrite failed, passing through");
                    body.to_vec()
                }
            };
            let mut resp = Response::new(Body::from(body));
            *resp.status_mut() = status;
            *resp.headers_mut() = headers;
            Ok(resp)
        }
        LinkKind::Media => {
            let headers = forward_headers(upstream.headers(), true);
            let mut resp = Response::new(Body::from_stream(upstream.bytes_stream()));
            *resp.status_mut() = status;
            *resp.headers_mut() = headers;
            Ok(resp)
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LinkKind {
    Playlist,
    Media,
}

fn classify(content_type: &str) -> LinkKind {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "application/vnd.apple.mpegurl" | "application/x-mpegurl" => LinkKind::Playlist,
        _ => LinkKind::Media,
    }
}

/// Copy the player-relevant upstream headers. `Content-Length` is forwarded
/// only for unaltered media: players stop reading chunked HLS bodies early
/// when it is present.
fn forward_headers(from: &HeaderMap, include_content_length: bool) -> HeaderMap {
    let mut to = HeaderMap::new();
    for name in [CONNECTION, CONTENT_TYPE, TRANSFER_ENCODING, CACHE_CONTROL, DATE] {
        if let Some(value) = from.get(&name) {
            to.insert(name, value.clone());
        }
    }
    if include_content_length
        && let Some(value) = from.get(CONTENT_LENGTH)
    {
        to.insert(CONTENT_LENGTH, value.clone());
    }
    to
}
