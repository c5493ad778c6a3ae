//! Channel directory.
//!
//! Converts the portal's raw channel/genre listing into an in-memory catalog
//! keyed by channel title. A [`Channel`] knows how to ask the portal for a
//! fresh playable link; links expire within seconds so nothing here caches
//! them — every player request goes back over the wire.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};
use url::Url;

use crate::error::PortalError;
use crate::fetch::fetch;
use crate::models::{ChannelList, Envelope, GenreEntry};
use crate::session::{AuthMethod, PortalSession};

/// Genre ID → human title, one snapshot per catalog build.
pub type GenreMap = HashMap<String, String>;

/// One catalog entry: how to retrieve a working URL for a TV channel, not
/// the stream itself.
#[derive(Clone, Debug)]
pub struct Channel {
    /// Display title; the catalog key.
    pub title: String,
    /// Opaque portal-internal stream identifier.
    pub command: String,
    /// Logo path fragment as listed by the portal.
    pub logo: String,
    pub genre_id: String,
    /// `cmds[0].id` from the listing; only used to synthesize proxy replies.
    pub cmd_id: String,
    /// `cmds[0].ch_id` from the listing; only used to synthesize proxy replies.
    pub cmd_ch_id: String,
    session: Arc<PortalSession>,
    genres: Arc<GenreMap>,
}

impl Channel {
    pub fn session(&self) -> &Arc<PortalSession> {
        &self.session
    }

    /// Genre title for this channel, falling back to "Other" for IDs the
    /// portal never described.
    pub fn genre(&self) -> String {
        let title = self
            .genres
            .get(&self.genre_id)
            .map(String::as_str)
            .unwrap_or("Other");
        title_case(title)
    }

    /// Full URL of the channel logo, empty when the portal listed none.
    pub fn logo_url(&self) -> String {
        if self.logo.is_empty() {
            return String::new();
        }
        logo_url(self.session.base_url().as_str(), &self.logo)
    }

    /// Retrieve a fresh playable link for this channel.
    ///
    /// A decode failure usually means the session expired, so on the first
    /// attempt the session re-authenticates (with whichever method it was
    /// built with) and the request is retried exactly once. The second
    /// failure — or a failed re-authentication — surfaces the original
    /// error.
    pub async fn create_link(&self, retry: bool) -> Result<String, PortalError> {
        let err = match self.session.request_link(&self.command).await {
            Ok(link) => return Ok(link),
            Err(err) => err,
        };
        if retry
            || !err.is_session_invalid()
            || self.session.auth_method() == AuthMethod::None
        {
            return Err(err);
        }

        warn!(channel = %self.title, error = %err, "link request failed, re-authenticating");
        if let Err(auth_err) = self.session.reauthenticate().await {
            warn!(error = %auth_err, "re-authentication failed");
            return Err(err);
        }
        info!(channel = %self.title, "re-authenticated, retrying link request");
        Box::pin(self.create_link(true)).await
    }
}

/// Derive the logo base from the portal URL: everything up to and including
/// a `/stalker_portal/` path segment when present, `/stalker_portal/` at the
/// host root otherwise. Query and fragment are dropped.
fn logo_url(portal_url: &str, logo: &str) -> String {
    const ROOT: &str = "/stalker_portal/";

    let Ok(mut url) = Url::parse(portal_url) else {
        return format!(
            "{}{}misc/logos/320/{}",
            portal_url.trim_end_matches('/'),
            ROOT,
            logo
        );
    };
    let root = match url.path().find(ROOT) {
        Some(idx) => url.path()[..idx + ROOT.len()].to_string(),
        None => ROOT.to_string(),
    };
    url.set_path(&format!("{}/misc/logos/320/{}", root.trim_end_matches('/'), logo));
    url.set_query(None);
    url.set_fragment(None);
    url.to_string()
}

/// Uppercase the first letter of every whitespace-separated word.
fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Retrieve all TV channels from the portal, keyed by title.
///
/// Genres are fetched as part of every build — the portal can reshuffle
/// them, and a catalog build is rare enough that caching buys nothing. A
/// malformed envelope from either call fails the whole build.
pub async fn retrieve_channels(
    session: &Arc<PortalSession>,
) -> Result<HashMap<String, Channel>, PortalError> {
    let url = session.api_url("type=itv&action=get_all_channels&JsHttpRequest=1-xml");
    let (body, _) = fetch(&url, Some(session)).await?;
    let envelope: Envelope<ChannelList> = serde_json::from_slice(&body)?;

    let genres = Arc::new(retrieve_genres(session).await?);

    let mut channels = HashMap::with_capacity(envelope.js.data.len());
    for entry in envelope.js.data {
        let (cmd_id, cmd_ch_id) = entry
            .cmds
            .first()
            .map(|c| (c.id.clone(), c.ch_id.clone()))
            .unwrap_or_default();
        channels.insert(
            entry.name.clone(),
            Channel {
                title: entry.name,
                command: entry.cmd,
                logo: entry.logo,
                genre_id: entry.genre_id,
                cmd_id,
                cmd_ch_id,
                session: Arc::clone(session),
                genres: Arc::clone(&genres),
            },
        );
    }
    info!(channels = channels.len(), "catalog built");
    Ok(channels)
}

async fn retrieve_genres(session: &Arc<PortalSession>) -> Result<GenreMap, PortalError> {
    let url = session.api_url("action=get_genres&type=itv&JsHttpRequest=1-xml");
    let (body, _) = fetch(&url, Some(session)).await?;
    let envelope: Envelope<Vec<GenreEntry>> = serde_json::from_slice(&body)?;
    Ok(envelope
        .js
        .into_iter()
        .map(|genre| (genre.id, genre.title))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::PortalConfig;
    use axum::Router;
    use axum::body::Body;
    use axum::extract::{Request, State};
    use axum::http::Response as AxumResponse;
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Stub {
        responses: Mutex<VecDeque<&'static str>>,
        queries: Mutex<Vec<String>>,
    }

    async fn stub_handler(State(stub): State<Arc<Stub>>, req: Request) -> AxumResponse<Body> {
        stub.queries
            .lock()
            .unwrap()
            .push(req.uri().query().unwrap_or_default().to_string());
        let body = stub
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(r#"{"js":{}}"#);
        AxumResponse::builder()
            .header("Content-Type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    async fn portal(responses: Vec<&'static str>) -> (Arc<Stub>, SocketAddr) {
        let stub = Arc::new(Stub {
            responses: Mutex::new(responses.into()),
            queries: Mutex::new(Vec::new()),
        });
        let router = Router::new().fallback(stub_handler).with_state(stub.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (stub, addr)
    }

    fn session_at(addr: SocketAddr, with_credentials: bool) -> Arc<PortalSession> {
        Arc::new(
            PortalSession::new(PortalConfig {
                url: format!("http://{addr}/stalker_portal/server/load.php"),
                model: "MAG254".to_string(),
                serial_number: "SN1".to_string(),
                device_id: "D1".to_string(),
                device_id2: "D2".to_string(),
                mac: "AA:BB:CC:DD:EE:FF".to_string(),
                time_zone: "Europe/London".to_string(),
                token: "CAFE".to_string(),
                username: if with_credentials { "user".into() } else { String::new() },
                password: if with_credentials { "pass".into() } else { String::new() },
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn channel(session: &Arc<PortalSession>, genres: GenreMap, genre_id: &str) -> Channel {
        Channel {
            title: "Test TV".to_string(),
            command: "ffmpeg http://portal.internal/ch/99".to_string(),
            logo: "test.png".to_string(),
            genre_id: genre_id.to_string(),
            cmd_id: "4090".to_string(),
            cmd_ch_id: "2".to_string(),
            session: Arc::clone(session),
            genres: Arc::new(genres),
        }
    }

    const CHANNELS_BODY: &str = r#"{"js":{"data":[
        {"name":"News One","cmd":"ffmpeg http://p/1","logo":"news.png","tv_genre_id":"3","cmds":[{"id":"41","ch_id":"7"}]},
        {"name":"Bare","cmd":"ffmpeg http://p/2","logo":"","tv_genre_id":"9","cmds":[]}
    ]}}"#;
    const GENRES_BODY: &str = r#"{"js":[{"id":"3","title":"news"}]}"#;

    #[tokio::test]
    async fn catalog_build_maps_titles_and_aux_ids() {
        let (_, addr) = portal(vec![CHANNELS_BODY, GENRES_BODY]).await;
        let session = session_at(addr, false);
        let channels = retrieve_channels(&session).await.unwrap();

        assert_eq!(channels.len(), 2);
        let news = &channels["News One"];
        assert_eq!(news.command, "ffmpeg http://p/1");
        assert_eq!(news.cmd_id, "41");
        assert_eq!(news.cmd_ch_id, "7");
        assert_eq!(news.genre(), "News");

        // No cmds rows: empty aux IDs, not an error.
        let bare = &channels["Bare"];
        assert_eq!(bare.cmd_id, "");
        assert_eq!(bare.cmd_ch_id, "");
        assert_eq!(bare.genre(), "Other");
        assert_eq!(bare.logo_url(), "");
    }

    #[tokio::test]
    async fn malformed_listing_fails_the_whole_build() {
        let (_, addr) = portal(vec!["<html>nope</html>"]).await;
        let session = session_at(addr, false);
        let err = retrieve_channels(&session).await.unwrap_err();
        assert!(matches!(err, PortalError::Json(_)));
    }

    #[tokio::test]
    async fn create_link_reauthenticates_exactly_once() {
        let (stub, addr) = portal(vec![
            "<html>session expired</html>",
            r#"{"js":true}"#,
            r#"{"js":{"cmd":"ffmpeg http://cdn/ok.ts"}}"#,
        ])
        .await;
        let session = session_at(addr, true);
        let link = channel(&session, GenreMap::new(), "1")
            .create_link(false)
            .await
            .unwrap();
        assert_eq!(link, "http://cdn/ok.ts");

        let queries = stub.queries.lock().unwrap();
        assert_eq!(queries.len(), 3);
        assert!(queries[0].contains("action=create_link"));
        assert!(queries[1].contains("action=do_auth"));
        assert!(queries[2].contains("action=create_link"));
    }

    #[tokio::test]
    async fn a_second_malformed_response_is_terminal() {
        let (stub, addr) = portal(vec![
            "<html>expired</html>",
            r#"{"js":true}"#,
            "<html>still expired</html>",
        ])
        .await;
        let session = session_at(addr, true);
        let err = channel(&session, GenreMap::new(), "1")
            .create_link(false)
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::Json(_)));
        assert_eq!(stub.queries.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn no_auth_method_surfaces_the_original_error() {
        let (stub, addr) = portal(vec!["<html>expired</html>"]).await;
        let session = session_at(addr, false);
        let err = channel(&session, GenreMap::new(), "1")
            .create_link(false)
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::Json(_)));
        assert_eq!(stub.queries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn every_resolution_goes_over_the_wire() {
        let (stub, addr) = portal(vec![
            r#"{"js":{"cmd":"ffmpeg http://cdn/a.ts"}}"#,
            r#"{"js":{"cmd":"ffmpeg http://cdn/b.ts"}}"#,
        ])
        .await;
        let session = session_at(addr, true);
        let ch = channel(&session, GenreMap::new(), "1");
        assert_eq!(ch.create_link(false).await.unwrap(), "http://cdn/a.ts");
        assert_eq!(ch.create_link(false).await.unwrap(), "http://cdn/b.ts");
        assert_eq!(stub.queries.lock().unwrap().len(), 2);
    }

    #[test]
    fn genre_lookup_falls_back_to_other() {
        let session = Arc::new(
            PortalSession::new(PortalConfig {
                url: "http://portal.example/c/".to_string(),
                model: "MAG254".to_string(),
                serial_number: "SN1".to_string(),
                device_id: "D1".to_string(),
                device_id2: "D2".to_string(),
                mac: "AA:BB:CC:DD:EE:FF".to_string(),
                time_zone: "Europe/London".to_string(),
                token: "CAFE".to_string(),
                ..Default::default()
            })
            .unwrap(),
        );
        let mut genres = GenreMap::new();
        genres.insert("3".to_string(), "local news".to_string());

        assert_eq!(channel(&session, genres.clone(), "3").genre(), "Local News");
        assert_eq!(channel(&session, genres, "404").genre(), "Other");
    }

    #[test]
    fn logo_base_honors_a_stalker_portal_segment() {
        assert_eq!(
            logo_url("http://p.example/stalker_portal/server/load.php", "x.png"),
            "http://p.example/stalker_portal/misc/logos/320/x.png"
        );
        assert_eq!(
            logo_url("http://p.example/c/?a=1#frag", "x.png"),
            "http://p.example/stalker_portal/misc/logos/320/x.png"
        );
        // Unparseable portal URL: append the fixed suffix to the raw value.
        assert_eq!(
            logo_url("not a url/", "x.png"),
            "not a url/stalker_portal/misc/logos/320/x.png"
        );
    }
}
