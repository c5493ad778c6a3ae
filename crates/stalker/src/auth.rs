//! Authentication state machine.
//!
//! A session moves linearly through `Unauthenticated → TokenReserved →
//! Authenticated`: an optional warm-up GET, the token handshake, then
//! exactly one of the two authentication flows. The only way back is the
//! channel resolver's one-shot reauthentication after a session-expiry
//! signal.

use reqwest::header;
use tracing::{debug, info, warn};

use crate::error::PortalError;
use crate::fetch::{fetch, is_edge_challenge, is_html};
use crate::models::{Envelope, HandshakePayload, LinkPayload, ProfilePayload};
use crate::session::{AuthMethod, PortalSession};

const BLOCKED_HINT: &str =
    "set portal.cookies (cf_clearance, etc.) and portal.user_agent to match a browser that cleared the challenge";

impl PortalSession {
    /// Run the full startup sequence: warm-up, handshake, authentication,
    /// and one immediate watchdog call. Handshake and authentication
    /// failures are fatal; the watchdog call is not.
    pub async fn start(&self) -> Result<(), PortalError> {
        self.warmup().await?;
        self.handshake().await?;
        match self.auth_method() {
            AuthMethod::Credentials => self.authenticate().await?,
            AuthMethod::DeviceIds => self.authenticate_with_device_ids().await?,
            AuthMethod::None => {}
        }
        if let Err(e) = self.watchdog_tick().await {
            warn!(error = %e, "initial watchdog update failed");
        }
        Ok(())
    }

    /// Plain GET against the base URL so the transport can pick up any
    /// challenge-clearance cookies before the handshake. A block here means
    /// the operator has to supply a matching cookie/user-agent pair.
    pub(crate) async fn warmup(&self) -> Result<(), PortalError> {
        let resp = self
            .client()
            .get(self.base_url().clone())
            .header(header::USER_AGENT, self.user_agent())
            .header(header::ACCEPT, "*/*")
            .header(header::ACCEPT_LANGUAGE, "en-US,en;q=0.5")
            .header(header::ORIGIN, self.origin())
            .header(header::REFERER, self.base_url().as_str())
            .header("Sec-Fetch-Dest", "empty")
            .header("Sec-Fetch-Mode", "navigate")
            .header("Sec-Fetch-Site", "none")
            .header(header::COOKIE, self.cookie_line())
            .send()
            .await?;
        let blocked = is_edge_challenge(resp.status(), resp.headers());
        let body = resp.bytes().await.unwrap_or_default();
        if blocked {
            debug!(body = %String::from_utf8_lossy(&body), "warmup blocked");
            return Err(PortalError::Blocked(format!(
                "portal warmup was challenged; {BLOCKED_HINT}"
            )));
        }
        Ok(())
    }

    /// Reserve or renew the bearer token.
    ///
    /// An HTML body means the edge (or an invalid token) got in the way; the
    /// call is retried once without the token parameter, since many portals
    /// will simply mint a fresh one. A `token` field in the reply replaces
    /// the session token; its absence means the offered token stays valid.
    pub async fn handshake(&self) -> Result<(), PortalError> {
        let with_token = self.api_url(&format!(
            "type=stb&action=handshake&token={}&JsHttpRequest=1-xml",
            urlencoding::encode(&self.token())
        ));
        let (mut body, _) = fetch(&with_token, Some(self)).await?;

        if is_html(&body) {
            let without_token = self.api_url("type=stb&action=handshake&JsHttpRequest=1-xml");
            let (retry_body, _) = fetch(&without_token, Some(self)).await?;
            if is_html(&retry_body) {
                debug!(body = %String::from_utf8_lossy(&retry_body), "handshake blocked");
                return Err(PortalError::Blocked(format!(
                    "handshake was answered with HTML; {BLOCKED_HINT}"
                )));
            }
            body = retry_body;
        }

        let envelope: Envelope<HandshakePayload> = serde_json::from_slice(&body)?;
        if let Some(token) = envelope.js.token
            && !token.is_empty()
        {
            debug!("portal issued a fresh token");
            self.set_token(token);
        }
        Ok(())
    }

    /// Associate credentials with the reserved token (`action=do_auth`).
    pub async fn authenticate(&self) -> Result<(), PortalError> {
        let url = self.api_url(&format!(
            "type=stb&action=do_auth&login={}&password={}&device_id={}&device_id2={}&JsHttpRequest=1-xml",
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            urlencoding::encode(&self.device_id),
            urlencoding::encode(&self.device_id2),
        ));
        let (body, _) = fetch(&url, Some(self)).await?;

        if is_html(&body) {
            debug!(body = %String::from_utf8_lossy(&body), "do_auth answered with HTML");
            return Err(PortalError::Blocked(format!(
                "authentication was answered with HTML; {BLOCKED_HINT}"
            )));
        }
        let envelope: Envelope<bool> = serde_json::from_slice(&body)?;
        if let Some(text) = envelope.text.as_deref() {
            info!(text, "portal authentication reply");
        }
        if envelope.js {
            Ok(())
        } else {
            Err(PortalError::InvalidCredentials)
        }
    }

    /// Second-step device-ID authentication (`action=get_profile`).
    pub async fn authenticate_with_device_ids(&self) -> Result<(), PortalError> {
        info!("authenticating with the device-ID pair");
        let url = self.api_url(&format!(
            "type=stb&action=get_profile&JsHttpRequest=1-xml&hd=1&sn={}&stb_type={}&device_id={}&device_id2={}&auth_second_step=1",
            urlencoding::encode(&self.serial_number),
            urlencoding::encode(&self.model),
            urlencoding::encode(&self.device_id),
            urlencoding::encode(&self.device_id2),
        ));
        let (body, _) = fetch(&url, Some(self)).await?;

        if is_html(&body) {
            debug!(body = %String::from_utf8_lossy(&body), "get_profile answered with HTML");
            return Err(PortalError::Blocked(format!(
                "authentication was answered with HTML; {BLOCKED_HINT}"
            )));
        }
        let envelope: Envelope<ProfilePayload> = serde_json::from_slice(&body)?;
        if let Some(text) = envelope.text.as_deref() {
            info!(text, "portal authentication reply");
        }
        if envelope.js.id.is_empty() {
            return Err(PortalError::InvalidCredentials);
        }
        info!(profile = %envelope.js.fname, "authenticated");
        Ok(())
    }

    /// Re-run whichever authentication flow the session was built with.
    pub async fn reauthenticate(&self) -> Result<(), PortalError> {
        match self.auth_method() {
            AuthMethod::Credentials => self.authenticate().await,
            AuthMethod::DeviceIds => self.authenticate_with_device_ids().await,
            AuthMethod::None => Err(PortalError::NoAuthMethod),
        }
    }

    /// One keep-alive call (`action=get_events&type=watchdog`).
    pub async fn watchdog_tick(&self) -> Result<(), PortalError> {
        let url = self.api_url(
            "action=get_events&event_active_id=0&init=0&type=watchdog&cur_play_type=1&JsHttpRequest=1-xml",
        );
        let (body, _) = fetch(&url, Some(self)).await?;
        if is_html(&body) {
            return Err(PortalError::Blocked(
                "watchdog was answered with HTML".to_string(),
            ));
        }
        let _: Envelope<serde_json::Value> = serde_json::from_slice(&body)?;
        Ok(())
    }

    /// Ask the portal for a short-lived playable link for `cmd`. The reply's
    /// `cmd` field carries player directives; only its last token is the URL.
    pub(crate) async fn request_link(&self, cmd: &str) -> Result<String, PortalError> {
        let url = self.api_url(&format!(
            "action=create_link&type=itv&cmd={}&JsHttpRequest=1-xml",
            urlencoding::encode(cmd)
        ));
        let (body, _) = fetch(&url, Some(self)).await?;
        let envelope: Envelope<LinkPayload> = serde_json::from_slice(&body)?;

        let cmd = envelope.js.cmd.trim();
        if cmd.is_empty() {
            return Err(PortalError::EmptyLink);
        }
        // split_whitespace never yields an empty iterator for non-empty input
        Ok(cmd.split_whitespace().next_back().unwrap_or(cmd).to_string())
    }
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
    use std::sync::{Arc, Mutex};

    /// Scripted portal: pops one canned body per request and records every
    /// query string it saw.
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

    fn session_at(addr: SocketAddr) -> PortalSession {
        PortalSession::new(PortalConfig {
            url: format!("http://{addr}/stalker_portal/server/load.php"),
            model: "MAG254".to_string(),
            serial_number: "SN1".to_string(),
            device_id: "D1".to_string(),
            device_id2: "D2".to_string(),
            mac: "AA:BB:CC:DD:EE:FF".to_string(),
            time_zone: "Europe/London".to_string(),
            token: "CAFE".to_string(),
            username: "user".to_string(),
            password: "pass".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn handshake_adopts_a_freshly_minted_token() {
        let (_, addr) = portal(vec![r#"{"js":{"token":"NEWTOKEN"}}"#]).await;
        let session = session_at(addr);
        session.handshake().await.unwrap();
        assert_eq!(session.token(), "NEWTOKEN");
    }

    #[tokio::test]
    async fn handshake_keeps_the_token_when_none_is_offered() {
        let (_, addr) = portal(vec![r#"{"js":{}}"#]).await;
        let session = session_at(addr);
        session.handshake().await.unwrap();
        assert_eq!(session.token(), "CAFE");
    }

    #[tokio::test]
    async fn handshake_retries_without_token_on_html() {
        let (stub, addr) = portal(vec![
            "<html>challenge</html>",
            r#"{"js":{"token":"SECOND"}}"#,
        ])
        .await;
        let session = session_at(addr);
        session.handshake().await.unwrap();
        assert_eq!(session.token(), "SECOND");

        let queries = stub.queries.lock().unwrap();
        assert!(queries[0].contains("token=CAFE"));
        assert!(!queries[1].contains("token="));
    }

    #[tokio::test]
    async fn handshake_html_twice_is_a_blocked_error() {
        let (_, addr) = portal(vec!["<html>1</html>", "<html>2</html>"]).await;
        let session = session_at(addr);
        let err = session.handshake().await.unwrap_err();
        assert!(matches!(err, PortalError::Blocked(_)));
        assert_eq!(session.token(), "CAFE");
    }

    #[tokio::test]
    async fn do_auth_false_means_invalid_credentials() {
        let (_, addr) = portal(vec![r#"{"js":false,"text":"nope"}"#]).await;
        let err = session_at(addr).authenticate().await.unwrap_err();
        assert!(matches!(err, PortalError::InvalidCredentials));
    }

    #[tokio::test]
    async fn do_auth_html_is_a_blocked_error() {
        let (_, addr) = portal(vec!["<html>blocked</html>"]).await;
        let err = session_at(addr).authenticate().await.unwrap_err();
        assert!(matches!(err, PortalError::Blocked(_)));
    }

    #[tokio::test]
    async fn device_id_auth_needs_a_profile_id() {
        let (_, addr) = portal(vec![r#"{"js":{"id":"42","fname":"box"}}"#]).await;
        session_at(addr).authenticate_with_device_ids().await.unwrap();

        let (_, addr) = portal(vec![r#"{"js":{"id":"","fname":""}}"#]).await;
        let err = session_at(addr)
            .authenticate_with_device_ids()
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::InvalidCredentials));
    }

    #[tokio::test]
    async fn request_link_takes_the_last_token() {
        let (_, addr) = portal(vec![
            r#"{"js":{"cmd":"ffmpeg http://cdn.example/live/1.ts?k=v"}}"#,
        ])
        .await;
        let link = session_at(addr).request_link("ch-cmd").await.unwrap();
        assert_eq!(link, "http://cdn.example/live/1.ts?k=v");
    }

    #[tokio::test]
    async fn request_link_rejects_an_empty_cmd() {
        let (_, addr) = portal(vec![r#"{"js":{"cmd":"   "}}"#]).await;
        let err = session_at(addr).request_link("ch-cmd").await.unwrap_err();
        assert!(matches!(err, PortalError::EmptyLink));
    }

    #[tokio::test]
    async fn watchdog_rejects_html() {
        let (_, addr) = portal(vec!["<html>gone</html>"]).await;
        let err = session_at(addr).watchdog_tick().await.unwrap_err();
        assert!(matches!(err, PortalError::Blocked(_)));
    }
}
