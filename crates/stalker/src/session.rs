//! Portal session state.
//!
//! A [`PortalSession`] owns the identity a Stalker portal expects from a
//! set-top box (MAC, serial number, device IDs, model string) together with
//! the bearer token the portal hands out during the handshake. One session is
//! created per configured portal and lives for the process lifetime.

use std::time::Duration;

use parking_lot::RwLock;
use reqwest::Client;
use reqwest::redirect::Policy;
use url::Url;

use crate::error::PortalError;

/// Overall deadline for every outbound portal request.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How a session proves itself to the portal after the handshake.
///
/// Selected once at session construction; credentials win over the device-ID
/// flow when both are configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// `action=do_auth` with username/password.
    Credentials,
    /// `action=get_profile&auth_second_step=1` with the device-ID pair.
    DeviceIds,
    /// Handshake only; some portals accept an unauthenticated token.
    None,
}

/// Validated portal settings, as produced by the configuration layer.
#[derive(Debug, Clone, Default)]
pub struct PortalConfig {
    /// Base URL of the portal endpoint, scheme and host required.
    pub url: String,
    pub model: String,
    pub serial_number: String,
    pub device_id: String,
    pub device_id2: String,
    pub signature: String,
    /// Canonical uppercase colon-separated MAC.
    pub mac: String,
    pub username: String,
    pub password: String,
    /// `Area/City` time zone name.
    pub time_zone: String,
    /// Bearer token; must be non-empty (the config layer generates one).
    pub token: String,
    /// Watchdog interval in minutes, 0 to disable.
    pub watchdog_minutes: u64,
    pub device_id_auth: bool,
    pub user_agent: Option<String>,
    /// Extra cookie text appended verbatim to the generated cookie line,
    /// e.g. a `cf_clearance` value copied from a browser.
    pub extra_cookies: Option<String>,
}

/// One authenticated session against one portal.
#[derive(Debug)]
pub struct PortalSession {
    base_url: Url,
    pub model: String,
    pub serial_number: String,
    pub device_id: String,
    pub device_id2: String,
    pub signature: String,
    pub mac: String,
    pub username: String,
    pub password: String,
    pub time_zone: String,
    watchdog_minutes: u64,
    auth_method: AuthMethod,
    user_agent: Option<String>,
    extra_cookies: Option<String>,
    token: RwLock<String>,
    client: Client,
}

impl PortalSession {
    /// Build a session from validated configuration.
    ///
    /// The HTTP client never follows redirects on its own (the fetch layer
    /// resolves them manually so no implicit `Referer` leaks into cross-host
    /// hops) and carries the fixed request deadline.
    pub fn new(config: PortalConfig) -> Result<Self, PortalError> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| PortalError::InvalidUrl(format!("{}: {e}", config.url)))?;
        if base_url.host_str().is_none() {
            return Err(PortalError::InvalidUrl(format!(
                "{}: missing host",
                config.url
            )));
        }

        let auth_method = if !config.username.is_empty() && !config.password.is_empty() {
            AuthMethod::Credentials
        } else if config.device_id_auth {
            AuthMethod::DeviceIds
        } else {
            AuthMethod::None
        };

        let client = Client::builder()
            .redirect(Policy::none())
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            base_url,
            model: config.model,
            serial_number: config.serial_number,
            device_id: config.device_id,
            device_id2: config.device_id2,
            signature: config.signature,
            mac: config.mac,
            username: config.username,
            password: config.password,
            time_zone: config.time_zone,
            watchdog_minutes: config.watchdog_minutes,
            auth_method,
            user_agent: config.user_agent,
            extra_cookies: config.extra_cookies,
            token: RwLock::new(config.token),
            client,
        })
    }

    pub fn auth_method(&self) -> AuthMethod {
        self.auth_method
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    /// Current bearer token. Writers are the handshake and the auth flows;
    /// every outbound request takes a read guard, so a live token renewal is
    /// observed by the next request.
    pub fn token(&self) -> String {
        self.token.read().clone()
    }

    pub fn set_token(&self, token: String) {
        *self.token.write() = token;
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Full portal URL for one API call: base URL plus the query string.
    pub(crate) fn api_url(&self, query: &str) -> String {
        format!("{}?{query}", self.base_url)
    }

    /// User agent sent to the portal: the operator override, or a modern
    /// desktop Chrome. Portals behind edge protection expect the value to
    /// match the browser that cleared the challenge.
    pub fn user_agent(&self) -> &str {
        self.user_agent
            .as_deref()
            .unwrap_or(crate::fetch::DEFAULT_USER_AGENT)
    }

    /// Cookie line the portal expects from a set-top box:
    /// `sn=..; mac=..; stb_lang=en; timezone=..` plus any operator-supplied
    /// extra cookie text.
    pub fn cookie_line(&self) -> String {
        let mut cookie = format!(
            "sn={}; mac={}; stb_lang=en; timezone={}",
            urlencoding::encode(&self.serial_number),
            urlencoding::encode(&self.mac),
            urlencoding::encode(&self.time_zone),
        );
        if let Some(extra) = self.extra_cookies.as_deref()
            && !extra.trim().is_empty()
        {
            cookie.push_str("; ");
            cookie.push_str(extra.trim());
        }
        cookie
    }

    /// `scheme://host` of the portal, used for `Origin`.
    pub fn origin(&self) -> String {
        let mut origin = format!(
            "{}://{}",
            self.base_url.scheme(),
            self.base_url.host_str().unwrap_or_default()
        );
        if let Some(port) = self.base_url.port() {
            origin.push(':');
            origin.push_str(&port.to_string());
        }
        origin
    }

    /// Referer for stream and logo fetches: the portal's scheme+host root.
    pub fn stream_referer(&self) -> String {
        format!("{}/", self.origin())
    }

    pub fn watchdog_interval(&self) -> Option<Duration> {
        (self.watchdog_minutes > 0).then(|| Duration::from_secs(self.watchdog_minutes * 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PortalConfig {
        PortalConfig {
            url: "http://portal.example/stalker_portal/server/load.php".to_string(),
            model: "MAG254".to_string(),
            serial_number: "0123456789ABC".to_string(),
            device_id: "D1".to_string(),
            device_id2: "D2".to_string(),
            mac: "AA:BB:CC:DD:EE:FF".to_string(),
            time_zone: "Europe/London".to_string(),
            token: "F00D".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn cookie_line_percent_encodes_and_appends_extras() {
        let mut cfg = config();
        cfg.extra_cookies = Some("cf_clearance=abc123".to_string());
        let session = PortalSession::new(cfg).unwrap();
        assert_eq!(
            session.cookie_line(),
            "sn=0123456789ABC; mac=AA%3ABB%3ACC%3ADD%3AEE%3AFF; stb_lang=en; \
             timezone=Europe%2FLondon; cf_clearance=abc123"
        );
    }

    #[test]
    fn cookie_line_without_extras_has_no_trailing_separator() {
        let session = PortalSession::new(config()).unwrap();
        assert!(session.cookie_line().ends_with("timezone=Europe%2FLondon"));
    }

    #[test]
    fn origin_and_stream_referer() {
        let session = PortalSession::new(config()).unwrap();
        assert_eq!(session.origin(), "http://portal.example");
        assert_eq!(session.stream_referer(), "http://portal.example/");
    }

    #[test]
    fn credentials_take_priority_over_device_id_auth() {
        let mut cfg = config();
        cfg.username = "user".to_string();
        cfg.password = "pass".to_string();
        cfg.device_id_auth = true;
        let session = PortalSession::new(cfg).unwrap();
        assert_eq!(session.auth_method(), AuthMethod::Credentials);
    }

    #[test]
    fn device_id_auth_requires_the_flag() {
        let mut cfg = config();
        cfg.device_id_auth = true;
        assert_eq!(
            PortalSession::new(cfg).unwrap().auth_method(),
            AuthMethod::DeviceIds
        );
        assert_eq!(
            PortalSession::new(config()).unwrap().auth_method(),
            AuthMethod::None
        );
    }

    #[test]
    fn missing_host_is_rejected() {
        let mut cfg = config();
        cfg.url = "file:///etc/passwd".to_string();
        assert!(PortalSession::new(cfg).is_err());
    }

    #[test]
    fn watchdog_interval_disabled_at_zero() {
        let session = PortalSession::new(config()).unwrap();
        assert_eq!(session.watchdog_interval(), None);

        let mut cfg = config();
        cfg.watchdog_minutes = 2;
        let session = PortalSession::new(cfg).unwrap();
        assert_eq!(
            session.watchdog_interval(),
            Some(Duration::from_secs(120))
        );
    }
}
