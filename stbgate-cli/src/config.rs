//! Configuration schema and validation.
//!
//! The YAML file mirrors what operators of the original middleware bridges
//! expect: one `portal` block describing the set-top-box identity plus
//! independent enable/bind blocks per service. Everything is validated here,
//! before any network activity.

use std::path::Path;
use std::sync::LazyLock;

use rand::RngExt;
use regex::Regex;
use serde::Deserialize;
use stalker_client::PortalConfig;
use tracing::info;

use crate::error::{Error, Result};

static MAC_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-F0-9]{2}(:[A-F0-9]{2}){5}$").unwrap());
static TIMEZONE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z]+/[a-zA-Z]+$").unwrap());

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub portal: PortalSection,
    #[serde(default)]
    pub hls: HlsSection,
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub admin: AdminSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PortalSection {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub device_id2: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub time_zone: String,
    #[serde(default)]
    pub token: String,
    #[serde(rename = "watchdog", default)]
    pub watchdog_minutes: u64,
    #[serde(default)]
    pub device_id_auth: bool,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub cookies: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HlsSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bind: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxySection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bind: String,
    /// Rewrite issued links to go through the HLS service instead of
    /// pointing players straight at the portal's backend.
    #[serde(default)]
    pub rewrite: bool,
}

/// The administrative UI is an external collaborator; only its enable/bind
/// pair participates in validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bind: String,
}

/// Load and validate the configuration file.
pub fn read_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)?;
    let mut config: Config = serde_yaml::from_str(&content)?;
    config.validate_with_defaults()?;
    Ok(config)
}

impl Config {
    /// Enforce the schema invariants and fill derived defaults. Failures
    /// here abort startup before anything touches the network.
    pub fn validate_with_defaults(&mut self) -> Result<()> {
        let portal = &mut self.portal;
        portal.mac = portal.mac.to_uppercase();

        if portal.model.is_empty() {
            return Err(Error::Config("empty model".to_string()));
        }
        if portal.serial_number.is_empty() {
            return Err(Error::Config("empty serial number (sn)".to_string()));
        }
        if portal.device_id.is_empty() {
            return Err(Error::Config("empty device_id".to_string()));
        }
        if portal.device_id2.is_empty() {
            return Err(Error::Config("empty device_id2".to_string()));
        }
        // Signature may be empty.

        if !MAC_REGEX.is_match(&portal.mac) {
            return Err(Error::Config(format!("invalid MAC '{}'", portal.mac)));
        }
        // Username and password are optional.

        if portal.url.is_empty() {
            return Err(Error::Config("empty portal url".to_string()));
        }
        portal.url = normalize_portal_url(&portal.url)?;

        if !TIMEZONE_REGEX.is_match(&portal.time_zone) {
            return Err(Error::Config(format!(
                "invalid timezone '{}'",
                portal.time_zone
            )));
        }

        if !self.hls.enabled && !self.proxy.enabled && !self.admin.enabled {
            return Err(Error::Config("no services enabled".to_string()));
        }
        if self.hls.enabled && self.hls.bind.is_empty() {
            return Err(Error::Config("empty HLS bind".to_string()));
        }
        if self.proxy.enabled && self.proxy.bind.is_empty() {
            return Err(Error::Config("empty proxy bind".to_string()));
        }
        if self.admin.enabled && self.admin.bind.is_empty() {
            return Err(Error::Config("empty admin bind".to_string()));
        }
        if self.proxy.rewrite && !self.hls.enabled {
            return Err(Error::Config(
                "HLS service must be enabled for 'proxy: rewrite'".to_string(),
            ));
        }

        if self.portal.token.is_empty() {
            self.portal.token = random_token();
            info!(token = %self.portal.token, "no token given, using a random one");
        }
        if self.portal.watchdog_minutes == 1 {
            self.portal.watchdog_minutes = 2;
            info!(
                minutes = self.portal.watchdog_minutes,
                "watchdog interval raised"
            );
        }
        Ok(())
    }

    /// The validated portal block in the shape the session layer wants.
    pub fn portal_config(&self) -> PortalConfig {
        let portal = &self.portal;
        PortalConfig {
            url: portal.url.clone(),
            model: portal.model.clone(),
            serial_number: portal.serial_number.clone(),
            device_id: portal.device_id.clone(),
            device_id2: portal.device_id2.clone(),
            signature: portal.signature.clone(),
            mac: portal.mac.clone(),
            username: portal.username.clone(),
            password: portal.password.clone(),
            time_zone: portal.time_zone.clone(),
            token: portal.token.clone(),
            watchdog_minutes: portal.watchdog_minutes,
            device_id_auth: portal.device_id_auth,
            user_agent: portal.user_agent.clone(),
            extra_cookies: portal.cookies.clone(),
        }
    }
}

/// Accept bare hosts like `portal.example` and keep the rest of the URL
/// untouched; the portal may redirect to its preferred endpoint itself.
fn normalize_portal_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::Config("empty portal url".to_string()));
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let url = url::Url::parse(&with_scheme)
        .map_err(|e| Error::Config(format!("invalid portal url: {e}")))?;
    if url.host_str().is_none() {
        return Err(Error::Config("invalid portal url: missing host".to_string()));
    }
    Ok(url.to_string())
}

const TOKEN_CHARSET: &[u8] = b"ABCDEF0123456789";

fn random_token() -> String {
    let mut rng = rand::rng();
    (0..32)
        .map(|_| TOKEN_CHARSET[rng.random_range(0..TOKEN_CHARSET.len())] as char)
        .collect()
}
