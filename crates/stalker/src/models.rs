//! Wire shapes of the portal's JSON API.
//!
//! Every response is an object with a `js` payload whose shape depends on
//! the action, plus an optional human-readable `text` blob. Fields the
//! portal omits are defaulted rather than rejected; middleware builds vary
//! wildly in what they include.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<T> {
    pub js: T,
    #[serde(default)]
    pub text: Option<String>,
}

/// `action=handshake`: the portal may mint a fresh token or accept ours.
#[derive(Debug, Deserialize)]
pub(crate) struct HandshakePayload {
    #[serde(default)]
    pub token: Option<String>,
}

/// `action=get_profile&auth_second_step=1`: a non-empty `id` means the
/// device-ID pair was accepted.
#[derive(Debug, Deserialize)]
pub(crate) struct ProfilePayload {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub fname: String,
}

/// `action=create_link`: `cmd` carries player directives with the usable
/// URL as its last whitespace-separated token.
#[derive(Debug, Deserialize)]
pub(crate) struct LinkPayload {
    #[serde(default)]
    pub cmd: String,
}

/// `action=get_all_channels` payload.
#[derive(Debug, Deserialize)]
pub(crate) struct ChannelList {
    #[serde(default)]
    pub data: Vec<ChannelEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChannelEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub logo: String,
    #[serde(rename = "tv_genre_id", default)]
    pub genre_id: String,
    #[serde(default)]
    pub cmds: Vec<CmdEntry>,
}

/// Per-channel link rows; only the first one's ids are used, to synthesize
/// proxy responses.
#[derive(Debug, Deserialize)]
pub(crate) struct CmdEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub ch_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GenreEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
}
