//! HLS playlist rewriting.
//!
//! Playlists handed out by the portal's backends reference segments and
//! variant playlists on hosts a player cannot reach with the portal's
//! session headers. Every URI is therefore rewritten to come back through
//! the gateway's `media` route, carrying the absolute upstream URL in the
//! `u` query parameter.

use m3u8_rs::Playlist;
use url::Url;

/// Rewrite all variant, alternative-rendition and segment URIs so they point
/// back at this gateway. Relative URIs are resolved against the URL the
/// playlist was actually fetched from (after redirects).
pub fn rewrite(input: &[u8], upstream: &Url, title: &str) -> Result<Vec<u8>, String> {
    let (_, mut playlist) =
        m3u8_rs::parse_playlist(input).map_err(|e| format!("playlist parse failed: {e}"))?;

    match &mut playlist {
        Playlist::MasterPlaylist(master) => {
            for variant in &mut master.variants {
                variant.uri = proxied_uri(title, upstream, &variant.uri)?;
            }
            for alternative in &mut master.alternatives {
                if let Some(uri) = alternative.uri.take() {
                    alternative.uri = Some(proxied_uri(title, upstream, &uri)?);
                }
            }
        }
        Playlist::MediaPlaylist(media) => {
            for segment in &mut media.segments {
                segment.uri = proxied_uri(title, upstream, &segment.uri)?;
            }
        }
    }

    let mut out = Vec::with_capacity(input.len() * 2);
    playlist
        .write_to(&mut out)
        .map_err(|e| format!("playlist serialization failed: {e}"))?;
    Ok(out)
}

fn proxied_uri(title: &str, upstream: &Url, raw: &str) -> Result<String, String> {
    let absolute = upstream
        .join(raw)
        .map_err(|e| format!("bad playlist uri '{raw}': {e}"))?;
    Ok(format!(
        "/iptv/{}/media?u={}",
        urlencoding::encode(title),
        urlencoding::encode(absolute.as_str())
    ))
}
