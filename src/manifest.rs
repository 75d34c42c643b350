use m3u8_rs::Playlist;
use reqwest::Url;
use tracing::debug;

pub const STREAM_INF_TAG: &str = "#EXT-X-STREAM-INF";

/// Returns the first child reference of an HLS manifest, unresolved.
///
/// Master playlists yield their first variant, media playlists their first segment.
#[must_use]
pub fn first_child_uri(body: &str) -> Option<String> {
    parse_child_uri(body).or_else(|| scan_child_uri(body))
}

/// Resolves the first child of a manifest against the URL the manifest was actually served from
#[must_use]
pub fn follow(body: &str, base: &Url) -> Option<Url> {
    let uri = first_child_uri(body)?;
    match base.join(&uri) {
        Ok(url) => Some(url),
        Err(e) => {
            debug!("Unable to resolve manifest reference {uri:?} against {base}: {e}");
            None
        }
    }
}

fn parse_child_uri(body: &str) -> Option<String> {
    let playlist = m3u8_rs::parse_playlist_res(body.as_bytes()).ok()?;
    let uri = match playlist {
        Playlist::MasterPlaylist(master) => master
            .variants
            .into_iter()
            .find(|v| !v.is_i_frame)
            .map(|v| v.uri),
        Playlist::MediaPlaylist(media) => media.segments.into_iter().next().map(|s| s.uri),
    };

    uri.map(|u| u.trim().to_string()).filter(|u| !u.is_empty())
}

/// Plain line scan for manifests `m3u8-rs` rejects (missing header, vendor tags, ...)
fn scan_child_uri(body: &str) -> Option<String> {
    let lines = body
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>();

    let start = lines
        .iter()
        .position(|l| l.starts_with(STREAM_INF_TAG))
        .map_or(0, |i| i + 1);

    lines[start..]
        .iter()
        .find(|l| !l.starts_with('#'))
        .map(|l| (*l).to_string())
}
