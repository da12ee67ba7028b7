//! Playlist parsing (PLS/M3U)
//!
//! A playlist response is turned into an ordered list of track URLs with a
//! cursor. The connection state machine takes entries one at a time.

use tracing::{debug, warn};

use crate::stream::format::CodecType;

/// Result of checking a URL's playlist type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistCheck {
    Pls,
    M3u,
    NotPlaylist,
}

impl PlaylistCheck {
    pub fn is_playlist(self) -> bool {
        self != PlaylistCheck::NotPlaylist
    }
}

/// Check what type of playlist a URL points to based on extension.
///
/// `.m3u8` counts as M3U: only the track list is read, segments are not.
pub fn check_playlist_type(url: &str) -> PlaylistCheck {
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    if path.ends_with(".pls") {
        PlaylistCheck::Pls
    } else if path.ends_with(".m3u") || path.ends_with(".m3u8") {
        PlaylistCheck::M3u
    } else {
        PlaylistCheck::NotPlaylist
    }
}

/// Extract the base URL (directory) from a full URL
pub fn get_base_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or_default();
    without_query
        .rsplit_once('/')
        .map(|(base, _)| base)
        .unwrap_or("")
        .to_string()
}

/// Make a URI absolute, using base_url if the URI is relative
pub fn make_absolute_url(uri: &str, base_url: &str) -> String {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        uri.to_string()
    } else {
        format!("{}/{}", base_url, uri.trim_start_matches('/'))
    }
}

/// Parse every `FileN=` entry of a PLS playlist, in file order
pub fn parse_pls(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| {
            let (key, value) = line.trim().split_once('=')?;
            let key = key.trim().to_ascii_lowercase();
            let is_file_key = key
                .strip_prefix("file")
                .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()));
            let value = value.trim();
            (is_file_key && value.starts_with("http")).then(|| value.to_string())
        })
        .collect()
}

/// Parse an M3U playlist, resolving relative entries against `base_url`
pub fn parse_m3u(content: &str, base_url: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            if line.starts_with("http://") || line.starts_with("https://") {
                Some(line.to_string())
            } else if !line.contains('=') {
                Some(make_absolute_url(line, base_url))
            } else {
                None
            }
        })
        .collect()
}

/// Ordered track URLs with a cursor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Playlist {
    tracks: Vec<String>,
    cursor: usize,
}

impl Playlist {
    /// Replace the contents with the tracks found in a downloaded body.
    ///
    /// The format comes from the Content-Type when it names a playlist, else
    /// from the URL extension, else from the body itself. Returns the number
    /// of tracks found.
    pub fn load(&mut self, body: &[u8], playlist_url: &str, codec: CodecType) -> usize {
        let content = String::from_utf8_lossy(body);
        let is_pls = match codec {
            CodecType::PlaylistPls => true,
            CodecType::PlaylistM3u => false,
            _ => match check_playlist_type(playlist_url) {
                PlaylistCheck::Pls => true,
                PlaylistCheck::M3u => false,
                PlaylistCheck::NotPlaylist => content
                    .trim_start()
                    .to_ascii_lowercase()
                    .starts_with("[playlist]"),
            },
        };

        self.tracks = if is_pls {
            parse_pls(&content)
        } else {
            parse_m3u(&content, &get_base_url(playlist_url))
        };
        self.cursor = 0;

        if self.tracks.is_empty() {
            warn!(url = playlist_url, "Playlist contains no tracks");
        } else {
            debug!(
                url = playlist_url,
                tracks = self.tracks.len(),
                format = if is_pls { "pls" } else { "m3u" },
                "Playlist loaded"
            );
        }
        self.tracks.len()
    }

    /// Take the entry under the cursor and advance past it
    pub fn next_track(&mut self) -> Option<String> {
        let track = self.tracks.get(self.cursor).cloned();
        if track.is_some() {
            self.cursor += 1;
        }
        track
    }

    pub fn has_next(&self) -> bool {
        self.cursor < self.tracks.len()
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
        self.cursor = 0;
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}
