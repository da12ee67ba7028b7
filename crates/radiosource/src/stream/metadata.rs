//! Station information and ICY title parsing
//!
//! `StationInfo` is an owned snapshot shared between the worker and any
//! reader behind a single mutex. Updates build a new value and replace the
//! old one wholesale.

use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::config::icy::STREAM_TITLE_KEY;
use crate::stream::icy::IcyHeaders;

/// What the station tells us about itself and the current track
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StationInfo {
    pub name: Option<String>,
    pub description: Option<String>,
    pub genre: Option<String>,
    /// Canonical station URL (`icy-url`), defaulting to the connected URL
    pub url: Option<String>,
    pub title: Option<String>,
}

impl StationInfo {
    /// Overlay the `icy-*` headers of a response onto this record.
    ///
    /// Fields the response does not carry keep their previous value, so a
    /// resumed connection without headers does not erase what we know.
    pub fn with_headers(&self, headers: &IcyHeaders) -> Self {
        Self {
            name: headers.station_name.clone().or_else(|| self.name.clone()),
            description: headers.description.clone().or_else(|| self.description.clone()),
            genre: headers.genre.clone().or_else(|| self.genre.clone()),
            url: headers.station_url.clone().or_else(|| self.url.clone()),
            title: self.title.clone(),
        }
    }

    pub fn with_title(&self, title: &str) -> Self {
        Self {
            title: Some(title.to_string()),
            ..self.clone()
        }
    }

    /// Fill in the canonical URL if the headers never provided one.
    pub fn with_default_url(&self, url: &str) -> Self {
        Self {
            url: self.url.clone().or_else(|| Some(url.to_string())),
            ..self.clone()
        }
    }
}

/// Thread-safe handle to the station record
pub type SharedStationInfo = Arc<Mutex<StationInfo>>;

/// Extract the track title from a raw metadata block.
///
/// Blocks look like `StreamTitle='Artist - Song';StreamUrl='...';` padded with
/// NULs to a multiple of 16 bytes. A title without its closing `';` is taken
/// up to the end of the block. Returns `None` when there is no `StreamTitle`
/// key or the title is empty.
pub fn extract_stream_title(raw_block: &[u8]) -> Option<String> {
    let end = raw_block
        .iter()
        .rposition(|&b| b != 0)
        .map(|p| p + 1)
        .unwrap_or(0);
    if end == 0 {
        return None;
    }

    let text = String::from_utf8_lossy(&raw_block[..end]);
    let Some(start) = text.find(STREAM_TITLE_KEY) else {
        warn!("ICY parse error: StreamTitle= not found");
        return None;
    };
    let value = &text[start + STREAM_TITLE_KEY.len()..];
    let value = value.strip_prefix('\'').unwrap_or(value);

    let title = if let Some(close) = value.find("';") {
        &value[..close]
    } else if let Some(semi) = value.find(';') {
        value[..semi].trim_end_matches('\'')
    } else {
        warn!("ICY parse error: closing quote of StreamTitle not found");
        value.trim_end_matches('\'')
    };

    let title = title.trim();
    if title.is_empty() {
        None
    } else {
        Some(title.to_string())
    }
}
