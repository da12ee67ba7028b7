//! Connection state machine
//!
//! Opens one outbound connection for a track URL: follows 301/302
//! redirects, detects playlist responses and hops to their first track, and
//! resumes from a byte offset when asked. Redirects, failed opens and
//! playlist hops all draw on the same attempt budget.

use std::io::Read;

use tracing::{debug, error, info, trace, warn};

use crate::config::playlist::MAX_PLAYLIST_BYTES;
use crate::error::{Result, SourceError};
use crate::stream::format::CodecType;
use crate::stream::icy::IcyHeaders;
use crate::stream::playlist::{check_playlist_type, Playlist};
use crate::stream::transport::{Connection, Request, Transport};

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Redirected,
    IsPlaylist,
    Failed,
}

/// An open audio response, ready to be read
pub struct Established {
    pub connection: Box<dyn Connection>,
    /// Track URL after playlist hops; reconnects go here
    pub track_url: String,
    /// URL that finally answered, after redirects
    pub final_url: String,
    pub codec: CodecType,
    pub headers: IcyHeaders,
    pub content_length: Option<u64>,
}

impl std::fmt::Debug for Established {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Established")
            .field("track_url", &self.track_url)
            .field("final_url", &self.final_url)
            .field("codec", &self.codec)
            .field("headers", &self.headers)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Drives one `connect` call at a time over an injected transport
pub struct Connector {
    transport: Box<dyn Transport>,
    max_attempts: usize,
    state: ConnState,
}

impl Connector {
    pub fn new(transport: Box<dyn Transport>, max_attempts: usize) -> Self {
        Self {
            transport,
            max_attempts: max_attempts.max(1),
            state: ConnState::Disconnected,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// The caller dropped its connection
    pub fn reset(&mut self) {
        self.set_state(ConnState::Disconnected);
    }

    /// Connect to `url`, resuming at `resume_from` bytes when non-zero.
    ///
    /// Playlist responses are loaded into `playlist` and the first entry is
    /// connected instead. Returns the open audio response or the last error
    /// once the attempt budget is used up.
    pub fn connect(
        &mut self,
        url: &str,
        resume_from: Option<u64>,
        playlist: &mut Playlist,
    ) -> Result<Established> {
        self.set_state(ConnState::Connecting);

        let mut track_url = url.to_string();
        let mut target = track_url.clone();
        let mut range_start = resume_from.filter(|&pos| pos > 0);
        let mut last_error = None;

        for attempt in 0..self.max_attempts {
            let request = Request::new(&target, range_start);
            let connection = match self.transport.open(&request) {
                Ok(connection) => connection,
                Err(e) => {
                    warn!(url = %target, attempt, error = %e, "Failed to open HTTP stream");
                    last_error = Some(e);
                    continue;
                }
            };

            let head = connection.head().clone();
            info!(
                url = %target,
                status = head.status,
                content_length = ?head.content_length,
                "HTTP response received"
            );

            if head.is_redirect() {
                match head.location() {
                    Some(location) => {
                        let next = resolve_location(&target, location);
                        info!(from = %target, to = %next, "Following redirect");
                        target = next;
                        self.set_state(ConnState::Redirected);
                    }
                    None => {
                        warn!(url = %target, status = head.status, "Redirect without Location");
                        last_error = Some(SourceError::Http {
                            status: head.status,
                            url: target.clone(),
                        });
                    }
                }
                continue;
            }

            if !head.is_success() {
                error!(url = %target, status = head.status, "Non-200 response code");
                self.set_state(ConnState::Failed);
                return Err(SourceError::Http {
                    status: head.status,
                    url: target,
                });
            }

            let headers = IcyHeaders::from_head(&head);
            let codec = headers
                .content_type
                .as_deref()
                .map(CodecType::from_content_type)
                .unwrap_or_default();
            if let Some(content_type) = &headers.content_type {
                debug!(content_type = %content_type, codec = %codec, "Parsed content-type");
            }

            if codec.is_playlist() || check_playlist_type(&target).is_playlist() {
                self.set_state(ConnState::IsPlaylist);
                let body = self.download_playlist(connection, &request);
                playlist.load(&body, &target, codec);
                match playlist.next_track() {
                    Some(next) => {
                        info!(playlist = %target, track = %next, "Response parsed as playlist");
                        track_url = next;
                        target = track_url.clone();
                        range_start = None;
                        continue;
                    }
                    None => {
                        error!(url = %target, "Response is a playlist, but it has no track URL");
                        self.set_state(ConnState::Failed);
                        return Err(SourceError::Playlist(format!(
                            "no track URL in playlist {target}"
                        )));
                    }
                }
            }

            if headers.metaint == 0 {
                warn!(url = %target, "Source does not send ShoutCast metadata");
            } else {
                info!(interval = headers.metaint, "Response contains ICY metadata");
            }

            self.set_state(ConnState::Connected);
            return Ok(Established {
                connection,
                track_url,
                final_url: target,
                codec,
                content_length: head.content_length,
                headers,
            });
        }

        warn!(url = %url, attempts = self.max_attempts, "Connect attempts exhausted");
        self.set_state(ConnState::Failed);
        Err(last_error.unwrap_or_else(|| {
            SourceError::Stream(format!("gave up connecting to {url} after redirects"))
        }))
    }

    /// Read a playlist body, bounded by its advertised length.
    ///
    /// A failed read reopens the same request and starts over. Allocation
    /// failure or exhausted retries give an empty body.
    fn download_playlist(&mut self, mut connection: Box<dyn Connection>, request: &Request) -> Vec<u8> {
        let mut expected = connection.head().content_length;

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                match self.transport.open(request) {
                    Ok(reopened) if reopened.head().is_success() => {
                        let length = reopened.head().content_length;
                        if length != expected {
                            debug!(old = ?expected, new = ?length, "Playlist length changed");
                            expected = length;
                        }
                        connection = reopened;
                    }
                    Ok(reopened) => {
                        warn!(status = reopened.head().status, "Playlist reopen failed");
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "Playlist reopen failed");
                        continue;
                    }
                }
            }

            let limit = expected
                .map_or(MAX_PLAYLIST_BYTES, |len| len.min(MAX_PLAYLIST_BYTES as u64) as usize);
            let mut body = Vec::new();
            if body.try_reserve_exact(limit).is_err() {
                error!(limit, "Out of memory allocating buffer for playlist download");
                return Vec::new();
            }

            match Read::take(&mut *connection, limit as u64).read_to_end(&mut body) {
                Ok(len) => {
                    trace!(len, "Playlist downloaded");
                    return body;
                }
                Err(e) => warn!(attempt, error = %e, "Error downloading playlist, retrying"),
            }
        }
        Vec::new()
    }

    fn set_state(&mut self, state: ConnState) {
        if self.state != state {
            trace!(from = ?self.state, to = ?state, "Connection state");
            self.state = state;
        }
    }
}

/// Resolve a `Location` header against the URL that sent it
fn resolve_location(base: &str, location: &str) -> String {
    reqwest::Url::parse(base)
        .and_then(|base| base.join(location))
        .map(String::from)
        .unwrap_or_else(|_| location.to_string())
}
