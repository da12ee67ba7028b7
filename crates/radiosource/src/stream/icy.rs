//! ICY (Icecast/Shoutcast) in-band metadata
//!
//! A server that honours `Icy-MetaData: 1` answers with `icy-metaint: N` and
//! then, after every N audio bytes, inserts one length byte `L` followed by
//! `16 * L` bytes of metadata text. `IcyParser` strips those blocks from
//! arbitrarily sized network chunks and reports completed track titles.

use tracing::{debug, trace};

use crate::config::icy::BLOCK_UNIT;
use crate::stream::metadata::extract_stream_title;
use crate::stream::transport::ResponseHead;

/// Headers parsed from an ICY stream response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IcyHeaders {
    /// Metadata interval in bytes, 0 when the server sends no metadata
    pub metaint: usize,
    pub station_name: Option<String>,
    pub description: Option<String>,
    pub genre: Option<String>,
    pub station_url: Option<String>,
    pub content_type: Option<String>,
    pub bitrate: Option<u32>,
}

impl IcyHeaders {
    pub fn from_head(head: &ResponseHead) -> Self {
        let text = |name: &str| {
            head.header(name)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        Self {
            metaint: head
                .header("icy-metaint")
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0),
            station_name: text("icy-name"),
            description: text("icy-description"),
            genre: text("icy-genre"),
            station_url: text("icy-url"),
            content_type: text("content-type"),
            bitrate: head
                .header("icy-br")
                .and_then(|v| v.trim().parse::<u32>().ok()),
        }
    }
}

/// Position of the parser within the metadata cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcyState {
    /// Interval is 0: every byte is audio
    Disabled,
    /// Passing audio through; a length byte is due after `interval` bytes
    Streaming,
    /// Collecting a metadata block that may span several chunks
    InMetadata,
}

/// Resumable ICY metadata stripper.
///
/// State persists across chunk boundaries, so feeding a stream in one call or
/// in any number of pieces yields the same audio and the same titles.
#[derive(Debug, Default)]
pub struct IcyParser {
    interval: usize,
    /// Audio bytes seen since the last metadata block, in `0..=interval`
    since_block: usize,
    /// Bytes of the current metadata block still to come
    remaining: usize,
    /// Partial metadata block; cleared, never shrunk, between blocks
    accumulator: Vec<u8>,
}

impl IcyParser {
    pub fn new(interval: usize) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }

    /// Start a new response body with the given interval (0 disables parsing).
    pub fn reset(&mut self, interval: usize) {
        self.interval = interval;
        self.since_block = 0;
        self.remaining = 0;
        self.accumulator.clear();
    }

    pub fn interval(&self) -> usize {
        self.interval
    }

    pub fn is_enabled(&self) -> bool {
        self.interval > 0
    }

    pub fn state(&self) -> IcyState {
        if self.interval == 0 {
            IcyState::Disabled
        } else if self.remaining > 0 {
            IcyState::InMetadata
        } else {
            IcyState::Streaming
        }
    }

    /// Strip metadata from `chunk` in place.
    ///
    /// Audio bytes are compacted to the front of `chunk`; the return value is
    /// how many leading bytes are audio. Every completed block carrying a
    /// title is reported through `on_title`.
    pub fn process(&mut self, chunk: &mut [u8], mut on_title: impl FnMut(String)) -> usize {
        if self.interval == 0 {
            return chunk.len();
        }

        let len = chunk.len();
        let mut read = 0;
        let mut audio = 0;

        while read < len {
            if self.remaining > 0 {
                let take = self.remaining.min(len - read);
                self.accumulator.extend_from_slice(&chunk[read..read + take]);
                read += take;
                self.remaining -= take;
                if self.remaining == 0 {
                    self.finish_block(&mut on_title);
                }
            } else if self.since_block < self.interval {
                let take = (self.interval - self.since_block).min(len - read);
                if audio != read {
                    chunk.copy_within(read..read + take, audio);
                }
                audio += take;
                read += take;
                self.since_block += take;
            } else {
                let block_len = chunk[read] as usize * BLOCK_UNIT;
                read += 1;
                self.since_block = 0;
                if block_len > 0 {
                    trace!(block_len, "ICY metadata block starts");
                    self.remaining = block_len;
                    self.accumulator.clear();
                    self.accumulator.reserve(block_len);
                }
            }
        }

        assert!(
            audio <= read && self.since_block <= self.interval,
            "ICY counters corrupted: audio={audio} read={read} since_block={} interval={}",
            self.since_block,
            self.interval
        );
        audio
    }

    fn finish_block(&mut self, on_title: &mut impl FnMut(String)) {
        match extract_stream_title(&self.accumulator) {
            Some(title) => on_title(title),
            None => debug!(len = self.accumulator.len(), "ICY block without a title"),
        }
        self.accumulator.clear();
    }
}
