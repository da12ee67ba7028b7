//! Configuration for the streaming source stage
//!
//! Compile-time defaults live in the constant modules below; `SourceConfig`
//! carries the runtime knobs and can be loaded from JSON.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Network-related configuration
pub mod network {
    /// User agent for HTTP requests
    pub const USER_AGENT: &str = concat!("Radiosource/", env!("CARGO_PKG_VERSION"));

    /// Connection timeout in seconds
    pub const CONNECT_TIMEOUT_SECS: u64 = 10;

    /// Per-read poll timeout in milliseconds. A read that sees no data within
    /// this window hands control back to the command loop.
    pub const POLL_TIMEOUT_MS: u64 = 1000;

    /// Maximum bytes requested from the transport per read
    pub const READ_SIZE: usize = 1024;

    /// Attempts per `connect()` call, shared by redirects, open errors and playlist hops
    pub const CONNECT_ATTEMPTS: u32 = 4;

    /// Reconnect attempts on the current track before falling back to the playlist
    pub const RECV_RETRIES: u32 = 4;

    /// Body chunks buffered between the HTTP reader thread and the worker
    pub const BODY_CHANNEL_BOUND: usize = 4;
}

/// Ring buffer configuration
pub mod buffer {
    /// Default ring capacity (bytes)
    pub const DEFAULT_CAPACITY: usize = 128 * 1024;

    /// Default prefill is 3/4 of the capacity
    pub const PREFILL_NUMERATOR: usize = 3;
    pub const PREFILL_DENOMINATOR: usize = 4;

    /// Bound of the worker's command queue
    pub const COMMAND_QUEUE_BOUND: usize = 16;
}

/// ICY metadata protocol constants
pub mod icy {
    /// Key preceding the track title inside a metadata block
    pub const STREAM_TITLE_KEY: &str = "StreamTitle=";

    /// The length byte counts metadata in units of this many bytes
    pub const BLOCK_UNIT: usize = 16;
}

/// Playlist download configuration
pub mod playlist {
    /// Upper bound for a playlist body kept in memory
    pub const MAX_PLAYLIST_BYTES: usize = 64 * 1024;
}

/// Runtime configuration of an `HttpSource`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Ring buffer capacity in bytes
    pub buffer_capacity: usize,
    /// Bytes that must be buffered before the consumer may start draining.
    /// `None` means 3/4 of the capacity.
    pub prefill_amount: Option<usize>,
    pub poll_timeout_ms: u64,
    pub connect_timeout_secs: u64,
    pub read_size: usize,
    pub connect_attempts: u32,
    pub recv_retries: u32,
    /// Advance to the next playlist entry when the current one keeps failing
    pub auto_next_track: bool,
    pub user_agent: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: buffer::DEFAULT_CAPACITY,
            prefill_amount: None,
            poll_timeout_ms: network::POLL_TIMEOUT_MS,
            connect_timeout_secs: network::CONNECT_TIMEOUT_SECS,
            read_size: network::READ_SIZE,
            connect_attempts: network::CONNECT_ATTEMPTS,
            recv_retries: network::RECV_RETRIES,
            auto_next_track: true,
            user_agent: network::USER_AGENT.to_string(),
        }
    }
}

impl SourceConfig {
    /// Clamp values that would make the stage unusable.
    pub fn validated(mut self) -> Self {
        if self.buffer_capacity == 0 {
            self.buffer_capacity = buffer::DEFAULT_CAPACITY;
        }
        if self.read_size == 0 {
            self.read_size = network::READ_SIZE;
        }
        self.read_size = self.read_size.min(self.buffer_capacity);
        if let Some(prefill) = self.prefill_amount {
            self.prefill_amount = Some(prefill.min(self.buffer_capacity));
        }
        self.poll_timeout_ms = self.poll_timeout_ms.max(1);
        self.connect_timeout_secs = self.connect_timeout_secs.max(1);
        self.connect_attempts = self.connect_attempts.max(1);
        self.recv_retries = self.recv_retries.max(1);
        self
    }

    /// Effective prefill threshold in bytes
    pub fn prefill(&self) -> usize {
        self.prefill_amount
            .unwrap_or(self.buffer_capacity * buffer::PREFILL_NUMERATOR / buffer::PREFILL_DENOMINATOR)
            .min(self.buffer_capacity)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prefill_is_three_quarters() {
        let cfg = SourceConfig::default();
        assert_eq!(cfg.prefill(), buffer::DEFAULT_CAPACITY * 3 / 4);
    }

    #[test]
    fn prefill_clamped_to_capacity() {
        let cfg = SourceConfig {
            buffer_capacity: 1000,
            prefill_amount: Some(5000),
            ..Default::default()
        }
        .validated();
        assert_eq!(cfg.prefill(), 1000);
    }

    #[test]
    fn validated_fixes_zero_values() {
        let cfg = SourceConfig {
            buffer_capacity: 0,
            read_size: 0,
            poll_timeout_ms: 0,
            connect_attempts: 0,
            recv_retries: 0,
            ..Default::default()
        }
        .validated();
        assert_eq!(cfg.buffer_capacity, buffer::DEFAULT_CAPACITY);
        assert_eq!(cfg.read_size, network::READ_SIZE);
        assert_eq!(cfg.poll_timeout(), Duration::from_millis(1));
        assert_eq!(cfg.connect_attempts, 1);
        assert_eq!(cfg.recv_retries, 1);
    }

    #[test]
    fn read_size_never_exceeds_capacity() {
        let cfg = SourceConfig {
            buffer_capacity: 256,
            read_size: 1024,
            ..Default::default()
        }
        .validated();
        assert_eq!(cfg.read_size, 256);
    }

    #[test]
    fn deserialize_partial_json_uses_defaults() {
        let cfg: SourceConfig =
            serde_json::from_str(r#"{"buffer_capacity": 4096, "auto_next_track": false}"#).unwrap();
        assert_eq!(cfg.buffer_capacity, 4096);
        assert!(!cfg.auto_next_track);
        assert_eq!(cfg.read_size, network::READ_SIZE);
        assert_eq!(cfg.prefill(), 3072);
    }

    #[test]
    fn user_agent_names_the_crate() {
        assert!(network::USER_AGENT.starts_with("Radiosource/"));
    }
}
