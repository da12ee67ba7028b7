//! Radiosource: network audio source stage
//!
//! Fetches an HTTP audio stream, follows redirects and playlists, strips ICY
//! metadata and hands clean audio to a decoder through a prefilled ring buffer.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::time::Duration;
//! use radiosource::config::SourceConfig;
//! use radiosource::stream::{HttpSource, Pull};
//!
//! let source = HttpSource::new(SourceConfig::default())?;
//! source.set_url("http://radio.example/stream");
//! source.start()?;
//!
//! let mut buf = [0u8; 4096];
//! if let Pull::Data { filled, .. } = source.pull(&mut buf, Duration::from_secs(1)) {
//!     // hand buf[..filled] to the decoder, then release it
//!     source.confirm_read(filled);
//! }
//! # Ok::<(), radiosource::error::SourceError>(())
//! ```

pub mod config;
pub mod error;
pub mod stream;
