//! Stream handling
//!
//! Connects to HTTP audio streams, follows redirects and PLS/M3U playlists,
//! strips ICY metadata and buffers clean audio for a downstream decoder.

pub mod connection;
pub mod events;
pub mod format;
pub mod icy;
pub mod metadata;
pub mod node;
pub mod playlist;
pub mod ring;
pub mod transport;

pub use connection::{ConnState, Connector, Established};
pub use events::{EventBus, SourceEvent};
pub use format::{CodecType, StreamFormat};
pub use icy::{IcyHeaders, IcyParser, IcyState};
pub use metadata::{SharedStationInfo, StationInfo};
pub use node::{HttpSource, NodeState, Pull, Recorder};
pub use playlist::Playlist;
pub use ring::{PrefillGate, RingBuffer, RingError};
pub use transport::{Connection, HttpTransport, Request, ResponseHead, Transport};
