//! Error types for the streaming source
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// Main error type for the source stage
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("{}", friendly_network_error(.0))]
    Network(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("Playlist error: {0}")]
    Playlist(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Source stopped")]
    Stopped,

    #[error("URL has not been set")]
    NoUrl,
}

/// Result type alias for the source stage
pub type Result<T> = std::result::Result<T, SourceError>;

fn friendly_network_error(e: &reqwest::Error) -> String {
    if e.is_builder() {
        if let Some(url) = e.url() {
            return format!("Invalid URL: {url}");
        }
        return "Invalid URL".to_string();
    }
    if e.is_connect() {
        if let Some(url) = e.url() {
            return format!("Could not connect to {}", url.host_str().unwrap_or("server"));
        }
        return "Could not connect to server".to_string();
    }
    if e.is_timeout() {
        return "Connection timed out".to_string();
    }
    format!("Network error: {e}")
}
