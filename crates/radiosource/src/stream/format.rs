//! Stream format description and Content-Type classification

use std::fmt;

/// Payload type announced by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecType {
    #[default]
    Unknown,
    Mp3,
    Aac,
    Ogg,
    Wav,
    Opus,
    /// M3U / M3U8 playlist, not audio
    PlaylistM3u,
    /// PLS playlist, not audio
    PlaylistPls,
}

impl CodecType {
    pub fn is_playlist(self) -> bool {
        matches!(self, CodecType::PlaylistM3u | CodecType::PlaylistPls)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CodecType::Unknown => "unknown",
            CodecType::Mp3 => "mp3",
            CodecType::Aac => "aac",
            CodecType::Ogg => "ogg",
            CodecType::Wav => "wav",
            CodecType::Opus => "opus",
            CodecType::PlaylistM3u => "m3u",
            CodecType::PlaylistPls => "pls",
        }
    }

    /// Classify a Content-Type header value (case-insensitive).
    ///
    /// Parameters such as `; charset=...` are ignored. Anything not in the
    /// table maps to `Unknown`.
    pub fn from_content_type(content_type: &str) -> Self {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match mime.as_str() {
            "mp3" | "audio/mp3" | "audio/mpeg" | "binary/octet-stream"
            | "application/octet-stream" => CodecType::Mp3,
            "audio/aac" | "audio/x-aac" | "audio/mp4" | "audio/aacp" | "video/mp2t" => {
                CodecType::Aac
            }
            "application/ogg" | "audio/ogg" => CodecType::Ogg,
            "audio/wav" => CodecType::Wav,
            "audio/opus" => CodecType::Opus,
            "audio/x-mpegurl" | "application/vnd.apple.mpegurl" | "vnd.apple.mpegurl" => {
                CodecType::PlaylistM3u
            }
            m if m.starts_with("audio/x-scpls") => CodecType::PlaylistPls,
            _ => CodecType::Unknown,
        }
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format of the bytes delivered through the pull interface.
///
/// The codec comes from the response headers. Sample fields stay `None`
/// until a downstream stage fills them in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamFormat {
    pub codec: CodecType,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub bits_per_sample: Option<u16>,
}

impl StreamFormat {
    pub fn with_codec(codec: CodecType) -> Self {
        Self {
            codec,
            ..Default::default()
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mp3_variants() {
        for ct in [
            "mp3",
            "audio/mp3",
            "audio/mpeg",
            "AUDIO/MPEG",
            "binary/octet-stream",
            "application/octet-stream",
        ] {
            assert_eq!(CodecType::from_content_type(ct), CodecType::Mp3, "{ct}");
        }
    }

    #[test]
    fn aac_variants() {
        for ct in ["audio/aac", "audio/x-aac", "audio/mp4", "audio/aacp", "video/MP2T"] {
            assert_eq!(CodecType::from_content_type(ct), CodecType::Aac, "{ct}");
        }
    }

    #[test]
    fn other_codecs() {
        assert_eq!(CodecType::from_content_type("application/ogg"), CodecType::Ogg);
        assert_eq!(CodecType::from_content_type("audio/ogg"), CodecType::Ogg);
        assert_eq!(CodecType::from_content_type("Audio/Ogg; codecs=vorbis"), CodecType::Ogg);
        assert_eq!(CodecType::from_content_type("audio/wav"), CodecType::Wav);
        assert_eq!(CodecType::from_content_type("audio/opus"), CodecType::Opus);
    }

    #[test]
    fn playlists() {
        assert_eq!(
            CodecType::from_content_type("audio/x-mpegurl"),
            CodecType::PlaylistM3u
        );
        assert_eq!(
            CodecType::from_content_type("application/vnd.apple.mpegurl"),
            CodecType::PlaylistM3u
        );
        assert_eq!(
            CodecType::from_content_type("audio/x-scpls"),
            CodecType::PlaylistPls
        );
        assert_eq!(
            CodecType::from_content_type("audio/x-scpls-legacy"),
            CodecType::PlaylistPls
        );
        assert!(CodecType::PlaylistPls.is_playlist());
        assert!(!CodecType::Mp3.is_playlist());
    }

    #[test]
    fn parameters_are_ignored() {
        assert_eq!(
            CodecType::from_content_type("audio/mpeg; charset=utf-8"),
            CodecType::Mp3
        );
        assert_eq!(
            CodecType::from_content_type("audio/x-scpls;charset=UTF-8"),
            CodecType::PlaylistPls
        );
    }

    #[test]
    fn unknown_type() {
        assert_eq!(CodecType::from_content_type("text/html"), CodecType::Unknown);
        assert_eq!(CodecType::from_content_type(""), CodecType::Unknown);
        assert_eq!(CodecType::from_content_type("audio/flac"), CodecType::Unknown);
    }

    #[test]
    fn format_reset() {
        let mut f = StreamFormat {
            codec: CodecType::Aac,
            sample_rate: Some(44100),
            channels: Some(2),
            bits_per_sample: None,
        };
        f.reset();
        assert_eq!(f, StreamFormat::default());
        assert_eq!(f.codec, CodecType::Unknown);
    }

    #[test]
    fn codec_display() {
        assert_eq!(CodecType::Mp3.to_string(), "mp3");
        assert_eq!(StreamFormat::with_codec(CodecType::Ogg).codec.to_string(), "ogg");
    }
}
