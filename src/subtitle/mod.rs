// Subtitle tracks: discovery, upload, language hints and WebVTT normalisation.

pub mod codec;
pub mod language;
pub mod registry;

pub use codec::{BuiltinCodec, CodecError, SubtitleCodec};
pub use language::{FilenameHeuristic, LanguageDetector, LanguageHint};
pub use registry::{SubtitleError, SubtitleRegistry};

use crate::config::extension_of;

/// Sidecar formats accepted by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtitleFormat {
    /// WebVTT, the one format clients consume.
    WebVtt,
    SubRip,
    /// SubStation Alpha and Advanced SubStation Alpha.
    SubStation,
    MicroDvd,
}

impl SubtitleFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "vtt" => Some(Self::WebVtt),
            "srt" => Some(Self::SubRip),
            "ass" | "ssa" => Some(Self::SubStation),
            "sub" => Some(Self::MicroDvd),
            _ => None,
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        extension_of(path).and_then(|ext| Self::from_extension(&ext))
    }

    /// Whether bytes in this format can be served verbatim.
    pub fn is_wire_format(self) -> bool {
        self == Self::WebVtt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_path() {
        assert_eq!(SubtitleFormat::from_path("a/Movie.EN.SRT"), Some(SubtitleFormat::SubRip));
        assert_eq!(SubtitleFormat::from_path("x.ssa"), Some(SubtitleFormat::SubStation));
        assert_eq!(SubtitleFormat::from_path("x.vtt"), Some(SubtitleFormat::WebVtt));
        assert_eq!(SubtitleFormat::from_path("x.exe"), None);
        assert_eq!(SubtitleFormat::from_path("noext"), None);
    }
}
