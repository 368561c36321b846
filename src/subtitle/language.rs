// Best-effort subtitle language detection from file names.

use std::fmt;

use serde::{Serialize, Serializer};

/// A two-letter language code guessed for a track, or undetermined.
///
/// This is a hint: `Undetermined` is an ordinary outcome, not a failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LanguageHint {
    Code(String),
    Undetermined,
}

impl LanguageHint {
    pub const UNDETERMINED_CODE: &'static str = "und";

    pub fn as_str(&self) -> &str {
        match self {
            Self::Code(code) => code,
            Self::Undetermined => Self::UNDETERMINED_CODE,
        }
    }

    pub fn is_determined(&self) -> bool {
        matches!(self, Self::Code(_))
    }
}

impl fmt::Display for LanguageHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for LanguageHint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

pub trait LanguageDetector: Send + Sync {
    fn detect(&self, file_name: &str) -> LanguageHint;
}

/// Substring patterns over the lower-cased file name, checked in table order.
const PATTERNS: &[(&str, &str)] = &[
    ("english", "en"),
    (".en.", "en"),
    ("eng.", "en"),
    (".eng.", "en"),
    ("french", "fr"),
    (".fr.", "fr"),
    ("fra.", "fr"),
    (".fra.", "fr"),
    ("spanish", "es"),
    (".es.", "es"),
    ("spa.", "es"),
    (".spa.", "es"),
    ("german", "de"),
    (".de.", "de"),
    ("ger.", "de"),
    (".ger.", "de"),
    ("japanese", "ja"),
    (".ja.", "ja"),
    ("jpn.", "ja"),
    (".jpn.", "ja"),
    ("chinese", "zh"),
    (".zh.", "zh"),
    ("chi.", "zh"),
    (".chi.", "zh"),
    ("korean", "ko"),
    (".ko.", "ko"),
    ("kor.", "ko"),
    (".kor.", "ko"),
    ("russian", "ru"),
    (".ru.", "ru"),
    ("rus.", "ru"),
    (".rus.", "ru"),
    ("italian", "it"),
    (".it.", "it"),
    ("ita.", "it"),
    (".ita.", "it"),
    ("portuguese", "pt"),
    (".pt.", "pt"),
    ("por.", "pt"),
    (".por.", "pt"),
    ("dutch", "nl"),
    (".nl.", "nl"),
    ("nld.", "nl"),
    (".nld.", "nl"),
];

/// Default detector. First matching pattern wins, so a name mentioning two
/// languages gets whichever comes first in the table.
#[derive(Debug, Default, Clone, Copy)]
pub struct FilenameHeuristic;

impl LanguageDetector for FilenameHeuristic {
    fn detect(&self, file_name: &str) -> LanguageHint {
        let lower = file_name.to_lowercase();
        PATTERNS
            .iter()
            .find(|(pattern, _)| lower.contains(pattern))
            .map(|(_, code)| LanguageHint::Code((*code).to_string()))
            .unwrap_or(LanguageHint::Undetermined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect(name: &str) -> String {
        FilenameHeuristic.detect(name).to_string()
    }

    #[test]
    fn test_abbreviation_between_dots() {
        assert_eq!(detect("Movie.2019.en.srt"), "en");
        assert_eq!(detect("movie.FR.srt"), "fr");
        assert_eq!(detect("show.s01e01.jpn.ass"), "ja");
    }

    #[test]
    fn test_full_language_name() {
        assert_eq!(detect("Movie - German.srt"), "de");
        assert_eq!(detect("subs/Portuguese.vtt"), "pt");
    }

    #[test]
    fn test_no_match_is_undetermined() {
        let hint = FilenameHeuristic.detect("movie.srt");
        assert_eq!(hint, LanguageHint::Undetermined);
        assert!(!hint.is_determined());
        assert_eq!(hint.as_str(), "und");
    }

    #[test]
    fn test_serialises_as_code() {
        let json = serde_json::to_string(&LanguageHint::Code("ko".into())).unwrap();
        assert_eq!(json, "\"ko\"");
        let json = serde_json::to_string(&LanguageHint::Undetermined).unwrap();
        assert_eq!(json, "\"und\"");
    }
}
