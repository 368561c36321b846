// Built-in subtitle codec: SubRip, SubStation Alpha/ASS and MicroDVD parsed into cues, written as WebVTT.
// Input that is not valid UTF-8 is decoded lossily; broken timing is an error.

use std::fmt::Write as _;

use thiserror::Error;

use super::SubtitleFormat;

/// Frame rate assumed for MicroDVD files that do not declare one.
const MICRODVD_DEFAULT_FPS: f64 = 23.976;

/// Field layout used when an `[Events]` section has no `Format:` line.
const SSA_DEFAULT_FORMAT: &str = "Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("line {line}: malformed timing \"{text}\"")]
    BadTiming { line: usize, text: String },
    #[error("no subtitle cues found")]
    NoCues,
    #[error("[Events] format has no {0} field")]
    MissingField(&'static str),
}

/// A timed block of text, times in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cue {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

pub trait SubtitleCodec: Send + Sync {
    /// Convert `input` in `format` to a WebVTT document.
    fn to_webvtt(&self, format: SubtitleFormat, input: &[u8]) -> Result<String, CodecError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinCodec;

impl SubtitleCodec for BuiltinCodec {
    fn to_webvtt(&self, format: SubtitleFormat, input: &[u8]) -> Result<String, CodecError> {
        let text = normalise_text(input);
        let mut cues = match format {
            SubtitleFormat::WebVtt => return Ok(text),
            SubtitleFormat::SubRip => parse_srt(&text)?,
            SubtitleFormat::SubStation => parse_ssa(&text)?,
            SubtitleFormat::MicroDvd => parse_microdvd(&text)?,
        };
        if cues.is_empty() && !text.trim().is_empty() {
            return Err(CodecError::NoCues);
        }
        cues.sort_by_key(|cue| cue.start_ms);
        Ok(write_webvtt(&cues))
    }
}

fn normalise_text(input: &[u8]) -> String {
    let text = String::from_utf8_lossy(input);
    let text = text.strip_prefix('\u{feff}').unwrap_or(&text);
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Render cues as a WebVTT document.
pub fn write_webvtt(cues: &[Cue]) -> String {
    let mut out = String::from("WEBVTT\n\n");
    for cue in cues {
        let _ = write!(
            out,
            "{} --> {}\n{}\n\n",
            format_timestamp(cue.start_ms),
            format_timestamp(cue.end_ms),
            cue.text.replace("-->", "->")
        );
    }
    out
}

fn format_timestamp(ms: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        ms / 3_600_000,
        (ms / 60_000) % 60,
        (ms / 1000) % 60,
        ms % 1000
    )
}

/// Parse `[H:]MM:SS[,.]fff` into milliseconds. The fraction may have any
/// number of digits; only the first three count.
fn parse_timestamp(value: &str) -> Option<u64> {
    let value = value.trim();
    let (clock, fraction) = match value.find([',', '.']) {
        Some(idx) => (&value[..idx], &value[idx + 1..]),
        None => (value, ""),
    };

    let parts: Vec<&str> = clock.split(':').collect();
    let (h, m, s) = match parts.as_slice() {
        [h, m, s] => (*h, *m, *s),
        [m, s] => ("0", *m, *s),
        _ => return None,
    };
    let h: u64 = h.trim().parse().ok()?;
    let m: u64 = m.trim().parse().ok()?;
    let s: u64 = s.trim().parse().ok()?;
    if m >= 60 || s >= 60 {
        return None;
    }

    let mut ms = 0u64;
    if !fraction.is_empty() {
        if !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let digits: String = fraction.chars().chain("000".chars()).take(3).collect();
        ms = digits.parse().ok()?;
    }

    let seconds = h.checked_mul(3600)?.checked_add(m * 60 + s)?;
    seconds.checked_mul(1000)?.checked_add(ms)
}

fn parse_timing_line(line: &str) -> Option<(u64, u64)> {
    let (start, rest) = line.split_once("-->")?;
    // Anything after the end time (SRT position hints) is ignored.
    let end = rest.split_whitespace().next()?;
    Some((parse_timestamp(start)?, parse_timestamp(end)?))
}

fn parse_srt(text: &str) -> Result<Vec<Cue>, CodecError> {
    let mut cues = Vec::new();
    let mut lines = text.lines().enumerate().peekable();

    loop {
        while lines.peek().is_some_and(|(_, l)| l.trim().is_empty()) {
            lines.next();
        }
        let Some((mut number, mut line)) = lines.next() else {
            break;
        };

        // Optional cue index.
        if !line.contains("-->") && line.trim().bytes().all(|b| b.is_ascii_digit()) {
            match lines.next() {
                Some(next) => (number, line) = next,
                None => break,
            }
        }

        let (start_ms, end_ms) = parse_timing_line(line).ok_or_else(|| CodecError::BadTiming {
            line: number + 1,
            text: line.trim().to_string(),
        })?;

        let mut body = Vec::new();
        while let Some(&(_, l)) = lines.peek() {
            if l.trim().is_empty() {
                break;
            }
            body.push(l.trim_end());
            lines.next();
        }

        cues.push(Cue {
            start_ms,
            end_ms,
            text: body.join("\n"),
        });
    }

    Ok(cues)
}

fn clean_ssa_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_override = false;
    for c in text.chars() {
        match c {
            '{' => in_override = true,
            '}' if in_override => in_override = false,
            _ if !in_override => out.push(c),
            _ => {}
        }
    }
    out.replace("\\N", "\n")
        .replace("\\n", "\n")
        .replace("\\h", " ")
        .trim()
        .to_string()
}

fn parse_ssa(text: &str) -> Result<Vec<Cue>, CodecError> {
    let mut in_events = false;
    let mut format: Vec<String> = Vec::new();
    let mut cues = Vec::new();

    for (number, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.starts_with('[') {
            in_events = line.eq_ignore_ascii_case("[events]");
            continue;
        }
        if !in_events {
            continue;
        }

        if let Some(fields) = strip_prefix_ignore_case(line, "format:") {
            format = fields.split(',').map(|f| f.trim().to_ascii_lowercase()).collect();
            continue;
        }
        let Some(fields) = strip_prefix_ignore_case(line, "dialogue:") else {
            continue;
        };

        if format.is_empty() {
            format = SSA_DEFAULT_FORMAT
                .split(',')
                .map(|f| f.trim().to_ascii_lowercase())
                .collect();
        }
        let position = |name: &'static str| {
            format
                .iter()
                .position(|f| f == name)
                .ok_or(CodecError::MissingField(name))
        };
        let start_idx = position("start")?;
        let end_idx = position("end")?;
        let text_idx = position("text")?;

        // Text is the last field and may itself contain commas.
        let values: Vec<&str> = fields.splitn(format.len(), ',').collect();
        let bad_timing = || CodecError::BadTiming {
            line: number + 1,
            text: line.to_string(),
        };
        let start_ms = values
            .get(start_idx)
            .and_then(|v| parse_timestamp(v))
            .ok_or_else(bad_timing)?;
        let end_ms = values
            .get(end_idx)
            .and_then(|v| parse_timestamp(v))
            .ok_or_else(bad_timing)?;
        let body = values.get(text_idx).copied().unwrap_or_default();

        cues.push(Cue {
            start_ms,
            end_ms,
            text: clean_ssa_text(body),
        });
    }

    Ok(cues)
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| line[prefix.len()..].trim_start())
}

/// Split `{a}{b}rest` into its two frame numbers and the remainder.
fn split_microdvd(line: &str) -> Option<(&str, &str, &str)> {
    let rest = line.strip_prefix('{')?;
    let (a, rest) = rest.split_once('}')?;
    let rest = rest.strip_prefix('{')?;
    let (b, rest) = rest.split_once('}')?;
    Some((a, b, rest))
}

fn parse_microdvd(text: &str) -> Result<Vec<Cue>, CodecError> {
    let mut fps = MICRODVD_DEFAULT_FPS;
    let mut cues = Vec::new();

    for (number, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let bad_timing = || CodecError::BadTiming {
            line: number + 1,
            text: line.to_string(),
        };
        let (a, b, body) = split_microdvd(line).ok_or_else(bad_timing)?;
        let start: u64 = a.trim().parse().map_err(|_| bad_timing())?;
        let end: u64 = b.trim().parse().map_err(|_| bad_timing())?;

        // `{1}{1}25.000` as the first cue declares the frame rate.
        if cues.is_empty() && start == 1 && end == 1 {
            if let Ok(declared) = body.trim().parse::<f64>() {
                if declared > 0.0 {
                    fps = declared;
                }
                continue;
            }
        }

        let to_ms = |frame: u64| (frame as f64 * 1000.0 / fps).round() as u64;
        cues.push(Cue {
            start_ms: to_ms(start),
            end_ms: to_ms(end),
            text: clean_ssa_text(body).replace('|', "\n"),
        });
    }

    Ok(cues)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert(format: SubtitleFormat, input: &str) -> Result<String, CodecError> {
        BuiltinCodec.to_webvtt(format, input.as_bytes())
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("00:00:01,500"), Some(1_500));
        assert_eq!(parse_timestamp("01:02:03.004"), Some(3_723_004));
        assert_eq!(parse_timestamp("0:00:05.25"), Some(5_250));
        assert_eq!(parse_timestamp("02:03"), Some(123_000));
        assert_eq!(parse_timestamp("00:61:00,000"), None);
        assert_eq!(parse_timestamp("abc"), None);
    }

    #[test]
    fn test_srt_to_webvtt() {
        let srt = "\u{feff}1\r\n00:00:01,000 --> 00:00:02,500\r\nHello\r\nworld\r\n\r\n2\r\n00:00:03,000 --> 00:00:04,000 X1:10\r\n<i>Bye</i>\r\n";
        let vtt = convert(SubtitleFormat::SubRip, srt).unwrap();
        assert_eq!(
            vtt,
            "WEBVTT\n\n00:00:01.000 --> 00:00:02.500\nHello\nworld\n\n00:00:03.000 --> 00:00:04.000\n<i>Bye</i>\n\n"
        );
    }

    #[test]
    fn test_srt_without_indices() {
        let srt = "00:00:01,000 --> 00:00:02,000\nOne\n\n00:00:02,000 --> 00:00:03,000\nTwo\n";
        let vtt = convert(SubtitleFormat::SubRip, srt).unwrap();
        assert!(vtt.contains("00:00:02.000 --> 00:00:03.000\nTwo"));
    }

    #[test]
    fn test_srt_bad_timing_is_error() {
        let srt = "1\n00:00:01 -> 00:00:02\nOops\n";
        let err = convert(SubtitleFormat::SubRip, srt).unwrap_err();
        assert!(matches!(err, CodecError::BadTiming { line: 2, .. }));
    }

    #[test]
    fn test_oversized_hours_are_bad_timing() {
        let srt = "1\n99999999999999999:00:00,000 --> 99999999999999999:00:01,000\nLate\n";
        let err = convert(SubtitleFormat::SubRip, srt).unwrap_err();
        assert!(matches!(err, CodecError::BadTiming { line: 2, .. }));
        assert_eq!(parse_timestamp("18446744073709551615:00:00.000"), None);
    }

    #[test]
    fn test_garbage_is_no_cues_or_bad_timing() {
        assert!(convert(SubtitleFormat::SubStation, "just some text").is_err());
        assert!(convert(SubtitleFormat::SubRip, "just some text").is_err());
        assert_eq!(convert(SubtitleFormat::SubRip, "  \n").unwrap(), "WEBVTT\n\n");
    }

    #[test]
    fn test_ass_events() {
        let ass = "[Script Info]\nTitle: x\n\n[V4+ Styles]\nFormat: Name, Fontname\n\n[Events]\nFormat: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text\nDialogue: 0,0:00:05.00,0:00:06.50,Default,,0,0,0,,{\\i1}Hi,{\\i0} there\\Nfriend\nComment: 0,0:00:07.00,0:00:08.00,Default,,0,0,0,,ignored\nDialogue: 0,0:00:01.00,0:00:02.00,Default,,0,0,0,,First\n";
        let vtt = convert(SubtitleFormat::SubStation, ass).unwrap();
        assert_eq!(
            vtt,
            "WEBVTT\n\n00:00:01.000 --> 00:00:02.000\nFirst\n\n00:00:05.000 --> 00:00:06.500\nHi, there\nfriend\n\n"
        );
    }

    #[test]
    fn test_microdvd_with_declared_fps() {
        let sub = "{1}{1}25\n{25}{50}Hello|world\n{75}{100}{y:i}Later\n";
        let vtt = convert(SubtitleFormat::MicroDvd, sub).unwrap();
        assert_eq!(
            vtt,
            "WEBVTT\n\n00:00:01.000 --> 00:00:02.000\nHello\nworld\n\n00:00:03.000 --> 00:00:04.000\nLater\n\n"
        );
    }

    #[test]
    fn test_webvtt_passes_through() {
        let vtt = "WEBVTT\n\n00:00.000 --> 00:01.000\nhi\n";
        assert_eq!(convert(SubtitleFormat::WebVtt, vtt).unwrap(), vtt);
    }
}
