// Byte-range negotiation for the video endpoint.

#[derive(Debug, PartialEq, Eq)]
pub enum ParsedRange {
    StartEnd {
        start: u64,
        end_inclusive: Option<u64>,
    },
    Suffix {
        len: u64,
    },
}

/// Parse a single `bytes=` range: `start-end`, `start-` or `-suffix_len`.
///
/// Multi-range sets and reversed bounds parse as `None`.
pub fn parse_range_header(value: &str) -> Option<ParsedRange> {
    let spec = value.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (first, last) = spec.split_once('-')?;
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        return match last.parse::<u64>().ok()? {
            0 => None,
            len => Some(ParsedRange::Suffix { len }),
        };
    }
    let start: u64 = first.parse().ok()?;
    let end_inclusive = match last {
        "" => None,
        last => Some(last.parse::<u64>().ok()?),
    };
    match end_inclusive {
        Some(end) if end < start => None,
        _ => Some(ParsedRange::StartEnd {
            start,
            end_inclusive,
        }),
    }
}

/// What to send for a request against a resource of known length.
#[derive(Debug, PartialEq, Eq)]
pub enum RangeOutcome {
    /// 200 with the whole resource.
    Full,
    /// 206 with bytes `[start, end)`.
    Partial { start: u64, end: u64 },
    /// 416 with `Content-Range: bytes */total`.
    Unsatisfiable,
}

/// Map an optional `Range` header onto a resource of `total` bytes.
/// Headers that do not parse are ignored, as if absent.
pub fn negotiate(header: Option<&str>, total: u64) -> RangeOutcome {
    let Some(range) = header.and_then(parse_range_header) else {
        return RangeOutcome::Full;
    };

    match range {
        ParsedRange::StartEnd { start, .. } if start >= total => RangeOutcome::Unsatisfiable,
        ParsedRange::StartEnd {
            start,
            end_inclusive,
        } => {
            let end = end_inclusive.map_or(total, |end| end.saturating_add(1).min(total));
            RangeOutcome::Partial { start, end }
        }
        ParsedRange::Suffix { .. } if total == 0 => RangeOutcome::Unsatisfiable,
        ParsedRange::Suffix { len } => RangeOutcome::Partial {
            start: total.saturating_sub(len),
            end: total,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_header_forms() {
        assert_eq!(
            parse_range_header("bytes=0-1023"),
            Some(ParsedRange::StartEnd {
                start: 0,
                end_inclusive: Some(1023)
            })
        );
        assert_eq!(
            parse_range_header(" bytes=500- "),
            Some(ParsedRange::StartEnd {
                start: 500,
                end_inclusive: None
            })
        );
        assert_eq!(
            parse_range_header("bytes=-1024"),
            Some(ParsedRange::Suffix { len: 1024 })
        );
    }

    #[test]
    fn test_parse_range_header_invalid() {
        assert_eq!(parse_range_header("invalid"), None);
        assert_eq!(parse_range_header("bytes=abc-def"), None);
        assert_eq!(parse_range_header("bytes=0-1,4-5"), None);
        assert_eq!(parse_range_header("bytes=9-3"), None);
        assert_eq!(parse_range_header("bytes=-0"), None);
    }

    #[test]
    fn test_negotiate() {
        assert_eq!(negotiate(None, 100), RangeOutcome::Full);
        assert_eq!(negotiate(Some("items=0-1"), 100), RangeOutcome::Full);
        assert_eq!(
            negotiate(Some("bytes=10-19"), 100),
            RangeOutcome::Partial { start: 10, end: 20 }
        );
        assert_eq!(
            negotiate(Some("bytes=90-500"), 100),
            RangeOutcome::Partial { start: 90, end: 100 }
        );
        assert_eq!(
            negotiate(Some("bytes=50-"), 100),
            RangeOutcome::Partial { start: 50, end: 100 }
        );
        assert_eq!(
            negotiate(Some("bytes=-30"), 100),
            RangeOutcome::Partial { start: 70, end: 100 }
        );
        assert_eq!(
            negotiate(Some("bytes=-300"), 100),
            RangeOutcome::Partial { start: 0, end: 100 }
        );
        assert_eq!(negotiate(Some("bytes=100-"), 100), RangeOutcome::Unsatisfiable);
        assert_eq!(negotiate(Some("bytes=-5"), 0), RangeOutcome::Unsatisfiable);
    }
}
