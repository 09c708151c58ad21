use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref RANGE_RE: Regex = Regex::new(r"^bytes=([0-9]*)-([0-9]*)$").unwrap();
}

/// Inclusive byte interval, always within `0..size` of the resource it was parsed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    start: u64,
    end: u64,
}

impl ByteRange {
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Value for a `Range` header when forwarding the request upstream.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }

    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// No usable `Range` header; serve the whole body.
    Full,
    Partial(ByteRange),
    /// Syntactically valid but outside the resource (416).
    Unsatisfiable,
}

// Overlong digit runs saturate so they fail the bounds check instead of the grammar.
fn parse_bound(digits: &str) -> Option<u64> {
    if digits.is_empty() {
        None
    } else {
        Some(digits.parse::<u64>().unwrap_or(u64::MAX))
    }
}

/// Resolve a `Range` header against a resource of `size` bytes.
///
/// Headers outside the single-range `bytes=<start>-<end>` grammar are ignored
/// and the full body is served.
pub fn parse_range(header: Option<&str>, size: u64) -> RangeRequest {
    let Some(header) = header else {
        return RangeRequest::Full;
    };
    let Some(caps) = RANGE_RE.captures(header) else {
        return RangeRequest::Full;
    };

    let (start, end) = match (parse_bound(&caps[1]), parse_bound(&caps[2])) {
        (None, None) => return RangeRequest::Full,
        // bytes=-500 (last 500 bytes)
        (None, Some(suffix)) => (size.saturating_sub(suffix.min(size)), size.checked_sub(1)),
        // bytes=500- (from 500 to the end)
        (Some(start), None) => (start, size.checked_sub(1)),
        (Some(start), Some(end)) => (start, Some(end)),
    };

    match end {
        Some(end) if start <= end && end < size => RangeRequest::Partial(ByteRange { start, end }),
        _ => RangeRequest::Unsatisfiable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partial(header: &str, size: u64) -> Option<(u64, u64)> {
        match parse_range(Some(header), size) {
            RangeRequest::Partial(r) => Some((r.start(), r.end())),
            _ => None,
        }
    }

    #[test]
    fn test_no_header_is_full() {
        assert_eq!(parse_range(None, 1000), RangeRequest::Full);
    }

    #[test]
    fn test_explicit_range() {
        assert_eq!(partial("bytes=0-499", 1000), Some((0, 499)));
        assert_eq!(partial("bytes=500-999", 1000), Some((500, 999)));
        assert_eq!(partial("bytes=7-7", 1000), Some((7, 7)));
    }

    #[test]
    fn test_explicit_range_exhaustive_small_sizes() {
        for size in 1..12u64 {
            for a in 0..size {
                for b in a..size {
                    assert_eq!(partial(&format!("bytes={a}-{b}"), size), Some((a, b)));
                }
            }
        }
    }

    #[test]
    fn test_open_end() {
        assert_eq!(partial("bytes=500-", 1000), Some((500, 999)));
        assert_eq!(partial("bytes=0-", 1), Some((0, 0)));
    }

    #[test]
    fn test_suffix() {
        assert_eq!(partial("bytes=-200", 1000), Some((800, 999)));
        assert_eq!(partial("bytes=-1000", 1000), Some((0, 999)));
        assert_eq!(partial("bytes=-5000", 1000), Some((0, 999)));
    }

    #[test]
    fn test_unsatisfiable() {
        assert_eq!(parse_range(Some("bytes=500-100"), 1000), RangeRequest::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=0-1000"), 1000), RangeRequest::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=1000-"), 1000), RangeRequest::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=-0"), 1000), RangeRequest::Unsatisfiable);
        assert_eq!(
            parse_range(Some("bytes=99999999999999999999999-"), 1000),
            RangeRequest::Unsatisfiable
        );
    }

    #[test]
    fn test_malformed_is_ignored() {
        let malformed = [
            "bytes=-",
            "bytes=abc-def",
            "items=0-1",
            "bytes=0-1,4-5",
            "bytes= 0-1",
            "",
            // Arabic-Indic digits are not part of the grammar
            "bytes=\u{0663}-",
            "bytes=0-\u{0665}",
        ];
        for header in malformed {
            assert_eq!(parse_range(Some(header), 1000), RangeRequest::Full, "{header}");
        }
    }

    #[test]
    fn test_header_values() {
        let RangeRequest::Partial(r) = parse_range(Some("bytes=10-19"), 100) else {
            panic!("expected a partial range");
        };
        assert_eq!(r.len(), 10);
        assert_eq!(r.header_value(), "bytes=10-19");
        assert_eq!(r.content_range(100), "bytes 10-19/100");
    }
}
