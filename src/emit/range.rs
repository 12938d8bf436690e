//! `Range` header parsing.

/// An inclusive byte range within a representation of known length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl ByteRange {
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

/// Parse a `Range` header against a representation of `total` bytes.
///
/// `None` means the range is unsatisfiable (caller answers `416`). An
/// omitted end is filled from the representation length.
pub fn parse(header: &str, total: u64) -> Option<ByteRange> {
    let spec = header.trim().strip_prefix("bytes=")?;
    let (start_raw, end_raw) = spec.split_once('-')?;

    let start: u64 = start_raw.trim().parse().ok()?;
    let end: u64 = match end_raw.trim() {
        "" => total.checked_sub(1)?,
        raw => raw.parse().ok()?,
    };

    if start >= end || end >= total {
        return None;
    }

    Some(ByteRange { start, end, total })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_range_parses() {
        let r = parse("bytes=0-9", 100).unwrap();
        assert_eq!(r.start, 0);
        assert_eq!(r.end, 9);
        assert_eq!(r.length(), 10);
        assert_eq!(r.content_range(), "bytes 0-9/100");
    }

    #[test]
    fn open_ended_range_fills_from_length() {
        let r = parse("bytes=90-", 100).unwrap();
        assert_eq!(r.end, 99);
        assert_eq!(r.length(), 10);
    }

    #[test]
    fn inverted_or_degenerate_ranges_are_rejected() {
        assert!(parse("bytes=9-0", 100).is_none());
        assert!(parse("bytes=5-5", 100).is_none());
        assert!(parse("bytes=abc-def", 100).is_none());
        assert!(parse("bytes=0-", 0).is_none());
    }

    #[test]
    fn out_of_bounds_end_is_rejected() {
        assert!(parse("bytes=0-100", 100).is_none());
        assert!(parse("bytes=0-99", 100).is_some());
    }

    #[test]
    fn malformed_units_are_rejected() {
        assert!(parse("items=0-9", 100).is_none());
        assert!(parse("0-9", 100).is_none());
    }
}
