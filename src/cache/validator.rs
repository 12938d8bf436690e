//! Strong validator computation.
//!
//! ETags are the seeded murmur3 hash of the response identity
//! (`url|length|last-modified[|body]`), stored and compared unquoted.

use std::io::Cursor;

fn mmh3(data: &[u8], seed: u32) -> u32 {
    // Infallible over an in-memory cursor.
    murmur3::murmur3_32(&mut Cursor::new(data), seed).unwrap_or_default()
}

/// Seeded hash of a stable handler identity (registration name).
pub fn identity_hash(name: &str, seed: u32) -> u32 {
    mmh3(name.as_bytes(), seed)
}

/// Validator for a local file: `url|size|mtime`.
pub fn file_tag(url: &str, size: u64, mtime_secs: i64, seed: u32) -> String {
    let identity = format!("{}|{}|{}", url, size, mtime_secs);
    format!("{:x}", mmh3(identity.as_bytes(), seed))
}

/// Validator for an in-memory representation: `url|length|last-modified|body`.
pub fn body_tag(
    url: &str,
    length: u64,
    last_modified: &str,
    body: &[u8],
    seed: u32,
) -> String {
    let mut identity =
        Vec::with_capacity(url.len() + last_modified.len() + body.len() + 24);
    identity.extend_from_slice(url.as_bytes());
    identity.push(b'|');
    identity.extend_from_slice(length.to_string().as_bytes());
    identity.push(b'|');
    identity.extend_from_slice(last_modified.as_bytes());
    identity.push(b'|');
    identity.extend_from_slice(body);
    format!("{:x}", mmh3(&identity, seed))
}

/// Strip surrounding quotes (and a weak prefix) from a wire ETag.
pub fn unquote(raw: &str) -> &str {
    let raw = raw.trim();
    let raw = raw.strip_prefix("W/").unwrap_or(raw);
    raw.trim_matches('"')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_deterministic_for_a_seed() {
        let a = file_tag("http://localhost:8000/a.txt", 5, 1_700_000_000, 625);
        let b = file_tag("http://localhost:8000/a.txt", 5, 1_700_000_000, 625);
        assert_eq!(a, b);
    }

    #[test]
    fn seed_changes_the_tag() {
        let a = file_tag("http://localhost:8000/a.txt", 5, 1_700_000_000, 625);
        let b = file_tag("http://localhost:8000/a.txt", 5, 1_700_000_000, 626);
        assert_ne!(a, b);
    }

    #[test]
    fn any_identity_component_changes_the_tag() {
        let base = file_tag("http://h/p", 10, 100, 1);
        assert_ne!(base, file_tag("http://h/q", 10, 100, 1));
        assert_ne!(base, file_tag("http://h/p", 11, 100, 1));
        assert_ne!(base, file_tag("http://h/p", 10, 101, 1));
    }

    #[test]
    fn unquote_strips_wire_forms() {
        assert_eq!(unquote("\"abc123\""), "abc123");
        assert_eq!(unquote("W/\"abc123\""), "abc123");
        assert_eq!(unquote("abc123"), "abc123");
    }

    #[test]
    fn body_tag_observes_content() {
        let a = body_tag("http://h/p", 3, "Mon, 01 Jan 2024 00:00:00 GMT", b"abc", 1);
        let b = body_tag("http://h/p", 3, "Mon, 01 Jan 2024 00:00:00 GMT", b"abd", 1);
        assert_ne!(a, b);
    }
}
