//! Content-encoding negotiation and compression.
//!
//! Compression applies only to successful, non-empty, textual responses for
//! clients that advertise support; gzip wins over deflate when both are
//! acceptable. Compressed representations are persisted as side files named
//! by the response validator so later hits skip the encoder entirely.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use regex::Regex;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Gzip,
    Deflate,
}

impl Encoding {
    pub fn token(&self) -> &'static str {
        match self {
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
        }
    }

    /// Side-file extension.
    pub fn ext(&self) -> &'static str {
        match self {
            Encoding::Gzip => "gz",
            Encoding::Deflate => "zz",
        }
    }
}

fn compressible_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("javascript|json|text|xml").unwrap())
}

pub fn compressible(content_type: &str) -> bool {
    compressible_re().is_match(content_type)
}

/// Pick an encoding for a response, or `None` to send identity.
pub fn select(
    enabled: bool,
    status: u16,
    body_empty: bool,
    content_type: &str,
    user_agent: Option<&str>,
    accept_encoding: Option<&str>,
) -> Option<Encoding> {
    if !enabled || body_empty || !(status == 200 || status == 206) {
        return None;
    }
    if !compressible(content_type) {
        return None;
    }
    if user_agent.map(|ua| ua.contains("MSIE")).unwrap_or(false) {
        return None;
    }
    let accepted = accept_encoding?;
    if accepted.contains("gzip") {
        Some(Encoding::Gzip)
    } else if accepted.contains("deflate") {
        Some(Encoding::Deflate)
    } else {
        None
    }
}

/// Compress a buffer in memory.
pub fn compress(data: &[u8], encoding: Encoding) -> std::io::Result<Vec<u8>> {
    match encoding {
        Encoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        Encoding::Deflate => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
    }
}

/// Compress a buffer and persist it as a side file.
///
/// Writers for distinct validators never collide (the name is the content
/// hash); a concurrent writer for the same validator is idempotent, so the
/// write goes through a same-directory temp name and a final rename.
pub async fn persist(data: Vec<u8>, side_file: PathBuf) -> std::io::Result<()> {
    tokio::task::spawn_blocking(move || {
        let staging = side_file.with_extension(format!(
            "{}.tmp",
            side_file
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("part")
        ));
        std::fs::write(&staging, &data)?;
        std::fs::rename(&staging, &side_file)?;
        debug!(path = %side_file.display(), bytes = data.len(), "side file persisted");
        Ok(())
    })
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}

/// Stream-compress a source file into a side file, returning its size.
pub async fn persist_file(
    source: PathBuf,
    side_file: PathBuf,
    encoding: Encoding,
) -> std::io::Result<u64> {
    tokio::task::spawn_blocking(move || {
        let staging = side_file.with_extension(format!(
            "{}.tmp",
            side_file
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("part")
        ));
        let mut input = std::fs::File::open(&source)?;
        let output = std::fs::File::create(&staging)?;
        match encoding {
            Encoding::Gzip => {
                let mut encoder = GzEncoder::new(output, Compression::default());
                std::io::copy(&mut input, &mut encoder)?;
                encoder.finish()?;
            }
            Encoding::Deflate => {
                let mut encoder = ZlibEncoder::new(output, Compression::default());
                std::io::copy(&mut input, &mut encoder)?;
                encoder.finish()?;
            }
        }
        std::fs::rename(&staging, &side_file)?;
        let size = std::fs::metadata(&side_file)?.len();
        debug!(path = %side_file.display(), bytes = size, "side file persisted");
        Ok(size)
    })
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}

/// Size of an existing side file, if one survives on disk.
pub async fn side_file_size(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|m| m.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn selection_requires_success_and_content() {
        assert!(select(true, 200, false, "text/html", None, Some("gzip")).is_some());
        assert!(select(true, 206, false, "text/html", None, Some("gzip")).is_some());
        assert!(select(true, 404, false, "text/html", None, Some("gzip")).is_none());
        assert!(select(true, 200, true, "text/html", None, Some("gzip")).is_none());
        assert!(select(false, 200, false, "text/html", None, Some("gzip")).is_none());
    }

    #[test]
    fn selection_requires_textual_content_type() {
        assert!(select(true, 200, false, "application/json", None, Some("gzip")).is_some());
        assert!(select(true, 200, false, "text/csv", None, Some("gzip")).is_some());
        assert!(select(true, 200, false, "image/png", None, Some("gzip")).is_none());
        assert!(select(true, 200, false, "video/mp4", None, Some("gzip")).is_none());
    }

    #[test]
    fn gzip_preferred_over_deflate() {
        assert_eq!(
            select(true, 200, false, "text/html", None, Some("deflate, gzip")),
            Some(Encoding::Gzip)
        );
        assert_eq!(
            select(true, 200, false, "text/html", None, Some("deflate")),
            Some(Encoding::Deflate)
        );
        assert_eq!(select(true, 200, false, "text/html", None, Some("br")), None);
        assert_eq!(select(true, 200, false, "text/html", None, None), None);
    }

    #[test]
    fn legacy_msie_is_never_compressed() {
        assert!(select(
            true,
            200,
            false,
            "text/html",
            Some("Mozilla/4.0 (compatible; MSIE 6.0)"),
            Some("gzip")
        )
        .is_none());
    }

    #[test]
    fn gzip_round_trip() {
        let compressed = compress(b"hello hello hello", Encoding::Gzip).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut out = String::new();
        decoder.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello hello hello");
    }

    #[test]
    fn deflate_round_trip() {
        let compressed = compress(b"abcabcabc", Encoding::Deflate).unwrap();
        let mut decoder = flate2::read::ZlibDecoder::new(&compressed[..]);
        let mut out = String::new();
        decoder.read_to_string(&mut out).unwrap();
        assert_eq!(out, "abcabcabc");
    }

    #[tokio::test]
    async fn persist_file_writes_side_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src.txt");
        std::fs::write(&source, b"side file payload, repeated payload").unwrap();
        let side = dir.path().join("abc.gz");

        let size = persist_file(source, side.clone(), Encoding::Gzip)
            .await
            .unwrap();
        assert!(size > 0);
        assert_eq!(side_file_size(&side).await, Some(size));
    }
}
