//! Filename sanitization and content-type policy.

use crate::error::{Error, Result};

/// Longest basename accepted, in bytes.
pub const MAX_FILENAME_BYTES: usize = 255;

/// Reduce a client-supplied filename to a safe basename.
///
/// Directory components (either separator) are discarded, control characters
/// are dropped and anything outside `[A-Za-z0-9._ -]` or non-ASCII letters
/// becomes `_`. Leading and trailing dots and whitespace are trimmed so the
/// result can never be `.`, `..` or a hidden file.
pub fn sanitize_filename(raw: &str) -> Result<String> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default();

    let mut cleaned = String::with_capacity(base.len());
    for c in base.chars() {
        if c.is_control() {
            continue;
        }
        if c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ') {
            cleaned.push(c);
        } else {
            cleaned.push('_');
        }
    }

    let trimmed = cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace());
    if trimmed.is_empty() {
        return Err(Error::InvalidFilename(format!(
            "{raw:?} is empty after sanitization"
        )));
    }

    Ok(truncate_to_bytes(trimmed, MAX_FILENAME_BYTES))
}

/// Lowercased extension without the dot, if any.
pub fn extension(filename: &str) -> Option<String> {
    let (stem, ext) = filename.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Allow-lists for declared content types and filename extensions.
///
/// An empty list allows everything.
#[derive(Clone, Debug, Default)]
pub struct ContentPolicy {
    allowed_mime_types: Vec<String>,
    allowed_extensions: Vec<String>,
}

impl ContentPolicy {
    pub fn new(allowed_mime_types: &[String], allowed_extensions: &[String]) -> Self {
        Self {
            allowed_mime_types: allowed_mime_types
                .iter()
                .map(|m| m.trim().to_ascii_lowercase())
                .collect(),
            allowed_extensions: allowed_extensions
                .iter()
                .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    /// Check a sanitized filename and declared mime type.
    pub fn check(&self, filename: &str, mime_type: &str) -> Result<()> {
        if !self.allowed_mime_types.is_empty() {
            let essence = mime_type
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase();
            if !self.allowed_mime_types.contains(&essence) {
                return Err(Error::UnsupportedContentType(format!(
                    "mime type {mime_type:?} is not allowed"
                )));
            }
        }

        if !self.allowed_extensions.is_empty() {
            let allowed = extension(filename)
                .map(|ext| self.allowed_extensions.contains(&ext))
                .unwrap_or(false);
            if !allowed {
                return Err(Error::UnsupportedContentType(format!(
                    "extension of {filename:?} is not allowed"
                )));
            }
        }

        Ok(())
    }
}

fn truncate_to_bytes(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    // Keep the extension when the stem can absorb the cut.
    if let Some((stem, ext)) = s.rsplit_once('.')
        && ext.len() + 1 < max
    {
        let mut end = max - ext.len() - 1;
        while !stem.is_char_boundary(end) {
            end -= 1;
        }
        return format!("{}.{}", &stem[..end], ext);
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_directories() {
        assert_eq!(sanitize_filename("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(
            sanitize_filename("C:\\Users\\me\\novel.epub").unwrap(),
            "novel.epub"
        );
    }

    #[test]
    fn test_replaces_unsafe_characters() {
        assert_eq!(sanitize_filename("my book?.epub").unwrap(), "my book_.epub");
        assert_eq!(sanitize_filename("a\u{0}b\nc.txt").unwrap(), "abc.txt");
        assert_eq!(sanitize_filename("café.pdf").unwrap(), "café.pdf");
    }

    #[test]
    fn test_rejects_empty_results() {
        for raw in ["", "..", "dir/", " . ", "\u{7}"] {
            assert!(
                matches!(sanitize_filename(raw), Err(Error::InvalidFilename(_))),
                "{raw:?} should be rejected"
            );
        }
        assert_eq!(sanitize_filename(".hidden").unwrap(), "hidden");
    }

    #[test]
    fn test_truncates_long_names_keeping_extension() {
        let long = format!("{}.epub", "x".repeat(400));
        let cleaned = sanitize_filename(&long).unwrap();
        assert_eq!(cleaned.len(), MAX_FILENAME_BYTES);
        assert!(cleaned.ends_with(".epub"));
    }

    #[test]
    fn test_extension() {
        assert_eq!(extension("book.EPUB").as_deref(), Some("epub"));
        assert_eq!(extension("archive.tar.gz").as_deref(), Some("gz"));
        assert_eq!(extension("README"), None);
        assert_eq!(extension("trailing."), None);
    }

    #[test]
    fn test_empty_policy_allows_everything() {
        let policy = ContentPolicy::default();
        assert!(policy.check("anything.bin", "application/octet-stream").is_ok());
    }

    #[test]
    fn test_policy_enforces_lists() {
        let policy = ContentPolicy::new(
            &["application/epub+zip".to_string()],
            &[".epub".to_string()],
        );
        assert!(policy.check("book.epub", "application/epub+zip").is_ok());
        assert!(
            policy
                .check("book.epub", "Application/EPUB+zip; charset=binary")
                .is_ok()
        );
        assert!(policy.check("book.pdf", "application/epub+zip").is_err());
        assert!(policy.check("book.epub", "application/pdf").is_err());
        assert!(policy.check("book", "application/epub+zip").is_err());
    }
}
