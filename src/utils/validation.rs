use crate::error::{UploadError, UploadResult};
use std::path::Path;

/// Characters stripped from file and field names before they touch the filesystem.
const SPECIAL_CHARS: &[char] = &[
    '?', '[', ']', '/', '\\', '=', '<', '>', ':', ';', ',', '\'', '"', '&', '$', '#', '*', '(',
    ')', '|', '~', '`', '!', '{', '}', '%', '+', '’', '«', '»', '”', '“',
];

const MAX_NAME_LEN: usize = 255;

/// Sanitizes a file name so it is safe to use as a single path segment.
///
/// Only the final path component is kept, reserved characters are removed,
/// whitespace runs become a single `-`, and leading/trailing `.`, `-` and `_`
/// are trimmed so the result can never be `..` or a hidden file.
pub fn sanitize_file_name(filename: &str) -> String {
    let name = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .replace("%20", " ");

    if filename.contains("..") || filename.contains('/') || filename.contains('\\') {
        tracing::warn!("Path traversal attempt detected: {}", filename);
    }

    let mut sanitized = String::with_capacity(name.len());
    let mut last_dash = false;
    for c in name.chars() {
        if c.is_control() || SPECIAL_CHARS.contains(&c) {
            continue;
        }
        if c.is_whitespace() || c == '-' {
            if !last_dash {
                sanitized.push('-');
            }
            last_dash = true;
            continue;
        }
        sanitized.push(c);
        last_dash = false;
    }

    let trimmed = sanitized.trim_matches(|c| c == '.' || c == '-' || c == '_');

    // Limit length safely for UTF-8
    if trimmed.len() > MAX_NAME_LEN {
        let mut end = MAX_NAME_LEN;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        trimmed[..end].to_string()
    } else {
        trimmed.to_string()
    }
}

/// Sanitizes a name and rejects it when nothing usable is left.
pub fn require_segment(raw: &str, what: &str) -> UploadResult<String> {
    let sanitized = sanitize_file_name(raw);
    if sanitized.is_empty() {
        return Err(UploadError::InvalidRequest(format!("{} cannot be empty", what)));
    }
    Ok(sanitized)
}

/// Validates the declared upload length against the configured maximum
pub fn validate_file_size(size: u64, max_size: u64) -> UploadResult<()> {
    if size > max_size {
        return Err(UploadError::PayloadTooLarge {
            size,
            max: max_size,
        });
    }
    Ok(())
}

/// Splits a file name into stem and extension the way collision suffixes expect.
pub fn split_file_name(file_name: &str) -> (String, Option<String>) {
    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name)
        .to_string();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_string());
    (stem, ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("test.pdf"), "test.pdf");
        assert_eq!(sanitize_file_name("my file.doc"), "my-file.doc");
        assert_eq!(sanitize_file_name("my   -  file.doc"), "my-file.doc");
        assert_eq!(sanitize_file_name("test<script>.pdf"), "testscript.pdf");
        assert_eq!(sanitize_file_name("测试.txt"), "测试.txt");
        assert_eq!(sanitize_file_name("my%20report.pdf"), "my-report.pdf");
    }

    #[test]
    fn test_sanitize_file_name_traversal() {
        assert_eq!(sanitize_file_name("../../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("..\\..\\windows\\system32"), "system32");
        assert_eq!(sanitize_file_name(".."), "");
        assert_eq!(sanitize_file_name(".htaccess"), "htaccess");
    }

    #[test]
    fn test_sanitize_file_name_truncates_on_char_boundary() {
        let long = "é".repeat(200);
        let sanitized = sanitize_file_name(&long);
        assert!(sanitized.len() <= MAX_NAME_LEN);
        assert!(sanitized.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_require_segment() {
        assert_eq!(require_segment("resume", "Field name").unwrap(), "resume");
        assert!(matches!(
            require_segment("/../", "Field name"),
            Err(UploadError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_validate_file_size() {
        assert!(validate_file_size(100, 1000).is_ok());
        assert!(validate_file_size(1000, 1000).is_ok());
        assert!(matches!(
            validate_file_size(1001, 1000),
            Err(UploadError::PayloadTooLarge { size: 1001, max: 1000 })
        ));
    }

    #[test]
    fn test_split_file_name() {
        assert_eq!(
            split_file_name("foo.txt"),
            ("foo".to_string(), Some("txt".to_string()))
        );
        assert_eq!(
            split_file_name("archive.tar.gz"),
            ("archive.tar".to_string(), Some("gz".to_string()))
        );
        assert_eq!(split_file_name("README"), ("README".to_string(), None));
    }
}
