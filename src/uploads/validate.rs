//! Shallow content checks by declared type. Not a parser.

use super::kind::FileKind;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("image content could not be decoded: {0}")]
    Image(String),
    #[error("PHP file does not contain an opening <?php tag")]
    MissingPhpTag,
    #[error("CSS file contains no braces or semicolons")]
    NotCss,
    #[error("HTML file contains no recognizable tag")]
    NotHtml,
}

pub fn validate(file_type: &str, bytes: &[u8]) -> Result<(), ValidationError> {
    match FileKind::classify(file_type) {
        FileKind::Image => image::load_from_memory(bytes)
            .map(|_| ())
            .map_err(|e| ValidationError::Image(e.to_string())),
        FileKind::Php => {
            if contains(bytes, b"<?php") {
                Ok(())
            } else {
                Err(ValidationError::MissingPhpTag)
            }
        }
        FileKind::Css => {
            if bytes.iter().any(|b| matches!(b, b'{' | b'}' | b';')) {
                Ok(())
            } else {
                Err(ValidationError::NotCss)
            }
        }
        FileKind::Html => {
            if has_tag_token(bytes) {
                Ok(())
            } else {
                Err(ValidationError::NotHtml)
            }
        }
        FileKind::Js | FileKind::Json | FileKind::Other => Ok(()),
    }
}

/// `<` followed by an element name, a closing slash, `!--` or `!doctype`.
fn has_tag_token(bytes: &[u8]) -> bool {
    bytes.iter().enumerate().any(|(i, &b)| {
        if b != b'<' {
            return false;
        }
        let rest = &bytes[i + 1..];
        let rest = rest.strip_prefix(b"/").unwrap_or(rest);
        match rest.first() {
            Some(c) if c.is_ascii_alphabetic() => true,
            Some(b'!') => {
                let after = &rest[1..];
                after.starts_with(b"--") || after.to_ascii_lowercase().starts_with(b"doctype")
            }
            _ => false,
        }
    })
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
