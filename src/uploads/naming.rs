//! Storage names for received files.
//!
//! Layout: `wordpress/{type dir}/{site folder}/{YYYYMMDD_HHMMSS}_{digest}_{path}.{ext}`.

use super::kind::{extension_for, FileKind};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Longest sanitized file-path component kept in a stored name.
pub const MAX_PATH_COMPONENT: usize = 100;

const DIGEST_CHARS: usize = 10;

/// `https://www.Example.com/blog/` -> `Example-com-blog`.
pub fn site_folder_name(site_url: &str) -> String {
    let mut name = site_url.trim();
    for scheme in ["https://", "http://"] {
        if let Some(rest) = strip(name, scheme) {
            name = rest;
            break;
        }
    }
    if let Some(rest) = strip(name, "www.") {
        name = rest;
    }
    name.trim_end_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Replace everything outside `[A-Za-z0-9_.-]` with `_`.
pub fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Unique stored file name, with the current time and a random nonce.
pub fn unique_file_name(site_url: &str, file_path: &str, file_type: &str) -> String {
    unique_file_name_at(
        site_url,
        file_path,
        file_type,
        Utc::now(),
        &uuid::Uuid::new_v4().to_string(),
    )
}

pub fn unique_file_name_at(
    site_url: &str,
    file_path: &str,
    file_type: &str,
    now: DateTime<Utc>,
    nonce: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(site_url.as_bytes());
    hasher.update(file_path.as_bytes());
    hasher.update(now.timestamp_micros().to_string().as_bytes());
    hasher.update(nonce.as_bytes());
    let digest = hex::encode(hasher.finalize());

    let extension = extension_for(file_path, file_type);
    let stem = strip_extension(file_path);
    let mut clean = sanitize(stem);
    if clean.len() > MAX_PATH_COMPONENT {
        clean.truncate(MAX_PATH_COMPONENT);
    }

    format!(
        "{}_{}_{}.{}",
        now.format("%Y%m%d_%H%M%S"),
        &digest[..DIGEST_CHARS],
        clean,
        sanitize(&extension)
    )
}

/// Relative storage path (under the storage root) for a new file.
pub fn storage_path(site_url: &str, file_path: &str, file_type: &str) -> String {
    format!(
        "wordpress/{}/{}/{}",
        FileKind::classify(file_type).storage_dir(),
        site_folder_name(site_url),
        unique_file_name(site_url, file_path, file_type)
    )
}

fn strip<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    s.get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .map(|_| &s[prefix.len()..])
}

fn strip_extension(file_path: &str) -> &str {
    match Path::new(file_path).extension().and_then(|e| e.to_str()) {
        Some(ext) if !ext.is_empty() => &file_path[..file_path.len() - ext.len() - 1],
        _ => file_path,
    }
}
