use std::path::Path;

/// Coarse classification of the free-form `file_type` a site sends
/// (an extension like `php` or a MIME type like `image/jpeg`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Php,
    Js,
    Css,
    Html,
    Json,
    Image,
    Other,
}

impl FileKind {
    pub fn classify(file_type: &str) -> Self {
        let t = file_type.trim().to_ascii_lowercase();
        match t.as_str() {
            "php" | "application/x-php" | "text/x-php" => Self::Php,
            "js" | "javascript" | "jsx" | "mjs" | "application/javascript" | "text/javascript" => {
                Self::Js
            }
            "css" | "text/css" => Self::Css,
            "html" | "htm" | "text/html" => Self::Html,
            "json" | "application/json" => Self::Json,
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" | "ico" | "image" => Self::Image,
            // SVG is markup, not a raster image
            "svg" | "image/svg+xml" => Self::Other,
            other if other.starts_with("image/") => Self::Image,
            _ => Self::Other,
        }
    }

    /// Directory under `wordpress/` holding files of this kind.
    pub fn storage_dir(self) -> &'static str {
        match self {
            Self::Php => "php",
            Self::Js => "js",
            Self::Css => "css",
            Self::Html => "html",
            Self::Json => "json",
            Self::Image => "images",
            Self::Other => "other",
        }
    }

    /// Whether the analyzer can make sense of the content.
    pub fn is_text(self) -> bool {
        self != Self::Image
    }
}

/// Extension for a stored file: the original path's extension when present,
/// else the table entry for `file_type`, else the raw `file_type`.
pub fn extension_for(file_path: &str, file_type: &str) -> String {
    if let Some(ext) = Path::new(file_path)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
    {
        return ext.to_string();
    }
    let t = file_type.trim().to_ascii_lowercase();
    let mapped = match t.as_str() {
        "php" | "application/x-php" | "text/x-php" => "php",
        "js" | "javascript" | "application/javascript" | "text/javascript" => "js",
        "css" | "text/css" => "css",
        "html" | "htm" | "text/html" => "html",
        "json" | "application/json" => "json",
        "txt" | "text/plain" => "txt",
        "xml" | "application/xml" | "text/xml" => "xml",
        "jpg" | "jpeg" | "image/jpeg" => "jpg",
        "gif" | "image/gif" => "gif",
        "webp" | "image/webp" => "webp",
        "svg" | "image/svg+xml" => "svg",
        _ if FileKind::classify(&t) == FileKind::Image => "png",
        _ => return file_type.trim().to_string(),
    };
    mapped.to_string()
}

/// Extensions the directory scan hands to the analyzer.
pub fn is_analyzable_path(path: &str) -> bool {
    const SUPPORTED: &[&str] = &[
        "php", "js", "css", "html", "htm", "vue", "jsx", "ts", "tsx", "json", "xml", "yaml", "yml",
        "md", "twig", "scss", "less", "sass", "sql",
    ];
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".blade.php") {
        return true;
    }
    Path::new(&lower)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| SUPPORTED.contains(&ext))
}
