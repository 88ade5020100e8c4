//! Destination naming: file names derived from URLs, optionally filed by type.

use std::path::{Component, Path, PathBuf};

use tracing::debug;
use url::Url;

/// Name used when the URL path has no usable last segment.
const FALLBACK_FILENAME: &str = "download.bin";

/// Subdirectory per file type, keyed by lowercase extension.
const CATEGORIES: &[(&str, &[&str])] = &[
    ("videos", &["mp4", "avi", "mkv", "mov", "wmv", "flv", "webm"]),
    ("audio", &["mp3", "wav", "flac", "aac", "ogg", "wma"]),
    ("images", &["jpg", "jpeg", "png", "gif", "bmp", "svg", "webp"]),
    ("documents", &["pdf", "doc", "docx", "txt", "rtf", "odt"]),
    ("archives", &["zip", "rar", "7z", "tar", "gz", "bz2"]),
    ("executables", &["exe", "msi", "deb", "rpm", "dmg", "pkg"]),
];

/// Replaces characters that are invalid or dangerous in file names.
pub(crate) fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized.replace('.', "_")
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// Percent-decoded, sanitized last path segment of `url`.
pub(crate) fn filename_from_url(url: &Url) -> String {
    let Some(last) = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|last| !last.is_empty())
    else {
        return FALLBACK_FILENAME.to_string();
    };

    let decoded = urlencoding::decode(last).unwrap_or_else(|e| {
        debug!(segment = %last, error = %e, "URL decoding failed, using raw segment");
        std::borrow::Cow::Borrowed(last)
    });
    sanitize_filename(&decoded)
}

/// Category subdirectory for `file_name`, judged by its extension.
pub(crate) fn category_for(file_name: &str) -> Option<&'static str> {
    let extension = Path::new(file_name)
        .extension()?
        .to_str()?
        .to_ascii_lowercase();
    CATEGORIES
        .iter()
        .find(|(_, extensions)| extensions.contains(&extension.as_str()))
        .map(|(category, _)| *category)
}

/// Final file path: `destination` itself, or a URL-derived name inside it
/// when `destination` is an existing directory.
///
/// With `organize`, a directory destination gains the category subdirectory
/// of the derived name; unknown types stay at the top.
pub(crate) fn resolve_destination(url: &Url, destination: &Path, organize: bool) -> PathBuf {
    if !destination.is_dir() {
        return destination.to_path_buf();
    }
    let name = filename_from_url(url);
    match category_for(&name).filter(|_| organize) {
        Some(category) => destination.join(category).join(name),
        None => destination.join(name),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename_removes_invalid_chars() {
        assert_eq!(sanitize_filename("file/name.iso"), "file_name.iso");
        assert_eq!(sanitize_filename("a:b*c?.bin"), "a_b_c_.bin");
        assert_eq!(sanitize_filename(""), "_");
    }

    #[test]
    fn test_sanitize_filename_neutralizes_traversal() {
        assert_eq!(sanitize_filename(".."), "__");
        assert_eq!(sanitize_filename("."), "_");
    }

    #[test]
    fn test_filename_from_url_decodes_percent_escapes() {
        let url = Url::parse("https://example.com/files/my%20image.iso?x=1").unwrap();
        assert_eq!(filename_from_url(&url), "my image.iso");
    }

    #[test]
    fn test_filename_from_url_falls_back() {
        let url = Url::parse("https://example.com/").unwrap();
        assert_eq!(filename_from_url(&url), FALLBACK_FILENAME);
    }

    #[test]
    fn test_resolve_destination_joins_directory() {
        let dir = tempfile::tempdir().unwrap();
        let url = Url::parse("https://example.com/a/b.tar.gz").unwrap();
        assert_eq!(
            resolve_destination(&url, dir.path(), false),
            dir.path().join("b.tar.gz")
        );

        let explicit = dir.path().join("renamed.tgz");
        assert_eq!(resolve_destination(&url, &explicit, false), explicit);
    }

    #[test]
    fn test_category_for_known_and_unknown_extensions() {
        assert_eq!(category_for("clip.MKV"), Some("videos"));
        assert_eq!(category_for("b.tar.gz"), Some("archives"));
        assert_eq!(category_for("notes.txt"), Some("documents"));
        assert_eq!(category_for("data.bin"), None);
        assert_eq!(category_for("README"), None);
    }

    #[test]
    fn test_resolve_destination_organizes_by_category() {
        let dir = tempfile::tempdir().unwrap();
        let video = Url::parse("https://example.com/media/talk.webm").unwrap();
        assert_eq!(
            resolve_destination(&video, dir.path(), true),
            dir.path().join("videos").join("talk.webm")
        );

        let unknown = Url::parse("https://example.com/blob.dat").unwrap();
        assert_eq!(
            resolve_destination(&unknown, dir.path(), true),
            dir.path().join("blob.dat")
        );

        // An explicit file path is never rearranged.
        let explicit = dir.path().join("talk.webm");
        assert_eq!(resolve_destination(&video, &explicit, true), explicit);
    }
}
