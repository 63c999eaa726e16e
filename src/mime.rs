//! MIME-type classification and binary-vs-text detection. Pure functions,
//! consumed by the engine but with no dependency on it.

use std::path::Path;

const TEXT_EXTENSIONS: &[(&str, &str)] = &[
    ("txt", "text/plain"),
    ("md", "text/markdown"),
    ("json", "application/json"),
    ("yaml", "application/yaml"),
    ("yml", "application/yaml"),
    ("toml", "application/toml"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("js", "text/javascript"),
    ("ts", "text/typescript"),
    ("rs", "text/x-rust"),
    ("py", "text/x-python"),
    ("csv", "text/csv"),
    ("xml", "application/xml"),
    ("svg", "image/svg+xml"),
];

const BINARY_EXTENSIONS: &[(&str, &str)] = &[
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("wasm", "application/wasm"),
    ("mp4", "video/mp4"),
    ("mp3", "audio/mpeg"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
];

pub fn guess(rel_path: &str) -> String {
    let ext = Path::new(rel_path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    for (e, mime) in TEXT_EXTENSIONS.iter().chain(BINARY_EXTENSIONS.iter()) {
        if *e == ext {
            return (*mime).to_string();
        }
    }
    "application/octet-stream".to_string()
}

/// A file is binary if its extension is known-binary, or (for unknown
/// extensions) its bytes contain a NUL within the first 8000 bytes, the
/// same heuristic `git`/most CRDT tools use to classify unknown content.
pub fn is_binary(rel_path: &str, bytes: &[u8]) -> bool {
    let ext = Path::new(rel_path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if TEXT_EXTENSIONS.iter().any(|(e, _)| *e == ext) {
        return false;
    }
    if BINARY_EXTENSIONS.iter().any(|(e, _)| *e == ext) {
        return true;
    }
    let sample = &bytes[..bytes.len().min(8000)];
    if sample.contains(&0) {
        return true;
    }
    std::str::from_utf8(sample).is_err()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guesses_known_text_extensions() {
        assert_eq!(guess("notes.md"), "text/markdown");
        assert_eq!(guess("data.json"), "application/json");
    }

    #[test]
    fn guesses_known_binary_extensions() {
        assert_eq!(guess("photo.png"), "image/png");
    }

    #[test]
    fn unknown_extension_falls_back_to_octet_stream() {
        assert_eq!(guess("README"), "application/octet-stream");
    }

    #[test]
    fn detects_binary_via_extension() {
        assert!(is_binary("photo.png", b"whatever"));
        assert!(!is_binary("notes.txt", b"hello"));
    }

    #[test]
    fn detects_binary_via_nul_byte_heuristic() {
        let bytes = vec![0x00, 0x01, 0x02, 0x03];
        assert!(is_binary("unknownfile", &bytes));
        assert!(!is_binary("unknownfile", b"plain ascii content"));
    }
}
