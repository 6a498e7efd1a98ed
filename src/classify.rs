use std::path::Path;

use crate::formats::{InputKind, InputRequest};

pub const DOCUMENT_EXTENSIONS: &[&str] = &["mobi", "pdf", "epub", "azw3", "txt"];

pub fn classify(args: &[String]) -> Vec<InputRequest> {
    let mut requests = Vec::with_capacity(args.len());
    for arg in args {
        let kind = if is_url(arg) {
            InputKind::Url
        } else if is_url_file(Path::new(arg)) {
            InputKind::UrlFile
        } else if is_local_document(Path::new(arg)) {
            InputKind::LocalDocument
        } else {
            tracing::warn!(input = %arg, "could not classify input; skipping");
            continue;
        };
        tracing::debug!(input = %arg, ?kind, "classified input");
        requests.push(InputRequest {
            input: arg.clone(),
            kind,
        });
    }
    requests
}

pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// A file counts as a URL list only if it has at least one non-blank line and every
/// non-blank line starts with `http`.
pub fn is_url_file(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    let Ok(contents) = std::fs::read_to_string(path) else {
        return false;
    };

    let mut lines = contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .peekable();
    if lines.peek().is_none() {
        return false;
    }
    lines.all(|line| line.starts_with("http"))
}

pub fn is_local_document(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .is_some_and(|ext| DOCUMENT_EXTENSIONS.contains(&ext.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, contents: &[u8]) -> String {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path.to_string_lossy().to_string()
    }

    #[test]
    fn only_http_and_https_prefixes_are_urls() {
        assert!(is_url("http://example.com"));
        assert!(is_url("https://example.com/a?b=c"));
        assert!(!is_url("ftp://example.com"));
        assert!(!is_url("example.com"));
        assert!(!is_url("httpx://nope"));
    }

    #[test]
    fn classify_partitions_every_input_into_one_kind() {
        let dir = tempfile::tempdir().unwrap();
        let links = write(
            dir.path(),
            "links.txt",
            b"https://a.test/1\n\n  http://b.test/2  \n",
        );
        let notes = write(dir.path(), "notes.txt", b"just some notes\nhttps://a.test\n");
        let book = write(dir.path(), "Book.PDF", b"%PDF-1.4");
        let image = write(dir.path(), "photo.png", b"\x89PNG");
        let missing = dir.path().join("missing.epub").to_string_lossy().to_string();

        let args = vec![
            "https://example.com/post".to_owned(),
            links.clone(),
            notes.clone(),
            book.clone(),
            image,
            missing,
            "not-a-thing".to_owned(),
        ];
        let requests = classify(&args);

        assert_eq!(
            requests,
            vec![
                InputRequest {
                    input: "https://example.com/post".to_owned(),
                    kind: InputKind::Url,
                },
                InputRequest {
                    input: links,
                    kind: InputKind::UrlFile,
                },
                InputRequest {
                    input: notes,
                    kind: InputKind::LocalDocument,
                },
                InputRequest {
                    input: book,
                    kind: InputKind::LocalDocument,
                },
            ]
        );
    }

    #[test]
    fn empty_text_file_is_a_document_not_a_url_list() {
        let dir = tempfile::tempdir().unwrap();
        let empty = write(dir.path(), "empty.txt", b"\n   \n");
        assert!(!is_url_file(Path::new(&empty)));
        assert!(is_local_document(Path::new(&empty)));
    }

    #[test]
    fn binary_file_is_not_a_url_list() {
        let dir = tempfile::tempdir().unwrap();
        let epub = write(dir.path(), "book.epub", &[0xff, 0xfe, 0x00, 0x81]);
        assert!(!is_url_file(Path::new(&epub)));
        assert!(is_local_document(Path::new(&epub)));
    }

    #[test]
    fn url_list_without_document_extension_is_still_a_url_file() {
        let dir = tempfile::tempdir().unwrap();
        let list = write(dir.path(), "reading-list", b"https://a.test/1 - SENT\n");
        assert!(is_url_file(Path::new(&list)));
        assert!(!is_local_document(Path::new(&list)));
    }
}
