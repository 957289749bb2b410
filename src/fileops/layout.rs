use std::path::{Path, PathBuf};

use crate::storage::models::Book;

const UNKNOWN_AUTHOR: &str = "Unknown Author";

/// Canonical location for a book under `root`:
/// `<root>/<author>/<title>/<file name>`.
pub fn destination_for(book: &Book, root: &Path) -> PathBuf {
    let author = book
        .author
        .as_deref()
        .map(sanitize_component)
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| UNKNOWN_AUTHOR.to_string());

    let title = Some(sanitize_component(&book.title))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| book.id.clone());

    let file_name = book
        .file_path
        .file_name()
        .map(|n| sanitize_component(&n.to_string_lossy()))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| book.id.clone());

    root.join(author).join(title).join(file_name)
}

/// Make a string safe to use as a single path component.
pub fn sanitize_component(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    replaced.trim().trim_matches('.').trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_layout() {
        let book = Book::new_imported(
            "The Left Hand of Darkness",
            Some("Ursula K. Le Guin".to_string()),
            "/incoming/lhod.m4b",
            1,
            "a".repeat(64),
        );
        assert_eq!(
            destination_for(&book, Path::new("/library")),
            PathBuf::from("/library/Ursula K. Le Guin/The Left Hand of Darkness/lhod.m4b")
        );
    }

    #[test]
    fn test_missing_author_and_hostile_title() {
        let book = Book::new_imported("../../etc", None, "/incoming/x.mp3", 1, "a".repeat(64));
        let dest = destination_for(&book, Path::new("/library"));
        assert!(dest.starts_with("/library/Unknown Author"));
        assert!(!dest
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir)));
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("AC/DC: Live?"), "AC_DC_ Live_");
        assert_eq!(sanitize_component(" .. "), "");
    }
}
