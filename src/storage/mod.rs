//! Storage capability set shared by every component, with two interchangeable
//! backends: SQLite ([`SqliteStore`]) and RocksDB ([`KvStore`]).
//!
//! Both backends honour the same contract:
//! - every mutating call is atomic with respect to concurrent readers;
//! - unknown ids surface as [`Error::NotFound`](crate::Error::NotFound), duplicate
//!   book ids as [`Error::Conflict`](crate::Error::Conflict), and engine failures
//!   as [`Error::Storage`](crate::Error::Storage);
//! - listings are deterministic (books by id, blocklist by hash, operations
//!   newest first, duplicate groups by hash with members by path, operation
//!   logs oldest first);
//! - book paths are stored as UTF-8 text; any other path is a
//!   [`Error::Validation`](crate::Error::Validation).

#[cfg(feature = "rocksdb-backend")]
pub mod kv;
pub mod models;
pub mod sqlite;

use std::path::Path;
use std::sync::Arc;

use crate::config::{AppConfig, StorageBackend};
use crate::error::{Error, Result};
use models::{BlockedHash, Book, DuplicateGroup, Operation, OperationLog};

#[cfg(feature = "rocksdb-backend")]
pub use kv::KvStore;
pub use sqlite::SqliteStore;

pub trait Store: Send + Sync {
    // ── Books ────────────────────────────────────────────────────

    /// Insert a new book. An existing id is a conflict.
    fn create_book(&self, book: &Book) -> Result<()>;

    fn get_book(&self, id: &str) -> Result<Book>;

    fn get_book_by_path(&self, path: &Path) -> Result<Option<Book>>;

    /// Replace the stored record for `book.id`.
    fn update_book(&self, book: &Book) -> Result<()>;

    /// Read book `id`, apply `change` and write the result back as one step:
    /// no other write to the record lands in between. If `change` returns an
    /// error nothing is written and the error is returned as is.
    fn modify_book(
        &self,
        id: &str,
        change: &mut dyn FnMut(&mut Book) -> Result<()>,
    ) -> Result<Book>;

    /// Live (not soft-deleted) books ordered by id.
    fn list_books(&self) -> Result<Vec<Book>>;

    /// Live books whose effective hash equals `hash`, ordered by id.
    fn find_books_by_hash(&self, hash: &str) -> Result<Vec<Book>>;

    fn soft_delete_book(&self, id: &str) -> Result<()>;

    // ── Operations ───────────────────────────────────────────────

    /// Insert an operation record, replacing any earlier record with the same id.
    fn create_operation(&self, op: &Operation) -> Result<()>;

    fn get_operation(&self, id: &str) -> Result<Operation>;

    fn update_operation(&self, op: &Operation) -> Result<()>;

    /// All persisted operations, newest first.
    fn list_operations(&self) -> Result<Vec<Operation>>;

    fn add_operation_log(&self, entry: &OperationLog) -> Result<()>;

    /// Log entries of `operation_id` in the order they were added.
    fn get_operation_logs(&self, operation_id: &str) -> Result<Vec<OperationLog>>;

    // ── Blocklist ────────────────────────────────────────────────

    /// Insert or replace the entry keyed by `entry.hash`.
    fn upsert_blocked_hash(&self, entry: &BlockedHash) -> Result<()>;

    fn get_blocked_hash(&self, hash: &str) -> Result<Option<BlockedHash>>;

    fn list_blocked_hashes(&self) -> Result<Vec<BlockedHash>>;

    fn delete_blocked_hash(&self, hash: &str) -> Result<()>;

    fn is_hash_blocked(&self, hash: &str) -> Result<bool>;

    // ── Derived ──────────────────────────────────────────────────

    fn get_duplicate_books(&self) -> Result<Vec<DuplicateGroup>>;
}

/// Open the backend selected by `config.storage_backend`.
pub fn open_store(config: &AppConfig) -> Result<Arc<dyn Store>> {
    open_backend(config.storage_backend, &config.database_path)
}

pub fn open_backend(backend: StorageBackend, path: &Path) -> Result<Arc<dyn Store>> {
    match backend {
        StorageBackend::Sqlite => Ok(Arc::new(SqliteStore::open(path)?)),
        #[cfg(feature = "rocksdb-backend")]
        StorageBackend::Rocksdb => Ok(Arc::new(KvStore::open(path)?)),
        #[cfg(not(feature = "rocksdb-backend"))]
        StorageBackend::Rocksdb => Err(Error::Validation(
            "this build does not include the rocksdb backend".to_string(),
        )),
    }
}

/// Ids, hashes and the path on a book record must be well-formed before
/// either backend persists it.
pub(crate) fn validate_book(book: &Book) -> Result<()> {
    if book.id.is_empty() || book.id.contains(':') {
        return Err(Error::Validation(format!(
            "book id must be non-empty and free of ':', got {:?}",
            book.id
        )));
    }
    path_str(&book.file_path)?;
    for hash in [&book.original_file_hash, &book.organized_file_hash]
        .into_iter()
        .flatten()
    {
        crate::hasher::validate_hash(hash)?;
    }
    Ok(())
}

pub(crate) fn path_str(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| {
        Error::Validation(format!("path is not valid UTF-8: {}", path.display()))
    })
}

/// Applies `change` to a copy of `current` and checks the result is storable.
pub(crate) fn apply_change(
    current: &Book,
    change: &mut dyn FnMut(&mut Book) -> Result<()>,
) -> Result<Book> {
    let mut next = current.clone();
    change(&mut next)?;
    if next.id != current.id {
        return Err(Error::Validation(format!(
            "book id cannot change ({} -> {})",
            current.id, next.id
        )));
    }
    validate_book(&next)?;
    Ok(next)
}

pub(crate) fn book_not_found(id: &str) -> Error {
    Error::NotFound(format!("book {}", id))
}

pub(crate) fn operation_not_found(id: &str) -> Error {
    Error::NotFound(format!("operation {}", id))
}

pub(crate) fn blocked_hash_not_found(hash: &str) -> Error {
    Error::NotFound(format!("blocked hash {}", hash))
}
