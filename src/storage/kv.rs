//! Embedded ordered key-value backend on RocksDB.
//!
//! Key layout:
//! - `book:{id}` → bincode [`Book`]
//! - `book:hash:{effective hash}:{id}` → id (secondary index, live books only)
//! - `book:path:{path}\0{id}` → id (secondary index, live books only)
//! - `operation:{id}` → bincode [`Operation`]
//! - `operation_log:{id}\0{nanos}{seq}` → bincode [`OperationLog`]
//! - `blocked:hash:{hash}` → bincode [`BlockedHash`]
//!
//! Index entries share the `book:` prefix with the records, so full book scans
//! skip them explicitly. Multi-key writes go through one `WriteBatch`, and
//! multi-key reads through one snapshot.

use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::models::{
    finalize_groups, BlockedHash, Book, BookState, DuplicateGroup, Operation, OperationLog,
};
use super::{
    apply_change, blocked_hash_not_found, book_not_found, operation_not_found, path_str,
    validate_book, Store,
};
use crate::error::{Error, Result};

const BOOK_PREFIX: &[u8] = b"book:";
const BOOK_HASH_INDEX: &[u8] = b"book:hash:";
const BOOK_PATH_INDEX: &[u8] = b"book:path:";
const OPERATION_PREFIX: &[u8] = b"operation:";
const OPERATION_LOG_PREFIX: &[u8] = b"operation_log:";
const BLOCKED_PREFIX: &[u8] = b"blocked:hash:";

pub struct KvStore {
    db: DB,
    // Serializes read-modify-write sequences (index maintenance); readers never take it.
    write_lock: Mutex<()>,
    // Tie-breaker for log entries written in the same nanosecond.
    log_seq: AtomicU64,
}

fn key(prefix: &[u8], suffix: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(prefix.len() + suffix.len());
    k.extend_from_slice(prefix);
    k.extend_from_slice(suffix.as_bytes());
    k
}

fn book_key(id: &str) -> Vec<u8> {
    key(BOOK_PREFIX, id)
}

fn hash_index_prefix(hash: &str) -> Vec<u8> {
    let mut k = key(BOOK_HASH_INDEX, hash);
    k.push(b':');
    k
}

fn path_index_prefix(path: &str) -> Vec<u8> {
    let mut k = key(BOOK_PATH_INDEX, path);
    k.push(0);
    k
}

fn log_prefix(operation_id: &str) -> Vec<u8> {
    let mut k = key(OPERATION_LOG_PREFIX, operation_id);
    k.push(0);
    k
}

fn is_index_key(k: &[u8]) -> bool {
    k.starts_with(BOOK_HASH_INDEX) || k.starts_with(BOOK_PATH_INDEX)
}

/// Index entries a book contributes in its current state.
fn index_keys(book: &Book) -> Result<Vec<Vec<u8>>> {
    if book.is_soft_deleted() {
        return Ok(Vec::new());
    }
    let mut keys = Vec::with_capacity(2);
    if let Some(hash) = book.effective_hash() {
        let mut k = hash_index_prefix(hash);
        k.extend_from_slice(book.id.as_bytes());
        keys.push(k);
    }
    let mut k = path_index_prefix(path_str(&book.file_path)?);
    k.extend_from_slice(book.id.as_bytes());
    keys.push(k);
    Ok(keys)
}

impl KvStore {
    pub fn open(path: &Path) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        debug!("Opened RocksDB store at {}", path.display());
        Ok(KvStore {
            db,
            write_lock: Mutex::new(()),
            log_seq: AtomicU64::new(0),
        })
    }

    fn lock_writes(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| Error::Storage("RocksDB write lock poisoned".to_string()))
    }

    fn read_book(&self, id: &str) -> Result<Option<Book>> {
        match self.db.get(book_key(id))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Replace `old` (if any) with `new`, keeping index entries in step, in one batch.
    fn write_book(&self, old: Option<&Book>, new: &Book) -> Result<()> {
        let mut batch = WriteBatch::default();
        if let Some(old) = old {
            for k in index_keys(old)? {
                batch.delete(k);
            }
        }
        batch.put(book_key(&new.id), bincode::serialize(new)?);
        for k in index_keys(new)? {
            batch.put(k, new.id.as_bytes());
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Ids referenced by index entries under `prefix`, read from one snapshot
    /// together with the records they point at.
    fn books_from_index(&self, prefix: &[u8]) -> Result<Vec<Book>> {
        let snapshot = self.db.snapshot();
        let mut books = Vec::new();
        for item in snapshot.iterator(IteratorMode::From(prefix, Direction::Forward)) {
            let (k, v) = item?;
            if !k.starts_with(prefix) {
                break;
            }
            let id = String::from_utf8_lossy(&v).into_owned();
            if let Some(bytes) = snapshot.get(book_key(&id))? {
                books.push(bincode::deserialize::<Book>(&bytes)?);
            }
        }
        books.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(books)
    }

    fn scan_values<T: serde::de::DeserializeOwned>(&self, prefix: &[u8]) -> Result<Vec<T>> {
        let mut values = Vec::new();
        for item in self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward))
        {
            let (k, v) = item?;
            if !k.starts_with(prefix) {
                break;
            }
            values.push(bincode::deserialize(&v)?);
        }
        Ok(values)
    }

    /// Every book record (soft-deleted included), skipping index entries.
    fn scan_books(&self) -> Result<Vec<Book>> {
        let mut books = Vec::new();
        for item in self
            .db
            .iterator(IteratorMode::From(BOOK_PREFIX, Direction::Forward))
        {
            let (k, v) = item?;
            if !k.starts_with(BOOK_PREFIX) {
                break;
            }
            if is_index_key(&k) {
                continue;
            }
            books.push(bincode::deserialize::<Book>(&v)?);
        }
        Ok(books)
    }
}

impl Store for KvStore {
    // ── Books ────────────────────────────────────────────────────

    fn create_book(&self, book: &Book) -> Result<()> {
        validate_book(book)?;
        let _guard = self.lock_writes()?;
        if self.db.get(book_key(&book.id))?.is_some() {
            return Err(Error::Conflict(format!("book {} already exists", book.id)));
        }
        self.write_book(None, book)
    }

    fn get_book(&self, id: &str) -> Result<Book> {
        self.read_book(id)?.ok_or_else(|| book_not_found(id))
    }

    fn get_book_by_path(&self, path: &Path) -> Result<Option<Book>> {
        // Only UTF-8 paths are ever stored.
        let Some(text) = path.to_str() else {
            return Ok(None);
        };
        Ok(self
            .books_from_index(&path_index_prefix(text))?
            .into_iter()
            .next())
    }

    fn update_book(&self, book: &Book) -> Result<()> {
        validate_book(book)?;
        let _guard = self.lock_writes()?;
        let old = self.read_book(&book.id)?.ok_or_else(|| book_not_found(&book.id))?;
        self.write_book(Some(&old), book)
    }

    fn modify_book(
        &self,
        id: &str,
        change: &mut dyn FnMut(&mut Book) -> Result<()>,
    ) -> Result<Book> {
        let _guard = self.lock_writes()?;
        let current = self.read_book(id)?.ok_or_else(|| book_not_found(id))?;
        let next = apply_change(&current, change)?;
        self.write_book(Some(&current), &next)?;
        Ok(next)
    }

    fn list_books(&self) -> Result<Vec<Book>> {
        // Record keys are `book:{id}`, so iteration order is id order.
        let mut books: Vec<Book> = self
            .scan_books()?
            .into_iter()
            .filter(|b| !b.is_soft_deleted())
            .collect();
        books.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(books)
    }

    fn find_books_by_hash(&self, hash: &str) -> Result<Vec<Book>> {
        self.books_from_index(&hash_index_prefix(hash))
    }

    fn soft_delete_book(&self, id: &str) -> Result<()> {
        let _guard = self.lock_writes()?;
        let old = self.read_book(id)?.ok_or_else(|| book_not_found(id))?;
        let mut new = old.clone();
        new.state = BookState::SoftDeleted;
        new.updated_at = chrono::Utc::now();
        self.write_book(Some(&old), &new)
    }

    // ── Operations ───────────────────────────────────────────────

    fn create_operation(&self, op: &Operation) -> Result<()> {
        self.db
            .put(key(OPERATION_PREFIX, &op.id), bincode::serialize(op)?)?;
        Ok(())
    }

    fn get_operation(&self, id: &str) -> Result<Operation> {
        match self.db.get(key(OPERATION_PREFIX, id))? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Err(operation_not_found(id)),
        }
    }

    fn update_operation(&self, op: &Operation) -> Result<()> {
        let _guard = self.lock_writes()?;
        let k = key(OPERATION_PREFIX, &op.id);
        if self.db.get(&k)?.is_none() {
            return Err(operation_not_found(&op.id));
        }
        self.db.put(k, bincode::serialize(op)?)?;
        Ok(())
    }

    fn list_operations(&self) -> Result<Vec<Operation>> {
        let mut ops: Vec<Operation> = self.scan_values(OPERATION_PREFIX)?;
        ops.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(ops)
    }

    fn add_operation_log(&self, entry: &OperationLog) -> Result<()> {
        let nanos = entry.created_at.timestamp_nanos_opt().unwrap_or(0).max(0);
        let seq = self.log_seq.fetch_add(1, Ordering::Relaxed);
        let mut k = log_prefix(&entry.operation_id);
        k.extend_from_slice(format!("{:020}{:010}", nanos, seq).as_bytes());
        self.db.put(k, bincode::serialize(entry)?)?;
        Ok(())
    }

    fn get_operation_logs(&self, operation_id: &str) -> Result<Vec<OperationLog>> {
        self.scan_values(&log_prefix(operation_id))
    }

    // ── Blocklist ────────────────────────────────────────────────

    fn upsert_blocked_hash(&self, entry: &BlockedHash) -> Result<()> {
        self.db
            .put(key(BLOCKED_PREFIX, &entry.hash), bincode::serialize(entry)?)?;
        Ok(())
    }

    fn get_blocked_hash(&self, hash: &str) -> Result<Option<BlockedHash>> {
        match self.db.get(key(BLOCKED_PREFIX, hash))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn list_blocked_hashes(&self) -> Result<Vec<BlockedHash>> {
        self.scan_values(BLOCKED_PREFIX)
    }

    fn delete_blocked_hash(&self, hash: &str) -> Result<()> {
        let _guard = self.lock_writes()?;
        let k = key(BLOCKED_PREFIX, hash);
        if self.db.get(&k)?.is_none() {
            return Err(blocked_hash_not_found(hash));
        }
        self.db.delete(k)?;
        Ok(())
    }

    fn is_hash_blocked(&self, hash: &str) -> Result<bool> {
        Ok(self.db.get_pinned(key(BLOCKED_PREFIX, hash))?.is_some())
    }

    // ── Derived ──────────────────────────────────────────────────

    fn get_duplicate_books(&self) -> Result<Vec<DuplicateGroup>> {
        let mut buckets: BTreeMap<String, Vec<Book>> = BTreeMap::new();
        for book in self.scan_books()? {
            if book.is_soft_deleted() {
                continue;
            }
            if let Some(hash) = book.effective_hash() {
                buckets.entry(hash.to_string()).or_default().push(book);
            }
        }
        Ok(finalize_groups(buckets))
    }
}
