//! Store wrapper for tests that need to interfere with book writes.

use std::path::Path;

use audioshelf::storage::models::{
    BlockedHash, Book, DuplicateGroup, Operation, OperationLog,
};
use audioshelf::storage::{SqliteStore, Store};
use audioshelf::Result;

type BookHook = Box<dyn Fn(&mut Book) -> Result<()> + Send + Sync>;

/// Delegates to an in-memory [`SqliteStore`]. Every book write runs `hook`
/// after the caller's change, while the write is still uncommitted; an
/// error from the hook aborts the write.
pub struct HookedStore {
    inner: SqliteStore,
    hook: BookHook,
}

impl HookedStore {
    pub fn new(hook: impl Fn(&mut Book) -> Result<()> + Send + Sync + 'static) -> Self {
        Self {
            inner: SqliteStore::open_in_memory().unwrap(),
            hook: Box::new(hook),
        }
    }
}

impl Store for HookedStore {
    fn create_book(&self, book: &Book) -> Result<()> {
        self.inner.create_book(book)
    }

    fn get_book(&self, id: &str) -> Result<Book> {
        self.inner.get_book(id)
    }

    fn get_book_by_path(&self, path: &Path) -> Result<Option<Book>> {
        self.inner.get_book_by_path(path)
    }

    fn update_book(&self, book: &Book) -> Result<()> {
        let mut book = book.clone();
        (self.hook)(&mut book)?;
        self.inner.update_book(&book)
    }

    fn modify_book(
        &self,
        id: &str,
        change: &mut dyn FnMut(&mut Book) -> Result<()>,
    ) -> Result<Book> {
        self.inner.modify_book(id, &mut |book| {
            change(book)?;
            (self.hook)(book)
        })
    }

    fn list_books(&self) -> Result<Vec<Book>> {
        self.inner.list_books()
    }

    fn find_books_by_hash(&self, hash: &str) -> Result<Vec<Book>> {
        self.inner.find_books_by_hash(hash)
    }

    fn soft_delete_book(&self, id: &str) -> Result<()> {
        self.inner.soft_delete_book(id)
    }

    fn create_operation(&self, op: &Operation) -> Result<()> {
        self.inner.create_operation(op)
    }

    fn get_operation(&self, id: &str) -> Result<Operation> {
        self.inner.get_operation(id)
    }

    fn update_operation(&self, op: &Operation) -> Result<()> {
        self.inner.update_operation(op)
    }

    fn list_operations(&self) -> Result<Vec<Operation>> {
        self.inner.list_operations()
    }

    fn add_operation_log(&self, entry: &OperationLog) -> Result<()> {
        self.inner.add_operation_log(entry)
    }

    fn get_operation_logs(&self, operation_id: &str) -> Result<Vec<OperationLog>> {
        self.inner.get_operation_logs(operation_id)
    }

    fn upsert_blocked_hash(&self, entry: &BlockedHash) -> Result<()> {
        self.inner.upsert_blocked_hash(entry)
    }

    fn get_blocked_hash(&self, hash: &str) -> Result<Option<BlockedHash>> {
        self.inner.get_blocked_hash(hash)
    }

    fn list_blocked_hashes(&self) -> Result<Vec<BlockedHash>> {
        self.inner.list_blocked_hashes()
    }

    fn delete_blocked_hash(&self, hash: &str) -> Result<()> {
        self.inner.delete_blocked_hash(hash)
    }

    fn is_hash_blocked(&self, hash: &str) -> Result<bool> {
        self.inner.is_hash_blocked(hash)
    }

    fn get_duplicate_books(&self) -> Result<Vec<DuplicateGroup>> {
        self.inner.get_duplicate_books()
    }
}
