use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
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

const BOOK_COLUMNS: &str = "id, title, author, file_path, file_size, original_file_hash, \
                            organized_file_hash, state, created_at, updated_at";

const SCHEMA_VERSION: i64 = 2;

const OPERATION_COLUMNS: &str =
    "id, op_type, priority, status, progress, total, message, created_at, updated_at";

/// Relational backend. A single connection guarded by a mutex: every call runs
/// to completion (inside a transaction when it touches several rows) before the
/// next one starts.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = SqliteStore {
            conn: Mutex::new(conn),
        };
        store.configure_pragmas()?;
        store.migrate_schema()?;
        debug!("Opened SQLite store at {}", path.display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = SqliteStore {
            conn: Mutex::new(conn),
        };
        store.configure_pragmas()?;
        store.migrate_schema()?;
        Ok(store)
    }

    fn configure_pragmas(&self) -> Result<()> {
        self.connection()?.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        debug!("SQLite pragmas configured (WAL mode)");
        Ok(())
    }

    fn migrate_schema(&self) -> Result<()> {
        let conn = self.connection()?;
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version < SCHEMA_VERSION {
            debug!("Schema version {} < {}, migrating", version, SCHEMA_VERSION);
        }
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(())
    }

    pub fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("SQLite connection lock poisoned".to_string()))
    }
}

// ── Row mapping ──────────────────────────────────────────────────

fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp '{}': {}", raw, e)))
}

fn parse_text<T: std::str::FromStr<Err = Error>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion_error(idx, e.to_string()))
}

fn book_from_row(row: &Row<'_>) -> rusqlite::Result<Book> {
    Ok(Book {
        id: row.get(0)?,
        title: row.get(1)?,
        author: row.get(2)?,
        file_path: PathBuf::from(row.get::<_, String>(3)?),
        file_size: row.get::<_, i64>(4)? as u64,
        original_file_hash: row.get(5)?,
        organized_file_hash: row.get(6)?,
        state: parse_text::<BookState>(row, 7)?,
        created_at: parse_ts(row, 8)?,
        updated_at: parse_ts(row, 9)?,
    })
}

fn operation_from_row(row: &Row<'_>) -> rusqlite::Result<Operation> {
    Ok(Operation {
        id: row.get(0)?,
        op_type: row.get(1)?,
        priority: row.get(2)?,
        status: parse_text(row, 3)?,
        progress: row.get::<_, i64>(4)? as u64,
        total: row.get::<_, i64>(5)? as u64,
        message: row.get(6)?,
        created_at: parse_ts(row, 7)?,
        updated_at: parse_ts(row, 8)?,
    })
}

fn blocked_from_row(row: &Row<'_>) -> rusqlite::Result<BlockedHash> {
    Ok(BlockedHash {
        hash: row.get(0)?,
        reason: row.get(1)?,
        created_at: parse_ts(row, 2)?,
    })
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<OperationLog> {
    Ok(OperationLog {
        operation_id: row.get(0)?,
        level: parse_text(row, 1)?,
        message: row.get(2)?,
        created_at: parse_ts(row, 3)?,
    })
}

fn select_book(conn: &Connection, id: &str) -> Result<Option<Book>> {
    let book = conn
        .query_row(
            &format!("SELECT {} FROM books WHERE id = ?1", BOOK_COLUMNS),
            params![id],
            book_from_row,
        )
        .optional()?;
    Ok(book)
}

/// Overwrite every column of an existing row. Returns the number of rows changed.
fn update_book_row(conn: &Connection, book: &Book) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE books SET title = ?2, author = ?3, file_path = ?4, file_size = ?5, \
         original_file_hash = ?6, organized_file_hash = ?7, state = ?8, \
         created_at = ?9, updated_at = ?10 WHERE id = ?1",
        params![
            book.id,
            book.title,
            book.author,
            path_str(&book.file_path)?,
            book.file_size as i64,
            book.original_file_hash,
            book.organized_file_hash,
            book.state.as_str(),
            ts(&book.created_at),
            ts(&book.updated_at),
        ],
    )?;
    Ok(changed)
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation)
}

impl Store for SqliteStore {
    // ── Books ────────────────────────────────────────────────────

    fn create_book(&self, book: &Book) -> Result<()> {
        validate_book(book)?;
        let conn = self.connection()?;
        let inserted = conn.execute(
            "INSERT INTO books (id, title, author, file_path, file_size, original_file_hash, \
             organized_file_hash, state, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                book.id,
                book.title,
                book.author,
                path_str(&book.file_path)?,
                book.file_size as i64,
                book.original_file_hash,
                book.organized_file_hash,
                book.state.as_str(),
                ts(&book.created_at),
                ts(&book.updated_at),
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => {
                Err(Error::Conflict(format!("book {} already exists", book.id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get_book(&self, id: &str) -> Result<Book> {
        let conn = self.connection()?;
        select_book(&conn, id)?.ok_or_else(|| book_not_found(id))
    }

    fn get_book_by_path(&self, path: &Path) -> Result<Option<Book>> {
        // Only UTF-8 paths are ever stored.
        let Some(text) = path.to_str() else {
            return Ok(None);
        };
        let conn = self.connection()?;
        let book = conn
            .query_row(
                &format!(
                    "SELECT {} FROM books WHERE file_path = ?1 AND state != 'soft_deleted' \
                     ORDER BY id LIMIT 1",
                    BOOK_COLUMNS
                ),
                params![text],
                book_from_row,
            )
            .optional()?;
        Ok(book)
    }

    fn update_book(&self, book: &Book) -> Result<()> {
        validate_book(book)?;
        let conn = self.connection()?;
        if update_book_row(&conn, book)? == 0 {
            return Err(book_not_found(&book.id));
        }
        Ok(())
    }

    fn modify_book(
        &self,
        id: &str,
        change: &mut dyn FnMut(&mut Book) -> Result<()>,
    ) -> Result<Book> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = select_book(&tx, id)?.ok_or_else(|| book_not_found(id))?;
        let next = apply_change(&current, change)?;
        update_book_row(&tx, &next)?;
        tx.commit()?;
        Ok(next)
    }

    fn list_books(&self) -> Result<Vec<Book>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM books WHERE state != 'soft_deleted' ORDER BY id",
            BOOK_COLUMNS
        ))?;
        let books = stmt
            .query_map([], book_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(books)
    }

    fn find_books_by_hash(&self, hash: &str) -> Result<Vec<Book>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM books \
             WHERE COALESCE(organized_file_hash, original_file_hash) = ?1 \
               AND state != 'soft_deleted' \
             ORDER BY id",
            BOOK_COLUMNS
        ))?;
        let books = stmt
            .query_map(params![hash], book_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(books)
    }

    fn soft_delete_book(&self, id: &str) -> Result<()> {
        let conn = self.connection()?;
        let changed = conn.execute(
            "UPDATE books SET state = 'soft_deleted', updated_at = ?2 WHERE id = ?1",
            params![id, ts(&Utc::now())],
        )?;
        if changed == 0 {
            return Err(book_not_found(id));
        }
        Ok(())
    }

    // ── Operations ───────────────────────────────────────────────

    fn create_operation(&self, op: &Operation) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT OR REPLACE INTO operations \
             (id, op_type, priority, status, progress, total, message, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                op.id,
                op.op_type,
                op.priority,
                op.status.as_str(),
                op.progress as i64,
                op.total as i64,
                op.message,
                ts(&op.created_at),
                ts(&op.updated_at),
            ],
        )?;
        Ok(())
    }

    fn get_operation(&self, id: &str) -> Result<Operation> {
        let conn = self.connection()?;
        conn.query_row(
            &format!("SELECT {} FROM operations WHERE id = ?1", OPERATION_COLUMNS),
            params![id],
            operation_from_row,
        )
        .optional()?
        .ok_or_else(|| operation_not_found(id))
    }

    fn update_operation(&self, op: &Operation) -> Result<()> {
        let conn = self.connection()?;
        let changed = conn.execute(
            "UPDATE operations SET op_type = ?2, priority = ?3, status = ?4, progress = ?5, \
             total = ?6, message = ?7, created_at = ?8, updated_at = ?9 WHERE id = ?1",
            params![
                op.id,
                op.op_type,
                op.priority,
                op.status.as_str(),
                op.progress as i64,
                op.total as i64,
                op.message,
                ts(&op.created_at),
                ts(&op.updated_at),
            ],
        )?;
        if changed == 0 {
            return Err(operation_not_found(&op.id));
        }
        Ok(())
    }

    fn list_operations(&self) -> Result<Vec<Operation>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM operations ORDER BY created_at DESC, id DESC",
            OPERATION_COLUMNS
        ))?;
        let ops = stmt
            .query_map([], operation_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ops)
    }

    fn add_operation_log(&self, entry: &OperationLog) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO operation_logs (operation_id, level, message, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.operation_id,
                entry.level.as_str(),
                entry.message,
                ts(&entry.created_at),
            ],
        )?;
        Ok(())
    }

    fn get_operation_logs(&self, operation_id: &str) -> Result<Vec<OperationLog>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT operation_id, level, message, created_at FROM operation_logs \
             WHERE operation_id = ?1 ORDER BY seq",
        )?;
        let entries = stmt
            .query_map(params![operation_id], log_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    // ── Blocklist ────────────────────────────────────────────────

    fn upsert_blocked_hash(&self, entry: &BlockedHash) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO blocked_hashes (hash, reason, created_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(hash) DO UPDATE SET reason = excluded.reason, \
                 created_at = excluded.created_at",
            params![entry.hash, entry.reason, ts(&entry.created_at)],
        )?;
        Ok(())
    }

    fn get_blocked_hash(&self, hash: &str) -> Result<Option<BlockedHash>> {
        let conn = self.connection()?;
        let entry = conn
            .query_row(
                "SELECT hash, reason, created_at FROM blocked_hashes WHERE hash = ?1",
                params![hash],
                blocked_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    fn list_blocked_hashes(&self) -> Result<Vec<BlockedHash>> {
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare("SELECT hash, reason, created_at FROM blocked_hashes ORDER BY hash")?;
        let entries = stmt
            .query_map([], blocked_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn delete_blocked_hash(&self, hash: &str) -> Result<()> {
        let conn = self.connection()?;
        let changed = conn.execute("DELETE FROM blocked_hashes WHERE hash = ?1", params![hash])?;
        if changed == 0 {
            return Err(blocked_hash_not_found(hash));
        }
        Ok(())
    }

    fn is_hash_blocked(&self, hash: &str) -> Result<bool> {
        let conn = self.connection()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM blocked_hashes WHERE hash = ?1)",
            params![hash],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    // ── Derived ──────────────────────────────────────────────────

    fn get_duplicate_books(&self) -> Result<Vec<DuplicateGroup>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {}, COALESCE(organized_file_hash, original_file_hash) AS effective_hash \
             FROM books \
             WHERE state != 'soft_deleted' \
               AND COALESCE(organized_file_hash, original_file_hash) IN ( \
                   SELECT COALESCE(organized_file_hash, original_file_hash) \
                   FROM books \
                   WHERE state != 'soft_deleted' \
                     AND COALESCE(organized_file_hash, original_file_hash) IS NOT NULL \
                   GROUP BY COALESCE(organized_file_hash, original_file_hash) \
                   HAVING COUNT(*) >= 2) \
             ORDER BY effective_hash, file_path, id",
            BOOK_COLUMNS
        ))?;

        let mut buckets: Vec<(String, Vec<Book>)> = Vec::new();
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(10)?, book_from_row(row)?)))?;
        for row in rows {
            let (hash, book) = row?;
            match buckets.last_mut() {
                Some((current, books)) if *current == hash => books.push(book),
                _ => buckets.push((hash, vec![book])),
            }
        }
        Ok(finalize_groups(buckets))
    }
}
