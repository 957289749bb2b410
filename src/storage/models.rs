use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::Error;

/// Lifecycle of a tracked book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookState {
    Wanted,
    Imported,
    Organized,
    SoftDeleted,
}

impl BookState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookState::Wanted => "wanted",
            BookState::Imported => "imported",
            BookState::Organized => "organized",
            BookState::SoftDeleted => "soft_deleted",
        }
    }
}

impl fmt::Display for BookState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wanted" => Ok(BookState::Wanted),
            "imported" => Ok(BookState::Imported),
            "organized" => Ok(BookState::Organized),
            "soft_deleted" => Ok(BookState::SoftDeleted),
            other => Err(Error::Storage(format!("unknown book state '{}'", other))),
        }
    }
}

/// A tracked media item.
///
/// `organized_file_hash` is only ever written by a successful relocation
/// (see [`Book::mark_organized`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    pub file_path: PathBuf,
    pub file_size: u64,
    pub original_file_hash: Option<String>,
    pub organized_file_hash: Option<String>,
    pub state: BookState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Book {
    /// A freshly imported book. Ids are UUIDv7, so they sort by creation time.
    pub fn new_imported(
        title: impl Into<String>,
        author: Option<String>,
        file_path: impl Into<PathBuf>,
        file_size: u64,
        original_file_hash: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            title: title.into(),
            author,
            file_path: file_path.into(),
            file_size,
            original_file_hash: Some(original_file_hash.into()),
            organized_file_hash: None,
            state: BookState::Imported,
            created_at: now,
            updated_at: now,
        }
    }

    /// `organized_file_hash` if set, else `original_file_hash`.
    pub fn effective_hash(&self) -> Option<&str> {
        self.organized_file_hash
            .as_deref()
            .or(self.original_file_hash.as_deref())
    }

    pub fn is_soft_deleted(&self) -> bool {
        self.state == BookState::SoftDeleted
    }

    pub(crate) fn mark_organized(&mut self, path: PathBuf, hash: String) {
        self.file_path = path;
        self.organized_file_hash = Some(hash);
        self.state = BookState::Organized;
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Queued => "queued",
            OperationStatus::Running => "running",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Canceled
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(OperationStatus::Queued),
            "running" => Ok(OperationStatus::Running),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            "canceled" => Ok(OperationStatus::Canceled),
            other => Err(Error::Storage(format!(
                "unknown operation status '{}'",
                other
            ))),
        }
    }
}

/// Persisted record of one queued or finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub op_type: String,
    pub priority: i32,
    pub status: OperationStatus,
    pub progress: u64,
    pub total: u64,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    pub fn queued(id: impl Into<String>, op_type: impl Into<String>, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            op_type: op_type.into(),
            priority,
            status: OperationStatus::Queued,
            progress: 0,
            total: 0,
            message: "operation queued".to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Severity of an operation log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(Error::Storage(format!("unknown log level '{}'", other))),
        }
    }
}

/// One line of an operation's log trail, written by the job while it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationLog {
    pub operation_id: String,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl OperationLog {
    pub fn new(operation_id: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            level,
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

/// A content hash barred from import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedHash {
    pub hash: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Two or more live books sharing an effective hash. Derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    pub hash: String,
    pub books: Vec<Book>,
}

/// Sort members by path (id breaks ties) and groups by hash, dropping singletons.
pub(crate) fn finalize_groups(
    buckets: impl IntoIterator<Item = (String, Vec<Book>)>,
) -> Vec<DuplicateGroup> {
    let mut groups: Vec<DuplicateGroup> = buckets
        .into_iter()
        .filter(|(_, books)| books.len() >= 2)
        .map(|(hash, mut books)| {
            books.sort_by(|a, b| a.file_path.cmp(&b.file_path).then_with(|| a.id.cmp(&b.id)));
            DuplicateGroup { hash, books }
        })
        .collect();
    groups.sort_by(|a, b| a.hash.cmp(&b.hash));
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_hash_prefers_organized() {
        let mut book = Book::new_imported("Dune", None, "/in/dune.m4b", 10, "a".repeat(64));
        assert_eq!(book.effective_hash(), Some("a".repeat(64).as_str()));

        book.mark_organized(PathBuf::from("/out/dune.m4b"), "b".repeat(64));
        assert_eq!(book.effective_hash(), Some("b".repeat(64).as_str()));
        assert_eq!(book.state, BookState::Organized);
    }

    #[test]
    fn test_status_round_trip_and_terminality() {
        for status in [
            OperationStatus::Queued,
            OperationStatus::Running,
            OperationStatus::Completed,
            OperationStatus::Failed,
            OperationStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<OperationStatus>().unwrap(), status);
        }
        assert!(!OperationStatus::Queued.is_terminal());
        assert!(!OperationStatus::Running.is_terminal());
        assert!(OperationStatus::Canceled.is_terminal());
        for level in [LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
            assert_eq!(level.as_str().parse::<LogLevel>().unwrap(), level);
        }
    }

    #[test]
    fn test_book_ids_sort_by_creation() {
        let a = Book::new_imported("a", None, "/a", 1, "0".repeat(64));
        let b = Book::new_imported("b", None, "/b", 1, "0".repeat(64));
        assert!(a.id < b.id);
    }

    #[test]
    fn test_finalize_groups_drops_singletons_and_orders() {
        let mut x = Book::new_imported("x", None, "/z/x", 1, "h2");
        x.id = "1".into();
        let mut y = Book::new_imported("y", None, "/a/y", 1, "h2");
        y.id = "2".into();
        let mut z = Book::new_imported("z", None, "/m/z", 1, "h1");
        z.id = "3".into();

        let groups = finalize_groups(vec![
            ("h2".to_string(), vec![x, y]),
            ("h1".to_string(), vec![z]),
        ]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].hash, "h2");
        assert_eq!(groups[0].books[0].file_path, PathBuf::from("/a/y"));
    }
}
