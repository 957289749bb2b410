//! Content-hash admission control: the blocklist and duplicate grouping.

use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::hasher::{self, validate_hash};
use crate::storage::models::{BlockedHash, DuplicateGroup};
use crate::storage::Store;

/// Outcome of checking a content hash against the library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admit,
    Blocked { reason: String },
    Duplicate { existing_id: String },
}

#[derive(Clone)]
pub struct DedupEngine {
    store: Arc<dyn Store>,
}

impl DedupEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn compute_file_hash(&self, path: &Path) -> Result<String> {
        hasher::compute_file_hash(path)
    }

    pub fn is_hash_blocked(&self, hash: &str) -> Result<bool> {
        validate_hash(hash)?;
        self.store.is_hash_blocked(hash)
    }

    /// Validate, then insert or replace the blocklist entry for `hash`.
    pub fn add_blocked_hash(&self, hash: &str, reason: &str) -> Result<()> {
        validate_hash(hash)?;
        if reason.trim().is_empty() {
            return Err(Error::Validation("reason must not be empty".to_string()));
        }
        self.store.upsert_blocked_hash(&BlockedHash {
            hash: hash.to_string(),
            reason: reason.to_string(),
            created_at: Utc::now(),
        })?;
        info!("Blocked hash {} ({})", hash, reason);
        Ok(())
    }

    pub fn remove_blocked_hash(&self, hash: &str) -> Result<()> {
        validate_hash(hash)?;
        self.store.delete_blocked_hash(hash)?;
        info!("Unblocked hash {}", hash);
        Ok(())
    }

    pub fn blocked_hashes(&self) -> Result<Vec<BlockedHash>> {
        self.store.list_blocked_hashes()
    }

    pub fn get_duplicate_books(&self) -> Result<Vec<DuplicateGroup>> {
        let groups = self.store.get_duplicate_books()?;
        debug!("{} duplicate groups", groups.len());
        Ok(groups)
    }

    /// Blocked hashes are refused first; otherwise an existing live book with
    /// the same effective hash makes this a duplicate.
    pub fn check_admission(&self, hash: &str) -> Result<Admission> {
        validate_hash(hash)?;
        if let Some(entry) = self.store.get_blocked_hash(hash)? {
            return Ok(Admission::Blocked {
                reason: entry.reason,
            });
        }
        if let Some(existing) = self.store.find_books_by_hash(hash)?.into_iter().next() {
            return Ok(Admission::Duplicate {
                existing_id: existing.id,
            });
        }
        Ok(Admission::Admit)
    }
}
