use dashmap::DashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{normalize, RelocationStrategy};
use crate::error::{Error, Result};
use crate::hasher::{FileHasher, Sha256Hasher};
use crate::storage::models::{Book, BookState};
use crate::storage::{path_str, Store};

/// Relocates book files with copy-verify-delete.
///
/// At every step either the source is intact or a verified destination
/// exists and is recorded. Bytes are written to a temporary file next to the
/// destination and only renamed into place (without overwriting) once
/// flushed; the destination is then re-hashed against the source before the
/// book record changes or the source is touched.
pub struct FileMutator {
    store: Arc<dyn Store>,
    hasher: Arc<dyn FileHasher>,
    destination_root: PathBuf,
    strategy: RelocationStrategy,
    in_flight: DashMap<PathBuf, ()>,
}

/// Holds a destination path for the duration of one relocation.
struct DestinationClaim<'a> {
    in_flight: &'a DashMap<PathBuf, ()>,
    path: PathBuf,
}

impl Drop for DestinationClaim<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.path);
    }
}

impl FileMutator {
    pub fn new(
        store: Arc<dyn Store>,
        destination_root: impl Into<PathBuf>,
        strategy: RelocationStrategy,
    ) -> Self {
        Self {
            store,
            hasher: Arc::new(Sha256Hasher),
            destination_root: normalize(&destination_root.into()),
            strategy,
            in_flight: DashMap::new(),
        }
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn FileHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn destination_root(&self) -> &Path {
        &self.destination_root
    }

    pub fn strategy(&self) -> RelocationStrategy {
        self.strategy
    }

    /// Move `book`'s file to `destination` and record it as organized.
    /// Returns the updated record.
    pub fn organize(&self, book: &Book, destination: &Path) -> Result<Book> {
        if book.is_soft_deleted() {
            return Err(Error::Validation(format!("book {} is soft-deleted", book.id)));
        }
        let destination = self.check_destination(destination)?;

        if book.state == BookState::Organized
            && book.organized_file_hash.is_some()
            && normalize(&book.file_path) == destination
        {
            debug!("Book {} already organized at {}", book.id, destination.display());
            return Ok(book.clone());
        }

        let _claim = self.claim(&destination)?;
        let source = book.file_path.clone();

        // 1. Source hash
        let source_hash = self.hasher.hash_file(&source)?;

        if normalize(&source) == destination {
            // Already at its canonical location; only the record changes.
            return self.commit_record(book, &source, destination, source_hash);
        }

        // 2. Place the bytes
        if destination.exists() {
            return Err(Error::Conflict(format!(
                "destination already exists: {}",
                destination.display()
            )));
        }
        let parent = destination.parent().ok_or_else(|| {
            Error::Validation(format!("destination has no parent: {}", destination.display()))
        })?;
        fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;
        self.place(&source, &destination, parent)?;

        // 3-4. Verify, rolling back on any failure
        match self.hasher.hash_file(&destination) {
            Ok(dest_hash) if dest_hash == source_hash => {}
            Ok(dest_hash) => {
                discard(&destination);
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "checksum mismatch for {}: source {} destination {}",
                        destination.display(),
                        source_hash,
                        dest_hash
                    ),
                )));
            }
            Err(e) => {
                discard(&destination);
                return Err(e);
            }
        }

        // 5. Record, then dispose of the source
        let updated = match self.commit_record(book, &source, destination.clone(), source_hash) {
            Ok(updated) => updated,
            Err(e) => {
                discard(&destination);
                return Err(e);
            }
        };

        if self.strategy == RelocationStrategy::Move {
            if let Err(e) = fs::remove_file(&source) {
                warn!(
                    "Relocated {} but failed to remove source {}: {}",
                    book.id,
                    source.display(),
                    e
                );
            }
        }

        info!(
            "Organized {} -> {} ({:?})",
            source.display(),
            destination.display(),
            self.strategy
        );
        Ok(updated)
    }

    /// Destinations must sit strictly inside the destination root.
    fn check_destination(&self, destination: &Path) -> Result<PathBuf> {
        path_str(destination)?;
        if destination
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(Error::Validation(format!(
                "destination must not contain '..': {}",
                destination.display()
            )));
        }
        let normalized = normalize(destination);
        if normalized == self.destination_root || !normalized.starts_with(&self.destination_root)
        {
            return Err(Error::Validation(format!(
                "destination {} is outside {}",
                destination.display(),
                self.destination_root.display()
            )));
        }
        Ok(normalized)
    }

    fn claim(&self, destination: &Path) -> Result<DestinationClaim<'_>> {
        match self.in_flight.entry(destination.to_path_buf()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::Conflict(format!(
                "another relocation is writing {}",
                destination.display()
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                Ok(DestinationClaim {
                    in_flight: &self.in_flight,
                    path: destination.to_path_buf(),
                })
            }
        }
    }

    fn place(&self, source: &Path, destination: &Path, parent: &Path) -> Result<()> {
        if self.strategy == RelocationStrategy::Hardlink {
            match fs::hard_link(source, destination) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    return Err(Error::Conflict(format!(
                        "destination already exists: {}",
                        destination.display()
                    )));
                }
                Err(e) => debug!(
                    "Hard link {} -> {} failed ({}), copying instead",
                    source.display(),
                    destination.display(),
                    e
                ),
            }
        }
        copy_via_temp(source, destination, parent)
    }

    fn commit_record(
        &self,
        book: &Book,
        source: &Path,
        destination: PathBuf,
        hash: String,
    ) -> Result<Book> {
        self.store.modify_book(&book.id, &mut |current| {
            if current.is_soft_deleted() {
                return Err(Error::Conflict(format!(
                    "book {} was deleted during relocation",
                    current.id
                )));
            }
            if current.file_path != source {
                return Err(Error::Conflict(format!(
                    "book {} moved to {} during relocation",
                    current.id,
                    current.file_path.display()
                )));
            }
            current.mark_organized(destination.clone(), hash.clone());
            Ok(())
        })
    }
}

/// Stream `source` into a temp file beside `destination`, flush it to disk, then
/// link it into place. Fails with a conflict if `destination` appeared meanwhile.
fn copy_via_temp(source: &Path, destination: &Path, parent: &Path) -> Result<()> {
    let mut reader = BufReader::new(File::open(source).map_err(|e| Error::io_at(source, e))?);
    let temp = tempfile::Builder::new()
        .prefix(".audioshelf-")
        .suffix(".part")
        .tempfile_in(parent)
        .map_err(|e| Error::io_at(parent, e))?;

    {
        let mut writer = BufWriter::new(temp.as_file());
        io::copy(&mut reader, &mut writer).map_err(|e| Error::io_at(temp.path(), e))?;
        writer.flush().map_err(|e| Error::io_at(temp.path(), e))?;
    }
    temp.as_file()
        .sync_all()
        .map_err(|e| Error::io_at(temp.path(), e))?;

    match temp.persist_noclobber(destination) {
        Ok(_) => Ok(()),
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Err(Error::Conflict(format!(
            "destination already exists: {}",
            destination.display()
        ))),
        Err(e) => Err(Error::io_at(destination, e.error)),
    }
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!("Rollback could not remove {}: {}", path.display(), e);
    }
}
