use glob::Pattern;
use rayon::prelude::*;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::config::AppConfig;
use crate::dedup::{Admission, DedupEngine};
use crate::error::{Error, Result};
use crate::queue::JobContext;
use crate::storage::models::{Book, LogLevel};
use crate::storage::Store;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub discovered: u64,
    pub imported: u64,
    pub already_tracked: u64,
    pub duplicates: u64,
    pub blocked: u64,
    pub failed: u64,
}

/// Walks the source root and records every admissible audio file as an
/// `imported` book.
pub struct ImportJob {
    source_root: PathBuf,
    ignore_patterns: Vec<Pattern>,
    extensions: Vec<String>,
    store: Arc<dyn Store>,
    dedup: DedupEngine,
}

impl ImportJob {
    pub fn new(
        source_root: impl Into<PathBuf>,
        ignore_globs: &[String],
        extensions: &[String],
        store: Arc<dyn Store>,
    ) -> Self {
        let ignore_patterns = ignore_globs
            .iter()
            .filter_map(|glob| match Pattern::new(glob) {
                Ok(p) => Some(p),
                Err(e) => {
                    error!("Invalid glob pattern '{}': {}", glob, e);
                    None
                }
            })
            .collect();

        Self {
            source_root: source_root.into(),
            ignore_patterns,
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            dedup: DedupEngine::new(Arc::clone(&store)),
            store,
        }
    }

    pub fn from_config(config: &AppConfig, store: Arc<dyn Store>) -> Self {
        Self::new(
            &config.source_root,
            &config.ignore_patterns,
            &config.extensions,
            store,
        )
    }

    /// Candidate files under the source root, sorted by path. Symlinks,
    /// empty files, ignored paths, unknown extensions and paths that are not
    /// valid UTF-8 are skipped.
    pub fn discover(&self) -> Result<Vec<(PathBuf, u64)>> {
        if !self.source_root.is_dir() {
            return Err(Error::Validation(format!(
                "source root is not a directory: {}",
                self.source_root.display()
            )));
        }

        let mut found = Vec::new();
        let walker = WalkDir::new(&self.source_root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| !self.is_ignored(entry.path()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    error!("Error walking {}: {}", self.source_root.display(), err);
                    continue;
                }
            };
            if !entry.file_type().is_file() || !self.has_wanted_extension(&entry) {
                continue;
            }
            if entry.path().to_str().is_none() {
                warn!("Skipping non UTF-8 path {}", entry.path().display());
                continue;
            }
            match entry.metadata() {
                Ok(meta) if meta.len() > 0 => found.push((entry.into_path(), meta.len())),
                Ok(_) => debug!("Skipping empty file {}", entry.path().display()),
                Err(err) => error!("Error reading metadata for {}: {}", entry.path().display(), err),
            }
        }

        found.sort();
        Ok(found)
    }

    pub fn run(&self, ctx: &JobContext) -> Result<ImportSummary> {
        let discovered = self.discover()?;
        let mut summary = ImportSummary {
            discovered: discovered.len() as u64,
            ..ImportSummary::default()
        };

        let mut candidates = Vec::with_capacity(discovered.len());
        for (path, size) in discovered {
            if self.store.get_book_by_path(&path)?.is_some() {
                summary.already_tracked += 1;
            } else {
                candidates.push((path, size));
            }
        }

        let total = candidates.len() as u64;
        ctx.report(0, total, format!("hashing {} files", total));
        info!(
            "Importing from {}: {} new files, {} already tracked",
            self.source_root.display(),
            total,
            summary.already_tracked
        );

        // Hash in parallel; every worker checks for cancellation before each file.
        let hashed_count = AtomicU64::new(0);
        let hashed = candidates
            .par_iter()
            .map(|(path, size)| {
                ctx.check_cancelled()?;
                let hash = self.dedup.compute_file_hash(path);
                let done = hashed_count.fetch_add(1, Ordering::SeqCst) + 1;
                ctx.report(done, total, format!("hashed {}", path.display()));
                Ok((path, *size, hash))
            })
            .collect::<Result<Vec<_>>>()?;

        // Admit sequentially so identical files within one batch are caught.
        for (path, size, hash) in hashed {
            ctx.check_cancelled()?;
            let hash = match hash {
                Ok(hash) => hash,
                Err(e) => {
                    ctx.log(
                        LogLevel::Error,
                        format!("could not hash {}: {}", path.display(), e),
                    );
                    summary.failed += 1;
                    continue;
                }
            };

            match self.dedup.check_admission(&hash)? {
                Admission::Admit => {
                    let (title, author) = self.describe(path);
                    let book = Book::new_imported(title, author, path.clone(), size, hash);
                    self.store.create_book(&book)?;
                    debug!("Imported {} as {}", path.display(), book.id);
                    summary.imported += 1;
                }
                Admission::Duplicate { existing_id } => {
                    ctx.log(
                        LogLevel::Info,
                        format!("skipped {}: duplicate of {}", path.display(), existing_id),
                    );
                    summary.duplicates += 1;
                }
                Admission::Blocked { reason } => {
                    ctx.log(
                        LogLevel::Warn,
                        format!("skipped {}: blocked ({})", path.display(), reason),
                    );
                    summary.blocked += 1;
                }
            }
        }

        ctx.report(
            total,
            total,
            format!(
                "imported {}, {} duplicates, {} blocked, {} failed",
                summary.imported, summary.duplicates, summary.blocked, summary.failed
            ),
        );
        Ok(summary)
    }

    fn is_ignored(&self, path: &Path) -> bool {
        self.ignore_patterns.iter().any(|p| p.matches_path(path))
    }

    fn has_wanted_extension(&self, entry: &DirEntry) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        entry
            .path()
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .is_some_and(|ext| self.extensions.contains(&ext))
    }

    /// Title from the file stem; author from the first directory below the
    /// source root, when there is one.
    fn describe(&self, path: &Path) -> (String, Option<String>) {
        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let author = path
            .strip_prefix(&self.source_root)
            .ok()
            .filter(|rel| rel.components().count() > 1)
            .and_then(|rel| rel.components().next())
            .map(|c| c.as_os_str().to_string_lossy().into_owned());
        (title, author)
    }
}
