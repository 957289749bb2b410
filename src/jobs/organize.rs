use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::error::Result;
use crate::fileops::{destination_for, FileMutator};
use crate::queue::JobContext;
use crate::storage::models::{BookState, LogLevel};
use crate::storage::Store;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrganizeSummary {
    pub organized: u64,
    pub failed: u64,
}

/// Relocates every `imported` book into the destination layout.
pub struct OrganizeJob {
    store: Arc<dyn Store>,
    mutator: Arc<FileMutator>,
}

impl OrganizeJob {
    pub fn new(store: Arc<dyn Store>, mutator: Arc<FileMutator>) -> Self {
        Self { store, mutator }
    }

    /// Per-book failures are logged and counted. The job itself fails only
    /// when every attempted relocation failed, with the last error.
    pub fn run(&self, ctx: &JobContext) -> Result<OrganizeSummary> {
        let books: Vec<_> = self
            .store
            .list_books()?
            .into_iter()
            .filter(|b| b.state == BookState::Imported)
            .collect();
        let total = books.len() as u64;
        ctx.report(0, total, format!("organizing {} books", total));

        let mut summary = OrganizeSummary::default();
        let mut last_error = None;
        for (n, book) in books.iter().enumerate() {
            ctx.check_cancelled()?;
            let destination = destination_for(book, self.mutator.destination_root());
            match self.mutator.organize(book, &destination) {
                Ok(_) => summary.organized += 1,
                Err(e) => {
                    ctx.log(
                        LogLevel::Error,
                        format!(
                            "failed to organize {} ({}): {}",
                            book.id,
                            book.file_path.display(),
                            e
                        ),
                    );
                    summary.failed += 1;
                    last_error = Some(e);
                }
            }
            ctx.report(n as u64 + 1, total, format!("organized {}", book.title));
        }

        info!(
            "Organize finished: {} organized, {} failed",
            summary.organized, summary.failed
        );
        match last_error {
            Some(e) if summary.organized == 0 => Err(e),
            _ => Ok(summary),
        }
    }
}
