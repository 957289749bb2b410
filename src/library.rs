use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::dedup::DedupEngine;
use crate::error::{Error, Result};
use crate::fileops::FileMutator;
use crate::jobs::{self, ImportJob, OrganizeJob};
use crate::notifier::ProgressNotifier;
use crate::queue::{OperationQueue, ShutdownReport};
use crate::storage::models::Book;
use crate::storage::{open_store, Store};

/// One library instance: store, dedup engine, mutator, notifier and queue
/// wired from a single [`AppConfig`]. Construct once and share by reference.
pub struct Library {
    config: AppConfig,
    store: Arc<dyn Store>,
    dedup: DedupEngine,
    mutator: Arc<FileMutator>,
    queue: OperationQueue,
}

impl Library {
    pub fn open(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let store = open_store(&config)?;
        Self::with_store(config, store)
    }

    pub fn with_store(config: AppConfig, store: Arc<dyn Store>) -> Result<Self> {
        config.validate()?;
        let notifier = ProgressNotifier::new(config.notifier_buffer);
        let mutator = Arc::new(FileMutator::new(
            Arc::clone(&store),
            &config.destination_root,
            config.relocation_strategy,
        ));
        let queue = OperationQueue::new(Arc::clone(&store), notifier, config.workers);
        info!(
            "Library opened: {:?} backend at {}",
            config.storage_backend,
            config.database_path.display()
        );

        Ok(Self {
            dedup: DedupEngine::new(Arc::clone(&store)),
            config,
            store,
            mutator,
            queue,
        })
    }

    /// Enqueue an import of the source root. Returns the operation id.
    pub fn start_import(&self, priority: i32) -> Result<String> {
        let id = format!("{}-{}", jobs::IMPORT, Uuid::now_v7());
        let job = ImportJob::from_config(&self.config, Arc::clone(&self.store));
        self.queue.enqueue(&id, jobs::IMPORT, priority, move |ctx| {
            let summary = job.run(ctx)?;
            info!("Import {} done: {:?}", ctx.operation_id(), summary);
            Ok(())
        })?;
        Ok(id)
    }

    /// Enqueue relocation of every imported book. Returns the operation id.
    pub fn start_organize(&self, priority: i32) -> Result<String> {
        let id = format!("{}-{}", jobs::ORGANIZE, Uuid::now_v7());
        let job = OrganizeJob::new(Arc::clone(&self.store), Arc::clone(&self.mutator));
        self.queue.enqueue(&id, jobs::ORGANIZE, priority, move |ctx| {
            let summary = job.run(ctx)?;
            info!("Organize {} done: {:?}", ctx.operation_id(), summary);
            Ok(())
        })?;
        Ok(id)
    }

    /// Change title and/or author. `author: Some(None)` clears the author.
    pub fn update_book_metadata(
        &self,
        id: &str,
        title: Option<&str>,
        author: Option<Option<&str>>,
    ) -> Result<Book> {
        if title.is_some_and(|t| t.trim().is_empty()) {
            return Err(Error::Validation("title must not be empty".into()));
        }
        // Applied to the stored record as one step, so a relocation committed
        // concurrently is never overwritten.
        self.store.modify_book(id, &mut |book| {
            if book.is_soft_deleted() {
                return Err(Error::Validation(format!("book {} is soft-deleted", id)));
            }
            if let Some(title) = title {
                book.title = title.to_string();
            }
            if let Some(author) = author {
                book.author = author.map(str::to_string);
            }
            book.updated_at = Utc::now();
            Ok(())
        })
    }

    /// Drain the queue using the configured shutdown timeout.
    pub fn shutdown(&self) -> ShutdownReport {
        self.queue.shutdown(self.config.shutdown_timeout())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn dedup(&self) -> &DedupEngine {
        &self.dedup
    }

    pub fn mutator(&self) -> &FileMutator {
        &self.mutator
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    pub fn notifier(&self) -> &ProgressNotifier {
        self.queue.notifier()
    }
}
