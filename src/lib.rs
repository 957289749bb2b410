pub mod config;
pub mod dedup;
pub mod error;
pub mod fileops;
pub mod hasher;
pub mod jobs;
pub mod library;
pub mod notifier;
pub mod queue;
pub mod storage;

pub use config::{AppConfig, RelocationStrategy, StorageBackend};
pub use dedup::{Admission, DedupEngine};
pub use error::{Error, ErrorKind, Result};
pub use fileops::FileMutator;
pub use hasher::{FileHasher, Sha256Hasher};
pub use library::Library;
pub use notifier::{OperationEvent, ProgressNotifier, Subscription};
pub use queue::{
    CancelToken, JobContext, OperationQueue, OperationSnapshot, OperationTypeMetrics,
    ProgressSink, ShutdownReport,
};
pub use storage::Store;
