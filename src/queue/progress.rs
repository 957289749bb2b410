use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::cancel::CancelToken;
use crate::error::Result;
use crate::storage::models::LogLevel;

/// Receives progress from a running job.
///
/// Only the latest `(progress, total, message)` matters; implementations may
/// coalesce or drop intermediate values.
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: u64, total: u64, message: &str);

    /// Append a line to the operation's log trail. By default it is only traced.
    fn log(&self, operation_id: &str, level: LogLevel, message: &str) {
        trace_log(operation_id, level, message);
    }
}

pub(crate) fn trace_log(operation_id: &str, level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => debug!("[{}] {}", operation_id, message),
        LogLevel::Info => info!("[{}] {}", operation_id, message),
        LogLevel::Warn => warn!("[{}] {}", operation_id, message),
        LogLevel::Error => error!("[{}] {}", operation_id, message),
    }
}

/// Discards every report.
pub struct SilentSink;

impl ProgressSink for SilentSink {
    fn report(&self, _progress: u64, _total: u64, _message: &str) {}
}

/// Everything a job body gets from the queue: its id, a cancellation token
/// to poll at safe points, and a progress sink.
pub struct JobContext {
    operation_id: String,
    cancel: CancelToken,
    sink: Arc<dyn ProgressSink>,
}

impl JobContext {
    pub fn new(
        operation_id: impl Into<String>,
        cancel: CancelToken,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            cancel,
            sink,
        }
    }

    /// A context not attached to any queue, for running a job inline.
    pub fn detached(operation_id: impl Into<String>) -> Self {
        Self::new(operation_id, CancelToken::new(), Arc::new(SilentSink))
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<()> {
        self.cancel.check()
    }

    pub fn report(&self, progress: u64, total: u64, message: impl AsRef<str>) {
        self.sink.report(progress, total, message.as_ref());
    }

    pub fn log(&self, level: LogLevel, message: impl AsRef<str>) {
        self.sink.log(&self.operation_id, level, message.as_ref());
    }
}
