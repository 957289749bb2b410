//! Priority job queue with a fixed worker pool.
//!
//! Operations move `queued -> running -> completed | failed | canceled` and
//! never leave a terminal state. Ready jobs dispatch by descending priority,
//! FIFO within a priority. Each operation record sits behind its own mutex;
//! every change to it (status, progress) is made, journaled and published
//! while that mutex is held, so the store and the event stream observe one
//! operation's changes in order. Store writes happen on the journal's writer
//! thread, never on the caller of `enqueue`, `cancel` or `shutdown`. An
//! operation leaves the active table in the same critical section that
//! makes it terminal.
//!
//! Lock order: scheduler state, then an operation record, then the journal.
//! `enqueue` holds a record no other thread can reach yet while it takes the
//! scheduler lock.

pub mod cancel;
mod journal;
pub mod metrics;
pub mod progress;

use chrono::Utc;
use serde::Serialize;
use std::any::Any;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::notifier::{OperationEvent, ProgressNotifier};
use crate::storage::models::{LogLevel, Operation, OperationLog, OperationStatus};
use crate::storage::Store;
use journal::Journal;

pub use cancel::CancelToken;
pub use metrics::{OperationTypeMetrics, QueueMetrics};
pub use progress::{JobContext, ProgressSink, SilentSink};

type Job = Box<dyn FnOnce(&JobContext) -> Result<()> + Send + 'static>;
type Record = Arc<Mutex<Operation>>;

/// Point-in-time view of one non-terminal operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationSnapshot {
    pub id: String,
    pub op_type: String,
    pub priority: i32,
    pub status: OperationStatus,
    pub progress: u64,
    pub total: u64,
    pub message: String,
}

impl From<&Operation> for OperationSnapshot {
    fn from(op: &Operation) -> Self {
        Self {
            id: op.id.clone(),
            op_type: op.op_type.clone(),
            priority: op.priority,
            status: op.status,
            progress: op.progress,
            total: op.total,
            message: op.message.clone(),
        }
    }
}

/// Outcome of [`OperationQueue::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Running at shutdown and reached a terminal state before the deadline.
    pub drained: Vec<String>,
    /// Still running at the deadline; force-marked failed.
    pub timed_out: Vec<String>,
    /// Queued but never started; marked canceled.
    pub discarded: Vec<String>,
}

struct Pending {
    priority: i32,
    seq: u64,
    id: String,
    job: Job,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    // Max-heap: higher priority first, then lower sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Tracked {
    priority: i32,
    seq: u64,
    record: Record,
    cancel: CancelToken,
    running: bool,
}

#[derive(Default)]
struct QueueState {
    pending: BinaryHeap<Pending>,
    active: HashMap<String, Tracked>,
    running: usize,
    draining: bool,
}

struct Inner {
    state: Mutex<QueueState>,
    ready: Condvar,
    idle: Condvar,
    store: Arc<dyn Store>,
    notifier: ProgressNotifier,
    journal: Journal,
    metrics: QueueMetrics,
    seq: AtomicU64,
}

pub struct OperationQueue {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl OperationQueue {
    /// Start `workers` worker threads (at least one).
    pub fn new(store: Arc<dyn Store>, notifier: ProgressNotifier, workers: usize) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
            idle: Condvar::new(),
            store,
            notifier,
            journal: Journal::default(),
            metrics: QueueMetrics::default(),
            seq: AtomicU64::new(0),
        });

        let writer = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("audioshelf-journal".to_string())
                .spawn(move || inner.journal.run_writer(inner.store.as_ref()))
        };
        let writer = match writer {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("Failed to spawn operation journal writer: {}", e);
                None
            }
        };

        let handles = (0..workers.max(1))
            .map(|n| {
                let inner = Arc::clone(&inner);
                thread::Builder::new()
                    .name(format!("audioshelf-worker-{}", n))
                    .spawn(move || inner.worker_loop())
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    error!("Failed to spawn queue worker: {}", e);
                    None
                }
            })
            .collect::<Vec<_>>();

        info!("Operation queue started with {} workers", handles.len());
        Self {
            inner,
            workers: Mutex::new(handles),
            writer: Mutex::new(writer),
        }
    }

    pub fn notifier(&self) -> &ProgressNotifier {
        &self.inner.notifier
    }

    pub fn metrics(&self) -> Vec<OperationTypeMetrics> {
        self.inner.metrics.snapshot()
    }

    /// Log trail written by the job of operation `id`, oldest first.
    pub fn operation_logs(&self, id: &str) -> Result<Vec<OperationLog>> {
        self.inner.store.get_operation_logs(id)
    }

    /// Block until every operation change made so far is in the store.
    pub fn flush(&self) {
        self.inner.journal.flush();
    }

    /// Admit `job` as operation `id`. Returns as soon as the operation is queued.
    pub fn enqueue<F>(
        &self,
        id: impl Into<String>,
        op_type: impl Into<String>,
        priority: i32,
        job: F,
    ) -> Result<()>
    where
        F: FnOnce(&JobContext) -> Result<()> + Send + 'static,
    {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::Validation("operation id must not be empty".into()));
        }

        let op = Operation::queued(id.clone(), op_type, priority);
        let record: Record = Arc::new(Mutex::new(op));
        // Held until the queued state is journaled, so a worker that picks the
        // job up immediately cannot record `running` first.
        let guard = lock(&record);
        {
            let mut state = lock(&self.inner.state);
            if state.draining {
                return Err(Error::ShuttingDown);
            }
            if state.active.contains_key(&id) {
                return Err(Error::Conflict(format!("operation {} is already active", id)));
            }
            let seq = self.inner.seq.fetch_add(1, AtomicOrdering::SeqCst);
            state.active.insert(
                id.clone(),
                Tracked {
                    priority,
                    seq,
                    record: Arc::clone(&record),
                    cancel: CancelToken::new(),
                    running: false,
                },
            );
            state.pending.push(Pending {
                priority,
                seq,
                id: id.clone(),
                job: Box::new(job),
            });
        }

        self.inner.persist(&guard);
        drop(guard);

        self.inner.ready.notify_one();
        debug!("Enqueued operation {} (priority {})", id, priority);
        Ok(())
    }

    /// Cancel a queued or running operation.
    ///
    /// A queued operation is removed without running. A running one gets its
    /// cancellation token set and is expected to stop at its next safe point.
    pub fn cancel(&self, id: &str) -> Result<()> {
        let mut state = lock(&self.inner.state);
        let tracked = state
            .active
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("no active operation {}", id)))?;

        if tracked.running {
            if tracked.cancel.is_cancelled() {
                return Err(Error::NotFound(format!(
                    "operation {} is already being canceled",
                    id
                )));
            }
            tracked.cancel.cancel();
            drop(state);
            info!("Cancellation requested for running operation {}", id);
        } else {
            let record = Arc::clone(&tracked.record);
            state.pending.retain(|p| p.id != id);
            state.active.remove(id);
            self.inner
                .finish(&record, OperationStatus::Canceled, "canceled before start");
            drop(state);
            info!("Canceled queued operation {}", id);
        }
        Ok(())
    }

    /// Non-terminal operations, highest priority first.
    pub fn active_operations(&self) -> Vec<OperationSnapshot> {
        let mut tracked: Vec<(i32, u64, Record)> = {
            let state = lock(&self.inner.state);
            state
                .active
                .values()
                .map(|t| (t.priority, t.seq, Arc::clone(&t.record)))
                .collect()
        };
        tracked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        tracked
            .iter()
            .map(|(_, _, record)| OperationSnapshot::from(&*lock(record)))
            .filter(|snapshot| !snapshot.status.is_terminal())
            .collect()
    }

    /// Latest known state of `id`: live state while active, then any change
    /// not yet written, else the stored record.
    pub fn get_operation(&self, id: &str) -> Result<Operation> {
        let live = lock(&self.inner.state)
            .active
            .get(id)
            .map(|t| Arc::clone(&t.record));
        if let Some(record) = live {
            return Ok(lock(&record).clone());
        }
        match self.inner.journal.pending(id) {
            Some(op) => Ok(op),
            None => self.inner.store.get_operation(id),
        }
    }

    /// Stop admitting work, cancel everything, and wait up to `timeout` for
    /// running jobs. Calls after the first return an empty report.
    pub fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let Some((discarded, running)) = self.inner.begin_shutdown() else {
            return ShutdownReport::default();
        };
        info!(
            "Shutting down operation queue: {} running, {} discarded",
            running.len(),
            discarded.len()
        );

        let deadline = Instant::now() + timeout;
        {
            let mut state = lock(&self.inner.state);
            while state.running > 0 {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                state = self
                    .inner
                    .idle
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        }

        let mut report = ShutdownReport {
            discarded,
            ..ShutdownReport::default()
        };
        for (id, record) in running {
            let mut state = lock(&self.inner.state);
            let finished = lock(&record).status.is_terminal();
            if finished {
                report.drained.push(id);
            } else {
                state.active.remove(&id);
                self.inner.finish(
                    &record,
                    OperationStatus::Failed,
                    &format!("shutdown timed out after {:?}", timeout),
                );
                report.timed_out.push(id);
            }
        }

        self.inner.journal.close();
        if let Some(writer) = lock(&self.writer).take() {
            if writer.join().is_err() {
                error!("Operation journal writer exited abnormally");
            }
        }
        for m in self.inner.metrics.snapshot() {
            info!(
                "{}: {} started, {} completed, {} failed, {} canceled, max {} ms",
                m.op_type, m.started, m.completed, m.failed, m.canceled, m.max_duration_ms
            );
        }

        if report.timed_out.is_empty() {
            for handle in lock(&self.workers).drain(..) {
                if handle.join().is_err() {
                    error!("Queue worker exited abnormally");
                }
            }
        } else {
            warn!(
                "{} operations did not stop within {:?}",
                report.timed_out.len(),
                timeout
            );
        }
        report
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        self.inner.begin_shutdown();
        self.inner.journal.close();
    }
}

impl Inner {
    fn worker_loop(self: Arc<Self>) {
        loop {
            let next = {
                let mut state = lock(&self.state);
                loop {
                    if let Some(pending) = state.pending.pop() {
                        let claimed = state.active.get_mut(&pending.id).map(|t| {
                            t.running = true;
                            (Arc::clone(&t.record), t.cancel.clone())
                        });
                        match claimed {
                            Some((record, cancel)) => {
                                state.running += 1;
                                break Some((pending, record, cancel));
                            }
                            None => continue,
                        }
                    }
                    if state.draining {
                        break None;
                    }
                    state = self
                        .ready
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            };

            match next {
                Some((pending, record, cancel)) => self.run(pending, record, cancel),
                None => return,
            }
        }
    }

    fn run(self: &Arc<Self>, pending: Pending, record: Record, cancel: CancelToken) {
        let Pending { id, job, .. } = pending;
        let op_type = lock(&record).op_type.clone();
        self.metrics.record_started(&op_type);
        self.transition_running(&record);

        let sink = Arc::new(OperationReporter {
            record: Arc::clone(&record),
            inner: Arc::clone(self),
        });
        let ctx = JobContext::new(id.clone(), cancel, sink);

        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| job(&ctx)));
        let (status, message) = match outcome {
            Ok(Ok(())) => (OperationStatus::Completed, "completed".to_string()),
            Ok(Err(Error::Cancelled)) => (OperationStatus::Canceled, "canceled".to_string()),
            Ok(Err(e)) => (OperationStatus::Failed, e.to_string()),
            Err(payload) => {
                error!("Operation {} panicked", id);
                (
                    OperationStatus::Failed,
                    format!("job panicked: {}", panic_message(payload.as_ref())),
                )
            }
        };
        debug!(
            "Operation {} finished as {} in {:.2?}",
            id,
            status,
            started.elapsed()
        );
        {
            let mut state = lock(&self.state);
            state.active.remove(&id);
            // A shutdown timeout may have recorded a terminal state already.
            let recorded = match lock(&record).status {
                current if current.is_terminal() => current,
                _ => status,
            };
            self.metrics
                .record_finished(&op_type, recorded, started.elapsed());
            self.finish(&record, status, &message);
            state.running = state.running.saturating_sub(1);
        }
        self.idle.notify_all();
    }

    fn transition_running(&self, record: &Record) {
        let mut op = lock(record);
        if op.status.is_terminal() {
            return;
        }
        op.status = OperationStatus::Running;
        op.message = "running".to_string();
        op.updated_at = Utc::now();
        self.persist(&op);
    }

    /// Move to a terminal state unless one was already recorded.
    fn finish(&self, record: &Record, status: OperationStatus, message: &str) {
        let mut op = lock(record);
        if op.status.is_terminal() {
            debug!(
                "Operation {} already {}, ignoring {}",
                op.id, op.status, status
            );
            return;
        }
        op.status = status;
        op.message = message.to_string();
        op.updated_at = Utc::now();
        self.persist(&op);
    }

    fn persist(&self, op: &Operation) {
        self.journal.record(op);
        self.notifier.publish(OperationEvent::from(op));
    }

    /// Flip to draining, cancel every queued job and signal every running one.
    /// Returns `None` if already draining.
    #[allow(clippy::type_complexity)]
    fn begin_shutdown(&self) -> Option<(Vec<String>, Vec<(String, Record)>)> {
        let (discarded, running) = {
            let mut state = lock(&self.state);
            if state.draining {
                return None;
            }
            state.draining = true;

            let mut discarded = Vec::new();
            let queued = std::mem::take(&mut state.pending).into_sorted_vec();
            for pending in queued.into_iter().rev() {
                if let Some(tracked) = state.active.remove(&pending.id) {
                    self.finish(&tracked.record, OperationStatus::Canceled, "queue shut down");
                    discarded.push(pending.id);
                }
            }
            let running: Vec<(String, Record)> = state
                .active
                .iter()
                .map(|(id, t)| {
                    t.cancel.cancel();
                    (id.clone(), Arc::clone(&t.record))
                })
                .collect();
            (discarded, running)
        };
        self.ready.notify_all();
        Some((discarded, running))
    }
}

/// Progress sink handed to jobs run by the queue. Runs on the worker thread.
struct OperationReporter {
    record: Record,
    inner: Arc<Inner>,
}

impl ProgressSink for OperationReporter {
    fn report(&self, progress: u64, total: u64, message: &str) {
        let mut op = lock(&self.record);
        if op.status != OperationStatus::Running {
            return;
        }
        op.progress = op.progress.max(progress);
        op.total = total;
        op.message = message.to_string();
        op.updated_at = Utc::now();
        self.inner.persist(&op);
    }

    fn log(&self, operation_id: &str, level: LogLevel, message: &str) {
        progress::trace_log(operation_id, level, message);
        let entry = OperationLog::new(operation_id, level, message);
        if let Err(e) = self.inner.store.add_operation_log(&entry) {
            warn!("Failed to store log for operation {}: {}", operation_id, e);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
