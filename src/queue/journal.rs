//! Write-behind persistence for operation records.
//!
//! Scheduling paths (enqueue, cancel, shutdown, progress reports) only
//! record the latest snapshot of an operation here. A dedicated writer
//! thread copies snapshots into the store in the order they were recorded,
//! coalescing snapshots of the same operation that pile up meanwhile. A
//! snapshot stays readable through [`Journal::pending`] until it is written.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::storage::models::Operation;
use crate::storage::Store;

#[derive(Default)]
struct JournalState {
    order: VecDeque<String>,
    latest: HashMap<String, (u64, Operation)>,
    version: u64,
    closed: bool,
    writer_done: bool,
}

#[derive(Default)]
pub(crate) struct Journal {
    state: Mutex<JournalState>,
    wake: Condvar,
    settled: Condvar,
}

impl Journal {
    fn lock(&self) -> MutexGuard<'_, JournalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn record(&self, op: &Operation) {
        let mut state = self.lock();
        if state.writer_done {
            warn!("Operation {} changed after the journal closed", op.id);
        }
        state.version += 1;
        let version = state.version;
        if state
            .latest
            .insert(op.id.clone(), (version, op.clone()))
            .is_none()
        {
            state.order.push_back(op.id.clone());
        }
        drop(state);
        self.wake.notify_one();
    }

    /// Most recent snapshot of `id` not yet written to the store.
    pub(crate) fn pending(&self, id: &str) -> Option<Operation> {
        self.lock().latest.get(id).map(|(_, op)| op.clone())
    }

    /// Block until every recorded snapshot has reached the store.
    pub(crate) fn flush(&self) {
        let mut state = self.lock();
        while !state.latest.is_empty() && !state.writer_done {
            state = self
                .settled
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// The writer exits once everything recorded so far is written.
    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.wake.notify_all();
    }

    pub(crate) fn run_writer(&self, store: &dyn Store) {
        loop {
            let next = {
                let mut state = self.lock();
                loop {
                    if let Some(id) = state.order.pop_front() {
                        match state.latest.get(&id) {
                            Some((version, op)) => break Some((id, *version, op.clone())),
                            None => continue,
                        }
                    }
                    if state.closed {
                        break None;
                    }
                    state = self
                        .wake
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            };

            let Some((id, version, op)) = next else {
                break;
            };
            if let Err(e) = store.create_operation(&op) {
                warn!("Failed to persist operation {}: {}", id, e);
            }

            let mut state = self.lock();
            let superseded = match state.latest.get(&id) {
                Some((latest, _)) => *latest != version,
                None => false,
            };
            if superseded {
                state.order.push_back(id);
            } else {
                state.latest.remove(&id);
            }
            if state.latest.is_empty() {
                self.settled.notify_all();
            }
        }

        self.lock().writer_done = true;
        self.settled.notify_all();
        debug!("Operation journal writer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::OperationStatus;
    use crate::storage::SqliteStore;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_latest_snapshot_reaches_store() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let journal = Arc::new(Journal::default());

        let mut op = Operation::queued("j", "import", 0);
        journal.record(&op);
        op.status = OperationStatus::Running;
        op.progress = 4;
        journal.record(&op);
        assert_eq!(journal.pending("j").unwrap().progress, 4);

        let writer = {
            let journal = Arc::clone(&journal);
            let store = Arc::clone(&store);
            thread::spawn(move || journal.run_writer(store.as_ref()))
        };
        journal.flush();
        assert_eq!(journal.pending("j"), None);
        assert_eq!(store.get_operation("j").unwrap(), op);

        journal.close();
        writer.join().unwrap();
    }

    #[test]
    fn test_flush_returns_after_writer_stops() {
        let journal = Journal::default();
        journal.close();
        journal.run_writer(&SqliteStore::open_in_memory().unwrap());
        journal.record(&Operation::queued("late", "scan", 0));
        journal.flush();
        assert!(journal.pending("late").is_some());
    }
}
