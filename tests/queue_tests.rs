use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use audioshelf::storage::models::{LogLevel, Operation, OperationStatus};
use audioshelf::storage::{SqliteStore, Store};
use audioshelf::{ErrorKind, OperationQueue, ProgressNotifier};

fn single_worker() -> (Arc<dyn Store>, OperationQueue) {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let queue = OperationQueue::new(store.clone(), ProgressNotifier::new(256), 1);
    (store, queue)
}

fn wait_terminal(queue: &OperationQueue, id: &str) -> Operation {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let op = queue.get_operation(id).unwrap();
        if op.status.is_terminal() {
            return op;
        }
        assert!(Instant::now() < deadline, "operation {} never finished", id);
        thread::sleep(Duration::from_millis(5));
    }
}

/// Occupies the single worker until the returned sender fires.
fn block_worker(queue: &OperationQueue) -> mpsc::Sender<()> {
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    queue
        .enqueue("blocker", "scan", 100, move |_| {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
            Ok(())
        })
        .unwrap();
    started_rx.recv().unwrap();
    release_tx
}

fn recording_job(
    log: &Arc<Mutex<Vec<String>>>,
    name: &str,
) -> impl FnOnce(&audioshelf::JobContext) -> audioshelf::Result<()> + Send + 'static {
    let log = Arc::clone(log);
    let name = name.to_string();
    move |_| {
        log.lock().unwrap().push(name);
        Ok(())
    }
}

#[test]
fn test_higher_priority_dispatched_first() {
    let (_store, queue) = single_worker();
    let log = Arc::new(Mutex::new(Vec::new()));
    let release = block_worker(&queue);

    queue.enqueue("low", "scan", 5, recording_job(&log, "low")).unwrap();
    queue.enqueue("high", "scan", 10, recording_job(&log, "high")).unwrap();
    release.send(()).unwrap();

    wait_terminal(&queue, "low");
    assert_eq!(*log.lock().unwrap(), vec!["high", "low"]);
}

#[test]
fn test_equal_priority_is_fifo() {
    let (_store, queue) = single_worker();
    let log = Arc::new(Mutex::new(Vec::new()));
    let release = block_worker(&queue);

    queue.enqueue("scan-1", "scan", 1, recording_job(&log, "scan-1")).unwrap();
    queue.enqueue("scan-2", "scan", 1, recording_job(&log, "scan-2")).unwrap();
    release.send(()).unwrap();

    wait_terminal(&queue, "scan-2");
    assert_eq!(*log.lock().unwrap(), vec!["scan-1", "scan-2"]);
}

#[test]
fn test_cancel_queued_runs_nothing() {
    let (store, queue) = single_worker();
    let log = Arc::new(Mutex::new(Vec::new()));
    let release = block_worker(&queue);

    queue.enqueue("doomed", "organize", 1, recording_job(&log, "doomed")).unwrap();
    queue.cancel("doomed").unwrap();
    release.send(()).unwrap();
    wait_terminal(&queue, "blocker");

    queue.flush();
    let op = store.get_operation("doomed").unwrap();
    assert_eq!(op.status, OperationStatus::Canceled);
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(queue.cancel("doomed").unwrap_err().kind(), ErrorKind::NotFound);
}

#[test]
fn test_control_calls_do_not_wait_for_storage() {
    let sqlite = Arc::new(SqliteStore::open_in_memory().unwrap());
    let store: Arc<dyn Store> = sqlite.clone();
    let queue = Arc::new(OperationQueue::new(store.clone(), ProgressNotifier::new(64), 1));
    let release = block_worker(&queue);

    let held = sqlite.connection().unwrap();
    let (done_tx, done_rx) = mpsc::channel();
    {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            queue.enqueue("parked", "scan", 0, |_| Ok(())).unwrap();
            queue.cancel("parked").unwrap();
            let status = queue.get_operation("parked").unwrap().status;
            done_tx.send(status).unwrap();
        });
    }
    let status = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("enqueue or cancel waited on the store");
    assert_eq!(status, OperationStatus::Canceled);

    drop(held);
    release.send(()).unwrap();
    wait_terminal(&queue, "blocker");
    queue.flush();
    assert_eq!(store.get_operation("parked").unwrap().status, OperationStatus::Canceled);
}

#[test]
fn test_finished_id_is_free_immediately() {
    let (_store, queue) = single_worker();
    for _ in 0..20 {
        queue.enqueue("again", "scan", 0, |_| Ok(())).unwrap();
        assert_eq!(wait_terminal(&queue, "again").status, OperationStatus::Completed);
        assert_eq!(queue.cancel("again").unwrap_err().kind(), ErrorKind::NotFound);
        assert!(queue.active_operations().is_empty());
    }
}

#[test]
fn test_job_logs_and_metrics() {
    let (_store, queue) = single_worker();

    queue
        .enqueue("chatty", "import", 0, |ctx| {
            ctx.log(LogLevel::Info, "scanning");
            ctx.log(LogLevel::Warn, format!("skipped {}", "notes.txt"));
            Ok(())
        })
        .unwrap();
    queue
        .enqueue("broken", "import", 0, |_| {
            Err(audioshelf::Error::Validation("bad input".into()))
        })
        .unwrap();
    queue.enqueue("tidy", "organize", 0, |_| Ok(())).unwrap();
    for id in ["chatty", "broken", "tidy"] {
        wait_terminal(&queue, id);
    }

    let logs = queue.operation_logs("chatty").unwrap();
    let trail: Vec<_> = logs.iter().map(|e| (e.level, e.message.as_str())).collect();
    assert_eq!(
        trail,
        vec![(LogLevel::Info, "scanning"), (LogLevel::Warn, "skipped notes.txt")]
    );
    assert!(logs.iter().all(|e| e.operation_id == "chatty"));
    assert!(queue.operation_logs("tidy").unwrap().is_empty());

    let metrics = queue.metrics();
    assert_eq!(metrics.len(), 2);
    let import = &metrics[0];
    assert_eq!(import.op_type, "import");
    assert_eq!((import.started, import.completed, import.failed), (2, 1, 1));
    assert_eq!(metrics[1].op_type, "organize");
    assert_eq!((metrics[1].started, metrics[1].completed), (1, 1));
}

#[test]
fn test_cancel_unknown_is_not_found() {
    let (_store, queue) = single_worker();
    let release = block_worker(&queue);

    let err = queue.cancel("unknown-id").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(queue.active_operations().len(), 1);

    release.send(()).unwrap();
    assert_eq!(wait_terminal(&queue, "blocker").status, OperationStatus::Completed);
}

#[test]
fn test_failures_are_contained() {
    let (_store, queue) = single_worker();

    queue
        .enqueue("err", "import", 0, |_| {
            Err(audioshelf::Error::Validation("bad input".into()))
        })
        .unwrap();
    queue
        .enqueue("panic", "import", 0, |_| panic!("boom"))
        .unwrap();
    queue.enqueue("ok", "import", 0, |_| Ok(())).unwrap();

    let err = wait_terminal(&queue, "err");
    assert_eq!(err.status, OperationStatus::Failed);
    assert!(err.message.contains("bad input"));

    let panicked = wait_terminal(&queue, "panic");
    assert_eq!(panicked.status, OperationStatus::Failed);
    assert!(panicked.message.contains("boom"));

    assert_eq!(wait_terminal(&queue, "ok").status, OperationStatus::Completed);
}

#[test]
fn test_active_operations_snapshot() {
    let (_store, queue) = single_worker();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    queue
        .enqueue("busy", "import", 3, move |ctx| {
            ctx.report(2, 9, "two of nine");
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
            Ok(())
        })
        .unwrap();
    started_rx.recv().unwrap();
    queue.enqueue("waiting", "organize", 7, |_| Ok(())).unwrap();

    let snapshot = queue.active_operations();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].id, "waiting");
    assert_eq!(snapshot[0].status, OperationStatus::Queued);
    assert_eq!(snapshot[1].id, "busy");
    assert_eq!(snapshot[1].status, OperationStatus::Running);
    assert_eq!((snapshot[1].progress, snapshot[1].total), (2, 9));
    assert_eq!(snapshot[1].message, "two of nine");

    release_tx.send(()).unwrap();
    wait_terminal(&queue, "waiting");
}

#[test]
fn test_notifier_sees_lifecycle() {
    let (_store, queue) = single_worker();
    let mut sub = queue.notifier().subscribe();
    queue
        .enqueue("watched", "import", 0, |ctx| {
            ctx.report(1, 1, "done");
            Ok(())
        })
        .unwrap();
    wait_terminal(&queue, "watched");

    let mut statuses = Vec::new();
    while let Some(event) = sub.try_next() {
        assert_eq!(event.operation_id, "watched");
        statuses.push(event.status);
    }
    assert_eq!(
        statuses,
        vec![
            OperationStatus::Queued,
            OperationStatus::Running,
            OperationStatus::Running,
            OperationStatus::Completed,
        ]
    );
}

#[test]
fn test_shutdown_drains_cooperative_jobs() {
    let (store, queue) = single_worker();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    queue
        .enqueue("looping", "organize", 0, move |ctx| {
            started_tx.send(()).unwrap();
            loop {
                ctx.check_cancelled()?;
                thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();
    queue.enqueue("never", "organize", 0, |_| Ok(())).unwrap();
    started_rx.recv().unwrap();

    let report = queue.shutdown(Duration::from_secs(5));
    assert_eq!(report.drained, vec!["looping"]);
    assert_eq!(report.discarded, vec!["never"]);
    assert!(report.timed_out.is_empty());

    assert_eq!(store.get_operation("looping").unwrap().status, OperationStatus::Canceled);
    let never = store.get_operation("never").unwrap();
    assert_eq!(never.status, OperationStatus::Canceled);
    assert_eq!(never.message, "queue shut down");

    let err = queue.enqueue("late", "scan", 0, |_| Ok(())).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ShuttingDown);
}

#[test]
fn test_shutdown_timeout_force_fails() {
    let (store, queue) = single_worker();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    queue
        .enqueue("stubborn", "organize", 0, move |_| {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
            Ok(())
        })
        .unwrap();
    started_rx.recv().unwrap();

    let report = queue.shutdown(Duration::from_millis(50));
    assert_eq!(report.timed_out, vec!["stubborn"]);
    let op = store.get_operation("stubborn").unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert!(op.message.contains("timed out"));

    // A late finish does not overwrite the terminal state.
    release_tx.send(()).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(store.get_operation("stubborn").unwrap().status, OperationStatus::Failed);
}
