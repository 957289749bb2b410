mod common;

use std::fs;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

use audioshelf::hasher::compute_file_hash;
use audioshelf::storage::models::{Book, BookState, Operation, OperationStatus};
use audioshelf::storage::Store;
use audioshelf::{AppConfig, Library, RelocationStrategy, StorageBackend};
use common::HookedStore;

/// Layout:
///   import/
///     Octavia Butler/
///       kindred.mp3        ("kindred bytes")
///       zz duplicate.mp3   ("kindred bytes")   <- duplicate
///     Unwanted/
///       spam.mp3           ("spam bytes")      <- blocked
///     notes.txt                                <- wrong extension
fn create_import_tree(root: &Path) {
    fs::create_dir_all(root.join("Octavia Butler")).unwrap();
    fs::create_dir_all(root.join("Unwanted")).unwrap();
    fs::write(root.join("Octavia Butler/kindred.mp3"), "kindred bytes").unwrap();
    fs::write(root.join("Octavia Butler/zz duplicate.mp3"), "kindred bytes").unwrap();
    fs::write(root.join("Unwanted/spam.mp3"), "spam bytes").unwrap();
    fs::write(root.join("notes.txt"), "not audio").unwrap();
}

fn config(root: &Path, backend: StorageBackend, strategy: RelocationStrategy) -> AppConfig {
    AppConfig {
        source_root: root.join("import"),
        destination_root: root.join("library"),
        storage_backend: backend,
        database_path: root.join("db"),
        workers: 2,
        relocation_strategy: strategy,
        ..AppConfig::default()
    }
}

fn wait_terminal(library: &Library, id: &str) -> Operation {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let op = library.queue().get_operation(id).unwrap();
        if op.status.is_terminal() {
            return op;
        }
        assert!(Instant::now() < deadline, "operation {} never finished", id);
        thread::sleep(Duration::from_millis(10));
    }
}

fn run_pipeline(backend: StorageBackend) {
    let tmp = tempdir().unwrap();
    let cfg = config(tmp.path(), backend, RelocationStrategy::Move);
    create_import_tree(&cfg.source_root);
    let library = Library::open(cfg.clone()).unwrap();

    let spam_hash = compute_file_hash(&cfg.source_root.join("Unwanted/spam.mp3")).unwrap();
    library.dedup().add_blocked_hash(&spam_hash, "not a book").unwrap();

    let import_id = library.start_import(0).unwrap();
    let import = wait_terminal(&library, &import_id);
    assert_eq!(import.status, OperationStatus::Completed, "{}", import.message);
    assert_eq!((import.progress, import.total), (3, 3));

    let books = library.store().list_books().unwrap();
    assert_eq!(books.len(), 1);
    assert_eq!(books[0].author.as_deref(), Some("Octavia Butler"));

    let organize_id = library.start_organize(0).unwrap();
    let organize = wait_terminal(&library, &organize_id);
    assert_eq!(organize.status, OperationStatus::Completed, "{}", organize.message);

    let book = library.store().get_book(&books[0].id).unwrap();
    assert_eq!(book.state, BookState::Organized);
    assert!(book.file_path.starts_with(&cfg.destination_root));
    assert!(book.file_path.ends_with("Octavia Butler/kindred/kindred.mp3"));
    assert_eq!(fs::read_to_string(&book.file_path).unwrap(), "kindred bytes");
    assert_eq!(book.organized_file_hash, book.original_file_hash);
    assert!(!cfg.source_root.join("Octavia Butler/kindred.mp3").exists());

    library.queue().flush();
    let ops = library.store().list_operations().unwrap();
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0].id, organize_id);

    let report = library.shutdown();
    assert!(report.timed_out.is_empty());
}

#[test]
fn test_pipeline_sqlite() {
    run_pipeline(StorageBackend::Sqlite);
}

#[cfg(feature = "rocksdb-backend")]
#[test]
fn test_pipeline_rocksdb() {
    run_pipeline(StorageBackend::Rocksdb);
}

#[test]
fn test_update_book_metadata() {
    let tmp = tempdir().unwrap();
    let cfg = config(tmp.path(), StorageBackend::Sqlite, RelocationStrategy::Copy);
    create_import_tree(&cfg.source_root);
    let library = Library::open(cfg).unwrap();

    let id = library.start_import(0).unwrap();
    wait_terminal(&library, &id);
    let book = library
        .store()
        .list_books()
        .unwrap()
        .into_iter()
        .find(|b| b.title == "kindred")
        .unwrap();

    let updated = library
        .update_book_metadata(&book.id, Some("Kindred"), Some(None))
        .unwrap();
    assert_eq!(updated.title, "Kindred");
    assert_eq!(updated.author, None);
    assert_eq!(library.store().get_book(&book.id).unwrap(), updated);

    let err = library
        .update_book_metadata(&book.id, Some("  "), None)
        .unwrap_err();
    assert_eq!(err.kind(), audioshelf::ErrorKind::Validation);
}

#[test]
fn test_metadata_edit_during_organize_keeps_both() {
    for _ in 0..5 {
        let tmp = tempdir().unwrap();
        let cfg = config(tmp.path(), StorageBackend::Sqlite, RelocationStrategy::Move);
        let src = cfg.source_root.join("Octavia Butler/kindred.mp3");
        fs::create_dir_all(src.parent().unwrap()).unwrap();
        fs::write(&src, "kindred bytes").unwrap();

        // Each book write stays open for a while before it commits.
        let store: Arc<dyn Store> = Arc::new(HookedStore::new(|_| {
            thread::sleep(Duration::from_millis(50));
            Ok(())
        }));
        let book = Book::new_imported(
            "kindred",
            Some("Octavia Butler".to_string()),
            &src,
            13,
            compute_file_hash(&src).unwrap(),
        );
        store.create_book(&book).unwrap();
        let library = Arc::new(Library::with_store(cfg.clone(), store).unwrap());
        let dest = cfg.destination_root.join("Octavia Butler/Kindred/kindred.mp3");

        let barrier = Arc::new(Barrier::new(2));
        let editor = {
            let library = Arc::clone(&library);
            let barrier = Arc::clone(&barrier);
            let id = book.id.clone();
            thread::spawn(move || {
                barrier.wait();
                library.update_book_metadata(&id, Some("Kindred"), None)
            })
        };
        barrier.wait();
        library.mutator().organize(&book, &dest).unwrap();
        editor.join().unwrap().unwrap();

        let stored = library.store().get_book(&book.id).unwrap();
        assert_eq!(stored.title, "Kindred");
        assert_eq!(stored.state, BookState::Organized);
        assert_eq!(stored.file_path, dest);
        assert_eq!(stored.organized_file_hash, stored.original_file_hash);
        assert_eq!(library.store().get_book_by_path(&dest).unwrap(), Some(stored));
        assert!(!src.exists());
    }
}

#[test]
fn test_invalid_config_rejected() {
    let tmp = tempdir().unwrap();
    let mut cfg = config(tmp.path(), StorageBackend::Sqlite, RelocationStrategy::Move);
    cfg.workers = 0;
    assert_eq!(
        Library::open(cfg).err().map(|e| e.kind()),
        Some(audioshelf::ErrorKind::Validation)
    );
}
