use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tablelock::concurrency::{
    AccessType, LockError, Lockable, LockableId, Locker, LockingMode, LockingQueue,
};
use tablelock::config::Config;
use tablelock::database::Database;
use tablelock::event::{ObjectKind, ObjectName, RowEvent, RowEventKind, TableId};
use tablelock::transaction::{
    IsolationLevel, RegistryValidator, TableSystem, TransactionError, TransactionStatus,
};

struct Table(LockableId);

impl Lockable for Table {
    fn lockable_id(&self) -> LockableId {
        self.0
    }
}

fn table(id: u64) -> Arc<dyn Lockable> {
    Arc::new(Table(LockableId::new(id)))
}

fn setup() -> (Arc<Database>, Arc<dyn TableSystem>) {
    (Database::new(), Arc::new(RegistryValidator::new()))
}

#[test]
fn test_second_writer_waits_for_first_commit() {
    let (db, system) = setup();
    let x = table(1);

    let mut t1 = db.begin(&system, IsolationLevel::Serializable).unwrap();
    t1.enter(&[Arc::clone(&x)], AccessType::WRITE).unwrap();
    assert!(db.locker().is_locked(x.as_ref()));

    let committed = Arc::new(AtomicBool::new(false));
    let t2_thread = {
        let db = Arc::clone(&db);
        let system = Arc::clone(&system);
        let x = Arc::clone(&x);
        let committed = Arc::clone(&committed);
        thread::spawn(move || {
            let mut t2 = db.begin(&system, IsolationLevel::Serializable).unwrap();
            t2.enter(&[x], AccessType::WRITE).unwrap();
            // Entry is only possible once the first writer is gone.
            assert!(committed.load(Ordering::SeqCst));
            t2.commit(None).unwrap();
        })
    };

    thread::sleep(Duration::from_millis(100));
    committed.store(true, Ordering::SeqCst);
    t1.commit(None).unwrap();

    t2_thread.join().unwrap();
    assert!(!db.locker().is_locked(x.as_ref()));
    assert_eq!(db.locker().open_handles(), 0);
    assert_eq!(db.open_transactions(), 0);
}

#[test]
fn test_read_committed_waits_for_writer() {
    let (db, system) = setup();
    let x = table(7);

    let mut writer = db.begin(&system, IsolationLevel::Serializable).unwrap();
    writer.enter(&[Arc::clone(&x)], AccessType::WRITE).unwrap();

    let reader_thread = {
        let db = Arc::clone(&db);
        let system = Arc::clone(&system);
        let x = Arc::clone(&x);
        thread::spawn(move || {
            let start = Instant::now();
            let mut reader = db.begin(&system, IsolationLevel::ReadCommitted).unwrap();
            reader.enter(&[x], AccessType::READ).unwrap();
            assert!(reader.lock_handles().is_empty());
            assert_eq!(reader.state().selected_tables(), vec![LockableId::new(7)]);
            reader.commit(None).unwrap();
            start.elapsed()
        })
    };

    thread::sleep(Duration::from_millis(80));
    writer.commit(None).unwrap();

    let waited = reader_thread.join().unwrap();
    assert!(waited >= Duration::from_millis(50));
}

#[test]
fn test_read_uncommitted_does_not_wait() {
    let (db, system) = setup();
    let x = table(8);

    let mut writer = db.begin(&system, IsolationLevel::Serializable).unwrap();
    writer.enter(&[Arc::clone(&x)], AccessType::WRITE).unwrap();

    let mut reader = db.begin(&system, IsolationLevel::ReadUncommitted).unwrap();
    reader.enter(&[Arc::clone(&x)], AccessType::READ).unwrap();
    assert!(reader.lock_handles().is_empty());
    assert!(db.locker().is_locked(x.as_ref()));

    reader.commit(None).unwrap();
    writer.commit(None).unwrap();
}

#[test]
fn test_dropped_transaction_releases_all_handles() {
    let (db, system) = setup();
    let tables = vec![table(1), table(2), table(3)];

    {
        let mut txn = db.begin(&system, IsolationLevel::Snapshot).unwrap();
        txn.enter(&tables[..2], AccessType::WRITE).unwrap();
        txn.lock(&tables[2..], AccessType::READ, LockingMode::Shared)
            .unwrap();
        assert_eq!(db.locker().open_handles(), 2);
        assert!(tables.iter().all(|t| db.locker().is_locked(t.as_ref())));
    }

    assert!(tables.iter().all(|t| !db.locker().is_locked(t.as_ref())));
    assert_eq!(db.locker().open_handles(), 0);
    assert_eq!(db.open_transactions(), 0);
}

#[test]
fn test_writers_are_granted_in_arrival_order() {
    let locker = Locker::new();
    let x = table(42);
    let order = Arc::new(Mutex::new(Vec::new()));

    let first = locker
        .lock(&[Arc::clone(&x)], AccessType::WRITE, LockingMode::Exclusive)
        .unwrap();

    let mut waiters = Vec::new();
    for name in ["second", "third"] {
        let locker = Arc::clone(&locker);
        let x = Arc::clone(&x);
        let order = Arc::clone(&order);
        waiters.push(thread::spawn(move || {
            let handle = locker
                .lock(&[x], AccessType::WRITE, LockingMode::Exclusive)
                .unwrap();
            handle.wait_all(None).unwrap();
            order.lock().unwrap().push(name);
            thread::sleep(Duration::from_millis(10));
            handle.release().unwrap();
        }));
        // Let each waiter enqueue before the next one arrives.
        thread::sleep(Duration::from_millis(50));
    }

    assert_eq!(locker.queue_len(x.as_ref()), 3);
    first.release().unwrap();

    for waiter in waiters {
        waiter.join().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["second", "third"]);
    assert!(!locker.is_locked(x.as_ref()));
}

#[test]
fn test_handle_release_is_idempotent() {
    let locker = Locker::new();
    let tables = vec![table(1), table(2)];

    let handle = locker
        .lock(&tables, AccessType::READ_WRITE, LockingMode::Exclusive)
        .unwrap();
    assert_eq!(handle.locks().len(), 4);

    locker.release(&handle).unwrap();
    locker.release(&handle).unwrap();
    handle.release().unwrap();

    assert!(handle.is_released());
    assert_eq!(locker.open_handles(), 0);
    assert!(tables.iter().all(|t| !locker.is_locked(t.as_ref())));
}

#[test]
fn test_failed_grant_leaves_no_partial_locks() {
    let locker = Locker::with_acquire_timeout(Some(Duration::from_millis(50)));
    let a = table(1);
    let b = table(2);

    let holder = locker
        .lock(&[Arc::clone(&b)], AccessType::WRITE, LockingMode::Exclusive)
        .unwrap();

    let err = locker
        .lock(
            &[Arc::clone(&a), Arc::clone(&b)],
            AccessType::WRITE,
            LockingMode::Exclusive,
        )
        .unwrap_err();
    assert!(matches!(err, LockError::Timeout { .. }));
    assert!(err.is_retryable());

    assert!(!locker.is_locked(a.as_ref()));
    assert_eq!(locker.queue_len(b.as_ref()), 1);
    assert_eq!(locker.open_handles(), 1);
    drop(holder);
    assert_eq!(locker.open_handles(), 0);
}

#[test]
fn test_shared_over_release_reports_without_corrupting_holders() {
    let queue = LockingQueue::new(table(5));

    let reader = queue
        .lock(1, LockingMode::Shared, AccessType::READ, None)
        .unwrap();
    let other = queue
        .lock(2, LockingMode::Shared, AccessType::READ, None)
        .unwrap();
    assert_eq!(queue.shared_count(), 2);

    queue.release(&reader).unwrap();
    let err = queue.release(&reader).unwrap_err();
    assert!(matches!(err, LockError::OverRelease { .. }));
    assert_eq!(queue.shared_count(), 1);
    assert_eq!(queue.len(), 1);

    queue.release(&other).unwrap();
    assert_eq!(queue.shared_count(), 0);
    assert!(queue.is_empty());

    // The queue keeps working after the over-release.
    let writer = queue
        .lock(3, LockingMode::Exclusive, AccessType::WRITE, None)
        .unwrap();
    assert!(queue.is_exclusive());
    queue.release(&writer).unwrap();
}

#[test]
fn test_check_access_is_not_starved_by_later_writer() {
    let locker = Locker::new();
    let x = table(11);

    let holder = locker
        .lock(&[Arc::clone(&x)], AccessType::WRITE, LockingMode::Exclusive)
        .unwrap();

    let checker = {
        let locker = Arc::clone(&locker);
        let x = Arc::clone(&x);
        thread::spawn(move || {
            let start = Instant::now();
            locker
                .check_access(&[x], AccessType::READ_WRITE, Duration::from_secs(2))
                .unwrap();
            start.elapsed()
        })
    };
    thread::sleep(Duration::from_millis(100));

    let writer = {
        let locker = Arc::clone(&locker);
        let x = Arc::clone(&x);
        thread::spawn(move || {
            let start = Instant::now();
            let handle = locker
                .lock_with_timeout(
                    &[x],
                    AccessType::WRITE,
                    LockingMode::Exclusive,
                    Some(Duration::from_secs(2)),
                )
                .unwrap();
            handle.wait_all(Some(Duration::from_secs(2))).unwrap();
            start.elapsed()
        })
    };
    thread::sleep(Duration::from_millis(100));
    holder.release().unwrap();

    assert!(checker.join().unwrap() < Duration::from_secs(1));
    assert!(writer.join().unwrap() < Duration::from_secs(1));
    assert!(!locker.is_locked(x.as_ref()));
}

#[test]
fn test_rejected_double_removal_does_not_poison_history() {
    let (db, system) = setup();

    let mut reader = db.begin(&system, IsolationLevel::Snapshot).unwrap();
    let mut doubled = db.begin(&system, IsolationLevel::Snapshot).unwrap();

    doubled.on_row_removed(TableId(1), 5).unwrap();
    doubled.on_row_removed(TableId(1), 5).unwrap();
    assert!(doubled.registry().commit_clash().is_some());
    assert!(matches!(
        doubled.commit(None),
        Err(TransactionError::CommitClash {
            table_id: TableId(1),
            row_number: 5
        })
    ));

    reader.on_row_removed(TableId(2), 7).unwrap();
    reader.commit(None).unwrap();
    assert_eq!(db.latest_commit_id().value(), 1);
}

#[test]
fn test_commit_clash_on_concurrent_removal() {
    let (db, system) = setup();

    let mut t1 = db.begin(&system, IsolationLevel::Snapshot).unwrap();
    let mut t2 = db.begin(&system, IsolationLevel::Snapshot).unwrap();
    let mut t3 = db.begin(&system, IsolationLevel::Snapshot).unwrap();

    t1.on_row_removed(TableId(1), 10).unwrap();
    t2.on_row_removed(TableId(1), 10).unwrap();
    t3.on_row_removed(TableId(1), 11).unwrap();

    t1.commit(None).unwrap();
    assert_eq!(t1.status(), TransactionStatus::Commit);

    let err = t2.commit(None).unwrap_err();
    assert!(matches!(
        err,
        TransactionError::CommitClash {
            table_id: TableId(1),
            row_number: 10
        }
    ));
    assert!(err.is_retryable());
    assert!(t2.is_closed());

    // A different row of the same table does not clash.
    t3.commit(None).unwrap();

    assert_eq!(db.latest_commit_id().value(), 2);
    assert_eq!(db.open_transactions(), 0);
    assert!(db.versioned_registry().is_empty());
}

#[test]
fn test_committed_registry_is_read_only() {
    let (db, system) = setup();

    let mut txn = db.begin(&system, IsolationLevel::Serializable).unwrap();
    txn.on_object_created(ObjectName::from("orders"), ObjectKind::Table)
        .unwrap();
    txn.on_row_added(TableId(3), 1).unwrap();
    let registry = Arc::clone(txn.registry());
    txn.commit(None).unwrap();

    assert!(registry.is_read_only());
    assert_eq!(registry.commit_id().value(), 1);
    assert_eq!(registry.len(), 2);
    assert!(matches!(
        registry.register(RowEvent::new(TableId(3), 2, RowEventKind::Add)),
        Err(TransactionError::RegistryReadOnly(_))
    ));
    assert!(matches!(
        txn.on_row_added(TableId(3), 2),
        Err(TransactionError::Closed(_))
    ));
}

#[test]
fn test_contended_workload_never_overlaps_writers() {
    let mut config = Config::default();
    config.locking.acquire_timeout_ms = Some(5_000);
    let db = Database::with_config(config);
    let system: Arc<dyn TableSystem> = Arc::new(RegistryValidator::new());
    let x = table(99);
    let inside = Arc::new(AtomicBool::new(false));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let db = Arc::clone(&db);
            let system = Arc::clone(&system);
            let x = Arc::clone(&x);
            let inside = Arc::clone(&inside);
            thread::spawn(move || {
                for _ in 0..10 {
                    let mut txn = db.begin(&system, IsolationLevel::Serializable).unwrap();
                    txn.enter(&[Arc::clone(&x)], AccessType::WRITE).unwrap();
                    assert!(!inside.swap(true, Ordering::SeqCst));
                    thread::sleep(Duration::from_millis(1));
                    inside.store(false, Ordering::SeqCst);
                    txn.commit(None).unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(db.latest_commit_id().value(), 40);
    assert!(!db.locker().is_locked(x.as_ref()));
}
