//! Cross-connection visibility and writer serialization.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use quadra::{IsolationLevel, Quad, Result, Store, StoreConfig, Term};
use tempfile::tempdir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn ex(name: &str) -> Term {
    Term::iri(format!("http://example.org/{name}"))
}

fn count(store: &Store) -> u64 {
    store.connection().size(None, None, None, true, &[]).unwrap()
}

/// An uncommitted add is invisible to a concurrent committed-only reader.
#[test]
fn uncommitted_adds_are_invisible_to_other_connections() {
    init_tracing();
    let dir = tempdir().unwrap();
    let store = Store::open(StoreConfig::new(dir.path())).unwrap();

    let (writer_ready_tx, writer_ready_rx) = mpsc::channel();
    let (reader_done_tx, reader_done_rx) = mpsc::channel();

    let writer = {
        let store = store.clone();
        thread::spawn(move || {
            let mut conn = store.connection();
            conn.begin().unwrap();
            conn.add_statement(&ex("s"), &ex("p"), &ex("o"), &[]).unwrap();
            writer_ready_tx.send(()).unwrap();
            // Hold the transaction open until the reader has looked.
            reader_done_rx.recv().unwrap();
            conn.commit().unwrap();
        })
    };

    writer_ready_rx.recv().unwrap();
    assert_eq!(count(&store), 0, "uncommitted add leaked");
    reader_done_tx.send(()).unwrap();
    writer.join().unwrap();
    assert_eq!(count(&store), 1);
}

/// Writers under the stronger isolation levels take the exclusive lock in
/// `begin`, so a second writer blocks until the first finishes.
#[test]
fn serializable_writers_are_serialized() {
    init_tracing();
    let dir = tempdir().unwrap();
    let store = Store::open(StoreConfig::new(dir.path())).unwrap();

    let mut first = store.connection();
    first.begin_with(IsolationLevel::Serializable).unwrap();

    let (started_tx, started_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();
    let second = {
        let store = store.clone();
        thread::spawn(move || {
            started_tx.send(()).unwrap();
            let mut conn = store.connection();
            conn.begin_with(IsolationLevel::Serializable).unwrap();
            conn.add_statement(&ex("b"), &ex("p"), &ex("o"), &[]).unwrap();
            conn.commit().unwrap();
            done_tx.send(()).unwrap();
        })
    };

    started_rx.recv().unwrap();
    // The second writer is parked in begin while the first holds the lock.
    assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());

    first
        .add_statement(&ex("a"), &ex("p"), &ex("o"), &[])
        .unwrap();
    first.commit().unwrap();

    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("second writer proceeds after the first commits");
    second.join().unwrap();
    assert_eq!(count(&store), 2);
}

/// Read-committed connections interleave freely until one of them writes.
#[test]
fn read_committed_readers_do_not_block_each_other() {
    init_tracing();
    let dir = tempdir().unwrap();
    let store = Store::open(StoreConfig::new(dir.path())).unwrap();

    let mut a = store.connection();
    let mut b = store.connection();
    a.begin_with(IsolationLevel::ReadCommitted).unwrap();
    b.begin_with(IsolationLevel::ReadCommitted).unwrap();

    // Both can read while in their transactions; neither holds the lock.
    assert_eq!(a.size(None, None, None, true, &[]).unwrap(), 0);
    assert_eq!(b.size(None, None, None, true, &[]).unwrap(), 0);

    // The first write claims the lock.
    a.add_statement(&ex("a"), &ex("p"), &ex("o"), &[]).unwrap();
    a.commit().unwrap();
    b.commit().unwrap();
    assert_eq!(count(&store), 1);
}

/// Read-your-writes inside one transaction, across add and remove.
#[test]
fn a_transaction_sees_its_own_changes() {
    init_tracing();
    let dir = tempdir().unwrap();
    let store = Store::open(StoreConfig::new(dir.path())).unwrap();
    let mut conn = store.connection();

    conn.begin().unwrap();
    conn.add_statement(&ex("s"), &ex("p"), &ex("o"), &[]).unwrap();
    let seen: Vec<Quad> = conn
        .statements(Some(&ex("s")), None, None, true, &[])
        .unwrap()
        .collect::<Result<_>>()
        .unwrap();
    assert_eq!(seen.len(), 1);

    conn.remove_statements(Some(&ex("s")), None, None, &[]).unwrap();
    assert!(conn
        .statements(Some(&ex("s")), None, None, true, &[])
        .unwrap()
        .next()
        .is_none());
    conn.commit().unwrap();
}

/// Concurrent read-committed readers while a writer churns: readers only
/// ever observe committed states.
#[test]
fn readers_never_observe_intermediate_flags() {
    init_tracing();
    let dir = tempdir().unwrap();
    let store = Store::open(StoreConfig::new(dir.path())).unwrap();

    let writer = {
        let store = store.clone();
        thread::spawn(move || {
            for round in 0..20 {
                let mut conn = store.connection();
                conn.begin().unwrap();
                conn.add_statement(&ex(&format!("s{round}")), &ex("p"), &ex("o"), &[])
                    .unwrap();
                conn.commit().unwrap();
            }
        })
    };

    let reader = {
        let store = store.clone();
        thread::spawn(move || {
            let conn = store.connection();
            for _ in 0..200 {
                // Every quad a committed-only reader can decode must be a
                // complete, committed statement.
                for quad in conn.statements(None, None, None, true, &[]).unwrap() {
                    let quad = quad.unwrap();
                    assert!(matches!(quad.predicate, Term::Iri(_)));
                }
            }
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();
    assert_eq!(count(&store), 20);
}
