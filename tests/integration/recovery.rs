//! Crash detection and startup recovery through the transaction status
//! marker.

use quadra::store::{QuadStore, TxnStatus, TxnStatusFile};
use quadra::{Store, StoreConfig, Term};
use tempfile::tempdir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn ex(name: &str) -> Term {
    Term::iri(format!("http://example.org/{name}"))
}

/// A crash after flagging but before commit: the interrupted add must not
/// survive the restart.
#[test]
fn interrupted_add_is_discarded_on_reopen() {
    init_tracing();
    let dir = tempdir().unwrap();

    {
        // Drive the tuple store directly so the "crash" leaves flagged
        // records and an ACTIVE status on disk, with no rollback run.
        let quads = QuadStore::open(dir.path(), "", false).unwrap();
        quads.start_transaction().unwrap();
        quads.store_quad(1, 2, 3, 0, true).unwrap();
        quads.sync().unwrap();
    }
    assert_eq!(
        TxnStatusFile::new(dir.path()).unwrap().get().unwrap(),
        TxnStatus::Active
    );

    let store = Store::open(StoreConfig::new(dir.path())).unwrap();
    assert_eq!(
        store
            .connection()
            .size(None, None, None, true, &[])
            .unwrap(),
        0
    );
    assert_eq!(
        TxnStatusFile::new(dir.path()).unwrap().get().unwrap(),
        TxnStatus::None
    );
}

/// A crash in the middle of a removal: the pending removal is undone and
/// the committed statement stays.
#[test]
fn interrupted_removal_is_undone_on_reopen() {
    init_tracing();
    let dir = tempdir().unwrap();

    {
        let store = Store::open(StoreConfig::new(dir.path())).unwrap();
        let mut conn = store.connection();
        conn.begin().unwrap();
        conn.add_statement(&ex("s"), &ex("p"), &ex("o"), &[]).unwrap();
        conn.commit().unwrap();
    }

    {
        let quads = QuadStore::open(dir.path(), "", false).unwrap();
        quads.start_transaction().unwrap();
        assert_eq!(quads.remove_quads(-1, -1, -1, -1).unwrap(), 1);
        quads.sync().unwrap();
    }

    let store = Store::open(StoreConfig::new(dir.path())).unwrap();
    let conn = store.connection();
    assert_eq!(conn.size(None, None, None, true, &[]).unwrap(), 1);
    let quad = conn
        .statements(None, None, None, true, &[])
        .unwrap()
        .next()
        .unwrap()
        .unwrap();
    assert_eq!(quad.subject, ex("s"));
}

/// Unrecognized status file content counts as an unclean shutdown, not an
/// error: the store opens, recovers, and resets the marker.
#[test]
fn garbage_status_content_triggers_recovery() {
    init_tracing();
    let dir = tempdir().unwrap();
    {
        let store = Store::open(StoreConfig::new(dir.path())).unwrap();
        let mut conn = store.connection();
        conn.begin().unwrap();
        conn.add_statement(&ex("s"), &ex("p"), &ex("o"), &[]).unwrap();
        conn.commit().unwrap();
    }
    std::fs::write(dir.path().join("txn-status"), b"half-writ\xffen").unwrap();

    let store = Store::open(StoreConfig::new(dir.path())).unwrap();
    assert_eq!(
        store
            .connection()
            .size(None, None, None, true, &[])
            .unwrap(),
        1
    );
    assert_eq!(
        TxnStatusFile::new(dir.path()).unwrap().get().unwrap(),
        TxnStatus::None
    );
}

/// A clean close leaves nothing for recovery to do and the data intact.
#[test]
fn clean_shutdown_reopens_with_all_data() {
    init_tracing();
    let dir = tempdir().unwrap();
    {
        let store = Store::open(StoreConfig::new(dir.path())).unwrap();
        let mut conn = store.connection();
        conn.begin().unwrap();
        for i in 0..10 {
            conn.add_statement(&ex(&format!("s{i}")), &ex("p"), &ex("o"), &[])
                .unwrap();
        }
        conn.commit().unwrap();
        drop(conn);
        store.close().unwrap();
    }

    let store = Store::open(StoreConfig::new(dir.path())).unwrap();
    assert_eq!(
        store
            .connection()
            .size(None, None, None, true, &[])
            .unwrap(),
        10
    );
}
