//! Transaction scenarios against a full store: round trips, explicitness
//! handling, and commit/rollback convergence.

use proptest::prelude::*;
use quadra::index::{RecordIterator, FLAG_IDX};
use quadra::store::{QuadFlags, QuadStore, ReadMode};
use quadra::{Quad, Result, Store, StoreConfig, Term};
use tempfile::tempdir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn ex(name: &str) -> Term {
    Term::iri(format!("http://example.org/{name}"))
}

fn all_statements(conn: &quadra::Connection) -> Vec<Quad> {
    conn.statements(None, None, None, true, &[])
        .unwrap()
        .collect::<Result<_>>()
        .unwrap()
}

#[test]
fn round_trip_explicitness_follows_the_last_commit() {
    init_tracing();
    let dir = tempdir().unwrap();
    let store = Store::open(StoreConfig::new(dir.path())).unwrap();
    let mut conn = store.connection();

    conn.begin().unwrap();
    conn.add_inferred_statement(&ex("s"), &ex("p"), &ex("o"), &[])
        .unwrap();
    conn.commit().unwrap();
    assert_eq!(conn.size(None, None, None, false, &[]).unwrap(), 0);

    // Promote to explicit in a second transaction.
    conn.begin().unwrap();
    conn.add_statement(&ex("s"), &ex("p"), &ex("o"), &[]).unwrap();
    conn.commit().unwrap();
    assert_eq!(conn.size(None, None, None, false, &[]).unwrap(), 1);
    assert_eq!(conn.size(None, None, None, true, &[]).unwrap(), 1);
}

#[test]
fn removal_becomes_visible_only_at_commit() {
    init_tracing();
    let dir = tempdir().unwrap();
    let store = Store::open(StoreConfig::new(dir.path())).unwrap();
    let mut writer = store.connection();
    let reader = store.connection();

    writer.begin().unwrap();
    writer.add_statement(&ex("s"), &ex("p"), &ex("o"), &[]).unwrap();
    writer.commit().unwrap();

    writer.begin().unwrap();
    assert_eq!(
        writer
            .remove_statements(Some(&ex("s")), None, None, &[])
            .unwrap(),
        1
    );

    // A committed-only reader still sees the statement; the removing
    // transaction does not.
    assert_eq!(all_statements(&reader).len(), 1);
    assert!(writer
        .statements(Some(&ex("s")), None, None, true, &[])
        .unwrap()
        .next()
        .is_none());

    writer.commit().unwrap();
    assert!(all_statements(&reader).is_empty());
}

#[test]
fn removing_an_explicit_statement_as_inferred_changes_nothing() {
    init_tracing();
    let dir = tempdir().unwrap();
    let store = Store::open(StoreConfig::new(dir.path())).unwrap();
    let mut conn = store.connection();

    conn.begin().unwrap();
    conn.add_statement(&ex("s"), &ex("p"), &ex("o"), &[]).unwrap();
    conn.commit().unwrap();

    conn.begin().unwrap();
    assert_eq!(
        conn.remove_inferred_statements(Some(&ex("s")), None, None, &[])
            .unwrap(),
        0
    );
    conn.commit().unwrap();
    assert_eq!(conn.size(None, None, None, true, &[]).unwrap(), 1);
}

#[test]
fn re_adding_a_removed_statement_within_one_transaction() {
    init_tracing();
    let dir = tempdir().unwrap();
    let store = Store::open(StoreConfig::new(dir.path())).unwrap();
    let mut conn = store.connection();

    conn.begin().unwrap();
    conn.add_statement(&ex("s"), &ex("p"), &ex("o"), &[]).unwrap();
    conn.commit().unwrap();

    conn.begin().unwrap();
    conn.remove_statements(Some(&ex("s")), None, None, &[]).unwrap();
    assert!(conn.add_statement(&ex("s"), &ex("p"), &ex("o"), &[]).unwrap());
    conn.commit().unwrap();

    assert_eq!(conn.size(None, None, None, true, &[]).unwrap(), 1);
}

#[test]
fn rollback_restores_the_visible_state() {
    init_tracing();
    let dir = tempdir().unwrap();
    let store = Store::open(StoreConfig::new(dir.path())).unwrap();
    let mut conn = store.connection();

    conn.begin().unwrap();
    conn.add_statement(&ex("keep"), &ex("p"), &ex("o"), &[]).unwrap();
    conn.commit().unwrap();
    let before = all_statements(&store.connection());

    conn.begin().unwrap();
    conn.add_statement(&ex("temp"), &ex("p"), &ex("o"), &[]).unwrap();
    conn.remove_statements(Some(&ex("keep")), None, None, &[])
        .unwrap();
    conn.rollback().unwrap();

    assert_eq!(all_statements(&store.connection()), before);
}

// Convergence under arbitrary operation mixes, driven at the tuple-store
// layer where flag bytes are observable.

#[derive(Debug, Clone)]
enum Op {
    Add {
        key: (i32, i32, i32, i32),
        explicit: bool,
    },
    Remove {
        key: (i32, i32, i32, i32),
        explicit: bool,
    },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let key = (1..6i32, 1..4i32, 1..4i32, 0..3i32);
    prop_oneof![
        (key.clone(), any::<bool>()).prop_map(|(key, explicit)| Op::Add { key, explicit }),
        (key, any::<bool>()).prop_map(|(key, explicit)| Op::Remove { key, explicit }),
    ]
}

fn apply(store: &QuadStore, ops: &[Op]) {
    for op in ops {
        match *op {
            Op::Add {
                key: (s, p, o, c),
                explicit,
            } => {
                store.store_quad(s, p, o, c, explicit).unwrap();
            }
            Op::Remove {
                key: (s, p, o, c),
                explicit,
            } => {
                store.remove_quads_filtered(s, p, o, c, explicit).unwrap();
            }
        }
    }
}

fn visible_keys(store: &QuadStore) -> Vec<(Vec<u8>, u8)> {
    let mut iter = store.quads(-1, -1, -1, -1, ReadMode::Committed).unwrap();
    let mut keys = Vec::new();
    while let Some(rec) = iter.next().unwrap() {
        keys.push((rec[..FLAG_IDX].to_vec(), rec[FLAG_IDX]));
    }
    keys.sort();
    keys
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn commit_clears_every_transaction_flag(ops in proptest::collection::vec(op_strategy(), 1..40)) {
        let dir = tempdir().unwrap();
        let store = QuadStore::open(dir.path(), "spoc,posc", false).unwrap();

        store.start_transaction().unwrap();
        apply(&store, &ops);
        store.commit().unwrap();

        let mut iter = store.quads(-1, -1, -1, -1, ReadMode::Committed).unwrap();
        while let Some(rec) = iter.next().unwrap() {
            let f = QuadFlags::of(&rec);
            prop_assert!(!f.added && !f.removed && !f.toggled);
        }
    }

    #[test]
    fn rollback_is_a_no_op_on_the_committed_state(
        committed in proptest::collection::vec(op_strategy(), 1..20),
        rolled_back in proptest::collection::vec(op_strategy(), 1..20),
    ) {
        let dir = tempdir().unwrap();
        let store = QuadStore::open(dir.path(), "spoc,posc", false).unwrap();

        store.start_transaction().unwrap();
        apply(&store, &committed);
        store.commit().unwrap();
        let before = visible_keys(&store);

        store.start_transaction().unwrap();
        apply(&store, &rolled_back);
        store.rollback().unwrap();

        prop_assert_eq!(visible_keys(&store), before);
    }
}
