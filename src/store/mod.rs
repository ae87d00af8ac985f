//! Store lifecycle and connection handout.
//!
//! A [`Store`] owns the data directory for as long as it is open: the
//! statement indexes, the interned terms, the namespace map and the
//! directory lock. Sessions talk to it through per-session
//! [`Connection`]s; writers are serialized by a store-wide exclusive
//! transaction lock.

mod connection;
mod lock;
pub mod quads;
pub mod txn_status;

pub use connection::{Connection, StatementCursor};
pub use lock::{DirectoryLock, TxnLock, TxnLockManager};
pub use quads::{QuadFlags, QuadStore, ReadMode};
pub use txn_status::{TxnStatus, TxnStatusFile};

use std::fs;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::ns::NamespaceStore;
use crate::values::{FileValueStore, ValueCacheSizes, ValueStore};

/// What a committed transaction changed, reported to listeners.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeSummary {
    /// At least one statement became newly asserted.
    pub statements_added: bool,
    /// At least one statement was removed.
    pub statements_removed: bool,
}

impl ChangeSummary {
    fn is_empty(&self) -> bool {
        !self.statements_added && !self.statements_removed
    }
}

/// Callback invoked after every committed transaction that changed data.
pub type ChangeListener = Box<dyn Fn(&ChangeSummary) + Send + Sync>;

pub(crate) struct StoreInner {
    pub(crate) config: StoreConfig,
    pub(crate) quads: QuadStore,
    pub(crate) values: Arc<dyn ValueStore>,
    pub(crate) namespaces: NamespaceStore,
    pub(crate) txn_locks: TxnLockManager,
    listeners: Mutex<Vec<ChangeListener>>,
    // Held for the lifetime of the open store, released on drop.
    _dir_lock: DirectoryLock,
}

impl StoreInner {
    pub(crate) fn notify(&self, summary: &ChangeSummary) {
        if summary.is_empty() {
            return;
        }
        for listener in self.listeners.lock().iter() {
            listener(summary);
        }
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if let Err(e) = self.quads.close() {
            warn!(error = %e, "failed to close statement indexes");
        }
        if let Err(e) = self.values.close() {
            warn!(error = %e, "failed to close value store");
        }
        if let Err(e) = self.namespaces.close() {
            warn!(error = %e, "failed to close namespace store");
        }
    }
}

/// A disk-resident, transactional quad store.
///
/// Cloning is cheap and shares the same open store; the backing files are
/// released when the last clone and connection are gone.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Opens (or creates) the store described by `config`.
    ///
    /// Fails when the data directory is unusable, locked by another
    /// process, or contains data from an incompatible schema version. A
    /// transaction interrupted by a crash is rolled back here, before any
    /// connection sees the data.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let dir = &config.data_dir;
        if !dir.exists() {
            fs::create_dir_all(dir).map_err(|e| {
                StoreError::Config(format!(
                    "unable to create data directory {}: {e}",
                    dir.display()
                ))
            })?;
        } else if !dir.is_dir() {
            return Err(StoreError::Config(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
        debug!(dir = %dir.display(), "initializing store");

        let dir_lock = DirectoryLock::acquire(dir)?;
        let namespaces = NamespaceStore::open(dir)?;
        let values = FileValueStore::open(
            dir,
            config.force_sync,
            ValueCacheSizes {
                values: config.value_cache_size,
                value_ids: config.value_id_cache_size,
                namespaces: config.namespace_cache_size,
                namespace_ids: config.namespace_id_cache_size,
            },
        )?;
        let quads = QuadStore::open(dir, &config.index_spec, config.force_sync)?;

        debug!(dir = %dir.display(), "store initialized");
        Ok(Self {
            inner: Arc::new(StoreInner {
                config,
                quads,
                values: Arc::new(values),
                namespaces,
                txn_locks: TxnLockManager::new(),
                listeners: Mutex::new(Vec::new()),
                _dir_lock: dir_lock,
            }),
        })
    }

    /// Opens a connection for one logical session.
    pub fn connection(&self) -> Connection {
        Connection::new(Arc::clone(&self.inner))
    }

    /// Registers a listener invoked after each committed transaction that
    /// added or removed statements.
    pub fn on_change(&self, listener: ChangeListener) {
        self.inner.listeners.lock().push(listener);
    }

    /// The term-interning layer backing this store.
    pub fn values(&self) -> Arc<dyn ValueStore> {
        Arc::clone(&self.inner.values)
    }

    /// Flushes and closes the store. Outstanding connections keep the
    /// files alive until they drop, but no new work should be issued.
    pub fn close(self) -> Result<()> {
        self.inner.quads.close()?;
        self.inner.values.close()?;
        self.inner.namespaces.close()?;
        Ok(())
    }
}
