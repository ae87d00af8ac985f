//! Store construction options.

use std::path::{Path, PathBuf};

/// Consistency contract a connection requests for its transactions.
///
/// The three stronger levels acquire the store-wide exclusive transaction
/// lock up front, serializing all writers. `ReadCommitted` defers locking
/// until the transaction performs its first write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Readers only ever observe committed data; the transaction lock is
    /// taken lazily, on the first write.
    ReadCommitted,
    /// Snapshot semantics via upfront exclusive locking.
    Snapshot,
    /// Repeatable reads via upfront exclusive locking.
    RepeatableRead,
    /// Full serializability via upfront exclusive locking.
    Serializable,
}

impl IsolationLevel {
    /// Whether `begin` must acquire the exclusive transaction lock
    /// immediately rather than on first write.
    pub fn locks_upfront(self) -> bool {
        !matches!(self, IsolationLevel::ReadCommitted)
    }
}

/// Configuration supplied when opening a [`crate::store::Store`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding every store file. Created if absent.
    pub data_dir: PathBuf,
    /// Comma/whitespace-separated index orders, e.g. `"spoc,posc"`.
    /// Empty means the default pair.
    pub index_spec: String,
    /// Whether every mutation is forced to disk immediately. Off by
    /// default; enabling it hurts write throughput considerably.
    pub force_sync: bool,
    /// Isolation level used by `Connection::begin`.
    pub default_isolation: IsolationLevel,
    /// Capacity of the id-to-term cache in the value store.
    pub value_cache_size: usize,
    /// Capacity of the term-to-id cache in the value store.
    pub value_id_cache_size: usize,
    /// Capacity of the id-to-namespace cache in the value store.
    pub namespace_cache_size: usize,
    /// Capacity of the namespace-to-id cache in the value store.
    pub namespace_id_cache_size: usize,
}

impl StoreConfig {
    /// Creates a configuration with defaults for everything but the
    /// data directory.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            index_spec: String::new(),
            force_sync: false,
            default_isolation: IsolationLevel::Serializable,
            value_cache_size: 512,
            value_id_cache_size: 128,
            namespace_cache_size: 64,
            namespace_id_cache_size: 32,
        }
    }

    /// Sets the index order specification.
    pub fn index_spec(mut self, spec: impl Into<String>) -> Self {
        self.index_spec = spec.into();
        self
    }

    /// Enables or disables forced syncing of every mutation.
    pub fn force_sync(mut self, enabled: bool) -> Self {
        self.force_sync = enabled;
        self
    }

    /// Sets the isolation level used by `Connection::begin`.
    pub fn default_isolation(mut self, level: IsolationLevel) -> Self {
        self.default_isolation = level;
        self
    }

    /// Sets the id-to-term cache capacity.
    pub fn value_cache_size(mut self, capacity: usize) -> Self {
        self.value_cache_size = capacity;
        self
    }

    /// Sets the term-to-id cache capacity.
    pub fn value_id_cache_size(mut self, capacity: usize) -> Self {
        self.value_id_cache_size = capacity;
        self
    }

    /// Sets the id-to-namespace cache capacity.
    pub fn namespace_cache_size(mut self, capacity: usize) -> Self {
        self.namespace_cache_size = capacity;
        self
    }

    /// Sets the namespace-to-id cache capacity.
    pub fn namespace_id_cache_size(mut self, capacity: usize) -> Self {
        self.namespace_id_cache_size = capacity;
        self
    }
}
