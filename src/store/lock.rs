//! Store-level locks: the process directory lock and the exclusive
//! transaction lock.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use tracing::{debug, warn};

use crate::error::{Result, StoreError};

/// Name of the lock file inside the data directory.
pub const LOCK_FILE: &str = "lock";

/// Exclusive ownership of a data directory for the lifetime of an open
/// store.
///
/// Acquisition fails fast when another store instance holds the directory;
/// it never blocks. The lock file carries the owning PID for diagnostics
/// and is removed on drop.
#[derive(Debug)]
pub struct DirectoryLock {
    path: PathBuf,
}

impl DirectoryLock {
    /// Acquires the lock for `dir` or fails with [`StoreError::Locked`].
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StoreError::Locked(format!(
                    "{} exists; is another process using this store? Remove the file if not",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(file, "{}", std::process::id())?;
        file.sync_data()?;
        debug!(path = %path.display(), "data directory locked");
        Ok(Self { path })
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
        }
    }
}

/// An owned guard on the store-wide exclusive transaction lock.
pub type TxnLock = ArcMutexGuard<RawMutex, ()>;

/// Hands out the store-wide exclusive transaction lock.
///
/// Acquisition blocks until the current holder releases; there is no error
/// path. At most one write transaction is in flight per store while the
/// guard lives.
#[derive(Clone, Default)]
pub struct TxnLockManager {
    lock: Arc<Mutex<()>>,
}

impl TxnLockManager {
    /// Creates a manager with the lock released.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the exclusive lock is available and returns an owned
    /// guard.
    pub fn acquire(&self) -> TxnLock {
        self.lock.lock_arc()
    }

    /// Takes the lock only when it is free.
    pub fn try_acquire(&self) -> Option<TxnLock> {
        self.lock.try_lock_arc()
    }
}
