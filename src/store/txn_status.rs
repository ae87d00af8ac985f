//! Durable transaction status marker.
//!
//! A single tiny file records whether a transaction is in flight so a
//! restart can detect an interrupted one. The file is advisory: the flag
//! bits on the records themselves are the transaction mechanism.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::Result;

/// Name of the status file inside the data directory.
pub const TXN_STATUS_FILE: &str = "txn-status";

/// Lifecycle state of the store-wide transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    /// No transaction is in flight.
    None,
    /// A transaction has begun and not yet finished.
    Active,
    /// A commit is in progress.
    Committing,
    /// A rollback is in progress.
    RollingBack,
    /// The persisted value was unrecognized; only ever observed, never
    /// written.
    Unknown,
}

impl TxnStatus {
    fn as_str(self) -> &'static str {
        match self {
            TxnStatus::None => "NONE",
            TxnStatus::Active => "ACTIVE",
            TxnStatus::Committing => "COMMITTING",
            TxnStatus::RollingBack => "ROLLING_BACK",
            TxnStatus::Unknown => "UNKNOWN",
        }
    }

    fn parse(text: &str) -> Self {
        match text.trim() {
            "NONE" => TxnStatus::None,
            "ACTIVE" => TxnStatus::Active,
            "COMMITTING" => TxnStatus::Committing,
            "ROLLING_BACK" => TxnStatus::RollingBack,
            _ => TxnStatus::Unknown,
        }
    }
}

/// Reader/writer for the on-disk status marker.
#[derive(Debug)]
pub struct TxnStatusFile {
    path: PathBuf,
}

impl TxnStatusFile {
    /// Binds the marker to its file inside `dir`, creating it as `NONE`
    /// when absent.
    pub fn new(dir: &Path) -> Result<Self> {
        let this = Self {
            path: dir.join(TXN_STATUS_FILE),
        };
        if !this.path.exists() {
            this.set(TxnStatus::None)?;
        }
        Ok(this)
    }

    /// Rewrites the marker. The write is truncate-and-replace and synced,
    /// so a reader never observes a torn value.
    pub fn set(&self, status: TxnStatus) -> Result<()> {
        let mut file = File::create(&self.path)?;
        file.write_all(status.as_str().as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Reads the marker. Unrecognized or undecodable content yields
    /// [`TxnStatus::Unknown`] rather than an error.
    pub fn get(&self) -> Result<TxnStatus> {
        let bytes = fs::read(&self.path)?;
        let status = match std::str::from_utf8(&bytes) {
            Ok(text) => TxnStatus::parse(text),
            Err(_) => {
                // Fall back to a lossy decode for legacy platform
                // encodings before giving up.
                let text = String::from_utf8_lossy(&bytes);
                TxnStatus::parse(&text)
            }
        };
        if status == TxnStatus::Unknown {
            warn!(path = %self.path.display(), "unrecognized transaction status");
        }
        Ok(status)
    }
}
