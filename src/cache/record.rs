//! Transaction-scoped buffers of statement records.
//!
//! A record cache accumulates the records touched by the running
//! transaction so commit and rollback can reconcile flags without scanning
//! every index. The cache is discardable by construction: when the dirty
//! set outgrows the configured limit the cache invalidates itself and the
//! store falls back to full-index scans, which is slower but correct.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tempfile::{NamedTempFile, TempDir};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::index::{FieldOrder, QuadRecord, RecordIndex, RecordIterator, RECORD_LEN};

const FILE_MAGIC: &[u8; 4] = b"QRCF";
const FILE_FORMAT_VERSION: u16 = 1;
const FILE_HEADER_LEN: u64 = 6;

/// A discardable, append-until-cleared bag of statement records.
///
/// Reading or appending after `discard`, or reading an invalidated cache,
/// is a programming error and panics.
pub trait RecordCache: Send {
    /// Appends a record. Silently does nothing once the cache has gone
    /// invalid.
    fn store_record(&mut self, record: &QuadRecord) -> Result<()>;

    /// Appends every record of another cache, subject to the same
    /// invalidity rule.
    fn store_all(&mut self, other: &mut dyn RecordCache) -> Result<()> {
        let mut iter = other.records()?;
        while let Some(record) = iter.next()? {
            self.store_record(&record)?;
        }
        Ok(())
    }

    /// Cursor over the buffered records. Iteration order is total and
    /// repeatable for a given snapshot; which order depends on the variant.
    fn records<'a>(&'a mut self) -> Result<Box<dyn RecordIterator + 'a>>;

    /// Number of records stored so far.
    fn record_count(&self) -> u64;

    /// `false` once the record count has reached the configured limit.
    fn is_valid(&self) -> bool;

    /// Releases the backing storage. Irreversible.
    fn discard(&mut self) -> Result<()>;
}

/// Record cache backed by a flat scratch file, iterating in insertion
/// order.
pub struct FileRecordCache {
    file: Option<NamedTempFile>,
    count: u64,
    max_records: u64,
}

impl FileRecordCache {
    /// Creates an unbounded sequential cache with its scratch file in
    /// `dir`.
    pub fn new(dir: &Path) -> Result<Self> {
        Self::with_limit(dir, u64::MAX)
    }

    /// Creates a sequential cache that invalidates after `max_records`.
    pub fn with_limit(dir: &Path, max_records: u64) -> Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("records-")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        file.write_all(FILE_MAGIC)?;
        file.write_all(&FILE_FORMAT_VERSION.to_le_bytes())?;
        Ok(Self {
            file: Some(file),
            count: 0,
            max_records,
        })
    }

    fn file_mut(&mut self) -> &mut NamedTempFile {
        self.file
            .as_mut()
            .expect("record cache used after discard")
    }

    fn verify_header(file: &mut File) -> Result<()> {
        file.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; FILE_HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        if &header[..4] != FILE_MAGIC {
            return Err(StoreError::Corruption(
                "record cache file has a bad magic number".into(),
            ));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != FILE_FORMAT_VERSION {
            return Err(StoreError::Corruption(format!(
                "unsupported record cache format version {version}"
            )));
        }
        Ok(())
    }
}

impl RecordCache for FileRecordCache {
    fn store_record(&mut self, record: &QuadRecord) -> Result<()> {
        if !self.is_valid() {
            return Ok(());
        }
        let file = self.file_mut();
        file.seek(SeekFrom::End(0))?;
        file.write_all(record)?;
        self.count += 1;
        if !self.is_valid() {
            debug!(max_records = self.max_records, "record cache invalidated");
        }
        Ok(())
    }

    fn records<'a>(&'a mut self) -> Result<Box<dyn RecordIterator + 'a>> {
        assert!(self.is_valid(), "records() called on an invalid cache");
        let remaining = self.count;
        let file = self.file_mut().as_file_mut();
        file.flush()?;
        Self::verify_header(file)?;
        Ok(Box::new(FileCacheCursor {
            file,
            remaining,
            last_pos: None,
        }))
    }

    fn record_count(&self) -> u64 {
        self.count
    }

    fn is_valid(&self) -> bool {
        self.count < self.max_records
    }

    fn discard(&mut self) -> Result<()> {
        // Dropping the handle deletes the scratch file.
        self.file = None;
        Ok(())
    }
}

struct FileCacheCursor<'a> {
    file: &'a mut File,
    remaining: u64,
    last_pos: Option<u64>,
}

impl RecordIterator for FileCacheCursor<'_> {
    fn next(&mut self) -> Result<Option<QuadRecord>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let pos = self.file.stream_position()?;
        let mut record = [0u8; RECORD_LEN];
        self.file.read_exact(&mut record)?;
        self.remaining -= 1;
        self.last_pos = Some(pos);
        Ok(Some(record))
    }

    fn set(&mut self, record: QuadRecord) -> Result<()> {
        let pos = self.last_pos.ok_or_else(|| {
            StoreError::InvalidArgument("cursor set called before next".into())
        })?;
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.write_all(&record)?;
        self.file.seek(SeekFrom::Start(pos + RECORD_LEN as u64))?;
        Ok(())
    }
}

/// Record cache backed by its own ordered index, iterating in that index's
/// field order. Used when the caller reconciles flags against the main
/// indexes and wants matching iteration order.
pub struct IndexRecordCache {
    index: Option<RecordIndex>,
    _dir: TempDir,
    count: u64,
    max_records: u64,
}

impl IndexRecordCache {
    /// Creates a sorted cache inside a private temp directory under
    /// `parent`, invalidating after `max_records`.
    pub fn new(parent: &Path, order: FieldOrder, max_records: u64) -> Result<Self> {
        let dir = TempDir::with_prefix_in("txncache-", parent)?;
        let index = RecordIndex::open(dir.path().join("records.dat"), order, false)?;
        Ok(Self {
            index: Some(index),
            _dir: dir,
            count: 0,
            max_records,
        })
    }

    fn index(&self) -> &RecordIndex {
        self.index
            .as_ref()
            .expect("record cache used after discard")
    }
}

impl RecordCache for IndexRecordCache {
    fn store_record(&mut self, record: &QuadRecord) -> Result<()> {
        if !self.is_valid() {
            return Ok(());
        }
        self.index().insert(record)?;
        self.count += 1;
        if !self.is_valid() {
            debug!(max_records = self.max_records, "record cache invalidated");
        }
        Ok(())
    }

    fn records<'a>(&'a mut self) -> Result<Box<dyn RecordIterator + 'a>> {
        assert!(self.is_valid(), "records() called on an invalid cache");
        Ok(self.index().iter_all())
    }

    fn record_count(&self) -> u64 {
        self.count
    }

    fn is_valid(&self) -> bool {
        self.count < self.max_records
    }

    fn discard(&mut self) -> Result<()> {
        // The temp dir removes the backing file when the cache drops.
        self.index = None;
        Ok(())
    }
}
