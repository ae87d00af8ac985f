//! Durable ordered index over fixed-length statement records.
//!
//! Records live in an ordered in-memory map keyed by their permuted key
//! bytes; the flag byte rides along as the value. Durability comes from a
//! checksummed whole-index snapshot file written on `sync` (or after every
//! mutation when force-sync is on). The surface is the black-box contract
//! the tuple store consumes; a paged structure could replace this file
//! without the store noticing.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, StoreError};

use super::{
    matches, FieldOrder, OrderedKey, QuadRecord, RecordIterator, FLAG_IDX, RECORD_LEN,
};

const MAGIC: &[u8; 4] = b"QIDX";
const FORMAT_VERSION: u16 = 1;
// magic (4) + version (2) + reserved (2) + record count (8) + crc32 (4)
const HEADER_LEN: usize = 20;

struct State {
    map: BTreeMap<OrderedKey, u8>,
    dirty: bool,
}

struct Shared {
    order: FieldOrder,
    path: PathBuf,
    force_sync: bool,
    state: Mutex<State>,
}

/// An ordered, disk-backed store of statement records under one field order.
///
/// Cheap to clone; clones share the same underlying index.
#[derive(Clone)]
pub struct RecordIndex {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RecordIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordIndex")
            .field("order", &self.shared.order)
            .finish_non_exhaustive()
    }
}

impl RecordIndex {
    /// Opens the index file at `path`, creating an empty index when the
    /// file does not exist yet.
    pub fn open(path: impl AsRef<Path>, order: FieldOrder, force_sync: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let map = if path.exists() {
            load_snapshot(&path, &order)?
        } else {
            BTreeMap::new()
        };
        debug!(index = %order, records = map.len(), "index opened");
        Ok(Self {
            shared: Arc::new(Shared {
                order,
                path,
                force_sync,
                state: Mutex::new(State { map, dirty: false }),
            }),
        })
    }

    /// The field order this index sorts by.
    pub fn order(&self) -> &FieldOrder {
        &self.shared.order
    }

    /// Inserts a record, returning the previously stored record with the
    /// same key bytes, if any. An insert with identical bytes is a no-op.
    pub fn insert(&self, record: &QuadRecord) -> Result<Option<QuadRecord>> {
        let key = self.shared.order.permuted_key(record);
        let mut state = self.shared.state.lock();
        let old = state.map.insert(key, record[FLAG_IDX]);
        if old != Some(record[FLAG_IDX]) {
            state.dirty = true;
            if self.shared.force_sync {
                persist(&self.shared, &mut state)?;
            }
        }
        Ok(old.map(|flags| self.shared.order.canonical(&key, flags)))
    }

    /// Removes the record with the same key bytes, returning it if present.
    pub fn remove(&self, record: &QuadRecord) -> Result<Option<QuadRecord>> {
        let key = self.shared.order.permuted_key(record);
        let mut state = self.shared.state.lock();
        let old = state.map.remove(&key);
        if old.is_some() {
            state.dirty = true;
            if self.shared.force_sync {
                persist(&self.shared, &mut state)?;
            }
        }
        Ok(old.map(|flags| self.shared.order.canonical(&key, flags)))
    }

    /// Point lookup by key bytes. The probe's flag byte is ignored.
    pub fn get(&self, record: &QuadRecord) -> Result<Option<QuadRecord>> {
        let key = self.shared.order.permuted_key(record);
        let state = self.shared.state.lock();
        Ok(state
            .map
            .get(&key)
            .map(|&flags| self.shared.order.canonical(&key, flags)))
    }

    /// Cursor over every record, in this index's order.
    pub fn iter_all(&self) -> Box<dyn RecordIterator> {
        let keys: Vec<OrderedKey> = self.shared.state.lock().map.keys().copied().collect();
        Box::new(IndexCursor {
            shared: Arc::clone(&self.shared),
            keys,
            pos: 0,
            filter: None,
            last: None,
        })
    }

    /// Sequential scan yielding records that match `key` under `mask`.
    pub fn iter_matching(&self, key: QuadRecord, mask: QuadRecord) -> Box<dyn RecordIterator> {
        let keys: Vec<OrderedKey> = self.shared.state.lock().map.keys().copied().collect();
        Box::new(IndexCursor {
            shared: Arc::clone(&self.shared),
            keys,
            pos: 0,
            filter: Some((key, mask)),
            last: None,
        })
    }

    /// Ranged scan over `[min, max]` yielding records that match `key`
    /// under `mask`.
    pub fn iter_range(
        &self,
        key: QuadRecord,
        mask: QuadRecord,
        min: &QuadRecord,
        max: &QuadRecord,
    ) -> Box<dyn RecordIterator> {
        let lo = self.shared.order.permuted_key(min);
        let hi = self.shared.order.permuted_key(max);
        let keys: Vec<OrderedKey> = self
            .shared
            .state
            .lock()
            .map
            .range(lo..=hi)
            .map(|(k, _)| *k)
            .collect();
        Box::new(IndexCursor {
            shared: Arc::clone(&self.shared),
            keys,
            pos: 0,
            filter: Some((key, mask)),
            last: None,
        })
    }

    /// Number of records in the range `[min, max]`, flag bytes ignored.
    pub fn range_count(&self, min: &QuadRecord, max: &QuadRecord) -> u64 {
        let lo = self.shared.order.permuted_key(min);
        let hi = self.shared.order.permuted_key(max);
        self.shared.state.lock().map.range(lo..=hi).count() as u64
    }

    /// Estimated total record count.
    pub fn value_count_estimate(&self) -> u64 {
        self.shared.state.lock().map.len() as u64
    }

    /// Removes every record.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if !state.map.is_empty() {
            state.map.clear();
            state.dirty = true;
            if self.shared.force_sync {
                persist(&self.shared, &mut state)?;
            }
        }
        Ok(())
    }

    /// Writes the current contents to disk if anything changed.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.dirty {
            persist(&self.shared, &mut state)?;
        }
        Ok(())
    }

    /// Syncs and releases the index.
    pub fn close(&self) -> Result<()> {
        self.sync()
    }

    /// Deletes the backing file. The index must no longer be used.
    pub fn drop_file(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.map.clear();
        state.dirty = false;
        if self.shared.path.exists() {
            fs::remove_file(&self.shared.path)?;
        }
        Ok(())
    }
}

fn load_snapshot(path: &Path, order: &FieldOrder) -> Result<BTreeMap<OrderedKey, u8>> {
    let data = fs::read(path)?;
    if data.len() < HEADER_LEN {
        return Err(StoreError::Corruption(format!(
            "index file {} shorter than its header",
            path.display()
        )));
    }
    if &data[..4] != MAGIC {
        return Err(StoreError::Corruption(format!(
            "index file {} has a bad magic number",
            path.display()
        )));
    }
    let version = u16::from_le_bytes([data[4], data[5]]);
    if version != FORMAT_VERSION {
        return Err(StoreError::Corruption(format!(
            "unsupported index format version {version} in {}",
            path.display()
        )));
    }
    let count = u64::from_le_bytes(data[8..16].try_into().expect("slice is 8 bytes"));
    let stored_crc = u32::from_le_bytes(data[16..20].try_into().expect("slice is 4 bytes"));
    let body = &data[HEADER_LEN..];
    let expected = usize::try_from(count)
        .ok()
        .and_then(|n| n.checked_mul(RECORD_LEN))
        .ok_or_else(|| StoreError::Corruption("index record count overflow".into()))?;
    if body.len() != expected {
        return Err(StoreError::Corruption(format!(
            "index file {} truncated: expected {expected} record bytes, found {}",
            path.display(),
            body.len()
        )));
    }
    if crc32fast::hash(body) != stored_crc {
        return Err(StoreError::Corruption(format!(
            "index file {} failed its checksum",
            path.display()
        )));
    }

    let mut map = BTreeMap::new();
    for chunk in body.chunks_exact(RECORD_LEN) {
        let record: QuadRecord = chunk.try_into().expect("chunk is RECORD_LEN bytes");
        map.insert(order.permuted_key(&record), record[FLAG_IDX]);
    }
    Ok(map)
}

fn persist(shared: &Shared, state: &mut State) -> Result<()> {
    let mut body = Vec::with_capacity(state.map.len() * RECORD_LEN);
    for (key, &flags) in &state.map {
        body.extend_from_slice(&shared.order.canonical(key, flags));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&(state.map.len() as u64).to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    buf.extend_from_slice(&body);

    let dir = shared.path.parent().ok_or_else(|| {
        StoreError::Config(format!("index path {} has no parent", shared.path.display()))
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&buf)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(&shared.path)
        .map_err(|e| StoreError::Io(e.error))?;

    state.dirty = false;
    Ok(())
}

struct IndexCursor {
    shared: Arc<Shared>,
    keys: Vec<OrderedKey>,
    pos: usize,
    filter: Option<(QuadRecord, QuadRecord)>,
    last: Option<OrderedKey>,
}

impl RecordIterator for IndexCursor {
    fn next(&mut self) -> Result<Option<QuadRecord>> {
        while self.pos < self.keys.len() {
            let key = self.keys[self.pos];
            self.pos += 1;
            let flags = match self.shared.state.lock().map.get(&key) {
                Some(&flags) => flags,
                // Removed since the cursor was opened.
                None => continue,
            };
            let record = self.shared.order.canonical(&key, flags);
            if let Some((search, mask)) = &self.filter {
                if !matches(&record, search, mask) {
                    continue;
                }
            }
            self.last = Some(key);
            return Ok(Some(record));
        }
        Ok(None)
    }

    fn set(&mut self, record: QuadRecord) -> Result<()> {
        let last = self.last.ok_or_else(|| {
            StoreError::InvalidArgument("cursor set called before next".into())
        })?;
        if self.shared.order.permuted_key(&record) != last {
            return Err(StoreError::InvalidArgument(
                "cursor set may only change the flag byte".into(),
            ));
        }
        let mut state = self.shared.state.lock();
        state.map.insert(last, record[FLAG_IDX]);
        state.dirty = true;
        if self.shared.force_sync {
            persist(&self.shared, &mut state)?;
        }
        Ok(())
    }
}
