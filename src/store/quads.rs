//! Multi-index statement storage and the flag-based transaction protocol.
//!
//! Statements are 17-byte records of four term identifiers plus one flag
//! byte, fanned out to one ordered index per configured field order.
//! Transactions are encoded in the flag byte itself: pending adds, pending
//! removals and pending explicitness toggles ride on the records until
//! commit or rollback reconciles them, so no separate undo log exists.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{FileRecordCache, IndexRecordCache, RecordCache};
use crate::error::{Result, StoreError};
use crate::index::{
    put_id, Field, FieldOrder, QuadRecord, RecordIndex, RecordIterator, CONTEXT_IDX, FLAG_IDX,
    OBJ_IDX, PRED_IDX, RECORD_LEN, SUBJ_IDX,
};
use crate::model::TermId;

use super::txn_status::{TxnStatus, TxnStatusFile};

/// Name of the metadata file inside the data directory.
pub const PROPERTIES_FILE: &str = "quads.prop";

const VERSION_KEY: &str = "version";
const INDEXES_KEY: &str = "indexes";

/// Current schema version. Version 10 introduced the context field and the
/// transaction flags; older layouts are incompatible.
pub const SCHEME_VERSION: u32 = 10;

/// Flag bit: the statement was explicitly asserted rather than inferred.
pub const EXPLICIT_FLAG: u8 = 0x1;
/// Flag bit: the statement was added in the currently active transaction
/// and is invisible to other readers.
pub const ADDED_FLAG: u8 = 0x2;
/// Flag bit: the statement was removed in the currently active transaction
/// but not yet physically discarded.
pub const REMOVED_FLAG: u8 = 0x4;
/// Flag bit: the explicit flag is pending a flip at commit.
pub const TOGGLE_EXPLICIT_FLAG: u8 = 0x8;

const TXN_FLAGS: u8 = ADDED_FLAG | REMOVED_FLAG | TOGGLE_EXPLICIT_FLAG;

/// Typed view of a record's flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuadFlags {
    /// Explicitly asserted rather than inferred.
    pub explicit: bool,
    /// Pending add from the active transaction.
    pub added: bool,
    /// Pending removal from the active transaction.
    pub removed: bool,
    /// Pending explicitness flip from the active transaction.
    pub toggled: bool,
}

impl QuadFlags {
    /// Decodes the flag byte of a record.
    pub fn of(record: &QuadRecord) -> Self {
        Self::from_byte(record[FLAG_IDX])
    }

    /// Decodes a raw flag byte. Reserved bits are ignored.
    pub fn from_byte(byte: u8) -> Self {
        Self {
            explicit: byte & EXPLICIT_FLAG != 0,
            added: byte & ADDED_FLAG != 0,
            removed: byte & REMOVED_FLAG != 0,
            toggled: byte & TOGGLE_EXPLICIT_FLAG != 0,
        }
    }

    /// Encodes back into the on-disk bit layout.
    pub fn to_byte(self) -> u8 {
        let mut byte = 0;
        if self.explicit {
            byte |= EXPLICIT_FLAG;
        }
        if self.added {
            byte |= ADDED_FLAG;
        }
        if self.removed {
            byte |= REMOVED_FLAG;
        }
        if self.toggled {
            byte |= TOGGLE_EXPLICIT_FLAG;
        }
        byte
    }
}

/// Which pending transaction state a read should see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Hide records added by the active transaction; pending removals are
    /// still visible. The view other connections get.
    Committed,
    /// Hide records removed by the active transaction; pending adds are
    /// visible. The view inside the owning transaction.
    Transaction,
}

struct TxnState {
    added: bool,
    removed: bool,
    cache: Option<Box<dyn RecordCache>>,
}

/// File-based indexed storage of statements as quads of term identifiers.
///
/// Identifier `0` in the context position denotes the default graph and
/// maps to no interned term. In every pattern argument, a negative
/// identifier is a wildcard.
pub struct QuadStore {
    dir: PathBuf,
    indexes: Vec<RecordIndex>,
    status: TxnStatusFile,
    txn: Mutex<TxnState>,
}

impl std::fmt::Debug for QuadStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuadStore")
            .field("dir", &self.dir)
            .field("indexes", &self.indexes)
            .finish_non_exhaustive()
    }
}

impl QuadStore {
    /// Opens the statement indexes inside `dir`, creating or reconciling
    /// them against the configured index order list. Detects and recovers
    /// an interrupted transaction left behind by a crash.
    pub fn open(dir: &Path, index_spec: &str, force_sync: bool) -> Result<Self> {
        let prop_path = dir.join(PROPERTIES_FILE);
        let mut properties = if prop_path.exists() {
            let properties = load_properties(&prop_path)?;
            check_version(&properties)?;
            properties
        } else {
            Vec::new()
        };

        let mut orders = parse_index_orders(index_spec)?;
        let spec_string = if orders.is_empty() {
            info!("no indexes specified, defaulting to: spoc, posc");
            orders = vec![
                FieldOrder::parse("spoc").expect("literal order"),
                FieldOrder::parse("posc").expect("literal order"),
            ];
            "spoc,posc".to_string()
        } else {
            orders
                .iter()
                .map(|o| o.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };

        reindex(dir, &orders, &properties, force_sync)?;

        let version_ok = get_property(&properties, VERSION_KEY)
            .map(|v| v == SCHEME_VERSION.to_string())
            .unwrap_or(false);
        let indexes_ok = get_property(&properties, INDEXES_KEY)
            .map(|v| v == spec_string)
            .unwrap_or(false);
        if !version_ok || !indexes_ok {
            set_property(&mut properties, VERSION_KEY, &SCHEME_VERSION.to_string());
            set_property(&mut properties, INDEXES_KEY, &spec_string);
            store_properties(&prop_path, &properties)?;
        }

        let mut indexes = Vec::with_capacity(orders.len());
        for order in orders {
            debug!(index = %order, "activating index");
            indexes.push(RecordIndex::open(
                index_file(dir, &order),
                order,
                force_sync,
            )?);
        }

        let status = TxnStatusFile::new(dir)?;
        let store = Self {
            dir: dir.to_path_buf(),
            indexes,
            status,
            txn: Mutex::new(TxnState {
                added: false,
                removed: false,
                cache: None,
            }),
        };

        let observed = store.status.get()?;
        if observed != TxnStatus::None {
            warn!(
                status = ?observed,
                "detected an interrupted transaction, rolling back pending changes"
            );
            store.recover()?;
            store.status.set(TxnStatus::None)?;
        }

        Ok(store)
    }

    /// Cursor over statements matching the pattern under a read mode.
    pub fn quads(
        &self,
        subj: TermId,
        pred: TermId,
        obj: TermId,
        context: TermId,
        mode: ReadMode,
    ) -> Result<Box<dyn RecordIterator>> {
        let mask = match mode {
            ReadMode::Transaction => REMOVED_FLAG,
            ReadMode::Committed => ADDED_FLAG,
        };
        self.quads_with_flags(subj, pred, obj, context, 0, mask)
    }

    /// Cursor over statements matching the pattern, additionally filtered
    /// to explicit statements when `explicit` is set.
    ///
    /// Under [`ReadMode::Transaction`] the explicit filter accounts for
    /// pending toggles: a record passes when its stored explicit bit
    /// differs from its toggle bit, i.e. by its *effective* explicitness.
    pub fn quads_filtered(
        &self,
        subj: TermId,
        pred: TermId,
        obj: TermId,
        context: TermId,
        explicit: bool,
        mode: ReadMode,
    ) -> Result<Box<dyn RecordIterator>> {
        let mut flags = 0;
        let mut flags_mask = 0;
        match mode {
            ReadMode::Transaction => {
                flags_mask |= REMOVED_FLAG;
                // Explicitness is decided by the filter below.
            }
            ReadMode::Committed => {
                flags_mask |= ADDED_FLAG;
                if explicit {
                    flags |= EXPLICIT_FLAG;
                    flags_mask |= EXPLICIT_FLAG;
                }
            }
        }

        let iter = self.quads_with_flags(subj, pred, obj, context, flags, flags_mask)?;
        if mode == ReadMode::Transaction && explicit {
            Ok(Box::new(EffectiveExplicitFilter { inner: iter }))
        } else {
            Ok(iter)
        }
    }

    /// All statements from a context-leading index, so equal contexts are
    /// adjacent. `None` when no configured index sorts by context first.
    pub fn quads_ordered_by_context(
        &self,
        mode: ReadMode,
    ) -> Result<Option<Box<dyn RecordIterator>>> {
        let index = match self
            .indexes
            .iter()
            .find(|index| index.order().leading() == Field::Context)
        {
            Some(index) => index,
            None => return Ok(None),
        };
        let key = [0u8; RECORD_LEN];
        let mut mask = [0u8; RECORD_LEN];
        mask[FLAG_IDX] = match mode {
            ReadMode::Transaction => REMOVED_FLAG,
            ReadMode::Committed => ADDED_FLAG,
        };
        Ok(Some(index.iter_matching(key, mask)))
    }

    /// Estimated number of statements matching the pattern, flag states
    /// ignored. Used for join-order decisions, so speed beats precision.
    pub fn cardinality(
        &self,
        subj: TermId,
        pred: TermId,
        obj: TermId,
        context: TermId,
    ) -> Result<u64> {
        let (best, best_score) = self.best_index(subj, pred, obj, context);
        if best_score > 0 {
            let min = min_record(subj, pred, obj, context);
            let max = max_record(subj, pred, obj, context);
            Ok(best.range_count(&min, &max))
        } else {
            Ok(best.value_count_estimate())
        }
    }

    /// Flags the statement as added, or reconciles its flags with an
    /// existing record, and fans the result out to every index.
    ///
    /// Returns `true` when the statement is a new logical fact: it was
    /// absent, or it had been removed earlier in this transaction.
    ///
    /// # Panics
    ///
    /// Panics when no transaction is active.
    pub fn store_quad(
        &self,
        subj: TermId,
        pred: TermId,
        obj: TermId,
        context: TermId,
        explicit: bool,
    ) -> Result<bool> {
        let mut txn = self.txn.lock();
        assert!(
            txn.cache.is_some(),
            "store_quad called outside a transaction"
        );

        let mut data = make_record(subj, pred, obj, context, 0);
        let stored = self.indexes[0].get(&data)?;

        let result;
        match stored {
            None => {
                // Statement does not exist yet.
                data[FLAG_IDX] |= ADDED_FLAG;
                if explicit {
                    data[FLAG_IDX] |= EXPLICIT_FLAG;
                }
                result = true;
                txn.added = true;
            }
            Some(old) => {
                // Statement already exists; only its flags may change.
                let f = QuadFlags::of(&old);
                if f.added {
                    // Added earlier in this same transaction; explicitness
                    // can only strengthen.
                    data[FLAG_IDX] |= ADDED_FLAG;
                    if explicit || f.explicit {
                        data[FLAG_IDX] |= EXPLICIT_FLAG;
                    }
                } else {
                    // Committed statement: the stored explicit bit is kept
                    // and changes go through the toggle.
                    if f.explicit {
                        data[FLAG_IDX] |= EXPLICIT_FLAG;
                    }
                    if explicit {
                        if !f.explicit {
                            // Promote an inferred statement to explicit.
                            data[FLAG_IDX] |= TOGGLE_EXPLICIT_FLAG;
                        }
                    } else if f.removed {
                        if f.explicit {
                            // Re-add a removed explicit statement as inferred.
                            data[FLAG_IDX] |= TOGGLE_EXPLICIT_FLAG;
                        }
                    } else if f.toggled {
                        data[FLAG_IDX] |= TOGGLE_EXPLICIT_FLAG;
                    }
                }
                // A re-added removed statement counts as new.
                result = f.removed;
            }
        }

        if stored.map_or(true, |old| old != data) {
            for index in &self.indexes {
                index.insert(&data)?;
            }
            txn.cache
                .as_mut()
                .expect("transaction cache present")
                .store_record(&data)?;
        }

        Ok(result)
    }

    /// Flags every statement matching the pattern as removed, regardless
    /// of its current flag state. Returns how many were newly flagged.
    pub fn remove_quads(
        &self,
        subj: TermId,
        pred: TermId,
        obj: TermId,
        context: TermId,
    ) -> Result<usize> {
        let iter = self.quads_with_flags(subj, pred, obj, context, 0, 0)?;
        self.flag_removed(iter)
    }

    /// Flags matching statements as removed, restricted to explicit or to
    /// inferred statements by an exact test of the explicit bit.
    pub fn remove_quads_filtered(
        &self,
        subj: TermId,
        pred: TermId,
        obj: TermId,
        context: TermId,
        explicit: bool,
    ) -> Result<usize> {
        let flags = if explicit { EXPLICIT_FLAG } else { 0 };
        let iter = self.quads_with_flags(subj, pred, obj, context, flags, EXPLICIT_FLAG)?;
        self.flag_removed(iter)
    }

    /// Creates the transaction-scoped record cache. Sized to roughly a
    /// tenth of the store so an oversized dirty set degrades to full-index
    /// scans instead of an unbounded buffer.
    ///
    /// # Panics
    ///
    /// Panics when a transaction is already active.
    pub fn start_transaction(&self) -> Result<()> {
        let mut txn = self.txn.lock();
        assert!(txn.cache.is_none(), "transaction already started");
        let max_records = self.indexes[0].value_count_estimate() / 10;
        let order = FieldOrder::parse("spoc").expect("literal order");
        txn.cache = Some(Box::new(IndexRecordCache::new(
            &self.dir,
            order,
            max_records,
        )?));
        txn.added = false;
        txn.removed = false;
        self.status.set(TxnStatus::Active)?;
        Ok(())
    }

    /// Makes every pending change of the active transaction durable:
    /// purges removed records from all indexes, materializes pending adds
    /// and toggles, then discards the cache and syncs.
    ///
    /// # Panics
    ///
    /// Panics when no transaction is active.
    pub fn commit(&self) -> Result<()> {
        let mut txn = self.txn.lock();
        assert!(txn.cache.is_some(), "commit without an active transaction");
        self.status.set(TxnStatus::Committing)?;

        if txn.removed {
            let iter = self.quads_with_flags(-1, -1, -1, -1, REMOVED_FLAG, REMOVED_FLAG)?;
            let purged = self.discard_matching(iter);
            txn.removed = false;
            purged?;
        }

        let valid_cache = txn.cache.as_ref().expect("transaction cache present").is_valid();
        for index in &self.indexes {
            let mut iter: Box<dyn RecordIterator + '_> = if valid_cache {
                txn.cache
                    .as_mut()
                    .expect("transaction cache present")
                    .records()?
            } else {
                // Cache overflowed; reconcile by scanning the index itself.
                index.iter_all()
            };

            while let Some(mut data) = iter.next()? {
                let f = QuadFlags::of(&data);
                if f.removed {
                    // Physically discarded above, do not reinsert.
                    continue;
                }
                if f.added || f.toggled {
                    if f.toggled {
                        data[FLAG_IDX] ^= EXPLICIT_FLAG;
                    }
                    if f.added {
                        data[FLAG_IDX] ^= ADDED_FLAG;
                    }
                    if valid_cache {
                        index.insert(&data)?;
                    } else {
                        iter.set(data)?;
                    }
                }
            }
        }

        let mut cache = txn.cache.take().expect("transaction cache present");
        cache.discard()?;
        txn.added = false;
        drop(txn);

        self.sync()?;
        self.status.set(TxnStatus::None)?;
        Ok(())
    }

    /// Undoes every pending change of the active transaction: purges
    /// records added by it, clears pending removal and toggle bits, then
    /// discards the cache and syncs.
    ///
    /// # Panics
    ///
    /// Panics when no transaction is active.
    pub fn rollback(&self) -> Result<()> {
        let mut txn = self.txn.lock();
        assert!(txn.cache.is_some(), "rollback without an active transaction");
        self.status.set(TxnStatus::RollingBack)?;

        if txn.added {
            let iter = self.quads_with_flags(-1, -1, -1, -1, ADDED_FLAG, ADDED_FLAG)?;
            let purged = self.discard_matching(iter);
            txn.added = false;
            purged?;
        }

        let valid_cache = txn.cache.as_ref().expect("transaction cache present").is_valid();
        for index in &self.indexes {
            let mut iter: Box<dyn RecordIterator + '_> = if valid_cache {
                txn.cache
                    .as_mut()
                    .expect("transaction cache present")
                    .records()?
            } else {
                index.iter_all()
            };

            while let Some(mut data) = iter.next()? {
                let f = QuadFlags::of(&data);
                if f.added {
                    // Physically discarded above; clearing its bits and
                    // reinserting would resurrect the record.
                    continue;
                }
                if f.removed || f.toggled {
                    data[FLAG_IDX] &= !TXN_FLAGS;
                    if valid_cache {
                        index.insert(&data)?;
                    } else {
                        iter.set(data)?;
                    }
                }
            }
        }

        let mut cache = txn.cache.take().expect("transaction cache present");
        cache.discard()?;
        txn.removed = false;
        drop(txn);

        self.sync()?;
        self.status.set(TxnStatus::None)?;
        Ok(())
    }

    /// Clears leftover transaction state after an unclean shutdown: purges
    /// records whose add never committed and strips pending removal and
    /// toggle bits. Runs before the store hands out any connection.
    fn recover(&self) -> Result<()> {
        let iter = self.quads_with_flags(-1, -1, -1, -1, ADDED_FLAG, ADDED_FLAG)?;
        self.discard_matching(iter)?;

        for index in &self.indexes {
            let mut iter = index.iter_all();
            while let Some(mut data) = iter.next()? {
                let f = QuadFlags::of(&data);
                if f.removed || f.toggled {
                    data[FLAG_IDX] &= !TXN_FLAGS;
                    iter.set(data)?;
                }
            }
        }
        self.sync()
    }

    /// Removes every statement from every index.
    pub fn clear(&self) -> Result<()> {
        for index in &self.indexes {
            index.clear()?;
        }
        Ok(())
    }

    /// Forces every index to disk.
    pub fn sync(&self) -> Result<()> {
        for index in &self.indexes {
            index.sync()?;
        }
        Ok(())
    }

    /// Syncs and releases the indexes.
    pub fn close(&self) -> Result<()> {
        for index in &self.indexes {
            index.close()?;
        }
        Ok(())
    }

    fn best_index(
        &self,
        subj: TermId,
        pred: TermId,
        obj: TermId,
        context: TermId,
    ) -> (&RecordIndex, u32) {
        let mut best = &self.indexes[0];
        let mut best_score = pattern_score(best.order(), subj, pred, obj, context);
        for index in &self.indexes[1..] {
            let score = pattern_score(index.order(), subj, pred, obj, context);
            if score > best_score {
                best_score = score;
                best = index;
            }
        }
        (best, best_score)
    }

    fn quads_with_flags(
        &self,
        subj: TermId,
        pred: TermId,
        obj: TermId,
        context: TermId,
        flags: u8,
        flags_mask: u8,
    ) -> Result<Box<dyn RecordIterator>> {
        let (best, best_score) = self.best_index(subj, pred, obj, context);
        let search_key = make_record(subj, pred, obj, context, flags);
        let search_mask = make_mask(subj, pred, obj, context, flags_mask);

        if best_score > 0 {
            let min = min_record(subj, pred, obj, context);
            let max = max_record(subj, pred, obj, context);
            Ok(best.iter_range(search_key, search_mask, &min, &max))
        } else {
            Ok(best.iter_matching(search_key, search_mask))
        }
    }

    /// Flags every record yielded by `iter` as removed, buffering through
    /// a throwaway sequential cache so the iterator closes before the
    /// indexes are rewritten.
    fn flag_removed(&self, mut iter: Box<dyn RecordIterator>) -> Result<usize> {
        let mut txn = self.txn.lock();
        assert!(
            txn.cache.is_some(),
            "remove_quads called outside a transaction"
        );

        let first = iter.next()?;
        if first.is_none() {
            return Ok(0);
        }

        let mut removed = FileRecordCache::new(&self.dir)?;
        let mut data = first;
        while let Some(mut record) = data {
            if record[FLAG_IDX] & REMOVED_FLAG == 0 {
                record[FLAG_IDX] |= REMOVED_FLAG;
                removed.store_record(&record)?;
            }
            data = iter.next()?;
        }
        drop(iter);

        let count = removed.record_count();
        txn.cache
            .as_mut()
            .expect("transaction cache present")
            .store_all(&mut removed)?;

        for index in &self.indexes {
            let mut records = removed.records()?;
            while let Some(record) = records.next()? {
                index.insert(&record)?;
            }
        }
        removed.discard()?;

        if count > 0 {
            txn.removed = true;
        }
        Ok(count as usize)
    }

    /// Physically deletes every record yielded by `iter` from every index,
    /// buffering through a throwaway sequential cache first.
    fn discard_matching(&self, mut iter: Box<dyn RecordIterator>) -> Result<()> {
        let first = iter.next()?;
        if first.is_none() {
            return Ok(());
        }

        let mut discarded = FileRecordCache::new(&self.dir)?;
        let mut data = first;
        while let Some(record) = data {
            discarded.store_record(&record)?;
            data = iter.next()?;
        }
        drop(iter);

        for index in &self.indexes {
            let mut records = discarded.records()?;
            while let Some(record) = records.next()? {
                index.remove(&record)?;
            }
        }
        discarded.discard()
    }
}

/// Accepts records whose effective explicitness is true: either explicit
/// and not pending a toggle, or inferred with a pending promotion.
struct EffectiveExplicitFilter {
    inner: Box<dyn RecordIterator>,
}

impl RecordIterator for EffectiveExplicitFilter {
    fn next(&mut self) -> Result<Option<QuadRecord>> {
        while let Some(record) = self.inner.next()? {
            let f = QuadFlags::of(&record);
            if f.explicit != f.toggled {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    fn set(&mut self, record: QuadRecord) -> Result<()> {
        self.inner.set(record)
    }
}

/// Scores an index against a pattern: the number of leading fields, in the
/// index's order, that are bound before the first wildcard. Zero means the
/// index can only serve the pattern with a sequential scan.
fn pattern_score(
    order: &FieldOrder,
    subj: TermId,
    pred: TermId,
    obj: TermId,
    context: TermId,
) -> u32 {
    let mut score = 0;
    for field in order.fields() {
        let bound = match field {
            Field::Subject => subj >= 0,
            Field::Predicate => pred >= 0,
            Field::Object => obj >= 0,
            Field::Context => context >= 0,
        };
        if bound {
            score += 1;
        } else {
            return score;
        }
    }
    score
}

fn make_record(subj: TermId, pred: TermId, obj: TermId, context: TermId, flags: u8) -> QuadRecord {
    let mut record = [0u8; RECORD_LEN];
    put_id(subj, &mut record, SUBJ_IDX);
    put_id(pred, &mut record, PRED_IDX);
    put_id(obj, &mut record, OBJ_IDX);
    put_id(context, &mut record, CONTEXT_IDX);
    record[FLAG_IDX] = flags;
    record
}

fn make_mask(subj: TermId, pred: TermId, obj: TermId, context: TermId, flags: u8) -> QuadRecord {
    let mut mask = [0u8; RECORD_LEN];
    if subj != -1 {
        put_id(-1, &mut mask, SUBJ_IDX);
    }
    if pred != -1 {
        put_id(-1, &mut mask, PRED_IDX);
    }
    if obj != -1 {
        put_id(-1, &mut mask, OBJ_IDX);
    }
    if context != -1 {
        put_id(-1, &mut mask, CONTEXT_IDX);
    }
    mask[FLAG_IDX] = flags;
    mask
}

fn min_record(subj: TermId, pred: TermId, obj: TermId, context: TermId) -> QuadRecord {
    make_record(
        subj.max(0),
        pred.max(0),
        obj.max(0),
        context.max(0),
        0x00,
    )
}

fn max_record(subj: TermId, pred: TermId, obj: TermId, context: TermId) -> QuadRecord {
    // The wildcard encoding -1 is already the all-ones upper bound.
    make_record(subj, pred, obj, context, 0xff)
}

fn index_file(dir: &Path, order: &FieldOrder) -> PathBuf {
    dir.join(format!("quads-{order}.dat"))
}

/// Parses a comma/whitespace-separated index order list such as
/// `"spoc, posc"`. Duplicates collapse; order of first appearance wins.
fn parse_index_orders(spec: &str) -> Result<Vec<FieldOrder>> {
    let mut orders: Vec<FieldOrder> = Vec::new();
    for token in spec.split(|c: char| c == ',' || c.is_whitespace()) {
        if token.is_empty() {
            continue;
        }
        let order = FieldOrder::parse(token).map_err(|_| {
            StoreError::Config(format!(
                "invalid value '{token}' in index specification: {spec}"
            ))
        })?;
        if !orders.contains(&order) {
            orders.push(order);
        }
    }
    Ok(orders)
}

fn check_version(properties: &[(String, String)]) -> Result<()> {
    match get_property(properties, VERSION_KEY) {
        None => {
            warn!("version missing from the quad store properties file");
            Ok(())
        }
        Some(text) => match text.parse::<u32>() {
            Ok(version) if version < SCHEME_VERSION => Err(StoreError::Config(
                "directory contains incompatible statement data".into(),
            )),
            Ok(version) if version > SCHEME_VERSION => Err(StoreError::Config(
                "directory contains data that uses a newer format".into(),
            )),
            Ok(_) => Ok(()),
            Err(_) => {
                warn!("malformed version number in the quad store properties file");
                Ok(())
            }
        },
    }
}

/// Brings the on-disk index set in line with the configured one: newly
/// configured indexes are populated from an existing index, indexes no
/// longer configured lose their files.
fn reindex(
    dir: &Path,
    new_orders: &[FieldOrder],
    properties: &[(String, String)],
    force_sync: bool,
) -> Result<()> {
    let current_spec = match get_property(properties, INDEXES_KEY) {
        Some(spec) => spec,
        None => return Ok(()),
    };
    let current = parse_index_orders(&current_spec)?;
    if current.is_empty() {
        return Err(StoreError::Config(
            "invalid index specification found in the properties file".into(),
        ));
    }

    let added: Vec<&FieldOrder> = new_orders
        .iter()
        .filter(|&order| !current.contains(order))
        .collect();
    if !added.is_empty() {
        let source = RecordIndex::open(
            index_file(dir, &current[0]),
            current[0].clone(),
            force_sync,
        )?;
        for order in added {
            debug!(index = %order, "initializing new index");
            let target = RecordIndex::open(index_file(dir, order), (*order).clone(), force_sync)?;
            let mut records = source.iter_all();
            while let Some(record) = records.next()? {
                target.insert(&record)?;
            }
            target.close()?;
        }
        source.close()?;
    }

    for order in current
        .iter()
        .filter(|&order| !new_orders.contains(order))
    {
        let path = index_file(dir, order);
        match fs::remove_file(&path) {
            Ok(()) => debug!(index = %order, "deleted file of removed index"),
            Err(e) => warn!(index = %order, error = %e, "unable to delete removed index file"),
        }
    }

    Ok(())
}

fn load_properties(path: &Path) -> Result<Vec<(String, String)>> {
    let file = File::open(path)?;
    let mut properties = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) => {
                properties.push((key.trim().to_string(), value.trim().to_string()))
            }
            None => {
                return Err(StoreError::Corruption(format!(
                    "malformed line in {}: {line}",
                    path.display()
                )))
            }
        }
    }
    Ok(properties)
}

fn store_properties(path: &Path, properties: &[(String, String)]) -> Result<()> {
    let mut file = File::create(path)?;
    writeln!(file, "# quad store metadata, DO NOT EDIT!")?;
    for (key, value) in properties {
        writeln!(file, "{key}={value}")?;
    }
    file.sync_data()?;
    Ok(())
}

fn get_property(properties: &[(String, String)], key: &str) -> Option<String> {
    properties
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
}

fn set_property(properties: &mut Vec<(String, String)>, key: &str, value: &str) {
    match properties.iter_mut().find(|(k, _)| k == key) {
        Some(entry) => entry.1 = value.to_string(),
        None => properties.push((key.to_string(), value.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::get_id;
    use tempfile::tempdir;

    fn open_store(dir: &Path, spec: &str) -> QuadStore {
        QuadStore::open(dir, spec, false).unwrap()
    }

    fn collect(mut iter: Box<dyn RecordIterator>) -> Vec<QuadRecord> {
        let mut out = Vec::new();
        while let Some(rec) = iter.next().unwrap() {
            out.push(rec);
        }
        out
    }

    fn committed(store: &QuadStore) -> Vec<QuadRecord> {
        collect(store.quads(-1, -1, -1, -1, ReadMode::Committed).unwrap())
    }

    #[test]
    fn store_quad_flags_new_statement_as_added() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), "");
        store.start_transaction().unwrap();

        assert!(store.store_quad(1, 2, 3, 0, true).unwrap());
        let visible = collect(store.quads(1, 2, 3, 0, ReadMode::Transaction).unwrap());
        assert_eq!(visible.len(), 1);
        assert_eq!(
            QuadFlags::of(&visible[0]),
            QuadFlags {
                explicit: true,
                added: true,
                removed: false,
                toggled: false
            }
        );

        // Invisible to a committed-only reader until commit.
        assert!(committed(&store).is_empty());

        store.commit().unwrap();
        let after = committed(&store);
        assert_eq!(after.len(), 1);
        assert_eq!(
            QuadFlags::of(&after[0]),
            QuadFlags {
                explicit: true,
                added: false,
                removed: false,
                toggled: false
            }
        );
    }

    #[test]
    fn second_identical_add_changes_nothing() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), "");
        store.start_transaction().unwrap();

        assert!(store.store_quad(1, 2, 3, 0, true).unwrap());
        assert!(!store.store_quad(1, 2, 3, 0, true).unwrap());
        store.commit().unwrap();

        assert_eq!(committed(&store).len(), 1);
    }

    #[test]
    fn explicit_promotion_wins_within_a_transaction() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), "");
        store.start_transaction().unwrap();
        store.store_quad(1, 2, 3, 0, false).unwrap();
        store.store_quad(1, 2, 3, 0, true).unwrap();
        store.commit().unwrap();

        let after = committed(&store);
        assert_eq!(after.len(), 1);
        assert!(QuadFlags::of(&after[0]).explicit);
    }

    #[test]
    fn committed_inferred_statement_is_promoted_through_toggle() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), "");
        store.start_transaction().unwrap();
        store.store_quad(1, 2, 3, 0, false).unwrap();
        store.commit().unwrap();

        store.start_transaction().unwrap();
        assert!(!store.store_quad(1, 2, 3, 0, true).unwrap());
        let pending = collect(store.quads(1, 2, 3, 0, ReadMode::Transaction).unwrap());
        let f = QuadFlags::of(&pending[0]);
        assert!(!f.explicit && f.toggled);

        // The effective-explicitness filter already reports it explicit.
        let as_explicit = collect(
            store
                .quads_filtered(1, 2, 3, 0, true, ReadMode::Transaction)
                .unwrap(),
        );
        assert_eq!(as_explicit.len(), 1);

        store.commit().unwrap();
        assert!(QuadFlags::of(&committed(&store)[0]).explicit);
    }

    #[test]
    fn explicit_statement_with_pending_toggle_is_filtered_out() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), "");
        store.start_transaction().unwrap();
        store.store_quad(1, 2, 3, 0, true).unwrap();
        store.commit().unwrap();

        // Remove it and re-add as inferred: toggle goes up next to REMOVED.
        store.start_transaction().unwrap();
        store.remove_quads_filtered(1, 2, 3, 0, true).unwrap();
        assert!(store.store_quad(1, 2, 3, 0, false).unwrap());

        let explicit_view = collect(
            store
                .quads_filtered(1, 2, 3, 0, true, ReadMode::Transaction)
                .unwrap(),
        );
        assert!(explicit_view.is_empty(), "explicit XOR toggle must reject");

        store.commit().unwrap();
        let after = committed(&store);
        assert_eq!(after.len(), 1);
        assert!(!QuadFlags::of(&after[0]).explicit, "now inferred");
    }

    #[test]
    fn remove_with_mismatched_explicit_filter_is_a_no_op() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), "");
        store.start_transaction().unwrap();
        store.store_quad(1, 2, 3, 0, true).unwrap();
        store.commit().unwrap();

        store.start_transaction().unwrap();
        let removed = store.remove_quads_filtered(1, 2, 3, 0, false).unwrap();
        assert_eq!(removed, 0);
        store.commit().unwrap();

        assert_eq!(committed(&store).len(), 1);
    }

    #[test]
    fn removal_is_visible_to_committed_readers_until_commit() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), "");
        store.start_transaction().unwrap();
        store.store_quad(1, 2, 3, 0, true).unwrap();
        store.commit().unwrap();

        store.start_transaction().unwrap();
        assert_eq!(store.remove_quads_filtered(1, 2, 3, 0, true).unwrap(), 1);

        // Committed-only readers still see it; the transaction does not.
        assert_eq!(committed(&store).len(), 1);
        assert!(collect(store.quads(1, 2, 3, 0, ReadMode::Transaction).unwrap()).is_empty());

        store.commit().unwrap();
        assert!(committed(&store).is_empty());
    }

    #[test]
    fn commit_leaves_no_transaction_flags_and_indexes_agree() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), "spoc,posc,cosp");
        store.start_transaction().unwrap();
        for s in 1..=10 {
            store.store_quad(s, 2, 3, 0, s % 2 == 0).unwrap();
        }
        store.remove_quads(4, -1, -1, -1).unwrap();
        store.commit().unwrap();

        let mut per_index = Vec::new();
        for index in &store.indexes {
            let mut keys = Vec::new();
            let mut iter = index.iter_all();
            while let Some(rec) = iter.next().unwrap() {
                let f = QuadFlags::of(&rec);
                assert!(!f.added && !f.removed && !f.toggled, "txn flag survived");
                keys.push((
                    get_id(&rec, SUBJ_IDX),
                    get_id(&rec, PRED_IDX),
                    get_id(&rec, OBJ_IDX),
                    get_id(&rec, CONTEXT_IDX),
                ));
            }
            keys.sort_unstable();
            per_index.push(keys);
        }
        assert_eq!(per_index[0].len(), 9);
        assert!(per_index.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn rollback_restores_the_previous_committed_state() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), "");
        store.start_transaction().unwrap();
        store.store_quad(1, 2, 3, 0, true).unwrap();
        store.store_quad(4, 5, 6, 0, false).unwrap();
        store.commit().unwrap();
        let before = committed(&store);

        store.start_transaction().unwrap();
        store.store_quad(7, 8, 9, 0, true).unwrap();
        store.remove_quads(1, 2, 3, -1).unwrap();
        store.store_quad(4, 5, 6, 0, true).unwrap(); // pending toggle
        store.rollback().unwrap();

        let mut after = committed(&store);
        after.sort_unstable();
        let mut expected = before;
        expected.sort_unstable();
        assert_eq!(after, expected);
    }

    #[test]
    fn rollback_does_not_resurrect_an_added_then_removed_statement() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), "");
        store.start_transaction().unwrap();
        store.store_quad(1, 2, 3, 0, true).unwrap();
        store.remove_quads(1, 2, 3, -1).unwrap();
        store.rollback().unwrap();

        assert!(committed(&store).is_empty());
        assert!(collect(store.quads(-1, -1, -1, -1, ReadMode::Transaction).unwrap()).is_empty());
    }

    #[test]
    fn re_adding_a_removed_statement_counts_as_new() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), "");
        store.start_transaction().unwrap();
        store.store_quad(1, 2, 3, 0, true).unwrap();
        store.commit().unwrap();

        store.start_transaction().unwrap();
        store.remove_quads_filtered(1, 2, 3, 0, true).unwrap();
        assert!(store.store_quad(1, 2, 3, 0, true).unwrap());
        store.commit().unwrap();
        assert_eq!(committed(&store).len(), 1);
    }

    #[test]
    fn commit_uses_the_record_cache_when_it_stays_small() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), "");

        // Seed enough committed statements that the next transaction gets
        // a usable cache budget (a tenth of the store).
        store.start_transaction().unwrap();
        for s in 1..=100 {
            store.store_quad(s, 1, 1, 0, true).unwrap();
        }
        store.commit().unwrap();

        store.start_transaction().unwrap();
        store.store_quad(200, 1, 1, 0, true).unwrap();
        {
            let txn = store.txn.lock();
            assert!(txn.cache.as_ref().unwrap().is_valid());
        }
        store.commit().unwrap();
        assert_eq!(committed(&store).len(), 101);
    }

    #[test]
    fn oversized_transactions_fall_back_to_full_scans() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), "");

        // An empty store gives the cache a budget of zero, so it is
        // invalid from the start and commit walks the indexes directly.
        store.start_transaction().unwrap();
        for s in 1..=30 {
            store.store_quad(s, 2, 3, 0, true).unwrap();
        }
        {
            let txn = store.txn.lock();
            assert!(!txn.cache.as_ref().unwrap().is_valid());
        }
        store.commit().unwrap();
        assert_eq!(committed(&store).len(), 30);
    }

    #[test]
    fn pattern_scoring_prefers_the_matching_prefix() {
        let spoc = FieldOrder::parse("spoc").unwrap();
        let posc = FieldOrder::parse("posc").unwrap();

        assert_eq!(pattern_score(&spoc, 1, -1, -1, -1), 1);
        assert_eq!(pattern_score(&posc, 1, -1, -1, -1), 0);
        assert_eq!(pattern_score(&posc, -1, 2, 3, -1), 2);
        assert_eq!(pattern_score(&spoc, 1, 2, 3, 0), 4);
    }

    #[test]
    fn wildcard_context_matches_all_graphs() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), "");
        store.start_transaction().unwrap();
        store.store_quad(1, 2, 3, 0, true).unwrap();
        store.store_quad(1, 2, 3, 7, true).unwrap();
        store.commit().unwrap();

        assert_eq!(
            collect(store.quads(1, 2, 3, -1, ReadMode::Committed).unwrap()).len(),
            2
        );
        assert_eq!(
            collect(store.quads(1, 2, 3, 0, ReadMode::Committed).unwrap()).len(),
            1
        );
        assert_eq!(
            collect(store.quads(1, 2, 3, 7, ReadMode::Committed).unwrap()).len(),
            1
        );
    }

    #[test]
    fn cardinality_tracks_pattern_selectivity() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), "");
        store.start_transaction().unwrap();
        for s in 1..=8 {
            store.store_quad(s, 2, 3, 0, true).unwrap();
        }
        store.store_quad(1, 9, 9, 0, true).unwrap();
        store.commit().unwrap();

        assert_eq!(store.cardinality(1, -1, -1, -1).unwrap(), 2);
        assert_eq!(store.cardinality(-1, -1, -1, -1).unwrap(), 9);
    }

    #[test]
    fn context_ordered_iteration_requires_a_context_index() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), "spoc,cosp");
        store.start_transaction().unwrap();
        store.store_quad(1, 2, 3, 5, true).unwrap();
        store.store_quad(4, 5, 6, 1, true).unwrap();
        store.store_quad(7, 8, 9, 5, true).unwrap();
        store.commit().unwrap();

        let iter = store
            .quads_ordered_by_context(ReadMode::Committed)
            .unwrap()
            .expect("cosp index available");
        let contexts: Vec<TermId> = collect(iter)
            .iter()
            .map(|rec| get_id(rec, CONTEXT_IDX))
            .collect();
        assert_eq!(contexts, vec![1, 5, 5]);

        let plain_dir = tempdir().unwrap();
        let plain = open_store(plain_dir.path(), "spoc,posc");
        assert!(plain
            .quads_ordered_by_context(ReadMode::Committed)
            .unwrap()
            .is_none());
    }

    #[test]
    fn version_checks_reject_foreign_data() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(PROPERTIES_FILE),
            "version=9\nindexes=spoc,posc\n",
        )
        .unwrap();
        match QuadStore::open(dir.path(), "", false) {
            Err(StoreError::Config(msg)) => assert!(msg.contains("incompatible")),
            other => panic!("expected config error, got {other:?}"),
        }

        fs::write(
            dir.path().join(PROPERTIES_FILE),
            "version=11\nindexes=spoc,posc\n",
        )
        .unwrap();
        match QuadStore::open(dir.path(), "", false) {
            Err(StoreError::Config(msg)) => assert!(msg.contains("newer")),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn invalid_index_specs_are_rejected() {
        let dir = tempdir().unwrap();
        for spec in ["spo", "spoc,xyzw", "sspo"] {
            assert!(QuadStore::open(dir.path(), spec, false).is_err(), "{spec}");
        }
    }

    #[test]
    fn reconfiguring_indexes_populates_and_prunes() {
        let dir = tempdir().unwrap();
        {
            let store = open_store(dir.path(), "spoc,posc");
            store.start_transaction().unwrap();
            store.store_quad(1, 2, 3, 0, true).unwrap();
            store.store_quad(4, 5, 6, 7, false).unwrap();
            store.commit().unwrap();
            store.close().unwrap();
        }

        let store = open_store(dir.path(), "spoc,ospc");
        assert!(!dir.path().join("quads-posc.dat").exists());
        assert!(dir.path().join("quads-ospc.dat").exists());
        let mut sets = Vec::new();
        for index in &store.indexes {
            let mut keys: Vec<_> = collect(index.iter_all())
                .iter()
                .map(|rec| (get_id(rec, SUBJ_IDX), get_id(rec, OBJ_IDX)))
                .collect();
            keys.sort_unstable();
            sets.push(keys);
        }
        assert_eq!(sets[0], sets[1]);
        assert_eq!(sets[0].len(), 2);
    }

    #[test]
    fn interrupted_transaction_is_rolled_back_on_open() {
        let dir = tempdir().unwrap();
        {
            let store = open_store(dir.path(), "");
            store.start_transaction().unwrap();
            store.store_quad(1, 2, 3, 0, true).unwrap();
            store.commit().unwrap();

            // Crash mid-transaction: pending flags reach disk, the status
            // file still says ACTIVE, and the process dies.
            store.start_transaction().unwrap();
            store.store_quad(7, 8, 9, 0, true).unwrap();
            store.remove_quads(1, 2, 3, -1).unwrap();
            store.sync().unwrap();
        }

        let store = open_store(dir.path(), "");
        assert_eq!(store.status.get().unwrap(), TxnStatus::None);
        let after = committed(&store);
        assert_eq!(after.len(), 1);
        assert_eq!(get_id(&after[0], SUBJ_IDX), 1);
        assert!(!QuadFlags::of(&after[0]).removed);
    }

    #[test]
    #[should_panic(expected = "transaction already started")]
    fn double_start_transaction_panics() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), "");
        store.start_transaction().unwrap();
        let _ = store.start_transaction();
    }

    #[test]
    #[should_panic(expected = "outside a transaction")]
    fn store_quad_outside_a_transaction_panics() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), "");
        let _ = store.store_quad(1, 2, 3, 0, true);
    }

    #[test]
    fn flags_round_trip_through_the_byte_layout() {
        for byte in 0..=0x0fu8 {
            assert_eq!(QuadFlags::from_byte(byte).to_byte(), byte);
        }
        // Reserved bits are dropped on decode.
        assert_eq!(QuadFlags::from_byte(0xf2).to_byte(), 0x02);
    }
}
