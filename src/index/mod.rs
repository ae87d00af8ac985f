//! Ordered storage of fixed-length statement records.
//!
//! Every statement is a 17-byte record: four big-endian 32-bit term
//! identifiers followed by one flag byte. Each configured index stores the
//! full record set under its own field order; only the sort order differs.

mod file;

pub use file::RecordIndex;

use std::cmp::Ordering;
use std::fmt;

use crate::error::{Result, StoreError};
use crate::model::TermId;

/// Width of a statement record in bytes.
pub const RECORD_LEN: usize = 17;

/// Width of the key portion of a record (everything but the flag byte).
pub const KEY_LEN: usize = 16;

/// Byte offset of the subject identifier.
pub const SUBJ_IDX: usize = 0;
/// Byte offset of the predicate identifier.
pub const PRED_IDX: usize = 4;
/// Byte offset of the object identifier.
pub const OBJ_IDX: usize = 8;
/// Byte offset of the context identifier.
pub const CONTEXT_IDX: usize = 12;
/// Byte offset of the flag byte.
pub const FLAG_IDX: usize = 16;

/// One stored statement: subject, predicate, object, context, flags.
pub type QuadRecord = [u8; RECORD_LEN];

/// The key bytes of a record, permuted into an index's field order.
pub type OrderedKey = [u8; KEY_LEN];

/// Writes a term identifier into a record at the given field offset.
pub fn put_id(id: TermId, record: &mut [u8], offset: usize) {
    record[offset..offset + 4].copy_from_slice(&id.to_be_bytes());
}

/// Reads the term identifier stored at the given field offset.
pub fn get_id(record: &[u8], offset: usize) -> TermId {
    TermId::from_be_bytes(
        record[offset..offset + 4]
            .try_into()
            .expect("field slice is 4 bytes"),
    )
}

/// Tests a record against a search key under a bit mask: every bit set in
/// `mask` must agree between `record` and `key`.
pub fn matches(record: &QuadRecord, key: &QuadRecord, mask: &QuadRecord) -> bool {
    record
        .iter()
        .zip(key.iter())
        .zip(mask.iter())
        .all(|((r, k), m)| (r ^ k) & m == 0)
}

/// One of the four positional fields of a statement record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// The subject position.
    Subject,
    /// The predicate position.
    Predicate,
    /// The object position.
    Object,
    /// The context position.
    Context,
}

impl Field {
    /// Byte offset of this field within a record.
    pub fn offset(self) -> usize {
        match self {
            Field::Subject => SUBJ_IDX,
            Field::Predicate => PRED_IDX,
            Field::Object => OBJ_IDX,
            Field::Context => CONTEXT_IDX,
        }
    }

    fn from_char(c: char) -> Option<Self> {
        match c {
            's' => Some(Field::Subject),
            'p' => Some(Field::Predicate),
            'o' => Some(Field::Object),
            'c' => Some(Field::Context),
            _ => None,
        }
    }

    fn as_char(self) -> char {
        match self {
            Field::Subject => 's',
            Field::Predicate => 'p',
            Field::Object => 'o',
            Field::Context => 'c',
        }
    }
}

/// A permutation of the four record fields, defining one index's sort order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldOrder {
    fields: [Field; 4],
}

impl FieldOrder {
    /// Parses a 4-character order specification such as `"spoc"`. Each of
    /// `s`, `p`, `o` and `c` must occur exactly once.
    pub fn parse(spec: &str) -> Result<Self> {
        let lower = spec.to_ascii_lowercase();
        let chars: Vec<char> = lower.chars().collect();
        if chars.len() != 4 {
            return Err(StoreError::Config(format!(
                "invalid index order '{spec}': expected exactly 4 characters"
            )));
        }
        let mut fields = [Field::Subject; 4];
        for (i, c) in chars.iter().enumerate() {
            let field = Field::from_char(*c).ok_or_else(|| {
                StoreError::Config(format!("invalid character '{c}' in index order '{spec}'"))
            })?;
            if fields[..i].contains(&field) {
                return Err(StoreError::Config(format!(
                    "duplicate field '{c}' in index order '{spec}'"
                )));
            }
            fields[i] = field;
        }
        Ok(Self { fields })
    }

    /// The four fields in sort-priority order.
    pub fn fields(&self) -> &[Field; 4] {
        &self.fields
    }

    /// The field this index sorts by first.
    pub fn leading(&self) -> Field {
        self.fields[0]
    }

    /// Compares two records field by field in this order. The flag byte
    /// never participates, so records with equal keys compare equal.
    pub fn compare(&self, a: &QuadRecord, b: &QuadRecord) -> Ordering {
        for field in &self.fields {
            let off = field.offset();
            match a[off..off + 4].cmp(&b[off..off + 4]) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }

    /// Extracts the record's key bytes permuted into this order. Byte-wise
    /// lexicographic comparison of permuted keys equals [`Self::compare`]
    /// because identifiers are non-negative and big-endian.
    pub fn permuted_key(&self, record: &QuadRecord) -> OrderedKey {
        let mut key = [0u8; KEY_LEN];
        for (i, field) in self.fields.iter().enumerate() {
            let off = field.offset();
            key[i * 4..i * 4 + 4].copy_from_slice(&record[off..off + 4]);
        }
        key
    }

    /// Rebuilds a canonical-layout record from a permuted key and flags.
    pub fn canonical(&self, key: &OrderedKey, flags: u8) -> QuadRecord {
        let mut record = [0u8; RECORD_LEN];
        for (i, field) in self.fields.iter().enumerate() {
            let off = field.offset();
            record[off..off + 4].copy_from_slice(&key[i * 4..i * 4 + 4]);
        }
        record[FLAG_IDX] = flags;
        record
    }
}

impl fmt::Display for FieldOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for field in &self.fields {
            write!(f, "{}", field.as_char())?;
        }
        Ok(())
    }
}

/// Cursor over statement records.
///
/// Closing is implicit on drop. `set` replaces the record most recently
/// yielded by `next`; only the flag byte may differ from the yielded record.
pub trait RecordIterator: Send {
    /// Returns the next record, or `None` when exhausted.
    fn next(&mut self) -> Result<Option<QuadRecord>>;

    /// Replaces the last-yielded record in place.
    fn set(&mut self, _record: QuadRecord) -> Result<()> {
        Err(StoreError::Unsupported("in-place update on this cursor"))
    }
}
