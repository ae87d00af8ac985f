//! Term interning: the mapping between RDF terms and integer identifiers.
//!
//! The store core only consumes the [`ValueStore`] contract; the default
//! [`FileValueStore`] keeps terms in an append-only log with an in-memory
//! hash index and bounded caches in front of the file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::Path;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::debug;

use crate::cache::ConcurrentCache;
use crate::error::{Result, StoreError};
use crate::model::{Term, TermId, UNKNOWN_ID};

/// Name of the value log inside the data directory.
pub const VALUES_FILE: &str = "values.dat";

const KIND_NAMESPACE: u8 = 0x01;
const KIND_IRI: u8 = 0x02;
const KIND_BLANK: u8 = 0x03;
const KIND_LITERAL: u8 = 0x04;

/// The term-interning contract consumed by the store.
///
/// `get_id` reports an absent term with [`UNKNOWN_ID`] instead of an
/// error; `store_value` interns, assigning a fresh identifier only to a
/// term never seen before.
pub trait ValueStore: Send + Sync {
    /// Returns the identifier for `term`, interning it when necessary.
    fn store_value(&self, term: &Term) -> Result<TermId>;

    /// Returns the identifier for `term`, or [`UNKNOWN_ID`] when the term
    /// has never been stored.
    fn get_id(&self, term: &Term) -> Result<TermId>;

    /// Returns the term stored under `id`.
    fn get_value(&self, id: TermId) -> Result<Term>;

    /// Flushes pending writes to disk.
    fn sync(&self) -> Result<()>;

    /// Syncs and releases the store.
    fn close(&self) -> Result<()>;
}

/// Cache capacities for a [`FileValueStore`], one per internal cache.
#[derive(Debug, Clone, Copy)]
pub struct ValueCacheSizes {
    /// id-to-term cache entries.
    pub values: usize,
    /// term-to-id cache entries.
    pub value_ids: usize,
    /// id-to-namespace cache entries.
    pub namespaces: usize,
    /// namespace-to-id cache entries.
    pub namespace_ids: usize,
}

impl Default for ValueCacheSizes {
    fn default() -> Self {
        Self {
            values: 512,
            value_ids: 128,
            namespaces: 64,
            namespace_ids: 32,
        }
    }
}

struct Inner {
    file: File,
    /// Byte offset of each entry, indexed by `id - 1`.
    offsets: Vec<u64>,
    /// CRC32 of an entry's encoded form, to candidate identifiers.
    hashes: FxHashMap<u32, SmallVec<[TermId; 2]>>,
}

/// Append-only, file-backed term store.
///
/// IRIs are split into an interned namespace record plus a local name;
/// literal datatypes are stored as references to their own IRI records.
/// Four bounded caches sit in front of the log so hot terms avoid disk.
pub struct FileValueStore {
    inner: Mutex<Inner>,
    force_sync: bool,
    value_cache: ConcurrentCache<TermId, Term>,
    value_id_cache: ConcurrentCache<Term, TermId>,
    namespace_cache: ConcurrentCache<TermId, String>,
    namespace_id_cache: ConcurrentCache<String, TermId>,
}

impl std::fmt::Debug for FileValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileValueStore")
            .field("force_sync", &self.force_sync)
            .finish_non_exhaustive()
    }
}

impl FileValueStore {
    /// Opens the value log inside `dir`, rebuilding the in-memory index.
    pub fn open(dir: &Path, force_sync: bool, cache_sizes: ValueCacheSizes) -> Result<Self> {
        let path = dir.join(VALUES_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut offsets = Vec::new();
        let mut hashes: FxHashMap<u32, SmallVec<[TermId; 2]>> = FxHashMap::default();
        let len = file.seek(SeekFrom::End(0))?;
        let mut pos = 0u64;
        file.seek(SeekFrom::Start(0))?;
        while pos < len {
            let (kind, payload) = read_entry(&mut file, pos, len, &path)?;
            let id = next_id(&offsets)?;
            offsets.push(pos);
            hashes.entry(entry_hash(kind, &payload)).or_default().push(id);
            pos += 5 + payload.len() as u64;
        }
        debug!(values = offsets.len(), "value store opened");

        Ok(Self {
            inner: Mutex::new(Inner {
                file,
                offsets,
                hashes,
            }),
            force_sync,
            value_cache: ConcurrentCache::new(cache_capacity(cache_sizes.values)),
            value_id_cache: ConcurrentCache::new(cache_capacity(cache_sizes.value_ids)),
            namespace_cache: ConcurrentCache::new(cache_capacity(cache_sizes.namespaces)),
            namespace_id_cache: ConcurrentCache::new(cache_capacity(cache_sizes.namespace_ids)),
        })
    }

    /// Looks up the id of an encoded entry, or appends it when `create`
    /// is set. Returns [`UNKNOWN_ID`] for an absent entry otherwise.
    fn resolve_entry(
        &self,
        inner: &mut Inner,
        kind: u8,
        payload: &[u8],
        create: bool,
    ) -> Result<TermId> {
        let hash = entry_hash(kind, payload);
        if let Some(candidates) = inner.hashes.get(&hash).cloned() {
            for id in candidates {
                let offset = inner.offsets[(id - 1) as usize];
                let (stored_kind, stored_payload) = read_entry_at(&mut inner.file, offset)?;
                if stored_kind == kind && stored_payload == payload {
                    return Ok(id);
                }
            }
        }
        if !create {
            return Ok(UNKNOWN_ID);
        }

        let id = next_id(&inner.offsets)?;
        let offset = inner.file.seek(SeekFrom::End(0))?;
        inner.file.write_all(&[kind])?;
        inner
            .file
            .write_all(&(payload.len() as u32).to_le_bytes())?;
        inner.file.write_all(payload)?;
        if self.force_sync {
            inner.file.sync_data()?;
        }
        inner.offsets.push(offset);
        inner.hashes.entry(hash).or_default().push(id);
        Ok(id)
    }

    /// Resolves the namespace string of an IRI to its record id.
    fn namespace_id(&self, inner: &mut Inner, namespace: &str, create: bool) -> Result<TermId> {
        if let Some(id) = self.namespace_id_cache.get(&namespace.to_string()) {
            return Ok(id);
        }
        let id = self.resolve_entry(inner, KIND_NAMESPACE, namespace.as_bytes(), create)?;
        if id != UNKNOWN_ID {
            self.namespace_id_cache.put(namespace.to_string(), id);
            self.namespace_cache.put(id, namespace.to_string());
        }
        Ok(id)
    }

    fn namespace_string(&self, inner: &mut Inner, id: TermId) -> Result<String> {
        if let Some(ns) = self.namespace_cache.get(&id) {
            return Ok(ns);
        }
        let offset = *inner
            .offsets
            .get((id - 1) as usize)
            .ok_or(StoreError::NotFound("namespace"))?;
        let (kind, payload) = read_entry_at(&mut inner.file, offset)?;
        if kind != KIND_NAMESPACE {
            return Err(StoreError::Corruption(format!(
                "value {id} is not a namespace record"
            )));
        }
        let ns = String::from_utf8(payload)
            .map_err(|_| StoreError::Corruption(format!("namespace {id} is not UTF-8")))?;
        self.namespace_cache.put(id, ns.clone());
        self.namespace_id_cache.put(ns.clone(), id);
        Ok(ns)
    }

    /// Encodes a term into its log payload, resolving (and optionally
    /// creating) the namespace and datatype records it references.
    /// Returns `None` when a referenced record is absent and `create` is
    /// off.
    fn encode_term(
        &self,
        inner: &mut Inner,
        term: &Term,
        create: bool,
    ) -> Result<Option<(u8, Vec<u8>)>> {
        match term {
            Term::Iri(iri) => {
                let (namespace, local) = split_iri(iri);
                let ns_id = self.namespace_id(inner, namespace, create)?;
                if ns_id == UNKNOWN_ID {
                    return Ok(None);
                }
                let mut payload = Vec::with_capacity(4 + local.len());
                payload.extend_from_slice(&ns_id.to_be_bytes());
                payload.extend_from_slice(local.as_bytes());
                Ok(Some((KIND_IRI, payload)))
            }
            Term::Blank(label) => Ok(Some((KIND_BLANK, label.as_bytes().to_vec()))),
            Term::Literal {
                label,
                lang,
                datatype,
            } => {
                let datatype_id = match datatype {
                    None => 0,
                    Some(iri) => {
                        let datatype_term = Term::Iri(iri.clone());
                        let Some((kind, payload)) =
                            self.encode_term(inner, &datatype_term, create)?
                        else {
                            return Ok(None);
                        };
                        let id = self.resolve_entry(inner, kind, &payload, create)?;
                        if id == UNKNOWN_ID {
                            return Ok(None);
                        }
                        id
                    }
                };
                let lang_bytes = lang.as_deref().unwrap_or("").as_bytes();
                let mut payload = Vec::with_capacity(5 + lang_bytes.len() + label.len());
                payload.extend_from_slice(&datatype_id.to_be_bytes());
                payload.push(lang_bytes.len() as u8);
                payload.extend_from_slice(lang_bytes);
                payload.extend_from_slice(label.as_bytes());
                Ok(Some((KIND_LITERAL, payload)))
            }
        }
    }

    fn decode_term(&self, inner: &mut Inner, kind: u8, payload: &[u8]) -> Result<Term> {
        match kind {
            KIND_IRI => {
                if payload.len() < 4 {
                    return Err(StoreError::Corruption("IRI record truncated".into()));
                }
                let ns_id = TermId::from_be_bytes(payload[..4].try_into().expect("4 bytes"));
                let namespace = self.namespace_string(inner, ns_id)?;
                let local = std::str::from_utf8(&payload[4..])
                    .map_err(|_| StoreError::Corruption("IRI local name is not UTF-8".into()))?;
                Ok(Term::Iri(format!("{namespace}{local}")))
            }
            KIND_BLANK => {
                let label = String::from_utf8(payload.to_vec())
                    .map_err(|_| StoreError::Corruption("blank label is not UTF-8".into()))?;
                Ok(Term::Blank(label))
            }
            KIND_LITERAL => {
                if payload.len() < 5 {
                    return Err(StoreError::Corruption("literal record truncated".into()));
                }
                let datatype_id = TermId::from_be_bytes(payload[..4].try_into().expect("4 bytes"));
                let lang_len = payload[4] as usize;
                if payload.len() < 5 + lang_len {
                    return Err(StoreError::Corruption("literal record truncated".into()));
                }
                let lang = if lang_len == 0 {
                    None
                } else {
                    Some(
                        std::str::from_utf8(&payload[5..5 + lang_len])
                            .map_err(|_| {
                                StoreError::Corruption("language tag is not UTF-8".into())
                            })?
                            .to_string(),
                    )
                };
                let label = std::str::from_utf8(&payload[5 + lang_len..])
                    .map_err(|_| StoreError::Corruption("literal label is not UTF-8".into()))?
                    .to_string();
                let datatype = if datatype_id == 0 {
                    None
                } else {
                    match self.read_term(inner, datatype_id)? {
                        Term::Iri(iri) => Some(iri),
                        _ => {
                            return Err(StoreError::Corruption(format!(
                                "datatype {datatype_id} is not an IRI"
                            )))
                        }
                    }
                };
                Ok(Term::Literal {
                    label,
                    lang,
                    datatype,
                })
            }
            KIND_NAMESPACE => Err(StoreError::NotFound("term")),
            other => Err(StoreError::Corruption(format!(
                "unknown value record kind 0x{other:02X}"
            ))),
        }
    }

    fn read_term(&self, inner: &mut Inner, id: TermId) -> Result<Term> {
        if id <= 0 || id as usize > inner.offsets.len() {
            return Err(StoreError::NotFound("term"));
        }
        if let Some(term) = self.value_cache.get(&id) {
            return Ok(term);
        }
        let offset = inner.offsets[(id - 1) as usize];
        let (kind, payload) = read_entry_at(&mut inner.file, offset)?;
        let term = self.decode_term(inner, kind, &payload)?;
        self.value_cache.put(id, term.clone());
        Ok(term)
    }
}

impl ValueStore for FileValueStore {
    fn store_value(&self, term: &Term) -> Result<TermId> {
        if let Some(id) = self.value_id_cache.get(term) {
            return Ok(id);
        }
        let mut inner = self.inner.lock();
        let (kind, payload) = self
            .encode_term(&mut inner, term, true)?
            .expect("encode with create cannot miss");
        let id = self.resolve_entry(&mut inner, kind, &payload, true)?;
        drop(inner);
        self.value_id_cache.put(term.clone(), id);
        self.value_cache.put(id, term.clone());
        Ok(id)
    }

    fn get_id(&self, term: &Term) -> Result<TermId> {
        if let Some(id) = self.value_id_cache.get(term) {
            return Ok(id);
        }
        let mut inner = self.inner.lock();
        let Some((kind, payload)) = self.encode_term(&mut inner, term, false)? else {
            return Ok(UNKNOWN_ID);
        };
        let id = self.resolve_entry(&mut inner, kind, &payload, false)?;
        drop(inner);
        if id != UNKNOWN_ID {
            self.value_id_cache.put(term.clone(), id);
        }
        Ok(id)
    }

    fn get_value(&self, id: TermId) -> Result<Term> {
        let mut inner = self.inner.lock();
        self.read_term(&mut inner, id)
    }

    fn sync(&self) -> Result<()> {
        self.inner.lock().file.sync_data()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.sync()
    }
}

fn cache_capacity(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size.max(1)).expect("max(1) is non-zero")
}

fn next_id(offsets: &[u64]) -> Result<TermId> {
    let next = offsets.len() as i64 + 1;
    if next >= UNKNOWN_ID as i64 {
        return Err(StoreError::InvalidArgument(
            "value store identifier space exhausted".into(),
        ));
    }
    Ok(next as TermId)
}

fn entry_hash(kind: u8, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[kind]);
    hasher.update(payload);
    hasher.finalize()
}

fn read_entry(file: &mut File, pos: u64, len: u64, path: &Path) -> Result<(u8, Vec<u8>)> {
    if pos + 5 > len {
        return Err(StoreError::Corruption(format!(
            "value log {} has a truncated entry header",
            path.display()
        )));
    }
    let (kind, payload_len) = read_entry_header(file, pos)?;
    if pos + 5 + payload_len as u64 > len {
        return Err(StoreError::Corruption(format!(
            "value log {} has a truncated entry payload",
            path.display()
        )));
    }
    let mut payload = vec![0u8; payload_len as usize];
    file.read_exact(&mut payload)?;
    Ok((kind, payload))
}

fn read_entry_at(file: &mut File, pos: u64) -> Result<(u8, Vec<u8>)> {
    let (kind, payload_len) = read_entry_header(file, pos)?;
    let mut payload = vec![0u8; payload_len as usize];
    file.read_exact(&mut payload)?;
    Ok((kind, payload))
}

fn read_entry_header(file: &mut File, pos: u64) -> Result<(u8, u32)> {
    file.seek(SeekFrom::Start(pos))?;
    let mut header = [0u8; 5];
    file.read_exact(&mut header)?;
    let payload_len = u32::from_le_bytes(header[1..5].try_into().expect("4 bytes"));
    Ok((header[0], payload_len))
}

/// Splits an IRI after the last `#`, `/` or `:`, yielding the namespace
/// and local-name parts. An IRI with no separator is all local name.
fn split_iri(iri: &str) -> (&str, &str) {
    match iri.rfind(['#', '/', ':']) {
        Some(idx) => iri.split_at(idx + 1),
        None => ("", iri),
    }
}
