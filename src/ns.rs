//! Persistent prefix-to-namespace mapping.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Name of the namespace file inside the data directory.
pub const NAMESPACES_FILE: &str = "namespaces.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct NamespaceDoc {
    namespaces: BTreeMap<String, String>,
}

struct NsState {
    map: BTreeMap<String, String>,
    dirty: bool,
}

/// Prefix ↔ namespace-name map, persisted as a small JSON document.
pub struct NamespaceStore {
    path: PathBuf,
    state: Mutex<NsState>,
}

impl NamespaceStore {
    /// Loads the namespace file inside `dir`, starting empty when absent.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(NAMESPACES_FILE);
        let map = if path.exists() {
            let doc: NamespaceDoc = serde_json::from_reader(BufReader::new(File::open(&path)?))
                .map_err(|e| {
                    crate::error::StoreError::Corruption(format!(
                        "malformed namespace file {}: {e}",
                        path.display()
                    ))
                })?;
            doc.namespaces
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            state: Mutex::new(NsState { map, dirty: false }),
        })
    }

    /// Returns the namespace name bound to `prefix`.
    pub fn get(&self, prefix: &str) -> Option<String> {
        self.state.lock().map.get(prefix).cloned()
    }

    /// Binds `prefix` to `name`, replacing any previous binding.
    pub fn set(&self, prefix: &str, name: &str) {
        let mut state = self.state.lock();
        state.map.insert(prefix.to_string(), name.to_string());
        state.dirty = true;
    }

    /// Removes the binding for `prefix`, returning the old name.
    pub fn remove(&self, prefix: &str) -> Option<String> {
        let mut state = self.state.lock();
        let old = state.map.remove(prefix);
        if old.is_some() {
            state.dirty = true;
        }
        old
    }

    /// Drops every binding.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        if !state.map.is_empty() {
            state.map.clear();
            state.dirty = true;
        }
    }

    /// Snapshot of all bindings, sorted by prefix.
    pub fn iter(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Writes the map to disk if it changed.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.dirty {
            return Ok(());
        }
        let doc = NamespaceDoc {
            namespaces: state.map.clone(),
        };
        let mut writer = BufWriter::new(File::create(&self.path)?);
        serde_json::to_writer_pretty(&mut writer, &doc)
            .map_err(|e| crate::error::StoreError::Io(e.into()))?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        state.dirty = false;
        Ok(())
    }

    /// Syncs and releases the store.
    pub fn close(&self) -> Result<()> {
        self.sync()
    }
}
