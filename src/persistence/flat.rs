//! Flat key-value backend
//!
//! Each entry becomes two string values in a hierarchical namespace node:
//! `<key>.data` holds the encoded value, `<key>.meta` the metadata. The
//! namespace is always live, so there is nothing to flush.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::{PersistenceBackend, decode_record};
use crate::constants::flat::{DATA_SUFFIX, META_SUFFIX, NODE_FILENAME, PATH_SEPARATOR};
use crate::error::{CfgError, Result};
use crate::store::ConfigStore;

/// A hierarchical string key-value namespace, addressed by node path
pub trait KeyValueNamespace {
    /// All keys stored directly in `node`
    fn keys(&self, node: &str) -> Result<Vec<String>>;

    fn get(&self, node: &str, key: &str) -> Result<Option<String>>;

    fn put(&mut self, node: &str, key: &str, value: &str) -> Result<()>;

    fn remove(&mut self, node: &str, key: &str) -> Result<()>;

    /// Remove every key of `node`
    fn clear(&mut self, node: &str) -> Result<()>;

    /// Every key/value pair of `node`
    fn entries(&self, node: &str) -> Result<BTreeMap<String, String>> {
        let mut entries = BTreeMap::new();
        for key in self.keys(node)? {
            if let Some(value) = self.get(node, &key)? {
                entries.insert(key, value);
            }
        }
        Ok(entries)
    }

    fn put_all(&mut self, node: &str, entries: &[(String, String)]) -> Result<()> {
        for (key, value) in entries {
            self.put(node, key, value)?;
        }
        Ok(())
    }

    fn remove_all(&mut self, node: &str, keys: &[String]) -> Result<()> {
        for key in keys {
            self.remove(node, key)?;
        }
        Ok(())
    }
}

/// Namespace held entirely in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryNamespace {
    nodes: BTreeMap<String, BTreeMap<String, String>>,
}

impl MemoryNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, node: &str) -> Option<&BTreeMap<String, String>> {
        self.nodes.get(node)
    }
}

impl KeyValueNamespace for MemoryNamespace {
    fn keys(&self, node: &str) -> Result<Vec<String>> {
        Ok(self
            .nodes
            .get(node)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn get(&self, node: &str, key: &str) -> Result<Option<String>> {
        Ok(self.nodes.get(node).and_then(|entries| entries.get(key)).cloned())
    }

    fn put(&mut self, node: &str, key: &str, value: &str) -> Result<()> {
        self.nodes
            .entry(node.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, node: &str, key: &str) -> Result<()> {
        if let Some(entries) = self.nodes.get_mut(node) {
            entries.remove(key);
        }
        Ok(())
    }

    fn clear(&mut self, node: &str) -> Result<()> {
        self.nodes.remove(node);
        Ok(())
    }

    fn entries(&self, node: &str) -> Result<BTreeMap<String, String>> {
        Ok(self.nodes.get(node).cloned().unwrap_or_default())
    }
}

/// Namespace stored on disk: node `a/b` lives in `<root>/a/b/prefs.json`
#[derive(Debug, Clone)]
pub struct FileNamespace {
    root: PathBuf,
}

fn unavailable(path: &Path, err: impl std::fmt::Display) -> CfgError {
    CfgError::BackendUnavailable(format!("{}: {err}", path.display()))
}

impl FileNamespace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn node_file(&self, node: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for segment in node.split(PATH_SEPARATOR).filter(|segment| !segment.is_empty()) {
            if segment == "." || segment == ".." {
                return Err(CfgError::invalid(format!("node path '{node}' escapes the namespace root")));
            }
            path.push(segment);
        }
        path.push(NODE_FILENAME);
        Ok(path)
    }

    fn read_node(&self, node: &str) -> Result<BTreeMap<String, String>> {
        let path = self.node_file(node)?;
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(unavailable(&path, err)),
        }
    }

    /// Write via temp file + rename so a crash never leaves a torn node
    fn write_node(&self, node: &str, entries: &BTreeMap<String, String>) -> Result<()> {
        let path = self.node_file(node)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| unavailable(parent, err))?;
        }
        let json = serde_json::to_string_pretty(entries)?;
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, json).map_err(|err| unavailable(&temp, err))?;
        fs::rename(&temp, &path).map_err(|err| unavailable(&path, err))?;
        Ok(())
    }

    fn update_node(&self, node: &str, update: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<()> {
        let mut entries = self.read_node(node)?;
        update(&mut entries);
        self.write_node(node, &entries)
    }
}

impl KeyValueNamespace for FileNamespace {
    fn keys(&self, node: &str) -> Result<Vec<String>> {
        Ok(self.read_node(node)?.into_keys().collect())
    }

    fn get(&self, node: &str, key: &str) -> Result<Option<String>> {
        Ok(self.read_node(node)?.remove(key))
    }

    fn put(&mut self, node: &str, key: &str, value: &str) -> Result<()> {
        self.update_node(node, |entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&mut self, node: &str, key: &str) -> Result<()> {
        self.update_node(node, |entries| {
            entries.remove(key);
        })
    }

    fn clear(&mut self, node: &str) -> Result<()> {
        let path = self.node_file(node)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(unavailable(&path, err)),
        }
    }

    fn entries(&self, node: &str) -> Result<BTreeMap<String, String>> {
        self.read_node(node)
    }

    fn put_all(&mut self, node: &str, new_entries: &[(String, String)]) -> Result<()> {
        self.update_node(node, |entries| {
            entries.extend(new_entries.iter().cloned());
        })
    }

    fn remove_all(&mut self, node: &str, keys: &[String]) -> Result<()> {
        self.update_node(node, |entries| {
            for key in keys {
                entries.remove(key);
            }
        })
    }
}

/// Backend over any [`KeyValueNamespace`]
#[derive(Debug, Clone)]
pub struct FlatKvBackend<N> {
    namespace: N,
}

impl<N: KeyValueNamespace> FlatKvBackend<N> {
    pub fn new(namespace: N) -> Self {
        Self { namespace }
    }

    pub fn namespace(&self) -> &N {
        &self.namespace
    }

    pub fn into_namespace(self) -> N {
        self.namespace
    }
}

impl<N: KeyValueNamespace> PersistenceBackend for FlatKvBackend<N> {
    fn name(&self) -> &'static str {
        "flat"
    }

    fn try_load(&mut self, path: &str, store: &mut ConfigStore) -> Result<usize> {
        let entries = self.namespace.entries(path)?;
        let mut loaded = 0;
        for (data_key, data) in &entries {
            let Some(key) = data_key.strip_suffix(DATA_SUFFIX) else {
                continue;
            };
            let Some(meta) = entries.get(&format!("{key}{META_SUFFIX}")) else {
                warn!(key = %key, path = %path, "Data entry without metadata, skipping");
                continue;
            };
            if let Some(item) = decode_record(key, data, meta) {
                store.insert_item(item);
                loaded += 1;
            }
        }
        info!(path = %path, loaded, "Loaded preferences from namespace");
        Ok(loaded)
    }

    fn try_store(&mut self, path: &str, store: &ConfigStore) -> Result<usize> {
        let entries: Vec<(String, String)> = store
            .items()
            .flat_map(|item| {
                [
                    (format!("{}{DATA_SUFFIX}", item.key()), item.encoded().to_string()),
                    (format!("{}{META_SUFFIX}", item.key()), item.encode_meta()),
                ]
            })
            .collect();
        self.namespace.put_all(path, &entries)?;
        debug!(path = %path, stored = store.len(), "Stored preferences to namespace");
        Ok(store.len())
    }

    fn try_remove_keys(&mut self, path: &str, keys: &[String]) -> Result<()> {
        let doomed: Vec<String> = keys
            .iter()
            .flat_map(|key| [format!("{key}{DATA_SUFFIX}"), format!("{key}{META_SUFFIX}")])
            .collect();
        self.namespace.remove_all(path, &doomed)
    }

    fn try_clear(&mut self, path: &str) -> Result<()> {
        self.namespace.clear(path)
    }
}
