//! XML file backend with a merged in-memory tree cache
//!
//! The cache is built the first time it is needed and kept for the lifetime
//! of the backend. Loading a path merges that path's entries from disk into
//! the cache instead of replacing it, and every write serializes the whole
//! cache, so paths sharing one file never clobber each other.
//!
//! Single writer only: the file is read before every cache build and written
//! in full on every change, with no locking.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info};

use super::xml::PrefsTree;
use super::{PersistenceBackend, decode_record};
use crate::constants::tree::CORRUPT_EXTENSION;
use crate::error::{CfgError, Result};
use crate::store::ConfigStore;

#[derive(Debug)]
pub struct TreeBackend {
    file: PathBuf,
    cache: Option<PrefsTree>,
}

fn unavailable(path: &Path, err: impl std::fmt::Display) -> CfgError {
    CfgError::BackendUnavailable(format!("{}: {err}", path.display()))
}

impl TreeBackend {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            cache: None,
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    /// The cached document, once built
    pub fn cache(&self) -> Option<&PrefsTree> {
        self.cache.as_ref()
    }

    /// Parse the file; `None` when it does not exist yet. A document that
    /// fails to parse is copied aside before the error is returned.
    fn read_file(&self) -> Result<Option<PrefsTree>> {
        let contents = match fs::read_to_string(&self.file) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(file = %self.file.display(), "Preferences file does not exist yet");
                return Ok(None);
            }
            Err(err) => return Err(unavailable(&self.file, err)),
        };
        PrefsTree::parse(&contents)
            .map(Some)
            .inspect_err(|err| self.quarantine(err))
    }

    /// Keep the bytes of an unreadable document next to it as `*.corrupt`
    fn quarantine(&self, err: &CfgError) {
        let backup = self.file.with_extension(CORRUPT_EXTENSION);
        match fs::copy(&self.file, &backup) {
            Ok(_) => error!(file = %self.file.display(), backup = %backup.display(), error = %err, "Preferences file is corrupt, starting empty"),
            Err(copy_err) => error!(file = %self.file.display(), error = %err, copy_error = %copy_err, "Preferences file is corrupt and could not be backed up"),
        }
    }

    /// Cache, built from disk (or empty on first run) if not yet in memory.
    /// A corrupt document yields an empty cache; only I/O failures are errors.
    fn ensure_cache(&mut self) -> Result<&mut PrefsTree> {
        if self.cache.is_none() {
            let tree = match self.read_file() {
                Ok(tree) => tree.unwrap_or_default(),
                Err(err) if !err.is_backend_failure() => PrefsTree::default(),
                Err(err) => return Err(err),
            };
            debug!(file = %self.file.display(), nodes = tree.nodes.len(), "Built preferences cache");
            self.cache = Some(tree);
        }
        Ok(self.cache.get_or_insert_with(PrefsTree::default))
    }

    /// Existing cache (or a new one) with `path` emptied
    fn reset_path(cache: Option<PrefsTree>, path: &str) -> PrefsTree {
        let mut cache = cache.unwrap_or_default();
        cache.node_or_insert(path).clear();
        cache
    }

    /// Serialize the entire cache to the file (temp file + rename)
    fn write_cache(&self) -> Result<()> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };
        let xml = cache.to_xml()?;

        if let Some(parent) = self.file.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|err| unavailable(parent, err))?;
        }
        let temp = self.file.with_extension("xml.tmp");
        fs::write(&temp, xml).map_err(|err| unavailable(&temp, err))?;
        fs::rename(&temp, &self.file).map_err(|err| unavailable(&self.file, err))?;
        Ok(())
    }
}

impl PersistenceBackend for TreeBackend {
    fn name(&self) -> &'static str {
        "tree"
    }

    fn try_load(&mut self, path: &str, store: &mut ConfigStore) -> Result<usize> {
        let parsed = match self.read_file() {
            Ok(parsed) => parsed,
            // Nothing was found; later stores write a fresh document
            Err(err) if !err.is_backend_failure() => {
                self.cache = Some(Self::reset_path(self.cache.take(), path));
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let mut cache = match (self.cache.take(), parsed) {
            // First build adopts the whole document, other paths included
            (None, Some(parsed)) => parsed,
            (Some(mut cache), Some(parsed)) => {
                if let Some(node) = parsed.node(path) {
                    cache.node_or_insert(path).merge_from(node);
                }
                cache
            }
            (cache, None) => Self::reset_path(cache, path),
        };

        let node = cache.node_or_insert(path);
        let mut loaded = 0;
        for entry in &node.entries {
            if let Some(item) = decode_record(&entry.key, &entry.value, &entry.meta) {
                store.insert_item(item);
                loaded += 1;
            }
        }
        self.cache = Some(cache);

        info!(file = %self.file.display(), path = %path, loaded, "Loaded preferences");
        Ok(loaded)
    }

    fn try_store(&mut self, path: &str, store: &ConfigStore) -> Result<usize> {
        let node = self.ensure_cache()?.node_or_insert(path);
        for item in store.items() {
            node.upsert(item.key(), item.encoded(), &item.encode_meta());
        }
        self.write_cache()?;

        debug!(file = %self.file.display(), path = %path, stored = store.len(), "Stored preferences");
        Ok(store.len())
    }

    /// Removes entries from the file only; current store values are not
    /// written, pair with a store for that.
    fn try_remove_keys(&mut self, path: &str, keys: &[String]) -> Result<()> {
        if let Some(node) = self.ensure_cache()?.node_mut(path) {
            for key in keys {
                node.remove(key);
            }
        }
        self.write_cache()
    }

    fn try_clear(&mut self, path: &str) -> Result<()> {
        if let Some(node) = self.ensure_cache()?.node_mut(path) {
            node.clear();
        }
        self.write_cache()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{ItemFlags, Rect};

    fn backend_in(dir: &tempfile::TempDir) -> TreeBackend {
        TreeBackend::new(dir.path().join("prefs").join("preferences.xml"))
    }

    fn read_tree(backend: &TreeBackend) -> PrefsTree {
        PrefsTree::parse(&fs::read_to_string(backend.file()).unwrap()).unwrap()
    }

    #[test]
    fn test_end_to_end_new_instance() {
        let dir = tempfile::tempdir().unwrap();

        let mut store = ConfigStore::new().with_backend(Box::new(backend_in(&dir)));
        store.put("x.y.z", 42);
        store.put("frame", Rect::new(3, 4, 50, 60));
        store.store_preferences("app");
        assert!(store.absorbed_errors().is_empty());

        let mut reloaded = ConfigStore::new().with_backend(Box::new(backend_in(&dir)));
        reloaded.load_preferences("app");
        assert_eq!(reloaded.get("x.y.z", 0), 42);
        assert_eq!(reloaded.get("frame", Rect::default()), Rect::new(3, 4, 50, 60));
    }

    #[test]
    fn test_missing_file_is_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = backend_in(&dir);
        let mut store = ConfigStore::new();

        assert_eq!(backend.try_load("app", &mut store).unwrap(), 0);
        assert!(store.is_empty());
        assert!(backend.cache().unwrap().node("app").is_some());
        assert!(!backend.file().exists());
    }

    #[test]
    fn test_load_merges_into_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = backend_in(&dir);

        let mut app2 = ConfigStore::new();
        app2.put("other", 7);
        backend.try_store("app2", &app2).unwrap();

        // Another writer replaces the file with data for app1 only
        fs::write(
            backend.file(),
            r#"<preferences><root type="user"><node name="app1"><map>
                <entry key="a" value="5" meta="[i,n]"/>
            </map></node></root></preferences>"#,
        )
        .unwrap();

        let mut app1 = ConfigStore::new();
        assert_eq!(backend.try_load("app1", &mut app1).unwrap(), 1);
        assert_eq!(app1.get("a", 0), 5);

        let cache = backend.cache().unwrap();
        assert_eq!(cache.node("app2").unwrap().entry("other").unwrap().value, "7");

        backend.try_store("app1", &app1).unwrap();
        let on_disk = read_tree(&backend);
        assert_eq!(on_disk.node("app1").unwrap().entry("a").unwrap().value, "5");
        assert_eq!(on_disk.node("app2").unwrap().entry("other").unwrap().value, "7");
    }

    #[test]
    fn test_first_build_keeps_unloaded_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = backend_in(&dir);
        let mut first = ConfigStore::new();
        first.put("one", 1);
        writer.try_store("app1", &first).unwrap();
        let mut second = ConfigStore::new();
        second.put("two", 2);
        writer.try_store("app2", &second).unwrap();

        // Fresh instance touches app1 only
        let mut backend = backend_in(&dir);
        let mut store = ConfigStore::new();
        backend.try_load("app1", &mut store).unwrap();
        store.put("one", 11);
        backend.try_store("app1", &store).unwrap();

        let on_disk = read_tree(&backend);
        assert_eq!(on_disk.node("app1").unwrap().entry("one").unwrap().value, "11");
        assert_eq!(on_disk.node("app2").unwrap().entry("two").unwrap().value, "2");
    }

    #[test]
    fn test_load_twice_loses_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = backend_in(&dir);
        let mut source = ConfigStore::new();
        source.put("a", 1);
        source.put("b", "two");
        backend.try_store("app", &source).unwrap();

        let mut store = ConfigStore::new();
        backend.try_load("app", &mut store).unwrap();
        backend.try_load("app", &mut store).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(backend.cache().unwrap().node("app").unwrap().entries.len(), 2);
    }

    #[test]
    fn test_store_keeps_entries_missing_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = backend_in(&dir);
        let mut full = ConfigStore::new();
        full.put("a", 1);
        full.put("b", 2);
        backend.try_store("app", &full).unwrap();

        let mut partial = ConfigStore::new();
        partial.put("b", 3);
        backend.try_store("app", &partial).unwrap();

        let node = read_tree(&backend).node("app").unwrap().clone();
        assert_eq!(node.entry("a").unwrap().value, "1");
        assert_eq!(node.entry("b").unwrap().value, "3");
    }

    #[test]
    fn test_remove_keys_does_not_sync_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = backend_in(&dir);
        let mut store = ConfigStore::new();
        store.put("a", 1);
        store.put("b", 2);
        backend.try_store("app", &store).unwrap();

        store.put("b", 3);
        backend.try_remove_keys("app", &["a".to_string()]).unwrap();

        let node = read_tree(&backend).node("app").unwrap().clone();
        assert!(node.entry("a").is_none());
        assert_eq!(node.entry("b").unwrap().value, "2");
    }

    #[test]
    fn test_store_flushes_removals_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ConfigStore::new().with_backend(Box::new(backend_in(&dir)));
        store.put("a", 1);
        store.put("b", 2);
        store.store_preferences("app");

        store.remove("a");
        store.store_preferences("app");

        let mut reloaded = ConfigStore::new().with_backend(Box::new(backend_in(&dir)));
        reloaded.load_preferences("app");
        assert!(!reloaded.contains("a"));
        assert_eq!(reloaded.get("b", 0), 2);
    }

    #[test]
    fn test_clear_only_touches_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = backend_in(&dir);
        let mut store = ConfigStore::new();
        store.put("a", 1);
        backend.try_store("app1", &store).unwrap();
        backend.try_store("app2", &store).unwrap();

        assert!(backend.clear("app1"));
        let on_disk = read_tree(&backend);
        assert!(on_disk.node("app1").unwrap().entries.is_empty());
        assert_eq!(on_disk.node("app2").unwrap().entries.len(), 1);
    }

    #[test]
    fn test_flags_and_escaping_survive() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = backend_in(&dir);
        let mut store = ConfigStore::new();
        store.put("title", "<b>Fish & \"Chips\"</b>");
        store.set_no_reset("title", true);
        backend.try_store("app", &store).unwrap();

        let mut reloaded = ConfigStore::new();
        backend_in(&dir).try_load("app", &mut reloaded).unwrap();
        assert_eq!(reloaded.get_string("title", ""), "<b>Fish & \"Chips\"</b>");
        assert_eq!(reloaded.flags("title"), Some(ItemFlags::NO_RESET));
    }

    #[test]
    fn test_malformed_meta_skips_record() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_in(&dir);
        fs::create_dir_all(backend.file().parent().unwrap()).unwrap();
        fs::write(
            backend.file(),
            r#"<preferences><root type="user"><node name="app"><map>
                <entry key="good" value="1" meta="[i,n]"/>
                <entry key="bad" value="1" meta="[x,n]"/>
            </map></node></root></preferences>"#,
        )
        .unwrap();

        let mut store = ConfigStore::new();
        let mut backend = backend;
        assert_eq!(backend.try_load("app", &mut store).unwrap(), 1);
        assert!(store.contains("good"));
        assert!(!store.contains("bad"));
    }

    const CORRUPT: &str = r#"<preferences><root type="user"><node name="app"><map><entry key="k"/></map></node></root></preferences>"#;

    fn write_corrupt(backend: &TreeBackend) {
        fs::create_dir_all(backend.file().parent().unwrap()).unwrap();
        fs::write(backend.file(), CORRUPT).unwrap();
    }

    #[test]
    fn test_corrupt_file_recovers_on_store() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_in(&dir);
        write_corrupt(&backend);
        let backup = backend.file().with_extension(CORRUPT_EXTENSION);

        let mut store = ConfigStore::new().with_backend(Box::new(backend));
        store.load_preferences("app");
        assert!(store.is_empty());
        assert_eq!(store.take_absorbed_errors().len(), 1);

        store.put("x", 1);
        store.store_preferences("app");
        store.store_preferences("app");
        assert!(store.absorbed_errors().is_empty());

        let mut fresh = ConfigStore::new().with_backend(Box::new(backend_in(&dir)));
        fresh.load_preferences("app");
        assert_eq!(fresh.get("x", 0), 1);
        assert!(fresh.absorbed_errors().is_empty());

        assert_eq!(fs::read_to_string(backup).unwrap(), CORRUPT);
    }

    #[test]
    fn test_corrupt_file_store_without_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = backend_in(&dir);
        write_corrupt(&backend);

        let mut store = ConfigStore::new();
        store.put("k", 1);
        assert_eq!(backend.try_store("app", &store).unwrap(), 1);

        assert_eq!(read_tree(&backend).node("app").unwrap().entry("k").unwrap().value, "1");
        assert!(backend.file().with_extension(CORRUPT_EXTENSION).exists());
    }

    #[test]
    fn test_deleted_file_resets_loaded_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = backend_in(&dir);
        let mut source = ConfigStore::new();
        source.put("a", 1);
        backend.try_store("app", &source).unwrap();
        backend.try_store("other", &source).unwrap();

        fs::remove_file(backend.file()).unwrap();

        let mut store = ConfigStore::new();
        assert_eq!(backend.try_load("app", &mut store).unwrap(), 0);
        assert!(store.is_empty());

        let cache = backend.cache().unwrap();
        assert!(cache.node("app").unwrap().entries.is_empty());
        assert_eq!(cache.node("other").unwrap().entries.len(), 1);
    }

    #[test]
    fn test_many_keys_linear_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = backend_in(&dir);
        let mut store = ConfigStore::new();
        for index in 0..500i32 {
            store.put(&format!("key{index}"), index);
        }
        backend.try_store("app", &store).unwrap();
        backend.try_store("app", &store).unwrap();

        let mut reloaded = ConfigStore::new();
        assert_eq!(backend_in(&dir).try_load("app", &mut reloaded).unwrap(), 500);
        assert_eq!(reloaded.get("key499", 0), 499);
    }
}
