//! Durable storage backends
//!
//! A backend moves a whole key set between a [`ConfigStore`] and durable
//! storage under a path. Every entry travels as a pair of strings: the
//! encoded value and its metadata.
//!
//! - **flat**: two entries per key (`<key>.data`, `<key>.meta`) in a
//!   hierarchical key-value namespace
//! - **tree**: `<entry key=.. value=.. meta=..>` nodes in a cached XML
//!   document, merged rather than replaced on load

pub mod flat;
pub mod tree;
pub mod xml;

use tracing::{error, warn};

use crate::error::Result;
use crate::item::TypedValue;
use crate::store::ConfigStore;

pub use flat::{FileNamespace, FlatKvBackend, KeyValueNamespace, MemoryNamespace};
pub use tree::TreeBackend;

/// Grouped load/store/remove/clear operations over one storage format.
///
/// The `try_*` methods report failures; the provided methods without the
/// prefix log them and carry on, so callers never see a backend error.
pub trait PersistenceBackend {
    /// Short name for log output
    fn name(&self) -> &'static str;

    /// Read every entry under `path` into `store`. Returns the number of
    /// entries delivered.
    fn try_load(&mut self, path: &str, store: &mut ConfigStore) -> Result<usize>;

    /// Write every entry of `store` under `path`. Returns the number written.
    fn try_store(&mut self, path: &str, store: &ConfigStore) -> Result<usize>;

    /// Delete `keys` under `path`
    fn try_remove_keys(&mut self, path: &str, keys: &[String]) -> Result<()>;

    /// Delete every key under `path`
    fn try_clear(&mut self, path: &str) -> Result<()>;

    fn load(&mut self, path: &str, store: &mut ConfigStore) {
        if let Err(err) = self.try_load(path, store) {
            error!(backend = self.name(), path = %path, error = %err, "Failed to load preferences");
        }
    }

    fn store(&mut self, path: &str, store: &ConfigStore) {
        if let Err(err) = self.try_store(path, store) {
            error!(backend = self.name(), path = %path, error = %err, "Failed to store preferences");
        }
    }

    fn remove_keys(&mut self, path: &str, keys: &[String]) {
        if let Err(err) = self.try_remove_keys(path, keys) {
            error!(backend = self.name(), path = %path, error = %err, "Failed to remove keys");
        }
    }

    /// Returns false if the storage could not be cleared
    fn clear(&mut self, path: &str) -> bool {
        match self.try_clear(path) {
            Ok(()) => true,
            Err(err) => {
                error!(backend = self.name(), path = %path, error = %err, "Failed to clear preferences");
                false
            }
        }
    }
}

/// Rebuild an entry from a persisted record; malformed metadata drops the
/// record with a warning.
pub(crate) fn decode_record(key: &str, value: &str, meta: &str) -> Option<TypedValue> {
    TypedValue::from_encoded(key, value, meta)
        .inspect_err(|err| warn!(key = %key, meta = %meta, error = %err, "Skipping record with malformed metadata"))
        .ok()
}
