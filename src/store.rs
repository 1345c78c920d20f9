//! In-memory configuration store
//!
//! [`ConfigStore`] maps keys to [`TypedValue`]s and owns everything around
//! them: the injected default store used for resets, the queue of keys whose
//! deletion has not yet reached durable storage, the field binders of
//! registered objects and the persistence backend.
//!
//! Errors at the application-facing boundary (`put`, backend load/store) are
//! never returned to the caller. They are logged and recorded, and can be
//! inspected with [`ConfigStore::absorbed_errors`].

use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::binder::{BinderRegistry, FieldAccessors, FieldBinder, ObjectId};
use crate::error::{CfgError, Result};
use crate::item::{ItemFlags, ObjectRegistry, TypedValue, Value};
use crate::persistence::PersistenceBackend;

#[derive(Default)]
pub struct ConfigStore {
    entries: BTreeMap<String, TypedValue>,
    defaults: Option<Box<ConfigStore>>,
    remove_queue: BTreeSet<String>,
    binders: BinderRegistry,
    objects: ObjectRegistry,
    backend: Option<Box<dyn PersistenceBackend>>,
    absorbed: Vec<CfgError>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("entries", &self.entries)
            .field("defaults", &self.defaults)
            .field("remove_queue", &self.remove_queue)
            .field("binders", &self.binders)
            .field("objects", &self.objects)
            .field("backend", &self.backend.as_ref().map(|backend| backend.name()))
            .finish()
    }
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose resets draw from `defaults`
    pub fn with_defaults(defaults: ConfigStore) -> Self {
        let mut store = Self::new();
        store.set_default_store(defaults);
        store
    }

    pub fn with_backend(mut self, backend: Box<dyn PersistenceBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Install the factory-default store. A default store never has its own.
    pub fn set_default_store(&mut self, mut defaults: ConfigStore) {
        if defaults.defaults.take().is_some() {
            warn!("Default store carried its own default store, dropping it");
        }
        self.defaults = Some(Box::new(defaults));
    }

    pub fn default_store(&self) -> Option<&ConfigStore> {
        self.defaults.as_deref()
    }

    /// Default store for startup population, created empty on first use
    pub fn default_store_mut(&mut self) -> &mut ConfigStore {
        self.defaults.get_or_insert_with(Default::default)
    }

    pub fn set_backend(&mut self, backend: Box<dyn PersistenceBackend>) {
        self.backend = Some(backend);
    }

    pub fn take_backend(&mut self) -> Option<Box<dyn PersistenceBackend>> {
        self.backend.take()
    }

    pub fn object_registry(&self) -> &ObjectRegistry {
        &self.objects
    }

    pub fn object_registry_mut(&mut self) -> &mut ObjectRegistry {
        &mut self.objects
    }

    // ==========================================================================
    // Entries
    // ==========================================================================

    /// Insert or replace an entry as-is, cancelling any pending removal
    pub fn insert_item(&mut self, item: TypedValue) {
        self.remove_queue.remove(item.key());
        self.entries.insert(item.key().to_string(), item);
    }

    pub fn item(&self, key: &str) -> Option<&TypedValue> {
        self.entries.get(key)
    }

    pub fn items(&self) -> impl Iterator<Item = &TypedValue> {
        self.entries.values()
    }

    /// Keys in ascending order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store `value` under `key`; an existing entry keeps its type.
    pub fn try_put(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        match self.entries.get_mut(key) {
            Some(item) => item.put_value(value, false),
            None => {
                self.insert_item(TypedValue::with_value(key, value));
                Ok(())
            }
        }
    }

    /// Like [`ConfigStore::try_put`], but a type mismatch is logged and
    /// recorded instead of returned; the stored value stays unchanged.
    pub fn put(&mut self, key: &str, value: impl Into<Value>) {
        if let Err(err) = self.try_put(key, value) {
            warn!(key = %key, error = %err, "Ignoring put");
            self.absorbed.push(err);
        }
    }

    /// Store `value`, re-typing the entry if needed
    pub fn put_with_type_change(&mut self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        match self.entries.get_mut(key) {
            Some(item) => {
                // Cannot fail with a type change allowed
                let _ = item.put_value(value, true);
            }
            None => self.insert_item(TypedValue::with_value(key, value)),
        }
    }

    /// Decoded value for `key`, or `default` when absent, malformed or of
    /// another kind than `T`
    pub fn get<T: TryFrom<Value>>(&self, key: &str, default: T) -> T {
        self.get_value(key)
            .and_then(|value| T::try_from(value).ok())
            .unwrap_or(default)
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get(key, default.to_string())
    }

    pub fn get_or(&self, key: &str, default: Value) -> Value {
        match self.entries.get(key) {
            Some(item) => item.get_value(default),
            None => default,
        }
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.entries.get(key)?.decode()
    }

    /// Rebuild an object-typed value through the object registry.
    ///
    /// `None` when the key is absent, not an object, or its class has no
    /// registered parser.
    pub fn get_object(&self, key: &str) -> Option<Box<dyn Any>> {
        match self.get_value(key)? {
            Value::Object(object) => self.objects.resolve(&object),
            other => {
                debug!(key = %key, value_type = %other.value_type(), "Entry is not an object");
                None
            }
        }
    }

    pub fn get_object_as<T: 'static>(&self, key: &str) -> Option<T> {
        self.get_object(key)?.downcast::<T>().ok().map(|boxed| *boxed)
    }

    /// Delete `key` and queue its removal from durable storage
    pub fn remove(&mut self, key: &str) -> Option<TypedValue> {
        self.remove_queue.insert(key.to_string());
        self.entries.remove(key)
    }

    /// Keys queued for deletion from durable storage
    pub fn pending_removals(&self) -> impl Iterator<Item = &str> {
        self.remove_queue.iter().map(String::as_str)
    }

    pub fn flags(&self, key: &str) -> Option<ItemFlags> {
        self.entries.get(key).map(TypedValue::flags)
    }

    /// Mark `key` as surviving resets. Returns false if the key is absent.
    pub fn set_no_reset(&mut self, key: &str, no_reset: bool) -> bool {
        let Some(item) = self.entries.get_mut(key) else {
            return false;
        };
        let mut flags = item.flags();
        flags.set(ItemFlags::NO_RESET, no_reset);
        item.set_flags(flags);
        true
    }

    // ==========================================================================
    // Defaults
    // ==========================================================================

    /// Remove every entry not flagged `NO_RESET` (all of them with
    /// `remove_no_reset`). Removed keys are queued for storage deletion.
    pub fn clear_all_settings(&mut self, remove_no_reset: bool) {
        let doomed: Vec<String> = self
            .entries
            .values()
            .filter(|item| remove_no_reset || !item.is_no_reset())
            .map(|item| item.key().to_string())
            .collect();
        debug!(count = doomed.len(), remove_no_reset, "Clearing settings");
        for key in doomed {
            self.remove(&key);
        }
    }

    /// Copy default entries that are missing here (or every one with
    /// `overwrite_existing`)
    pub fn copy_all_settings_from_default(&mut self, overwrite_existing: bool) {
        let Some(defaults) = self.defaults.as_deref() else {
            debug!("No default store, nothing to copy");
            return;
        };
        let copied: Vec<TypedValue> = defaults
            .entries
            .values()
            .filter(|item| overwrite_existing || !self.entries.contains_key(item.key()))
            .cloned()
            .collect();
        for item in copied {
            self.insert_item(item);
        }
    }

    /// Reset against the default store.
    ///
    /// Resettable entries without a default are dropped, then every default
    /// missing here is filled in. Existing values with a default and
    /// `NO_RESET` entries are kept.
    pub fn set_defaults(&mut self) {
        let stale: Vec<String> = self
            .entries
            .values()
            .filter(|item| !item.is_no_reset())
            .filter(|item| {
                !self
                    .defaults
                    .as_deref()
                    .is_some_and(|defaults| defaults.contains(item.key()))
            })
            .map(|item| item.key().to_string())
            .collect();
        for key in stale {
            self.remove(&key);
        }
        self.copy_all_settings_from_default(false);
        info!(entries = self.entries.len(), "Applied default settings");
    }

    // ==========================================================================
    // Value arrays (`base0`, `base1`, ...)
    // ==========================================================================

    fn array_len(&self, base: &str) -> usize {
        (0..)
            .take_while(|index| self.entries.contains_key(&format!("{base}{index}")))
            .count()
    }

    /// Values of the contiguous run `base0, base1, ...`; a gap ends the scan
    pub fn get_value_array(&self, base: &str) -> Vec<Value> {
        (0..self.array_len(base))
            .filter_map(|index| self.entries.get(&format!("{base}{index}")))
            .map(|item| item.get_value(Value::String(String::new())))
            .collect()
    }

    /// Replace the contiguous run under `base` with `values`
    pub fn put_value_array<V: Into<Value>>(&mut self, base: &str, values: impl IntoIterator<Item = V>) {
        for index in 0..self.array_len(base) {
            self.remove(&format!("{base}{index}"));
        }
        for (index, value) in values.into_iter().enumerate() {
            self.put(&format!("{base}{index}"), value);
        }
    }

    // ==========================================================================
    // Object binding
    // ==========================================================================

    /// Bind `fields` of `object` to keys `<path>.<name>.<field>`
    pub fn register_object<T: 'static>(
        &mut self,
        path: &str,
        name: &str,
        fields: &[&str],
        object: &Rc<RefCell<T>>,
        accessors: impl Into<Rc<FieldAccessors<T>>>,
    ) -> ObjectId {
        let fields = fields.iter().map(|field| field.to_string()).collect();
        let binder = FieldBinder::instance(path, name, Some(fields), object, accessors.into());
        self.binders.insert(binder);
        ObjectId::of(object)
    }

    /// Bind `object` using the field list of the class binder `(class_path, class_name)`
    pub fn register_object_with_class<T: 'static>(
        &mut self,
        path: &str,
        name: &str,
        class_path: &str,
        class_name: &str,
        object: &Rc<RefCell<T>>,
        accessors: impl Into<Rc<FieldAccessors<T>>>,
    ) -> ObjectId {
        let mut binder = FieldBinder::instance(path, name, None, object, accessors.into());
        binder.set_class_reference(class_path, class_name);
        self.binders.insert(binder);
        ObjectId::of(object)
    }

    /// Register a class binder: a shared field list with no object
    pub fn register_class(&mut self, path: &str, name: &str, fields: &[&str]) {
        let fields = fields.iter().map(|field| field.to_string()).collect();
        self.binders.insert(FieldBinder::class(path, name, fields));
    }

    pub fn set_class_reference<T>(
        &mut self,
        object: &Rc<RefCell<T>>,
        class_path: &str,
        class_name: &str,
    ) -> Result<()> {
        let binder = self
            .binders
            .by_object_mut(ObjectId::of(object))
            .ok_or(CfgError::NotRegistered)?;
        binder.set_class_reference(class_path, class_name);
        Ok(())
    }

    pub fn unregister_object<T>(&mut self, object: &Rc<RefCell<T>>) -> Result<()> {
        let binder = self.binders.remove_object(ObjectId::of(object))?;
        debug!(path = %binder.path(), name = %binder.name(), "Unregistered object");
        Ok(())
    }

    pub fn is_registered<T>(&self, object: &Rc<RefCell<T>>) -> bool {
        self.binders.contains_object(ObjectId::of(object))
    }

    /// Binder currently indexed under `(path, name)`
    pub fn binder_for(&self, path: &str, name: &str) -> Option<&FieldBinder> {
        self.binders.by_name(path, name)
    }

    /// Push stored values into every registered object
    pub fn load_objects_from_preferences(&self) {
        self.binders.load_all(self);
    }

    /// Pull field values from every registered object into the store
    pub fn store_objects_to_preferences(&mut self) {
        let binders = std::mem::take(&mut self.binders);
        binders.store_all(self);
        self.binders = binders;
    }

    // ==========================================================================
    // Persistence
    // ==========================================================================

    fn absorb(&mut self, err: CfgError, operation: &str, path: &str) {
        warn!(operation, path = %path, error = %err, "Persistence operation failed");
        self.absorbed.push(err);
    }

    /// Apply queued removals through `backend`; the queue is consumed either way
    fn flush_removals(&mut self, backend: &mut dyn PersistenceBackend, path: &str) {
        if self.remove_queue.is_empty() {
            return;
        }
        let keys: Vec<String> = std::mem::take(&mut self.remove_queue).into_iter().collect();
        debug!(path = %path, count = keys.len(), "Flushing queued removals");
        if let Err(err) = backend.try_remove_keys(path, &keys) {
            self.absorb(err, "remove_keys", path);
        }
    }

    fn with_backend_do(&mut self, path: &str, operation: &str, run: impl FnOnce(&mut Self, &mut dyn PersistenceBackend) -> Result<usize>) {
        let Some(mut backend) = self.backend.take() else {
            warn!(operation, path = %path, "No persistence backend registered");
            return;
        };
        self.flush_removals(backend.as_mut(), path);
        match run(self, backend.as_mut()) {
            Ok(count) => debug!(operation, path = %path, count, backend = backend.name(), "Persistence operation complete"),
            Err(err) => self.absorb(err, operation, path),
        }
        self.backend = Some(backend);
    }

    /// Flush queued removals, then read `path` from the backend
    pub fn load_preferences(&mut self, path: &str) {
        self.with_backend_do(path, "load", |store, backend| backend.try_load(path, store));
    }

    /// Flush queued removals, then write every entry to `path`
    pub fn store_preferences(&mut self, path: &str) {
        self.with_backend_do(path, "store", |store, backend| backend.try_store(path, store));
    }

    /// Errors swallowed by `put` and the persistence calls, oldest first
    pub fn absorbed_errors(&self) -> &[CfgError] {
        &self.absorbed
    }

    pub fn take_absorbed_errors(&mut self) -> Vec<CfgError> {
        std::mem::take(&mut self.absorbed)
    }
}
