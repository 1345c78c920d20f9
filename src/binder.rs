//! Field binding between application objects and store keys
//!
//! A [`FieldBinder`] ties the named fields of one registered object to keys
//! of the form `<path>.<name>.<field>`. Field access goes through an explicit
//! [`FieldAccessors`] table supplied at registration time, with optional
//! before-store and after-load hooks.
//!
//! Class binders carry only a field list; instance binders registered without
//! their own list borrow the list of the class binder they reference.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use tracing::{debug, warn};

use crate::error::{CfgError, Result};
use crate::item::Value;
use crate::store::ConfigStore;

type Getter<T> = Box<dyn Fn(&T) -> Value>;
type Setter<T> = Box<dyn Fn(&mut T, Value)>;
type Hook<T> = Box<dyn Fn(&mut T)>;

/// Identity of a bound object (address of its shared cell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(usize);

impl ObjectId {
    pub fn of<T>(object: &Rc<RefCell<T>>) -> Self {
        ObjectId(Rc::as_ptr(object) as *const () as usize)
    }
}

/// Accessor table for one object type: field name → (getter, setter),
/// plus the optional hooks.
pub struct FieldAccessors<T> {
    fields: HashMap<String, (Getter<T>, Setter<T>)>,
    before_store: Option<Hook<T>>,
    after_load: Option<Hook<T>>,
}

impl<T> Default for FieldAccessors<T> {
    fn default() -> Self {
        Self {
            fields: HashMap::new(),
            before_store: None,
            after_load: None,
        }
    }
}

impl<T> FieldAccessors<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(
        mut self,
        name: impl Into<String>,
        get: impl Fn(&T) -> Value + 'static,
        set: impl Fn(&mut T, Value) + 'static,
    ) -> Self {
        self.fields.insert(name.into(), (Box::new(get), Box::new(set)));
        self
    }

    /// Invoked before field values are written to the store
    pub fn before_store(mut self, hook: impl Fn(&mut T) + 'static) -> Self {
        self.before_store = Some(Box::new(hook));
        self
    }

    /// Invoked after field values are read from the store
    pub fn after_load(mut self, hook: impl Fn(&mut T) + 'static) -> Self {
        self.after_load = Some(Box::new(hook));
        self
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }
}

/// Type-erased view of a registered object
trait BoundObject {
    fn id(&self) -> ObjectId;
    fn get_field(&self, field: &str) -> Option<Value>;
    fn set_field(&self, field: &str, value: Value) -> bool;
    fn before_store(&self);
    fn after_load(&self);
}

struct Binding<T> {
    object: Rc<RefCell<T>>,
    accessors: Rc<FieldAccessors<T>>,
}

impl<T> Binding<T> {
    fn run_hook(&self, hook: &Option<Hook<T>>, label: &str) {
        let Some(hook) = hook else {
            return;
        };
        match self.object.try_borrow_mut() {
            Ok(mut object) => hook(&mut *object),
            Err(_) => warn!(hook = label, "Bound object is borrowed, skipping hook"),
        }
    }
}

impl<T> BoundObject for Binding<T> {
    fn id(&self) -> ObjectId {
        ObjectId::of(&self.object)
    }

    fn get_field(&self, field: &str) -> Option<Value> {
        let (get, _) = self.accessors.fields.get(field)?;
        match self.object.try_borrow() {
            Ok(object) => Some(get(&*object)),
            Err(_) => {
                warn!(field = %field, "Bound object is mutably borrowed, cannot read field");
                None
            }
        }
    }

    fn set_field(&self, field: &str, value: Value) -> bool {
        let Some((_, set)) = self.accessors.fields.get(field) else {
            return false;
        };
        match self.object.try_borrow_mut() {
            Ok(mut object) => {
                set(&mut *object, value);
                true
            }
            Err(_) => {
                warn!(field = %field, "Bound object is borrowed, cannot write field");
                false
            }
        }
    }

    fn before_store(&self) {
        self.run_hook(&self.accessors.before_store, "before_store");
    }

    fn after_load(&self) {
        self.run_hook(&self.accessors.after_load, "after_load");
    }
}

/// Binds the fields of one object (or, for a class binder, just a field
/// list) to keys under `<path>.<name>.`
pub struct FieldBinder {
    path: String,
    name: String,
    fields: Option<Vec<String>>,
    class_ref: Option<(String, String)>,
    object: Option<Box<dyn BoundObject>>,
    is_class: bool,
}

impl std::fmt::Debug for FieldBinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldBinder")
            .field("path", &self.path)
            .field("name", &self.name)
            .field("fields", &self.fields)
            .field("class_ref", &self.class_ref)
            .field("is_class", &self.is_class)
            .finish()
    }
}

impl FieldBinder {
    /// Field list shared by instance binders; never loaded or stored itself
    pub fn class(path: impl Into<String>, name: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            fields: Some(fields),
            class_ref: None,
            object: None,
            is_class: true,
        }
    }

    /// Instance binder; `fields = None` defers to a class binder set with
    /// [`FieldBinder::set_class_reference`]
    pub fn instance<T: 'static>(
        path: impl Into<String>,
        name: impl Into<String>,
        fields: Option<Vec<String>>,
        object: &Rc<RefCell<T>>,
        accessors: Rc<FieldAccessors<T>>,
    ) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            fields,
            class_ref: None,
            object: Some(Box::new(Binding {
                object: Rc::clone(object),
                accessors,
            })),
            is_class: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_class(&self) -> bool {
        self.is_class
    }

    pub fn fields(&self) -> Option<&[String]> {
        self.fields.as_deref()
    }

    pub fn class_reference(&self) -> Option<(&str, &str)> {
        self.class_ref
            .as_ref()
            .map(|(path, name)| (path.as_str(), name.as_str()))
    }

    pub fn set_class_reference(&mut self, path: impl Into<String>, name: impl Into<String>) {
        self.class_ref = Some((path.into(), name.into()));
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        self.object.as_ref().map(|object| object.id())
    }

    /// Config key for `field`: `<path>.<name>.<field>`
    pub fn key_for(&self, field: &str) -> String {
        format!("{}.{}.{}", self.path, self.name, field)
    }

    /// Own field list, else the referenced class binder's
    pub fn effective_fields<'a>(&'a self, class: Option<&'a FieldBinder>) -> &'a [String] {
        self.fields
            .as_deref()
            .or_else(|| class.and_then(|class| class.fields.as_deref()))
            .unwrap_or(&[])
    }

    fn bound_object(&self, direction: &str) -> Option<&dyn BoundObject> {
        if self.is_class {
            warn!(path = %self.path, name = %self.name, direction, "Class binder cannot be loaded or stored directly");
            return None;
        }
        let object = self.object.as_deref();
        if object.is_none() {
            warn!(path = %self.path, name = %self.name, direction, "Binder has no bound object");
        }
        object
    }

    /// Copy stored values into the bound object's fields, then run the
    /// after-load hook. Fields without a stored value are left unchanged.
    pub fn load_settings(&self, store: &ConfigStore, class: Option<&FieldBinder>) {
        let Some(object) = self.bound_object("load") else {
            return;
        };
        let fields = self.effective_fields(class);
        if fields.is_empty() {
            debug!(path = %self.path, name = %self.name, "No fields to load");
            return;
        }

        for field in fields {
            let key = self.key_for(field);
            let Some(value) = store.get_value(&key) else {
                continue;
            };
            if !object.set_field(field, value) {
                warn!(key = %key, "No accessor for bound field, skipping");
            }
        }
        object.after_load();
    }

    /// Run the before-store hook, then write every field into the store
    pub fn store_settings(&self, store: &mut ConfigStore, class: Option<&FieldBinder>) {
        let Some(object) = self.bound_object("store") else {
            return;
        };
        let fields = self.effective_fields(class);
        if fields.is_empty() {
            debug!(path = %self.path, name = %self.name, "No fields to store");
            return;
        }

        object.before_store();
        for field in fields {
            let key = self.key_for(field);
            match object.get_field(field) {
                Some(value) => store.put(&key, value),
                None => warn!(key = %key, "No accessor for bound field, skipping"),
            }
        }
    }
}

/// All binders of a store, indexed by `(path, name)` and by object identity.
///
/// A second binder registered under the same `(path, name)` replaces the
/// first in the name index (last write wins, no diagnostic).
#[derive(Debug, Default)]
pub struct BinderRegistry {
    binders: BTreeMap<u64, FieldBinder>,
    next_id: u64,
    by_name: HashMap<(String, String), u64>,
    by_object: HashMap<ObjectId, u64>,
}

impl BinderRegistry {
    pub fn insert(&mut self, binder: FieldBinder) {
        let id = self.next_id;
        self.next_id += 1;

        self.by_name
            .insert((binder.path.clone(), binder.name.clone()), id);
        if let Some(object_id) = binder.object_id() {
            self.by_object.insert(object_id, id);
        }
        self.binders.insert(id, binder);
    }

    pub fn remove_object(&mut self, object_id: ObjectId) -> Result<FieldBinder> {
        let id = self
            .by_object
            .remove(&object_id)
            .ok_or(CfgError::NotRegistered)?;
        let binder = self.binders.remove(&id).ok_or(CfgError::NotRegistered)?;

        let name_key = (binder.path.clone(), binder.name.clone());
        if self.by_name.get(&name_key) == Some(&id) {
            self.by_name.remove(&name_key);
        }
        Ok(binder)
    }

    pub fn by_name(&self, path: &str, name: &str) -> Option<&FieldBinder> {
        let id = self.by_name.get(&(path.to_string(), name.to_string()))?;
        self.binders.get(id)
    }

    pub fn by_object_mut(&mut self, object_id: ObjectId) -> Option<&mut FieldBinder> {
        let id = self.by_object.get(&object_id)?;
        self.binders.get_mut(id)
    }

    pub fn contains_object(&self, object_id: ObjectId) -> bool {
        self.by_object.contains_key(&object_id)
    }

    fn class_of(&self, binder: &FieldBinder) -> Option<&FieldBinder> {
        let (path, name) = binder.class_ref.as_ref()?;
        let class = self.by_name(path, name);
        if class.is_none() {
            warn!(path = %binder.path, name = %binder.name, class_path = %path, class_name = %name, "Referenced class binder is not registered");
        }
        class
    }

    fn instances(&self) -> impl Iterator<Item = &FieldBinder> {
        self.binders.values().filter(|binder| !binder.is_class)
    }

    pub fn load_all(&self, store: &ConfigStore) {
        for binder in self.instances() {
            binder.load_settings(store, self.class_of(binder));
        }
    }

    pub fn store_all(&self, store: &mut ConfigStore) {
        for binder in self.instances() {
            binder.store_settings(store, self.class_of(binder));
        }
    }

    pub fn len(&self) -> usize {
        self.binders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.binders.is_empty()
    }
}
