//! Typed, persistent application preferences
//!
//! A [`ConfigStore`] holds typed values under string keys, resets them from an
//! injected default store, binds fields of live objects to keys and moves the
//! whole key set to and from durable storage through a
//! [`PersistenceBackend`].

#![forbid(unsafe_code)]

pub mod binder;
pub mod config;
pub mod constants;
pub mod error;
pub mod item;
pub mod persistence;
pub mod store;

pub use binder::{FieldAccessors, FieldBinder, ObjectId};
pub use error::{CfgError, Result};
pub use item::{CfgObject, ItemFlags, ObjectRegistry, ObjectValue, Point, Rect, TypedValue, Value, ValueType};
pub use persistence::{FileNamespace, FlatKvBackend, KeyValueNamespace, MemoryNamespace, PersistenceBackend, TreeBackend};
pub use store::ConfigStore;
