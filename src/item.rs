//! Typed configuration values
//!
//! A [`TypedValue`] is a single named setting: a type tag fixed by the first
//! value ever stored, the canonical text encoding of that value and a small
//! flag set. Values travel to and from storage as two strings, the encoded
//! value and its metadata (`"[<type>,<flag>]"`).

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::constants::meta;
use crate::error::{CfgError, Result};

/// Type tag of a stored value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueType {
    String,
    Boolean,
    Int,
    Rectangle,
    Point,
    /// Carries the class name used to reconstruct the value
    Object(String),
    ArrayOfObject,
}

impl ValueType {
    /// Same kind of value, ignoring the object class name
    pub fn same_kind(&self, other: &ValueType) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Wire code used in the metadata string
    pub fn code(&self) -> String {
        match self {
            ValueType::String => meta::TYPE_STRING.to_string(),
            ValueType::Boolean => meta::TYPE_BOOLEAN.to_string(),
            ValueType::Int => meta::TYPE_INT.to_string(),
            ValueType::Rectangle => meta::TYPE_RECTANGLE.to_string(),
            ValueType::Point => meta::TYPE_POINT.to_string(),
            ValueType::Object(class_name) => format!("{}{class_name}", meta::TYPE_OBJECT_PREFIX),
            ValueType::ArrayOfObject => meta::TYPE_ARRAY.to_string(),
        }
    }

    pub fn from_code(code: &str) -> Result<Self> {
        let value_type = match code {
            meta::TYPE_STRING => ValueType::String,
            meta::TYPE_BOOLEAN => ValueType::Boolean,
            meta::TYPE_INT => ValueType::Int,
            meta::TYPE_RECTANGLE => ValueType::Rectangle,
            meta::TYPE_POINT => ValueType::Point,
            meta::TYPE_ARRAY => ValueType::ArrayOfObject,
            other => match other.strip_prefix(meta::TYPE_OBJECT_PREFIX) {
                Some(class_name) if !class_name.is_empty() => ValueType::Object(class_name.to_string()),
                _ => return Err(CfgError::invalid(format!("unknown type code '{other}'"))),
            },
        };
        Ok(value_type)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::String => write!(f, "String"),
            ValueType::Boolean => write!(f, "Boolean"),
            ValueType::Int => write!(f, "Int"),
            ValueType::Rectangle => write!(f, "Rectangle"),
            ValueType::Point => write!(f, "Point"),
            ValueType::Object(class_name) => write!(f, "Object({class_name})"),
            ValueType::ArrayOfObject => write!(f, "ArrayOfObject"),
        }
    }
}

/// Per-entry flag set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ItemFlags(u8);

impl ItemFlags {
    pub const NONE: ItemFlags = ItemFlags(0);

    /// Entry survives a reset to defaults
    pub const NO_RESET: ItemFlags = ItemFlags(1);

    pub fn contains(self, other: ItemFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ItemFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: ItemFlags) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: ItemFlags, enabled: bool) {
        if enabled {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }

    pub fn code(self) -> &'static str {
        if self.contains(ItemFlags::NO_RESET) {
            meta::FLAG_NO_RESET
        } else {
            meta::FLAG_NONE
        }
    }

    pub fn from_code(code: &str) -> Result<Self> {
        match code {
            meta::FLAG_NONE => Ok(ItemFlags::NONE),
            meta::FLAG_NO_RESET => Ok(ItemFlags::NO_RESET),
            other => Err(CfgError::invalid(format!("unknown flag code '{other}'"))),
        }
    }
}

/// Integer rectangle, encoded as `"x,y,w,h"`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }
}

/// Integer point, encoded as `"x,y"`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Raw form of an object-typed value: its class name and text form.
///
/// Turning it back into an application value needs an [`ObjectRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectValue {
    pub class_name: String,
    pub text: String,
}

/// Application values that can be stored as object-typed entries
pub trait CfgObject {
    /// Identifier the registry uses to find the parser
    fn class_name(&self) -> &str;

    /// Text form handed back to the parser on load
    fn to_cfg_string(&self) -> String;
}

/// A runtime value as seen by callers of the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    String(String),
    Bool(bool),
    Int(i32),
    Rect(Rect),
    Point(Point),
    Object(ObjectValue),
    Array(Vec<String>),
}

impl Value {
    pub fn object(obj: &dyn CfgObject) -> Self {
        Value::Object(ObjectValue {
            class_name: obj.class_name().to_string(),
            text: obj.to_cfg_string(),
        })
    }

    /// Type tag derived from the runtime kind
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::String(_) => ValueType::String,
            Value::Bool(_) => ValueType::Boolean,
            Value::Int(_) => ValueType::Int,
            Value::Rect(_) => ValueType::Rectangle,
            Value::Point(_) => ValueType::Point,
            Value::Object(obj) => ValueType::Object(obj.class_name.clone()),
            Value::Array(_) => ValueType::ArrayOfObject,
        }
    }

    /// Canonical text form
    pub fn encode(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Rect(r) => format!("{},{},{},{}", r.x, r.y, r.width, r.height),
            Value::Point(p) => format!("{},{}", p.x, p.y),
            Value::Object(obj) => obj.text.clone(),
            // Serializing a Vec<String> cannot fail
            Value::Array(items) => serde_json::to_string(items).unwrap_or_default(),
        }
    }

    /// Parse `text` as a value of `value_type`.
    ///
    /// Returns `None` for malformed payloads; callers substitute their default.
    pub fn decode(value_type: &ValueType, text: &str) -> Option<Value> {
        match value_type {
            ValueType::String => Some(Value::String(text.to_string())),
            ValueType::Boolean => Some(Value::Bool(text.trim().eq_ignore_ascii_case("true"))),
            ValueType::Int => text.trim().parse().ok().map(Value::Int),
            ValueType::Rectangle => match parse_ints(text)?.as_slice() {
                &[x, y, width, height] => Some(Value::Rect(Rect::new(x, y, width, height))),
                _ => None,
            },
            ValueType::Point => match parse_ints(text)?.as_slice() {
                &[x, y] => Some(Value::Point(Point::new(x, y))),
                _ => None,
            },
            ValueType::Object(class_name) => Some(Value::Object(ObjectValue {
                class_name: class_name.clone(),
                text: text.to_string(),
            })),
            ValueType::ArrayOfObject => serde_json::from_str(text).ok().map(Value::Array),
        }
    }
}

fn parse_ints(text: &str) -> Option<Vec<i32>> {
    text.split(meta::SEPARATOR)
        .map(|part| part.trim().parse::<i32>().ok())
        .collect()
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

macro_rules! impl_value_conversions {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Value::$variant(value)
            }
        }

        impl TryFrom<Value> for $ty {
            type Error = Value;

            fn try_from(value: Value) -> std::result::Result<Self, Value> {
                match value {
                    Value::$variant(inner) => Ok(inner),
                    other => Err(other),
                }
            }
        }
    };
}

impl_value_conversions!(String, String);
impl_value_conversions!(bool, Bool);
impl_value_conversions!(i32, Int);
impl_value_conversions!(Rect, Rect);
impl_value_conversions!(Point, Point);
impl_value_conversions!(ObjectValue, Object);
impl_value_conversions!(Vec<String>, Array);

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

/// Encode type and flags as `"[<type>,<flag>]"`
pub fn encode_meta(value_type: &ValueType, flags: ItemFlags) -> String {
    format!(
        "{}{}{}{}{}",
        meta::OPEN,
        value_type.code(),
        meta::SEPARATOR,
        flags.code(),
        meta::CLOSE
    )
}

/// Parse a `"[<type>,<flag>]"` metadata string
pub fn decode_meta(encoded: &str) -> Result<(ValueType, ItemFlags)> {
    let inner = encoded
        .trim()
        .strip_prefix(meta::OPEN)
        .and_then(|rest| rest.strip_suffix(meta::CLOSE))
        .ok_or_else(|| CfgError::invalid(format!("metadata '{encoded}' is not bracketed")))?;

    let fields: Vec<&str> = inner.split(meta::SEPARATOR).collect();
    match fields.as_slice() {
        [type_code, flag_code] => Ok((
            ValueType::from_code(type_code.trim())?,
            ItemFlags::from_code(flag_code.trim())?,
        )),
        _ => Err(CfgError::invalid(format!(
            "metadata '{encoded}' has {} fields, expected 2",
            fields.len()
        ))),
    }
}

/// A single named setting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedValue {
    key: String,
    value_type: Option<ValueType>,
    encoded: String,
    flags: ItemFlags,
}

impl TypedValue {
    /// Untyped, empty entry; the first stored value fixes its type
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value_type: None,
            encoded: String::new(),
            flags: ItemFlags::NONE,
        }
    }

    pub fn with_value(key: impl Into<String>, value: Value) -> Self {
        let value_type = value.value_type();
        Self {
            key: key.into(),
            encoded: value.encode(),
            value_type: Some(value_type),
            flags: ItemFlags::NONE,
        }
    }

    /// Rebuild an entry from its persisted value/meta pair
    pub fn from_encoded(key: impl Into<String>, encoded: impl Into<String>, meta: &str) -> Result<Self> {
        let (value_type, flags) = decode_meta(meta)?;
        Ok(Self {
            key: key.into(),
            value_type: Some(value_type),
            encoded: encoded.into(),
            flags,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value_type(&self) -> Option<&ValueType> {
        self.value_type.as_ref()
    }

    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    pub fn flags(&self) -> ItemFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: ItemFlags) {
        self.flags = flags;
    }

    pub fn is_no_reset(&self) -> bool {
        self.flags.contains(ItemFlags::NO_RESET)
    }

    /// Store `value`, keeping the established type unless `allow_type_change`.
    pub fn put_value(&mut self, value: Value, allow_type_change: bool) -> Result<()> {
        let actual = value.value_type();
        if let Some(expected) = &self.value_type
            && !allow_type_change
            && !expected.same_kind(&actual)
        {
            return Err(CfgError::TypeMismatch {
                key: self.key.clone(),
                expected: expected.clone(),
                actual,
            });
        }

        self.encoded = value.encode();
        self.value_type = Some(actual);
        Ok(())
    }

    /// Decoded value, or `None` when empty or malformed
    pub fn decode(&self) -> Option<Value> {
        if self.encoded.is_empty() {
            return None;
        }
        let value_type = self.value_type.as_ref()?;
        let decoded = Value::decode(value_type, &self.encoded);
        if decoded.is_none() {
            debug!(key = %self.key, encoded = %self.encoded, value_type = %value_type, "Malformed value payload, using default");
        }
        decoded
    }

    pub fn get_value(&self, default: Value) -> Value {
        self.decode().unwrap_or(default)
    }

    pub fn encode_meta(&self) -> String {
        encode_meta(self.value_type.as_ref().unwrap_or(&ValueType::String), self.flags)
    }

    /// Replace type and flags from a metadata string
    pub fn decode_meta(&mut self, encoded: &str) -> Result<()> {
        let (value_type, flags) = decode_meta(encoded)?;
        self.value_type = Some(value_type);
        self.flags = flags;
        Ok(())
    }
}

/// Parser turning an object's text form back into an application value
pub type ObjectParser = fn(&str) -> Option<Box<dyn Any>>;

/// Maps object class names to the parsers that rebuild them.
///
/// Populated by the application at startup; lookups for unknown classes
/// resolve to `None` rather than failing.
#[derive(Clone, Default)]
pub struct ObjectRegistry {
    parsers: HashMap<String, ObjectParser>,
}

impl fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.parsers.keys()).finish()
    }
}

fn parse_boxed<T: FromStr + 'static>(text: &str) -> Option<Box<dyn Any>> {
    text.parse::<T>().ok().map(|value| Box::new(value) as Box<dyn Any>)
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class_name: impl Into<String>, parser: ObjectParser) {
        self.parsers.insert(class_name.into(), parser);
    }

    /// Register `T`'s [`FromStr`] implementation under `class_name`
    pub fn register_parsable<T: FromStr + 'static>(&mut self, class_name: impl Into<String>) {
        self.register(class_name, parse_boxed::<T>);
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.parsers.contains_key(class_name)
    }

    pub fn resolve(&self, value: &ObjectValue) -> Option<Box<dyn Any>> {
        let Some(parser) = self.parsers.get(&value.class_name) else {
            debug!(class = %value.class_name, "No parser registered for object class");
            return None;
        };
        parser(&value.text)
    }
}
