//! Dynamic value trees.
//!
//! A [`Value`] is a shared handle to one node of a dynamic tree: null,
//! boolean, signed/unsigned 64-bit integer, 64-bit real, UTF-8 string,
//! array, or insertion-ordered string-keyed map. Component parameters,
//! trace environments and decoded fields are all value trees.
//!
//! Handles are reference-counted; cloning a `Value` shares the node.
//! [`Value::deep_copy`] makes a structural copy. A value can be frozen,
//! which transitively freezes everything reachable from it; mutating a
//! frozen node fails with [`Error::Frozen`].

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use indexmap::IndexMap;

use crate::error::Error;

/// The kind of a [`Value`] node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    UInt,
    Real,
    String,
    Array,
    Map,
}

enum Payload {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Real(f64),
    Str(String),
    Array(Vec<Value>),
    Map(IndexMap<String, Value>),
}

struct Node {
    frozen: Cell<bool>,
    payload: RefCell<Payload>,
}

/// A shared handle to a dynamic value node.
#[derive(Clone)]
pub struct Value(Rc<Node>);

impl Value {
    fn new(payload: Payload) -> Self {
        Value(Rc::new(Node {
            frozen: Cell::new(false),
            payload: RefCell::new(payload),
        }))
    }

    pub fn null() -> Self {
        Value::new(Payload::Null)
    }

    pub fn bool(b: bool) -> Self {
        Value::new(Payload::Bool(b))
    }

    pub fn int(i: i64) -> Self {
        Value::new(Payload::Int(i))
    }

    pub fn uint(u: u64) -> Self {
        Value::new(Payload::UInt(u))
    }

    pub fn real(r: f64) -> Self {
        Value::new(Payload::Real(r))
    }

    pub fn string<S: Into<String>>(s: S) -> Self {
        Value::new(Payload::Str(s.into()))
    }

    pub fn new_array() -> Self {
        Value::new(Payload::Array(Vec::new()))
    }

    pub fn array_from<I: IntoIterator<Item = Value>>(items: I) -> Self {
        Value::new(Payload::Array(items.into_iter().collect()))
    }

    pub fn new_map() -> Self {
        Value::new(Payload::Map(IndexMap::new()))
    }

    pub fn kind(&self) -> ValueKind {
        match &*self.0.payload.borrow() {
            Payload::Null => ValueKind::Null,
            Payload::Bool(_) => ValueKind::Bool,
            Payload::Int(_) => ValueKind::Int,
            Payload::UInt(_) => ValueKind::UInt,
            Payload::Real(_) => ValueKind::Real,
            Payload::Str(_) => ValueKind::String,
            Payload::Array(_) => ValueKind::Array,
            Payload::Map(_) => ValueKind::Map,
        }
    }

    pub fn is_null(&self) -> bool {
        self.kind() == ValueKind::Null
    }

    pub fn is_frozen(&self) -> bool {
        self.0.frozen.get()
    }

    /// Freezes this value and everything reachable from it.
    pub fn freeze(&self) {
        if self.0.frozen.get() {
            return;
        }
        self.0.frozen.set(true);
        match &*self.0.payload.borrow() {
            Payload::Array(items) => {
                for item in items {
                    item.freeze();
                }
            }
            Payload::Map(entries) => {
                for value in entries.values() {
                    value.freeze();
                }
            }
            _ => {}
        }
    }

    fn check_mutable(&self, what: &str) -> Result<(), Error> {
        if self.0.frozen.get() {
            Err(Error::Frozen(format!("cannot {what} a frozen value")))
        } else {
            Ok(())
        }
    }

    // --- Scalar accessors ---

    pub fn as_bool(&self) -> Option<bool> {
        match &*self.0.payload.borrow() {
            Payload::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match &*self.0.payload.borrow() {
            Payload::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match &*self.0.payload.borrow() {
            Payload::UInt(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match &*self.0.payload.borrow() {
            Payload::Real(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<String> {
        match &*self.0.payload.borrow() {
            Payload::Str(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// Reads an integer of either signedness as `u64`, if it fits.
    pub fn as_u64_lossy(&self) -> Option<u64> {
        match &*self.0.payload.borrow() {
            Payload::UInt(u) => Some(*u),
            Payload::Int(i) if *i >= 0 => Some(*i as u64),
            _ => None,
        }
    }

    // --- Scalar mutators ---

    pub fn set_bool(&self, b: bool) -> Result<(), Error> {
        self.check_mutable("set")?;
        match &mut *self.0.payload.borrow_mut() {
            Payload::Bool(cur) => {
                *cur = b;
                Ok(())
            }
            _ => Err(Error::InvalidArgument("value is not a boolean".into())),
        }
    }

    pub fn set_int(&self, i: i64) -> Result<(), Error> {
        self.check_mutable("set")?;
        match &mut *self.0.payload.borrow_mut() {
            Payload::Int(cur) => {
                *cur = i;
                Ok(())
            }
            _ => Err(Error::InvalidArgument(
                "value is not a signed integer".into(),
            )),
        }
    }

    pub fn set_uint(&self, u: u64) -> Result<(), Error> {
        self.check_mutable("set")?;
        match &mut *self.0.payload.borrow_mut() {
            Payload::UInt(cur) => {
                *cur = u;
                Ok(())
            }
            _ => Err(Error::InvalidArgument(
                "value is not an unsigned integer".into(),
            )),
        }
    }

    pub fn set_real(&self, r: f64) -> Result<(), Error> {
        self.check_mutable("set")?;
        match &mut *self.0.payload.borrow_mut() {
            Payload::Real(cur) => {
                *cur = r;
                Ok(())
            }
            _ => Err(Error::InvalidArgument("value is not a real".into())),
        }
    }

    pub fn set_string<S: Into<String>>(&self, s: S) -> Result<(), Error> {
        self.check_mutable("set")?;
        match &mut *self.0.payload.borrow_mut() {
            Payload::Str(cur) => {
                *cur = s.into();
                Ok(())
            }
            _ => Err(Error::InvalidArgument("value is not a string".into())),
        }
    }

    // --- Arrays ---

    pub fn array_len(&self) -> Option<usize> {
        match &*self.0.payload.borrow() {
            Payload::Array(items) => Some(items.len()),
            _ => None,
        }
    }

    pub fn array_get(&self, index: usize) -> Option<Value> {
        match &*self.0.payload.borrow() {
            Payload::Array(items) => items.get(index).cloned(),
            _ => None,
        }
    }

    pub fn array_push(&self, item: Value) -> Result<(), Error> {
        self.check_mutable("append to")?;
        match &mut *self.0.payload.borrow_mut() {
            Payload::Array(items) => {
                items.push(item);
                Ok(())
            }
            _ => Err(Error::InvalidArgument("value is not an array".into())),
        }
    }

    // --- Maps ---

    pub fn map_len(&self) -> Option<usize> {
        match &*self.0.payload.borrow() {
            Payload::Map(entries) => Some(entries.len()),
            _ => None,
        }
    }

    pub fn map_get(&self, key: &str) -> Option<Value> {
        match &*self.0.payload.borrow() {
            Payload::Map(entries) => entries.get(key).cloned(),
            _ => None,
        }
    }

    pub fn map_contains(&self, key: &str) -> bool {
        match &*self.0.payload.borrow() {
            Payload::Map(entries) => entries.contains_key(key),
            _ => false,
        }
    }

    /// Inserts an entry, keeping the position of an existing key.
    pub fn map_insert<K: Into<String>>(&self, key: K, value: Value) -> Result<(), Error> {
        self.check_mutable("insert into")?;
        match &mut *self.0.payload.borrow_mut() {
            Payload::Map(entries) => {
                entries.insert(key.into(), value);
                Ok(())
            }
            _ => Err(Error::InvalidArgument("value is not a map".into())),
        }
    }

    /// Returns the map entries in insertion order.
    pub fn map_entries(&self) -> Option<Vec<(String, Value)>> {
        match &*self.0.payload.borrow() {
            Payload::Map(entries) => Some(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            _ => None,
        }
    }

    // --- Copies ---

    /// Structural copy; the copy and all its children are unfrozen.
    pub fn deep_copy(&self) -> Value {
        match &*self.0.payload.borrow() {
            Payload::Null => Value::null(),
            Payload::Bool(b) => Value::bool(*b),
            Payload::Int(i) => Value::int(*i),
            Payload::UInt(u) => Value::uint(*u),
            Payload::Real(r) => Value::real(*r),
            Payload::Str(s) => Value::string(s.clone()),
            Payload::Array(items) => Value::array_from(items.iter().map(Value::deep_copy)),
            Payload::Map(entries) => {
                let copy = Value::new_map();
                for (key, value) in entries {
                    // A fresh map is never frozen.
                    copy.map_insert(key.clone(), value.deep_copy()).unwrap();
                }
                copy
            }
        }
    }

    /// Whether two handles share the same node.
    pub fn same_node(&self, other: &Value) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Value {
    /// Structural equality. Map entry order is irrelevant.
    fn eq(&self, other: &Value) -> bool {
        if self.same_node(other) {
            return true;
        }
        let a = self.0.payload.borrow();
        let b = other.0.payload.borrow();
        match (&*a, &*b) {
            (Payload::Null, Payload::Null) => true,
            (Payload::Bool(x), Payload::Bool(y)) => x == y,
            (Payload::Int(x), Payload::Int(y)) => x == y,
            (Payload::UInt(x), Payload::UInt(y)) => x == y,
            (Payload::Real(x), Payload::Real(y)) => x == y,
            (Payload::Str(x), Payload::Str(y)) => x == y,
            (Payload::Array(x), Payload::Array(y)) => x == y,
            (Payload::Map(x), Payload::Map(y)) => {
                x.len() == y.len() && x.iter().all(|(k, v)| y.get(k) == Some(v))
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.0.payload.borrow() {
            Payload::Null => write!(f, "null"),
            Payload::Bool(b) => write!(f, "{b}"),
            Payload::Int(i) => write!(f, "{i}"),
            Payload::UInt(u) => write!(f, "+{u}"),
            Payload::Real(r) => write!(f, "{r:?}"),
            Payload::Str(s) => write!(f, "{s:?}"),
            Payload::Array(items) => f.debug_list().entries(items).finish(),
            Payload::Map(entries) => f.debug_map().entries(entries.iter()).finish(),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::int(i)
    }
}

impl From<u64> for Value {
    fn from(u: u64) -> Self {
        Value::uint(u)
    }
}

impl From<f64> for Value {
    fn from(r: f64) -> Self {
        Value::real(r)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn scalar_round_trip() {
        assert_eq!(Value::bool(true).as_bool(), Some(true));
        assert_eq!(Value::int(-5).as_int(), Some(-5));
        assert_eq!(Value::uint(5).as_uint(), Some(5));
        assert_eq!(Value::real(1.5).as_real(), Some(1.5));
        assert_eq!(Value::string("hi").as_string(), Some("hi".to_string()));
        assert_eq!(Value::int(-5).as_uint(), None);
    }

    #[test]
    fn map_keeps_insertion_order() {
        let map = Value::new_map();
        map.map_insert("z", Value::int(1)).unwrap();
        map.map_insert("a", Value::int(2)).unwrap();
        map.map_insert("z", Value::int(3)).unwrap();
        let keys: Vec<String> = map.map_entries().unwrap().into_iter().map(|e| e.0).collect();
        assert_eq!(keys, ["z", "a"]);
        assert_eq!(map.map_get("z").unwrap().as_int(), Some(3));
    }

    #[test]
    fn equality_ignores_map_order() {
        let a = Value::new_map();
        a.map_insert("x", Value::int(1)).unwrap();
        a.map_insert("y", Value::bool(false)).unwrap();
        let b = Value::new_map();
        b.map_insert("y", Value::bool(false)).unwrap();
        b.map_insert("x", Value::int(1)).unwrap();
        assert_eq!(a, b);

        b.map_insert("x", Value::int(2)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn signedness_matters_for_equality() {
        assert_ne!(Value::int(5), Value::uint(5));
    }

    #[test]
    fn freeze_is_transitive() {
        let map = Value::new_map();
        let arr = Value::array_from([Value::int(1)]);
        map.map_insert("a", arr.clone()).unwrap();
        map.freeze();

        assert!(map.is_frozen());
        assert!(arr.is_frozen());
        assert_matches!(map.map_insert("b", Value::null()), Err(Error::Frozen(_)));
        assert_matches!(arr.array_push(Value::int(2)), Err(Error::Frozen(_)));
        assert_matches!(
            arr.array_get(0).unwrap().set_int(9),
            Err(Error::Frozen(_))
        );
    }

    #[test]
    fn deep_copy_is_unfrozen_and_detached() {
        let map = Value::new_map();
        map.map_insert("k", Value::string("v")).unwrap();
        map.freeze();

        let copy = map.deep_copy();
        assert!(!copy.is_frozen());
        assert_eq!(copy, map);
        copy.map_insert("k2", Value::int(7)).unwrap();
        assert_ne!(copy, map);
        assert!(!map.map_contains("k2"));
    }
}
