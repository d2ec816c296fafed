//! Registry key derivation for argument lists.
//!
//! Keys are JSON-like text. Argument graphs built from [`ArgNode`] may reference themselves;
//! a node met again while it is still being encoded is written as
//! `"[Circular ~<path>]"`, where `<path>` is the dotted position of its first occurrence.
//! Identical structures therefore always encode to identical keys.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use serde_json::Value;

use crate::error::KeyError;

/// Nesting limit applied when no explicit depth is configured.
pub const DEFAULT_MAX_KEY_DEPTH: usize = 64;

/// Stable string key identifying one argument list in a registry.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallKey(String);

impl CallKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefixes the key so several functions can share one registry.
    pub fn namespaced(&self, namespace: &str) -> Self {
        Self(format!("{namespace}:{}", self.0))
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CallKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Derives the registry key for `args` with the default depth limit.
pub fn derive_key<A: KeyArg + ?Sized>(args: &A) -> Result<CallKey, KeyError> {
    KeyEncoder::with_max_depth(DEFAULT_MAX_KEY_DEPTH).finish(args)
}

/// Values that can take part in a registry key.
pub trait KeyArg {
    fn encode_key(&self, enc: &mut KeyEncoder) -> Result<(), KeyError>;
}

/// Incremental writer used by [`KeyArg`] implementations.
pub struct KeyEncoder {
    out: String,
    max_depth: usize,
    path: Vec<String>,
    // (node address, path length at first occurrence) for every node being encoded
    ancestors: Vec<(usize, usize)>,
}

impl KeyEncoder {
    pub fn with_max_depth(max_depth: usize) -> Self {
        Self {
            out: String::new(),
            max_depth,
            path: Vec::new(),
            ancestors: Vec::new(),
        }
    }

    /// Encodes `args` and returns the finished key.
    pub fn finish<A: KeyArg + ?Sized>(mut self, args: &A) -> Result<CallKey, KeyError> {
        args.encode_key(&mut self)?;
        Ok(CallKey(self.out))
    }

    pub fn write_null(&mut self) {
        self.out.push_str("null");
    }

    pub fn write_bool(&mut self, value: bool) {
        self.out.push_str(if value { "true" } else { "false" });
    }

    /// Writes an already formatted numeric literal.
    pub fn write_number(&mut self, literal: impl fmt::Display) {
        self.out.push_str(&literal.to_string());
    }

    pub fn write_f64(&mut self, value: f64) {
        match serde_json::Number::from_f64(value) {
            Some(number) => self.write_number(number),
            None => self.write_null(),
        }
    }

    /// Writes `value` as a JSON string literal.
    pub fn write_str(&mut self, value: &str) -> Result<(), KeyError> {
        let literal = serde_json::to_string(value).map_err(|err| KeyError::Unrepresentable {
            path: self.current_path(),
            reason: err.to_string(),
        })?;
        self.out.push_str(&literal);
        Ok(())
    }

    /// Writes a JSON array of `items`.
    pub fn write_seq<'a, I, T>(&mut self, items: I) -> Result<(), KeyError>
    where
        I: IntoIterator<Item = &'a T>,
        T: KeyArg + ?Sized + 'a,
    {
        self.begin_seq();
        for (index, item) in items.into_iter().enumerate() {
            self.seq_element(index, |enc| item.encode_key(enc))?;
        }
        self.end_seq();
        Ok(())
    }

    pub fn begin_seq(&mut self) {
        self.out.push('[');
    }

    pub fn seq_element(
        &mut self,
        index: usize,
        encode: impl FnOnce(&mut Self) -> Result<(), KeyError>,
    ) -> Result<(), KeyError> {
        if index > 0 {
            self.out.push(',');
        }
        self.descend(index.to_string(), encode)
    }

    pub fn end_seq(&mut self) {
        self.out.push(']');
    }

    /// Writes a JSON object with entries sorted by key.
    pub fn write_map<'a, I, K, V>(&mut self, entries: I) -> Result<(), KeyError>
    where
        I: IntoIterator<Item = (&'a K, &'a V)>,
        K: AsRef<str> + ?Sized + 'a,
        V: KeyArg + ?Sized + 'a,
    {
        let mut sorted: Vec<(&str, &V)> = entries
            .into_iter()
            .map(|(key, value)| (key.as_ref(), value))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));

        self.out.push('{');
        for (index, (key, value)) in sorted.into_iter().enumerate() {
            if index > 0 {
                self.out.push(',');
            }
            self.write_str(key)?;
            self.out.push(':');
            self.descend(key.to_string(), |enc| value.encode_key(enc))?;
        }
        self.out.push('}');
        Ok(())
    }

    /// Encodes a shared node identified by `address`, or a circular marker when the node
    /// is already being encoded further up the current path.
    pub fn write_shared(
        &mut self,
        address: usize,
        encode: impl FnOnce(&mut Self) -> Result<(), KeyError>,
    ) -> Result<(), KeyError> {
        if let Some(&(_, depth)) = self.ancestors.iter().find(|(addr, _)| *addr == address) {
            let marker = format!("[Circular {}]", self.path_at(depth));
            return self.write_str(&marker);
        }

        self.ancestors.push((address, self.path.len()));
        let result = encode(self);
        self.ancestors.pop();
        result
    }

    /// Dotted path of the value currently being encoded, rooted at `~`.
    pub fn current_path(&self) -> String {
        self.path_at(self.path.len())
    }

    fn path_at(&self, depth: usize) -> String {
        let mut rendered = String::from("~");
        for segment in &self.path[..depth] {
            rendered.push('.');
            rendered.push_str(segment);
        }
        rendered
    }

    fn descend(
        &mut self,
        segment: String,
        encode: impl FnOnce(&mut Self) -> Result<(), KeyError>,
    ) -> Result<(), KeyError> {
        if self.path.len() >= self.max_depth {
            return Err(KeyError::TooDeep {
                max_depth: self.max_depth,
                path: self.current_path(),
            });
        }
        self.path.push(segment);
        let result = encode(self);
        self.path.pop();
        result
    }
}

/// Dynamic argument value.
#[derive(Clone, Debug, Default)]
pub enum ArgValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ArgValue>),
    Map(BTreeMap<String, ArgValue>),
    Node(ArgNode),
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for ArgValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for ArgValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Vec<ArgValue>> for ArgValue {
    fn from(value: Vec<ArgValue>) -> Self {
        Self::List(value)
    }
}

impl From<ArgNode> for ArgValue {
    fn from(value: ArgNode) -> Self {
        Self::Node(value)
    }
}

impl From<Value> for ArgValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Self::Str(s),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => {
                Self::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

/// Shared, mutable argument node. Nodes may reference each other and themselves.
///
/// A node graph with a cycle keeps itself alive; call [`ArgNode::clear`] on one member
/// to release it.
#[derive(Clone, Default)]
pub struct ArgNode(Arc<RwLock<ArgValue>>);

impl ArgNode {
    pub fn new(value: impl Into<ArgValue>) -> Self {
        Self(Arc::new(RwLock::new(value.into())))
    }

    pub fn map() -> Self {
        Self::new(ArgValue::Map(BTreeMap::new()))
    }

    pub fn list() -> Self {
        Self::new(ArgValue::List(Vec::new()))
    }

    /// Snapshot of the node's current value.
    pub fn get(&self) -> ArgValue {
        self.read().clone()
    }

    pub fn set(&self, value: impl Into<ArgValue>) {
        *self.write() = value.into();
    }

    /// Sets `key` on a map node. A node holding anything else becomes a map first.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<ArgValue>) {
        let mut guard = self.write();
        if !matches!(*guard, ArgValue::Map(_)) {
            *guard = ArgValue::Map(BTreeMap::new());
        }
        if let ArgValue::Map(map) = &mut *guard {
            map.insert(key.into(), value.into());
        }
    }

    /// Appends to a list node. A node holding anything else becomes a list first.
    pub fn push(&self, value: impl Into<ArgValue>) {
        let mut guard = self.write();
        if !matches!(*guard, ArgValue::List(_)) {
            *guard = ArgValue::List(Vec::new());
        }
        if let ArgValue::List(items) = &mut *guard {
            items.push(value.into());
        }
    }

    pub fn clear(&self) {
        *self.write() = ArgValue::Null;
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn address(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    fn read(&self) -> RwLockReadGuard<'_, ArgValue> {
        self.0.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ArgValue> {
        self.0.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for ArgNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArgNode({:#x})", self.address())
    }
}

/// Adapter deriving a key from any serde-serializable value.
#[derive(Clone, Debug)]
pub struct Json<T>(pub T);

impl<T: Serialize> KeyArg for Json<T> {
    fn encode_key(&self, enc: &mut KeyEncoder) -> Result<(), KeyError> {
        let value = serde_json::to_value(&self.0).map_err(|err| KeyError::Unrepresentable {
            path: enc.current_path(),
            reason: err.to_string(),
        })?;
        value.encode_key(enc)
    }
}

impl KeyArg for Value {
    fn encode_key(&self, enc: &mut KeyEncoder) -> Result<(), KeyError> {
        match self {
            Value::Null => enc.write_null(),
            Value::Bool(b) => enc.write_bool(*b),
            Value::Number(n) => enc.write_number(n),
            Value::String(s) => enc.write_str(s)?,
            Value::Array(items) => enc.write_seq(items)?,
            Value::Object(map) => enc.write_map(map)?,
        }
        Ok(())
    }
}

impl KeyArg for ArgValue {
    fn encode_key(&self, enc: &mut KeyEncoder) -> Result<(), KeyError> {
        match self {
            ArgValue::Null => enc.write_null(),
            ArgValue::Bool(b) => enc.write_bool(*b),
            ArgValue::Int(i) => enc.write_number(i),
            ArgValue::Float(x) => enc.write_f64(*x),
            ArgValue::Str(s) => enc.write_str(s)?,
            ArgValue::List(items) => enc.write_seq(items)?,
            ArgValue::Map(map) => enc.write_map(map)?,
            ArgValue::Node(node) => node.encode_key(enc)?,
        }
        Ok(())
    }
}

impl KeyArg for ArgNode {
    fn encode_key(&self, enc: &mut KeyEncoder) -> Result<(), KeyError> {
        enc.write_shared(self.address(), |enc| self.read().encode_key(enc))
    }
}

impl KeyArg for () {
    fn encode_key(&self, enc: &mut KeyEncoder) -> Result<(), KeyError> {
        enc.begin_seq();
        enc.end_seq();
        Ok(())
    }
}

impl KeyArg for bool {
    fn encode_key(&self, enc: &mut KeyEncoder) -> Result<(), KeyError> {
        enc.write_bool(*self);
        Ok(())
    }
}

macro_rules! integer_key_arg {
    ($($ty:ty),+) => {
        $(
            impl KeyArg for $ty {
                fn encode_key(&self, enc: &mut KeyEncoder) -> Result<(), KeyError> {
                    enc.write_number(self);
                    Ok(())
                }
            }
        )+
    };
}

integer_key_arg!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize);

impl KeyArg for f32 {
    fn encode_key(&self, enc: &mut KeyEncoder) -> Result<(), KeyError> {
        enc.write_f64(f64::from(*self));
        Ok(())
    }
}

impl KeyArg for f64 {
    fn encode_key(&self, enc: &mut KeyEncoder) -> Result<(), KeyError> {
        enc.write_f64(*self);
        Ok(())
    }
}

impl KeyArg for char {
    fn encode_key(&self, enc: &mut KeyEncoder) -> Result<(), KeyError> {
        enc.write_str(self.encode_utf8(&mut [0; 4]))
    }
}

impl KeyArg for str {
    fn encode_key(&self, enc: &mut KeyEncoder) -> Result<(), KeyError> {
        enc.write_str(self)
    }
}

impl KeyArg for String {
    fn encode_key(&self, enc: &mut KeyEncoder) -> Result<(), KeyError> {
        enc.write_str(self)
    }
}

impl<T: KeyArg> KeyArg for Option<T> {
    fn encode_key(&self, enc: &mut KeyEncoder) -> Result<(), KeyError> {
        match self {
            Some(value) => value.encode_key(enc),
            None => {
                enc.write_null();
                Ok(())
            }
        }
    }
}

impl<T: KeyArg> KeyArg for [T] {
    fn encode_key(&self, enc: &mut KeyEncoder) -> Result<(), KeyError> {
        enc.write_seq(self)
    }
}

impl<T: KeyArg, const N: usize> KeyArg for [T; N] {
    fn encode_key(&self, enc: &mut KeyEncoder) -> Result<(), KeyError> {
        enc.write_seq(self)
    }
}

impl<T: KeyArg> KeyArg for Vec<T> {
    fn encode_key(&self, enc: &mut KeyEncoder) -> Result<(), KeyError> {
        enc.write_seq(self)
    }
}

impl<K: AsRef<str>, V: KeyArg> KeyArg for BTreeMap<K, V> {
    fn encode_key(&self, enc: &mut KeyEncoder) -> Result<(), KeyError> {
        enc.write_map(self)
    }
}

impl<K: AsRef<str>, V: KeyArg, S> KeyArg for HashMap<K, V, S> {
    fn encode_key(&self, enc: &mut KeyEncoder) -> Result<(), KeyError> {
        enc.write_map(self)
    }
}

impl<T: KeyArg + ?Sized> KeyArg for &T {
    fn encode_key(&self, enc: &mut KeyEncoder) -> Result<(), KeyError> {
        (**self).encode_key(enc)
    }
}

impl<T: KeyArg + ?Sized> KeyArg for Box<T> {
    fn encode_key(&self, enc: &mut KeyEncoder) -> Result<(), KeyError> {
        (**self).encode_key(enc)
    }
}

impl<T: KeyArg + ?Sized> KeyArg for Arc<T> {
    fn encode_key(&self, enc: &mut KeyEncoder) -> Result<(), KeyError> {
        (**self).encode_key(enc)
    }
}

macro_rules! tuple_key_arg {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: KeyArg),+> KeyArg for ($($name,)+) {
            fn encode_key(&self, enc: &mut KeyEncoder) -> Result<(), KeyError> {
                enc.begin_seq();
                $( enc.seq_element($idx, |enc| self.$idx.encode_key(enc))?; )+
                enc.end_seq();
                Ok(())
            }
        }
    };
}

tuple_key_arg!(A: 0);
tuple_key_arg!(A: 0, B: 1);
tuple_key_arg!(A: 0, B: 1, C: 2);
tuple_key_arg!(A: 0, B: 1, C: 2, D: 3);
tuple_key_arg!(A: 0, B: 1, C: 2, D: 3, E: 4);
tuple_key_arg!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
tuple_key_arg!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
tuple_key_arg!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);
