//! The value and type model calls are marshalled into.
//!
//! `TypeTag` is the declared-type vocabulary shared by both ends of a call.
//! Only `Any` and `Optional(_)` slots are nullable; every other slot needs a
//! concrete value.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::RpcError;

/// Declared type of a parameter or argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeTag {
    Any,
    Unit,
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    List(Box<TypeTag>),
    Map(Box<TypeTag>),
    Optional(Box<TypeTag>),
    /// A record type, matched by name.
    Named(String),
}

impl TypeTag {
    pub fn list(element: TypeTag) -> Self {
        TypeTag::List(Box::new(element))
    }

    pub fn map(value: TypeTag) -> Self {
        TypeTag::Map(Box::new(value))
    }

    pub fn optional(inner: TypeTag) -> Self {
        TypeTag::Optional(Box::new(inner))
    }

    /// Whether a slot of this type can hold `Null`.
    pub fn is_nullable(&self) -> bool {
        matches!(self, TypeTag::Any | TypeTag::Optional(_))
    }

    /// Whether a value declared as `source` may be passed where `self` is
    /// expected.
    ///
    /// Containers are covariant. A container whose element type is `Any`
    /// (the runtime type of a heterogeneous or empty list) is accepted by
    /// any container of the same shape.
    pub fn is_assignable_from(&self, source: &TypeTag) -> bool {
        if self == source {
            return true;
        }
        match (self, source) {
            (TypeTag::Any, _) => true,
            (TypeTag::Optional(inner), TypeTag::Optional(src)) => inner.is_assignable_from(src),
            (TypeTag::Optional(inner), src) => inner.is_assignable_from(src),
            (TypeTag::List(p), TypeTag::List(s)) | (TypeTag::Map(p), TypeTag::Map(s)) => {
                **s == TypeTag::Any || p.is_assignable_from(s)
            }
            _ => false,
        }
    }

    /// The value a missing trailing parameter of this type receives.
    pub fn default_value(&self) -> Value {
        match self {
            TypeTag::Unit => Value::Unit,
            TypeTag::Bool => Value::Bool(false),
            TypeTag::Int => Value::Int(0),
            TypeTag::Float => Value::Float(0.0),
            TypeTag::Str => Value::Str(String::new()),
            TypeTag::Bytes => Value::Bytes(Vec::new()),
            TypeTag::List(_) => Value::List(Vec::new()),
            TypeTag::Map(_) => Value::Map(BTreeMap::new()),
            TypeTag::Any | TypeTag::Optional(_) | TypeTag::Named(_) => Value::Null,
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeTag::Any => f.write_str("any"),
            TypeTag::Unit => f.write_str("unit"),
            TypeTag::Bool => f.write_str("bool"),
            TypeTag::Int => f.write_str("int"),
            TypeTag::Float => f.write_str("float"),
            TypeTag::Str => f.write_str("str"),
            TypeTag::Bytes => f.write_str("bytes"),
            TypeTag::List(t) => write!(f, "list<{t}>"),
            TypeTag::Map(t) => write!(f, "map<{t}>"),
            TypeTag::Optional(t) => write!(f, "{t}?"),
            TypeTag::Named(n) => f.write_str(n),
        }
    }
}

/// A marshalled value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Record {
        type_name: String,
        fields: BTreeMap<String, Value>,
    },
}

impl Value {
    pub fn record(type_name: impl Into<String>, fields: BTreeMap<String, Value>) -> Self {
        Value::Record {
            type_name: type_name.into(),
            fields,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The type this value has at runtime, or `None` for `Null`.
    /// Container element types are erased to `Any`.
    pub fn runtime_type(&self) -> Option<TypeTag> {
        Some(match self {
            Value::Null => return None,
            Value::Unit => TypeTag::Unit,
            Value::Bool(_) => TypeTag::Bool,
            Value::Int(_) => TypeTag::Int,
            Value::Float(_) => TypeTag::Float,
            Value::Str(_) => TypeTag::Str,
            Value::Bytes(_) => TypeTag::Bytes,
            Value::List(_) => TypeTag::list(TypeTag::Any),
            Value::Map(_) => TypeTag::map(TypeTag::Any),
            Value::Record { type_name, .. } => TypeTag::Named(type_name.clone()),
        })
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Record { .. } => "record",
        }
    }

    /// Take a named field out of a record of the given type.
    pub fn take_field(
        fields: &mut BTreeMap<String, Value>,
        name: &str,
    ) -> Result<Value, RpcError> {
        fields
            .remove(name)
            .ok_or_else(|| RpcError::marshal(format!("record is missing field {name:?}")))
    }
}

fn mismatch(expected: &TypeTag, found: &Value) -> RpcError {
    RpcError::marshal(format!("expected {expected}, found {}", found.kind()))
}

// ── Marshal ───────────────────────────────────────────────────────────────────

/// Conversion between a Rust type and its marshalled form.
///
/// Stubs and exported services generated by [`capability!`](crate::capability)
/// use this for every parameter and return value.
pub trait Marshal: Sized {
    fn type_tag() -> TypeTag;
    fn into_value(self) -> Value;
    fn from_value(value: Value) -> Result<Self, RpcError>;
}

impl Marshal for Value {
    fn type_tag() -> TypeTag {
        TypeTag::Any
    }
    fn into_value(self) -> Value {
        self
    }
    fn from_value(value: Value) -> Result<Self, RpcError> {
        Ok(value)
    }
}

impl Marshal for () {
    fn type_tag() -> TypeTag {
        TypeTag::Unit
    }
    fn into_value(self) -> Value {
        Value::Unit
    }
    fn from_value(_value: Value) -> Result<Self, RpcError> {
        // A method that gained a return value is still callable by an older
        // caller expecting none.
        Ok(())
    }
}

impl Marshal for bool {
    fn type_tag() -> TypeTag {
        TypeTag::Bool
    }
    fn into_value(self) -> Value {
        Value::Bool(self)
    }
    fn from_value(value: Value) -> Result<Self, RpcError> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(mismatch(&Self::type_tag(), &other)),
        }
    }
}

impl Marshal for i64 {
    fn type_tag() -> TypeTag {
        TypeTag::Int
    }
    fn into_value(self) -> Value {
        Value::Int(self)
    }
    fn from_value(value: Value) -> Result<Self, RpcError> {
        match value {
            Value::Int(i) => Ok(i),
            other => Err(mismatch(&Self::type_tag(), &other)),
        }
    }
}

macro_rules! marshal_narrow_int {
    ($($t:ty),*) => {$(
        impl Marshal for $t {
            fn type_tag() -> TypeTag {
                TypeTag::Int
            }
            fn into_value(self) -> Value {
                Value::Int(self as i64)
            }
            fn from_value(value: Value) -> Result<Self, RpcError> {
                let i = i64::from_value(value)?;
                <$t>::try_from(i).map_err(|_| {
                    RpcError::marshal(format!("{i} out of range for {}", stringify!($t)))
                })
            }
        }
    )*};
}

marshal_narrow_int!(i32, u16, u32);

impl Marshal for u64 {
    fn type_tag() -> TypeTag {
        TypeTag::Int
    }
    fn into_value(self) -> Value {
        // Values above i64::MAX wrap; from_value rejects them on the way back.
        Value::Int(self as i64)
    }
    fn from_value(value: Value) -> Result<Self, RpcError> {
        let i = i64::from_value(value)?;
        u64::try_from(i).map_err(|_| RpcError::marshal(format!("{i} out of range for u64")))
    }
}

impl Marshal for f64 {
    fn type_tag() -> TypeTag {
        TypeTag::Float
    }
    fn into_value(self) -> Value {
        Value::Float(self)
    }
    fn from_value(value: Value) -> Result<Self, RpcError> {
        match value {
            Value::Float(f) => Ok(f),
            other => Err(mismatch(&Self::type_tag(), &other)),
        }
    }
}

impl Marshal for String {
    fn type_tag() -> TypeTag {
        TypeTag::Str
    }
    fn into_value(self) -> Value {
        Value::Str(self)
    }
    fn from_value(value: Value) -> Result<Self, RpcError> {
        match value {
            Value::Str(s) => Ok(s),
            other => Err(mismatch(&Self::type_tag(), &other)),
        }
    }
}

/// Raw bytes. A distinct type so `Vec<u8>` keeps meaning "list of ints".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blob(pub Vec<u8>);

impl Marshal for Blob {
    fn type_tag() -> TypeTag {
        TypeTag::Bytes
    }
    fn into_value(self) -> Value {
        Value::Bytes(self.0)
    }
    fn from_value(value: Value) -> Result<Self, RpcError> {
        match value {
            Value::Bytes(b) => Ok(Blob(b)),
            other => Err(mismatch(&Self::type_tag(), &other)),
        }
    }
}

impl<T: Marshal> Marshal for Option<T> {
    fn type_tag() -> TypeTag {
        TypeTag::optional(T::type_tag())
    }
    fn into_value(self) -> Value {
        match self {
            Some(v) => v.into_value(),
            None => Value::Null,
        }
    }
    fn from_value(value: Value) -> Result<Self, RpcError> {
        match value {
            Value::Null => Ok(None),
            v => T::from_value(v).map(Some),
        }
    }
}

impl<T: Marshal> Marshal for Vec<T> {
    fn type_tag() -> TypeTag {
        TypeTag::list(T::type_tag())
    }
    fn into_value(self) -> Value {
        Value::List(self.into_iter().map(Marshal::into_value).collect())
    }
    fn from_value(value: Value) -> Result<Self, RpcError> {
        match value {
            Value::List(items) => items.into_iter().map(T::from_value).collect(),
            other => Err(mismatch(&Self::type_tag(), &other)),
        }
    }
}

impl<T: Marshal> Marshal for BTreeMap<String, T> {
    fn type_tag() -> TypeTag {
        TypeTag::map(T::type_tag())
    }
    fn into_value(self) -> Value {
        Value::Map(self.into_iter().map(|(k, v)| (k, v.into_value())).collect())
    }
    fn from_value(value: Value) -> Result<Self, RpcError> {
        match value {
            Value::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| T::from_value(v).map(|v| (k, v)))
                .collect(),
            other => Err(mismatch(&Self::type_tag(), &other)),
        }
    }
}
