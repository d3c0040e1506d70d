use serde::{Deserialize, Serialize};

use super::{Marshal, TypeTag, Value};

/// One argument of a call.
///
/// `declared_type` and `name` are optional because not every caller knows
/// them. A caller that only has a value still dispatches correctly through
/// the value's runtime type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    pub declared_type: Option<TypeTag>,
    pub name: Option<String>,
    pub value: Value,
}

impl Argument {
    pub fn new(declared_type: Option<TypeTag>, name: Option<String>, value: Value) -> Self {
        Self {
            declared_type,
            name,
            value,
        }
    }

    /// A typed argument from a Rust value, with the parameter's static name.
    pub fn of<T: Marshal>(name: &str, value: T) -> Self {
        Self::new(Some(T::type_tag()), Some(name.to_string()), value.into_value())
    }

    pub fn typed(declared_type: TypeTag, value: Value) -> Self {
        Self::new(Some(declared_type), None, value)
    }

    /// An argument with no static type information.
    pub fn untyped(value: Value) -> Self {
        Self::new(None, None, value)
    }

    /// Whether this argument can fill a parameter of type `param`.
    ///
    /// The declared type wins when present, regardless of the value's
    /// runtime type. Without one, the runtime type decides. An untyped
    /// null only fits a nullable slot.
    pub fn is_assignable_to(&self, param: &TypeTag) -> bool {
        if let Some(declared) = &self.declared_type {
            return param.is_assignable_from(declared);
        }
        match self.value.runtime_type() {
            Some(runtime) => param.is_assignable_from(&runtime),
            None => param.is_nullable(),
        }
    }
}
