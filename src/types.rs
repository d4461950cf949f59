//! Variant type system: runtime type tags and tagged values.
//!
//! Everything that crosses the object boundary is a [`Value`]: scripts,
//! native methods and signal payloads all speak this one vocabulary.
//! Copy semantics are `Clone` (strings, arrays and tuples are deep-copied,
//! object references bump the strong count) and free semantics are `Drop`.

use std::ffi::c_void;
use std::fmt;

use crate::error::{Error, Result};
use crate::object::Object;

// =============================================================================
// Type tags
// =============================================================================

/// Runtime type tag carried by every [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    /// No value; the return tag of void methods.
    Unit,
    /// Boolean. Never implicitly converts to a number type.
    Bool,
    /// Native-width signed int (C `int`).
    NInt,
    /// Native-width unsigned int (C `unsigned int`).
    NUInt,
    /// 64-bit unsigned int.
    UInt,
    /// 64-bit signed int.
    Int,
    /// Double-precision float.
    Float,
    /// Raw untyped pointer.
    Pointer,
    /// Reference to an object.
    Object,
    /// Owned UTF-8 string.
    String,
    /// Borrowed string literal; never freed.
    StringLiteral,
    /// Homogeneous array.
    Array,
    /// Fixed-shape tuple with per-slot element types.
    Tuple,
    /// The nil value.
    Nil,
    /// Placeholder element type of an empty array only.
    Any,
}

impl Type {
    /// Byte width the call core materializes for this type; mirrors the C
    /// ABI widths of the wire types. Unit, Nil and Any are zero-sized and
    /// therefore invalid as argument or capture types.
    pub fn size_of(self) -> usize {
        match self {
            Type::Unit | Type::Nil | Type::Any => 0,
            Type::Bool => std::mem::size_of::<bool>(),
            Type::NInt => std::mem::size_of::<libc::c_int>(),
            Type::NUInt => std::mem::size_of::<libc::c_uint>(),
            Type::UInt | Type::Int => 8,
            Type::Float => std::mem::size_of::<f64>(),
            Type::Pointer | Type::Object | Type::String | Type::StringLiteral => {
                std::mem::size_of::<*const c_void>()
            }
            Type::Array => std::mem::size_of::<Array>(),
            Type::Tuple => std::mem::size_of::<Vec<Value>>(),
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, Type::NInt | Type::NUInt | Type::UInt | Type::Int)
    }

    /// Whether a value of type `self` satisfies a slot declared as `other`
    /// without conversion. Owned strings and literals are interchangeable.
    pub fn compatible_with(self, other: Type) -> bool {
        if self == other {
            return true;
        }
        matches!(
            (self, other),
            (Type::String, Type::StringLiteral) | (Type::StringLiteral, Type::String)
        )
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Type::Unit => "unit",
            Type::Bool => "bool",
            Type::NInt => "nint",
            Type::NUInt => "nuint",
            Type::UInt => "uint",
            Type::Int => "int",
            Type::Float => "float",
            Type::Pointer => "pointer",
            Type::Object => "object",
            Type::String => "string",
            Type::StringLiteral => "string literal",
            Type::Array => "array",
            Type::Tuple => "tuple",
            Type::Nil => "nil",
            Type::Any => "any",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Values
// =============================================================================

/// A tagged runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unit,
    Bool(bool),
    NInt(libc::c_int),
    NUInt(libc::c_uint),
    UInt(u64),
    Int(i64),
    Float(f64),
    Pointer(*mut c_void),
    Object(Object),
    String(String),
    StringLiteral(&'static str),
    Array(Array),
    Tuple(Vec<Value>),
    Nil,
}

impl Value {
    pub fn type_(&self) -> Type {
        match self {
            Value::Unit => Type::Unit,
            Value::Bool(_) => Type::Bool,
            Value::NInt(_) => Type::NInt,
            Value::NUInt(_) => Type::NUInt,
            Value::UInt(_) => Type::UInt,
            Value::Int(_) => Type::Int,
            Value::Float(_) => Type::Float,
            Value::Pointer(_) => Type::Pointer,
            Value::Object(_) => Type::Object,
            Value::String(_) => Type::String,
            Value::StringLiteral(_) => Type::StringLiteral,
            Value::Array(_) => Type::Array,
            Value::Tuple(_) => Type::Tuple,
            Value::Nil => Type::Nil,
        }
    }

    fn as_wide_int(&self) -> Option<i128> {
        match *self {
            Value::NInt(v) => Some(v as i128),
            Value::NUInt(v) => Some(v as i128),
            Value::Int(v) => Some(v as i128),
            Value::UInt(v) => Some(v as i128),
            _ => None,
        }
    }

    /// Implicit conversion into `to`, producing a fresh value and leaving
    /// the source untouched. The only permitted conversions are:
    /// identity, string literal to owned string, integer to integer when the
    /// value fits (`OutOfRange` otherwise), integer to float, and the
    /// nil-filling rules (nil/unit to a fresh empty object, an empty string,
    /// a null pointer, or an empty array). Everything else is a
    /// `TypeMismatch`; in particular float never converts to integer and
    /// bool never converts to a number.
    pub fn convert(&self, to: Type) -> Result<Value> {
        let from = self.type_();
        if from == to {
            return Ok(self.clone());
        }

        if let Value::StringLiteral(s) = *self {
            if to == Type::String {
                return Ok(Value::String(s.to_string()));
            }
        }

        if let Some(wide) = self.as_wide_int() {
            match to {
                Type::NInt => {
                    return libc::c_int::try_from(wide)
                        .map(Value::NInt)
                        .map_err(|_| Error::OutOfRange(to));
                }
                Type::NUInt => {
                    return libc::c_uint::try_from(wide)
                        .map(Value::NUInt)
                        .map_err(|_| Error::OutOfRange(to));
                }
                Type::Int => {
                    return i64::try_from(wide)
                        .map(Value::Int)
                        .map_err(|_| Error::OutOfRange(to));
                }
                Type::UInt => {
                    return u64::try_from(wide)
                        .map(Value::UInt)
                        .map_err(|_| Error::OutOfRange(to));
                }
                Type::Float => return Ok(Value::Float(wide as f64)),
                _ => {}
            }
        }

        if matches!(self, Value::Nil | Value::Unit) {
            match to {
                Type::Object => return Ok(Value::Object(Object::new())),
                Type::String => return Ok(Value::String(String::new())),
                Type::Pointer => return Ok(Value::Pointer(std::ptr::null_mut())),
                Type::Array => return Ok(Value::Array(Array::empty())),
                _ => {}
            }
        }

        Err(Error::TypeMismatch {
            expected: to,
            actual: from,
        })
    }
}

// =============================================================================
// Arrays
// =============================================================================

/// Homogeneous array value: an element type plus owned storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    elem: Type,
    items: Vec<Value>,
}

impl Array {
    /// The empty array; its element type is the `Any` placeholder.
    pub fn empty() -> Self {
        Array {
            elem: Type::Any,
            items: Vec::new(),
        }
    }

    pub fn new(elem: Type, items: Vec<Value>) -> Result<Self> {
        for item in &items {
            if !item.type_().compatible_with(elem) {
                return Err(Error::TypeMismatch {
                    expected: elem,
                    actual: item.type_(),
                });
            }
        }
        Ok(Array { elem, items })
    }

    pub fn from_strings<I, S>(strings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let items: Vec<Value> = strings
            .into_iter()
            .map(|s| Value::String(s.into()))
            .collect();
        if items.is_empty() {
            Array::empty()
        } else {
            Array {
                elem: Type::String,
                items,
            }
        }
    }

    pub fn elem_type(&self) -> Type {
        self.elem
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    /// Appends a value, fixing the element type on the first push into an
    /// empty array.
    pub fn push(&mut self, value: Value) -> Result<()> {
        if self.elem == Type::Any && self.items.is_empty() {
            self.elem = value.type_();
        } else if !value.type_().compatible_with(self.elem) {
            return Err(Error::TypeMismatch {
                expected: self.elem,
                actual: value.type_(),
            });
        }
        self.items.push(value);
        Ok(())
    }
}

// =============================================================================
// Rust <-> variant bridging
// =============================================================================

/// Rust types that can be produced from a [`Value`] of a fixed tag. The call
/// core converts arguments to [`FromValue::TYPE`] before handing them over,
/// so these conversions are exact-match only.
pub trait FromValue: Sized + 'static {
    const TYPE: Type;

    fn from_value(value: Value) -> Result<Self>;
}

/// Rust types with a canonical [`Value`] representation.
pub trait IntoValue: 'static {
    const TYPE: Type;

    fn into_value(self) -> Value;
}

macro_rules! impl_value_bridge {
    ($rust:ty, $tag:ident) => {
        impl FromValue for $rust {
            const TYPE: Type = Type::$tag;

            fn from_value(value: Value) -> Result<Self> {
                match value {
                    Value::$tag(v) => Ok(v),
                    other => Err(Error::TypeMismatch {
                        expected: Type::$tag,
                        actual: other.type_(),
                    }),
                }
            }
        }

        impl IntoValue for $rust {
            const TYPE: Type = Type::$tag;

            fn into_value(self) -> Value {
                Value::$tag(self)
            }
        }
    };
}

impl_value_bridge!(bool, Bool);
impl_value_bridge!(i32, NInt);
impl_value_bridge!(u32, NUInt);
impl_value_bridge!(u64, UInt);
impl_value_bridge!(i64, Int);
impl_value_bridge!(f64, Float);
impl_value_bridge!(*mut c_void, Pointer);
impl_value_bridge!(Object, Object);
impl_value_bridge!(Array, Array);

impl FromValue for String {
    const TYPE: Type = Type::String;

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(s),
            Value::StringLiteral(s) => Ok(s.to_string()),
            other => Err(Error::TypeMismatch {
                expected: Type::String,
                actual: other.type_(),
            }),
        }
    }
}

impl IntoValue for String {
    const TYPE: Type = Type::String;

    fn into_value(self) -> Value {
        Value::String(self)
    }
}

impl IntoValue for &'static str {
    const TYPE: Type = Type::StringLiteral;

    fn into_value(self) -> Value {
        Value::StringLiteral(self)
    }
}

impl IntoValue for () {
    const TYPE: Type = Type::Unit;

    fn into_value(self) -> Value {
        Value::Unit
    }
}

// =============================================================================
// Tests
// =============================================================================
