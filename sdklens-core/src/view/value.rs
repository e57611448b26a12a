use std::borrow::Cow;
use std::fmt;

use super::vector::UtlVectorHandle;

/// A decoded field. Integers keep their native width and signedness.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue<'a> {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Pointer(u64),
    /// A fixed-size array, exactly as stored.
    Bytes(&'a [u8]),
    /// A fixed-size array read as a NUL-terminated string.
    Text(Cow<'a, str>),
    Vector(UtlVectorHandle),
}

impl<'a> FieldValue<'a> {
    /// Any integer kind, sign-extended. Pointers and bools are not integers here.
    pub fn as_i64(&self) -> Option<i64> {
        Some(match *self {
            FieldValue::I8(v) => v as i64,
            FieldValue::U8(v) => v as i64,
            FieldValue::I16(v) => v as i64,
            FieldValue::U16(v) => v as i64,
            FieldValue::I32(v) => v as i64,
            FieldValue::U32(v) => v as i64,
            FieldValue::I64(v) => v,
            FieldValue::U64(v) => i64::try_from(v).ok()?,
            _ => return None,
        })
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            FieldValue::F32(v) => Some(v as f64),
            FieldValue::F64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_pointer(&self) -> Option<u64> {
        match *self {
            FieldValue::Pointer(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match *self {
            FieldValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s.as_ref()),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&UtlVectorHandle> {
        match self {
            FieldValue::Vector(v) => Some(v),
            _ => None,
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

impl fmt::Display for FieldValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::I8(v) => write!(f, "{v}"),
            FieldValue::U8(v) => write!(f, "{v}"),
            FieldValue::I16(v) => write!(f, "{v}"),
            FieldValue::U16(v) => write!(f, "{v}"),
            FieldValue::I32(v) => write!(f, "{v}"),
            FieldValue::U32(v) => write!(f, "{v}"),
            FieldValue::I64(v) => write!(f, "{v}"),
            FieldValue::U64(v) => write!(f, "{v}"),
            FieldValue::F32(v) => write!(f, "{v}"),
            FieldValue::F64(v) => write!(f, "{v}"),
            FieldValue::Pointer(p) => write!(f, "0x{p:X}"),
            FieldValue::Bytes(b) => write!(f, "[{}]", hex(b)),
            FieldValue::Text(s) => write!(f, "{s:?}"),
            FieldValue::Vector(v) => write!(f, "{v}"),
        }
    }
}
