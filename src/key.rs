//! Visitor identity keys.
//!
//! A key is a tagged value: a string or an integer of a fixed width. The tag
//! is part of the identity, so `Key::I32(7)` and `Key::I64(7)` are distinct
//! visitors, and the snapshot format records the tag alongside the value.

use std::fmt;

/// An identity tracked by the limiter: a username, a token, an encoded IPv4
/// address, or any other string or integer handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Str(String),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::Str(v.to_owned())
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Key::Str(v)
    }
}

macro_rules! key_from_int {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Key {
            fn from(v: $ty) -> Self {
                Key::$variant(v)
            }
        })*
    };
}

key_from_int! {
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    u8 => U8, u16 => U16, u32 => U32, u64 => U64,
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Str(v) => f.write_str(v),
            Key::I8(v) => write!(f, "{v}"),
            Key::I16(v) => write!(f, "{v}"),
            Key::I32(v) => write!(f, "{v}"),
            Key::I64(v) => write!(f, "{v}"),
            Key::U8(v) => write!(f, "{v}"),
            Key::U16(v) => write!(f, "{v}"),
            Key::U32(v) => write!(f, "{v}"),
            Key::U64(v) => write!(f, "{v}"),
        }
    }
}
