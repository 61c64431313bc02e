//! # Value Module
//!
//! Typed values read out of debuggee memory. [`Value::decode`] turns the raw little endian bytes
//! of a variable into a [`Value`] according to its [`TypeDescriptor`], and the [`Display`]
//! implementation is how variables are printed to the user.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::scope::{TypeDescriptor, TypeKind};
use crate::Addr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Bool(bool),
    Char(char),
    Pointer(Addr),
    /// anything without a primitive interpretation, like structs and arrays
    Bytes(Vec<u8>),
}

fn widen(bytes: &[u8]) -> [u8; 8] {
    let mut buf = [0u8; 8];
    let len = bytes.len().min(8);
    buf[..len].copy_from_slice(&bytes[..len]);
    buf
}

fn sign_extend(bytes: &[u8]) -> i64 {
    let len = bytes.len().min(8);
    if len == 0 {
        return 0;
    }
    let raw = u64::from_le_bytes(widen(bytes));
    let shift = 64 - len * 8;
    ((raw << shift) as i64) >> shift
}

impl Value {
    /// Interprets `bytes` as a value of type `ty`
    ///
    /// `bytes` should be exactly `ty.size` long. Primitive types of unusual sizes fall back to
    /// [`Value::Bytes`].
    pub fn decode(ty: &TypeDescriptor, bytes: &[u8]) -> Value {
        match (ty.kind, bytes.len()) {
            (TypeKind::Signed, 1..=8) => Value::Signed(sign_extend(bytes)),
            (TypeKind::Unsigned, 1..=8) => Value::Unsigned(u64::from_le_bytes(widen(bytes))),
            (TypeKind::Bool, 1..=8) => Value::Bool(bytes.iter().any(|b| *b != 0)),
            (TypeKind::Float, 4) => Value::Float(f32::from_le_bytes(
                [bytes[0], bytes[1], bytes[2], bytes[3]],
            ) as f64),
            (TypeKind::Float, 8) => Value::Float(f64::from_le_bytes(widen(bytes))),
            (TypeKind::Char, 1) => Value::Char(bytes[0] as char),
            (TypeKind::Char, 2..=4) => {
                match char::from_u32(u64::from_le_bytes(widen(bytes)) as u32) {
                    Some(c) => Value::Char(c),
                    None => Value::Bytes(bytes.to_vec()),
                }
            }
            (TypeKind::Pointer, 8) => Value::Pointer(Addr::from(u64::from_le_bytes(widen(bytes)))),
            _ => Value::Bytes(bytes.to_vec()),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Signed(v) => write!(f, "{v}"),
            Value::Unsigned(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Char(c) => write!(f, "{c:?}"),
            Value::Pointer(a) => write!(f, "{a:#x}"),
            Value::Bytes(bytes) => {
                write!(f, "{{")?;
                for (idx, b) in bytes.iter().enumerate() {
                    if idx > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{b:02x}")?;
                }
                write!(f, "}}")
            }
        }
    }
}
