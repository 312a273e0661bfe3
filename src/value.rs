//! Parameter values sent to the server.
//!
//! Column type conversion is left to the caller; the core only needs to put
//! a parameter on the wire, either in the binary protocol (`COM_STMT_EXECUTE`)
//! or as an SQL literal when a text statement is interpolated on the client.

use crate::constant::ColumnType;
use crate::protocol::codec::{write_lenenc_bytes, write_u64};

/// A single statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Double(f64),
    Bytes(Vec<u8>),
    Text(String),
}

const UNSIGNED_FLAG: u8 = 0x80;

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Type code and flag byte for the binary parameter type list.
    pub(crate) fn binary_type(&self) -> [u8; 2] {
        match self {
            Value::Null => [ColumnType::MYSQL_TYPE_NULL as u8, 0],
            Value::Int(_) => [ColumnType::MYSQL_TYPE_LONGLONG as u8, 0],
            Value::UInt(_) => [ColumnType::MYSQL_TYPE_LONGLONG as u8, UNSIGNED_FLAG],
            Value::Double(_) => [ColumnType::MYSQL_TYPE_DOUBLE as u8, 0],
            Value::Bytes(_) => [ColumnType::MYSQL_TYPE_BLOB as u8, 0],
            Value::Text(_) => [ColumnType::MYSQL_TYPE_VAR_STRING as u8, 0],
        }
    }

    /// Append the binary protocol encoding. NULL writes nothing; it lives in
    /// the null bitmap.
    pub(crate) fn write_binary(&self, out: &mut Vec<u8>) {
        match self {
            Value::Null => {}
            Value::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::UInt(v) => write_u64(out, *v),
            Value::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Bytes(v) => write_lenenc_bytes(out, v),
            Value::Text(v) => write_lenenc_bytes(out, v.as_bytes()),
        }
    }

    /// Append this value as an SQL literal.
    pub(crate) fn write_literal(&self, out: &mut Vec<u8>, no_backslash_escapes: bool) {
        match self {
            Value::Null => out.extend_from_slice(b"NULL"),
            Value::Int(v) => out.extend_from_slice(v.to_string().as_bytes()),
            Value::UInt(v) => out.extend_from_slice(v.to_string().as_bytes()),
            Value::Double(v) => out.extend_from_slice(v.to_string().as_bytes()),
            Value::Bytes(v) => {
                out.extend_from_slice(b"_binary");
                write_quoted(out, v, no_backslash_escapes);
            }
            Value::Text(v) => write_quoted(out, v.as_bytes(), no_backslash_escapes),
        }
    }

    /// Approximate encoded size, used to decide buffer reservations.
    pub(crate) fn approximate_len(&self) -> usize {
        match self {
            Value::Null => 4,
            Value::Int(_) | Value::UInt(_) | Value::Double(_) => 20,
            Value::Bytes(v) => v.len() + 10,
            Value::Text(v) => v.len() + 2,
        }
    }
}

fn write_quoted(out: &mut Vec<u8>, data: &[u8], no_backslash_escapes: bool) {
    out.reserve(data.len() + 2);
    out.push(b'\'');
    if no_backslash_escapes {
        for &b in data {
            if b == b'\'' {
                out.push(b'\'');
            }
            out.push(b);
        }
    } else {
        for &b in data {
            match b {
                b'\'' | b'\\' | b'"' => {
                    out.push(b'\\');
                    out.push(b);
                }
                0 => out.extend_from_slice(b"\\0"),
                _ => out.push(b),
            }
        }
    }
    out.push(b'\'');
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt(u64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
