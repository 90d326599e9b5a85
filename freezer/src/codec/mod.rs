//! The fixed, versioned byte layout for tuple values.
//!
//! Every `value` blob in the log is one tag byte followed by the canonical
//! payload for that tag:
//!
//! - 0: null marker (removal). An empty payload removes the attribute
//!   outright; a payload containing a complete encoded value removes that
//!   one element from a collection.
//! - 1: integer, i64 little-endian.
//! - 2: double, f64 little-endian bits.
//! - 3: string, UTF-8 bytes.
//! - 4: blob, raw bytes.
//! - 5: date, i64 seconds since the Unix epoch, little-endian.
//! - 6: reference, the referenced entity id as UTF-8.
//!
//! Encoded values round-trip for their declared type; dates carry second
//! precision, so encoding truncates sub-second components.

use std::fmt;
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{DateTime, TimeZone, Utc};

use crate::error::{CResult, Error};

/// The declared type of an attribute. The discriminant is the wire tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttrType {
    Integer = 1,
    Double = 2,
    String = 3,
    Blob = 4,
    Date = 5,
    Reference = 6,
}

impl AttrType {
    /// The wire tag for this type.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Resolves a wire tag back to a type. Tag 0 is the null marker, not a
    /// declared type.
    pub fn from_tag(tag: u8) -> CResult<AttrType> {
        match tag {
            1 => Ok(AttrType::Integer),
            2 => Ok(AttrType::Double),
            3 => Ok(AttrType::String),
            4 => Ok(AttrType::Blob),
            5 => Ok(AttrType::Date),
            6 => Ok(AttrType::Reference),
            tag => Err(Error::Encoding(format!("unknown type tag {}", tag))),
        }
    }
}

impl fmt::Display for AttrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrType::Integer => write!(f, "integer"),
            AttrType::Double => write!(f, "double"),
            AttrType::String => write!(f, "string"),
            AttrType::Blob => write!(f, "blob"),
            AttrType::Date => write!(f, "date"),
            AttrType::Reference => write!(f, "reference"),
        }
    }
}

/// A user value, as written by the transactor and resolved by snapshots.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Integer(i64),
    Double(f64),
    String(String),
    Blob(Vec<u8>),
    Date(DateTime<Utc>),
    Reference(String),
}

impl Value {
    /// The declared type this value satisfies.
    pub fn attr_type(&self) -> AttrType {
        match self {
            Value::Integer(_) => AttrType::Integer,
            Value::Double(_) => AttrType::Double,
            Value::String(_) => AttrType::String,
            Value::Blob(_) => AttrType::Blob,
            Value::Date(_) => AttrType::Date,
            Value::Reference(_) => AttrType::Reference,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Date(v)
    }
}

/// A decoded tuple blob: either a live value or a removal marker. A bare
/// tombstone removes the attribute; an element tombstone removes one value
/// from a collection.
#[derive(Clone, Debug, PartialEq)]
pub enum Stored {
    Value(Value),
    Tombstone(Option<Value>),
}

/// Null marker tag.
const TAG_NULL: u8 = 0;

/// Encodes a value into its tagged blob.
pub fn encode_value(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    write_value(&mut buf, value);
    buf
}

/// Encodes a removal marker. `None` removes the attribute outright; `Some`
/// removes that one element from a collection.
pub fn encode_tombstone(value: Option<&Value>) -> Vec<u8> {
    let mut buf = vec![TAG_NULL];
    if let Some(value) = value {
        write_value(&mut buf, value);
    }
    buf
}

fn write_value(buf: &mut Vec<u8>, value: &Value) {
    buf.push(value.attr_type().tag());
    match value {
        Value::Integer(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Double(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::String(v) => buf.extend_from_slice(v.as_bytes()),
        Value::Blob(v) => buf.extend_from_slice(v),
        Value::Date(v) => buf.extend_from_slice(&v.timestamp().to_le_bytes()),
        Value::Reference(v) => buf.extend_from_slice(v.as_bytes()),
    }
}

/// Decodes a tuple blob.
pub fn decode(blob: &[u8]) -> CResult<Stored> {
    let mut cursor = Cursor::new(blob);
    let tag = cursor
        .read_u8()
        .map_err(|_| Error::Encoding("empty value blob".to_string()))?;

    if tag == TAG_NULL {
        if cursor.position() >= blob.len() as u64 {
            return Ok(Stored::Tombstone(None));
        }
        let value = read_value(&mut cursor)?;
        return Ok(Stored::Tombstone(Some(value)));
    }

    cursor.set_position(0);
    Ok(Stored::Value(read_value(&mut cursor)?))
}

fn read_value(cursor: &mut Cursor<&[u8]>) -> CResult<Value> {
    let tag = cursor
        .read_u8()
        .map_err(|_| Error::Encoding("truncated value blob".to_string()))?;
    let attr_type = AttrType::from_tag(tag)?;

    match attr_type {
        AttrType::Integer => {
            let v = cursor
                .read_i64::<LittleEndian>()
                .map_err(|_| Error::Encoding("truncated integer payload".to_string()))?;
            Ok(Value::Integer(v))
        }
        AttrType::Double => {
            let v = cursor
                .read_f64::<LittleEndian>()
                .map_err(|_| Error::Encoding("truncated double payload".to_string()))?;
            Ok(Value::Double(v))
        }
        AttrType::String => Ok(Value::String(read_utf8(cursor)?)),
        AttrType::Blob => {
            let mut bytes = Vec::new();
            cursor
                .read_to_end(&mut bytes)
                .map_err(|_| Error::Encoding("unreadable blob payload".to_string()))?;
            Ok(Value::Blob(bytes))
        }
        AttrType::Date => {
            let secs = cursor
                .read_i64::<LittleEndian>()
                .map_err(|_| Error::Encoding("truncated date payload".to_string()))?;
            let date = Utc
                .timestamp_opt(secs, 0)
                .single()
                .ok_or_else(|| Error::Encoding(format!("date out of range: {}", secs)))?;
            Ok(Value::Date(date))
        }
        AttrType::Reference => Ok(Value::Reference(read_utf8(cursor)?)),
    }
}

fn read_utf8(cursor: &mut Cursor<&[u8]>) -> CResult<String> {
    let mut bytes = Vec::new();
    cursor
        .read_to_end(&mut bytes)
        .map_err(|_| Error::Encoding("unreadable string payload".to_string()))?;
    String::from_utf8(bytes).map_err(|e| Error::Encoding(e.to_string()))
}
