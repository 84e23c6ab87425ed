//! Decoding of engine-side node trees into native values.
//!
//! Everything a [`RawObject`] claims is checked against the storage it
//! actually carries before it is read, so a malformed tree yields an error
//! instead of a short or garbled value.

use crate::DecodeError;
use crate::abi::{ObjectKind, RawObject};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Decode a node tree.
///
/// Strings decode lossily as UTF-8. Repeated map keys collapse, the last
/// entry wins.
pub fn decode(obj: &RawObject<'_>) -> Result<Value, DecodeError> {
    let kind = obj.kind().ok_or(DecodeError::UnsupportedValue)?;
    match kind {
        k if k == ObjectKind::NULL => Ok(Value::Null),
        k if k == ObjectKind::SIGNED => Ok(Value::from(obj.scalar as i64)),
        k if k == ObjectKind::UNSIGNED => Ok(Value::from(obj.scalar)),
        k if k == ObjectKind::STRING => Ok(Value::String(String::from_utf8_lossy(string_bytes(obj)?).into_owned())),
        k if k == ObjectKind::ARRAY => entries(obj)?.iter().map(decode).collect::<Result<Vec<_>, _>>().map(Value::Array),
        k if k == ObjectKind::MAP => {
            let mut map = Map::new();
            for entry in entries(obj)? {
                let key = map_key(entry)?;
                map.insert(String::from_utf8_lossy(key).into_owned(), decode(entry)?);
            }
            Ok(Value::Object(map))
        }
        _ => Err(DecodeError::UnsupportedValue),
    }
}

/// Decode an array of strings, such as a run's action list.
///
/// A node the engine never initialized stands for an empty list.
pub fn decode_strings(obj: &RawObject<'_>) -> Result<Vec<String>, DecodeError> {
    if obj.tag == ObjectKind::INVALID {
        return Ok(Vec::new());
    }
    if obj.kind() != Some(ObjectKind::ARRAY) {
        return Err(DecodeError::UnsupportedValue);
    }
    entries(obj)?.iter().map(decode_string).collect()
}

/// Decode a map of string arrays, such as the rule-load error report
/// (`message -> [rule id, ..]`).
pub fn decode_string_lists(obj: &RawObject<'_>) -> Result<BTreeMap<String, Vec<String>>, DecodeError> {
    if obj.tag == ObjectKind::INVALID {
        return Ok(BTreeMap::new());
    }
    if obj.kind() != Some(ObjectKind::MAP) {
        return Err(DecodeError::UnsupportedValue);
    }
    let mut lists = BTreeMap::new();
    for entry in entries(obj)? {
        let key = String::from_utf8_lossy(map_key(entry)?).into_owned();
        lists.insert(key, decode_strings(entry)?);
    }
    Ok(lists)
}

fn decode_string(obj: &RawObject<'_>) -> Result<String, DecodeError> {
    match decode(obj)? {
        Value::String(s) => Ok(s),
        _ => Err(DecodeError::UnsupportedValue),
    }
}

pub(crate) fn string_bytes<'o>(obj: &'o RawObject<'_>) -> Result<&'o [u8], DecodeError> {
    let len = claimed(obj.nb_entries)?;
    match obj.bytes.as_deref() {
        None if len == 0 => Ok(&[]),
        Some(bytes) if bytes.len() >= len => Ok(&bytes[..len]),
        _ => Err(DecodeError::NilObjectPtr),
    }
}

pub(crate) fn entries<'o, 'a>(obj: &'o RawObject<'a>) -> Result<&'o [RawObject<'a>], DecodeError> {
    let len = claimed(obj.nb_entries)?;
    match obj.entries() {
        None if len == 0 => Ok(&[]),
        Some(entries) if entries.len() >= len => Ok(&entries[..len]),
        _ => Err(DecodeError::NilObjectPtr),
    }
}

pub(crate) fn map_key<'o>(entry: &'o RawObject<'_>) -> Result<&'o [u8], DecodeError> {
    match entry.key.as_deref() {
        Some(key) if key.len() as u64 == entry.key_len => Ok(key),
        _ => Err(DecodeError::InvalidMapKey),
    }
}

/// A claimed length that cannot even be addressed has no storage behind it.
fn claimed(len: u64) -> Result<usize, DecodeError> {
    usize::try_from(len).map_err(|_| DecodeError::NilObjectPtr)
}
