//! Run input as the engine evaluates it.
//!
//! Unlike [`crate::decode`], which produces JSON values, this keeps maps as
//! ordered entry lists: repeated keys stay separate entries, and every one of
//! them is inspected.

use crate::DecodeError;
use crate::abi::{ObjectKind, RawObject};
use crate::decoder::{entries, map_key, string_bytes};

/// One input node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Node {
    Null,
    /// Strings and integers, in textual form.
    Scalar(String),
    Array(Vec<Node>),
    Map(Vec<(String, Node)>),
}

impl Node {
    pub fn from_raw(obj: &RawObject<'_>) -> Result<Self, DecodeError> {
        let kind = obj.kind().ok_or(DecodeError::UnsupportedValue)?;
        match kind {
            k if k == ObjectKind::NULL => Ok(Node::Null),
            k if k == ObjectKind::SIGNED => Ok(Node::Scalar((obj.scalar as i64).to_string())),
            k if k == ObjectKind::UNSIGNED => Ok(Node::Scalar(obj.scalar.to_string())),
            k if k == ObjectKind::STRING => Ok(Node::Scalar(String::from_utf8_lossy(string_bytes(obj)?).into_owned())),
            k if k == ObjectKind::ARRAY => entries(obj)?.iter().map(Node::from_raw).collect::<Result<Vec<_>, DecodeError>>().map(Node::Array),
            k if k == ObjectKind::MAP => entries(obj)?
                .iter()
                .map(|entry| -> Result<(String, Node), DecodeError> {
                    Ok((String::from_utf8_lossy(map_key(entry)?).into_owned(), Node::from_raw(entry)?))
                })
                .collect::<Result<Vec<_>, DecodeError>>()
                .map(Node::Map),
            _ => Err(DecodeError::UnsupportedValue),
        }
    }

    /// Every child reached by `key`: all map entries named `key`, or the array
    /// element at index `key`.
    pub fn children<'n>(&'n self, key: &'n str) -> Box<dyn Iterator<Item = &'n Node> + 'n> {
        match self {
            Node::Map(entries) => Box::new(entries.iter().filter(move |(k, _)| k == key).map(|(_, v)| v)),
            Node::Array(items) => Box::new(key.parse::<usize>().ok().and_then(|i| items.get(i)).into_iter()),
            Node::Null | Node::Scalar(_) => Box::new(std::iter::empty()),
        }
    }
}
