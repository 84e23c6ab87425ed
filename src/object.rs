//! The bounded value tree produced by the encoder.
//!
//! An [`Object`] is what a native value looks like once it has been walked,
//! stringified and clipped to the encoder's limits. It is owned by whoever
//! called [`Encoder::encode`](crate::Encoder::encode) and is only ever lent
//! to an engine, through [`Object::to_raw`], for the length of one call.
//!
//! ## Invariants (for a tree built by an encoder with `Limits` `L`)
//!
//! - every container holds at most `L.max_container_size` entries;
//! - every string and map key holds at most `L.max_string_size` bytes;
//! - non-empty containers nest at most `L.max_depth` levels below the root;
//!   anything deeper is kept as an empty container.
//!
//! Map keys may be empty or repeated. Repeated keys are distinct entries.

use crate::abi::{ObjectKind, RawObject};
use std::borrow::Cow;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Object {
    Null,
    String(Vec<u8>),
    Signed(i64),
    Unsigned(u64),
    Array(Vec<Object>),
    Map(Vec<(Vec<u8>, Object)>),
}

impl Object {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::Null => ObjectKind::NULL,
            Object::String(_) => ObjectKind::STRING,
            Object::Signed(_) => ObjectKind::SIGNED,
            Object::Unsigned(_) => ObjectKind::UNSIGNED,
            Object::Array(_) => ObjectKind::ARRAY,
            Object::Map(_) => ObjectKind::MAP,
        }
    }

    /// Byte length of a string, entry count of a container, 0 otherwise.
    pub fn len(&self) -> usize {
        match self {
            Object::String(bytes) => bytes.len(),
            Object::Array(items) => items.len(),
            Object::Map(entries) => entries.len(),
            Object::Null | Object::Signed(_) | Object::Unsigned(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Object::String(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// String content, when it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_array(&self) -> Option<&[Object]> {
        match self {
            Object::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(Vec<u8>, Object)]> {
        match self {
            Object::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// First value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Object> {
        self.as_map()?.iter().find(|(k, _)| k.as_slice() == key.as_bytes()).map(|(_, v)| v)
    }

    /// Levels of non-empty containers below this node. Scalars and empty
    /// containers are leaves.
    pub fn depth(&self) -> usize {
        let children: Box<dyn Iterator<Item = &Object>> = match self {
            Object::Array(items) => Box::new(items.iter()),
            Object::Map(entries) => Box::new(entries.iter().map(|(_, v)| v)),
            _ => return 0,
        };
        children
            .filter(|c| c.kind().intersects(ObjectKind::CONTAINER) && !c.is_empty())
            .map(|c| 1 + c.depth()).max().unwrap_or(0)
    }

    /// Lend this tree to an engine.
    ///
    /// Strings and keys are borrowed from `self`; entry arrays are
    /// materialized for the engine's flat layout and released with the
    /// returned value.
    pub fn to_raw(&self) -> RawObject<'_> {
        match self {
            Object::Null => RawObject::null(),
            Object::String(bytes) => RawObject::string(Cow::Borrowed(bytes.as_slice())),
            Object::Signed(v) => RawObject::signed(*v),
            Object::Unsigned(v) => RawObject::unsigned(*v),
            Object::Array(items) => RawObject::array(items.iter().map(Object::to_raw).collect::<Vec<_>>()),
            Object::Map(entries) => RawObject::map(
                entries.iter().map(|(k, v)| v.to_raw().with_key(Cow::Borrowed(k.as_slice()))).collect::<Vec<_>>(),
            ),
        }
    }
}

impl From<&str> for Object {
    fn from(s: &str) -> Self {
        Object::String(s.as_bytes().to_vec())
    }
}
