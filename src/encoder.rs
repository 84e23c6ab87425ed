//! Bounded encoding of native values.
//!
//! The encoder is a [`serde::Serializer`]: every `Serialize` type describes
//! its own shape through serde's data model (scalars, sequences, maps,
//! structs, enum variants) and the encoder turns that description into an
//! [`Object`] tree that respects its [`Limits`].
//!
//! ```text
//! T: Serialize ── ValueEncoder(depth) ──┬─ scalar ─────────> Object::String / leaf
//!                                       ├─ seq / tuple ────> SeqEncoder ──> Object::Array
//!                                       ├─ map / struct ───> MapEncoder ──> Object::Map
//!                                       └─ enum variant ───> { variant: payload }
//! ```
//!
//! ## Limits
//!
//! - Only containers consume depth. The root sits at depth 0; a container
//!   deeper than `max_depth` becomes an empty container of the same kind and
//!   still takes its slot in the parent.
//! - Once a container holds `max_container_size` entries, the remaining
//!   elements are skipped without being serialized.
//! - Strings and map keys are cut at `max_string_size` bytes. Keys that
//!   collide after the cut stay separate entries. The address keys of
//!   [`Encoder::encode_entries`] are the exception and are kept whole.
//!
//! ## Failures
//!
//! Values without a bounded representation (`None`, `()`, non-finite floats,
//! `Serialize` impls that error) fail the whole call at the top level. Below
//! the top level the offending element is dropped and does not count toward
//! its container's length. Map keys must be string-like; an entry with any
//! other key is dropped.

use crate::{EncodeError, Object};
use serde::Serialize;
use serde::ser::{self, Impossible};

// --- Limits ------------------------------------------------------------------

/// Size limits applied by an [`Encoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Limits {
    /// Deepest container nesting kept below the root.
    pub max_depth: usize,
    /// Longest string or map key, in bytes.
    pub max_string_size: usize,
    /// Most entries kept per array or map.
    pub max_container_size: usize,
}

impl Limits {
    pub const DEFAULT_MAX_DEPTH: usize = 20;
    pub const DEFAULT_MAX_STRING_SIZE: usize = 4096;
    pub const DEFAULT_MAX_CONTAINER_SIZE: usize = 256;

    pub const fn new(max_depth: usize, max_string_size: usize, max_container_size: usize) -> Self {
        Limits { max_depth, max_string_size, max_container_size }
    }

    /// No limits. Used for rule-set descriptions, which must reach the engine intact.
    pub const fn unlimited() -> Self {
        Limits::new(usize::MAX, usize::MAX, usize::MAX)
    }
}

impl Default for Limits {
    fn default() -> Self {
        Limits::new(Self::DEFAULT_MAX_DEPTH, Self::DEFAULT_MAX_STRING_SIZE, Self::DEFAULT_MAX_CONTAINER_SIZE)
    }
}

// --- Encoder -----------------------------------------------------------------

/// Stateless value encoder. Cheap to copy and safe to share.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Encoder {
    limits: Limits,
}

impl Encoder {
    pub const fn new(limits: Limits) -> Self {
        Encoder { limits }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Encode one value.
    pub fn encode<T: ?Sized + Serialize>(&self, value: &T) -> Result<Object, EncodeError> {
        value.serialize(ValueEncoder::root(self.limits))
    }

    /// Encode `(key, value)` pairs as a root map.
    ///
    /// This is the shape of a run's input: one entry per address. Values are
    /// nested, so an unsupported one only drops its own entry. Addresses are
    /// names the rules match on, so they are never cut to `max_string_size`;
    /// everything below them is.
    pub fn encode_entries<I, K, V>(&self, entries: I) -> Object
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Serialize,
    {
        let mut map = ValueEncoder::root(self.limits).map(None);
        for (key, value) in entries {
            if map.is_full() {
                break;
            }
            map.insert_value(key.as_ref().as_bytes().to_vec(), &value);
        }
        map.finish()
    }
}

/// Serializes a byte slice as a string leaf.
///
/// Serde describes `Vec<u8>` and `&[u8]` as sequences of integers; wrap them
/// to encode raw bytes instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bytes<'a>(pub &'a [u8]);

impl Serialize for Bytes<'_> {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.0)
    }
}

fn truncate(bytes: &[u8], max: usize) -> &[u8] {
    &bytes[..bytes.len().min(max)]
}

// --- Values ------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct ValueEncoder {
    limits: Limits,
    /// Depth of the container this value would become.
    depth: usize,
}

impl ValueEncoder {
    fn root(limits: Limits) -> Self {
        ValueEncoder { limits, depth: 0 }
    }

    fn child(self) -> Self {
        ValueEncoder { depth: self.depth.saturating_add(1), ..self }
    }

    /// Entries a container at this depth may hold. Zero once past `max_depth`.
    fn capacity(self) -> usize {
        if self.depth > self.limits.max_depth { 0 } else { self.limits.max_container_size }
    }

    fn string(self, bytes: &[u8]) -> Object {
        Object::String(truncate(bytes, self.limits.max_string_size).to_vec())
    }

    fn seq(self, len: Option<usize>) -> SeqEncoder {
        let cap = self.capacity();
        SeqEncoder { element: self.child(), cap, items: Vec::with_capacity(len.unwrap_or(0).min(cap)) }
    }

    fn map(self, len: Option<usize>) -> MapEncoder {
        let cap = self.capacity();
        MapEncoder { element: self.child(), cap, entries: Vec::with_capacity(len.unwrap_or(0).min(cap)), pending: None }
    }

    fn variant<S>(self, name: &'static str, inner: S) -> VariantEncoder<S> {
        VariantEncoder { outer: self, name, inner }
    }

    /// `{name: payload}`, or an empty map when the wrapper itself has no room.
    fn wrap(self, name: &'static str, payload: Result<Object, EncodeError>) -> Object {
        let mut map = self.map(Some(1));
        if !map.is_full() {
            match payload {
                Ok(value) => map.entries.push((truncate(name.as_bytes(), self.limits.max_string_size).to_vec(), value)),
                Err(err) => tracing::trace!(%err, variant = name, "dropped unsupported variant payload"),
            }
        }
        map.finish()
    }
}

impl ser::Serializer for ValueEncoder {
    type Ok = Object;
    type Error = EncodeError;

    type SerializeSeq = SeqEncoder;
    type SerializeTuple = SeqEncoder;
    type SerializeTupleStruct = SeqEncoder;
    type SerializeTupleVariant = VariantEncoder<SeqEncoder>;
    type SerializeMap = MapEncoder;
    type SerializeStruct = MapEncoder;
    type SerializeStructVariant = VariantEncoder<MapEncoder>;

    fn serialize_bool(self, v: bool) -> Result<Object, EncodeError> {
        Ok(self.string(if v { "true" } else { "false" }.as_bytes()))
    }

    fn serialize_i8(self, v: i8) -> Result<Object, EncodeError> {
        self.serialize_i64(i64::from(v))
    }

    fn serialize_i16(self, v: i16) -> Result<Object, EncodeError> {
        self.serialize_i64(i64::from(v))
    }

    fn serialize_i32(self, v: i32) -> Result<Object, EncodeError> {
        self.serialize_i64(i64::from(v))
    }

    fn serialize_i64(self, v: i64) -> Result<Object, EncodeError> {
        Ok(self.string(itoa::Buffer::new().format(v).as_bytes()))
    }

    fn serialize_i128(self, v: i128) -> Result<Object, EncodeError> {
        Ok(self.string(itoa::Buffer::new().format(v).as_bytes()))
    }

    fn serialize_u8(self, v: u8) -> Result<Object, EncodeError> {
        self.serialize_u64(u64::from(v))
    }

    fn serialize_u16(self, v: u16) -> Result<Object, EncodeError> {
        self.serialize_u64(u64::from(v))
    }

    fn serialize_u32(self, v: u32) -> Result<Object, EncodeError> {
        self.serialize_u64(u64::from(v))
    }

    fn serialize_u64(self, v: u64) -> Result<Object, EncodeError> {
        Ok(self.string(itoa::Buffer::new().format(v).as_bytes()))
    }

    fn serialize_u128(self, v: u128) -> Result<Object, EncodeError> {
        Ok(self.string(itoa::Buffer::new().format(v).as_bytes()))
    }

    fn serialize_f32(self, v: f32) -> Result<Object, EncodeError> {
        self.serialize_f64(f64::from(v))
    }

    /// Floats are rounded half away from zero and written as integers.
    fn serialize_f64(self, v: f64) -> Result<Object, EncodeError> {
        if !v.is_finite() {
            return Err(EncodeError::UnsupportedValue);
        }
        let rounded = v.round();
        if rounded >= i64::MIN as f64 && rounded < i64::MAX as f64 {
            self.serialize_i64(rounded as i64)
        } else {
            Ok(self.string(format!("{rounded:.0}").as_bytes()))
        }
    }

    fn serialize_char(self, v: char) -> Result<Object, EncodeError> {
        Ok(self.string(v.encode_utf8(&mut [0; 4]).as_bytes()))
    }

    fn serialize_str(self, v: &str) -> Result<Object, EncodeError> {
        Ok(self.string(v.as_bytes()))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Object, EncodeError> {
        Ok(self.string(v))
    }

    fn serialize_none(self) -> Result<Object, EncodeError> {
        Err(EncodeError::UnsupportedValue)
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<Object, EncodeError> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<Object, EncodeError> {
        Err(EncodeError::UnsupportedValue)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<Object, EncodeError> {
        Ok(Object::Map(Vec::new()))
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<Object, EncodeError> {
        self.serialize_str(variant)
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<Object, EncodeError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<Object, EncodeError> {
        if self.capacity() == 0 {
            return Ok(Object::Map(Vec::new()));
        }
        Ok(self.wrap(variant, value.serialize(self.child())))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SeqEncoder, EncodeError> {
        Ok(self.seq(len))
    }

    fn serialize_tuple(self, len: usize) -> Result<SeqEncoder, EncodeError> {
        Ok(self.seq(Some(len)))
    }

    fn serialize_tuple_struct(self, _name: &'static str, len: usize) -> Result<SeqEncoder, EncodeError> {
        Ok(self.seq(Some(len)))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<VariantEncoder<SeqEncoder>, EncodeError> {
        Ok(self.variant(variant, self.child().seq(Some(len))))
    }

    fn serialize_map(self, len: Option<usize>) -> Result<MapEncoder, EncodeError> {
        Ok(self.map(len))
    }

    fn serialize_struct(self, _name: &'static str, len: usize) -> Result<MapEncoder, EncodeError> {
        Ok(self.map(Some(len)))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<VariantEncoder<MapEncoder>, EncodeError> {
        Ok(self.variant(variant, self.child().map(Some(len))))
    }
}

// --- Containers --------------------------------------------------------------

struct SeqEncoder {
    element: ValueEncoder,
    cap: usize,
    items: Vec<Object>,
}

impl SeqEncoder {
    fn push<T: ?Sized + Serialize>(&mut self, value: &T) {
        if self.items.len() >= self.cap {
            return;
        }
        match value.serialize(self.element) {
            Ok(item) => self.items.push(item),
            Err(err) => tracing::trace!(%err, depth = self.element.depth, "dropped unsupported array element"),
        }
    }

    fn finish(self) -> Object {
        Object::Array(self.items)
    }
}

impl ser::SerializeSeq for SeqEncoder {
    type Ok = Object;
    type Error = EncodeError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), EncodeError> {
        self.push(value);
        Ok(())
    }

    fn end(self) -> Result<Object, EncodeError> {
        Ok(self.finish())
    }
}

impl ser::SerializeTuple for SeqEncoder {
    type Ok = Object;
    type Error = EncodeError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), EncodeError> {
        self.push(value);
        Ok(())
    }

    fn end(self) -> Result<Object, EncodeError> {
        Ok(self.finish())
    }
}

impl ser::SerializeTupleStruct for SeqEncoder {
    type Ok = Object;
    type Error = EncodeError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), EncodeError> {
        self.push(value);
        Ok(())
    }

    fn end(self) -> Result<Object, EncodeError> {
        Ok(self.finish())
    }
}

struct MapEncoder {
    element: ValueEncoder,
    cap: usize,
    entries: Vec<(Vec<u8>, Object)>,
    /// Key accepted by `serialize_key`, waiting for its value.
    pending: Option<Vec<u8>>,
}

impl MapEncoder {
    fn is_full(&self) -> bool {
        self.entries.len() >= self.cap
    }

    fn insert<T: ?Sized + Serialize>(&mut self, key: &[u8], value: &T) {
        if self.is_full() {
            return;
        }
        let key = truncate(key, self.element.limits.max_string_size).to_vec();
        self.insert_value(key, value);
    }

    fn insert_value<T: ?Sized + Serialize>(&mut self, key: Vec<u8>, value: &T) {
        match value.serialize(self.element) {
            Ok(value) => self.entries.push((key, value)),
            Err(err) => tracing::trace!(
                %err,
                key = %String::from_utf8_lossy(&key),
                depth = self.element.depth,
                "dropped unsupported map value"
            ),
        }
    }

    fn encode_key<K: ?Sized + Serialize>(&self, key: &K) -> Option<Vec<u8>> {
        match key.serialize(KeyEncoder { max_len: self.element.limits.max_string_size }) {
            Ok(key) => Some(key),
            Err(err) => {
                tracing::trace!(%err, "dropped map entry with unsupported key");
                None
            }
        }
    }

    fn finish(self) -> Object {
        Object::Map(self.entries)
    }
}

impl ser::SerializeMap for MapEncoder {
    type Ok = Object;
    type Error = EncodeError;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<(), EncodeError> {
        self.pending = if self.is_full() { None } else { self.encode_key(key) };
        Ok(())
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), EncodeError> {
        if let Some(key) = self.pending.take() {
            self.insert_value(key, value);
        }
        Ok(())
    }

    fn serialize_entry<K: ?Sized + Serialize, V: ?Sized + Serialize>(
        &mut self,
        key: &K,
        value: &V,
    ) -> Result<(), EncodeError> {
        if self.is_full() {
            return Ok(());
        }
        if let Some(key) = self.encode_key(key) {
            self.insert_value(key, value);
        }
        Ok(())
    }

    fn end(self) -> Result<Object, EncodeError> {
        Ok(self.finish())
    }
}

impl ser::SerializeStruct for MapEncoder {
    type Ok = Object;
    type Error = EncodeError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, key: &'static str, value: &T) -> Result<(), EncodeError> {
        self.insert(key.as_bytes(), value);
        Ok(())
    }

    fn end(self) -> Result<Object, EncodeError> {
        Ok(self.finish())
    }
}

/// Collects a variant's payload, then wraps it as `{variant: payload}`.
struct VariantEncoder<S> {
    outer: ValueEncoder,
    name: &'static str,
    inner: S,
}

impl ser::SerializeTupleVariant for VariantEncoder<SeqEncoder> {
    type Ok = Object;
    type Error = EncodeError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), EncodeError> {
        self.inner.push(value);
        Ok(())
    }

    fn end(self) -> Result<Object, EncodeError> {
        Ok(self.outer.wrap(self.name, Ok(self.inner.finish())))
    }
}

impl ser::SerializeStructVariant for VariantEncoder<MapEncoder> {
    type Ok = Object;
    type Error = EncodeError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, key: &'static str, value: &T) -> Result<(), EncodeError> {
        self.inner.insert(key.as_bytes(), value);
        Ok(())
    }

    fn end(self) -> Result<Object, EncodeError> {
        Ok(self.outer.wrap(self.name, Ok(self.inner.finish())))
    }
}

// --- Keys --------------------------------------------------------------------

/// Accepts string-like keys only.
struct KeyEncoder {
    max_len: usize,
}

impl KeyEncoder {
    fn key(self, bytes: &[u8]) -> Result<Vec<u8>, EncodeError> {
        Ok(truncate(bytes, self.max_len).to_vec())
    }
}

impl ser::Serializer for KeyEncoder {
    type Ok = Vec<u8>;
    type Error = EncodeError;

    type SerializeSeq = Impossible<Vec<u8>, EncodeError>;
    type SerializeTuple = Impossible<Vec<u8>, EncodeError>;
    type SerializeTupleStruct = Impossible<Vec<u8>, EncodeError>;
    type SerializeTupleVariant = Impossible<Vec<u8>, EncodeError>;
    type SerializeMap = Impossible<Vec<u8>, EncodeError>;
    type SerializeStruct = Impossible<Vec<u8>, EncodeError>;
    type SerializeStructVariant = Impossible<Vec<u8>, EncodeError>;

    fn serialize_str(self, v: &str) -> Result<Vec<u8>, EncodeError> {
        self.key(v.as_bytes())
    }

    fn serialize_char(self, v: char) -> Result<Vec<u8>, EncodeError> {
        self.key(v.encode_utf8(&mut [0; 4]).as_bytes())
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Vec<u8>, EncodeError> {
        self.key(v)
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<Vec<u8>, EncodeError> {
        value.serialize(self)
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<Vec<u8>, EncodeError> {
        value.serialize(self)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<Vec<u8>, EncodeError> {
        self.key(variant.as_bytes())
    }

    fn serialize_bool(self, _v: bool) -> Result<Vec<u8>, EncodeError> {
        Err(EncodeError::UnsupportedValue)
    }

    fn serialize_i8(self, _v: i8) -> Result<Vec<u8>, EncodeError> {
        Err(EncodeError::UnsupportedValue)
    }

    fn serialize_i16(self, _v: i16) -> Result<Vec<u8>, EncodeError> {
        Err(EncodeError::UnsupportedValue)
    }

    fn serialize_i32(self, _v: i32) -> Result<Vec<u8>, EncodeError> {
        Err(EncodeError::UnsupportedValue)
    }

    fn serialize_i64(self, _v: i64) -> Result<Vec<u8>, EncodeError> {
        Err(EncodeError::UnsupportedValue)
    }

    fn serialize_u8(self, _v: u8) -> Result<Vec<u8>, EncodeError> {
        Err(EncodeError::UnsupportedValue)
    }

    fn serialize_u16(self, _v: u16) -> Result<Vec<u8>, EncodeError> {
        Err(EncodeError::UnsupportedValue)
    }

    fn serialize_u32(self, _v: u32) -> Result<Vec<u8>, EncodeError> {
        Err(EncodeError::UnsupportedValue)
    }

    fn serialize_u64(self, _v: u64) -> Result<Vec<u8>, EncodeError> {
        Err(EncodeError::UnsupportedValue)
    }

    fn serialize_f32(self, _v: f32) -> Result<Vec<u8>, EncodeError> {
        Err(EncodeError::UnsupportedValue)
    }

    fn serialize_f64(self, _v: f64) -> Result<Vec<u8>, EncodeError> {
        Err(EncodeError::UnsupportedValue)
    }

    fn serialize_none(self) -> Result<Vec<u8>, EncodeError> {
        Err(EncodeError::UnsupportedValue)
    }

    fn serialize_unit(self) -> Result<Vec<u8>, EncodeError> {
        Err(EncodeError::UnsupportedValue)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<Vec<u8>, EncodeError> {
        Err(EncodeError::UnsupportedValue)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<Vec<u8>, EncodeError> {
        Err(EncodeError::UnsupportedValue)
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, EncodeError> {
        Err(EncodeError::UnsupportedValue)
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, EncodeError> {
        Err(EncodeError::UnsupportedValue)
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, EncodeError> {
        Err(EncodeError::UnsupportedValue)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, EncodeError> {
        Err(EncodeError::UnsupportedValue)
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, EncodeError> {
        Err(EncodeError::UnsupportedValue)
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self::SerializeStruct, EncodeError> {
        Err(EncodeError::UnsupportedValue)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, EncodeError> {
        Err(EncodeError::UnsupportedValue)
    }
}
