//! The fixed call surface between the adapter and a pattern-matching engine.
//!
//! The adapter never looks inside an engine. Everything crosses this module's
//! types:
//!
//! ```text
//! Handle::with_engine ── Engine::init(RawObject, ObfuscatorConfig) ──> Compiled
//!                                                                       │
//! Handle::new_context ── CompiledRuleset::context_init ──> EngineContext
//!                                                                       │
//! Context::run ───────── EngineContext::run(RawObject, timeout) ──> RawRunResult
//!                                                                       │
//! drop(..) ─────────────────────────────────────────────── destroy ─────┘
//! ```
//!
//! ## Node layout
//!
//! [`RawObject`] mirrors the engine's C node struct: every length travels
//! next to (not inside) its backing storage, and the type tag is a raw
//! integer. That is what makes a tree *malformed* possible at all, and why
//! the decoder has to check each pairing.
//!
//! Each backing buffer is a `Cow`, which doubles as the ownership tag:
//!
//! - `Cow::Borrowed`: lent by the other side for the duration of one call;
//!   the holder must never free it.
//! - `Cow::Owned`: materialized by the holder and released by its `Drop`.
//!
//! Encoded input is lent to the engine (strings and keys are borrowed from
//! the [`Object`](crate::Object) tree, only entry arrays are materialized);
//! engine results are handed over owned.

use crate::RunError;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

// --- Node layout -------------------------------------------------------------

bitflags::bitflags! {
    /// Type tags understood by the engine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ObjectKind: u32 {
        const SIGNED   = 1 << 0;
        const UNSIGNED = 1 << 1;
        const STRING   = 1 << 2;
        const ARRAY    = 1 << 3;
        const MAP      = 1 << 4;
        const NULL     = 1 << 7;

        const SCALAR    = Self::SIGNED.bits() | Self::UNSIGNED.bits() | Self::STRING.bits();
        const CONTAINER = Self::ARRAY.bits() | Self::MAP.bits();
    }
}

impl ObjectKind {
    /// Tag of a node nobody initialized.
    pub const INVALID: u32 = 0;

    /// Parse a raw tag. Only tags naming exactly one node type are valid.
    pub fn from_tag(tag: u32) -> Option<Self> {
        let kind = Self::from_bits(tag)?;
        (tag.count_ones() == 1).then_some(kind)
    }
}

/// One node as exchanged with the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawObject<'a> {
    /// Map entry key storage (`None` outside maps).
    pub key: Option<Cow<'a, [u8]>>,
    /// Claimed key length.
    pub key_len: u64,
    /// Raw [`ObjectKind`] bits.
    pub tag: u32,
    /// String storage.
    pub bytes: Option<Cow<'a, [u8]>>,
    /// Scalar union: `u64` as is, `i64` as its two's-complement bits.
    pub scalar: u64,
    /// Container entry storage.
    pub entries: Option<Cow<'a, [RawObject<'a>]>>,
    /// Claimed string length or entry count.
    pub nb_entries: u64,
}

impl Default for RawObject<'_> {
    fn default() -> Self {
        Self::invalid()
    }
}

impl<'a> RawObject<'a> {
    pub const fn invalid() -> Self {
        RawObject { key: None, key_len: 0, tag: ObjectKind::INVALID, bytes: None, scalar: 0, entries: None, nb_entries: 0 }
    }

    pub fn null() -> Self {
        RawObject { tag: ObjectKind::NULL.bits(), ..Self::invalid() }
    }

    pub fn signed(value: i64) -> Self {
        RawObject { tag: ObjectKind::SIGNED.bits(), scalar: value as u64, ..Self::invalid() }
    }

    pub fn unsigned(value: u64) -> Self {
        RawObject { tag: ObjectKind::UNSIGNED.bits(), scalar: value, ..Self::invalid() }
    }

    pub fn string(bytes: impl Into<Cow<'a, [u8]>>) -> Self {
        let bytes = bytes.into();
        RawObject { tag: ObjectKind::STRING.bits(), nb_entries: bytes.len() as u64, bytes: Some(bytes), ..Self::invalid() }
    }

    pub fn array(items: impl Into<Cow<'a, [RawObject<'a>]>>) -> Self {
        Self::container(ObjectKind::ARRAY, items.into())
    }

    /// A map node; every entry is expected to carry a key (see [`RawObject::with_key`]).
    pub fn map(entries: impl Into<Cow<'a, [RawObject<'a>]>>) -> Self {
        Self::container(ObjectKind::MAP, entries.into())
    }

    fn container(kind: ObjectKind, entries: Cow<'a, [RawObject<'a>]>) -> Self {
        RawObject { tag: kind.bits(), nb_entries: entries.len() as u64, entries: Some(entries), ..Self::invalid() }
    }

    /// Attach a map key to this node.
    pub fn with_key(mut self, key: impl Into<Cow<'a, [u8]>>) -> Self {
        let key = key.into();
        self.key_len = key.len() as u64;
        self.key = Some(key);
        self
    }

    pub fn kind(&self) -> Option<ObjectKind> {
        ObjectKind::from_tag(self.tag)
    }

    /// Entries, when this node is a container with storage attached.
    pub fn entries(&self) -> Option<&[RawObject<'a>]> {
        self.entries.as_deref()
    }

    /// Whether none of this node's own buffers are borrowed.
    ///
    /// Only the node's direct storage is inspected; children carry their own tags.
    pub fn is_owned(&self) -> bool {
        let owned = |c: &Option<Cow<'_, [u8]>>| !matches!(c, Some(Cow::Borrowed(_)));
        owned(&self.key) && owned(&self.bytes) && !matches!(self.entries, Some(Cow::Borrowed(_)))
    }

    /// Detach from any lender by materializing every borrowed buffer.
    pub fn into_owned(self) -> RawObject<'static> {
        RawObject {
            key: self.key.map(|k| Cow::Owned(k.into_owned())),
            key_len: self.key_len,
            tag: self.tag,
            bytes: self.bytes.map(|b| Cow::Owned(b.into_owned())),
            scalar: self.scalar,
            entries: self
                .entries
                .map(|e| Cow::Owned(e.into_owned().into_iter().map(RawObject::into_owned).collect())),
            nb_entries: self.nb_entries,
        }
    }
}

// --- Return codes ------------------------------------------------------------

/// Raw status returned by engine calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReturnCode(pub i32);

impl ReturnCode {
    pub const OK: ReturnCode = ReturnCode(0);
    pub const MATCH: ReturnCode = ReturnCode(1);
    pub const ERR_INVALID_ARGUMENT: ReturnCode = ReturnCode(-1);
    pub const ERR_INVALID_OBJECT: ReturnCode = ReturnCode(-2);
    pub const ERR_INTERNAL: ReturnCode = ReturnCode(-3);
    pub const ERR_OUT_OF_MEMORY: ReturnCode = ReturnCode(-4);

    /// Map an error code onto [`RunError`]. Codes outside the known set are
    /// internal errors.
    pub fn run_error(self) -> RunError {
        match self {
            Self::ERR_INVALID_ARGUMENT => RunError::InvalidArgument,
            Self::ERR_INVALID_OBJECT => RunError::InvalidObject,
            Self::ERR_OUT_OF_MEMORY => RunError::OutOfMemory,
            Self::ERR_INTERNAL => RunError::Internal,
            other => {
                tracing::warn!(code = other.0, "unknown engine return code");
                RunError::Internal
            }
        }
    }
}

// --- Call surface ------------------------------------------------------------

/// Obfuscation patterns applied by the engine to match payloads.
///
/// An empty pattern disables that half of the obfuscator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObfuscatorConfig {
    /// Redact a matched value when any key on its path matches this pattern.
    pub key_regex: String,
    /// Redact a matched value when its content matches this pattern.
    pub value_regex: String,
}

impl ObfuscatorConfig {
    pub fn new(key_regex: impl Into<String>, value_regex: impl Into<String>) -> Self {
        ObfuscatorConfig { key_regex: key_regex.into(), value_regex: value_regex.into() }
    }
}

/// Diagnostics filled in by [`Engine::init`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRulesetInfo {
    pub loaded: u16,
    pub failed: u16,
    /// Map of error message to an array of rule ids.
    pub errors: RawObject<'static>,
    pub version: Option<String>,
}

/// A successful init: the shareable compiled rules and their diagnostics.
pub struct Compiled {
    pub ruleset: Arc<dyn CompiledRuleset>,
    pub info: RawRulesetInfo,
}

/// Output of one engine evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRunResult {
    /// The deadline passed before evaluation completed.
    pub timeout: bool,
    /// Match payload, `None` when nothing matched.
    pub data: Option<Vec<u8>>,
    /// Array of action strings.
    pub actions: RawObject<'static>,
    /// Engine-internal evaluation time.
    pub total_runtime_ns: u64,
}

/// Entry point of an engine implementation.
pub trait Engine: Send + Sync {
    fn version(&self) -> &str;

    /// Compile a rule-set description.
    fn init(&self, ruleset: &RawObject<'_>, obfuscator: &ObfuscatorConfig) -> Result<Compiled, ReturnCode>;
}

/// Compiled rules. Shared read-only by every context created from them.
pub trait CompiledRuleset: Send + Sync {
    /// Addresses the rules read from, de-duplicated, in declaration order.
    fn required_addresses(&self) -> Vec<String>;

    /// Open an evaluation session. The session keeps the rules alive.
    fn context_init(self: Arc<Self>) -> Box<dyn EngineContext>;
}

/// One evaluation session. Not reentrant: callers serialize access.
pub trait EngineContext: Send {
    fn run(&mut self, data: &RawObject<'_>, timeout: Duration) -> Result<RawRunResult, ReturnCode>;
}
