//! Error types.
//!
//! Two families surface to callers:
//!
//! - construction-time failures ([`Error`]): the platform is unsupported, the
//!   rule-set description cannot be encoded, or the engine rejects it;
//! - run-time failures ([`RunError`]): the closed set of verdicts a run can
//!   end with instead of a match set.
//!
//! Encoding and decoding have their own small enums so that the encoder can
//! tell a droppable nested failure apart from anything else.

use std::fmt::Display;

/// Errors the engine can end a run with.
///
/// The set is closed and carries no payload beyond its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum RunError {
    #[error("internal waf error")]
    Internal,
    #[error("invalid waf object")]
    InvalidObject,
    #[error("invalid waf argument")]
    InvalidArgument,
    #[error("waf timeout")]
    Timeout,
    #[error("out of memory")]
    OutOfMemory,
    #[error("empty rule addresses")]
    EmptyRuleAddresses,
}

/// Failure to turn a native value into an [`Object`](crate::Object).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    /// The value has no bounded representation (`None`, `()`, non-finite floats).
    #[error("unsupported value")]
    UnsupportedValue,
    /// The value's own `Serialize` impl refused to serialize.
    #[error("unsupported value: {0}")]
    Rejected(String),
}

impl serde::ser::Error for EncodeError {
    fn custom<T: Display>(msg: T) -> Self {
        EncodeError::Rejected(msg.to_string())
    }
}

/// Failure to read an engine-side node tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("nil object pointer")]
    NilObjectPtr,
    #[error("invalid map key")]
    InvalidMapKey,
    #[error("unsupported value")]
    UnsupportedValue,
}

/// Construction-time errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The engine cannot run on this platform; the reason is fixed at process start.
    #[error("{0}")]
    Unsupported(&'static str),
    /// The rule-set description could not be encoded.
    #[error("could not encode the rule set: {0}")]
    Encode(#[from] EncodeError),
    /// An engine-produced tree was malformed.
    #[error("could not decode the engine output: {0}")]
    Decode(#[from] DecodeError),
    /// The engine rejected the rule set outright.
    #[error("could not instantiate the waf rule: {0}")]
    Compile(#[source] RunError),
    /// The compiled rule set is unusable as is.
    #[error(transparent)]
    Run(#[from] RunError),
}
