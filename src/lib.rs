//! Bounded value encoding and deadline-bound execution contexts for a
//! pattern-matching WAF engine.
//!
//! The engine sits behind a fixed call surface ([`abi`]). This crate puts
//! everything a caller needs in front of it:
//!
//! - an [`Encoder`] that turns any `Serialize` value into a tree clipped to
//!   depth, string and container [`Limits`];
//! - a [`Handle`] that compiles a rule set and reports [`RulesetInfo`];
//! - a [`Context`] per request that runs inputs under a timeout and returns
//!   the match payload, the actions and [`RunMetrics`];
//! - [`BuiltinEngine`], an in-process engine implementing the call surface.
//!
//! ```no_run
//! use serde_json::json;
//! use std::time::Duration;
//!
//! let rules = json!({
//!     "version": "2.1",
//!     "rules": [{
//!         "id": "ua0-600-12x",
//!         "name": "Arachni",
//!         "tags": {"type": "security_scanner"},
//!         "conditions": [{
//!             "operator": "match_regex",
//!             "parameters": {
//!                 "inputs": [{"address": "server.request.headers.no_cookies", "key_path": ["user-agent"]}],
//!                 "regex": "^Arachni"
//!             }
//!         }],
//!         "on_match": ["block"]
//!     }]
//! });
//!
//! let handle = wafbind::Handle::new(&rules, "", "")?;
//! let ctx = handle.new_context().expect("handle is open");
//! let headers = json!({"user-agent": "Arachni/v1"});
//! let outcome = ctx.run([("server.request.headers.no_cookies", headers)], Duration::from_millis(5))?;
//! assert_eq!(outcome.actions, ["block"]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#[macro_use]
mod macros;

pub mod abi;
mod context;
mod decoder;
mod diagnostics;
mod encoder;
mod engine;
mod error;
mod handle;
mod metrics;
mod object;
mod platform;

#[cfg(test)]
mod tests;

pub use context::{Context, RunOutcome};
pub use decoder::{decode, decode_string_lists, decode_strings};
pub use diagnostics::RulesetInfo;
pub use encoder::{Bytes, Encoder, Limits};
pub use engine::BuiltinEngine;
pub use error::{DecodeError, EncodeError, Error, RunError};
pub use handle::Handle;
pub use metrics::{ContextMetrics, RunMetrics};
pub use object::Object;
pub use platform::{DISABLED_ENV, health, version};
