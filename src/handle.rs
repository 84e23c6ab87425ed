//! Rule-set handles.
//!
//! A [`Handle`] owns one compiled rule set for as long as it is open. It is
//! built once from a rule-set description and then hands out [`Context`]s,
//! each of which shares the compiled rules.
//!
//! ```text
//! rules: impl Serialize ── Encoder (unlimited) ── Engine::init ──┬── Arc<dyn CompiledRuleset>
//!                                                                ├── RulesetInfo (diagnostics)
//!                                                                └── required addresses
//! ```
//!
//! Closing a handle only drops its own reference: contexts opened before
//! stay usable until they are closed themselves.

use crate::abi::{CompiledRuleset, Engine, ObfuscatorConfig};
use crate::diagnostics::RulesetInfo;
use crate::{BuiltinEngine, Context, Encoder, Error, Limits, RunError, platform};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};

struct Loaded {
    ruleset: Arc<dyn CompiledRuleset>,
    addresses: Vec<String>,
    info: RulesetInfo,
}

/// A compiled rule set.
pub struct Handle {
    loaded: RwLock<Option<Loaded>>,
    limits: Limits,
    obfuscator: ObfuscatorConfig,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("addresses", &self.addresses())
            .field("limits", &self.limits)
            .field("obfuscator", &self.obfuscator)
            .finish_non_exhaustive()
    }
}

impl Handle {
    /// Compile `rules` with the in-process engine and default limits.
    ///
    /// `key_regex` and `value_regex` configure obfuscation of match payloads;
    /// pass an empty string to disable either.
    pub fn new<T: ?Sized + Serialize>(rules: &T, key_regex: &str, value_regex: &str) -> Result<Self, Error> {
        Self::with_engine(&BuiltinEngine, rules, ObfuscatorConfig::new(key_regex, value_regex), Limits::default())
    }

    /// Compile `rules` with `engine`. Contexts opened on the handle encode
    /// their inputs under `limits`.
    pub fn with_engine<T: ?Sized + Serialize>(
        engine: &dyn Engine,
        rules: &T,
        obfuscator: ObfuscatorConfig,
        limits: Limits,
    ) -> Result<Self, Error> {
        platform::ensure_supported()?;

        let description = Encoder::new(Limits::unlimited()).encode(rules)?;
        let compiled = engine.init(&description.to_raw(), &obfuscator).map_err(|code| {
            let err = code.run_error();
            tracing::debug!(engine = engine.version(), %err, "rule set rejected");
            Error::Compile(err)
        })?;
        let info = RulesetInfo::from_raw(&compiled.info)?;
        for (message, rules) in &info.errors {
            tracing::warn!(%message, ?rules, "rules failed to load");
        }

        let addresses = dedup(compiled.ruleset.required_addresses());
        if addresses.is_empty() {
            return Err(Error::Run(RunError::EmptyRuleAddresses));
        }
        tracing::debug!(
            engine = engine.version(),
            loaded = info.loaded,
            failed = info.failed,
            version = info.version.as_deref().unwrap_or("unknown"),
            addresses = addresses.len(),
            "rule set loaded"
        );

        let loaded = Loaded { ruleset: compiled.ruleset, addresses, info };
        Ok(Handle { loaded: RwLock::new(Some(loaded)), limits, obfuscator })
    }

    /// Addresses the rule set reads, each once, in the order the rules declare them.
    pub fn addresses(&self) -> Vec<String> {
        self.read(|loaded| loaded.addresses.clone()).unwrap_or_default()
    }

    pub fn ruleset_info(&self) -> RulesetInfo {
        self.read(|loaded| loaded.info.clone()).unwrap_or_default()
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn obfuscator(&self) -> &ObfuscatorConfig {
        &self.obfuscator
    }

    /// Open an evaluation session, or `None` once the handle is closed.
    pub fn new_context(&self) -> Option<Context> {
        let ruleset = self.read(|loaded| Arc::clone(&loaded.ruleset))?;
        Some(Context::new(ruleset.context_init(), self.limits))
    }

    /// Release the compiled rules. Contexts already opened keep their own reference.
    pub fn close(&self) {
        if self.loaded.write().unwrap_or_else(PoisonError::into_inner).take().is_some() {
            tracing::debug!("handle closed");
        }
    }

    fn read<R>(&self, f: impl FnOnce(&Loaded) -> R) -> Option<R> {
        self.loaded.read().unwrap_or_else(PoisonError::into_inner).as_ref().map(f)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Keep the first occurrence of each address.
fn dedup(addresses: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    addresses.into_iter().filter(|a| seen.insert(a.clone())).collect()
}
