//! In-process rule engine.
//!
//! This module implements the engine call surface of [`crate::abi`] without
//! a native library. It understands enough of the rule-set format for the
//! adapter's contracts to be observable end to end: regex conditions on
//! addresses and key paths, string transformers, `on_match` actions,
//! per-context rule exhaustion, obfuscation, load diagnostics, deadlines
//! and runtime reporting. It is not a general rule engine.
//!
//! ## How the parts work together
//!
//! ```text
//! rule set (RawObject) ── decode ── CompiledRules::new   (compiled_rules.rs)
//!                                        │  rules + address index + LoadReport
//!                                        v
//!                              Arc<Ruleset> (shared by every context)
//!                                        │
//! input (RawObject) ── Node::from_raw ── TriggerInfo::scan (input.rs, trigger.rs)
//!                                        │  triggered rules, declaration order
//!                                        v
//!                         for each rule not yet exhausted:
//!                           - deadline check
//!                           - match_rule                 (matcher.rs)
//!                           - Event::new + obfuscation   (events.rs, obfuscator.rs)
//!                                        │
//!                                        v
//!                          RawRunResult { data: JSON events, actions }
//! ```
//!
//! ## Responsibilities by module
//!
//! - `compiled_rules.rs`: validates rules, compiles regexes, indexes rules by
//!   address and collects load diagnostics.
//! - `input.rs`: the run input as ordered entries; repeated keys are kept.
//! - `trigger.rs`: selects the rules whose addresses are present in a run.
//! - `matcher.rs`: resolves key paths, applies transformers and matches.
//! - `events.rs`: the JSON shape of a match.
//! - `obfuscator.rs`: redacts sensitive values out of matches.
//!
//! ## Run semantics
//!
//! - A rule that matched in a context is exhausted: it is never evaluated
//!   again in that context.
//! - The deadline is checked before each rule. Past it, the run reports a
//!   timeout, its matches are discarded and no rule is exhausted.
//! - Each run only sees its own input; nothing carries over between runs
//!   except exhaustion.

#[path = "engine/compiled_rules.rs"]
mod compiled_rules;
#[path = "engine/events.rs"]
mod events;
#[path = "engine/input.rs"]
mod input;
#[path = "engine/matcher.rs"]
mod matcher;
#[path = "engine/obfuscator.rs"]
mod obfuscator;
#[path = "engine/trigger.rs"]
mod trigger;

use crate::abi::{
    Compiled, CompiledRuleset, Engine, EngineContext, ObfuscatorConfig, RawObject, RawRunResult, ReturnCode,
};
use crate::decoder::decode;
use compiled_rules::{CompiledRules, RuleId};
use events::Event;
use input::Node;
use obfuscator::Obfuscator;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use trigger::TriggerInfo;

/// The in-process engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinEngine;

impl Engine for BuiltinEngine {
    fn version(&self) -> &str {
        concat!("builtin/", env!("CARGO_PKG_VERSION"))
    }

    fn init(&self, ruleset: &RawObject<'_>, obfuscator: &ObfuscatorConfig) -> Result<Compiled, ReturnCode> {
        let obfuscator = Obfuscator::new(obfuscator).map_err(|err| {
            tracing::warn!(%err, "invalid obfuscator pattern");
            ReturnCode::ERR_INVALID_ARGUMENT
        })?;
        let description = decode(ruleset).map_err(|err| {
            tracing::warn!(%err, "malformed rule set object");
            ReturnCode::ERR_INVALID_OBJECT
        })?;
        let (rules, report) = CompiledRules::new(&description)?;
        Ok(Compiled { ruleset: Arc::new(Ruleset { rules, obfuscator }), info: report.into_raw() })
    }
}

struct Ruleset {
    rules: CompiledRules,
    obfuscator: Obfuscator,
}

impl CompiledRuleset for Ruleset {
    fn required_addresses(&self) -> Vec<String> {
        self.rules.addresses.clone()
    }

    fn context_init(self: Arc<Self>) -> Box<dyn EngineContext> {
        Box::new(BuiltinContext { ruleset: self, exhausted: HashSet::new() })
    }
}

struct BuiltinContext {
    ruleset: Arc<Ruleset>,
    exhausted: HashSet<RuleId>,
}

impl EngineContext for BuiltinContext {
    fn run(&mut self, data: &RawObject<'_>, timeout: Duration) -> Result<RawRunResult, ReturnCode> {
        let start = Instant::now();
        // An unrepresentable deadline is no deadline.
        let deadline = start.checked_add(timeout);

        let Node::Map(input) = Node::from_raw(data).map_err(|_| ReturnCode::ERR_INVALID_OBJECT)? else {
            return Err(ReturnCode::ERR_INVALID_OBJECT);
        };

        let Ruleset { rules, obfuscator } = &*self.ruleset;
        let trigger = TriggerInfo::scan(&input, &rules.index);

        let mut matched = Vec::new();
        let mut events = Vec::new();
        for id in trigger.rules {
            if self.exhausted.contains(&id) {
                continue;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::debug!(rule = %rules.rules[id].id, "deadline reached");
                return Ok(RawRunResult { timeout: true, total_runtime_ns: elapsed_ns(start), ..RawRunResult::default() });
            }
            let rule = &rules.rules[id];
            if let Some(hits) = matcher::match_rule(rule, &input) {
                events.push(Event::new(rule, hits, obfuscator));
                matched.push(id);
            }
        }

        if events.is_empty() {
            return Ok(RawRunResult { total_runtime_ns: elapsed_ns(start), ..RawRunResult::default() });
        }

        let mut actions: Vec<&str> = Vec::new();
        for action in matched.iter().flat_map(|&id| &rules.rules[id].on_match) {
            if !actions.contains(&action.as_str()) {
                actions.push(action);
            }
        }
        let actions = RawObject::array(
            actions.into_iter().map(|a| RawObject::string(a.as_bytes().to_vec())).collect::<Vec<_>>(),
        );

        let data = serde_json::to_vec(&events).map_err(|err| {
            tracing::warn!(%err, "could not serialize match events");
            ReturnCode::ERR_INTERNAL
        })?;
        self.exhausted.extend(matched);

        Ok(RawRunResult { timeout: false, data: Some(data), actions, total_runtime_ns: elapsed_ns(start) })
    }
}

/// Never 0, so a completed run always reports some runtime.
fn elapsed_ns(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX).max(1)
}
