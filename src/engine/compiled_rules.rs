//! Rule compilation and indexing.
//!
//! This module holds the *static* side of the engine: everything derived once
//! from a rule-set description and then shared read-only by every context.
//!
//! Evaluation is split into two phases:
//!
//! 1. **Compile/index rules** (this module): validate each rule, compile its
//!    regexes, and index rules by the addresses they read.
//! 2. **Run** (see `engine.rs`): look up which rules the run's addresses
//!    trigger (`trigger.rs`), then match them in declaration order
//!    (`matcher.rs`).
//!
//! ## Partial loading
//!
//! A rule set loads rule by rule. A rule that fails validation is left out
//! and reported in the [`LoadReport`] under its error message; the others
//! stay usable. Only a malformed rule set as a whole (not a map, no `rules`
//! array, unsupported `version`) or one where no rule loads is rejected.
//!
//! Required rule keys are checked in a fixed order (`id`, `name`, `tags`,
//! `tags.type`, `conditions`), so a rule missing several keys is always
//! reported under the first one.
//!
//! ## Invariants
//!
//! - `RuleId` is an index into `CompiledRules::rules`.
//! - `RuleIndex::by_address` lists each rule at most once per address, in
//!   ascending `RuleId` order.
//! - `CompiledRules::addresses` holds every indexed address once, in order of
//!   first appearance.

use crate::abi::{RawObject, RawRulesetInfo, ReturnCode};
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

// --- Rules -------------------------------------------------------------------

/// Rule identifier (index into the rules vector).
pub(crate) type RuleId = usize;

#[derive(Debug)]
pub(crate) struct Rule {
    pub id: String,
    pub name: String,
    /// String-valued tags; `type` is always present.
    pub tags: BTreeMap<String, String>,
    /// All conditions must match for the rule to match.
    pub conditions: Vec<Condition>,
    /// Applied in order to every value before it is matched.
    pub transformers: Vec<Transformer>,
    pub on_match: Vec<String>,
}

#[derive(Debug)]
pub(crate) struct Condition {
    pub operator: Operator,
    pub inputs: Vec<Target>,
    pub regex: Regex,
    /// Values shorter than this (in bytes, after transformation) never match.
    pub min_length: usize,
}

/// Where a condition reads from: an address, then a path of keys into its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Target {
    pub address: String,
    pub key_path: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operator {
    MatchRegex,
}

impl Operator {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "match_regex" => Some(Operator::MatchRegex),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::MatchRegex => "match_regex",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transformer {
    Lowercase,
    RemoveNulls,
    CompressWhiteSpace,
}

impl Transformer {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "lowercase" => Some(Transformer::Lowercase),
            "removeNulls" => Some(Transformer::RemoveNulls),
            "compressWhiteSpace" => Some(Transformer::CompressWhiteSpace),
            _ => None,
        }
    }
}

/// Why a single rule was left out.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum RuleError {
    #[error("invalid rule")]
    NotAMap,
    #[error("missing key '{0}'")]
    MissingKey(&'static str),
    #[error("invalid type for key '{0}'")]
    InvalidType(&'static str),
    #[error("empty conditions")]
    EmptyConditions,
    #[error("empty inputs")]
    EmptyInputs,
    #[error("unknown operator '{0}'")]
    UnknownOperator(String),
    #[error("unknown transformer '{0}'")]
    UnknownTransformer(String),
    #[error("invalid regular expression")]
    InvalidRegex,
    #[error("duplicate rule")]
    DuplicateRule,
}

// --- Index -------------------------------------------------------------------

#[derive(Default, Debug)]
pub(crate) struct RuleIndex {
    pub by_address: HashMap<String, Vec<RuleId>>,
}

impl RuleIndex {
    fn insert(&mut self, address: &str, id: RuleId) {
        let ids = self.by_address.entry(address.to_string()).or_default();
        if ids.last() != Some(&id) {
            ids.push(id);
        }
    }
}

/// Pre-compiled rule set with its address index.
#[derive(Debug, Default)]
pub(crate) struct CompiledRules {
    pub rules: Vec<Rule>,
    pub index: RuleIndex,
    pub addresses: Vec<String>,
}

impl CompiledRules {
    /// Compile a decoded rule-set description.
    pub fn new(ruleset: &Value) -> Result<(Self, LoadReport), ReturnCode> {
        let Value::Object(ruleset) = ruleset else {
            tracing::warn!("rule set is not a map");
            return Err(ReturnCode::ERR_INVALID_OBJECT);
        };

        let version = ruleset.get("version").and_then(Value::as_str).unwrap_or_default();
        if !crate::regex!(r"^2\.\d+$").is_match(version) {
            tracing::warn!(version, "unsupported rule set format version");
            return Err(ReturnCode::ERR_INVALID_ARGUMENT);
        }

        let Some(Value::Array(entries)) = ruleset.get("rules") else {
            tracing::warn!("rule set has no rules array");
            return Err(ReturnCode::ERR_INVALID_ARGUMENT);
        };

        let mut report = LoadReport {
            version: ruleset
                .get("metadata")
                .and_then(|m| m.get("rules_version"))
                .and_then(Value::as_str)
                .map(str::to_string),
            ..LoadReport::default()
        };

        let mut compiled = CompiledRules::default();
        let mut seen = HashSet::new();
        let mut known_addresses = HashSet::new();

        for (position, entry) in entries.iter().enumerate() {
            let rule = parse_rule(entry).and_then(|rule| {
                if seen.insert(rule.id.clone()) { Ok(rule) } else { Err(RuleError::DuplicateRule) }
            });
            let rule = match rule {
                Ok(rule) => rule,
                Err(err) => {
                    let id = rule_label(entry, position);
                    tracing::debug!(rule = %id, %err, "rule failed to load");
                    report.fail(err.to_string(), id);
                    continue;
                }
            };

            let id = compiled.rules.len();
            for target in rule.conditions.iter().flat_map(|c| &c.inputs) {
                compiled.index.insert(&target.address, id);
                if known_addresses.insert(target.address.clone()) {
                    compiled.addresses.push(target.address.clone());
                }
            }
            compiled.rules.push(rule);
            report.loaded = report.loaded.saturating_add(1);
        }

        tracing::debug!(loaded = report.loaded, failed = report.failed, "rule set compiled");
        if compiled.rules.is_empty() {
            return Err(ReturnCode::ERR_INVALID_ARGUMENT);
        }
        Ok((compiled, report))
    }
}

/// How a failed rule is named in the report: its id when it has one,
/// its position otherwise.
fn rule_label(entry: &Value, position: usize) -> String {
    match entry.get("id").and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => format!("#{position}"),
    }
}

fn parse_rule(entry: &Value) -> Result<Rule, RuleError> {
    let rule = entry.as_object().ok_or(RuleError::NotAMap)?;

    let id = required_str(rule, "id")?;
    let name = required_str(rule, "name")?;
    let raw_tags = required(rule, "tags")?.as_object().ok_or(RuleError::InvalidType("tags"))?;
    if raw_tags.get("type").and_then(Value::as_str).is_none() {
        return Err(RuleError::MissingKey("type"));
    }
    let raw_conditions = required(rule, "conditions")?.as_array().ok_or(RuleError::InvalidType("conditions"))?;

    let tags = raw_tags.iter().filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string()))).collect();

    let transformers = match rule.get("transformers") {
        None => Vec::new(),
        Some(list) => strings(list, "transformers")?
            .into_iter()
            .map(|name| Transformer::parse(name).ok_or_else(|| RuleError::UnknownTransformer(name.to_string())))
            .collect::<Result<_, _>>()?,
    };

    let on_match = match rule.get("on_match") {
        None => Vec::new(),
        Some(list) => strings(list, "on_match")?.into_iter().map(str::to_string).collect(),
    };

    if raw_conditions.is_empty() {
        return Err(RuleError::EmptyConditions);
    }
    let conditions = raw_conditions.iter().map(parse_condition).collect::<Result<_, _>>()?;

    Ok(Rule { id: id.to_string(), name: name.to_string(), tags, conditions, transformers, on_match })
}

fn parse_condition(entry: &Value) -> Result<Condition, RuleError> {
    let condition = entry.as_object().ok_or(RuleError::InvalidType("conditions"))?;

    let operator_name = required_str(condition, "operator")?;
    let operator = Operator::parse(operator_name).ok_or_else(|| RuleError::UnknownOperator(operator_name.to_string()))?;

    let parameters = required(condition, "parameters")?.as_object().ok_or(RuleError::InvalidType("parameters"))?;
    let raw_inputs = required(parameters, "inputs")?.as_array().ok_or(RuleError::InvalidType("inputs"))?;
    if raw_inputs.is_empty() {
        return Err(RuleError::EmptyInputs);
    }
    let inputs = raw_inputs.iter().map(parse_target).collect::<Result<_, _>>()?;

    let pattern = required_str(parameters, "regex")?;
    let options = parameters.get("options");
    if options.is_some_and(|o| !o.is_object()) {
        return Err(RuleError::InvalidType("options"));
    }
    let option = |key: &str| options.and_then(|o| o.get(key));
    let case_sensitive = option("case_sensitive").and_then(flag).unwrap_or(false);
    let min_length = option("min_length").and_then(count).unwrap_or(0);

    let regex = RegexBuilder::new(pattern).case_insensitive(!case_sensitive).build().map_err(|err| {
        tracing::debug!(pattern, %err, "regex failed to compile");
        RuleError::InvalidRegex
    })?;

    Ok(Condition { operator, inputs, regex, min_length: usize::try_from(min_length).unwrap_or(usize::MAX) })
}

fn parse_target(entry: &Value) -> Result<Target, RuleError> {
    let input = entry.as_object().ok_or(RuleError::InvalidType("inputs"))?;
    let address = required_str(input, "address")?.to_string();
    let key_path = match input.get("key_path") {
        None => Vec::new(),
        Some(path) => strings(path, "key_path")?.into_iter().map(str::to_string).collect(),
    };
    Ok(Target { address, key_path })
}

fn required<'v>(map: &'v Map<String, Value>, key: &'static str) -> Result<&'v Value, RuleError> {
    map.get(key).ok_or(RuleError::MissingKey(key))
}

fn required_str<'v>(map: &'v Map<String, Value>, key: &'static str) -> Result<&'v str, RuleError> {
    required(map, key)?.as_str().ok_or(RuleError::InvalidType(key))
}

// Scalars may arrive stringified by the encoder.

fn flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn strings<'v>(value: &'v Value, key: &'static str) -> Result<Vec<&'v str>, RuleError> {
    value
        .as_array()
        .ok_or(RuleError::InvalidType(key))?
        .iter()
        .map(|v| v.as_str().ok_or(RuleError::InvalidType(key)))
        .collect()
}

// --- Load report -------------------------------------------------------------

/// Diagnostics gathered while compiling.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct LoadReport {
    pub loaded: u16,
    pub failed: u16,
    /// Error message to failed rule ids, both in order of first failure.
    pub errors: Vec<(String, Vec<String>)>,
    pub version: Option<String>,
}

impl LoadReport {
    fn fail(&mut self, message: String, rule: String) {
        self.failed = self.failed.saturating_add(1);
        match self.errors.iter_mut().find(|(m, _)| *m == message) {
            Some((_, rules)) => rules.push(rule),
            None => self.errors.push((message, vec![rule])),
        }
    }

    /// Lower the report to the engine's node layout.
    pub fn into_raw(self) -> RawRulesetInfo {
        let errors = self
            .errors
            .into_iter()
            .map(|(message, rules)| {
                let ids = rules.into_iter().map(|id| RawObject::string(id.into_bytes())).collect::<Vec<_>>();
                RawObject::array(ids).with_key(message.into_bytes())
            })
            .collect::<Vec<_>>();
        RawRulesetInfo { loaded: self.loaded, failed: self.failed, errors: RawObject::map(errors), version: self.version }
    }
}
