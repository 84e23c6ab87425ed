//! Rule-set load diagnostics.

use crate::DecodeError;
use crate::abi::RawRulesetInfo;
use crate::decoder::decode_string_lists;
use std::collections::BTreeMap;

/// What the engine reported while loading a rule set.
///
/// A rule set loads partially: rules that fail are listed here and the
/// rest remain usable.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RulesetInfo {
    /// Rules that loaded.
    pub loaded: u16,
    /// Rules that were rejected.
    pub failed: u16,
    /// Error message to the ids of the rules that failed with it.
    pub errors: BTreeMap<String, Vec<String>>,
    /// `metadata.rules_version` of the rule set, when declared.
    pub version: Option<String>,
}

impl RulesetInfo {
    pub(crate) fn from_raw(raw: &RawRulesetInfo) -> Result<Self, DecodeError> {
        Ok(RulesetInfo {
            loaded: raw.loaded,
            failed: raw.failed,
            errors: decode_string_lists(&raw.errors)?,
            version: raw.version.clone(),
        })
    }

    /// Ids of every rule that failed to load, in message order.
    pub fn failed_rules(&self) -> impl Iterator<Item = &str> {
        self.errors.values().flatten().map(String::as_str)
    }
}
