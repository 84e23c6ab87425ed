//! Match payloads.
//!
//! Each matched rule becomes one event; a run's events are serialized as a
//! JSON array:
//!
//! ```text
//! [{"rule": {"id", "name", "tags", "on_match"?},
//!   "rule_matches": [{"operator", "operator_value",
//!                     "parameters": [{"address", "key_path", "value", "highlight"}]}]}]
//! ```

use super::compiled_rules::{Condition, Rule};
use super::matcher::Hit;
use super::obfuscator::Obfuscator;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Serialize)]
pub(crate) struct Event<'r> {
    pub rule: RuleSummary<'r>,
    pub rule_matches: Vec<RuleMatch<'r>>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RuleSummary<'r> {
    pub id: &'r str,
    pub name: &'r str,
    pub tags: &'r BTreeMap<String, String>,
    #[serde(skip_serializing_if = "no_actions")]
    pub on_match: &'r [String],
}

#[derive(Debug, Serialize)]
pub(crate) struct RuleMatch<'r> {
    pub operator: &'static str,
    pub operator_value: &'r str,
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Serialize)]
pub(crate) struct Parameter {
    pub address: String,
    pub key_path: Vec<String>,
    pub value: String,
    pub highlight: Vec<String>,
}

fn no_actions(actions: &&[String]) -> bool {
    actions.is_empty()
}

impl<'r> Event<'r> {
    pub fn new(rule: &'r Rule, hits: Vec<(&'r Condition, Hit)>, obfuscator: &Obfuscator) -> Self {
        let rule_matches = hits
            .into_iter()
            .map(|(condition, hit)| {
                let Hit { address, key_path, mut value, highlight } = hit;
                let mut highlight = vec![highlight];
                obfuscator.apply(&key_path, &mut value, &mut highlight);
                RuleMatch {
                    operator: condition.operator.as_str(),
                    operator_value: condition.regex.as_str(),
                    parameters: vec![Parameter { address, key_path, value, highlight }],
                }
            })
            .collect();

        Event {
            rule: RuleSummary { id: &rule.id, name: &rule.name, tags: &rule.tags, on_match: &rule.on_match },
            rule_matches,
        }
    }
}
