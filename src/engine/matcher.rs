//! Condition matching.
//!
//! A rule matches when every one of its conditions matches. A condition
//! matches when, for any of its targets, some string reachable from the
//! target's address through its key path matches the condition's regex after
//! the rule's transformers have run on it.
//!
//! ```text
//! input["address"] ── key_path ──> node ── walk (depth-first) ──> leaf strings
//!                                                                     │
//!                                     transformers ── min_length ── regex.find
//! ```
//!
//! The walk stops at the first hit; the hit records the full path down to
//! the matching leaf. Repeated keys are all followed, in input order, both
//! for the address itself and along the key path. Integers are matched
//! through their decimal form; nulls never match.

use super::compiled_rules::{Condition, Rule, Transformer};
use super::input::Node;
use std::borrow::Cow;

/// Nesting below a target that the walk still descends into.
const MAX_WALK_DEPTH: usize = 32;

/// Where and how a condition matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Hit {
    pub address: String,
    pub key_path: Vec<String>,
    /// The leaf as found in the input, before transformation.
    pub value: String,
    /// Part of the transformed leaf the regex matched.
    pub highlight: String,
}

/// Match every condition of `rule`, or none.
pub(crate) fn match_rule<'r>(rule: &'r Rule, input: &[(String, Node)]) -> Option<Vec<(&'r Condition, Hit)>> {
    rule.conditions.iter().map(|c| match_condition(c, &rule.transformers, input).map(|hit| (c, hit))).collect()
}

fn match_condition(condition: &Condition, transformers: &[Transformer], input: &[(String, Node)]) -> Option<Hit> {
    condition.inputs.iter().find_map(|target| {
        let mut path = target.key_path.clone();
        let (value, highlight) = input
            .iter()
            .filter(|(address, _)| *address == target.address)
            .flat_map(|(_, root)| resolve(root, &target.key_path))
            .find_map(|node| walk(node, &mut path, 0, &mut |leaf| check(condition, transformers, leaf)))?;
        Some(Hit { address: target.address.clone(), key_path: path, value, highlight })
    })
}

/// Every node `key_path` leads to from `root`. Array elements are addressed by index.
fn resolve<'n>(root: &'n Node, key_path: &'n [String]) -> Vec<&'n Node> {
    key_path.iter().fold(vec![root], |nodes, key| nodes.into_iter().flat_map(|node| node.children(key)).collect())
}

/// Depth-first search for the first matching leaf. On a hit `path` is left
/// pointing at it; otherwise it is restored.
fn walk(
    node: &Node,
    path: &mut Vec<String>,
    depth: usize,
    check: &mut dyn FnMut(&str) -> Option<String>,
) -> Option<(String, String)> {
    match node {
        Node::Scalar(s) => check(s).map(|highlight| (s.clone(), highlight)),
        Node::Array(_) | Node::Map(_) if depth >= MAX_WALK_DEPTH => None,
        Node::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                path.push(i.to_string());
                if let Some(hit) = walk(item, path, depth + 1, check) {
                    return Some(hit);
                }
                path.pop();
            }
            None
        }
        Node::Map(entries) => {
            for (key, item) in entries {
                path.push(key.clone());
                if let Some(hit) = walk(item, path, depth + 1, check) {
                    return Some(hit);
                }
                path.pop();
            }
            None
        }
        Node::Null => None,
    }
}

fn check(condition: &Condition, transformers: &[Transformer], leaf: &str) -> Option<String> {
    let value = transform(leaf, transformers);
    if value.len() < condition.min_length {
        return None;
    }
    condition.regex.find(&value).map(|m| m.as_str().to_string())
}

/// Run `transformers` over `value` in order. Allocates only when something changes.
pub(crate) fn transform<'v>(value: &'v str, transformers: &[Transformer]) -> Cow<'v, str> {
    transformers.iter().fold(Cow::Borrowed(value), |acc, transformer| match transformer {
        Transformer::Lowercase if acc.chars().any(char::is_uppercase) => Cow::Owned(acc.to_lowercase()),
        Transformer::RemoveNulls if acc.contains('\0') => Cow::Owned(acc.replace('\0', "")),
        Transformer::CompressWhiteSpace => {
            // Runs of whitespace become one space.
            let compressed = match crate::regex!(r"\s{2,}|[\t\n\r\x0B\x0C]").replace_all(&acc, " ") {
                Cow::Owned(s) => Some(s),
                Cow::Borrowed(_) => None,
            };
            compressed.map_or(acc, Cow::Owned)
        }
        _ => acc,
    })
}
