//! Trigger scanning (input pre-classification).
//!
//! Before any rule runs, the run's input is checked against the address
//! index: only rules that read at least one address present in the input can
//! match, so everything else is skipped without being looked at.
//!
//! ## Design notes
//!
//! - The scan only looks at top-level keys. Whether a rule's key path
//!   resolves inside a present address is the matcher's business.
//! - Triggered rules come back in declaration order so evaluation order does
//!   not depend on the order of the input's keys.

use super::compiled_rules::{RuleId, RuleIndex};
use super::input::Node;

/// Rules activated by one run's input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct TriggerInfo {
    /// Triggered rules, ascending and de-duplicated.
    pub rules: Vec<RuleId>,
}

impl TriggerInfo {
    pub fn scan(input: &[(String, Node)], index: &RuleIndex) -> Self {
        let mut rules: Vec<RuleId> =
            input.iter().filter_map(|(address, _)| index.by_address.get(address)).flatten().copied().collect();
        rules.sort_unstable();
        rules.dedup();
        TriggerInfo { rules }
    }
}
