//! Redaction of sensitive match payloads.
//!
//! A matched value is replaced by [`REDACTED`] when any key on its path
//! matches the key pattern, or when the value itself matches the value
//! pattern. The highlights go with it. An empty pattern turns its half off.

use crate::abi::ObfuscatorConfig;
use regex::Regex;

pub(crate) const REDACTED: &str = "<Redacted>";

#[derive(Debug, Default)]
pub(crate) struct Obfuscator {
    key: Option<Regex>,
    value: Option<Regex>,
}

impl Obfuscator {
    pub fn new(config: &ObfuscatorConfig) -> Result<Self, regex::Error> {
        let compile = |pattern: &str| if pattern.is_empty() { Ok(None) } else { Regex::new(pattern).map(Some) };
        Ok(Obfuscator { key: compile(&config.key_regex)?, value: compile(&config.value_regex)? })
    }

    pub fn is_sensitive(&self, key_path: &[String], value: &str) -> bool {
        self.key.as_ref().is_some_and(|re| key_path.iter().any(|k| re.is_match(k)))
            || self.value.as_ref().is_some_and(|re| re.is_match(value))
    }

    /// Redact `value` and `highlight` in place when they are sensitive.
    pub fn apply(&self, key_path: &[String], value: &mut String, highlight: &mut Vec<String>) {
        if self.is_sensitive(key_path, value) {
            *value = REDACTED.to_string();
            highlight.iter_mut().for_each(|h| *h = REDACTED.to_string());
        }
    }
}
