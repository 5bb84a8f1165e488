//! Source → broker symbol name resolution.
//!
//! Resolution order: per-account custom map override first (keys compared
//! case-insensitively), then configured prefix/suffix stripping, then
//! upper-case. The broker id lookup itself happens against the session's
//! symbol catalog; nothing here fabricates ids.

use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct SymbolMapper {
    prefix: String,
    suffix: String,
    custom: HashMap<String, String>,
}

impl SymbolMapper {
    pub fn new(prefix: &str, suffix: &str, custom: &HashMap<String, String>) -> Self {
        Self {
            prefix: prefix.to_uppercase(),
            suffix: suffix.to_uppercase(),
            custom: custom
                .iter()
                .map(|(k, v)| (k.to_uppercase(), v.to_uppercase()))
                .collect(),
        }
    }

    /// Normalize a source symbol to the canonical broker-side name.
    pub fn normalize(&self, source: &str) -> String {
        let raw = source.to_uppercase();

        if let Some(mapped) = self.custom.get(&raw) {
            return mapped.clone();
        }

        let mut name = raw.as_str();
        if !self.prefix.is_empty() {
            name = name.strip_prefix(&self.prefix).unwrap_or(name);
        }
        if !self.suffix.is_empty() {
            name = name.strip_suffix(&self.suffix).unwrap_or(name);
        }
        name.to_string()
    }
}
