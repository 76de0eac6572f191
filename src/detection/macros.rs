use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

static RE_MACRO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$([A-Z][A-Z0-9_]*)\b").expect("macro pattern is valid"));

const MAX_EXPANSION_DEPTH: usize = 8;

/// Named expression fragments referenced as `$NAME` inside detection expressions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MacroTable {
    entries: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expansion {
    pub text: String,
    /// `$NAME` references left in place because the table has no entry for them,
    /// or because they are part of a cycle.
    pub unresolved: Vec<String>,
}

impl MacroTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl AsRef<str>, body: impl Into<String>) {
        let name = name.as_ref().trim_start_matches('$').to_string();
        self.entries.insert(name, body.into());
    }

    pub fn with(mut self, name: impl AsRef<str>, body: impl Into<String>) -> Self {
        self.insert(name, body);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries of `other` override entries of `self`.
    pub fn merged(&self, other: &BTreeMap<String, String>) -> Self {
        let mut merged = self.clone();
        for (name, body) in other {
            merged.insert(name, body.clone());
        }
        merged
    }

    pub fn expand(&self, input: &str) -> Expansion {
        let mut text = input.to_string();
        for _ in 0..MAX_EXPANSION_DEPTH {
            let mut replaced = false;
            let next = RE_MACRO
                .replace_all(&text, |caps: &Captures| match self.get(&caps[1]) {
                    Some(body) => {
                        replaced = true;
                        body.to_string()
                    }
                    None => caps[0].to_string(),
                })
                .into_owned();
            text = next;
            if !replaced {
                break;
            }
        }

        let mut unresolved: Vec<String> = Vec::new();
        for caps in RE_MACRO.captures_iter(&text) {
            let name = caps[0].to_string();
            if !unresolved.contains(&name) {
                unresolved.push(name);
            }
        }
        Expansion { text, unresolved }
    }
}

impl From<BTreeMap<String, String>> for MacroTable {
    fn from(entries: BTreeMap<String, String>) -> Self {
        let mut table = Self::new();
        for (name, body) in entries {
            table.insert(name, body);
        }
        table
    }
}
