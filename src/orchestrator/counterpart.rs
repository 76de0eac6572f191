use std::collections::HashSet;

use regex::{Regex, RegexBuilder};
use tracing::warn;

use crate::scenario::{CounterpartRule, ReplyMatch, SimulatedUserConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterpartReply {
    pub rule_id: Option<String>,
    pub content: String,
}

enum Matcher {
    Contains(String),
    Regex(Regex),
    Never,
}

impl Matcher {
    fn new(rule: &CounterpartRule) -> Self {
        match &rule.matcher {
            ReplyMatch::Contains(needle) => Matcher::Contains(needle.to_lowercase()),
            ReplyMatch::Regex(pattern) => {
                match RegexBuilder::new(pattern).case_insensitive(true).build() {
                    Ok(regex) => Matcher::Regex(regex),
                    Err(err) => {
                        warn!(rule = ?rule.id, error = %err, "counterpart rule regex is invalid");
                        Matcher::Never
                    }
                }
            }
        }
    }

    fn matches(&self, content: &str) -> bool {
        match self {
            Matcher::Contains(needle) => content.to_lowercase().contains(needle),
            Matcher::Regex(regex) => regex.is_match(content),
            Matcher::Never => false,
        }
    }
}

/// Rule-driven stand-in for the user side of the conversation.
pub struct SimulatedCounterpart {
    config: SimulatedUserConfig,
    /// Rule indices by descending priority, declaration order on ties.
    ranked: Vec<(usize, Matcher)>,
    spent: HashSet<usize>,
    used: usize,
}

impl SimulatedCounterpart {
    pub fn new(config: SimulatedUserConfig) -> Self {
        let mut order: Vec<usize> = (0..config.rules.len()).collect();
        order.sort_by_key(|&index| std::cmp::Reverse(config.rules[index].priority));
        let ranked = order
            .into_iter()
            .map(|index| (index, Matcher::new(&config.rules[index])))
            .collect();
        Self {
            config,
            ranked,
            spent: HashSet::new(),
            used: 0,
        }
    }

    pub fn available(&self) -> bool {
        self.used < self.config.max_replies
    }

    pub fn remaining(&self) -> usize {
        self.config.max_replies.saturating_sub(self.used)
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Picks a reply to the latest assistant message, or `None` once the reply
    /// budget is spent.
    pub fn reply(&mut self, assistant_content: &str) -> Option<CounterpartReply> {
        if !self.available() {
            return None;
        }
        self.used += 1;

        for (index, matcher) in &self.ranked {
            let rule = &self.config.rules[*index];
            if rule.once && self.spent.contains(index) {
                continue;
            }
            if matcher.matches(assistant_content) {
                if rule.once {
                    self.spent.insert(*index);
                }
                return Some(CounterpartReply {
                    rule_id: Some(rule.id.clone().unwrap_or_else(|| format!("rule-{index}"))),
                    content: rule.reply.clone(),
                });
            }
        }
        Some(CounterpartReply {
            rule_id: None,
            content: self.config.default_reply.clone(),
        })
    }
}
