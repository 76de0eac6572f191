use std::collections::BTreeSet;

use crate::{artifact::GateReason, scenario::Scenario};

/// Per-run tool permission state. The deny-set only ever grows; the allow-set
/// only ever shrinks.
#[derive(Debug, Clone)]
pub struct ToolGate {
    allowed: BTreeSet<String>,
    forbidden: BTreeSet<String>,
    budget: Option<usize>,
    seen: usize,
}

impl ToolGate {
    pub fn new(
        allowed: impl IntoIterator<Item = String>,
        forbidden: impl IntoIterator<Item = String>,
        budget: Option<usize>,
    ) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
            forbidden: forbidden.into_iter().collect(),
            budget,
            seen: 0,
        }
    }

    pub fn from_scenario(scenario: &Scenario) -> Self {
        Self::new(
            scenario.allowed_tools.iter().cloned(),
            scenario.forbidden_tools.iter().cloned(),
            scenario.tool_budget,
        )
    }

    /// Classifies the next call. Every call counts against the budget,
    /// including blocked ones and the call being classified.
    pub fn classify(&mut self, name: &str) -> GateReason {
        self.seen += 1;
        if self.forbidden.contains(name) {
            GateReason::Forbidden
        } else if self.budget.is_some_and(|budget| self.seen > budget) {
            GateReason::BudgetExceeded
        } else if self.allowed.contains(name) {
            GateReason::Allowed
        } else {
            GateReason::Unlisted
        }
    }

    /// Adds names to the deny-set and returns the ones that were new.
    pub fn deny<'a>(&mut self, names: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        names
            .into_iter()
            .filter(|name| self.forbidden.insert((*name).clone()))
            .cloned()
            .collect()
    }

    /// Narrows the allow-set to its intersection with `names`.
    pub fn allow_only(&mut self, names: &[String]) {
        self.allowed.retain(|name| names.contains(name));
    }

    pub fn allowed(&self) -> &BTreeSet<String> {
        &self.allowed
    }

    pub fn forbidden(&self) -> &BTreeSet<String> {
        &self.forbidden
    }

    pub fn calls_seen(&self) -> usize {
        self.seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn forbidden_wins_over_allowed() {
        let mut gate = ToolGate::new(names(&["wire"]), names(&["wire"]), None);
        assert_eq!(gate.classify("wire"), GateReason::Forbidden);
    }

    #[test]
    fn classifies_in_order() {
        let mut gate = ToolGate::new(names(&["lookup", "send"]), names(&["delete"]), Some(2));
        assert_eq!(gate.classify("lookup"), GateReason::Allowed);
        assert_eq!(gate.classify("other"), GateReason::Unlisted);
        assert_eq!(gate.classify("send"), GateReason::BudgetExceeded);
        assert_eq!(gate.classify("delete"), GateReason::Forbidden);
        assert_eq!(gate.calls_seen(), 4);
    }

    #[test]
    fn restrictions_only_tighten() {
        let mut gate = ToolGate::new(names(&["a", "b", "c"]), names(&["x"]), None);
        let added = gate.deny(&names(&["b", "x"]));
        assert_eq!(added, names(&["b"]));
        gate.allow_only(&names(&["a", "b", "z"]));
        assert_eq!(gate.allowed().iter().cloned().collect::<Vec<_>>(), names(&["a", "b"]));
        assert_eq!(gate.classify("b"), GateReason::Forbidden);
        assert_eq!(gate.classify("c"), GateReason::Unlisted);
        assert_eq!(gate.classify("z"), GateReason::Unlisted);
    }
}
