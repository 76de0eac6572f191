use std::collections::HashSet;

use tracing::debug;

use crate::{
    detection::{macros::MacroTable, view::ArtifactView, DetectionEngine, ParsedExpression},
    scenario::DynamicEventRule,
};

struct PreparedEvent {
    rule: DynamicEventRule,
    trigger: ParsedExpression,
}

/// Dynamic event rules with pre-parsed triggers, sorted by ascending priority
/// (declaration order breaks ties).
pub struct DynamicEvents {
    events: Vec<PreparedEvent>,
    fired: HashSet<String>,
}

impl DynamicEvents {
    pub fn prepare(engine: &DetectionEngine, macros: &MacroTable, rules: &[DynamicEventRule]) -> Self {
        let mut events: Vec<PreparedEvent> = rules
            .iter()
            .map(|rule| PreparedEvent {
                trigger: engine.parse_with(&rule.trigger, macros),
                rule: rule.clone(),
            })
            .collect();
        events.sort_by_key(|event| event.rule.priority);

        for event in &events {
            let unsupported = event.trigger.unsupported();
            if !unsupported.is_empty() {
                debug!(rule = %event.rule.id, ?unsupported, "dynamic event trigger can never fire");
            }
        }
        Self {
            events,
            fired: HashSet::new(),
        }
    }

    /// Rules whose trigger holds on `view`, in firing order. `once` rules are
    /// marked as spent. The orchestrator passes a view of the latest turn only,
    /// so repeatable rules fire again only on new matching output.
    pub fn due(&mut self, view: &ArtifactView<'_>) -> Vec<DynamicEventRule> {
        let mut due = Vec::new();
        for event in &self.events {
            if event.rule.once && self.fired.contains(&event.rule.id) {
                continue;
            }
            let result = event.trigger.evaluate(view);
            if result.applicable && result.matched {
                self.fired.insert(event.rule.id.clone());
                due.push(event.rule.clone());
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        artifact::{Provenance, TranscriptEntry},
        scenario::EventAction,
        types::MessageRole,
    };

    fn rule(id: &str, trigger: &str, priority: i32, once: bool) -> DynamicEventRule {
        DynamicEventRule {
            id: id.to_string(),
            trigger: trigger.to_string(),
            actions: vec![EventAction::RestrictTools {
                deny: vec!["send".to_string()],
                allow_only: None,
            }],
            priority,
            once,
        }
    }

    #[test]
    fn fires_by_priority_and_respects_once() {
        let engine = DetectionEngine::new();
        let mut events = DynamicEvents::prepare(
            &engine,
            engine.macros(),
            &[
                rule("late", r#"response contains "wire""#, 10, true),
                rule("early", r#"response contains "wire""#, -1, false),
                rule("never", "the model panics", 0, true),
            ],
        );
        let transcript = vec![TranscriptEntry {
            index: 0,
            turn: 1,
            role: MessageRole::Assistant,
            content: "I will wire the funds.".to_string(),
            provenance: Provenance::Model,
            tool_call_id: None,
        }];
        let view = ArtifactView::new(&transcript, &[]);

        let first: Vec<_> = events.due(&view).into_iter().map(|r| r.id).collect();
        assert_eq!(first, vec!["early".to_string(), "late".to_string()]);

        let second: Vec<_> = events.due(&view).into_iter().map(|r| r.id).collect();
        assert_eq!(second, vec!["early".to_string()]);
    }
}
