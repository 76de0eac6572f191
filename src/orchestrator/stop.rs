use crate::{
    detection::{macros::MacroTable, view::ArtifactView, DetectionEngine, ParsedExpression},
    scenario::StopCondition,
};

enum PreparedStop {
    TurnCountGte(usize),
    ResponseContains { needle: String, raw: String },
    ToolCallCountGte(usize),
    Expression(ParsedExpression),
}

/// Early-termination rules, checked in declaration order after every turn.
pub struct StopConditions {
    conditions: Vec<PreparedStop>,
}

impl StopConditions {
    pub fn prepare(engine: &DetectionEngine, macros: &MacroTable, conditions: &[StopCondition]) -> Self {
        let conditions = conditions
            .iter()
            .map(|condition| match condition {
                StopCondition::TurnCountGte(n) => PreparedStop::TurnCountGte(*n),
                StopCondition::AssistantResponseContains(text) => PreparedStop::ResponseContains {
                    needle: text.to_lowercase(),
                    raw: text.clone(),
                },
                StopCondition::ToolCallCountGte(n) => PreparedStop::ToolCallCountGte(*n),
                StopCondition::Expression(text) => {
                    PreparedStop::Expression(engine.parse_with(text, macros))
                }
            })
            .collect();
        Self { conditions }
    }

    /// Describes the first condition that holds, if any.
    pub fn first_triggered(
        &self,
        turn: usize,
        latest_response: &str,
        view: &ArtifactView<'_>,
    ) -> Option<String> {
        let latest = latest_response.to_lowercase();
        self.conditions.iter().find_map(|condition| match condition {
            PreparedStop::TurnCountGte(n) => (turn >= *n).then(|| format!("turn_count_gte({n})")),
            PreparedStop::ResponseContains { needle, raw } => latest
                .contains(needle.as_str())
                .then(|| format!("assistant_response_contains({raw:?})")),
            PreparedStop::ToolCallCountGte(n) => (view.tool_calls().count() >= *n)
                .then(|| format!("tool_call_count_gte({n})")),
            PreparedStop::Expression(parsed) => {
                let result = parsed.evaluate(view);
                (result.applicable && result.matched)
                    .then(|| format!("expression({})", parsed.source))
            }
        })
    }
}
